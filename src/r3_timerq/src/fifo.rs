//! Blocking FIFO queues
use core::{fmt, ptr};

#[cfg(feature = "alloc")]
use alloc::{boxed::Box, vec::Vec};

use crate::{
    error::{
        InvalidArgumentError, NewDynamicQueueError, NewQueueError, PopError, PopTimeoutError,
        PushError, PushTimeoutError, QueryQueueError, TryPopError, TryPushError,
    },
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    state::expect_waitable_context,
    tick,
    wait::WaitQueue,
    PortScheduler,
};

mod typed;

pub use self::typed::FifoQueue;
#[cfg(feature = "alloc")]
pub use self::typed::DynamicFifoQueue;

/// A [`RawFifoQueue`] backed by storage allocated from the global allocator.
#[cfg(feature = "alloc")]
pub type DynamicRawFifoQueue<Traits> = RawFifoQueue<Traits, Box<[u8]>>;

/// A fixed-capacity FIFO queue of fixed-size, untyped elements.
///
/// Elements are byte strings of exactly [`element_size`] bytes, stored in a
/// circular buffer of [`capacity`] slots. The buffer lives in `S`, which can
/// be a borrowed slice (`&'static mut [u8]`), an inline array (`[u8; N]`), or
/// (with the `alloc` feature) a boxed slice allocated by [`new_dynamic`].
///
/// [`element_size`]: Self::element_size
/// [`capacity`]: Self::capacity
/// [`new_dynamic`]: Self::new_dynamic
///
/// # Blocking
///
/// [`push`] blocks the calling task while the queue is full, and [`pop`]
/// blocks while it's empty. Blocked tasks are woken in the order in which
/// they blocked. An element is handed over to the woken task before the task
/// resumes, so a task that blocked earlier can never lose its element (or its
/// slot) to a task that came later.
///
/// Blocking operations are only allowed in a task context. The `try_*`
/// variants never block and may also be used in an interrupt context.
///
/// [`push`]: Self::push
/// [`pop`]: Self::pop
///
/// # Destruction
///
/// No task may be blocked on the queue when it's dropped. This is checked by
/// a debug assertion.
pub struct RawFifoQueue<Traits: PortScheduler, S> {
    element_size: usize,
    capacity: usize,
    state: CpuLockCell<Traits, FifoState<S>>,
    /// Tasks blocked in `push`. Non-empty only while the queue is full.
    pushers: WaitQueue<Traits>,
    /// Tasks blocked in `pop`. Non-empty only while the queue is empty.
    poppers: WaitQueue<Traits>,
}

/// The circular buffer bookkeeping.
struct FifoState<S> {
    storage: S,
    /// The slot holding the oldest element
    head: usize,
    /// The slot the next element goes to
    tail: usize,
    count: usize,
}

/// Calculate the storage size for `capacity` elements of `element_size`
/// bytes. Returns `None` on overflow.
fn storage_len(element_size: usize, capacity: usize) -> Result<Option<usize>, InvalidArgumentError> {
    if element_size == 0 || capacity == 0 {
        Err(InvalidArgumentError::InvalidArgument)
    } else {
        Ok(element_size.checked_mul(capacity))
    }
}

impl<Traits: PortScheduler, S: AsRef<[u8]> + AsMut<[u8]>> RawFifoQueue<Traits, S> {
    /// Construct a `RawFifoQueue` that stores up to `capacity` elements of
    /// `element_size` bytes each in `storage`.
    ///
    /// Returns `InvalidArgument` if `element_size` or `capacity` is zero, or
    /// `storage` is shorter than `element_size * capacity` bytes. Any excess
    /// bytes in `storage` are left unused.
    pub fn new(storage: S, element_size: usize, capacity: usize) -> Result<Self, NewQueueError> {
        let len = storage_len(element_size, capacity)?.ok_or(NewQueueError::InvalidArgument)?;
        if storage.as_ref().len() < len {
            return Err(NewQueueError::InvalidArgument);
        }
        Ok(Self::from_parts(storage, element_size, capacity))
    }

    fn from_parts(storage: S, element_size: usize, capacity: usize) -> Self {
        Self {
            element_size,
            capacity,
            state: CpuLockCell::new(FifoState {
                storage,
                head: 0,
                tail: 0,
                count: 0,
            }),
            pushers: WaitQueue::new(),
            poppers: WaitQueue::new(),
        }
    }

    /// Get the size of an element in bytes.
    #[inline]
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Get the maximum number of elements the queue can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of elements in the queue.
    pub fn len(&self) -> Result<usize, QueryQueueError> {
        let lock = lock_cpu::<Traits>()?;
        Ok(self.state.read(&*lock).count)
    }

    /// Get a flag indicating whether the queue holds no element.
    pub fn is_empty(&self) -> Result<bool, QueryQueueError> {
        Ok(self.len()? == 0)
    }

    /// Get a flag indicating whether every slot of the queue is occupied.
    pub fn is_full(&self) -> Result<bool, QueryQueueError> {
        Ok(self.len()? == self.capacity)
    }

    /// Get the number of tasks blocked in [`Self::push`] or
    /// [`Self::push_timeout`].
    pub fn num_blocked_pushers(&self) -> Result<usize, QueryQueueError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(self.pushers.len(lock.borrow_mut()))
    }

    /// Get the number of tasks blocked in [`Self::pop`] or
    /// [`Self::pop_timeout`].
    pub fn num_blocked_poppers(&self) -> Result<usize, QueryQueueError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(self.poppers.len(lock.borrow_mut()))
    }

    /// Append an element to the queue. Returns `QueueFull` if there's no
    /// free slot.
    ///
    /// If a task is blocked in [`Self::pop`], the element is handed over to
    /// the one that blocked first, and the task is woken up.
    pub fn try_push(&self, element: &[u8]) -> Result<(), TryPushError> {
        self.expect_element_len(element.len())?;
        let mut lock = lock_cpu::<Traits>()?;
        if self.push_nonblocking(lock.borrow_mut(), element) {
            Ok(())
        } else {
            Err(TryPushError::QueueFull)
        }
    }

    /// Append an element to the queue, blocking the current task while the
    /// queue is full.
    pub fn push(&self, element: &[u8]) -> Result<(), PushError> {
        self.expect_element_len(element.len())?;
        let mut lock = lock_cpu::<Traits>()?;
        if !self.push_nonblocking(lock.borrow_mut(), element) {
            let task = expect_waitable_context::<Traits>()?;
            self.pushers
                .wait(lock.borrow_mut(), task, element.as_ptr().cast_mut());
        }
        Ok(())
    }

    /// Append an element to the queue, blocking the current task while the
    /// queue is full. Returns `Timeout` if no slot becomes free within
    /// `timeout`, leaving the queue unchanged.
    pub fn push_timeout(
        &self,
        element: &[u8],
        timeout: tick::Duration,
    ) -> Result<(), PushTimeoutError> {
        self.expect_element_len(element.len())?;
        let mut lock = lock_cpu::<Traits>()?;
        if !self.push_nonblocking(lock.borrow_mut(), element) {
            let task = expect_waitable_context::<Traits>()?;
            self.pushers.wait_timeout(
                lock.borrow_mut(),
                task,
                element.as_ptr().cast_mut(),
                timeout,
            )?;
        }
        Ok(())
    }

    /// Remove the oldest element from the queue and copy it to `buf`.
    /// Returns `QueueEmpty` if the queue holds no element.
    ///
    /// If a task is blocked in [`Self::push`], the element of the one that
    /// blocked first is moved into the slot freed by this operation, and the
    /// task is woken up.
    pub fn try_pop(&self, buf: &mut [u8]) -> Result<(), TryPopError> {
        self.expect_element_len(buf.len())?;
        let mut lock = lock_cpu::<Traits>()?;
        if self.pop_nonblocking(lock.borrow_mut(), buf) {
            Ok(())
        } else {
            Err(TryPopError::QueueEmpty)
        }
    }

    /// Remove the oldest element from the queue and copy it to `buf`,
    /// blocking the current task while the queue is empty.
    pub fn pop(&self, buf: &mut [u8]) -> Result<(), PopError> {
        self.expect_element_len(buf.len())?;
        let mut lock = lock_cpu::<Traits>()?;
        if !self.pop_nonblocking(lock.borrow_mut(), buf) {
            let task = expect_waitable_context::<Traits>()?;
            self.poppers
                .wait(lock.borrow_mut(), task, buf.as_mut_ptr());
        }
        Ok(())
    }

    /// Remove the oldest element from the queue and copy it to `buf`,
    /// blocking the current task while the queue is empty. Returns `Timeout`
    /// if no element arrives within `timeout`.
    pub fn pop_timeout(&self, buf: &mut [u8], timeout: tick::Duration) -> Result<(), PopTimeoutError> {
        self.expect_element_len(buf.len())?;
        let mut lock = lock_cpu::<Traits>()?;
        if !self.pop_nonblocking(lock.borrow_mut(), buf) {
            let task = expect_waitable_context::<Traits>()?;
            self.poppers
                .wait_timeout(lock.borrow_mut(), task, buf.as_mut_ptr(), timeout)?;
        }
        Ok(())
    }

    fn expect_element_len(&self, len: usize) -> Result<(), InvalidArgumentError> {
        if len == self.element_size {
            Ok(())
        } else {
            Err(InvalidArgumentError::InvalidArgument)
        }
    }

    /// Push `element` or hand it over to a blocked popper. Returns `false` if
    /// the queue is full.
    fn push_nonblocking(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, element: &[u8]) -> bool {
        let element_size = self.element_size;

        // A popper can be waiting only if the queue is empty
        let handed_over = self.poppers.wake_up_one(lock.borrow_mut(), |_, buf| {
            // Safety: `buf` is the popper's `element_size`-byte buffer, which
            // stays valid until the popper resumes
            unsafe { ptr::copy_nonoverlapping(element.as_ptr(), buf, element_size) };
        });
        if handed_over {
            debug_assert_eq!(self.state.read(&*lock).count, 0);
            return true;
        }

        let state = self.state.write(&mut *lock);
        if state.count == self.capacity {
            return false;
        }
        state.push_back(element, self.capacity);
        true
    }

    /// Pop an element into `buf`, then fill the freed slot with the element
    /// of a blocked pusher. Returns `false` if the queue is empty.
    fn pop_nonblocking(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, buf: &mut [u8]) -> bool {
        {
            let state = self.state.write(&mut *lock);
            if state.count == 0 {
                return false;
            }
            state.pop_front(buf, self.capacity);
        }

        // A pusher can be waiting only if the queue was full
        let (element_size, capacity) = (self.element_size, self.capacity);
        self.pushers.wake_up_one(lock.borrow_mut(), |mut lock, src| {
            // Safety: `src` is the pusher's `element_size`-byte element, which
            // stays valid until the pusher resumes
            let element = unsafe { core::slice::from_raw_parts(src, element_size) };
            let state = self.state.write(&mut *lock);
            debug_assert_eq!(state.count, capacity - 1);
            state.push_back(element, capacity);
        });

        true
    }
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> FifoState<S> {
    /// Precondition: `self.count < capacity`, `element.len()` is the element
    /// size
    fn push_back(&mut self, element: &[u8], capacity: usize) {
        let start = self.tail * element.len();
        self.storage.as_mut()[start..][..element.len()].copy_from_slice(element);
        self.tail = (self.tail + 1) % capacity;
        self.count += 1;
    }

    /// Precondition: `self.count > 0`, `buf.len()` is the element size
    fn pop_front(&mut self, buf: &mut [u8], capacity: usize) {
        let start = self.head * buf.len();
        buf.copy_from_slice(&self.storage.as_ref()[start..][..buf.len()]);
        self.head = (self.head + 1) % capacity;
        self.count -= 1;
    }
}

#[cfg(feature = "alloc")]
impl<Traits: PortScheduler> RawFifoQueue<Traits, Box<[u8]>> {
    /// Construct a `RawFifoQueue` with storage for `capacity` elements of
    /// `element_size` bytes allocated from the global allocator. The storage
    /// is released when the queue is dropped.
    ///
    /// Returns `InvalidArgument` if `element_size` or `capacity` is zero, and
    /// `AllocationFailure` if the storage can't be allocated. Allocation
    /// failure never aborts the program.
    pub fn new_dynamic(element_size: usize, capacity: usize) -> Result<Self, NewDynamicQueueError> {
        let len = storage_len(element_size, capacity)?
            .ok_or(NewDynamicQueueError::AllocationFailure)?;

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(len)
            .map_err(|_| NewDynamicQueueError::AllocationFailure)?;
        storage.resize(len, 0u8);

        Ok(Self::from_parts(
            storage.into_boxed_slice(),
            element_size,
            capacity,
        ))
    }
}

impl<Traits: PortScheduler, S> fmt::Debug for RawFifoQueue<Traits, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFifoQueue")
            .field("element_size", &self.element_size)
            .field("capacity", &self.capacity)
            .field(
                "count",
                &self
                    .state
                    .debug_fmt_with_ref(|state, f| fmt::Debug::fmt(&state.count, f)),
            )
            .field("pushers", &self.pushers)
            .field("poppers", &self.poppers)
            .finish()
    }
}

impl<Traits: PortScheduler, S> Drop for RawFifoQueue<Traits, S> {
    fn drop(&mut self) {
        if !cfg!(debug_assertions) {
            return;
        }
        if let Ok(mut lock) = lock_cpu::<Traits>() {
            debug_assert!(
                self.pushers.is_empty(lock.borrow_mut()) && self.poppers.is_empty(lock.borrow_mut()),
                "a queue was dropped while tasks were blocked on it"
            );
        }
    }
}
