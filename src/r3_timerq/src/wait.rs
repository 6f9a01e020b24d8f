//! Wait queues
use core::{fmt, ops, ptr::NonNull};

use crate::{
    error::TimeoutError,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    tick,
    utils::{
        intrusive_list::{self, ListAccessorCell},
        Init,
    },
    PortScheduler,
};

// Type definitions and trait implementations for wait lists
// ---------------------------------------------------------------------------

/// A reference to a [`Wait`].
struct WaitRef<Traits: PortScheduler>(NonNull<Wait<Traits>>);

// Safety: `Wait` is only accessed under CPU Lock
unsafe impl<Traits: PortScheduler> Send for WaitRef<Traits> {}
unsafe impl<Traits: PortScheduler> Sync for WaitRef<Traits> {}

impl<Traits: PortScheduler> Clone for WaitRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortScheduler> Copy for WaitRef<Traits> {}

impl<Traits: PortScheduler> fmt::Debug for WaitRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WaitRef").field(&self.0).finish()
    }
}

impl<Traits: PortScheduler> PartialEq for WaitRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: PortScheduler> Eq for WaitRef<Traits> {}

use self::unsafe_static::UnsafeStatic;
mod unsafe_static {
    use super::*;

    pub struct UnsafeStatic {
        _nonexhaustive: (),
    }

    impl UnsafeStatic {
        /// Construct an `UnsafeStatic`.
        ///
        /// # Safety
        ///
        /// All pointees to be accessed through the constructed `UnsafeStatic`
        /// must be valid.
        #[inline]
        pub const unsafe fn new() -> &'static Self {
            &Self { _nonexhaustive: () }
        }
    }

    impl<Traits: PortScheduler> ops::Index<WaitRef<Traits>> for UnsafeStatic {
        type Output = Wait<Traits>;

        #[inline]
        fn index(&self, index: WaitRef<Traits>) -> &Self::Output {
            // Safety: See `wait_queue_accessor`.
            unsafe { &*index.0.as_ptr() }
        }
    }
}

/// Get a `ListAccessorCell` used to access a wait queue.
macro_rules! wait_queue_accessor {
    ($list:expr, $key:expr) => {
        unsafe {
            ListAccessorCell::new(
                $list,
                // Safety: All elements are extant because we never drop a
                //     `Wait` when it's still in a wait queue.
                UnsafeStatic::new(),
                |wait: &Wait<_>| &wait.link,
                $key,
            )
            // Safety: This linked list is structurally sound.
            .unchecked()
        }
    };
}

// ---------------------------------------------------------------------------

/// *A wait object* describing *which task* is waiting with *what buffer*.
///
/// # Lifetime
///
/// This object is constructed by `WaitQueue::wait` on a waiting task's stack,
/// and only survives until the method returns. It's unlinked from the wait
/// queue (either by a wake-upper or by the waiting task itself on timeout)
/// before that happens.
struct Wait<Traits: PortScheduler> {
    /// The task that is waiting for something.
    task: Traits::TaskId,

    /// Forms a linked list headed by `wait_queue.waits`.
    link: CpuLockCell<Traits, Option<intrusive_list::Link<WaitRef<Traits>>>>,

    /// The waiting task's element buffer. A blocked pusher's buffer is only
    /// read from.
    buf: *mut u8,

    /// Set by a wake-upper after it has transferred an element through `buf`.
    completed: CpuLockCell<Traits, bool>,
}

/// A FIFO queue of wait objects ([`Wait`]).
pub(crate) struct WaitQueue<Traits: PortScheduler> {
    /// Wait objects waiting on the object associated with this instance of
    /// `WaitQueue`, in the order in which they started waiting.
    ///
    /// All elements of this linked list must be valid.
    waits: CpuLockCell<Traits, intrusive_list::ListHead<WaitRef<Traits>>>,
}

impl<Traits: PortScheduler> Init for WaitQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { waits: Init::INIT };
}

impl<Traits: PortScheduler> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field(
                "waits",
                &self.waits.debug_fmt_with_ref(|head, f| fmt::Debug::fmt(head, f)),
            )
            .finish()
    }
}

impl<Traits: PortScheduler> WaitQueue<Traits> {
    /// Construct an empty `WaitQueue`.
    pub(crate) const fn new() -> Self {
        Self::INIT
    }

    /// Get a flag indicating whether no task is waiting.
    pub(crate) fn is_empty(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.waits.read(&*lock).is_empty()
    }

    /// Get the number of waiting tasks.
    pub(crate) fn len(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
        let accessor = wait_queue_accessor!(&self.waits, lock);
        let Ok(mut cursor) = accessor.front();
        let mut len = 0;
        while let Some(wait_ref) = cursor {
            len += 1;
            // Safety: `wait_ref` is linked, so it shouldn't return
            //     `ItemError::NotLinked`.
            cursor = unsafe { accessor.next(wait_ref).unwrap_unchecked() };
        }
        len
    }

    /// Block the current task `task` until a wake-upper transfers an element
    /// through `buf`.
    ///
    /// The current context must be waitable (This function doesn't check
    /// that). The caller should use `expect_waitable_context` to do that.
    pub(crate) fn wait(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: Traits::TaskId,
        buf: *mut u8,
    ) {
        let wait = Wait {
            task,
            link: CpuLockCell::new(None),
            buf,
            completed: CpuLockCell::new(false),
        };
        pin_utils::pin_mut!(wait);

        let completed = self.wait_inner(lock, wait.as_ref().get_ref(), None);
        debug_assert!(completed);
    }

    /// Like [`Self::wait`], but gives up after `timeout`.
    ///
    /// The element is either transferred completely or not at all: a wait
    /// completed by a wake-upper reports success even if `timeout` has
    /// elapsed by the time the current task resumes.
    pub(crate) fn wait_timeout(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: Traits::TaskId,
        buf: *mut u8,
        timeout: tick::Duration,
    ) -> Result<(), TimeoutError> {
        let wait = Wait {
            task,
            link: CpuLockCell::new(None),
            buf,
            completed: CpuLockCell::new(false),
        };
        pin_utils::pin_mut!(wait);

        if self.wait_inner(lock, wait.as_ref().get_ref(), Some(timeout)) {
            Ok(())
        } else {
            Err(TimeoutError::Timeout)
        }
    }

    /// The core portion of `Self::wait` and `Self::wait_timeout`. Returns
    /// `true` if the wait was completed by a wake-upper.
    fn wait_inner(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        wait: &Wait<Traits>,
        timeout: Option<tick::Duration>,
    ) -> bool {
        let wait_ref = WaitRef(wait.into());

        // Insert `wait_ref` into `self.waits` (FIFO order - at the back)
        {
            let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
            // Safety: `wait_ref` is not linked, so it shouldn't return
            //     `InsertError::AlreadyLinked`.
            unsafe { accessor.push_back(wait_ref).unwrap_unchecked() };
        }

        log::trace!("task {:?} blocked (timeout = {timeout:?})", wait.task);

        loop {
            // Safety: CPU Lock active, and the current context is waitable
            unsafe { Traits::block_current_task(timeout) };

            if *wait.completed.read(&*lock) {
                // `wait_ref` should have been removed by the wake-upper
                debug_assert!(wait.link.read(&*lock).is_none());
                return true;
            }

            if timeout.is_some() {
                break;
            }
            // Spurious wake-up. Keep waiting.
        }

        // Timed out. Nobody removed `wait_ref`, so remove it by ourselves.
        let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
        // Safety: `wait_ref` is linked, so it shouldn't return
        //     `ItemError::NotLinked`.
        unsafe { accessor.remove(wait_ref).unwrap_unchecked() };

        log::trace!("task {:?} timed out", wait.task);

        false
    }

    /// Wake up the task that started waiting the earliest, if any. Returns
    /// `true` if a task was woken up.
    ///
    /// `transfer` is called with the woken task's buffer before the task is
    /// marked as completed. It must move exactly one element into or out of
    /// the buffer.
    pub(crate) fn wake_up_one(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        transfer: impl FnOnce(CpuLockTokenRefMut<'_, Traits>, *mut u8),
    ) -> bool {
        // Get the first wait object
        let wait_ref = {
            let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
            let Ok(wait_ref) = accessor.pop_front();
            wait_ref
        };

        let Some(wait_ref) = wait_ref else {
            return false;
        };

        // Safety: `wait_ref` points to a valid `Wait` because `wait_ref` was
        // in `self.waits` at the beginning of this function call. The waiting
        // task can't return from `wait_inner` before we release CPU Lock.
        let wait = unsafe { wait_ref.0.as_ref() };

        transfer(lock.borrow_mut(), wait.buf);
        wait.completed.replace(&mut *lock, true);

        log::trace!("waking up task {:?}", wait.task);

        // Safety: CPU Lock active
        unsafe { Traits::wake_task(wait.task) };

        true
    }
}
