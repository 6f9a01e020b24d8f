use core::{fmt, marker::PhantomData, mem};

#[cfg(feature = "alloc")]
use alloc::boxed::Box;

use super::RawFifoQueue;
use crate::{
    error::{
        NewDynamicQueueError, NewQueueError, PopError, PopTimeoutError, PushError,
        PushTimeoutError, QueryQueueError, TryPopError, TryPushError,
    },
    tick, PortScheduler,
};

/// A [`FifoQueue`] backed by storage allocated from the global allocator.
#[cfg(feature = "alloc")]
pub type DynamicFifoQueue<Traits, T> = FifoQueue<Traits, T, Box<[u8]>>;

/// A fixed-capacity FIFO queue of `T`.
///
/// This is a thin wrapper of [`RawFifoQueue`] whose element size is
/// `size_of::<T>()`. Elements are copied in and out as plain bytes, hence the
/// [`bytemuck::Pod`] bound. The operations report the same errors as their
/// `RawFifoQueue` counterparts, except that they never return
/// `InvalidArgument` because the element size always matches.
///
/// # Examples
///
/// ```rust,ignore
/// let queue: FifoQueue<SystemTraits, u32, _> = FifoQueue::new([0u8; 16], 4).unwrap();
/// queue.try_push(42).unwrap();
/// assert_eq!(queue.try_pop(), Ok(42));
/// ```
pub struct FifoQueue<Traits: PortScheduler, T, S> {
    raw: RawFifoQueue<Traits, S>,
    _phantom: PhantomData<fn(T) -> T>,
}

impl<Traits: PortScheduler, T: bytemuck::Pod, S: AsRef<[u8]> + AsMut<[u8]>> FifoQueue<Traits, T, S> {
    /// Construct a `FifoQueue` that stores up to `capacity` elements in
    /// `storage`.
    ///
    /// Returns `InvalidArgument` if `T` is zero-sized, `capacity` is zero,
    /// or `storage` is shorter than `size_of::<T>() * capacity` bytes.
    pub fn new(storage: S, capacity: usize) -> Result<Self, NewQueueError> {
        Ok(Self::from_raw(RawFifoQueue::new(
            storage,
            mem::size_of::<T>(),
            capacity,
        )?))
    }

    fn from_raw(raw: RawFifoQueue<Traits, S>) -> Self {
        Self {
            raw,
            _phantom: PhantomData,
        }
    }

    /// Get the underlying untyped queue.
    #[inline]
    pub fn as_raw(&self) -> &RawFifoQueue<Traits, S> {
        &self.raw
    }

    /// See [`RawFifoQueue::capacity`].
    #[inline]
    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    /// See [`RawFifoQueue::len`].
    #[inline]
    pub fn len(&self) -> Result<usize, QueryQueueError> {
        self.raw.len()
    }

    /// See [`RawFifoQueue::is_empty`].
    #[inline]
    pub fn is_empty(&self) -> Result<bool, QueryQueueError> {
        self.raw.is_empty()
    }

    /// See [`RawFifoQueue::is_full`].
    #[inline]
    pub fn is_full(&self) -> Result<bool, QueryQueueError> {
        self.raw.is_full()
    }

    /// See [`RawFifoQueue::num_blocked_pushers`].
    #[inline]
    pub fn num_blocked_pushers(&self) -> Result<usize, QueryQueueError> {
        self.raw.num_blocked_pushers()
    }

    /// See [`RawFifoQueue::num_blocked_poppers`].
    #[inline]
    pub fn num_blocked_poppers(&self) -> Result<usize, QueryQueueError> {
        self.raw.num_blocked_poppers()
    }

    /// See [`RawFifoQueue::try_push`].
    pub fn try_push(&self, x: T) -> Result<(), TryPushError> {
        self.raw.try_push(bytemuck::bytes_of(&x))
    }

    /// See [`RawFifoQueue::push`].
    pub fn push(&self, x: T) -> Result<(), PushError> {
        self.raw.push(bytemuck::bytes_of(&x))
    }

    /// See [`RawFifoQueue::push_timeout`].
    pub fn push_timeout(&self, x: T, timeout: tick::Duration) -> Result<(), PushTimeoutError> {
        self.raw.push_timeout(bytemuck::bytes_of(&x), timeout)
    }

    /// See [`RawFifoQueue::try_pop`].
    pub fn try_pop(&self) -> Result<T, TryPopError> {
        let mut x = T::zeroed();
        self.raw.try_pop(bytemuck::bytes_of_mut(&mut x))?;
        Ok(x)
    }

    /// See [`RawFifoQueue::pop`].
    pub fn pop(&self) -> Result<T, PopError> {
        let mut x = T::zeroed();
        self.raw.pop(bytemuck::bytes_of_mut(&mut x))?;
        Ok(x)
    }

    /// See [`RawFifoQueue::pop_timeout`].
    pub fn pop_timeout(&self, timeout: tick::Duration) -> Result<T, PopTimeoutError> {
        let mut x = T::zeroed();
        self.raw.pop_timeout(bytemuck::bytes_of_mut(&mut x), timeout)?;
        Ok(x)
    }
}

#[cfg(feature = "alloc")]
impl<Traits: PortScheduler, T: bytemuck::Pod> FifoQueue<Traits, T, Box<[u8]>> {
    /// Construct a `FifoQueue` with storage for `capacity` elements allocated
    /// from the global allocator.
    ///
    /// See [`RawFifoQueue::new_dynamic`].
    pub fn new_dynamic(capacity: usize) -> Result<Self, NewDynamicQueueError> {
        Ok(Self::from_raw(RawFifoQueue::new_dynamic(
            mem::size_of::<T>(),
            capacity,
        )?))
    }
}

impl<Traits: PortScheduler, T, S> fmt::Debug for FifoQueue<Traits, T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FifoQueue").field(&self.raw).finish()
    }
}
