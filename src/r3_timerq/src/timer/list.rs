//! The active timer list
use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    tick,
    timer::{TimerCb, TimerId},
    utils::{
        intrusive_list::{InsertError, ItemError, ListAccessorCell, ListHead},
        Init,
    },
    PortThreading,
};

/// Get a `ListAccessorCell` used to access a timer list.
macro_rules! timer_list_accessor {
    ($head:expr, $pool:expr, $key:expr) => {
        unsafe {
            ListAccessorCell::new($head, $pool, |cb: &TimerCb<_>| &cb.link, $key)
                // Safety: Links are only modified by `TimerList`'s methods,
                // which keep the list structurally sound.
                .unchecked()
        }
    };
}

/// A list of armed timers sorted by expiration time. Timers with equal
/// expiration times are kept in insertion order.
///
/// The elements are indices into a timer pool. All methods take the pool
/// along with a proof of CPU Lock, and a given list must always be used with
/// the same pool.
pub(crate) struct TimerList<Traits: PortThreading> {
    head: CpuLockCell<Traits, ListHead<usize>>,
}

impl<Traits: PortThreading> Init for TimerList<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { head: Init::INIT };
}

impl<Traits: PortThreading> TimerList<Traits> {
    pub(crate) const fn new() -> Self {
        Self::INIT
    }

    /// Insert `id` at the position determined by its expiration time, after
    /// every element expiring at or before it. If `id` is already in the list,
    /// it's moved.
    pub(crate) fn insert(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        pool: &[TimerCb<Traits>],
        id: usize,
    ) {
        self.remove(lock.borrow_mut(), pool, id);

        let mut accessor = timer_list_accessor!(&self.head, pool, lock);
        let expiration = *pool[id].expiration.read(&**accessor.cell_key());

        // Find the first element expiring strictly later than `id`
        let Ok(mut cursor) = accessor.front();
        while let Some(i) = cursor {
            if *pool[i].expiration.read(&**accessor.cell_key()) > expiration {
                break;
            }
            // Safety: `i` is linked, so it shouldn't return
            //         `ItemError::NotLinked`.
            cursor = unsafe { accessor.next(i).unwrap_unchecked() };
        }

        match accessor.insert(id, cursor) {
            Ok(()) => {}
            // `id` was unlinked above
            Err(InsertError::AlreadyLinked) => unreachable!(),
            Err(InsertError::Inconsistent(x)) => match x {},
        }
    }

    /// Remove `id` from the list. Returns `false` (and does nothing) if it's
    /// not in the list.
    pub(crate) fn remove(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        pool: &[TimerCb<Traits>],
        id: usize,
    ) -> bool {
        let mut accessor = timer_list_accessor!(&self.head, pool, lock);
        match accessor.remove(id) {
            Ok(_) => true,
            Err(ItemError::NotLinked) => false,
            Err(ItemError::Inconsistent(x)) => match x {},
        }
    }

    /// Get the element expiring the earliest. Returns `None` iff the list is
    /// empty.
    pub(crate) fn front(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        pool: &[TimerCb<Traits>],
    ) -> Option<usize> {
        let accessor = timer_list_accessor!(&self.head, pool, lock);
        let Ok(front) = accessor.front();
        front
    }

    /// Iterate over the elements and their expiration times from front to
    /// back.
    pub(crate) fn iter_expirations<'a>(
        &'a self,
        lock: CpuLockTokenRefMut<'a, Traits>,
        pool: &'a [TimerCb<Traits>],
    ) -> Expirations<'a, Traits> {
        let next = self.head.read(&*lock).first;
        Expirations {
            list: self,
            pool,
            lock,
            next,
        }
    }
}

/// The iterator returned by [`TimerList::iter_expirations`].
pub(crate) struct Expirations<'a, Traits: PortThreading> {
    list: &'a TimerList<Traits>,
    pool: &'a [TimerCb<Traits>],
    lock: CpuLockTokenRefMut<'a, Traits>,
    next: Option<usize>,
}

impl<Traits: PortThreading> Iterator for Expirations<'_, Traits> {
    type Item = (TimerId, tick::Instant);

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.next.take()?;
        let accessor = timer_list_accessor!(&self.list.head, self.pool, self.lock.borrow_mut());
        // Safety: `i` is linked, so it shouldn't return `ItemError::NotLinked`.
        self.next = unsafe { accessor.next(i).unwrap_unchecked() };
        Some((TimerId(i), *self.pool[i].expiration.read(&**accessor.cell_key())))
    }
}
