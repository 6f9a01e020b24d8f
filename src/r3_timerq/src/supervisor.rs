//! The timer supervisor
use core::fmt;

use crate::{
    error::{CreateTimerError, QueryTimerError},
    klock::lock_cpu,
    tick::{self, TickClock},
    timer::{run_timer, SoftwareTimer, TimerCallback, TimerCb, TimerEntry, TimerId, TimerList},
    PortThreading,
};

/// Owns the tick counter and the list of armed timers, and runs timers as
/// their expiration times arrive.
///
/// A supervisor is usually placed in a `static` item together with its pool:
///
/// ```rust,ignore
/// static TIMER_POOL: [TimerCb<SystemTraits>; 8] = [TimerCb::INIT; 8];
/// static TIMERS: TimerSupervisor<SystemTraits> = TimerSupervisor::new(&TIMER_POOL);
///
/// // In the tick interrupt handler
/// TIMERS.tick_interrupt_handler();
/// ```
pub struct TimerSupervisor<Traits: PortThreading> {
    clock: TickClock,
    pool: &'static [TimerCb<Traits>],
    list: TimerList<Traits>,
}

impl<Traits: PortThreading> TimerSupervisor<Traits> {
    /// Construct a `TimerSupervisor` that allocates timer control blocks
    /// from `pool`.
    ///
    /// `pool` must not be shared with another supervisor.
    pub const fn new(pool: &'static [TimerCb<Traits>]) -> Self {
        Self {
            clock: TickClock::new(),
            pool,
            list: TimerList::new(),
        }
    }

    /// Get the tick counter advanced by [`Self::tick_interrupt_handler`].
    #[inline]
    pub fn clock(&self) -> &TickClock {
        &self.clock
    }

    /// Get the current tick count.
    #[inline]
    pub fn now(&self) -> tick::Instant {
        self.clock.now()
    }

    #[inline]
    pub(crate) fn pool(&self) -> &'static [TimerCb<Traits>] {
        self.pool
    }

    #[inline]
    pub(crate) fn list(&self) -> &TimerList<Traits> {
        &self.list
    }

    /// Create an idle software timer that calls `func` with `param` when it
    /// fires.
    ///
    /// Returns `AllocationFailure` if every control block in the pool is
    /// owned by a timer.
    pub fn create_timer(
        &self,
        func: TimerCallback<Traits>,
        param: usize,
    ) -> Result<SoftwareTimer<'_, Traits>, CreateTimerError> {
        let mut lock = lock_cpu::<Traits>()?;

        let i = self
            .pool
            .iter()
            .position(|cb| cb.entry.read(&*lock).is_none())
            .ok_or(CreateTimerError::AllocationFailure)?;

        let cb = &self.pool[i];
        debug_assert!(cb.link.read(&*lock).is_none());
        cb.entry
            .replace(&mut *lock, Some(TimerEntry::new(func, param)));

        let generation = *cb.generation.read(&*lock);
        log::trace!("timer {i} created (generation {generation})");

        Ok(SoftwareTimer::from_claimed(self, TimerId(i), generation))
    }

    /// Get the expiration time of the timer that will fire first, if any.
    ///
    /// A tickless port can use this to decide when the next tick interrupt
    /// is needed.
    pub fn next_expiration(&self) -> Result<Option<tick::Instant>, QueryTimerError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(self
            .list
            .front(lock.borrow_mut(), self.pool)
            .map(|i| *self.pool[i].expiration.read(&*lock)))
    }

    /// Advance the tick counter and run every timer whose expiration time has
    /// arrived.
    ///
    /// This method must be called exactly once per tick from the tick
    /// interrupt handler. Each due timer is removed from the active list
    /// before its callback is called, and CPU Lock is released while the
    /// callback runs. Timers due at the same tick fire in the order in which
    /// they were armed.
    ///
    /// # Panics
    ///
    /// Panics if CPU Lock is active.
    pub fn tick_interrupt_handler(&self) {
        let Ok(mut lock) = lock_cpu::<Traits>() else {
            panic!("the tick handler was called while CPU Lock is active");
        };

        let now = self.clock.advance();
        log::trace!("tick {now:?}");

        while let Some(i) = self.list.front(lock.borrow_mut(), self.pool) {
            let cb = &self.pool[i];
            if *cb.expiration.read(&*lock) > now {
                break;
            }

            // Detach the timer first so that the callback can re-arm it
            self.list.remove(lock.borrow_mut(), self.pool, i);
            let entry = *cb.entry.read(&*lock);
            let generation = *cb.generation.read(&*lock);

            drop(lock);

            if let Some(entry) = entry {
                run_timer(self, TimerId(i), generation, entry);
            }

            lock = match lock_cpu::<Traits>() {
                Ok(lock) => lock,
                Err(_) => panic!("a timer callback returned with CPU Lock active"),
            };
        }
    }
}

impl<Traits: PortThreading> fmt::Debug for TimerSupervisor<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct Armed<'a, Traits: PortThreading>(&'a TimerSupervisor<Traits>);

        impl<Traits: PortThreading> fmt::Debug for Armed<'_, Traits> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if let Ok(mut lock) = lock_cpu::<Traits>() {
                    f.debug_list()
                        .entries(self.0.list.iter_expirations(lock.borrow_mut(), self.0.pool))
                        .finish()
                } else {
                    f.write_str("< locked >")
                }
            }
        }

        f.debug_struct("TimerSupervisor")
            .field("clock", &self.clock)
            .field("pool_len", &self.pool.len())
            .field("armed", &Armed(self))
            .finish()
    }
}
