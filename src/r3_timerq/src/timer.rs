//! Software timers
use core::{fmt, marker::PhantomData, mem};

use crate::{
    error::{FatalTimerCallbackFault, QueryTimerError, StartTimerError, StopTimerError},
    klock::{lock_cpu, CpuLockCell, CpuLockToken, CpuLockTokenRefMut},
    supervisor::TimerSupervisor,
    tick,
    utils::{intrusive_list::Link, Init},
    PortThreading,
};

mod list;
#[cfg(test)]
mod tests;

pub(crate) use self::list::TimerList;

/// The signature of a timer callback.
///
/// The callback receives the timer that fired and the parameter given to
/// [`TimerSupervisor::create_timer`]. It runs in an interrupt context with
/// CPU Lock inactive, so it may call [`TimerRef::start_after`] or
/// [`TimerRef::stop`] on any timer, including the one that fired.
///
/// Callbacks must not fail. A callback that unwinds is reported to
/// [`PortThreading::timer_callback_fault`], which doesn't return.
pub type TimerCallback<Traits> = fn(TimerRef<'_, Traits>, usize);

/// Identifies a timer control block by its position in a
/// [`TimerSupervisor`]'s pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) usize);

impl TimerId {
    /// Get the position in the pool.
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// *Timer control block* - the state data of a timer.
///
/// This type isn't meant to be used by applications directly. Allocate an
/// array of these (e.g., `[TimerCb::INIT; 8]` in a `static` item) and hand it
/// to [`TimerSupervisor::new`].
pub struct TimerCb<Traits: PortThreading> {
    /// The absolute expiration time. Meaningless while the timer is not
    /// linked to the active list.
    pub(crate) expiration: CpuLockCell<Traits, tick::Instant>,

    /// Links to the neighbors in the active list. `None` iff the timer is
    /// not armed.
    pub(crate) link: CpuLockCell<Traits, Option<Link<usize>>>,

    /// The callback. `None` iff no [`SoftwareTimer`] owns this control block.
    pub(crate) entry: CpuLockCell<Traits, Option<TimerEntry<Traits>>>,

    /// Incremented every time the control block is released. A [`TimerRef`]
    /// only acts on the block while this matches the value it was created
    /// with.
    pub(crate) generation: CpuLockCell<Traits, u32>,
}

impl<Traits: PortThreading> Init for TimerCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        expiration: Init::INIT,
        link: Init::INIT,
        entry: Init::INIT,
        generation: Init::INIT,
    };
}

impl<Traits: PortThreading> TimerCb<Traits> {
    /// Construct a free `TimerCb`.
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: PortThreading> Default for TimerCb<Traits> {
    fn default() -> Self {
        Self::INIT
    }
}

impl<Traits: PortThreading> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("expiration", &self.expiration)
            .field("link", &self.link)
            .field("generation", &self.generation)
            .field(
                "owned",
                &self
                    .entry
                    .debug_fmt_with_ref(|x, f| fmt::Debug::fmt(&x.is_some(), f)),
            )
            .finish()
    }
}

/// The callback bound to an owned timer control block.
pub(crate) struct TimerEntry<Traits: PortThreading> {
    func: TimerCallback<Traits>,
    param: usize,
}

impl<Traits: PortThreading> Clone for TimerEntry<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for TimerEntry<Traits> {}

impl<Traits: PortThreading> fmt::Debug for TimerEntry<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEntry")
            .field("func", &(self.func as *const ()))
            .field("param", &self.param)
            .finish()
    }
}

impl<Traits: PortThreading> TimerEntry<Traits> {
    pub(crate) const fn new(func: TimerCallback<Traits>, param: usize) -> Self {
        Self { func, param }
    }
}

/// A borrowed reference to a timer.
///
/// This is what a [timer callback](TimerCallback) receives. It's also
/// available from an owned timer through [`SoftwareTimer::borrow`].
///
/// A `TimerRef` outliving the [`SoftwareTimer`] it was taken from is *stale*.
/// Operations on a stale reference have no effect, even if the control block
/// has since been claimed by another timer.
pub struct TimerRef<'a, Traits: PortThreading> {
    pub(crate) supervisor: &'a TimerSupervisor<Traits>,
    pub(crate) id: TimerId,
    pub(crate) generation: u32,
}

impl<Traits: PortThreading> Clone for TimerRef<'_, Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for TimerRef<'_, Traits> {}

impl<Traits: PortThreading> fmt::Debug for TimerRef<'_, Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TimerRef").field(&self.id).finish()
    }
}

impl<'a, Traits: PortThreading> TimerRef<'a, Traits> {
    /// Get the timer's identifier.
    #[inline]
    pub fn id(self) -> TimerId {
        self.id
    }

    /// Get the supervisor this timer belongs to.
    #[inline]
    pub fn supervisor(self) -> &'a TimerSupervisor<Traits> {
        self.supervisor
    }

    /// Arm the timer to fire after `duration` has elapsed.
    ///
    /// The current tick is already partially elapsed, so one extra tick is
    /// added: the timer fires during the processing of tick
    /// `now + duration + 1`. It never fires early but may fire up to one tick
    /// late. If the timer is already armed, it's moved to the new expiration
    /// time.
    pub fn start_after(self, duration: tick::Duration) -> Result<(), StartTimerError> {
        let mut lock = lock_cpu::<Traits>()?;
        let at = self
            .supervisor
            .now()
            .saturating_add(duration)
            .saturating_add(tick::Duration::from_ticks(1));
        arm_timer(lock.borrow_mut(), self, at);
        Ok(())
    }

    /// Arm the timer to fire during the processing of tick `at`. If `at` is
    /// not in the future, the timer fires on the next tick, or in the current
    /// one if this method is called from a timer callback.
    ///
    /// If the timer is already armed, it's moved to the new expiration time.
    pub fn start_at(self, at: tick::Instant) -> Result<(), StartTimerError> {
        let mut lock = lock_cpu::<Traits>()?;
        arm_timer(lock.borrow_mut(), self, at);
        Ok(())
    }

    /// Disarm the timer. Does nothing if the timer is not armed.
    pub fn stop(self) -> Result<(), StopTimerError> {
        let mut lock = lock_cpu::<Traits>()?;
        if !self.is_current(&lock) {
            log::trace!("{self:?} is stale; ignoring the stop request");
        } else if self
            .supervisor
            .list()
            .remove(lock.borrow_mut(), self.supervisor.pool(), self.id.0)
        {
            log::trace!("timer {:?} stopped", self.id);
        }
        Ok(())
    }

    /// Get a flag indicating whether the timer is armed.
    pub fn is_running(self) -> Result<bool, QueryTimerError> {
        let lock = lock_cpu::<Traits>()?;
        Ok(self.is_current(&lock) && self.cb().link.read(&*lock).is_some())
    }

    /// Get the expiration time if the timer is armed.
    pub fn expiration(self) -> Result<Option<tick::Instant>, QueryTimerError> {
        let lock = lock_cpu::<Traits>()?;
        let cb = self.cb();
        Ok((self.is_current(&lock) && cb.link.read(&*lock).is_some())
            .then(|| *cb.expiration.read(&*lock)))
    }

    fn cb(self) -> &'a TimerCb<Traits> {
        &self.supervisor.pool()[self.id.0]
    }

    /// Check that the control block is still owned by the timer this
    /// reference was taken from.
    fn is_current(self, lock: &CpuLockToken<Traits>) -> bool {
        let cb = self.cb();
        cb.entry.read(lock).is_some() && *cb.generation.read(lock) == self.generation
    }
}

/// Set the expiration time of a timer and (re-)insert it into the active
/// list.
///
/// A stale reference (whose owner was dropped, e.g., while one of its
/// callbacks was running) is left alone.
fn arm_timer<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timer: TimerRef<'_, Traits>,
    at: tick::Instant,
) {
    let TimerRef { supervisor, id, .. } = timer;
    if !timer.is_current(&*lock) {
        log::trace!("{timer:?} is stale; ignoring the start request");
        return;
    }

    let cb = &supervisor.pool()[id.0];

    cb.expiration.replace(&mut *lock, at);
    supervisor.list().insert(lock, supervisor.pool(), id.0);
    log::trace!("timer {id:?} armed for {at:?}");
}

/// Call the callback of a timer that was just detached from the active list.
///
/// Precondition: CPU Lock inactive, the timer is not linked
pub(crate) fn run_timer<Traits: PortThreading>(
    supervisor: &TimerSupervisor<Traits>,
    id: TimerId,
    generation: u32,
    entry: TimerEntry<Traits>,
) {
    /// Escalates to the port if the callback unwinds.
    struct FaultGuard<Traits: PortThreading> {
        timer: TimerId,
        _phantom: PhantomData<Traits>,
    }

    impl<Traits: PortThreading> Drop for FaultGuard<Traits> {
        fn drop(&mut self) {
            Traits::timer_callback_fault(FatalTimerCallbackFault { timer: self.timer });
        }
    }

    log::trace!("timer {id:?} fired");

    let guard = FaultGuard::<Traits> {
        timer: id,
        _phantom: PhantomData,
    };

    (entry.func)(
        TimerRef {
            supervisor,
            id,
            generation,
        },
        entry.param,
    );

    mem::forget(guard);
}

/// An owned software timer.
///
/// A software timer calls its callback once in the [tick handler] that
/// processes the expiration time set by [`start_after`] or [`start_at`]. It's
/// created by [`TimerSupervisor::create_timer`], which reserves one control
/// block from the supervisor's pool. Dropping the timer disarms it and
/// releases the control block.
///
/// [tick handler]: TimerSupervisor::tick_interrupt_handler
/// [`start_after`]: Self::start_after
/// [`start_at`]: Self::start_at
///
/// # Timer States
///
/// A timer may be in one of the following states:
///
///  - **Idle** - The timer is not linked to the active list.
///
///  - **Armed** - The timer is linked to the active list at the position
///    determined by its expiration time. Timers with equal expiration times
///    are kept in the order in which they were armed.
///
/// <center>
///
#[doc = svgbobdoc::transform!(
/// ```svgbob
///                   start_after, start_at
///         .----------------------------------------.
///         |                                        v
///     .------.                                 .-------.
///     | Idle |                                 | Armed |---.
///     '------'                                 '-------'   | start_after,
///         ^                                        |  ^    | start_at
///         |   stop, expiration (before callback)   |  '----'
///         '----------------------------------------'
/// ```
)]
///
/// </center>
pub struct SoftwareTimer<'a, Traits: PortThreading> {
    supervisor: &'a TimerSupervisor<Traits>,
    id: TimerId,
    generation: u32,
}

impl<'a, Traits: PortThreading> SoftwareTimer<'a, Traits> {
    /// Called by [`TimerSupervisor::create_timer`] after claiming `id`.
    pub(crate) fn from_claimed(
        supervisor: &'a TimerSupervisor<Traits>,
        id: TimerId,
        generation: u32,
    ) -> Self {
        Self {
            supervisor,
            id,
            generation,
        }
    }

    /// Borrow the timer as a [`TimerRef`].
    #[inline]
    pub fn borrow(&self) -> TimerRef<'_, Traits> {
        TimerRef {
            supervisor: self.supervisor,
            id: self.id,
            generation: self.generation,
        }
    }

    /// Get the timer's identifier.
    #[inline]
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// See [`TimerRef::start_after`].
    #[inline]
    pub fn start_after(&self, duration: tick::Duration) -> Result<(), StartTimerError> {
        self.borrow().start_after(duration)
    }

    /// See [`TimerRef::start_at`].
    #[inline]
    pub fn start_at(&self, at: tick::Instant) -> Result<(), StartTimerError> {
        self.borrow().start_at(at)
    }

    /// See [`TimerRef::stop`].
    #[inline]
    pub fn stop(&self) -> Result<(), StopTimerError> {
        self.borrow().stop()
    }

    /// See [`TimerRef::is_running`].
    #[inline]
    pub fn is_running(&self) -> Result<bool, QueryTimerError> {
        self.borrow().is_running()
    }

    /// See [`TimerRef::expiration`].
    #[inline]
    pub fn expiration(&self) -> Result<Option<tick::Instant>, QueryTimerError> {
        self.borrow().expiration()
    }
}

impl<Traits: PortThreading> fmt::Debug for SoftwareTimer<'_, Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SoftwareTimer").field(&self.id).finish()
    }
}

impl<Traits: PortThreading> Drop for SoftwareTimer<'_, Traits> {
    /// Disarm the timer and release its control block.
    ///
    /// # Panics
    ///
    /// Panics if CPU Lock is active.
    fn drop(&mut self) {
        let Ok(mut lock) = lock_cpu::<Traits>() else {
            panic!("a software timer can't be dropped while CPU Lock is active");
        };

        let pool = self.supervisor.pool();
        self.supervisor
            .list()
            .remove(lock.borrow_mut(), pool, self.id.0);
        let cb = &pool[self.id.0];
        cb.entry.replace(&mut *lock, None);
        let generation = cb.generation.read(&*lock).wrapping_add(1);
        cb.generation.replace(&mut *lock, generation);

        log::trace!("timer {:?} released", self.id);
    }
}
