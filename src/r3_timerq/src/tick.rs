//! Tick-based time representation
//!
//! The tick counter is 64 bits wide. At a tick rate of 1 kHz, it would take
//! more than 500 million years to wrap around, so this module treats
//! wrap-around as unreachable and saturates instead.
use core::{fmt, ops, time::Duration as TimeDuration};
use portable_atomic::{AtomicU64, Ordering};

use crate::utils::Init;

/// An absolute point in time, measured in ticks since the [`TickClock`] was
/// created.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(u64);

/// A span of time, measured in ticks.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(u64);

impl Init for Instant {
    const INIT: Self = Self(0);
}

impl Instant {
    /// The instant at which a [`TickClock`] starts.
    pub const ZERO: Self = Self(0);

    /// Construct an `Instant` from an absolute tick count.
    #[inline]
    pub const fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }

    /// Get the absolute tick count.
    #[inline]
    pub const fn as_ticks(self) -> u64 {
        self.0
    }

    /// Add `d`, saturating at the end of the tick range.
    #[inline]
    pub const fn saturating_add(self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.0))
    }

    /// Get the duration elapsed from `earlier` to `self`, or zero if `earlier`
    /// is later than `self`.
    #[inline]
    pub const fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration(self.0.saturating_sub(earlier.0))
    }
}

impl ops::Add<Duration> for Instant {
    type Output = Self;

    /// Saturating addition.
    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        self.saturating_add(rhs)
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

impl Duration {
    /// A zero-length duration.
    pub const ZERO: Self = Self(0);

    /// The longest representable duration.
    pub const MAX: Self = Self(u64::MAX);

    /// Construct a `Duration` from a tick count.
    #[inline]
    pub const fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }

    /// Get the tick count.
    #[inline]
    pub const fn as_ticks(self) -> u64 {
        self.0
    }

    /// Convert `time` to ticks of length `tick_period`, rounding up. The
    /// result is never shorter than `time`. Saturates at [`Self::MAX`].
    ///
    /// # Panics
    ///
    /// Panics if `tick_period` is zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use core::time::Duration as TimeDuration;
    /// use r3_timerq::tick::Duration;
    ///
    /// let period = TimeDuration::from_millis(10);
    /// assert_eq!(Duration::from_time(TimeDuration::ZERO, period).as_ticks(), 0);
    /// assert_eq!(Duration::from_time(TimeDuration::from_millis(10), period).as_ticks(), 1);
    /// assert_eq!(Duration::from_time(TimeDuration::from_millis(11), period).as_ticks(), 2);
    /// ```
    pub fn from_time(time: TimeDuration, tick_period: TimeDuration) -> Self {
        let period = tick_period.as_nanos();
        assert!(period != 0, "tick period must be non-zero");

        let nanos = time.as_nanos();
        let ticks = nanos / period + (nanos % period != 0) as u128;
        Self(u64::try_from(ticks).unwrap_or(u64::MAX))
    }

    /// Convert `self` to `core::time::Duration`, given the length of a tick.
    /// Saturates at `core::time::Duration::MAX`.
    pub fn to_time(self, tick_period: TimeDuration) -> TimeDuration {
        const NANOS_PER_SEC: u128 = 1_000_000_000;
        let nanos = self.0 as u128 * tick_period.as_nanos();
        match u64::try_from(nanos / NANOS_PER_SEC) {
            Ok(secs) => TimeDuration::new(secs, (nanos % NANOS_PER_SEC) as u32),
            Err(_) => TimeDuration::MAX,
        }
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}t", self.0)
    }
}

/// A monotonic tick counter.
///
/// The counter is advanced only by [`TimerSupervisor::tick_interrupt_handler`]
/// and can be read from any context without entering CPU Lock.
///
/// [`TimerSupervisor::tick_interrupt_handler`]: crate::TimerSupervisor::tick_interrupt_handler
pub struct TickClock {
    count: AtomicU64,
}

impl TickClock {
    /// Construct a `TickClock` starting at [`Instant::ZERO`].
    pub const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
        }
    }

    /// Get the current tick count.
    #[inline]
    pub fn now(&self) -> Instant {
        Instant(self.count.load(Ordering::Acquire))
    }

    /// Advance the counter by one tick and return the new tick count.
    pub(crate) fn advance(&self) -> Instant {
        Instant(self.count.fetch_add(1, Ordering::AcqRel).saturating_add(1))
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TickClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TickClock").field(&self.now()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn clock_advance() {
        let clock = TickClock::new();
        assert_eq!(clock.now(), Instant::ZERO);
        assert_eq!(clock.advance(), Instant::from_ticks(1));
        assert_eq!(clock.advance(), Instant::from_ticks(2));
        assert_eq!(clock.now(), Instant::from_ticks(2));
    }

    #[test]
    fn instant_add_saturates() {
        let end = Instant::from_ticks(u64::MAX - 1) + Duration::from_ticks(5);
        assert_eq!(end, Instant::from_ticks(u64::MAX));
        assert_eq!(
            Instant::from_ticks(3).saturating_duration_since(Instant::from_ticks(5)),
            Duration::ZERO
        );
    }

    #[test]
    fn from_time_saturates() {
        let d = Duration::from_time(TimeDuration::MAX, TimeDuration::from_nanos(1));
        assert_eq!(d, Duration::MAX);
    }

    #[test]
    #[should_panic]
    fn from_time_zero_period() {
        Duration::from_time(TimeDuration::from_millis(1), TimeDuration::ZERO);
    }

    /// The converted duration is never shorter than the original one, and
    /// never longer by a whole tick or more.
    #[quickcheck]
    fn from_time_rounds_up(nanos: u64, period_nanos: u32) -> bool {
        let period_nanos = u64::from(period_nanos.max(1));
        let period = TimeDuration::from_nanos(period_nanos);
        let time = TimeDuration::from_nanos(nanos);
        let ticks = Duration::from_time(time, period);

        let covered = ticks.to_time(period);
        covered >= time && covered < time + period
    }
}
