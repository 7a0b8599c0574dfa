//! Tick-based time types
//!
//! The kernel tracks time exclusively in ticks of its timebase
//! ([`TICK_RATE_HZ`]). [`TickDuration`] is a relative time span and
//! [`TickInstant`] is a point of time measured from boot. The tick counter is
//! 64 bits wide and monotonic, so instants never wrap in practice.
//!
//! [`TICK_RATE_HZ`]: crate::cfg::TICK_RATE_HZ
use core::{fmt, ops};

use crate::cfg;

/// A relative time span, measured in ticks.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TickDuration {
    ticks: u32,
}

impl TickDuration {
    /// An empty interval.
    pub const ZERO: Self = Self { ticks: 0 };

    /// The longest representable interval.
    pub const MAX: Self = Self { ticks: u32::MAX };

    /// Construct a `TickDuration` from a tick count.
    #[inline]
    pub const fn from_ticks(ticks: u32) -> Self {
        Self { ticks }
    }

    /// Construct a `TickDuration` from milliseconds, rounding up to the next
    /// tick boundary.
    #[inline]
    pub const fn from_millis(millis: u32) -> Self {
        let ticks = (millis as u64 * cfg::TICK_RATE_HZ as u64).div_ceil(1_000);
        debug_assert!(ticks <= u32::MAX as u64);
        Self {
            ticks: ticks as u32,
        }
    }

    /// Construct a `TickDuration` from seconds.
    #[inline]
    pub const fn from_secs(secs: u32) -> Self {
        let ticks = secs as u64 * cfg::TICK_RATE_HZ as u64;
        debug_assert!(ticks <= u32::MAX as u64);
        Self {
            ticks: ticks as u32,
        }
    }

    /// Get the tick count.
    #[inline]
    pub const fn as_ticks(self) -> u32 {
        self.ticks
    }
}

impl fmt::Debug for TickDuration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ticks", self.ticks)
    }
}

/// A point of time, measured in ticks from boot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TickInstant {
    ticks: u64,
}

impl TickInstant {
    /// The boot-time origin.
    pub const ZERO: Self = Self { ticks: 0 };

    /// Construct a `TickInstant` from a tick count since boot.
    #[inline]
    pub const fn from_ticks(ticks: u64) -> Self {
        Self { ticks }
    }

    /// Get the tick count since boot.
    #[inline]
    pub const fn as_ticks(self) -> u64 {
        self.ticks
    }

    /// Calculate the interval between two instants, saturating at zero if
    /// `earlier` is actually later.
    #[inline]
    pub const fn saturating_duration_since(self, earlier: Self) -> TickDuration {
        let ticks = self.ticks.saturating_sub(earlier.ticks);
        debug_assert!(ticks <= u32::MAX as u64);
        TickDuration::from_ticks(ticks as u32)
    }
}

impl ops::Add<TickDuration> for TickInstant {
    type Output = Self;

    #[inline]
    fn add(self, rhs: TickDuration) -> Self {
        Self {
            ticks: self.ticks + rhs.as_ticks() as u64,
        }
    }
}

impl fmt::Debug for TickInstant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tick {}", self.ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_up() {
        // 1 kHz timebase: one tick per millisecond
        assert_eq!(TickDuration::from_millis(3).as_ticks(), 3);
        assert_eq!(TickDuration::from_secs(1).as_ticks(), cfg::TICK_RATE_HZ);
    }

    #[test]
    fn instant_arithmetic() {
        let t = TickInstant::from_ticks(100);
        assert_eq!((t + TickDuration::from_ticks(5)).as_ticks(), 105);
        assert_eq!(
            t.saturating_duration_since(TickInstant::from_ticks(30))
                .as_ticks(),
            70
        );
        assert_eq!(
            TickInstant::from_ticks(30).saturating_duration_since(t),
            TickDuration::ZERO
        );
    }
}
