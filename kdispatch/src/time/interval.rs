// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ops::{Add, Sub};
use core::time::Duration;

use crate::time::NANOS_PER_SEC;

/// A point on (or a distance along) the monotonic clock.
///
/// Stored as a `(seconds, nanoseconds)` pair in canonical form: the
/// nanosecond part is always in `0..NANOS_PER_SEC` and the sign of the value
/// is carried by the seconds part. Arithmetic saturates at the
/// [`TimeInterval::INFINITY`] and [`TimeInterval::NEG_INFINITY`] sentinels
/// instead of wrapping.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TimeInterval {
    secs: i64,
    nanos: u32,
}

// === impl TimeInterval ===

impl TimeInterval {
    pub const ZERO: TimeInterval = TimeInterval { secs: 0, nanos: 0 };
    pub const INFINITY: TimeInterval = TimeInterval {
        secs: i64::MAX,
        nanos: NANOS_PER_SEC as u32 - 1,
    };
    pub const NEG_INFINITY: TimeInterval = TimeInterval {
        secs: i64::MIN,
        nanos: 0,
    };

    /// Constructs an interval from a seconds part and a nanoseconds part,
    /// normalizing the nanoseconds into canonical form.
    #[must_use]
    pub const fn new(secs: i64, nanos: u32) -> TimeInterval {
        let carry = (nanos as u64 / NANOS_PER_SEC) as i64;
        let nanos = (nanos as u64 % NANOS_PER_SEC) as u32;
        match secs.checked_add(carry) {
            Some(secs) => TimeInterval { secs, nanos },
            None => TimeInterval::INFINITY,
        }
    }

    #[must_use]
    pub const fn from_secs(secs: i64) -> TimeInterval {
        TimeInterval { secs, nanos: 0 }
    }

    #[must_use]
    pub fn from_millis(millis: i64) -> TimeInterval {
        Self::from_nanos_i128(millis as i128 * 1_000_000)
    }

    #[must_use]
    pub fn from_micros(micros: i64) -> TimeInterval {
        Self::from_nanos_i128(micros as i128 * 1_000)
    }

    #[must_use]
    pub fn from_nanos(nanos: i64) -> TimeInterval {
        Self::from_nanos_i128(nanos as i128)
    }

    fn from_nanos_i128(nanos: i128) -> TimeInterval {
        if nanos >= Self::INFINITY.as_nanos() {
            TimeInterval::INFINITY
        } else if nanos <= Self::NEG_INFINITY.as_nanos() {
            TimeInterval::NEG_INFINITY
        } else {
            TimeInterval {
                secs: nanos.div_euclid(NANOS_PER_SEC as i128) as i64,
                nanos: nanos.rem_euclid(NANOS_PER_SEC as i128) as u32,
            }
        }
    }

    #[must_use]
    pub const fn secs(&self) -> i64 {
        self.secs
    }

    #[must_use]
    pub const fn subsec_nanos(&self) -> u32 {
        self.nanos
    }

    /// The total number of nanoseconds, exact for every representable value.
    #[must_use]
    pub const fn as_nanos(&self) -> i128 {
        self.secs as i128 * NANOS_PER_SEC as i128 + self.nanos as i128
    }

    #[must_use]
    pub fn is_infinite(&self) -> bool {
        *self == Self::INFINITY || *self == Self::NEG_INFINITY
    }

    #[must_use]
    pub const fn is_negative(&self) -> bool {
        self.secs < 0
    }

    /// Converts to a host [`Duration`].
    ///
    /// Negative intervals clamp to [`Duration::ZERO`]; [`TimeInterval::INFINITY`]
    /// has no `Duration` equivalent and yields `None`.
    #[must_use]
    pub fn to_duration(self) -> Option<Duration> {
        if self == Self::INFINITY {
            return None;
        }
        if self.is_negative() {
            return Some(Duration::ZERO);
        }
        Some(Duration::new(self.secs as u64, self.nanos))
    }

    #[must_use]
    pub fn saturating_add(self, rhs: TimeInterval) -> TimeInterval {
        Self::from_nanos_i128(self.as_nanos() + rhs.as_nanos())
    }

    #[must_use]
    pub fn saturating_sub(self, rhs: TimeInterval) -> TimeInterval {
        Self::from_nanos_i128(self.as_nanos() - rhs.as_nanos())
    }
}

impl Add for TimeInterval {
    type Output = TimeInterval;

    fn add(self, rhs: TimeInterval) -> TimeInterval {
        self.saturating_add(rhs)
    }
}

impl Sub for TimeInterval {
    type Output = TimeInterval;

    fn sub(self, rhs: TimeInterval) -> TimeInterval {
        self.saturating_sub(rhs)
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}s", self.secs, self.nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form() {
        let t = TimeInterval::new(1, 2_500_000_000);
        assert_eq!(t.secs(), 3);
        assert_eq!(t.subsec_nanos(), 500_000_000);
    }

    #[test]
    fn negative_constructors() {
        let t = TimeInterval::from_millis(-1_500);
        assert_eq!(t.secs(), -2);
        assert_eq!(t.subsec_nanos(), 500_000_000);
        assert!(t.is_negative());
        assert_eq!(t.as_nanos(), -1_500_000_000);
    }

    #[test]
    fn ordering() {
        assert!(TimeInterval::from_millis(-1) < TimeInterval::ZERO);
        assert!(TimeInterval::from_millis(10) < TimeInterval::from_millis(20));
        assert!(TimeInterval::NEG_INFINITY < TimeInterval::from_secs(i64::MIN + 1));
        assert!(TimeInterval::INFINITY > TimeInterval::from_secs(i64::MAX));
    }

    #[test]
    fn saturating_arithmetic() {
        let t = TimeInterval::from_secs(i64::MAX - 1) + TimeInterval::from_secs(10);
        assert_eq!(t, TimeInterval::INFINITY);

        let t = TimeInterval::from_secs(i64::MIN + 1) - TimeInterval::from_secs(10);
        assert_eq!(t, TimeInterval::NEG_INFINITY);

        let t = TimeInterval::from_millis(1_500) + TimeInterval::from_millis(600);
        assert_eq!(t.secs(), 2);
        assert_eq!(t.subsec_nanos(), 100_000_000);
    }

    #[test]
    fn duration_conversion() {
        assert_eq!(TimeInterval::INFINITY.to_duration(), None);
        assert_eq!(
            TimeInterval::from_millis(-5).to_duration(),
            Some(Duration::ZERO)
        );
        assert_eq!(
            TimeInterval::from_millis(1_250).to_duration(),
            Some(Duration::from_millis(1_250))
        );
    }
}
