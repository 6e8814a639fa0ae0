//! Monotonic clock shared by the scheduler core.
//!
//! All scheduler arithmetic runs on plain `f64` seconds so tags, window
//! boundaries, and wakeup times can be compared and mixed freely. The clock is
//! anchored to a process-wide `Instant` on first use, which keeps it
//! monotonically non-decreasing regardless of wall-clock adjustments.

use std::sync::OnceLock;
use std::time::Instant;

/// Scheduler time in seconds since the process anchor.
pub type Time = f64;

/// The origin of scheduler time. Also doubles as the "unset" sentinel for
/// wakeup times, which is why [`min_not_zero`] skips it.
pub const TIME_ZERO: Time = 0.0;

/// Upper bound used when searching for the earliest future event.
pub const TIME_MAX: Time = f64::MAX;

static ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Current scheduler time.
pub fn now() -> Time {
    ANCHOR.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Minimum of `current` and `possible`, ignoring a zero `possible`.
pub(crate) fn min_not_zero(current: Time, possible: Time) -> Time {
    if possible == TIME_ZERO {
        current
    } else {
        current.min(possible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn min_not_zero_skips_unset() {
        assert_eq!(min_not_zero(5.0, TIME_ZERO), 5.0);
        assert_eq!(min_not_zero(5.0, 3.0), 3.0);
        assert_eq!(min_not_zero(3.0, 5.0), 3.0);
    }
}
