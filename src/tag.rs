//! Request tags and the tag arithmetic.
//!
//! A [`RequestTag`] carries one virtual timestamp per QoS dimension. Each
//! dimension advances from the client's previous tag by the dimension's
//! per-operation increment, scaled by the distributed counter (rho for the
//! reservation, delta for proportion and limit), and is floored at the
//! effective submission time so an under-loaded client never banks credit.

use crate::qos::ClientInfo;
use crate::time::{Time, TIME_ZERO};

/// Tag of one queued request.
///
/// An inactive dimension (rate 0) saturates: `+inf` for reservation and
/// proportion, `-inf` for limit (an unlimited client is always inside its
/// limit). Saturated values never constrain ordering and are never copied
/// back into a client's previous tag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestTag {
    pub reservation: f64,
    pub proportion: f64,
    pub limit: f64,
    /// Set once the scheduler clock has crossed the limit tag.
    pub ready: bool,
    pub arrival: Time,
}

impl RequestTag {
    /// Tag of a client that has not submitted anything yet.
    pub(crate) fn initial() -> Self {
        RequestTag {
            reservation: 0.0,
            proportion: 0.0,
            limit: 0.0,
            ready: false,
            arrival: TIME_ZERO,
        }
    }

    /// Placeholder for requests queued behind the head; their real tag is
    /// computed when they reach the front of the queue.
    #[cfg(not(feature = "eager-tag-calc"))]
    pub(crate) fn placeholder(arrival: Time) -> Self {
        RequestTag {
            reservation: 0.0,
            proportion: 0.0,
            limit: 0.0,
            ready: false,
            arrival,
        }
    }

    /// Compute the tag following `prev` for a request submitted at `time`.
    ///
    /// When the gap since the previous arrival is shorter than
    /// `anticipation_timeout` the effective time is pulled back by the
    /// timeout, letting a briefly-idle client keep its pacing.
    pub(crate) fn next(
        prev: &RequestTag,
        info: &ClientInfo,
        delta: u32,
        rho: u32,
        time: Time,
        anticipation_timeout: f64,
    ) -> Self {
        let mut effective = time;
        if time - anticipation_timeout < prev.arrival {
            effective = time - anticipation_timeout;
        }

        let tag = RequestTag {
            reservation: tag_calc(effective, prev.reservation, info.reservation_inv(), rho, true),
            proportion: tag_calc(effective, prev.proportion, info.weight_inv(), delta, true),
            limit: tag_calc(effective, prev.limit, info.limit_inv(), delta, false),
            ready: false,
            arrival: time,
        };
        debug_assert!(
            tag.reservation < f64::INFINITY || tag.proportion < f64::INFINITY,
            "client must have an active reservation or weight dimension"
        );
        tag
    }
}

/// One dimension of the tag arithmetic.
///
/// Returns the saturation value when the dimension is inactive; otherwise the
/// previous tag advanced by `increment` (scaled by the distributed counter
/// when non-zero) and floored at the effective time.
fn tag_calc(time: Time, prev: f64, mut increment: f64, dist: u32, extreme_is_high: bool) -> f64 {
    if increment == 0.0 {
        return if extreme_is_high {
            f64::INFINITY
        } else {
            f64::NEG_INFINITY
        };
    }
    if dist != 0 {
        increment *= f64::from(dist);
    }
    time.max(prev + increment)
}

/// True for values that carry ordering information (neither saturation).
pub(crate) fn is_pinned(value: f64) -> bool {
    value != f64::INFINITY && value != f64::NEG_INFINITY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qos::ServiceClass;

    fn info(r: f64, w: f64, l: f64) -> ClientInfo {
        ClientInfo::new(r, w, l, ServiceClass::Reservation)
    }

    #[test]
    fn advances_by_inverse_rate() {
        let prev = RequestTag::initial();
        let t = RequestTag::next(&prev, &info(10.0, 2.0, 5.0), 1, 1, 0.0, 0.0);
        assert_eq!(t.reservation, 0.1);
        assert_eq!(t.proportion, 0.5);
        assert_eq!(t.limit, 0.2);
        assert!(!t.ready);
    }

    #[test]
    fn floors_at_submission_time() {
        let prev = RequestTag::initial();
        let t = RequestTag::next(&prev, &info(10.0, 2.0, 5.0), 1, 1, 50.0, 0.0);
        assert_eq!(t.reservation, 50.0);
        assert_eq!(t.proportion, 50.0);
        assert_eq!(t.limit, 50.0);
        assert_eq!(t.arrival, 50.0);
    }

    #[test]
    fn distributed_counters_scale_increments() {
        let prev = RequestTag::initial();
        let t = RequestTag::next(&prev, &info(10.0, 1.0, 0.0), 4, 2, 0.0, 0.0);
        // rho scales the reservation, delta the proportion.
        assert_eq!(t.reservation, 0.2);
        assert_eq!(t.proportion, 4.0);
    }

    #[test]
    fn zero_counter_means_single_increment() {
        let prev = RequestTag::initial();
        let t = RequestTag::next(&prev, &info(10.0, 1.0, 0.0), 0, 0, 0.0, 0.0);
        assert_eq!(t.reservation, 0.1);
        assert_eq!(t.proportion, 1.0);
    }

    #[test]
    fn inactive_dimensions_saturate() {
        let prev = RequestTag::initial();
        let t = RequestTag::next(&prev, &info(0.0, 1.0, 0.0), 1, 1, 3.0, 0.0);
        assert_eq!(t.reservation, f64::INFINITY);
        assert_eq!(t.limit, f64::NEG_INFINITY);
        assert!(is_pinned(t.proportion));
        assert!(!is_pinned(t.reservation));
        assert!(!is_pinned(t.limit));
    }

    #[test]
    fn anticipation_pulls_effective_time_back() {
        let mut prev = RequestTag::initial();
        prev.arrival = 10.0;
        prev.reservation = 10.1;
        // Arriving within the anticipation window keeps the previous pacing
        // rather than re-flooring at the new time.
        let t = RequestTag::next(&prev, &info(10.0, 1.0, 0.0), 1, 1, 10.5, 1.0);
        assert_eq!(t.reservation, 10.2);
        assert_eq!(t.arrival, 10.5);

        // Outside the window the floor applies as usual.
        let t = RequestTag::next(&prev, &info(10.0, 1.0, 0.0), 1, 1, 20.0, 1.0);
        assert_eq!(t.reservation, 20.0);
    }

    #[test]
    fn tags_never_regress() {
        let mut prev = RequestTag::initial();
        let ci = info(100.0, 4.0, 50.0);
        let mut time = 0.0;
        for step in 0..64 {
            let t = RequestTag::next(&prev, &ci, 1, 1, time, 0.0);
            assert!(t.reservation >= prev.reservation);
            assert!(t.proportion >= prev.proportion);
            assert!(t.limit >= prev.limit);
            prev = t;
            time += if step % 3 == 0 { 0.0 } else { 0.05 };
        }
    }
}
