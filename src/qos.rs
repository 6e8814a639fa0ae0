//! Per-client QoS parameters shared by the core and both facades.
//!
//! Every client is described by a {reservation, weight, limit} triple plus a
//! [`ServiceClass`] that decides which priority structures the client lives
//! in. The triple is expressed in operations per second; a rate of zero
//! disables that dimension.

use serde::{Deserialize, Serialize};

/// Service classes ordered from strongest to weakest guarantee.
///
/// `Other` clients are scheduled alongside `Area` clients but are excluded
/// from weight-based surplus sharing: their weight never enters the shared
/// weight pool and they receive no per-window resource budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceClass {
    /// Guaranteed minimum rate, plus a share of the surplus.
    Reservation,
    /// No floor, but may consume its whole windowed budget in a burst.
    Burst,
    /// Best-effort, weight-proportional.
    Area,
    /// Best-effort without surplus sharing.
    Other,
}

impl ServiceClass {
    /// Whether clients of this class contribute to the shared weight pool.
    pub const fn shares_surplus(self) -> bool {
        !matches!(self, ServiceClass::Other)
    }
}

/// Serialized form of [`ClientInfo`]; the stored inverses are derived.
#[derive(Clone, Copy, Serialize, Deserialize)]
struct QosTriple {
    reservation: f64,
    weight: f64,
    limit: f64,
    class: ServiceClass,
}

/// Immutable QoS description of one client.
///
/// The multiplicative inverses are precomputed once at construction since the
/// tag arithmetic uses them on every request; an inverse is 0.0 when the
/// corresponding rate is 0.0 (dimension inactive).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "QosTriple", into = "QosTriple")]
pub struct ClientInfo {
    pub reservation: f64,
    pub weight: f64,
    pub limit: f64,
    pub class: ServiceClass,
    reservation_inv: f64,
    weight_inv: f64,
    limit_inv: f64,
}

impl ClientInfo {
    /// Build an info from rates in ops/sec. Rates must be non-negative.
    pub fn new(reservation: f64, weight: f64, limit: f64, class: ServiceClass) -> Self {
        debug_assert!(reservation >= 0.0 && weight >= 0.0 && limit >= 0.0);
        let inv = |v: f64| if v == 0.0 { 0.0 } else { 1.0 / v };
        ClientInfo {
            reservation,
            weight,
            limit,
            class,
            reservation_inv: inv(reservation),
            weight_inv: inv(weight),
            limit_inv: inv(limit),
        }
    }

    pub(crate) fn reservation_inv(&self) -> f64 {
        self.reservation_inv
    }

    pub(crate) fn weight_inv(&self) -> f64 {
        self.weight_inv
    }

    pub(crate) fn limit_inv(&self) -> f64 {
        self.limit_inv
    }

    /// An all-zero triple is the lookup function's signal that the client's
    /// backing pool no longer exists and the record should be reclaimed.
    pub fn is_retired(&self) -> bool {
        self.reservation == 0.0 && self.weight == 0.0 && self.limit == 0.0
    }
}

impl From<QosTriple> for ClientInfo {
    fn from(t: QosTriple) -> Self {
        ClientInfo::new(t.reservation, t.weight, t.limit, t.class)
    }
}

impl From<ClientInfo> for QosTriple {
    fn from(ci: ClientInfo) -> Self {
        QosTriple {
            reservation: ci.reservation,
            weight: ci.weight,
            limit: ci.limit,
            class: ci.class,
        }
    }
}

/// Distributed dmClock counters carried with each submission.
///
/// `rho` counts reservation-phase responses the client has seen since its
/// previous submission and scales the reservation tag increment; `delta`
/// counts all responses and scales the proportion and limit increments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReqParams {
    pub delta: u32,
    pub rho: u32,
}

impl ReqParams {
    pub fn new(delta: u32, rho: u32) -> Self {
        debug_assert!(rho <= delta, "rho counts a subset of delta");
        ReqParams { delta, rho }
    }
}

/// Which scheduling phase satisfied a dispatched request.
///
/// `Reservation` is reported only for dispatches charged against the
/// client's reservation; every other path reports `Priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Reservation,
    Priority,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverses_follow_rates() {
        let ci = ClientInfo::new(100.0, 2.0, 0.0, ServiceClass::Reservation);
        assert_eq!(ci.reservation_inv(), 0.01);
        assert_eq!(ci.weight_inv(), 0.5);
        assert_eq!(ci.limit_inv(), 0.0);
    }

    #[test]
    fn retired_info_is_all_zero() {
        assert!(ClientInfo::new(0.0, 0.0, 0.0, ServiceClass::Other).is_retired());
        assert!(!ClientInfo::new(0.0, 1.0, 0.0, ServiceClass::Area).is_retired());
    }

    #[test]
    fn only_other_is_excluded_from_surplus() {
        assert!(ServiceClass::Reservation.shares_surplus());
        assert!(ServiceClass::Burst.shares_surplus());
        assert!(ServiceClass::Area.shares_surplus());
        assert!(!ServiceClass::Other.shares_surplus());
    }
}
