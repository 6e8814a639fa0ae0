//! Per-client state and the ordering rules of the priority heaps.

use crate::heap::{Criterion, HeapNode, HeapSlot, NOT_IN_HEAP};
use crate::qos::ClientInfo;
use crate::tag::{is_pinned, RequestTag};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// One queued request with its tag.
pub(crate) struct ClientReq<R> {
    pub(crate) tag: RequestTag,
    pub(crate) request: R,
}

/// Windowed dispatch counters of one client.
///
/// Counters are atomics so stats consumers can hold the `Arc` and read them
/// without taking the scheduler lock; the dispatch path already holds the
/// lock when it increments. All eight reset at every window boundary.
#[derive(Debug, Default)]
pub struct ClientStats {
    /// Dispatches charged against the reservation.
    pub reservation: AtomicU32,
    pub reservation_break: AtomicU32,
    /// Reservation-class dispatches served from the surplus share.
    pub surplus: AtomicU32,
    pub surplus_break: AtomicU32,
    pub burst: AtomicU32,
    pub burst_break: AtomicU32,
    pub best_effort: AtomicU32,
    pub best_effort_break: AtomicU32,
}

impl ClientStats {
    pub(crate) fn reset_window(&self) {
        self.reservation.store(0, Ordering::Relaxed);
        self.reservation_break.store(0, Ordering::Relaxed);
        self.surplus.store(0, Ordering::Relaxed);
        self.surplus_break.store(0, Ordering::Relaxed);
        self.burst.store(0, Ordering::Relaxed);
        self.burst_break.store(0, Ordering::Relaxed);
        self.best_effort.store(0, Ordering::Relaxed);
        self.best_effort_break.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WindowCounters {
        WindowCounters {
            reservation: self.reservation.load(Ordering::Relaxed),
            reservation_break: self.reservation_break.load(Ordering::Relaxed),
            surplus: self.surplus.load(Ordering::Relaxed),
            surplus_break: self.surplus_break.load(Ordering::Relaxed),
            burst: self.burst.load(Ordering::Relaxed),
            burst_break: self.burst_break.load(Ordering::Relaxed),
            best_effort: self.best_effort.load(Ordering::Relaxed),
            best_effort_break: self.best_effort_break.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value copy of [`ClientStats`] for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCounters {
    pub reservation: u32,
    pub reservation_break: u32,
    pub surplus: u32,
    pub surplus_break: u32,
    pub burst: u32,
    pub burst_break: u32,
    pub best_effort: u32,
    pub best_effort_break: u32,
}

/// Mutable record of one client.
pub(crate) struct ClientRec<C, R> {
    pub(crate) client: C,
    pub(crate) info: ClientInfo,
    pub(crate) prev_tag: RequestTag,
    pub(crate) requests: VecDeque<ClientReq<R>>,
    /// Offset added to proportion tags when comparing; re-anchored on each
    /// idle-to-active transition so a stale small tag cannot hog capacity.
    pub(crate) prop_delta: f64,
    pub(crate) idle: bool,
    pub(crate) last_tick: u64,
    pub(crate) cur_rho: u32,
    pub(crate) cur_delta: u32,
    /// Per-window resource budget from the weight share.
    pub(crate) resource: f64,
    pub(crate) ordinal: u32,
    /// Additive reservation correction accumulated by under-delivery.
    pub(crate) r_compensation: f64,
    pub(crate) stats: Arc<ClientStats>,
    heap_pos: [usize; HeapSlot::COUNT],
}

impl<C, R> ClientRec<C, R> {
    pub(crate) fn new(client: C, info: ClientInfo, tick: u64, ordinal: u32) -> Self {
        ClientRec {
            client,
            info,
            prev_tag: RequestTag::initial(),
            requests: VecDeque::new(),
            prop_delta: 0.0,
            idle: true,
            last_tick: tick,
            cur_rho: 1,
            cur_delta: 1,
            resource: 0.0,
            ordinal,
            r_compensation: 0.0,
            stats: Arc::new(ClientStats::default()),
            heap_pos: [NOT_IN_HEAP; HeapSlot::COUNT],
        }
    }

    pub(crate) fn has_request(&self) -> bool {
        !self.requests.is_empty()
    }

    pub(crate) fn next_request(&self) -> Option<&ClientReq<R>> {
        self.requests.front()
    }

    pub(crate) fn next_request_mut(&mut self) -> Option<&mut ClientReq<R>> {
        self.requests.front_mut()
    }

    pub(crate) fn add_request(&mut self, tag: RequestTag, request: R) {
        self.requests.push_back(ClientReq { tag, request });
    }

    pub(crate) fn pop_request(&mut self) -> Option<ClientReq<R>> {
        self.requests.pop_front()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Fold `tag` into the previous tag, skipping saturated dimensions so an
    /// inactive dimension never erases real history.
    pub(crate) fn update_req_tag(&mut self, tag: &RequestTag, tick: u64) {
        if is_pinned(tag.reservation) {
            self.prev_tag.reservation = tag.reservation;
        }
        if is_pinned(tag.proportion) {
            self.prev_tag.proportion = tag.proportion;
        }
        if is_pinned(tag.limit) {
            self.prev_tag.limit = tag.limit;
        }
        self.prev_tag.arrival = tag.arrival;
        self.last_tick = tick;
    }

    /// Remove every queued request the predicate accepts, visiting in the
    /// requested order; removed requests are handed to `removed` in visit
    /// order. Returns whether anything was removed. Linear in queue length.
    pub(crate) fn remove_by_filter(
        &mut self,
        visit_backwards: bool,
        accept: &mut dyn FnMut(&R) -> bool,
        removed: &mut dyn FnMut(R),
    ) -> bool {
        let mut any = false;
        if visit_backwards {
            let mut i = self.requests.len();
            while i > 0 {
                i -= 1;
                if accept(&self.requests[i].request) {
                    if let Some(req) = self.requests.remove(i) {
                        removed(req.request);
                        any = true;
                    }
                }
            }
        } else {
            let mut i = 0;
            while i < self.requests.len() {
                if accept(&self.requests[i].request) {
                    if let Some(req) = self.requests.remove(i) {
                        removed(req.request);
                        any = true;
                    }
                } else {
                    i += 1;
                }
            }
        }
        any
    }
}

impl<C, R> HeapNode for ClientRec<C, R> {
    fn heap_pos(&self, slot: HeapSlot) -> usize {
        self.heap_pos[slot.index()]
    }
    fn set_heap_pos(&mut self, slot: HeapSlot, pos: usize) {
        self.heap_pos[slot.index()] = pos;
    }
}

/// Which tag dimension a heap orders on.
#[derive(Clone, Copy)]
enum TagField {
    Reservation,
    Proportion,
    Limit,
}

/// How the ready flag of the head request influences ordering.
#[derive(Clone, Copy)]
enum ReadyOption {
    /// Ready plays no role (reservation heap).
    Ignore,
    /// Ready entries sort first (dispatch-side heaps).
    Raises,
    /// Not-yet-ready entries sort first (limit-side heaps).
    Lowers,
}

/// The shared precedes-rule: clients with a queued request come first, then
/// the ready flag per `ready_opt`, then the chosen tag field (optionally
/// shifted by `prop_delta`). Equivalent records compare false so heap order
/// stays stable.
fn compare_heads<C, R>(
    a: &ClientRec<C, R>,
    b: &ClientRec<C, R>,
    field: TagField,
    ready_opt: ReadyOption,
    use_prop_delta: bool,
) -> bool {
    let (ta, tb) = match (a.next_request(), b.next_request()) {
        (Some(ra), Some(rb)) => (&ra.tag, &rb.tag),
        (Some(_), None) => return true,
        (None, _) => return false,
    };
    if matches!(ready_opt, ReadyOption::Ignore) || ta.ready == tb.ready {
        let mut ka = match field {
            TagField::Reservation => ta.reservation,
            TagField::Proportion => ta.proportion,
            TagField::Limit => ta.limit,
        };
        let mut kb = match field {
            TagField::Reservation => tb.reservation,
            TagField::Proportion => tb.proportion,
            TagField::Limit => tb.limit,
        };
        if use_prop_delta {
            ka += a.prop_delta;
            kb += b.prop_delta;
        }
        ka < kb
    } else if matches!(ready_opt, ReadyOption::Raises) {
        ta.ready
    } else {
        tb.ready
    }
}

macro_rules! heap_order {
    ($name:ident, $slot:expr, $field:expr, $ready:expr, $prop_delta:expr) => {
        pub(crate) struct $name;
        impl<C, R> Criterion<ClientRec<C, R>> for $name {
            const SLOT: HeapSlot = $slot;
            fn precedes(a: &ClientRec<C, R>, b: &ClientRec<C, R>) -> bool {
                compare_heads(a, b, $field, $ready, $prop_delta)
            }
        }
    };
}

heap_order!(
    ReservationOrder,
    HeapSlot::Resv,
    TagField::Reservation,
    ReadyOption::Ignore,
    false
);
heap_order!(
    SurplusOrder,
    HeapSlot::Surplus,
    TagField::Proportion,
    ReadyOption::Raises,
    true
);
heap_order!(
    ResvLimitOrder,
    HeapSlot::ResvLimit,
    TagField::Limit,
    ReadyOption::Lowers,
    false
);
heap_order!(
    BurstOrder,
    HeapSlot::Burst,
    TagField::Proportion,
    ReadyOption::Raises,
    true
);
heap_order!(
    BurstLimitOrder,
    HeapSlot::BurstLimit,
    TagField::Limit,
    ReadyOption::Lowers,
    false
);
heap_order!(
    BestOrder,
    HeapSlot::Best,
    TagField::Proportion,
    ReadyOption::Raises,
    true
);
heap_order!(
    BestLimitOrder,
    HeapSlot::BestLimit,
    TagField::Limit,
    ReadyOption::Lowers,
    false
);
