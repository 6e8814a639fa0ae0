//! Push-mode facade: the scheduler drives dispatch via callback.
//!
//! Whenever a request is added or the server reports a completed one, the
//! queue re-runs the dispatch decision. An eligible request is submitted to
//! the handler on the spot; a future-ready outcome arms a dedicated
//! scheduler thread that sleeps on a condvar until the named time and then
//! retries. Any event that produces an earlier wakeup re-arms the thread.
//!
//! The handler runs with the scheduler's data mutex held and must not
//! re-enter the queue.

use crate::client::ClientStats;
use crate::config::{ConfigError, QueueConfig};
use crate::engine::{ClientSummary, EngineState, NextRequest, QueueStats, SchedulerCore};
use crate::periodic::Periodic;
use crate::qos::{ClientInfo, Phase, ReqParams};
use crate::time::{self, Time, TIME_ZERO};
use parking_lot::{Condvar, Mutex};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

struct PushShared<C, R>
where
    C: Eq + Hash + Clone + Debug,
{
    core: Arc<SchedulerCore<C, R>>,
    can_handle: Box<dyn Fn() -> bool + Send + Sync>,
    handle: Box<dyn Fn(C, R, Phase) + Send + Sync>,
    /// Next armed wakeup; `TIME_ZERO` when the scheduler thread is unarmed.
    wake_at: Mutex<Time>,
    wake_cv: Condvar,
}

impl<C, R> PushShared<C, R>
where
    C: Eq + Hash + Clone + Debug,
{
    /// Run the dispatch decision once: submit, arm the timer, or do nothing.
    /// The data mutex must already be held, so callers that enqueue first
    /// keep one critical section across the add and the decision.
    fn schedule_locked(&self, state: &mut EngineState<C, R>) {
        if !(self.can_handle)() {
            return;
        }
        match self.core.do_next_request(state, time::now()) {
            NextRequest::None => {}
            NextRequest::Future(when) => self.wake_scheduler_at(when),
            NextRequest::Returning(source) => {
                let (client, request, phase) = self.core.pop_from(state, source);
                (self.handle)(client, request, phase);
            }
        }
    }

    /// [`PushShared::schedule_locked`] behind a fresh lock acquisition.
    fn schedule_request(&self) {
        let mut state = self.core.lock();
        self.schedule_locked(&mut state);
    }

    /// Arm the scheduler thread; only ever moves the wakeup earlier.
    fn wake_scheduler_at(&self, when: Time) {
        let mut wake_at = self.wake_at.lock();
        if self.core.is_finishing() {
            return;
        }
        if *wake_at == TIME_ZERO || when < *wake_at {
            *wake_at = when;
            self.wake_cv.notify_one();
        }
    }

    /// Body of the scheduler thread: sleep until armed, then until the armed
    /// time, then run the decision again.
    fn run_scheduler(&self) {
        let mut wake_at = self.wake_at.lock();
        while !self.core.is_finishing() {
            if *wake_at == TIME_ZERO {
                self.wake_cv.wait(&mut wake_at);
            } else {
                loop {
                    if self.core.is_finishing() {
                        return;
                    }
                    let now = time::now();
                    if now >= *wake_at {
                        break;
                    }
                    let timeout = Duration::from_secs_f64((*wake_at - now).max(0.0) + 1e-6);
                    self.wake_cv.wait_for(&mut wake_at, timeout);
                }
                *wake_at = TIME_ZERO;
                if self.core.is_finishing() {
                    return;
                }
                drop(wake_at);
                self.schedule_request();
                wake_at = self.wake_at.lock();
            }
        }
    }
}

/// Push-mode priority queue.
///
/// Owns the scheduler thread and the periodic cleaning job; dropping the
/// queue signals both and joins the scheduler thread.
pub struct PushQueue<C, R>
where
    C: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    R: Send + 'static,
{
    shared: Arc<PushShared<C, R>>,
    _cleaner: Periodic,
    scheduler: Option<JoinHandle<()>>,
}

impl<C, R> PushQueue<C, R>
where
    C: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    R: Send + 'static,
{
    /// Build a push queue. `can_handle` reports whether the server has a
    /// free slot; `handle` receives each dispatched request with its phase.
    pub fn new<F, W, H>(
        client_info_fn: F,
        can_handle: W,
        handle: H,
        config: QueueConfig,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&C) -> ClientInfo + Send + Sync + 'static,
        W: Fn() -> bool + Send + Sync + 'static,
        H: Fn(C, R, Phase) + Send + Sync + 'static,
    {
        let core = Arc::new(SchedulerCore::new(Box::new(client_info_fn), &config)?);
        let shared = Arc::new(PushShared {
            core: core.clone(),
            can_handle: Box::new(can_handle),
            handle: Box::new(handle),
            wake_at: Mutex::new(TIME_ZERO),
            wake_cv: Condvar::new(),
        });
        let runner = shared.clone();
        let scheduler = Builder::new()
            .name("mclock-sched".to_string())
            .spawn(move || runner.run_scheduler())
            .expect("failed to spawn scheduler thread");
        let cleaner = Periodic::spawn("mclock-cleaner", core.check_time(), move || {
            core.do_clean(time::now());
        });
        Ok(PushQueue {
            shared,
            _cleaner: cleaner,
            scheduler: Some(scheduler),
        })
    }

    /// [`PushQueue::new`] with the default configuration.
    pub fn with_default_config<F, W, H>(
        client_info_fn: F,
        can_handle: W,
        handle: H,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&C) -> ClientInfo + Send + Sync + 'static,
        W: Fn() -> bool + Send + Sync + 'static,
        H: Fn(C, R, Phase) + Send + Sync + 'static,
    {
        Self::new(client_info_fn, can_handle, handle, QueueConfig::default())
    }

    /// Enqueue a request and run the dispatch decision.
    pub fn add_request(&self, request: R, client: C, params: ReqParams) {
        self.add_request_at(request, client, params, time::now());
    }

    /// Enqueue with an explicit submission time, then run the decision,
    /// all under one hold of the data mutex.
    pub fn add_request_at(&self, request: R, client: C, params: ReqParams, time: Time) {
        let mut state = self.shared.core.lock();
        self.shared
            .core
            .do_add_request(&mut state, request, client, params, time);
        self.shared.schedule_locked(&mut state);
    }

    /// Tell the queue a server slot freed up; runs the dispatch decision.
    pub fn request_completed(&self) {
        self.shared.schedule_request();
    }

    pub fn is_empty(&self) -> bool {
        self.shared.core.is_empty()
    }

    pub fn client_count(&self) -> usize {
        self.shared.core.client_count()
    }

    pub fn request_count(&self) -> usize {
        self.shared.core.request_count()
    }

    /// Remove every queued request `accept` matches; see the pull facade.
    pub fn remove_by_req_filter<F, G>(&self, visit_backwards: bool, accept: F, removed: G) -> bool
    where
        F: FnMut(&R) -> bool,
        G: FnMut(R),
    {
        self.shared
            .core
            .remove_by_req_filter(visit_backwards, accept, removed)
    }

    /// Drop all queued requests of one client, handing each to `accum`.
    pub fn remove_by_client<G>(&self, client: &C, reverse: bool, accum: G)
    where
        G: FnMut(R),
    {
        self.shared.core.remove_by_client(client, reverse, accum)
    }

    pub fn update_client_info(&self, client: &C) {
        self.shared.core.update_client_info(client)
    }

    pub fn update_client_infos(&self) {
        self.shared.core.update_client_infos()
    }

    /// Lock-free handle to a client's windowed counters.
    pub fn client_stats(&self, client: &C) -> Option<Arc<ClientStats>> {
        self.shared.core.client_stats(client)
    }

    pub fn client_summary(&self, client: &C) -> Option<ClientSummary> {
        self.shared.core.client_summary(client)
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.core.stats()
    }

    pub fn set_win_size(&self, win_size: f64) {
        self.shared.core.set_win_size(win_size)
    }

    pub fn set_system_capacity(&self, capacity: f64) {
        self.shared.core.set_system_capacity(capacity)
    }
}

impl<C, R> Drop for PushQueue<C, R>
where
    C: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    R: Send + 'static,
{
    fn drop(&mut self) {
        self.shared.core.set_finishing();
        {
            let _wake = self.shared.wake_at.lock();
            self.shared.wake_cv.notify_one();
        }
        if let Some(handle) = self.scheduler.take() {
            let _ = handle.join();
        }
    }
}
