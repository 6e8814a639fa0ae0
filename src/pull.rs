//! Pull-mode facade: the consumer polls for the next request.
//!
//! `pull_request` never blocks. It either hands back an eligible request with
//! its scheduling phase, names the time at which one becomes eligible, or
//! reports that nothing is queued.

use crate::client::ClientStats;
use crate::config::{ConfigError, QueueConfig};
use crate::engine::{ClientSummary, NextRequest, QueueStats, SchedulerCore};
use crate::periodic::Periodic;
use crate::qos::{ClientInfo, Phase, ReqParams};
use crate::time::{self, Time};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// Result of one poll.
#[derive(Debug)]
pub enum PullRequest<C, R> {
    /// Nothing queued.
    None,
    /// Nothing eligible yet; poll again at the given time.
    Future(Time),
    /// An eligible request.
    Returning { client: C, request: R, phase: Phase },
}

impl<C, R> PullRequest<C, R> {
    pub fn is_none(&self) -> bool {
        matches!(self, PullRequest::None)
    }

    pub fn is_future(&self) -> bool {
        matches!(self, PullRequest::Future(_))
    }

    pub fn is_returning(&self) -> bool {
        matches!(self, PullRequest::Returning { .. })
    }
}

/// Pull-mode priority queue.
///
/// Owns the periodic cleaning job; dropping the queue stops it.
pub struct PullQueue<C, R>
where
    C: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    R: Send + 'static,
{
    core: Arc<SchedulerCore<C, R>>,
    _cleaner: Periodic,
}

impl<C, R> PullQueue<C, R>
where
    C: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    R: Send + 'static,
{
    /// Build a queue around a client-info lookup function. Fails on an
    /// inconsistent age triple or degenerate window.
    pub fn new<F>(client_info_fn: F, config: QueueConfig) -> Result<Self, ConfigError>
    where
        F: Fn(&C) -> ClientInfo + Send + Sync + 'static,
    {
        let core = Arc::new(SchedulerCore::new(Box::new(client_info_fn), &config)?);
        let cleaner_core = core.clone();
        let cleaner = Periodic::spawn("mclock-cleaner", core.check_time(), move || {
            cleaner_core.do_clean(time::now());
        });
        Ok(PullQueue {
            core,
            _cleaner: cleaner,
        })
    }

    /// [`PullQueue::new`] with the default configuration.
    pub fn with_default_config<F>(client_info_fn: F) -> Result<Self, ConfigError>
    where
        F: Fn(&C) -> ClientInfo + Send + Sync + 'static,
    {
        Self::new(client_info_fn, QueueConfig::default())
    }

    /// Enqueue a request. Never blocks on the downstream consumer.
    pub fn add_request(&self, request: R, client: C, params: ReqParams) {
        self.add_request_at(request, client, params, time::now());
    }

    /// Enqueue with an explicit submission time (testing, replay).
    pub fn add_request_at(&self, request: R, client: C, params: ReqParams, time: Time) {
        let mut state = self.core.lock();
        self.core.do_add_request(&mut state, request, client, params, time);
    }

    /// Poll for the next request at the current time.
    pub fn pull_request(&self) -> PullRequest<C, R> {
        self.pull_request_at(time::now())
    }

    /// Poll for the next request as of `now`.
    pub fn pull_request_at(&self, now: Time) -> PullRequest<C, R> {
        let mut state = self.core.lock();
        match self.core.do_next_request(&mut state, now) {
            NextRequest::None => PullRequest::None,
            NextRequest::Future(when) => PullRequest::Future(when),
            NextRequest::Returning(source) => {
                let (client, request, phase) = self.core.pop_from(&mut state, source);
                PullRequest::Returning {
                    client,
                    request,
                    phase,
                }
            }
        }
    }

    /// True when no client has a queued request.
    pub fn is_empty(&self) -> bool {
        self.core.is_empty()
    }

    pub fn client_count(&self) -> usize {
        self.core.client_count()
    }

    pub fn request_count(&self) -> usize {
        self.core.request_count()
    }

    /// Remove every queued request `accept` matches, in forward or backward
    /// visit order; removed requests are passed to `removed`.
    pub fn remove_by_req_filter<F, G>(&self, visit_backwards: bool, accept: F, removed: G) -> bool
    where
        F: FnMut(&R) -> bool,
        G: FnMut(R),
    {
        self.core.remove_by_req_filter(visit_backwards, accept, removed)
    }

    /// Drop all queued requests of one client, handing each to `accum`.
    pub fn remove_by_client<G>(&self, client: &C, reverse: bool, accum: G)
    where
        G: FnMut(R),
    {
        self.core.remove_by_client(client, reverse, accum)
    }

    /// Re-read one client's info from the lookup function immediately,
    /// rather than waiting for the next window rollover.
    pub fn update_client_info(&self, client: &C) {
        self.core.update_client_info(client)
    }

    /// Re-read every client's info immediately.
    pub fn update_client_infos(&self) {
        self.core.update_client_infos()
    }

    /// Lock-free handle to a client's windowed counters.
    pub fn client_stats(&self, client: &C) -> Option<Arc<ClientStats>> {
        self.core.client_stats(client)
    }

    pub fn client_summary(&self, client: &C) -> Option<ClientSummary> {
        self.core.client_summary(client)
    }

    pub fn stats(&self) -> QueueStats {
        self.core.stats()
    }

    pub fn set_win_size(&self, win_size: f64) {
        self.core.set_win_size(win_size)
    }

    pub fn set_system_capacity(&self, capacity: f64) {
        self.core.set_system_capacity(capacity)
    }
}

impl<C, R> Drop for PullQueue<C, R>
where
    C: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    R: Send + 'static,
{
    fn drop(&mut self) {
        self.core.set_finishing();
    }
}
