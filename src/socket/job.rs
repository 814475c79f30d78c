//! Per-destination connection job.
//!
//! A [`Job`] owns the pending requests and in-flight attempts of one group.
//! It decides which endpoint to try next and latches fatal handshake
//! outcomes; the pool drives it and enforces capacity.
//!
//! Based on Chromium's `HttpStreamPool::AttemptManager`.

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::base::priority::RequestPriority;
use crate::socket::attempt::{Attempt, AttemptStage};
use crate::socket::outcome::{ConnectionAttempt, FatalError, OutcomeSlot, StreamError};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for the first endpoints.
    Resolving,
    /// Attempts may be started.
    Racing,
    /// No requests left; in-flight attempts run to completion.
    Draining,
    /// A fatal outcome was observed; no new attempts are started.
    Latched,
}

/// Inputs that move a job between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    EndpointsAvailable,
    RequestAdded,
    RequestsDrained,
    Fatal,
}

impl JobState {
    /// Apply an event. Latched is terminal.
    pub fn transition(self, event: JobEvent) -> JobState {
        match (self, event) {
            (JobState::Latched, _) | (_, JobEvent::Fatal) => JobState::Latched,
            (JobState::Resolving, JobEvent::EndpointsAvailable) => JobState::Racing,
            (JobState::Racing, JobEvent::RequestsDrained) => JobState::Draining,
            (JobState::Draining, JobEvent::RequestAdded) => JobState::Racing,
            (state, _) => state,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Resolving => "resolving",
            JobState::Racing => "racing",
            JobState::Draining => "draining",
            JobState::Latched => "latched",
        }
    }
}

/// A request waiting for a stream.
pub(crate) struct PendingRequest {
    pub(crate) id: u64,
    pub(crate) priority: RequestPriority,
    pub(crate) slot: Arc<OutcomeSlot>,
}

impl PendingRequest {
    /// Higher priority first, then arrival order (ids are handed out
    /// monotonically).
    fn sort_key(&self) -> (std::cmp::Reverse<RequestPriority>, u64) {
        (std::cmp::Reverse(self.priority), self.id)
    }
}

pub(crate) struct Job {
    pub(crate) id: u64,
    state: JobState,
    fatal: Option<FatalError>,
    requests: Vec<PendingRequest>,
    pub(crate) attempts: HashMap<u64, Attempt>,
    endpoints: Vec<SocketAddr>,
    /// endpoints[..cursor] have had an attempt started.
    cursor: usize,
    failed: HashSet<SocketAddr>,
    resolution_done: bool,
    resolve_priority: watch::Sender<RequestPriority>,
    crypto_ready: watch::Sender<bool>,
    pub(crate) resolve_task: Option<AbortHandle>,
    pub(crate) fallback_timer: Option<AbortHandle>,
    last_error: Option<NetError>,
    connection_attempts: Vec<ConnectionAttempt>,
}

impl Job {
    pub(crate) fn new(id: u64, priority: RequestPriority) -> Self {
        let (resolve_priority, _) = watch::channel(priority);
        let (crypto_ready, _) = watch::channel(false);
        Self {
            id,
            state: JobState::Resolving,
            fatal: None,
            requests: Vec::new(),
            attempts: HashMap::new(),
            endpoints: Vec::new(),
            cursor: 0,
            failed: HashSet::new(),
            resolution_done: false,
            resolve_priority,
            crypto_ready,
            resolve_task: None,
            fallback_timer: None,
            last_error: None,
            connection_attempts: Vec::new(),
        }
    }

    pub(crate) fn state(&self) -> JobState {
        self.state
    }

    fn apply(&mut self, event: JobEvent) {
        let next = self.state.transition(event);
        if next != self.state {
            tracing::trace!(job = self.id, from = self.state.as_str(), to = next.as_str(), "job state");
            self.state = next;
        }
    }

    pub(crate) fn fatal(&self) -> Option<&FatalError> {
        self.fatal.as_ref()
    }

    pub(crate) fn subscribe_priority(&self) -> watch::Receiver<RequestPriority> {
        self.resolve_priority.subscribe()
    }

    pub(crate) fn subscribe_crypto_ready(&self) -> watch::Receiver<bool> {
        self.crypto_ready.subscribe()
    }

    pub(crate) fn enqueue(&mut self, request: PendingRequest) {
        self.requests.push(request);
        self.apply(JobEvent::RequestAdded);
        self.update_resolve_priority();
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn has_requests(&self) -> bool {
        !self.requests.is_empty()
    }

    pub(crate) fn max_priority(&self) -> Option<RequestPriority> {
        self.requests.iter().map(|r| r.priority).max()
    }

    /// Push the highest pending priority to the resolver if it changed.
    fn update_resolve_priority(&mut self) {
        if let Some(max) = self.max_priority() {
            self.resolve_priority.send_if_modified(|current| {
                if *current == max {
                    return false;
                }
                *current = max;
                true
            });
        }
    }

    /// Remove and return the request that should get the next stream.
    pub(crate) fn pop_highest(&mut self) -> Option<PendingRequest> {
        let index = self
            .requests
            .iter()
            .enumerate()
            .min_by_key(|(_, r)| r.sort_key())
            .map(|(i, _)| i)?;
        let request = self.requests.remove(index);
        self.after_request_removed();
        Some(request)
    }

    pub(crate) fn remove_request(&mut self, id: u64) -> Option<PendingRequest> {
        let index = self.requests.iter().position(|r| r.id == id)?;
        let request = self.requests.remove(index);
        self.after_request_removed();
        Some(request)
    }

    /// Take every pending request, e.g. to fail them all.
    pub(crate) fn drain_requests(&mut self) -> Vec<PendingRequest> {
        let drained = std::mem::take(&mut self.requests);
        self.after_request_removed();
        drained
    }

    fn after_request_removed(&mut self) {
        if self.requests.is_empty() {
            self.apply(JobEvent::RequestsDrained);
        } else {
            self.update_resolve_priority();
        }
    }

    /// Only the resolver sees priority changes; attempts keep running.
    pub(crate) fn set_priority(&mut self, id: u64, priority: RequestPriority) -> bool {
        let Some(request) = self.requests.iter_mut().find(|r| r.id == id) else {
            return false;
        };
        request.priority = priority;
        self.update_resolve_priority();
        true
    }

    fn sorted_requests(&self) -> Vec<&PendingRequest> {
        let mut sorted: Vec<_> = self.requests.iter().collect();
        sorted.sort_by_key(|r| r.sort_key());
        sorted
    }

    /// The best request not yet backed by an in-flight attempt, as
    /// `(priority, arrival)`.
    pub(crate) fn blocked_request(&self) -> Option<(RequestPriority, u64)> {
        if !self.wants_attempt() {
            return None;
        }
        self.sorted_requests().get(self.attempts.len()).map(|r| (r.priority, r.id))
    }

    /// True if a request-driven attempt could start given capacity.
    pub(crate) fn wants_attempt(&self) -> bool {
        self.state == JobState::Racing
            && self.requests.len() > self.attempts.len()
            && self.next_endpoint_for_request().is_some()
    }

    /// Next untried endpoint, or an endpoint that has not failed yet so
    /// several requests can share one address.
    pub(crate) fn next_endpoint_for_request(&self) -> Option<SocketAddr> {
        self.next_untried_endpoint()
            .or_else(|| self.endpoints.iter().find(|e| !self.failed.contains(*e)).copied())
    }

    pub(crate) fn next_untried_endpoint(&self) -> Option<SocketAddr> {
        self.endpoints.get(self.cursor).copied()
    }

    /// Whether the fallback timer may start another attempt.
    pub(crate) fn wants_fallback(&self) -> bool {
        self.state == JobState::Racing
            && self.has_requests()
            && !self.attempts.is_empty()
            && self.next_untried_endpoint().is_some()
    }

    /// Mark an endpoint as attempted, advancing the cursor if it was untried.
    pub(crate) fn mark_attempted(&mut self, endpoint: SocketAddr) {
        if self.endpoints.get(self.cursor) == Some(&endpoint) {
            self.cursor += 1;
        }
    }

    /// Replace the endpoint list with a fresher one. Endpoints already
    /// attempted keep their place in front of the cursor.
    pub(crate) fn merge_endpoints(&mut self, fresh: Vec<SocketAddr>) {
        let mut merged: Vec<SocketAddr> = self.endpoints[..self.cursor].to_vec();
        for endpoint in fresh {
            if !merged.contains(&endpoint) {
                merged.push(endpoint);
            }
        }
        self.endpoints = merged;
        if !self.endpoints.is_empty() {
            self.apply(JobEvent::EndpointsAvailable);
        }
    }

    pub(crate) fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub(crate) fn set_crypto_ready(&self) {
        self.crypto_ready.send_replace(true);
    }

    pub(crate) fn finish_resolution(&mut self) {
        self.resolution_done = true;
        self.resolve_task = None;
        self.set_crypto_ready();
    }

    pub(crate) fn record_failure(&mut self, endpoint: SocketAddr, error: NetError) {
        self.failed.insert(endpoint);
        self.last_error = Some(error);
        self.connection_attempts.push(ConnectionAttempt { endpoint, error });
    }

    pub(crate) fn note_error(&mut self, error: NetError) {
        self.last_error.get_or_insert(error);
    }

    /// Nothing in flight and nothing left to try.
    pub(crate) fn is_exhausted(&self) -> bool {
        self.resolution_done
            && self.attempts.is_empty()
            && self.state != JobState::Latched
            && self.next_endpoint_for_request().is_none()
    }

    /// The failure handed to every pending request on exhaustion.
    pub(crate) fn exhaustion_error(&self) -> StreamError {
        StreamError::Failed {
            error: self.last_error.unwrap_or(NetError::NameNotResolved),
            attempts: self.connection_attempts.clone(),
        }
    }

    /// Latch a fatal outcome, returning the requests that must receive it.
    pub(crate) fn latch(&mut self, fatal: FatalError) -> Vec<PendingRequest> {
        self.fatal = Some(fatal);
        self.apply(JobEvent::Fatal);
        self.cancel_fallback_timer();
        std::mem::take(&mut self.requests)
    }

    /// Cancel attempts that have not connected yet.
    pub(crate) fn cancel_unconnected_attempts(&mut self) -> Vec<Attempt> {
        let ids: Vec<u64> = self
            .attempts
            .iter()
            .filter(|(_, a)| a.stage == AttemptStage::Connecting)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| self.attempts.remove(&id)).collect()
    }

    pub(crate) fn cancel_fallback_timer(&mut self) {
        if let Some(timer) = self.fallback_timer.take() {
            timer.abort();
        }
    }

    /// Nothing pending and nothing in flight.
    pub(crate) fn is_idle(&self) -> bool {
        self.requests.is_empty() && self.attempts.is_empty()
    }

    /// Load state of a pending request, before the pool accounts for
    /// capacity. `WaitingForAvailableSocket` means no attempt backs it.
    pub(crate) fn load_state(&self, id: u64) -> Option<LoadState> {
        let rank = self.sorted_requests().iter().position(|r| r.id == id)?;
        if rank < self.attempts.len() {
            let handshaking =
                self.attempts.values().any(|a| a.stage == AttemptStage::Handshaking);
            return Some(if handshaking { LoadState::SslHandshake } else { LoadState::Connecting });
        }
        if !self.resolution_done && self.next_endpoint_for_request().is_none() {
            return Some(LoadState::ResolvingHost);
        }
        Some(LoadState::WaitingForAvailableSocket)
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if let Some(task) = self.resolve_task.take() {
            task.abort();
        }
        self.cancel_fallback_timer();
        for request in self.requests.drain(..) {
            let _ = request.slot.offer(Err(StreamError::failed(NetError::Aborted)));
        }
    }
}
