//! The stream pool: groups, global limits, and admission of blocked requests.
//!
//! All scheduling state sits behind one mutex. Resolution tasks, attempt
//! tasks and fallback timers run independently and report back by locking
//! the pool, so every transition is applied serially.
//!
//! Based on Chromium's `HttpStreamPool`.

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::base::priority::RequestPriority;
use crate::dns::{
    EndpointUpdate, HickoryResolver, Name, ServiceEndpointRequest, ServiceEndpointResolver,
};
use crate::socket::attempt::{AttemptStage, AttemptTask};
use crate::socket::config::{ConfigError, PoolConfig};
use crate::socket::connector::{Connector, TcpTlsConnector};
use crate::socket::group::{Group, IdleStream};
use crate::socket::job::{Job, JobState, PendingRequest};
use crate::socket::key::{HostPortPair, StreamKey};
use crate::socket::outcome::{AttemptResult, OutcomeSlot, StreamError, StreamOutcome};
use crate::socket::request::StreamRequest;
use crate::socket::stream::{BoxedSocket, PooledStream};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

/// Scope of a security configuration change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityConfigChange {
    /// Every destination is affected (e.g. new root store).
    All,
    /// Only these servers are affected (e.g. a client certificate changed).
    Servers(Vec<HostPortPair>),
}

impl SecurityConfigChange {
    fn matches(&self, key: &StreamKey) -> bool {
        match self {
            SecurityConfigChange::All => true,
            SecurityConfigChange::Servers(servers) => servers.contains(key.destination()),
        }
    }
}

/// Things to drop only after the pool lock is released. A dropped
/// `PooledStream` re-enters the pool.
#[derive(Default)]
struct Deferred {
    sockets: Vec<BoxedSocket>,
    slots: Vec<Arc<OutcomeSlot>>,
    rejected: Vec<StreamOutcome>,
    jobs: Vec<Job>,
}

impl Deferred {
    /// Drop everything collected. Call with the pool lock released.
    fn release(self) {
        let Deferred { sockets, slots, rejected, jobs } = self;
        drop(rejected);
        drop(jobs);
        drop(slots);
        drop(sockets);
    }
}

pub(crate) struct PoolState {
    groups: HashMap<StreamKey, Group>,
    /// Security configuration generation.
    generation: u64,
    /// Source of request, attempt and job ids. Request ids double as
    /// arrival order.
    next_id: u64,
    /// Requests that received a latched fatal outcome, until consumed.
    latched: Vec<Weak<OutcomeSlot>>,
}

impl PoolState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn total_active_count(&self) -> usize {
        self.groups.values().map(Group::active_count).sum()
    }

    fn remember_latched(&mut self, slot: &Arc<OutcomeSlot>) {
        self.latched.retain(|slot| slot.upgrade().is_some_and(|slot| !slot.is_taken()));
        self.latched.push(Arc::downgrade(slot));
    }
}

pub(crate) struct PoolInner {
    me: Weak<PoolInner>,
    config: PoolConfig,
    resolver: Arc<dyn ServiceEndpointResolver>,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
}

/// Manages established streams and connection attempts for all
/// destinations, enforcing Chromium-like limits.
///
/// Cloning is cheap; clones share the same pool. Methods that may start
/// work (`request_stream`, releases, signals) must be called from within a
/// tokio runtime.
#[derive(Clone)]
pub struct StreamPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for StreamPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPool")
            .field("max_streams_per_group", &self.inner.config.max_streams_per_group)
            .field("max_streams_total", &self.inner.config.max_streams_total)
            .field("total_active", &self.total_active_count())
            .finish()
    }
}

impl StreamPool {
    /// Pool with default limits, the hickory resolver and TCP/TLS connector.
    pub fn new() -> Result<Self, ConfigError> {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let connector = TcpTlsConnector::new()?;
        Self::with_parts(config, Arc::new(HickoryResolver::new()), Arc::new(connector))
    }

    /// Pool with custom collaborators.
    ///
    /// Fails if `config` does not pass [`PoolConfig::validate`].
    pub fn with_parts(
        config: PoolConfig,
        resolver: Arc<dyn ServiceEndpointResolver>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let inner = Arc::new_cyclic(|me| PoolInner {
            me: me.clone(),
            config,
            resolver,
            connector,
            state: Mutex::new(PoolState {
                groups: HashMap::new(),
                generation: 0,
                next_id: 0,
                latched: Vec::new(),
            }),
        });
        Ok(Self { inner })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Request a stream to `key`.
    ///
    /// An idle stream is handed out immediately when one is available;
    /// otherwise the request joins the destination's job and waits.
    pub fn request_stream(&self, key: StreamKey, priority: RequestPriority) -> StreamRequest {
        self.inner.request_stream(key, priority)
    }

    /// Return a stream for reuse. Same as [`PooledStream::release`].
    pub fn release_stream(&self, stream: PooledStream) {
        stream.release();
    }

    /// Wrap an already established transport as a new active stream.
    pub fn create_stream(
        &self,
        key: StreamKey,
        socket: BoxedSocket,
        endpoint: SocketAddr,
    ) -> Result<PooledStream, NetError> {
        self.inner.create_stream(key, socket, endpoint)
    }

    /// Hand an already established transport to the pool as an idle
    /// (never used) stream, or to a waiting request.
    pub fn add_idle_stream(
        &self,
        key: StreamKey,
        socket: BoxedSocket,
        endpoint: SocketAddr,
    ) -> Result<(), NetError> {
        self.inner.add_idle_stream(key, socket, endpoint)
    }

    /// Fail every pending request with `NetworkChanged` and cancel every
    /// in-flight attempt. Established streams are left alone.
    pub fn on_ip_address_changed(&self) {
        self.inner.on_ip_address_changed();
    }

    /// Flush idle streams in scope and stop pooling streams created before
    /// the change.
    pub fn on_security_config_changed(&self, change: SecurityConfigChange) {
        self.inner.on_security_config_changed(change);
    }

    /// Drop idle streams past their timeout.
    /// - Used streams: `used_idle_timeout` (5 minutes by default)
    /// - Unused streams: `unused_idle_timeout` (10 seconds by default)
    pub fn cleanup_idle_streams(&self) {
        self.inner.cleanup_idle_streams();
    }

    /// Close every idle stream.
    pub fn close_idle_streams(&self) {
        self.inner.close_idle_streams();
    }

    /// Start a background task running [`cleanup_idle_streams`] every
    /// `cleanup_interval`. The task ends once the pool is dropped.
    ///
    /// [`cleanup_idle_streams`]: StreamPool::cleanup_idle_streams
    pub fn start_cleanup_task(&self) -> JoinHandle<()> {
        let pool = Arc::downgrade(&self.inner);
        let period = self.inner.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.cleanup_idle_streams();
            }
        })
    }

    /// Streams handed out, idle, or being established, across all groups.
    pub fn total_active_count(&self) -> usize {
        self.inner.state.lock().total_active_count()
    }

    pub fn group_count(&self) -> usize {
        self.inner.state.lock().groups.len()
    }

    /// Total idle streams across all groups.
    pub fn idle_stream_count(&self) -> usize {
        self.inner.state.lock().groups.values().map(Group::idle_count).sum()
    }

    fn with_group<R: Default>(&self, key: &StreamKey, f: impl FnOnce(&Group) -> R) -> R {
        self.inner.state.lock().groups.get(key).map(f).unwrap_or_default()
    }

    pub fn group_idle_count(&self, key: &StreamKey) -> usize {
        self.with_group(key, Group::idle_count)
    }

    /// Handed-out, idle and connecting streams of one group.
    pub fn group_active_count(&self, key: &StreamKey) -> usize {
        self.with_group(key, Group::active_count)
    }

    pub fn handed_out_count(&self, key: &StreamKey) -> usize {
        self.with_group(key, |group| group.handed_out)
    }

    pub fn pending_request_count(&self, key: &StreamKey) -> usize {
        self.with_group(key, |group| group.job.as_ref().map_or(0, Job::request_count))
    }

    pub fn in_flight_attempt_count(&self, key: &StreamKey) -> usize {
        self.with_group(key, Group::attempt_count)
    }

    pub fn job_state(&self, key: &StreamKey) -> Option<JobState> {
        self.with_group(key, |group| group.job.as_ref().map(Job::state))
    }

    /// Current security configuration generation.
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }
}

impl PoolInner {
    fn with_state<R>(&self, f: impl FnOnce(&mut PoolState, &mut Deferred) -> R) -> R {
        let mut deferred = Deferred::default();
        let result = {
            let mut state = self.state.lock();
            f(&mut state, &mut deferred)
        };
        deferred.release();
        result
    }

    fn deliver(&self, slot: &Arc<OutcomeSlot>, outcome: StreamOutcome, d: &mut Deferred) {
        if let Err(rejected) = slot.offer(outcome) {
            d.rejected.push(rejected);
        }
    }

    fn per_group_limit(&self) -> usize {
        self.config.max_streams_per_group
    }

    fn per_pool_limit(&self) -> usize {
        self.config.max_streams_total
    }

    pub(crate) fn request_stream(&self, key: StreamKey, priority: RequestPriority) -> StreamRequest {
        let slot = Arc::new(OutcomeSlot::new());
        let id = self.with_state(|state, d| {
            let id = state.next_id();
            let job_id = state.next_id();
            let group = state.groups.entry(key.clone()).or_insert_with(|| Group::new(key.clone()));

            if let Some(fatal) = group.job.as_ref().and_then(Job::fatal) {
                tracing::debug!(key = %key, "job latched, failing new request");
                self.deliver(&slot, Err(StreamError::from(fatal.clone())), d);
                state.remember_latched(&slot);
                return id;
            }

            if let Some(idle) = group.take_idle_stream(&mut d.sockets) {
                tracing::trace!(key = %key, endpoint = %idle.endpoint, "reusing idle stream");
                group.handed_out += 1;
                let stream = PooledStream::new(
                    idle.socket,
                    key.clone(),
                    idle.endpoint,
                    idle.generation,
                    idle.was_used,
                    self.me.clone(),
                );
                self.deliver(&slot, Ok(stream), d);
                return id;
            }

            let job = group.job.get_or_insert_with(|| {
                tracing::debug!(key = %key, priority = %priority, "creating job");
                let mut job = Job::new(job_id, priority);
                job.resolve_task =
                    Some(self.spawn_resolution(key.clone(), job_id, &job));
                job
            });
            job.enqueue(PendingRequest { id, priority, slot: slot.clone() });

            self.process_group(state, &key, d);
            id
        });
        StreamRequest::new(id, key, slot, self.me.clone())
    }

    fn spawn_resolution(&self, key: StreamKey, job_id: u64, job: &Job) -> AbortHandle {
        let pool = self.me.clone();
        let resolver = self.resolver.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = ServiceEndpointRequest::new(
            Name::new(key.host()),
            key.port(),
            key.secure_dns_policy(),
            job.subscribe_priority(),
            tx,
        );
        let task = tokio::spawn(async move {
            let resolving = resolver.resolve(request);
            tokio::pin!(resolving);
            let result = loop {
                tokio::select! {
                    biased;
                    Some(update) = rx.recv() => {
                        let Some(pool) = pool.upgrade() else { return };
                        pool.on_endpoints_updated(&key, job_id, update);
                    }
                    result = &mut resolving => break result,
                }
            };
            let Some(pool) = pool.upgrade() else { return };
            while let Ok(update) = rx.try_recv() {
                pool.on_endpoints_updated(&key, job_id, update);
            }
            pool.on_resolution_complete(&key, job_id, result);
        });
        task.abort_handle()
    }

    fn spawn_fallback_timer(&self, key: StreamKey, job_id: u64) -> AbortHandle {
        let pool = self.me.clone();
        let delay = self.config.connection_attempt_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(pool) = pool.upgrade() {
                pool.on_fallback_timer(&key, job_id);
            }
        });
        task.abort_handle()
    }

    fn job_mut<'a>(state: &'a mut PoolState, key: &StreamKey, job_id: u64) -> Option<&'a mut Job> {
        state.groups.get_mut(key)?.job.as_mut().filter(|job| job.id == job_id)
    }

    /// Start request-driven attempts while the job wants them and capacity
    /// allows, evicting idle streams elsewhere when only the pool is full.
    fn process_group(&self, state: &mut PoolState, key: &StreamKey, d: &mut Deferred) {
        loop {
            let total = state.total_active_count();
            let Some(group) = state.groups.get(key) else {
                return;
            };
            let Some(endpoint) = group
                .job
                .as_ref()
                .filter(|job| job.wants_attempt())
                .and_then(Job::next_endpoint_for_request)
            else {
                break;
            };
            if group.active_count() >= self.per_group_limit() {
                break;
            }
            if total >= self.per_pool_limit() && !self.close_one_idle_stream(state, key, d) {
                tracing::trace!(key = %key, total, "pool stalled");
                break;
            }
            self.start_attempt(state, key, endpoint);
        }
        self.ensure_fallback_timer(state, key);
    }

    fn start_attempt(&self, state: &mut PoolState, key: &StreamKey, endpoint: SocketAddr) {
        let attempt_id = state.next_id();
        let generation = state.generation;
        let Some(job) = state.groups.get_mut(key).and_then(|group| group.job.as_mut()) else {
            return;
        };
        job.mark_attempted(endpoint);
        tracing::debug!(key = %key, endpoint = %endpoint, attempt = attempt_id, "starting attempt");
        let attempt = AttemptTask {
            pool: self.me.clone(),
            connector: self.connector.clone(),
            key: key.clone(),
            job_id: job.id,
            attempt_id,
            endpoint,
            generation,
            timeout: self.config.handshake_timeout,
            crypto_ready: job.subscribe_crypto_ready(),
        }
        .spawn();
        job.attempts.insert(attempt_id, attempt);
        self.ensure_fallback_timer(state, key);
    }

    fn ensure_fallback_timer(&self, state: &mut PoolState, key: &StreamKey) {
        let Some(job) = state.groups.get_mut(key).and_then(|group| group.job.as_mut()) else {
            return;
        };
        if job.fallback_timer.is_none() && job.wants_fallback() {
            job.fallback_timer = Some(self.spawn_fallback_timer(key.clone(), job.id));
        }
    }

    /// Close the oldest idle stream outside `except` to make room.
    fn close_one_idle_stream(&self, state: &mut PoolState, except: &StreamKey, d: &mut Deferred) -> bool {
        let victim = state
            .groups
            .iter()
            .filter(|(key, _)| *key != except)
            .filter_map(|(key, group)| group.oldest_idle_since().map(|since| (since, key)))
            .min_by_key(|(since, _)| *since)
            .map(|(_, key)| key.clone());
        let Some(victim) = victim else {
            return false;
        };
        if let Some(group) = state.groups.get_mut(&victim) {
            if let Some(idle) = group.pop_oldest_idle() {
                tracing::debug!(key = %victim, endpoint = %idle.endpoint, "closing idle stream for stalled pool");
                d.sockets.push(idle.socket);
            }
            if group.is_empty() {
                state.groups.remove(&victim);
            }
        }
        true
    }

    /// A group other than `key` has a request blocked only by the pool limit.
    fn is_stalled_elsewhere(&self, state: &PoolState, key: &StreamKey) -> bool {
        state.groups.iter().any(|(other, group)| {
            other != key
                && group.active_count() < self.per_group_limit()
                && group.job.as_ref().is_some_and(Job::wants_attempt)
        })
    }

    /// Give freed capacity to the best blocked request across all groups,
    /// one attempt at a time.
    fn admit_stalled(&self, state: &mut PoolState, d: &mut Deferred) {
        loop {
            let best = state
                .groups
                .iter()
                .filter(|(_, group)| group.active_count() < self.per_group_limit())
                .filter_map(|(key, group)| {
                    let (priority, arrival) = group.job.as_ref()?.blocked_request()?;
                    Some((priority, arrival, key))
                })
                .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
                .map(|(_, _, key)| key.clone());
            let Some(key) = best else {
                return;
            };
            if state.total_active_count() >= self.per_pool_limit()
                && !self.close_one_idle_stream(state, &key, d)
            {
                return;
            }
            let Some(endpoint) = state
                .groups
                .get(&key)
                .and_then(|group| group.job.as_ref())
                .and_then(Job::next_endpoint_for_request)
            else {
                return;
            };
            tracing::trace!(key = %key, "admitting stalled request");
            self.start_attempt(state, &key, endpoint);
        }
    }

    /// Place a stream that just became available: to the best pending
    /// request of its group, else into the idle set. Stale streams, and
    /// streams that would starve a stalled group, are closed instead.
    #[allow(clippy::too_many_arguments)]
    fn on_stream_ready(
        &self,
        state: &mut PoolState,
        key: &StreamKey,
        socket: BoxedSocket,
        endpoint: SocketAddr,
        generation: u64,
        was_used: bool,
        d: &mut Deferred,
    ) {
        let stalled_elsewhere = self.is_stalled_elsewhere(state, key);
        let total = state.total_active_count();
        let Some(group) = state.groups.get_mut(key) else {
            d.sockets.push(socket);
            return;
        };
        if !group.is_current(generation) {
            tracing::debug!(key = %key, endpoint = %endpoint, generation, "discarding stream from old security configuration");
            d.sockets.push(socket);
            return;
        }

        if let Some(request) = group.job.as_mut().and_then(Job::pop_highest) {
            tracing::trace!(key = %key, endpoint = %endpoint, request = request.id, "stream ready");
            group.handed_out += 1;
            let stream =
                PooledStream::new(socket, key.clone(), endpoint, generation, was_used, self.me.clone());
            self.deliver(&request.slot, Ok(stream), d);
            d.slots.push(request.slot);
            return;
        }

        if stalled_elsewhere && total + 1 >= self.per_pool_limit() {
            tracing::debug!(key = %key, "closing stream to unblock a stalled group");
            d.sockets.push(socket);
            return;
        }

        tracing::trace!(key = %key, endpoint = %endpoint, "stream idle");
        group.add_idle_stream(IdleStream { socket, endpoint, generation, since: Instant::now(), was_used });
    }

    /// Fail pending requests on exhaustion and drop what is no longer needed.
    fn finish_group(&self, state: &mut PoolState, key: &StreamKey, d: &mut Deferred) {
        let Some(group) = state.groups.get_mut(key) else {
            return;
        };
        if let Some(job) = group.job.as_mut() {
            if job.has_requests() && job.is_exhausted() {
                let error = job.exhaustion_error();
                tracing::debug!(key = %key, error = %error.net_error(), "all endpoints failed");
                for request in job.drain_requests() {
                    self.deliver(&request.slot, Err(error.clone()), d);
                    d.slots.push(request.slot);
                }
            }
            if job.is_idle() {
                tracing::trace!(key = %key, job = job.id, "job finished");
                if let Some(job) = group.job.take() {
                    d.jobs.push(job);
                }
            }
        }
        if group.is_empty() {
            state.groups.remove(key);
        }
    }

    pub(crate) fn on_endpoints_updated(&self, key: &StreamKey, job_id: u64, update: EndpointUpdate) {
        self.with_state(|state, d| {
            let Some(job) = Self::job_mut(state, key, job_id) else {
                return;
            };
            tracing::trace!(
                key = %key,
                endpoints = update.endpoints.len(),
                crypto_ready = update.crypto_ready,
                "endpoints updated"
            );
            job.merge_endpoints(update.endpoints);
            if update.crypto_ready {
                job.set_crypto_ready();
            }
            self.process_group(state, key, d);
        });
    }

    pub(crate) fn on_resolution_complete(&self, key: &StreamKey, job_id: u64, result: Result<(), NetError>) {
        self.with_state(|state, d| {
            let Some(job) = Self::job_mut(state, key, job_id) else {
                return;
            };
            job.finish_resolution();
            match result {
                Err(error) if job.endpoint_count() == 0 => {
                    tracing::debug!(key = %key, error = %error, "resolution failed");
                    for request in job.drain_requests() {
                        self.deliver(&request.slot, Err(StreamError::failed(error)), d);
                        d.slots.push(request.slot);
                    }
                }
                Err(error) => {
                    tracing::debug!(key = %key, error = %error, "resolution failed after partial results");
                    job.note_error(error);
                }
                Ok(()) => tracing::trace!(key = %key, endpoints = job.endpoint_count(), "resolution complete"),
            }
            self.process_group(state, key, d);
            self.finish_group(state, key, d);
        });
    }

    pub(crate) fn on_fallback_timer(&self, key: &StreamKey, job_id: u64) {
        self.with_state(|state, d| {
            let endpoint = {
                let Some(group) = state.groups.get_mut(key) else {
                    return;
                };
                let group_full = group.active_count() >= self.per_group_limit();
                let Some(job) = group.job.as_mut().filter(|job| job.id == job_id) else {
                    return;
                };
                job.fallback_timer = None;
                if group_full || !job.wants_fallback() {
                    return;
                }
                job.next_untried_endpoint()
            };
            let Some(endpoint) = endpoint else {
                return;
            };
            if state.total_active_count() >= self.per_pool_limit()
                && !self.close_one_idle_stream(state, key, d)
            {
                return;
            }
            tracing::debug!(key = %key, endpoint = %endpoint, "attempt delay elapsed, racing next endpoint");
            self.start_attempt(state, key, endpoint);
        });
    }

    pub(crate) fn on_attempt_connected(&self, key: &StreamKey, job_id: u64, attempt_id: u64) {
        let mut state = self.state.lock();
        if let Some(attempt) =
            Self::job_mut(&mut *state, key, job_id).and_then(|job| job.attempts.get_mut(&attempt_id))
        {
            attempt.stage = AttemptStage::Handshaking;
        }
    }

    pub(crate) fn on_attempt_complete(
        &self,
        key: &StreamKey,
        job_id: u64,
        attempt_id: u64,
        result: AttemptResult,
    ) {
        self.with_state(|state, d| {
            let mut latched = Vec::new();
            let ready = {
                let Some(job) = Self::job_mut(state, key, job_id) else {
                    if let AttemptResult::Ready(socket) = result {
                        d.sockets.push(socket);
                    }
                    return;
                };
                let Some(attempt) = job.attempts.remove(&attempt_id) else {
                    if let AttemptResult::Ready(socket) = result {
                        d.sockets.push(socket);
                    }
                    return;
                };
                job.cancel_fallback_timer();
                let endpoint = attempt.endpoint;
                let generation = attempt.generation;
                let elapsed_ms = attempt.started.elapsed().as_millis() as u64;
                match result {
                    AttemptResult::Ready(socket) => {
                        tracing::debug!(key = %key, endpoint = %endpoint, elapsed_ms, "attempt succeeded");
                        Some((socket, endpoint, generation))
                    }
                    AttemptResult::Failed(error) if job.fatal().is_some() => {
                        tracing::trace!(key = %key, endpoint = %endpoint, error = %error, "ignoring failure after fatal error");
                        None
                    }
                    AttemptResult::Failed(error) => {
                        tracing::debug!(key = %key, endpoint = %endpoint, error = %error, elapsed_ms, "attempt failed");
                        job.record_failure(endpoint, error);
                        None
                    }
                    AttemptResult::Fatal(_) if job.fatal().is_some() => None,
                    AttemptResult::Fatal(fatal) => {
                        let outcome = StreamError::from(fatal.clone());
                        tracing::debug!(key = %key, endpoint = %endpoint, error = %outcome.net_error(), "fatal handshake error, latching");
                        for request in job.latch(fatal) {
                            self.deliver(&request.slot, Err(outcome.clone()), d);
                            latched.push(request.slot);
                        }
                        None
                    }
                }
            };
            // Latched outcomes stay reachable for a later network change.
            for slot in latched {
                state.remember_latched(&slot);
                d.slots.push(slot);
            }
            if let Some((socket, endpoint, generation)) = ready {
                self.on_stream_ready(state, key, socket, endpoint, generation, false, d);
            }
            self.process_group(state, key, d);
            self.finish_group(state, key, d);
            self.admit_stalled(state, d);
        });
    }

    pub(crate) fn set_request_priority(&self, key: &StreamKey, id: u64, priority: RequestPriority) {
        let mut state = self.state.lock();
        if let Some(job) = state.groups.get_mut(key).and_then(|group| group.job.as_mut()) {
            if job.set_priority(id, priority) {
                tracing::trace!(key = %key, request = id, priority = %priority, "priority changed");
            }
        }
    }

    pub(crate) fn request_load_state(&self, key: &StreamKey, id: u64) -> LoadState {
        let state = self.state.lock();
        let total = state.total_active_count();
        let Some(group) = state.groups.get(key) else {
            return LoadState::Idle;
        };
        match group.job.as_ref().and_then(|job| job.load_state(id)) {
            None => LoadState::Idle,
            Some(LoadState::WaitingForAvailableSocket)
                if group.active_count() < self.per_group_limit() && total >= self.per_pool_limit() =>
            {
                LoadState::WaitingForStalledSocketPool
            }
            Some(load_state) => load_state,
        }
    }

    pub(crate) fn cancel_request(&self, key: &StreamKey, id: u64) {
        self.with_state(|state, d| {
            let Some(job) = state.groups.get_mut(key).and_then(|group| group.job.as_mut()) else {
                return;
            };
            let Some(request) = job.remove_request(id) else {
                return;
            };
            d.slots.push(request.slot);
            if !job.has_requests() {
                let cancelled = job.cancel_unconnected_attempts();
                job.cancel_fallback_timer();
                tracing::debug!(key = %key, cancelled = cancelled.len(), kept = job.attempts.len(), "last request cancelled");
            }
            self.finish_group(state, key, d);
            self.admit_stalled(state, d);
        });
    }

    pub(crate) fn release_stream(
        &self,
        key: &StreamKey,
        socket: BoxedSocket,
        endpoint: SocketAddr,
        generation: u64,
        reusable: bool,
    ) {
        self.with_state(|state, d| {
            let Some(group) = state.groups.get_mut(key) else {
                d.sockets.push(socket);
                return;
            };
            group.handed_out = group.handed_out.saturating_sub(1);
            let usable =
                reusable && group.is_current(generation) && socket.is_connected_and_idle();
            if usable {
                self.on_stream_ready(state, key, socket, endpoint, generation, true, d);
            } else {
                tracing::trace!(key = %key, endpoint = %endpoint, reusable, "closing released stream");
                d.sockets.push(socket);
            }
            self.finish_group(state, key, d);
            self.admit_stalled(state, d);
        });
    }

    /// Make room for one more stream in `key`'s group, or fail.
    fn reserve_slot(&self, state: &mut PoolState, key: &StreamKey) -> Result<u64, NetError> {
        let total = state.total_active_count();
        let generation = state.generation;
        let group_active = state.groups.get(key).map_or(0, Group::active_count);
        if group_active >= self.per_group_limit() || total >= self.per_pool_limit() {
            tracing::debug!(key = %key, group_active, total, "no room for stream");
            return Err(NetError::PreconnectMaxSocketLimit);
        }
        Ok(generation)
    }

    pub(crate) fn create_stream(
        &self,
        key: StreamKey,
        socket: BoxedSocket,
        endpoint: SocketAddr,
    ) -> Result<PooledStream, NetError> {
        self.with_state(|state, d| {
            let generation = match self.reserve_slot(state, &key) {
                Ok(generation) => generation,
                Err(error) => {
                    d.sockets.push(socket);
                    return Err(error);
                }
            };
            let group = state.groups.entry(key.clone()).or_insert_with(|| Group::new(key.clone()));
            group.handed_out += 1;
            Ok(PooledStream::new(socket, key, endpoint, generation, false, self.me.clone()))
        })
    }

    pub(crate) fn add_idle_stream(
        &self,
        key: StreamKey,
        socket: BoxedSocket,
        endpoint: SocketAddr,
    ) -> Result<(), NetError> {
        self.with_state(|state, d| {
            let generation = match self.reserve_slot(state, &key) {
                Ok(generation) => generation,
                Err(error) => {
                    d.sockets.push(socket);
                    return Err(error);
                }
            };
            state.groups.entry(key.clone()).or_insert_with(|| Group::new(key.clone()));
            self.on_stream_ready(state, &key, socket, endpoint, generation, false, d);
            self.finish_group(state, &key, d);
            Ok(())
        })
    }

    fn on_ip_address_changed(&self) {
        self.with_state(|state, d| {
            let mut failed = 0usize;
            for group in state.groups.values_mut() {
                let Some(mut job) = group.job.take() else {
                    continue;
                };
                for request in job.drain_requests() {
                    self.deliver(&request.slot, Err(StreamError::failed(NetError::NetworkChanged)), d);
                    d.slots.push(request.slot);
                    failed += 1;
                }
                d.jobs.push(job);
            }
            for slot in state.latched.drain(..).filter_map(|slot| slot.upgrade()) {
                self.deliver(&slot, Err(StreamError::failed(NetError::NetworkChanged)), d);
                d.slots.push(slot);
            }
            state.groups.retain(|_, group| !group.is_empty());
            tracing::debug!(failed, cancelled_jobs = d.jobs.len(), "ip address changed");
        });
    }

    fn on_security_config_changed(&self, change: SecurityConfigChange) {
        self.with_state(|state, d| {
            state.generation += 1;
            let generation = state.generation;
            for group in state.groups.values_mut().filter(|group| change.matches(&group.key)) {
                group.invalidate(generation);
                group.close_idle_streams(&mut d.sockets);
            }
            state.groups.retain(|_, group| !group.is_empty());
            tracing::debug!(generation, closed = d.sockets.len(), "security configuration changed");
            self.admit_stalled(state, d);
        });
    }

    fn cleanup_idle_streams(&self) {
        let now = Instant::now();
        self.with_state(|state, d| {
            for group in state.groups.values_mut() {
                group.cleanup_idle(
                    now,
                    self.config.used_idle_timeout,
                    self.config.unused_idle_timeout,
                    &mut d.sockets,
                );
            }
            state.groups.retain(|_, group| !group.is_empty());
            if !d.sockets.is_empty() {
                tracing::debug!(closed = d.sockets.len(), "expired idle streams");
            }
            self.admit_stalled(state, d);
        });
    }

    fn close_idle_streams(&self) {
        self.with_state(|state, d| {
            for group in state.groups.values_mut() {
                group.close_idle_streams(&mut d.sockets);
            }
            state.groups.retain(|_, group| !group.is_empty());
            self.admit_stalled(state, d);
        });
    }
}
