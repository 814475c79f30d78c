//! Per-destination bookkeeping: handed-out count, idle streams, and the job.

use crate::socket::job::Job;
use crate::socket::key::StreamKey;
use crate::socket::stream::BoxedSocket;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Idle stream with metadata for timeout tracking.
pub(crate) struct IdleStream {
    pub(crate) socket: BoxedSocket,
    pub(crate) endpoint: SocketAddr,
    pub(crate) generation: u64,
    /// When the stream was returned to the group
    pub(crate) since: Instant,
    /// Whether the stream ever carried a request
    pub(crate) was_used: bool,
}

pub(crate) struct Group {
    pub(crate) key: StreamKey,
    pub(crate) handed_out: usize,
    idle: VecDeque<IdleStream>,
    pub(crate) job: Option<Job>,
    /// Streams from generations below this are never reused.
    min_generation: u64,
}

impl Group {
    pub(crate) fn new(key: StreamKey) -> Self {
        Self { key, handed_out: 0, idle: VecDeque::new(), job: None, min_generation: 0 }
    }

    /// Streams handed out, idle, or being established.
    pub(crate) fn active_count(&self) -> usize {
        self.handed_out + self.idle.len() + self.attempt_count()
    }

    pub(crate) fn attempt_count(&self) -> usize {
        self.job.as_ref().map_or(0, |job| job.attempts.len())
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        generation >= self.min_generation
    }

    pub(crate) fn invalidate(&mut self, generation: u64) {
        self.min_generation = generation;
    }

    /// Pop the most recently used live stream; dead and stale ones are
    /// moved to `discarded`.
    pub(crate) fn take_idle_stream(&mut self, discarded: &mut Vec<BoxedSocket>) -> Option<IdleStream> {
        while let Some(idle) = self.idle.pop_back() {
            if self.is_current(idle.generation) && idle.socket.is_connected_and_idle() {
                return Some(idle);
            }
            tracing::trace!(key = %self.key, endpoint = %idle.endpoint, "discarding dead idle stream");
            discarded.push(idle.socket);
        }
        None
    }

    pub(crate) fn add_idle_stream(&mut self, idle: IdleStream) {
        self.idle.push_back(idle);
    }

    pub(crate) fn oldest_idle_since(&self) -> Option<Instant> {
        self.idle.front().map(|idle| idle.since)
    }

    /// Remove the oldest idle stream.
    pub(crate) fn pop_oldest_idle(&mut self) -> Option<IdleStream> {
        self.idle.pop_front()
    }

    pub(crate) fn close_idle_streams(&mut self, discarded: &mut Vec<BoxedSocket>) {
        discarded.extend(self.idle.drain(..).map(|idle| idle.socket));
    }

    /// Drop idle streams past their timeout or no longer connected.
    pub(crate) fn cleanup_idle(
        &mut self,
        now: Instant,
        used_timeout: Duration,
        unused_timeout: Duration,
        discarded: &mut Vec<BoxedSocket>,
    ) {
        let mut kept = VecDeque::with_capacity(self.idle.len());
        for idle in self.idle.drain(..) {
            let timeout = if idle.was_used { used_timeout } else { unused_timeout };
            if now.duration_since(idle.since) < timeout && idle.socket.is_connected_and_idle() {
                kept.push_back(idle);
            } else {
                discarded.push(idle.socket);
            }
        }
        self.idle = kept;
    }

    /// No job, no idle streams, and nothing handed out.
    pub(crate) fn is_empty(&self) -> bool {
        self.job.is_none() && self.idle.is_empty() && self.handed_out == 0
    }
}
