//! The caller's handle for one stream request.

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::base::priority::RequestPriority;
use crate::socket::key::StreamKey;
use crate::socket::outcome::{OutcomeSlot, StreamError, StreamOutcome};
use crate::socket::pool::PoolInner;
use futures::future::BoxFuture;
use std::fmt;
use std::future::IntoFuture;
use std::sync::{Arc, Weak};

/// A pending request for a usable stream.
///
/// Resolves to exactly one outcome; await it directly or call
/// [`StreamRequest::wait`]. Dropping the handle before completion cancels
/// the request; a stream delivered but never taken is returned to the pool.
///
/// Chromium equivalent: `HttpStreamRequest`
pub struct StreamRequest {
    id: u64,
    key: StreamKey,
    slot: Arc<OutcomeSlot>,
    pool: Weak<PoolInner>,
}

impl StreamRequest {
    pub(crate) fn new(id: u64, key: StreamKey, slot: Arc<OutcomeSlot>, pool: Weak<PoolInner>) -> Self {
        Self { id, key, slot, pool }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Change the priority. Only the ordering of pending requests and the
    /// resolver's priority are affected; running attempts are not.
    pub fn set_priority(&self, priority: RequestPriority) {
        if let Some(pool) = self.pool.upgrade() {
            pool.set_request_priority(&self.key, self.id, priority);
        }
    }

    pub fn load_state(&self) -> LoadState {
        if self.slot.is_settled() {
            return LoadState::Idle;
        }
        match self.pool.upgrade() {
            Some(pool) => pool.request_load_state(&self.key, self.id),
            None => LoadState::Idle,
        }
    }

    /// True once an outcome has been delivered.
    pub fn is_completed(&self) -> bool {
        self.slot.is_settled()
    }

    /// Wait for the outcome.
    pub async fn wait(self) -> StreamOutcome {
        loop {
            if let Some(outcome) = self.slot.take() {
                return outcome;
            }
            if self.pool.strong_count() == 0 && !self.slot.is_settled() {
                tracing::warn!(key = %self.key, request = self.id, "pool dropped with request pending");
                return Err(StreamError::failed(NetError::Aborted));
            }
            self.slot.notified().await;
        }
    }
}

impl IntoFuture for StreamRequest {
    type Output = StreamOutcome;
    type IntoFuture = BoxFuture<'static, StreamOutcome>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl Drop for StreamRequest {
    fn drop(&mut self) {
        if !self.slot.is_settled() {
            if let Some(pool) = self.pool.upgrade() {
                pool.cancel_request(&self.key, self.id);
            }
        }
        // A stream may have landed before the cancellation took effect.
        if let Some(Ok(stream)) = self.slot.take() {
            stream.release();
        }
    }
}

impl fmt::Debug for StreamRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRequest")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("slot", &self.slot)
            .finish()
    }
}
