//! A single connect-and-handshake sequence against one endpoint.

use crate::base::neterror::NetError;
use crate::socket::connector::{Connector, HandshakeFailure};
use crate::socket::key::StreamKey;
use crate::socket::outcome::{AttemptResult, FatalError};
use crate::socket::pool::PoolInner;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptStage {
    Connecting,
    Handshaking,
}

/// In-flight attempt owned by a job. Dropping it cancels the task.
#[derive(Debug)]
pub(crate) struct Attempt {
    pub(crate) endpoint: SocketAddr,
    pub(crate) stage: AttemptStage,
    /// Security generation current when the attempt started.
    pub(crate) generation: u64,
    pub(crate) started: Instant,
    abort: AbortHandle,
}

impl Drop for Attempt {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// Everything an attempt task needs; it reports back through the pool.
pub(crate) struct AttemptTask {
    pub(crate) pool: Weak<PoolInner>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) key: StreamKey,
    pub(crate) job_id: u64,
    pub(crate) attempt_id: u64,
    pub(crate) endpoint: SocketAddr,
    pub(crate) generation: u64,
    pub(crate) timeout: Duration,
    pub(crate) crypto_ready: watch::Receiver<bool>,
}

impl AttemptTask {
    /// Spawn the attempt and return its handle.
    pub(crate) fn spawn(self) -> Attempt {
        let endpoint = self.endpoint;
        let generation = self.generation;
        let handle = tokio::spawn(self.run());
        Attempt {
            endpoint,
            stage: AttemptStage::Connecting,
            generation,
            started: Instant::now(),
            abort: handle.abort_handle(),
        }
    }

    async fn run(self) {
        let result = match tokio::time::timeout(self.timeout, self.drive()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(
                    host = %self.key.host(),
                    endpoint = %self.endpoint,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "attempt timed out"
                );
                AttemptResult::Failed(NetError::ConnectionTimedOut)
            }
        };
        if let Some(pool) = self.pool.upgrade() {
            pool.on_attempt_complete(&self.key, self.job_id, self.attempt_id, result);
        }
    }

    async fn drive(&self) -> AttemptResult {
        let socket = match self.connector.connect(&self.key, self.endpoint).await {
            Ok(socket) => socket,
            Err(error) => return AttemptResult::Failed(error),
        };
        if !self.key.is_secure() {
            return AttemptResult::Ready(socket);
        }

        if let Some(pool) = self.pool.upgrade() {
            pool.on_attempt_connected(&self.key, self.job_id, self.attempt_id);
        }

        // The handshake needs whatever the resolver still has to say about
        // this destination (e.g. ECH configs).
        let mut crypto_ready = self.crypto_ready.clone();
        if crypto_ready.wait_for(|ready| *ready).await.is_err() {
            return AttemptResult::Failed(NetError::Aborted);
        }

        match self.connector.handshake(&self.key, self.endpoint, socket).await {
            Ok(socket) => AttemptResult::Ready(socket),
            Err(HandshakeFailure::Error(error)) => AttemptResult::Failed(error),
            Err(HandshakeFailure::Certificate(info)) => {
                AttemptResult::Fatal(FatalError::Certificate(info))
            }
            Err(HandshakeFailure::ClientCertificateNeeded(info)) => {
                AttemptResult::Fatal(FatalError::ClientCertificateNeeded(info))
            }
        }
    }
}
