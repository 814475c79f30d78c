//! Terminal outcomes of stream requests.
//!
//! Every [`StreamRequest`](crate::socket::request::StreamRequest) receives
//! exactly one outcome through an [`OutcomeSlot`]. Errors are ranked so a
//! network change can replace a fatal error the caller has not yet consumed.

use crate::base::neterror::NetError;
use crate::socket::key::HostPortPair;
use crate::socket::stream::{BoxedSocket, PooledStream};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::Notify;

/// One failed connection attempt, reported with a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionAttempt {
    pub endpoint: SocketAddr,
    pub error: NetError,
}

/// A certificate rejected during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateErrorInfo {
    pub error: NetError,
    pub endpoint: SocketAddr,
    /// Peer chain as presented, DER encoded, leaf first.
    pub cert_chain: Vec<Vec<u8>>,
    pub detail: String,
}

/// The server asked for a client certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslCertRequestInfo {
    pub host_and_port: HostPortPair,
    /// Distinguished names of acceptable authorities, DER encoded.
    pub cert_authorities: Vec<Vec<u8>>,
}

/// Failures that latch a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    Certificate(CertificateErrorInfo),
    ClientCertificateNeeded(SslCertRequestInfo),
}

/// Error outcome of a stream request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("stream request failed: {error}")]
    Failed { error: NetError, attempts: Vec<ConnectionAttempt> },
    #[error("certificate error: {}", .0.error)]
    CertificateError(CertificateErrorInfo),
    #[error("client certificate needed for {}", .0.host_and_port)]
    ClientCertificateNeeded(SslCertRequestInfo),
}

impl StreamError {
    pub fn failed(error: NetError) -> Self {
        StreamError::Failed { error, attempts: Vec::new() }
    }

    pub fn net_error(&self) -> NetError {
        match self {
            StreamError::Failed { error, .. } => *error,
            StreamError::CertificateError(info) => info.error,
            StreamError::ClientCertificateNeeded(_) => NetError::SslClientAuthCertNeeded,
        }
    }

    pub fn is_network_changed(&self) -> bool {
        self.net_error() == NetError::NetworkChanged
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, StreamError::Failed { .. })
    }

    /// Precedence: network change > fatal > any other failure.
    pub fn rank(&self) -> u8 {
        if self.is_network_changed() {
            3
        } else if self.is_fatal() {
            2
        } else {
            1
        }
    }
}

impl From<FatalError> for StreamError {
    fn from(fatal: FatalError) -> Self {
        match fatal {
            FatalError::Certificate(info) => StreamError::CertificateError(info),
            FatalError::ClientCertificateNeeded(info) => StreamError::ClientCertificateNeeded(info),
        }
    }
}

/// What a finished attempt reports back to its job.
#[derive(Debug)]
pub(crate) enum AttemptResult {
    Ready(BoxedSocket),
    Failed(NetError),
    Fatal(FatalError),
}

pub type StreamOutcome = Result<PooledStream, StreamError>;

enum SlotState {
    Empty,
    Ready(StreamOutcome),
    Taken,
}

/// Single-fire completion slot shared between the pool and a request handle.
pub(crate) struct OutcomeSlot {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl OutcomeSlot {
    pub(crate) fn new() -> Self {
        Self { state: Mutex::new(SlotState::Empty), notify: Notify::new() }
    }

    /// Store an outcome.
    ///
    /// An unconsumed error is replaced only by a strictly higher ranked
    /// error. Anything not stored is handed back so the caller can drop it
    /// outside the pool lock.
    pub(crate) fn offer(&self, outcome: StreamOutcome) -> Result<(), StreamOutcome> {
        let mut state = self.state.lock();
        let accept = match (&*state, &outcome) {
            (SlotState::Empty, _) => true,
            (SlotState::Ready(Err(current)), Err(new)) => new.rank() > current.rank(),
            _ => false,
        };
        if !accept {
            return Err(outcome);
        }
        let previous = std::mem::replace(&mut *state, SlotState::Ready(outcome));
        drop(state);
        drop(previous);
        self.notify.notify_one();
        Ok(())
    }

    pub(crate) fn take(&self) -> Option<StreamOutcome> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Ready(outcome) => Some(outcome),
            other => {
                *state = other;
                None
            }
        }
    }

    /// True once the caller has taken the outcome.
    pub(crate) fn is_taken(&self) -> bool {
        matches!(*self.state.lock(), SlotState::Taken)
    }

    /// True once an outcome has been stored (consumed or not).
    pub(crate) fn is_settled(&self) -> bool {
        !matches!(*self.state.lock(), SlotState::Empty)
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await
    }
}

impl fmt::Debug for OutcomeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.state.lock() {
            SlotState::Empty => "empty",
            SlotState::Ready(Ok(_)) => "ready",
            SlotState::Ready(Err(_)) => "failed",
            SlotState::Taken => "taken",
        };
        f.debug_struct("OutcomeSlot").field("state", &state).finish()
    }
}
