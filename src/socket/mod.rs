//! Stream pooling and connection establishment.
//!
//! Mirrors Chromium's `HttpStreamPool` design in `net/http/`:
//! - [`pool`]: Stream pool (6 per destination, 256 total) and admission
//! - [`job`]: Per-destination scheduler racing endpoints (happy eyeballs)
//! - [`request`]: The caller's handle for a pending stream
//! - [`connector`]: TCP connect and BoringSSL handshake
//! - [`stream`]: Pooled streams and the socket abstraction

pub(crate) mod attempt;
pub mod config;
pub mod connector;
pub(crate) mod group;
pub mod job;
pub mod key;
pub mod outcome;
pub mod pool;
pub mod request;
pub mod stream;
pub mod tls;

pub use config::{ConfigError, PoolConfig};
pub use connector::{Connector, HandshakeFailure, TcpTlsConnector};
pub use job::{JobEvent, JobState};
pub use key::{HostPortPair, Scheme, StreamKey};
pub use outcome::{
    CertificateErrorInfo, ConnectionAttempt, FatalError, SslCertRequestInfo, StreamError,
    StreamOutcome,
};
pub use pool::{SecurityConfigChange, StreamPool};
pub use request::StreamRequest;
pub use stream::{BoxedSocket, PooledStream, StreamSocket};
