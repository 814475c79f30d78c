//! Ergonomic error context helpers.
//!
//! Provides an extension trait for converting IO errors raised while
//! connecting into `NetError` codes, logging the endpoint they came from.

use crate::base::neterror::NetError;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;

/// Map an IO error kind onto the closest network error code.
pub fn map_io_error(error: &io::Error) -> NetError {
    match error.kind() {
        ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
        ErrorKind::ConnectionReset => NetError::ConnectionReset,
        ErrorKind::ConnectionAborted => NetError::ConnectionAborted,
        ErrorKind::NotConnected => NetError::SocketNotConnected,
        ErrorKind::AddrInUse => NetError::AddressInUse,
        ErrorKind::AddrNotAvailable => NetError::AddressInvalid,
        ErrorKind::TimedOut => NetError::ConnectionTimedOut,
        ErrorKind::PermissionDenied => NetError::NetworkAccessDenied,
        ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe => NetError::ConnectionClosed,
        _ => NetError::ConnectionFailed,
    }
}

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Convert a connect-time IO error into a `NetError`.
    ///
    /// # Example
    /// ```ignore
    /// use streampool::base::context::IoResultExt;
    ///
    /// let stream = TcpStream::connect(addr).await.connect_context(addr)?;
    /// ```
    fn connect_context(self, endpoint: SocketAddr) -> Result<T, NetError>;

    /// Convert a DNS-time IO error into a `NetError`.
    fn dns_context(self, host: &str) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn connect_context(self, endpoint: SocketAddr) -> Result<T, NetError> {
        self.map_err(|e| {
            let error = map_io_error(&e);
            tracing::debug!(endpoint = %endpoint, io_error = %e, code = error.as_i32(), "connect failed");
            error
        })
    }

    fn dns_context(self, host: &str) -> Result<T, NetError> {
        self.map_err(|e| {
            tracing::debug!(host = %host, io_error = %e, "name resolution failed");
            match e.kind() {
                ErrorKind::TimedOut => NetError::DnsTimedOut,
                _ => NetError::NameNotResolved,
            }
        })
    }
}
