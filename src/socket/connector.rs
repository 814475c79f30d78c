//! Transport and security handshake for a single endpoint.
//!
//! The pool drives attempts through the [`Connector`] seam: first
//! [`Connector::connect`] for the transport, then, for secure schemes,
//! [`Connector::handshake`] on the connected socket. [`TcpTlsConnector`] is
//! the default implementation (tokio TCP plus BoringSSL).

use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::socket::key::StreamKey;
use crate::socket::outcome::{CertificateErrorInfo, SslCertRequestInfo};
use crate::socket::stream::BoxedSocket;
use crate::socket::tls::TlsConfig;
use boring::ex_data::Index;
use boring::ssl::{Ssl, SslConnector, SslRef, SslVerifyMode};
use boring::stack::StackRef;
use boring::x509::X509Name;
use foreign_types::ForeignTypeRef;
use futures::future::BoxFuture;
use std::ffi::{c_int, c_void};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpStream;

pub type Connecting = BoxFuture<'static, Result<BoxedSocket, NetError>>;
pub type Handshaking = BoxFuture<'static, Result<BoxedSocket, HandshakeFailure>>;

/// Why a security handshake did not produce a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// Ordinary failure; the next endpoint may still succeed.
    Error(NetError),
    /// The server certificate was rejected.
    Certificate(CertificateErrorInfo),
    /// The server requires a client certificate.
    ClientCertificateNeeded(SslCertRequestInfo),
}

impl From<NetError> for HandshakeFailure {
    fn from(error: NetError) -> Self {
        HandshakeFailure::Error(error)
    }
}

/// Establishes transports and runs security handshakes.
///
/// Chromium equivalent: the transport/SSL connect job factories.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, key: &StreamKey, endpoint: SocketAddr) -> Connecting;

    fn handshake(&self, key: &StreamKey, endpoint: SocketAddr, socket: BoxedSocket)
        -> Handshaking;
}

/// Plain TCP connect followed by a BoringSSL handshake.
#[derive(Clone)]
pub struct TcpTlsConnector {
    tls: SslConnector,
}

impl TcpTlsConnector {
    pub fn new() -> Result<Self, NetError> {
        Self::with_tls_config(&TlsConfig::default())
    }

    pub fn with_tls_config(config: &TlsConfig) -> Result<Self, NetError> {
        cert_request_index()?;
        let builder = config.connector_builder()?;
        // SAFETY: the context is owned by `builder` and the callback takes
        // no argument.
        unsafe {
            boring_sys::SSL_CTX_set_cert_cb(
                builder.as_ptr(),
                Some(client_cert_requested),
                std::ptr::null_mut(),
            );
        }
        Ok(Self { tls: builder.build() })
    }
}

/// Slot on a handshake's `Ssl` holding the DER-encoded certificate
/// authorities of a client certificate request.
fn cert_request_index() -> Result<Index<Ssl, Vec<Vec<u8>>>, NetError> {
    static INDEX: OnceLock<Index<Ssl, Vec<Vec<u8>>>> = OnceLock::new();
    if let Some(index) = INDEX.get() {
        return Ok(*index);
    }
    let index = Ssl::new_ex_index().map_err(|_| NetError::SslProtocolError)?;
    Ok(*INDEX.get_or_init(|| index))
}

/// Certificate selection callback. BoringSSL only calls it when the server
/// sent a CertificateRequest; no client certificate is configured, so the
/// handshake is aborted and the request's authorities are kept on the `Ssl`.
unsafe extern "C" fn client_cert_requested(ssl: *mut boring_sys::SSL, _arg: *mut c_void) -> c_int {
    // SAFETY: BoringSSL passes the live handshake, and the client CA list
    // is valid for the duration of this callback.
    unsafe {
        let list = boring_sys::SSL_get_client_CA_list(ssl);
        let authorities = if list.is_null() {
            Vec::new()
        } else {
            StackRef::<X509Name>::from_ptr(list)
                .iter()
                .filter_map(|name| name.to_der().ok())
                .collect()
        };
        if let Ok(index) = cert_request_index() {
            SslRef::from_ptr_mut(ssl).set_ex_data(index, authorities);
        }
    }
    0
}

/// Authorities recorded by [`client_cert_requested`], if the server asked
/// for a client certificate.
fn client_cert_request(ssl: &SslRef) -> Option<Vec<Vec<u8>>> {
    let index = cert_request_index().ok()?;
    ssl.ex_data(index).cloned()
}

impl std::fmt::Debug for TcpTlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTlsConnector").finish_non_exhaustive()
    }
}

impl Connector for TcpTlsConnector {
    fn connect(&self, key: &StreamKey, endpoint: SocketAddr) -> Connecting {
        let host = key.host().to_string();
        Box::pin(async move {
            tracing::trace!(host = %host, endpoint = %endpoint, "tcp connect");
            let stream = TcpStream::connect(endpoint).await.connect_context(endpoint)?;
            // Latency matters more than throughput for request/response traffic.
            let _ = stream.set_nodelay(true);
            Ok(BoxedSocket::new(stream))
        })
    }

    fn handshake(
        &self,
        key: &StreamKey,
        endpoint: SocketAddr,
        socket: BoxedSocket,
    ) -> Handshaking {
        let tls = self.tls.clone();
        let host = key.host().to_string();
        let host_and_port = key.destination().clone();
        Box::pin(async move {
            let mut config = tls.configure().map_err(|_| NetError::SslProtocolError)?;
            if !TlsConfig::should_set_sni(&host) {
                config.set_use_server_name_indication(false);
                config.set_verify_hostname(false);
            }

            match tokio_boring::connect(config, &host, socket).await {
                Ok(stream) => {
                    tracing::trace!(host = %host, endpoint = %endpoint, "tls handshake complete");
                    Ok(BoxedSocket::new(stream))
                }
                Err(err) => {
                    if let Some(cert_authorities) = err.ssl().and_then(client_cert_request) {
                        tracing::debug!(host = %host, authorities = cert_authorities.len(), "server requested a client certificate");
                        return Err(HandshakeFailure::ClientCertificateNeeded(SslCertRequestInfo {
                            host_and_port,
                            cert_authorities,
                        }));
                    }
                    if let Some(info) = err.ssl().and_then(|ssl| certificate_error(ssl, endpoint)) {
                        tracing::debug!(host = %host, error = %info.error, detail = %info.detail, "certificate rejected");
                        return Err(HandshakeFailure::Certificate(info));
                    }
                    let error = match err.as_io_error() {
                        Some(io) => crate::base::context::map_io_error(io),
                        None => NetError::SslProtocolError,
                    };
                    tracing::debug!(host = %host, endpoint = %endpoint, error = %error, "tls handshake failed");
                    Err(HandshakeFailure::Error(error))
                }
            }
        })
    }
}

/// Inspect a failed handshake for a certificate verification failure.
fn certificate_error(ssl: &SslRef, endpoint: SocketAddr) -> Option<CertificateErrorInfo> {
    // Unverified handshakes still record a verify result.
    if !ssl.verify_mode().contains(SslVerifyMode::PEER) {
        return None;
    }
    let verify_error = ssl.verify_result().err()?;
    let cert_chain = ssl
        .peer_cert_chain()
        .map(|chain| chain.iter().filter_map(|cert| cert.to_der().ok()).collect())
        .unwrap_or_default();
    Some(CertificateErrorInfo {
        error: map_verify_error(verify_error.as_raw()),
        endpoint,
        cert_chain,
        detail: verify_error.error_string().to_string(),
    })
}

/// Map an X509_V_ERR_* code onto the matching certificate error.
fn map_verify_error(code: i32) -> NetError {
    match code {
        // CERT_NOT_YET_VALID, CERT_HAS_EXPIRED
        9 | 10 => NetError::CertDateInvalid,
        // UNABLE_TO_GET_ISSUER_CERT, DEPTH_ZERO_SELF_SIGNED_CERT,
        // SELF_SIGNED_CERT_IN_CHAIN, UNABLE_TO_GET_ISSUER_CERT_LOCALLY,
        // UNABLE_TO_VERIFY_LEAF_SIGNATURE
        2 | 18 | 19 | 20 | 21 => NetError::CertAuthorityInvalid,
        // CERT_REVOKED
        23 => NetError::CertRevoked,
        // HOSTNAME_MISMATCH
        62 => NetError::CertCommonNameInvalid,
        _ => NetError::CertInvalid,
    }
}
