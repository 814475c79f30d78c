//! Socket abstraction and the pooled stream handle.
//!
//! [`StreamSocket`] lets the pool treat plain TCP, TLS over TCP and in-memory
//! transports uniformly. [`PooledStream`] is what a stream request resolves
//! to: it owns one slot of its group until it is released or dropped.
//!
//! Based on Chromium's `StreamSocket` interface and `ClientSocketHandle`.

use crate::socket::key::StreamKey;
use crate::socket::pool::PoolInner;
use std::fmt;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tokio_boring::SslStream;

/// A trait for any socket the pool can hold.
///
/// Chromium equivalent: `net::StreamSocket`
pub trait StreamSocket: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {
    /// Returns true if the socket is still connected.
    fn is_connected(&self) -> bool {
        true
    }

    /// Returns true if the socket is connected and has no unread data.
    /// Matches Chromium's IsConnectedAndIdle().
    fn is_connected_and_idle(&self) -> bool {
        self.is_connected()
    }
}

impl StreamSocket for TcpStream {
    fn is_connected(&self) -> bool {
        // peer_addr() returns Err once the socket is disconnected
        self.peer_addr().is_ok()
    }

    fn is_connected_and_idle(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        // Any readable byte (or EOF) on an idle socket makes it unusable, so
        // consuming it here is harmless: the caller discards the socket.
        let mut buf = [0u8; 1];
        match self.try_read(&mut buf) {
            Ok(_) => false,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }
}

impl<S: StreamSocket> StreamSocket for SslStream<S> {
    fn is_connected(&self) -> bool {
        self.get_ref().is_connected()
    }

    fn is_connected_and_idle(&self) -> bool {
        self.get_ref().is_connected_and_idle()
    }
}

// In-memory transports used by custom connectors and tests.
impl StreamSocket for DuplexStream {}

/// A boxed dynamic StreamSocket.
pub struct BoxedSocket {
    inner: Pin<Box<dyn StreamSocket>>,
}

impl BoxedSocket {
    /// Create a new BoxedSocket from any StreamSocket.
    pub fn new<S: StreamSocket>(socket: S) -> Self {
        Self { inner: Box::pin(socket) }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn is_connected_and_idle(&self) -> bool {
        self.inner.is_connected_and_idle()
    }
}

impl fmt::Debug for BoxedSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxedSocket").finish_non_exhaustive()
    }
}

impl AsyncRead for BoxedSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for BoxedSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.inner.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_shutdown(cx)
    }
}

impl StreamSocket for BoxedSocket {
    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn is_connected_and_idle(&self) -> bool {
        self.inner.is_connected_and_idle()
    }
}

/// An established stream handed out by the pool.
///
/// Call [`PooledStream::release`] to return it for reuse. Dropping it closes
/// the transport and frees its slot, which may unblock a queued request.
pub struct PooledStream {
    socket: Option<BoxedSocket>,
    key: StreamKey,
    endpoint: SocketAddr,
    generation: u64,
    reused: bool,
    pool: Weak<PoolInner>,
}

impl PooledStream {
    pub(crate) fn new(
        socket: BoxedSocket,
        key: StreamKey,
        endpoint: SocketAddr,
        generation: u64,
        reused: bool,
        pool: Weak<PoolInner>,
    ) -> Self {
        Self { socket: Some(socket), key, endpoint, generation, reused, pool }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// The endpoint this stream is connected to.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// True if the stream came from the idle set rather than a fresh attempt.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Security-configuration generation the stream was created under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_connected(&self) -> bool {
        self.socket.as_ref().is_some_and(BoxedSocket::is_connected)
    }

    /// Return the stream to its group for reuse.
    ///
    /// The stream is only kept when it is still connected, idle, and was
    /// created under the current security configuration.
    pub fn release(mut self) {
        self.return_to_pool(true);
    }

    fn return_to_pool(&mut self, reusable: bool) {
        let Some(socket) = self.socket.take() else {
            return;
        };
        match self.pool.upgrade() {
            Some(pool) => {
                pool.release_stream(&self.key, socket, self.endpoint, self.generation, reusable)
            }
            None => tracing::trace!(key = %self.key, "pool gone, closing stream"),
        }
    }

    fn socket_mut(&mut self) -> io::Result<&mut BoxedSocket> {
        self.socket.as_mut().ok_or_else(|| io::Error::from(ErrorKind::NotConnected))
    }
}

impl Drop for PooledStream {
    fn drop(&mut self) {
        self.return_to_pool(false);
    }
}

impl fmt::Debug for PooledStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledStream")
            .field("key", &self.key)
            .field("endpoint", &self.endpoint)
            .field("generation", &self.generation)
            .field("reused", &self.reused)
            .finish()
    }
}

impl AsyncRead for PooledStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.socket_mut() {
            Ok(socket) => Pin::new(socket).poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for PooledStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.socket_mut() {
            Ok(socket) => Pin::new(socket).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.socket_mut() {
            Ok(socket) => Pin::new(socket).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.socket_mut() {
            Ok(socket) => Pin::new(socket).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

// Lets a pooled stream drive `hyper::client::conn` directly.
impl hyper::rt::Read for PooledStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        // SAFETY: only initialized bytes are reported back through advance()
        let unfilled = unsafe { buf.as_mut() };
        let mut read_buf = ReadBuf::uninit(unfilled);
        match AsyncRead::poll_read(self.as_mut(), cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let n = read_buf.filled().len();
                unsafe { buf.advance(n) };
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl hyper::rt::Write for PooledStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        <Self as AsyncWrite>::poll_write(self, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        <Self as AsyncWrite>::poll_flush(self, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        <Self as AsyncWrite>::poll_shutdown(self, cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_boxed_socket_forwards_io() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut socket = BoxedSocket::new(client);
        assert!(socket.is_connected());

        socket.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_tcp_liveness_checks() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        assert!(client.is_connected());
        assert!(client.is_connected_and_idle());

        drop(server);
        // Give the FIN a moment to arrive.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!client.is_connected_and_idle());
    }

    #[tokio::test]
    async fn test_detached_stream_reports_not_connected() {
        let (client, _server) = tokio::io::duplex(64);
        let key = StreamKey::new(crate::socket::key::Scheme::Http, "example.com", 80);
        let mut stream = PooledStream::new(
            BoxedSocket::new(client),
            key,
            "127.0.0.1:80".parse().unwrap(),
            0,
            false,
            Weak::new(),
        );
        assert!(stream.is_connected());
        stream.return_to_pool(false);
        assert!(!stream.is_connected());

        let mut buf = [0u8; 1];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }
}
