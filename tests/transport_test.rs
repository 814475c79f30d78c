//! End-to-end tests over real TCP with the default connector.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use std::sync::Arc;
use streampool::base::neterror::NetError;
use streampool::base::priority::RequestPriority;
use streampool::dns::StaticResolver;
use boring::asn1::Asn1Time;
use boring::bn::BigNum;
use boring::ec::{EcGroup, EcKey};
use boring::hash::MessageDigest;
use boring::nid::Nid;
use boring::pkey::PKey;
use boring::ssl::{SslAcceptor, SslMethod, SslVerifyMode, SslVersion};
use boring::stack::Stack;
use boring::x509::{X509Name, X509};
use streampool::socket::key::{HostPortPair, Scheme, StreamKey};
use streampool::socket::tls::TlsConfig;
use streampool::socket::{PoolConfig, StreamError, StreamPool, TcpTlsConnector};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn local_pool() -> StreamPool {
    let resolver = StaticResolver::new().with_host("local.test", vec!["127.0.0.1".parse().unwrap()]);
    StreamPool::with_parts(
        PoolConfig::default(),
        Arc::new(resolver),
        Arc::new(TcpTlsConnector::new().unwrap()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_hyper_request_over_pooled_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let mut read = 0;
        while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf[read..]).await.unwrap();
            if n == 0 {
                return;
            }
            read += n;
        }
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
            .await
            .unwrap();
    });

    let pool = local_pool();
    let key = StreamKey::new(Scheme::Http, "local.test", port);
    let stream = pool.request_stream(key.clone(), RequestPriority::Medium).await.unwrap();
    assert_eq!(stream.endpoint().port(), port);
    assert_eq!(pool.handed_out_count(&key), 1);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(stream).await.unwrap();
    tokio::spawn(conn);

    let request = http::Request::builder()
        .uri("/")
        .header("host", "local.test")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn test_refused_connection_fails_request() {
    // Bind then drop to get a port nobody listens on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let pool = local_pool();
    let err = pool
        .request_stream(StreamKey::new(Scheme::Http, "local.test", port), RequestPriority::Medium)
        .await
        .unwrap_err();
    assert_eq!(err.net_error(), NetError::ConnectionRefused);
}

#[tokio::test]
async fn test_ip_literal_resolves_to_itself() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _held = listener.accept().await;
        std::future::pending::<()>().await;
    });

    let pool = local_pool();
    let key = StreamKey::new(Scheme::Http, "127.0.0.1", port);
    let stream = pool.request_stream(key, RequestPriority::Medium).await.unwrap();
    assert!(stream.is_connected());
    assert_eq!(stream.endpoint(), format!("127.0.0.1:{port}").parse().unwrap());
}

fn x509_name(common_name: &str) -> X509Name {
    let mut name = X509Name::builder().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    name.build()
}

/// TLS server that insists on a client certificate issued by "Test CA".
fn client_auth_acceptor() -> SslAcceptor {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
    let subject = x509_name("local.test");

    let mut cert = X509::builder().unwrap();
    cert.set_version(2).unwrap();
    cert.set_serial_number(&BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap()).unwrap();
    cert.set_subject_name(&subject).unwrap();
    cert.set_issuer_name(&subject).unwrap();
    cert.set_pubkey(&key).unwrap();
    cert.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    cert.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
    cert.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = cert.build();

    let mut authorities = Stack::new().unwrap();
    authorities.push(x509_name("Test CA")).unwrap();

    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).unwrap();
    acceptor.set_private_key(&key).unwrap();
    acceptor.set_certificate(&cert).unwrap();
    acceptor.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    acceptor.set_client_ca_list(authorities);
    acceptor.build()
}

#[tokio::test]
async fn test_server_requesting_client_certificate() {
    for version in [SslVersion::TLS1_3, SslVersion::TLS1_2] {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = client_auth_acceptor();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let _ = tokio_boring::accept(&acceptor, socket).await;
        });

        let tls = TlsConfig { max_version: Some(version), verify_peer: false, ..TlsConfig::default() };
        let resolver =
            StaticResolver::new().with_host("local.test", vec!["127.0.0.1".parse().unwrap()]);
        let pool = StreamPool::with_parts(
            PoolConfig::default(),
            Arc::new(resolver),
            Arc::new(TcpTlsConnector::with_tls_config(&tls).unwrap()),
        )
        .unwrap();

        let key = StreamKey::new(Scheme::Https, "local.test", port);
        let err = pool.request_stream(key, RequestPriority::Medium).await.unwrap_err();
        let StreamError::ClientCertificateNeeded(info) = &err else {
            panic!("unexpected outcome over {version:?}: {err:?}");
        };
        assert_eq!(info.host_and_port, HostPortPair::new("local.test", port));
        assert_eq!(info.cert_authorities, vec![x509_name("Test CA").to_der().unwrap()]);
        assert_eq!(err.net_error(), NetError::SslClientAuthCertNeeded);
    }
}

#[tokio::test]
async fn test_default_pool_reaches_ip_literal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _held = listener.accept().await;
        std::future::pending::<()>().await;
    });

    let pool = StreamPool::new().unwrap();
    let key = StreamKey::new(Scheme::Http, "127.0.0.1", port);
    let stream = pool.request_stream(key, RequestPriority::Medium).await.unwrap();
    assert!(stream.is_connected());
    assert_eq!(stream.endpoint(), format!("127.0.0.1:{port}").parse().unwrap());
}
