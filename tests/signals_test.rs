//! Fatal Error and Signal Tests
//!
//! Covers:
//! - Certificate and client certificate errors latch the job
//! - IP address changes fail everything pending
//! - Security configuration changes flush idle streams

mod common;

use common::*;
use std::time::Duration;
use streampool::base::neterror::NetError;
use streampool::base::priority::RequestPriority;
use streampool::socket::key::HostPortPair;
use streampool::socket::{PoolConfig, SecurityConfigChange, StreamError};

#[tokio::test(start_paused = true)]
async fn test_certificate_error_ignores_later_failures() {
    let resolver = FakeResolver::new().host("a.test", &["2001:db8::1", "10.0.0.1"]);
    let connector = FakeConnector::new()
        .connect("[2001:db8::1]:443", Connect::After(Duration::from_millis(300)))
        .handshake("[2001:db8::1]:443", Handshake::CertError(NetError::CertAuthorityInvalid))
        .connect("10.0.0.1:443", Connect::FailAfter(Duration::from_millis(100), NetError::ConnectionRefused));
    let pool = pool(PoolConfig::default(), &resolver, &connector);
    let key = https_key("a.test");

    let r1 = pool.request_stream(key.clone(), RequestPriority::Medium);

    // The fallback attempt starts at 250ms and fails at 350ms, after the
    // certificate error at 300ms.
    tokio::time::sleep(Duration::from_millis(320)).await;
    assert!(r1.is_completed());
    assert_eq!(connector.connect_count(), 2);
    assert_eq!(pool.in_flight_attempt_count(&key), 1);

    // Requests made while the job is latched fail straight away.
    let r2 = pool.request_stream(key.clone(), RequestPriority::Highest);
    assert!(r2.is_completed());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(pool.in_flight_attempt_count(&key), 0);
    for request in [r1, r2] {
        match request.await.unwrap_err() {
            StreamError::CertificateError(info) => {
                assert_eq!(info.error, NetError::CertAuthorityInvalid);
                assert_eq!(info.endpoint, ep("[2001:db8::1]:443"));
                assert!(!info.cert_chain.is_empty());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(connector.connect_count(), 2);
}

#[tokio::test]
async fn test_client_certificate_needed_shared_by_queued_requests() {
    let resolver = FakeResolver::new().host("a.test", &["10.0.0.1", "10.0.0.2"]);
    let connector = FakeConnector::new().handshake("10.0.0.1:443", Handshake::ClientCertNeeded);
    let pool = pool(PoolConfig::new().max_streams_per_group(1), &resolver, &connector);
    let key = https_key("a.test");

    let r1 = pool.request_stream(key.clone(), RequestPriority::Medium);
    let r2 = pool.request_stream(key.clone(), RequestPriority::Medium);
    let e1 = r1.await.unwrap_err();
    let e2 = r2.await.unwrap_err();

    let (StreamError::ClientCertificateNeeded(i1), StreamError::ClientCertificateNeeded(i2)) = (&e1, &e2)
    else {
        panic!("unexpected outcomes: {e1:?} / {e2:?}");
    };
    assert_eq!(i1, i2);
    assert_eq!(i1.host_and_port, HostPortPair::new("a.test", 443));
    assert_eq!(e1.net_error(), NetError::SslClientAuthCertNeeded);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(connector.connects(), vec![ep("10.0.0.1:443")]);
}

#[tokio::test]
async fn test_ip_address_change_fails_pending_requests() {
    let resolver = FakeResolver::new()
        .host("a.test", &["10.0.0.1"])
        .host("b.test", &["10.0.0.2"])
        .host("c.test", &["10.0.0.3"]);
    let connector = FakeConnector::new()
        .connect("10.0.0.1:80", Connect::Hang)
        .handshake("10.0.0.2:443", Handshake::Hang);
    let pool = pool(PoolConfig::default(), &resolver, &connector);
    let (a, b, c) = (http_key("a.test"), https_key("b.test"), http_key("c.test"));

    let established = pool.request_stream(c.clone(), RequestPriority::Medium).await.unwrap();
    let ra = pool.request_stream(a.clone(), RequestPriority::Medium);
    let rb = pool.request_stream(b.clone(), RequestPriority::Medium);
    settle().await;
    assert_eq!(pool.in_flight_attempt_count(&a), 1);
    assert_eq!(pool.in_flight_attempt_count(&b), 1);

    pool.on_ip_address_changed();

    assert_eq!(pool.in_flight_attempt_count(&a), 0);
    assert_eq!(pool.in_flight_attempt_count(&b), 0);
    assert!(ra.await.unwrap_err().is_network_changed());
    assert!(rb.await.unwrap_err().is_network_changed());

    // Established streams are left alone.
    assert!(established.is_connected());
    assert_eq!(pool.handed_out_count(&c), 1);
    assert_eq!(pool.total_active_count(), 1);
}

#[tokio::test]
async fn test_network_change_replaces_unconsumed_fatal_error() {
    let resolver = FakeResolver::new().host("a.test", &["10.0.0.1"]);
    let connector =
        FakeConnector::new().handshake("10.0.0.1:443", Handshake::CertError(NetError::CertDateInvalid));
    let pool = pool(PoolConfig::default(), &resolver, &connector);

    let request = pool.request_stream(https_key("a.test"), RequestPriority::Medium);
    settle().await;
    assert!(request.is_completed());

    pool.on_ip_address_changed();
    let err = request.await.unwrap_err();
    assert!(err.is_network_changed());
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn test_consumed_fatal_error_is_final() {
    let resolver = FakeResolver::new().host("a.test", &["10.0.0.1"]);
    let connector =
        FakeConnector::new().handshake("10.0.0.1:443", Handshake::CertError(NetError::CertDateInvalid));
    let pool = pool(PoolConfig::default(), &resolver, &connector);

    let err = pool.request_stream(https_key("a.test"), RequestPriority::Medium).await.unwrap_err();
    pool.on_ip_address_changed();
    assert_eq!(err.net_error(), NetError::CertDateInvalid);
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_security_change_flushes_idle_streams() {
    let resolver = FakeResolver::new().host("a.test", &["10.0.0.1"]).host("b.test", &["10.0.0.2"]);
    let connector = FakeConnector::new();
    let pool = pool(PoolConfig::default(), &resolver, &connector);
    let (a, b) = (https_key("a.test"), https_key("b.test"));

    let idle = pool.request_stream(a.clone(), RequestPriority::Medium).await.unwrap();
    let active = pool.request_stream(a.clone(), RequestPriority::Medium).await.unwrap();
    let other = pool.request_stream(b.clone(), RequestPriority::Medium).await.unwrap();
    idle.release();
    other.release();
    assert_eq!(pool.group_idle_count(&a), 1);
    assert_eq!(pool.generation(), 0);

    pool.on_security_config_changed(SecurityConfigChange::Servers(vec![HostPortPair::new(
        "a.test", 443,
    )]));
    assert_eq!(pool.generation(), 1);
    assert_eq!(pool.group_idle_count(&a), 0);
    assert_eq!(pool.group_idle_count(&b), 1);
    assert!(active.is_connected());
    assert_eq!(pool.handed_out_count(&a), 1);

    // Created before the change: never pooled again.
    active.release();
    assert_eq!(pool.group_idle_count(&a), 0);
    assert_eq!(pool.group_active_count(&a), 0);

    let fresh = pool.request_stream(a.clone(), RequestPriority::Medium).await.unwrap();
    assert!(!fresh.is_reused());
    assert_eq!(fresh.generation(), 1);
    assert_eq!(connector.connect_count(), 4);
}

#[tokio::test]
async fn test_security_change_for_all_servers() {
    let resolver = FakeResolver::new();
    let connector = FakeConnector::new();
    let pool = pool(PoolConfig::default(), &resolver, &connector);

    for host in ["a.test", "b.test"] {
        let (socket, _peer) = duplex_socket();
        pool.add_idle_stream(https_key(host), socket, ep("10.0.0.1:443")).unwrap();
    }
    pool.on_security_config_changed(SecurityConfigChange::All);
    assert_eq!(pool.idle_stream_count(), 0);
    assert_eq!(pool.group_count(), 0);
}
