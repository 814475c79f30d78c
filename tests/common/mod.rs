//! Scripted resolver and connector for pool tests.
#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use streampool::base::neterror::NetError;
use streampool::base::priority::RequestPriority;
use streampool::dns::{EndpointUpdate, Resolving, ServiceEndpointRequest, ServiceEndpointResolver};
use streampool::socket::connector::{Connecting, Connector, HandshakeFailure, Handshaking};
use streampool::socket::key::{Scheme, StreamKey};
use streampool::socket::outcome::{CertificateErrorInfo, SslCertRequestInfo};
use streampool::socket::{BoxedSocket, PoolConfig, StreamPool};
use tokio::io::DuplexStream;
use tokio::sync::oneshot;

pub fn ep(addr: &str) -> SocketAddr {
    addr.parse().unwrap()
}

pub fn ip(addr: &str) -> IpAddr {
    addr.parse().unwrap()
}

pub fn http_key(host: &str) -> StreamKey {
    StreamKey::new(Scheme::Http, host, 80)
}

pub fn https_key(host: &str) -> StreamKey {
    StreamKey::new(Scheme::Https, host, 443)
}

pub fn pool(config: PoolConfig, resolver: &FakeResolver, connector: &FakeConnector) -> StreamPool {
    StreamPool::with_parts(config, Arc::new(resolver.clone()), Arc::new(connector.clone())).unwrap()
}

/// Let spawned tasks run without moving the clock.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// An in-memory socket whose peer half is kept alive by the caller.
pub fn duplex_socket() -> (BoxedSocket, DuplexStream) {
    let (client, server) = tokio::io::duplex(1024);
    (BoxedSocket::new(client), server)
}

// ============================================================================
// Resolver
// ============================================================================

#[derive(Clone)]
enum Rule {
    Immediate(Vec<IpAddr>),
    Fail(NetError),
    Manual(Arc<ManualResolution>),
}

/// A resolution the test drives by hand.
#[derive(Default)]
pub struct ManualResolution {
    request: Mutex<Option<ServiceEndpointRequest>>,
    done: Mutex<Option<oneshot::Sender<Result<(), NetError>>>>,
}

impl ManualResolution {
    pub fn is_started(&self) -> bool {
        self.request.lock().is_some()
    }

    pub fn publish(&self, endpoints: Vec<SocketAddr>, crypto_ready: bool) {
        if let Some(request) = self.request.lock().as_ref() {
            request.publish(EndpointUpdate { endpoints, crypto_ready });
        }
    }

    pub fn finish(&self, result: Result<(), NetError>) {
        if let Some(done) = self.done.lock().take() {
            let _ = done.send(result);
        }
    }

    pub fn priority(&self) -> Option<RequestPriority> {
        self.request.lock().as_ref().map(ServiceEndpointRequest::priority)
    }
}

#[derive(Clone, Default)]
pub struct FakeResolver {
    rules: Arc<Mutex<HashMap<String, Rule>>>,
    resolutions: Arc<Mutex<Vec<String>>>,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(self, host: &str, addrs: &[&str]) -> Self {
        let addrs = addrs.iter().map(|a| ip(a)).collect();
        self.rules.lock().insert(host.to_string(), Rule::Immediate(addrs));
        self
    }

    pub fn fail(self, host: &str, error: NetError) -> Self {
        self.rules.lock().insert(host.to_string(), Rule::Fail(error));
        self
    }

    pub fn manual(&self, host: &str) -> Arc<ManualResolution> {
        let manual = Arc::new(ManualResolution::default());
        self.rules.lock().insert(host.to_string(), Rule::Manual(manual.clone()));
        manual
    }

    /// Hosts resolved so far, in order.
    pub fn resolutions(&self) -> Vec<String> {
        self.resolutions.lock().clone()
    }
}

impl ServiceEndpointResolver for FakeResolver {
    fn resolve(&self, request: ServiceEndpointRequest) -> Resolving {
        let host = request.host().as_str().to_string();
        self.resolutions.lock().push(host.clone());
        let rule = self.rules.lock().get(&host).cloned();
        let port = request.port();
        match rule {
            Some(Rule::Immediate(addrs)) => Box::pin(async move {
                let endpoints = addrs.into_iter().map(|ip| SocketAddr::new(ip, port)).collect();
                request.publish(EndpointUpdate { endpoints, crypto_ready: true });
                Ok(())
            }),
            Some(Rule::Fail(error)) => Box::pin(async move { Err(error) }),
            Some(Rule::Manual(manual)) => {
                let (tx, rx) = oneshot::channel();
                *manual.request.lock() = Some(request);
                *manual.done.lock() = Some(tx);
                Box::pin(async move { rx.await.unwrap_or(Err(NetError::Aborted)) })
            }
            None => Box::pin(async { Err(NetError::NameNotResolved) }),
        }
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Scripted transport connect.
#[derive(Clone, Debug)]
pub enum Connect {
    Ok,
    After(Duration),
    Fail(NetError),
    FailAfter(Duration, NetError),
    Hang,
}

/// Scripted security handshake.
#[derive(Clone, Debug)]
pub enum Handshake {
    Ok,
    After(Duration),
    Fail(NetError),
    CertError(NetError),
    ClientCertNeeded,
    Hang,
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    rules: Arc<Mutex<HashMap<SocketAddr, (Connect, Handshake)>>>,
    connects: Arc<Mutex<Vec<SocketAddr>>>,
    handshakes: Arc<Mutex<Vec<SocketAddr>>>,
    peers: Arc<Mutex<Vec<DuplexStream>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(self, endpoint: &str, connect: Connect) -> Self {
        let endpoint = ep(endpoint);
        let mut rules = self.rules.lock();
        let entry = rules.entry(endpoint).or_insert((Connect::Ok, Handshake::Ok));
        entry.0 = connect;
        drop(rules);
        self
    }

    pub fn handshake(self, endpoint: &str, handshake: Handshake) -> Self {
        let endpoint = ep(endpoint);
        let mut rules = self.rules.lock();
        let entry = rules.entry(endpoint).or_insert((Connect::Ok, Handshake::Ok));
        entry.1 = handshake;
        drop(rules);
        self
    }

    /// Endpoints connected to so far, in order.
    pub fn connects(&self) -> Vec<SocketAddr> {
        self.connects.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }

    pub fn handshake_count(&self) -> usize {
        self.handshakes.lock().len()
    }

    fn rule(&self, endpoint: SocketAddr) -> (Connect, Handshake) {
        self.rules.lock().get(&endpoint).cloned().unwrap_or((Connect::Ok, Handshake::Ok))
    }
}

impl Connector for FakeConnector {
    fn connect(&self, _key: &StreamKey, endpoint: SocketAddr) -> Connecting {
        self.connects.lock().push(endpoint);
        let (connect, _) = self.rule(endpoint);
        let peers = self.peers.clone();
        Box::pin(async move {
            match connect {
                Connect::Ok => {}
                Connect::After(delay) => tokio::time::sleep(delay).await,
                Connect::Fail(error) => return Err(error),
                Connect::FailAfter(delay, error) => {
                    tokio::time::sleep(delay).await;
                    return Err(error);
                }
                Connect::Hang => futures::future::pending::<()>().await,
            }
            let (socket, peer) = duplex_socket();
            peers.lock().push(peer);
            Ok(socket)
        })
    }

    fn handshake(&self, key: &StreamKey, endpoint: SocketAddr, socket: BoxedSocket) -> Handshaking {
        self.handshakes.lock().push(endpoint);
        let (_, handshake) = self.rule(endpoint);
        let host_and_port = key.destination().clone();
        Box::pin(async move {
            match handshake {
                Handshake::Ok => Ok(socket),
                Handshake::After(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(socket)
                }
                Handshake::Fail(error) => Err(HandshakeFailure::Error(error)),
                Handshake::CertError(error) => Err(HandshakeFailure::Certificate(CertificateErrorInfo {
                    error,
                    endpoint,
                    cert_chain: vec![vec![0x30, 0x82, 0x01]],
                    detail: "unable to get local issuer certificate".into(),
                })),
                Handshake::ClientCertNeeded => {
                    Err(HandshakeFailure::ClientCertificateNeeded(SslCertRequestInfo {
                        host_and_port,
                        cert_authorities: vec![b"CN=Test CA".to_vec()],
                    }))
                }
                Handshake::Hang => futures::future::pending().await,
            }
        })
    }
}
