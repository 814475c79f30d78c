//! Core service-endpoint resolution types and traits.
//!
//! Unlike a one-shot host lookup, a [`ServiceEndpointResolver`] publishes
//! endpoints incrementally through its request so connection attempts can
//! start before every address family has answered.

use crate::base::neterror::NetError;
use crate::base::priority::RequestPriority;
use crate::socket::key::SecureDnsPolicy;
use futures::future::BoxFuture;
use std::{collections::HashMap, fmt, net::SocketAddr, sync::Arc};
use tokio::sync::{mpsc, watch};

/// A domain name to resolve into IP addresses.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    /// Creates a new [`Name`] from any string-like type.
    #[inline]
    pub fn new(host: impl Into<Box<str>>) -> Self {
        Self { host: host.into() }
    }

    /// View the hostname as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.host
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value)
    }
}

impl From<String> for Name {
    fn from(value: String) -> Self {
        Name::new(value)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.host, f)
    }
}

/// Snapshot of the endpoints known so far.
///
/// Each update replaces the previous list. `crypto_ready` reports that
/// everything needed to start a TLS handshake (e.g. HTTPS records) is known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointUpdate {
    pub endpoints: Vec<SocketAddr>,
    pub crypto_ready: bool,
}

/// One resolution handed to a resolver.
///
/// Chromium equivalent: `HostResolver::ServiceEndpointRequest`
pub struct ServiceEndpointRequest {
    host: Name,
    port: u16,
    secure_dns_policy: SecureDnsPolicy,
    priority: watch::Receiver<RequestPriority>,
    updates: mpsc::UnboundedSender<EndpointUpdate>,
}

impl ServiceEndpointRequest {
    pub fn new(
        host: Name,
        port: u16,
        secure_dns_policy: SecureDnsPolicy,
        priority: watch::Receiver<RequestPriority>,
        updates: mpsc::UnboundedSender<EndpointUpdate>,
    ) -> Self {
        Self { host, port, secure_dns_policy, priority, updates }
    }

    pub fn host(&self) -> &Name {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn secure_dns_policy(&self) -> SecureDnsPolicy {
        self.secure_dns_policy
    }

    /// Current priority of the request.
    pub fn priority(&self) -> RequestPriority {
        *self.priority.borrow()
    }

    /// Wait for the next priority change. Returns `None` once the
    /// requesting job is gone.
    pub async fn priority_changed(&mut self) -> Option<RequestPriority> {
        self.priority.changed().await.ok()?;
        Some(*self.priority.borrow_and_update())
    }

    /// Publish the endpoints known so far. Returns false if nobody listens
    /// any more, in which case the resolver may stop.
    pub fn publish(&self, update: EndpointUpdate) -> bool {
        self.updates.send(update).is_ok()
    }
}

impl fmt::Debug for ServiceEndpointRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEndpointRequest")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("priority", &self.priority())
            .finish_non_exhaustive()
    }
}

/// Alias for the `Future` type returned by a resolver. It completes when
/// resolution is finished; endpoints travel through the request.
pub type Resolving = BoxFuture<'static, Result<(), NetError>>;

/// Trait for incremental endpoint resolution.
///
/// Implementations must be thread-safe and order endpoints by preference
/// (IPv6 before IPv4 by convention).
pub trait ServiceEndpointResolver: Send + Sync {
    fn resolve(&self, request: ServiceEndpointRequest) -> Resolving;
}

/// Blanket implementation for Arc-wrapped resolvers.
impl<R: ServiceEndpointResolver + ?Sized> ServiceEndpointResolver for Arc<R> {
    fn resolve(&self, request: ServiceEndpointRequest) -> Resolving {
        (**self).resolve(request)
    }
}

/// Stable sort placing IPv6 endpoints before IPv4 ones.
pub fn prefer_ipv6(endpoints: &mut [SocketAddr]) {
    endpoints.sort_by_key(|addr| addr.is_ipv4());
}

/// Resolver answering from a fixed host table.
///
/// Hosts missing from the table go to the fallback resolver when there is
/// one, and fail with `NameNotResolved` otherwise. IP literals always
/// resolve to themselves.
#[derive(Clone, Default)]
pub struct StaticResolver {
    overrides: Arc<HashMap<String, Vec<std::net::IpAddr>>>,
    fallback: Option<Arc<dyn ServiceEndpointResolver>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host entry.
    pub fn with_host(mut self, host: impl Into<String>, addrs: Vec<std::net::IpAddr>) -> Self {
        Arc::make_mut(&mut self.overrides).insert(host.into(), addrs);
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn ServiceEndpointResolver>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Returns the number of configured overrides.
    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }
}

impl ServiceEndpointResolver for StaticResolver {
    fn resolve(&self, request: ServiceEndpointRequest) -> Resolving {
        let port = request.port();
        let addrs = match request.host().as_str().parse::<std::net::IpAddr>() {
            Ok(ip) => Some(vec![ip]),
            Err(_) => self.overrides.get(request.host().as_str()).cloned(),
        };
        match (addrs, &self.fallback) {
            (Some(addrs), _) => Box::pin(async move {
                let mut endpoints: Vec<SocketAddr> =
                    addrs.into_iter().map(|ip| SocketAddr::new(ip, port)).collect();
                if endpoints.is_empty() {
                    return Err(NetError::NameNotResolved);
                }
                prefer_ipv6(&mut endpoints);
                request.publish(EndpointUpdate { endpoints, crypto_ready: true });
                Ok(())
            }),
            (None, Some(fallback)) => fallback.resolve(request),
            (None, None) => {
                tracing::debug!(host = %request.host(), "no static entry");
                Box::pin(std::future::ready(Err(NetError::NameNotResolved)))
            }
        }
    }
}

impl fmt::Debug for StaticResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticResolver")
            .field("override_count", &self.overrides.len())
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}
