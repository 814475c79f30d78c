//! Async endpoint resolver using hickory-dns.
//!
//! AAAA and A queries run in parallel. Whichever answers first is published
//! right away so the pool can start connecting; the combined list (IPv6
//! first) follows when the other family answers. IP literals resolve to
//! themselves without a query.
//!
//! The shared resolver follows the system configuration, which is plain
//! DNS. A request's [`SecureDnsPolicy`] is therefore satisfied for
//! `Disable` and `BootstrapOnly`; `Allow` is not upgraded to DoH.
//!
//! [`SecureDnsPolicy`]: crate::socket::key::SecureDnsPolicy

use super::{EndpointUpdate, Resolving, ServiceEndpointRequest, ServiceEndpointResolver};
use crate::base::neterror::NetError;
use hickory_resolver::{
    config::{LookupIpStrategy, ResolverConfig},
    name_server::TokioConnectionProvider,
    TokioResolver,
};
use std::{
    net::{IpAddr, SocketAddr},
    sync::LazyLock,
};

/// Async resolver backed by hickory-dns.
///
/// The underlying resolver is lazily initialized on first use and shared
/// across all instances. It configures itself from the system's DNS
/// settings, falling back to defaults.
#[derive(Debug, Clone)]
pub struct HickoryResolver {
    resolver: &'static LazyLock<TokioResolver>,
}

impl HickoryResolver {
    pub fn new() -> Self {
        static RESOLVER: LazyLock<TokioResolver> = LazyLock::new(|| {
            let mut builder = match TokioResolver::builder_tokio() {
                Ok(builder) => {
                    tracing::debug!("Using system DNS configuration");
                    builder
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Failed to read system DNS config, using defaults"
                    );
                    TokioResolver::builder_with_config(
                        ResolverConfig::default(),
                        TokioConnectionProvider::default(),
                    )
                }
            };

            builder.options_mut().ip_strategy = LookupIpStrategy::Ipv4AndIpv6;

            builder.build()
        });

        Self { resolver: &RESOLVER }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge answers into a preference-ordered endpoint list.
fn merge(v6: &[IpAddr], v4: &[IpAddr], port: u16) -> Vec<SocketAddr> {
    v6.iter().chain(v4).map(|ip| SocketAddr::new(*ip, port)).collect()
}

impl ServiceEndpointResolver for HickoryResolver {
    fn resolve(&self, request: ServiceEndpointRequest) -> Resolving {
        let resolver = self.resolver;
        Box::pin(async move {
            let host = request.host().as_str().to_string();
            let port = request.port();
            if let Ok(ip) = host.parse::<IpAddr>() {
                request.publish(EndpointUpdate {
                    endpoints: vec![SocketAddr::new(ip, port)],
                    crypto_ready: true,
                });
                return Ok(());
            }
            tracing::debug!(
                host = %host,
                priority = %request.priority(),
                secure_dns_policy = ?request.secure_dns_policy(),
                "resolving via hickory-dns"
            );

            let v6_lookup = async {
                match resolver.ipv6_lookup(host.as_str()).await {
                    Ok(lookup) => lookup.iter().map(|aaaa| IpAddr::V6(aaaa.0)).collect(),
                    Err(e) => {
                        tracing::trace!(host = %host, error = %e, "AAAA lookup failed");
                        Vec::new()
                    }
                }
            };
            let v4_lookup = async {
                match resolver.ipv4_lookup(host.as_str()).await {
                    Ok(lookup) => lookup.iter().map(|a| IpAddr::V4(a.0)).collect(),
                    Err(e) => {
                        tracing::trace!(host = %host, error = %e, "A lookup failed");
                        Vec::new()
                    }
                }
            };
            tokio::pin!(v6_lookup, v4_lookup);

            let mut v6: Option<Vec<IpAddr>> = None;
            let mut v4: Option<Vec<IpAddr>> = None;
            while v6.is_none() || v4.is_none() {
                tokio::select! {
                    addrs = &mut v6_lookup, if v6.is_none() => v6 = Some(addrs),
                    addrs = &mut v4_lookup, if v4.is_none() => v4 = Some(addrs),
                }
                let endpoints =
                    merge(v6.as_deref().unwrap_or(&[]), v4.as_deref().unwrap_or(&[]), port);
                if endpoints.is_empty() {
                    continue;
                }
                let crypto_ready = v6.is_some() && v4.is_some();
                if !request.publish(EndpointUpdate { endpoints, crypto_ready }) {
                    tracing::trace!(host = %host, "resolution abandoned");
                    return Ok(());
                }
            }

            let count = v6.map_or(0, |a| a.len()) + v4.map_or(0, |a| a.len());
            if count == 0 {
                tracing::debug!(host = %host, "hickory-dns returned no addresses");
                return Err(NetError::NameNotResolved);
            }
            tracing::debug!(host = %host, count, "hickory-dns resolution complete");
            Ok(())
        })
    }
}
