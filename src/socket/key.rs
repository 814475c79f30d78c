//! Destination identity for stream pooling.
//!
//! A [`StreamKey`] names everything that must match for two requests to share
//! established streams: the scheme/host/port plus the privacy and
//! partitioning parameters Chromium keys its `HttpStreamKey` on.

use crate::base::neterror::NetError;
use std::fmt;
use url::Url;

/// Scheme of a pooled destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl Scheme {
    pub fn parse(scheme: &str) -> Result<Self, NetError> {
        match scheme {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            "ws" => Ok(Scheme::Ws),
            "wss" => Ok(Scheme::Wss),
            _ => Err(NetError::UnknownUrlScheme),
        }
    }

    /// Whether streams to this scheme need a TLS handshake.
    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Https | Scheme::Wss)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }
}

/// Privacy mode of a request (matches Chromium's PrivacyMode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrivacyMode {
    #[default]
    Disabled,
    Enabled,
    EnabledWithoutClientCerts,
    EnabledPartitionedState,
}

/// Which resolvers may use secure DNS for this destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SecureDnsPolicy {
    #[default]
    Allow,
    Disable,
    BootstrapOnly,
}

/// Tag applied to sockets for traffic accounting. Sockets with different
/// tags are never shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SocketTag {
    pub uid: u32,
    pub traffic_stats_tag: u32,
}

/// Network isolation partition. Empty means unpartitioned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NetworkAnonymizationKey {
    top_frame_site: Option<String>,
    is_cross_site: bool,
}

impl NetworkAnonymizationKey {
    pub fn new(top_frame_site: impl Into<String>, is_cross_site: bool) -> Self {
        Self { top_frame_site: Some(top_frame_site.into()), is_cross_site }
    }

    pub fn top_frame_site(&self) -> Option<&str> {
        self.top_frame_site.as_deref()
    }

    pub fn is_cross_site(&self) -> bool {
        self.is_cross_site
    }

    pub fn is_empty(&self) -> bool {
        self.top_frame_site.is_none()
    }
}

/// A host and port, without scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPortPair {
    host: String,
    port: u16,
}

impl HostPortPair {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for HostPortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Identifies a stream group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    scheme: Scheme,
    destination: HostPortPair,
    privacy_mode: PrivacyMode,
    socket_tag: SocketTag,
    network_anonymization_key: NetworkAnonymizationKey,
    secure_dns_policy: SecureDnsPolicy,
    disable_cert_network_fetches: bool,
}

impl StreamKey {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            destination: HostPortPair::new(host, port),
            privacy_mode: PrivacyMode::default(),
            socket_tag: SocketTag::default(),
            network_anonymization_key: NetworkAnonymizationKey::default(),
            secure_dns_policy: SecureDnsPolicy::default(),
            disable_cert_network_fetches: false,
        }
    }

    pub fn from_url(url: &Url) -> Result<Self, NetError> {
        let scheme = Scheme::parse(url.scheme())?;
        let host = url.host_str().ok_or(NetError::InvalidUrl)?;
        let port = url.port_or_known_default().ok_or(NetError::InvalidUrl)?;
        // Url keeps IPv6 literals bracketed.
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Self::new(scheme, host, port))
    }

    pub fn with_privacy_mode(mut self, privacy_mode: PrivacyMode) -> Self {
        self.privacy_mode = privacy_mode;
        self
    }

    pub fn with_socket_tag(mut self, socket_tag: SocketTag) -> Self {
        self.socket_tag = socket_tag;
        self
    }

    pub fn with_network_anonymization_key(mut self, key: NetworkAnonymizationKey) -> Self {
        self.network_anonymization_key = key;
        self
    }

    pub fn with_secure_dns_policy(mut self, policy: SecureDnsPolicy) -> Self {
        self.secure_dns_policy = policy;
        self
    }

    pub fn with_cert_network_fetches_disabled(mut self, disabled: bool) -> Self {
        self.disable_cert_network_fetches = disabled;
        self
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        self.destination.host()
    }

    pub fn port(&self) -> u16 {
        self.destination.port()
    }

    pub fn destination(&self) -> &HostPortPair {
        &self.destination
    }

    pub fn privacy_mode(&self) -> PrivacyMode {
        self.privacy_mode
    }

    pub fn socket_tag(&self) -> SocketTag {
        self.socket_tag
    }

    pub fn network_anonymization_key(&self) -> &NetworkAnonymizationKey {
        &self.network_anonymization_key
    }

    pub fn secure_dns_policy(&self) -> SecureDnsPolicy {
        self.secure_dns_policy
    }

    pub fn cert_network_fetches_disabled(&self) -> bool {
        self.disable_cert_network_fetches
    }

    pub fn is_secure(&self) -> bool {
        self.scheme.is_secure()
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.destination)?;
        if self.privacy_mode != PrivacyMode::Disabled {
            write!(f, " <{:?}>", self.privacy_mode)?;
        }
        if let Some(site) = self.network_anonymization_key.top_frame_site() {
            write!(f, " nak={}", site)?;
        }
        Ok(())
    }
}
