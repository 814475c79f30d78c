use crate::base::neterror::NetError;
use boring::ssl::{SslConnector, SslConnectorBuilder, SslMethod, SslVerifyMode, SslVersion};

/// TLS parameters applied to every handshake the default connector runs.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub min_version: Option<SslVersion>,
    pub max_version: Option<SslVersion>,
    pub alpn_protos: Vec<String>,
    /// Verify the server certificate chain against the system roots.
    pub verify_peer: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            min_version: Some(SslVersion::TLS1_2),
            max_version: Some(SslVersion::TLS1_3),
            alpn_protos: vec!["h2".to_string(), "http/1.1".to_string()],
            verify_peer: true,
        }
    }
}

impl TlsConfig {
    /// Apply this configuration to an SSL connector builder.
    pub fn apply_to_builder(&self, builder: &mut SslConnectorBuilder) -> Result<(), NetError> {
        if let Some(min) = self.min_version {
            builder.set_min_proto_version(Some(min)).map_err(|_| NetError::SslProtocolError)?;
        }
        if let Some(max) = self.max_version {
            builder.set_max_proto_version(Some(max)).map_err(|_| NetError::SslProtocolError)?;
        }

        if !self.alpn_protos.is_empty() {
            builder.set_alpn_protos(&self.alpn_wire()?).map_err(|_| NetError::SslProtocolError)?;
        }

        if self.verify_peer {
            builder.set_verify(SslVerifyMode::PEER);
        } else {
            builder.set_verify(SslVerifyMode::NONE);
        }
        Ok(())
    }

    /// Connector builder with this configuration applied.
    pub fn connector_builder(&self) -> Result<SslConnectorBuilder, NetError> {
        let mut builder =
            SslConnector::builder(SslMethod::tls()).map_err(|_| NetError::SslProtocolError)?;
        self.apply_to_builder(&mut builder)?;
        Ok(builder)
    }

    /// Build a connector with this configuration applied.
    pub fn build_connector(&self) -> Result<SslConnector, NetError> {
        Ok(self.connector_builder()?.build())
    }

    /// ALPN protocol list in wire format (length-prefixed).
    fn alpn_wire(&self) -> Result<Vec<u8>, NetError> {
        let mut wire = Vec::new();
        for proto in &self.alpn_protos {
            let len = u8::try_from(proto.len()).map_err(|_| NetError::InvalidArgument)?;
            wire.push(len);
            wire.extend_from_slice(proto.as_bytes());
        }
        Ok(wire)
    }

    /// Check if SNI (Server Name Indication) should be set for this host.
    /// Per RFC 6066, SNI MUST NOT be set for raw IP addresses.
    pub fn should_set_sni(host: &str) -> bool {
        host.parse::<std::net::IpAddr>().is_err()
    }
}
