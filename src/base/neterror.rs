use thiserror::Error;

/// Network error codes, numbered as in Chromium's `net_error_list.h`.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy, Hash)]
pub enum NetError {
    // Generic Errors
    #[error("Generic failure")]
    Failed,
    #[error("Operation aborted")]
    Aborted,
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("Operation timed out")]
    TimedOut,
    #[error("Network changed")]
    NetworkChanged,

    // Connection Errors
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Internet disconnected")]
    InternetDisconnected,
    #[error("SSL protocol error")]
    SslProtocolError,
    #[error("Address invalid")]
    AddressInvalid,
    #[error("Address unreachable")]
    AddressUnreachable,
    #[error("SSL client auth cert needed")]
    SslClientAuthCertNeeded,
    #[error("Socket not connected")]
    SocketNotConnected,
    #[error("SSL version or cipher mismatch")]
    SslVersionOrCipherMismatch,
    #[error("Bad SSL client auth cert")]
    BadSslClientAuthCert,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("Host resolver queue too large")]
    HostResolverQueueTooLarge,
    #[error("Preconnect max socket limit")]
    PreconnectMaxSocketLimit,
    #[error("Name resolution failed")]
    NameResolutionFailed,
    #[error("Network access denied")]
    NetworkAccessDenied,
    #[error("Address in use")]
    AddressInUse,
    #[error("SSL server cert changed")]
    SslServerCertChanged,

    // Certificate Errors
    #[error("Certificate common name invalid")]
    CertCommonNameInvalid,
    #[error("Certificate date invalid")]
    CertDateInvalid,
    #[error("Certificate authority invalid")]
    CertAuthorityInvalid,
    #[error("Certificate contains errors")]
    CertContainsErrors,
    #[error("Certificate revoked")]
    CertRevoked,
    #[error("Certificate invalid")]
    CertInvalid,
    #[error("Certificate weak signature algorithm")]
    CertWeakSignatureAlgorithm,

    // URL Errors
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Disallowed URL scheme")]
    DisallowedUrlScheme,
    #[error("Unknown URL scheme")]
    UnknownUrlScheme,
    #[error("Unsafe port")]
    UnsafePort,

    // DNS Errors
    #[error("DNS server failed")]
    DnsServerFailed,
    #[error("DNS timed out")]
    DnsTimedOut,

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::Failed => -2,
            NetError::Aborted => -3,
            NetError::InvalidArgument => -4,
            NetError::TimedOut => -7,
            NetError::NetworkChanged => -21,

            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed => -104,
            NetError::NameNotResolved => -105,
            NetError::InternetDisconnected => -106,
            NetError::SslProtocolError => -107,
            NetError::AddressInvalid => -108,
            NetError::AddressUnreachable => -109,
            NetError::SslClientAuthCertNeeded => -110,
            NetError::SocketNotConnected => -112,
            NetError::SslVersionOrCipherMismatch => -113,
            NetError::BadSslClientAuthCert => -117,
            NetError::ConnectionTimedOut => -118,
            NetError::HostResolverQueueTooLarge => -119,
            NetError::PreconnectMaxSocketLimit => -133,
            NetError::NameResolutionFailed => -137,
            NetError::NetworkAccessDenied => -138,
            NetError::AddressInUse => -147,
            NetError::SslServerCertChanged => -156,

            NetError::CertCommonNameInvalid => -200,
            NetError::CertDateInvalid => -201,
            NetError::CertAuthorityInvalid => -202,
            NetError::CertContainsErrors => -203,
            NetError::CertRevoked => -206,
            NetError::CertInvalid => -207,
            NetError::CertWeakSignatureAlgorithm => -208,

            NetError::InvalidUrl => -300,
            NetError::DisallowedUrlScheme => -301,
            NetError::UnknownUrlScheme => -302,
            NetError::UnsafePort => -312,

            NetError::DnsServerFailed => -802,
            NetError::DnsTimedOut => -803,

            NetError::Unknown(code) => *code,
        }
    }

    /// Certificate errors occupy the `-200..=-299` block.
    pub fn is_certificate_error(&self) -> bool {
        (-299..=-200).contains(&self.as_i32())
    }

    /// Errors that mean the server wants (or rejected) a client certificate.
    pub fn is_client_auth_error(&self) -> bool {
        matches!(self, NetError::SslClientAuthCertNeeded | NetError::BadSslClientAuthCert)
    }

    /// True for errors that end a single endpoint but leave others worth trying.
    pub fn is_recoverable_connect_error(&self) -> bool {
        !self.is_certificate_error()
            && !self.is_client_auth_error()
            && !matches!(self, NetError::NetworkChanged | NetError::Aborted)
    }
}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -2 => NetError::Failed,
            -3 => NetError::Aborted,
            -4 => NetError::InvalidArgument,
            -7 => NetError::TimedOut,
            -21 => NetError::NetworkChanged,

            -100 => NetError::ConnectionClosed,
            -101 => NetError::ConnectionReset,
            -102 => NetError::ConnectionRefused,
            -103 => NetError::ConnectionAborted,
            -104 => NetError::ConnectionFailed,
            -105 => NetError::NameNotResolved,
            -106 => NetError::InternetDisconnected,
            -107 => NetError::SslProtocolError,
            -108 => NetError::AddressInvalid,
            -109 => NetError::AddressUnreachable,
            -110 => NetError::SslClientAuthCertNeeded,
            -112 => NetError::SocketNotConnected,
            -113 => NetError::SslVersionOrCipherMismatch,
            -117 => NetError::BadSslClientAuthCert,
            -118 => NetError::ConnectionTimedOut,
            -119 => NetError::HostResolverQueueTooLarge,
            -133 => NetError::PreconnectMaxSocketLimit,
            -137 => NetError::NameResolutionFailed,
            -138 => NetError::NetworkAccessDenied,
            -147 => NetError::AddressInUse,
            -156 => NetError::SslServerCertChanged,

            -200 => NetError::CertCommonNameInvalid,
            -201 => NetError::CertDateInvalid,
            -202 => NetError::CertAuthorityInvalid,
            -203 => NetError::CertContainsErrors,
            -206 => NetError::CertRevoked,
            -207 => NetError::CertInvalid,
            -208 => NetError::CertWeakSignatureAlgorithm,

            -300 => NetError::InvalidUrl,
            -301 => NetError::DisallowedUrlScheme,
            -302 => NetError::UnknownUrlScheme,
            -312 => NetError::UnsafePort,

            -802 => NetError::DnsServerFailed,
            -803 => NetError::DnsTimedOut,
            _ => NetError::Unknown(code),
        }
    }
}
