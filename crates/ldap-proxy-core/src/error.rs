//! Error types for proxy operations.
//!
//! Every failure the proxy can run into is expressed as a variant of [`Error`]. None of them ever
//! reach a client verbatim: the handler maps them onto LDAP result codes and logs the detail.

use thiserror::Error;

/// Main error type for proxy operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Dialing, TLS negotiation or the transport to an upstream failed
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The upstream answered with a non-success LDAP result
    #[error("Upstream returned result code {code}: {message}")]
    UpstreamResult {
        /// LDAP result code sent by the upstream
        code: u32,
        /// Diagnostic message sent by the upstream
        message: String,
    },

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A search filter could not be parsed
    #[error("Filter parse error: {0}")]
    FilterParse(String),

    /// A search filter tree could not be encoded back to a string
    #[error("Filter serialize error: {0}")]
    FilterSerialize(String),

    /// No backend is configured for the distinguished name
    #[error("No backend serves {0}")]
    NoBackend(String),

    /// The upstream sent something the proxy could not decode
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Local I/O failure (listener, configuration file)
    #[error("I/O error: {0}")]
    Io(String),
}

/// Specialized result type for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// LDAP result code for `invalidCredentials`.
pub const LDAP_INVALID_CREDENTIALS: u32 = 49;

/// LDAP result code for `sizeLimitExceeded`.
pub const LDAP_SIZE_LIMIT_EXCEEDED: u32 = 4;

impl Error {
    /// Returns the error code for this error type.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::ConnectionError(_) => "CONNECTION_ERROR",
            Self::UpstreamResult { .. } => "UPSTREAM_RESULT",
            Self::Timeout(_) => "TIMEOUT",
            Self::FilterParse(_) => "FILTER_PARSE_ERROR",
            Self::FilterSerialize(_) => "FILTER_SERIALIZE_ERROR",
            Self::NoBackend(_) => "NO_BACKEND",
            Self::ProtocolError(_) => "PROTOCOL_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Returns true if this error should be logged as a serious error.
    #[must_use]
    pub const fn should_log(&self) -> bool {
        matches!(
            self,
            Self::ConfigError(_) | Self::ConnectionError(_) | Self::ProtocolError(_) | Self::Io(_)
        )
    }

    /// Returns true if the upstream session that produced this error can no longer be trusted
    /// and must be closed instead of going back to the pool.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError(_) | Self::Timeout(_) | Self::ProtocolError(_) | Self::Io(_)
        )
    }

    /// Returns true if the upstream rejected the supplied credentials.
    #[must_use]
    pub const fn is_invalid_credentials(&self) -> bool {
        matches!(
            self,
            Self::UpstreamResult {
                code: LDAP_INVALID_CREDENTIALS,
                ..
            }
        )
    }
}

// Conversions from external error types
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::ConfigError(format!("invalid URL: {err}"))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::ConfigError(err.to_string())
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::ConfigError(err.to_string())
    }
}
