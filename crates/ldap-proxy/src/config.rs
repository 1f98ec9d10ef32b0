//! Connection settings for one upstream directory.

use crate::Result;
use ldap_proxy_core::config::{
    BackendConfig, DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_OPERATION_TIMEOUT_SECS,
};
use ldap_proxy_core::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Transport configuration for dialing an upstream directory.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    url: String,
    tls_verify: bool,
    tls_ca_cert: Option<PathBuf>,
    start_tls: bool,
    connection_timeout_secs: u64,
    operation_timeout_secs: u64,
}

impl UpstreamConfig {
    /// Creates an upstream configuration with certificate verification on and default timeouts.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or its scheme is neither `ldap` nor `ldaps`.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url_string = url.into();
        let parsed = Url::parse(&url_string)?;
        if !matches!(parsed.scheme(), "ldap" | "ldaps") {
            return Err(Error::ConfigError(format!(
                "unsupported upstream URL scheme `{}`",
                parsed.scheme()
            )));
        }

        Ok(Self {
            url: url_string,
            tls_verify: true,
            tls_ca_cert: None,
            start_tls: false,
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
        })
    }

    /// Builds the transport settings of a configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend URL is invalid.
    pub fn from_backend(
        backend: &BackendConfig,
        connection_timeout: Duration,
        operation_timeout: Duration,
    ) -> Result<Self> {
        let mut config = Self::new(backend.ldap_url.clone())?
            .with_tls_verify(!backend.insecure_skip_verify)
            .with_start_tls(backend.start_tls)
            .with_connection_timeout(connection_timeout)
            .with_operation_timeout(operation_timeout);
        if let Some(path) = &backend.ca_cert {
            config = config.with_tls_ca_cert(path.clone());
        }
        Ok(config)
    }

    /// Returns the upstream URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the connection timeout duration.
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Returns the operation timeout duration.
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Returns whether TLS certificate verification is enabled.
    #[must_use]
    pub const fn tls_verify(&self) -> bool {
        self.tls_verify
    }

    /// Optional custom CA certificate path.
    #[must_use]
    pub fn tls_ca_cert(&self) -> Option<&Path> {
        self.tls_ca_cert.as_deref()
    }

    /// Whether plain `ldap://` sessions are upgraded with StartTLS.
    #[must_use]
    pub const fn start_tls(&self) -> bool {
        self.start_tls
    }

    /// Toggle TLS verification.
    #[must_use]
    pub const fn with_tls_verify(mut self, verify: bool) -> Self {
        self.tls_verify = verify;
        self
    }

    /// Provide a custom CA certificate path.
    #[must_use]
    pub fn with_tls_ca_cert(mut self, path: PathBuf) -> Self {
        self.tls_ca_cert = Some(path);
        self
    }

    /// Toggle the StartTLS upgrade.
    #[must_use]
    pub const fn with_start_tls(mut self, start_tls: bool) -> Self {
        self.start_tls = start_tls;
        self
    }

    /// Overrides the connection timeout.
    #[must_use]
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Overrides the operation timeout.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_secs = timeout.as_secs().max(1);
        self
    }
}
