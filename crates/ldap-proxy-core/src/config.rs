//! Configuration file model for the proxy.
//!
//! The configuration is a single YAML document holding the listen address, the proxy's own admin
//! identity and one descriptor per upstream backend. It is parsed with `serde_yaml` and checked
//! with `validator` before anything is built from it.

use crate::types::BindCredentials;
use crate::{Error, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;
use validator::{Validate, ValidationError};

/// Default upstream dial timeout (seconds).
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 10;
/// Default upstream operation timeout (seconds).
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 10;
/// Default number of idle sessions kept per backend.
pub const DEFAULT_CLIENT_POOL_SIZE: usize = 10;

/// Top-level proxy configuration.
#[derive(Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Address the proxy listens on (e.g. `0.0.0.0:389`)
    #[validate(custom(function = "validate_socket_addr"))]
    pub serv_addr: String,

    /// Admin DN accepted locally without contacting any backend
    pub serv_user: String,

    /// Admin password
    pub serv_pass: SecretString,

    /// Emit per-search query traces at info level
    #[serde(default)]
    pub debug: bool,

    /// Upstream dial timeout in seconds
    #[validate(range(min = 1, max = 300))]
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    /// Upstream bind/search timeout in seconds
    #[validate(range(min = 1, max = 300))]
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// Backend descriptors
    #[validate(length(min = 1), nested)]
    pub ldap_config: Vec<BackendConfig>,
}

const fn default_connection_timeout_secs() -> u64 {
    DEFAULT_CONNECTION_TIMEOUT_SECS
}

const fn default_operation_timeout_secs() -> u64 {
    DEFAULT_OPERATION_TIMEOUT_SECS
}

const fn default_client_pool_size() -> usize {
    DEFAULT_CLIENT_POOL_SIZE
}

const fn default_true() -> bool {
    true
}

impl ProxyConfig {
    /// Reads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            Error::ConfigError(format!(
                "failed to read config file {}: {err}",
                path.display()
            ))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parses and validates a configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the document is not valid YAML or fails validation.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    /// Runs field validation plus the cross-backend checks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] describing the first problem found.
    pub fn check(&self) -> Result<()> {
        self.validate()?;

        let mut suffixes = HashSet::new();
        for backend in &self.ldap_config {
            if !suffixes.insert(backend.suffix_dn.as_str()) {
                return Err(Error::ConfigError(format!(
                    "duplicate backend suffixDN `{}`",
                    backend.suffix_dn
                )));
            }
        }
        Ok(())
    }

    /// Parses the listen address.
    ///
    /// # Errors
    ///
    /// Returns an error if `servAddr` is not a socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.serv_addr
            .parse()
            .map_err(|e| Error::ConfigError(format!("Invalid servAddr: {e}")))
    }

    /// The proxy's own admin identity.
    #[must_use]
    pub fn admin_credentials(&self) -> BindCredentials {
        BindCredentials::from_secret(self.serv_user.clone(), self.serv_pass.clone())
    }

    /// Get the dial timeout as a Duration.
    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Get the operation timeout as a Duration.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("serv_addr", &self.serv_addr)
            .field("serv_user", &self.serv_user)
            .field("serv_pass", &"[REDACTED]")
            .field("debug", &self.debug)
            .field("connection_timeout_secs", &self.connection_timeout_secs)
            .field("operation_timeout_secs", &self.operation_timeout_secs)
            .field("ldap_config", &self.ldap_config)
            .finish()
    }
}

/// Descriptor for one upstream directory.
#[derive(Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// DN suffix routed to this backend
    #[serde(rename = "suffixDN")]
    pub suffix_dn: String,

    /// Upstream URL (`ldap://` or `ldaps://`)
    #[serde(rename = "ldapURL")]
    #[validate(url, custom(function = "validate_ldap_scheme"))]
    pub ldap_url: String,

    /// Service account DN
    #[serde(rename = "bindDN")]
    pub bind_dn: String,

    /// Service account password
    #[serde(rename = "bindPW")]
    pub bind_pw: SecretString,

    /// Disable upstream certificate verification
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Upgrade `ldap://` sessions with StartTLS
    #[serde(default, rename = "startTLS")]
    pub start_tls: bool,

    /// Extra trusted root certificate (PEM)
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,

    /// Maximum number of idle sessions kept for reuse
    #[validate(range(max = 1024))]
    #[serde(default = "default_client_pool_size")]
    pub client_pool_size: usize,

    /// `A<->B` attribute rename rules
    #[serde(default)]
    pub swap_attribute_name_rule: Vec<String>,

    /// Attributes always requested from the upstream
    #[serde(default)]
    pub extra_attributes: Vec<String>,

    /// Attributes pruned from search filters
    #[serde(default)]
    pub exclude_filter_keys: Vec<String>,

    /// Relabel disjunctions as conjunctions before forwarding
    #[serde(default)]
    pub rewrite_or_to_and: bool,

    /// Leave entries carrying exactly one attribute un-renamed
    #[serde(default)]
    pub skip_rename_single_attribute: bool,

    /// Return only the first entry for account lookup filters
    #[serde(default = "default_true")]
    pub first_entry_for_account_lookup: bool,

    /// Forward the original filter when it cannot be rewritten
    #[serde(default = "default_true")]
    pub fail_open_filter_rewrite: bool,
}

impl BackendConfig {
    /// Creates a backend descriptor with defaults for every optional field.
    #[must_use]
    pub fn new(
        suffix_dn: impl Into<String>,
        ldap_url: impl Into<String>,
        bind_dn: impl Into<String>,
        bind_pw: impl Into<String>,
    ) -> Self {
        Self {
            suffix_dn: suffix_dn.into(),
            ldap_url: ldap_url.into(),
            bind_dn: bind_dn.into(),
            bind_pw: SecretString::from(bind_pw.into()),
            insecure_skip_verify: false,
            start_tls: false,
            ca_cert: None,
            client_pool_size: DEFAULT_CLIENT_POOL_SIZE,
            swap_attribute_name_rule: Vec::new(),
            extra_attributes: Vec::new(),
            exclude_filter_keys: Vec::new(),
            rewrite_or_to_and: false,
            skip_rename_single_attribute: false,
            first_entry_for_account_lookup: true,
            fail_open_filter_rewrite: true,
        }
    }

    /// The backend's service account.
    #[must_use]
    pub fn service_account(&self) -> BindCredentials {
        BindCredentials::from_secret(self.bind_dn.clone(), self.bind_pw.clone())
    }

    /// Parse the upstream URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed.
    pub fn parse_url(&self) -> Result<Url> {
        Url::parse(&self.ldap_url)
            .map_err(|e| Error::ConfigError(format!("Invalid ldapURL: {e}")))
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("suffix_dn", &self.suffix_dn)
            .field("ldap_url", &self.ldap_url)
            .field("bind_dn", &self.bind_dn)
            .field("bind_pw", &"[REDACTED]")
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("start_tls", &self.start_tls)
            .field("ca_cert", &self.ca_cert)
            .field("client_pool_size", &self.client_pool_size)
            .field("swap_attribute_name_rule", &self.swap_attribute_name_rule)
            .field("extra_attributes", &self.extra_attributes)
            .field("exclude_filter_keys", &self.exclude_filter_keys)
            .field("rewrite_or_to_and", &self.rewrite_or_to_and)
            .field(
                "skip_rename_single_attribute",
                &self.skip_rename_single_attribute,
            )
            .field(
                "first_entry_for_account_lookup",
                &self.first_entry_for_account_lookup,
            )
            .field("fail_open_filter_rewrite", &self.fail_open_filter_rewrite)
            .finish()
    }
}

fn validate_socket_addr(value: &str) -> std::result::Result<(), ValidationError> {
    value
        .parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("socket_addr"))
}

fn validate_ldap_scheme(value: &str) -> std::result::Result<(), ValidationError> {
    match Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "ldap" | "ldaps") => Ok(()),
        _ => Err(ValidationError::new("ldap_scheme")),
    }
}
