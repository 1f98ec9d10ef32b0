//! Upstream directory sessions.
//!
//! [`UpstreamConnector`] and [`UpstreamSession`] are the seam between the proxy pipeline and the
//! network. The production implementation is backed by `ldap3`; tests script the traits with
//! mocks.

use crate::{config::UpstreamConfig, Result};
use async_trait::async_trait;
use ldap3::asn1::StructureTag;
use ldap3::{
    DerefAliases, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry, SearchOptions,
    SearchResult,
};
use ldap_proxy_core::error::LDAP_SIZE_LIMIT_EXCEEDED;
use ldap_proxy_core::types::{
    DerefPolicy, DirectoryEntry, EntryAttribute, ResultCode, SearchParams, SearchResponse,
    SearchScope,
};
use ldap_proxy_core::Error;
use native_tls::{Certificate, TlsConnector};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// One network-attached upstream session.
///
/// A session runs at most one operation at a time; callers hold it exclusively.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamSession: Send {
    /// Authenticates the session with a simple bind.
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()>;

    /// Runs a search with already translated parameters.
    async fn search(&mut self, request: &SearchParams) -> Result<SearchResponse>;

    /// Unbinds and closes the session.
    async fn unbind(&mut self) -> Result<()>;
}

/// Opens new upstream sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Dials the upstream and negotiates TLS as configured. The session is not yet bound.
    async fn connect(&self) -> Result<Box<dyn UpstreamSession>>;
}

/// Connector backed by `ldap3`.
pub struct LdapConnector {
    config: Arc<UpstreamConfig>,
    settings: LdapConnSettings,
}

impl LdapConnector {
    /// Creates a new connector instance.
    ///
    /// TLS material is loaded here, once; every dial reuses it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] when the CA certificate cannot be read or the TLS
    /// connector cannot be built.
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        let settings = build_ldap_settings(&config)?;
        Ok(Self {
            config: Arc::new(config),
            settings,
        })
    }
}

#[async_trait]
impl UpstreamConnector for LdapConnector {
    async fn connect(&self) -> Result<Box<dyn UpstreamSession>> {
        let (conn, ldap) = LdapConnAsync::with_settings(self.settings.clone(), self.config.url())
            .await
            .map_err(map_ldap_error)?;
        ldap3::drive!(conn);
        Ok(Box::new(LdapSession {
            inner: ldap,
            operation_timeout: self.config.operation_timeout(),
        }))
    }
}

struct LdapSession {
    inner: ldap3::Ldap,
    operation_timeout: Duration,
}

#[async_trait]
impl UpstreamSession for LdapSession {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()> {
        timeout(self.operation_timeout, self.inner.simple_bind(dn, password))
            .await
            .map_err(|_| Error::Timeout("upstream bind timed out".to_string()))?
            .and_then(ldap3::LdapResult::success)
            .map_err(map_ldap_error)?;
        Ok(())
    }

    async fn search(&mut self, request: &SearchParams) -> Result<SearchResponse> {
        let options = SearchOptions::new()
            .deref(deref_aliases(request.deref))
            .sizelimit(request.size_limit)
            .timelimit(request.time_limit)
            .typesonly(request.types_only);
        let result = timeout(
            self.operation_timeout,
            self.inner.with_search_options(options).search(
                &request.base_dn,
                search_scope(request.scope),
                &request.filter,
                request.attributes.clone(),
            ),
        )
        .await
        .map_err(|_| Error::Timeout("upstream search timed out".to_string()))?
        .map_err(map_ldap_error)?;
        collect_search_result(result)
    }

    async fn unbind(&mut self) -> Result<()> {
        timeout(self.operation_timeout, self.inner.unbind())
            .await
            .map_err(|_| Error::Timeout("upstream unbind timed out".to_string()))?
            .map_err(map_ldap_error)?;
        Ok(())
    }
}

// ldap3 has no children scope; subtree is the closest superset.
fn search_scope(scope: SearchScope) -> Scope {
    match scope {
        SearchScope::Base => Scope::Base,
        SearchScope::OneLevel => Scope::OneLevel,
        SearchScope::Subtree | SearchScope::Children => Scope::Subtree,
    }
}

fn deref_aliases(policy: DerefPolicy) -> DerefAliases {
    match policy {
        DerefPolicy::Never => DerefAliases::Never,
        DerefPolicy::Searching => DerefAliases::Searching,
        DerefPolicy::FindingBase => DerefAliases::Finding,
        DerefPolicy::Always => DerefAliases::Always,
    }
}

fn collect_search_result(result: SearchResult) -> Result<SearchResponse> {
    let SearchResult(raw_entries, outcome) = result;
    let code = match outcome.rc {
        0 => ResultCode::Success,
        LDAP_SIZE_LIMIT_EXCEEDED => ResultCode::SizeLimitExceeded,
        rc => {
            return Err(Error::UpstreamResult {
                code: rc,
                message: outcome.text,
            })
        }
    };

    let mut referrals = outcome.refs;
    let mut entries = Vec::with_capacity(raw_entries.len());
    for raw in raw_entries {
        if raw.is_ref() {
            referrals.extend(parse_referrals(raw.0)?);
        } else {
            entries.push(directory_entry(SearchEntry::construct(raw)));
        }
    }

    Ok(SearchResponse {
        entries,
        referrals,
        code,
    })
}

/// URIs of a SearchResultReference, which is a SEQUENCE OF OCTET STRING.
fn parse_referrals(tag: StructureTag) -> Result<Vec<String>> {
    let malformed = || Error::ProtocolError("malformed search result reference".to_string());
    tag.expect_constructed()
        .ok_or_else(malformed)?
        .into_iter()
        .map(|uri| {
            let bytes = uri.expect_primitive().ok_or_else(malformed)?;
            String::from_utf8(bytes).map_err(|_| malformed())
        })
        .collect()
}

fn directory_entry(entry: SearchEntry) -> DirectoryEntry {
    let mut attributes: Vec<EntryAttribute> = entry
        .attrs
        .into_iter()
        .map(|(name, values)| EntryAttribute::new(name, values))
        .chain(
            entry
                .bin_attrs
                .into_iter()
                .map(|(name, values)| EntryAttribute { name, values }),
        )
        .collect();
    // SearchEntry hands attributes back in a hash map.
    attributes.sort_by(|a, b| a.name.cmp(&b.name));
    DirectoryEntry::new(entry.dn, attributes)
}

fn build_ldap_settings(config: &UpstreamConfig) -> Result<LdapConnSettings> {
    let mut settings = LdapConnSettings::new()
        .set_conn_timeout(config.connection_timeout())
        .set_starttls(config.start_tls() && config.url().starts_with("ldap://"));

    if !config.tls_verify() {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|err| {
                Error::ConfigError(format!("failed to construct TLS connector: {err}"))
            })?;
        settings = settings.set_connector(connector).set_no_tls_verify(true);
    } else if let Some(cert_path) = config.tls_ca_cert() {
        let pem = fs::read(cert_path).map_err(|err| {
            Error::ConfigError(format!(
                "failed to read upstream CA certificate {}: {err}",
                cert_path.display()
            ))
        })?;
        let certificate = Certificate::from_pem(&pem)
            .map_err(|err| Error::ConfigError(format!("invalid upstream CA certificate: {err}")))?;
        let connector = TlsConnector::builder()
            .add_root_certificate(certificate)
            .build()
            .map_err(|err| {
                Error::ConfigError(format!("failed to load upstream CA certificate: {err}"))
            })?;
        settings = settings.set_connector(connector);
    }

    Ok(settings)
}

fn map_ldap_error(err: LdapError) -> Error {
    match err {
        LdapError::LdapResult { result } => Error::UpstreamResult {
            code: result.rc,
            message: result.text,
        },
        LdapError::Io { source } => Error::Io(source.to_string()),
        other => Error::ConnectionError(other.to_string()),
    }
}
