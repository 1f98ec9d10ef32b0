//! Bind and search orchestration.
//!
//! [`ProxyHandler`] is the single entry point for client operations. It never fails: every
//! routing, pool, filter or upstream error is logged here and mapped to an LDAP result code.

use crate::backend::Backend;
use crate::router::BackendRouter;
use crate::Result;
use ldap_proxy_core::config::ProxyConfig;
use ldap_proxy_core::types::{BindCredentials, ResultCode, SearchParams, SearchResponse};
use ldap_proxy_core::Error;
use tracing::{debug, error, info, warn};

/// Serves client bind and search requests.
#[derive(Debug)]
pub struct ProxyHandler {
    admin: BindCredentials,
    router: BackendRouter,
    log_queries: bool,
}

impl ProxyHandler {
    /// Creates a handler with the proxy's own admin identity and its routing table.
    #[must_use]
    pub fn new(admin: BindCredentials, router: BackendRouter) -> Self {
        Self {
            admin,
            router,
            log_queries: false,
        }
    }

    /// Builds the handler and every backend from the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend cannot be built.
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        Ok(Self::new(
            config.admin_credentials(),
            BackendRouter::from_config(config)?,
        )
        .with_query_logging(config.debug))
    }

    /// Emit per-search query traces at info level instead of debug.
    #[must_use]
    pub const fn with_query_logging(mut self, enabled: bool) -> Self {
        self.log_queries = enabled;
        self
    }

    /// The routing table.
    #[must_use]
    pub const fn router(&self) -> &BackendRouter {
        &self.router
    }

    /// Authenticates `dn` with `password`.
    ///
    /// The proxy's own admin identity is accepted locally. Everything else is forwarded to the
    /// backend owning `dn`; any failure along the way is reported as invalid credentials.
    pub async fn bind(&self, dn: &str, password: &str) -> ResultCode {
        if self.admin.matches(dn, password) {
            info!(dn, "admin bind accepted");
            return ResultCode::Success;
        }

        if password.is_empty() && !dn.is_empty() {
            warn!(dn, "refusing unauthenticated bind");
            return ResultCode::InvalidCredentials;
        }

        let backend = match self.router.resolve(dn) {
            Ok(backend) => backend,
            Err(err) => {
                warn!(error = %err, "bind not routed");
                return ResultCode::InvalidCredentials;
            }
        };

        let mut session = match backend.pool().acquire().await {
            Ok(session) => session,
            Err(err) => {
                log_error(&backend, "failed to acquire upstream session for bind", &err);
                return ResultCode::InvalidCredentials;
            }
        };

        match session.simple_bind(dn, password).await {
            Ok(()) => {
                info!(dn, backend = backend.suffix(), "bind succeeded");
                ResultCode::Success
            }
            Err(err) if err.is_invalid_credentials() => {
                warn!(dn, backend = backend.suffix(), "upstream rejected credentials");
                ResultCode::InvalidCredentials
            }
            Err(err) => {
                log_error(&backend, "upstream bind failed", &err);
                ResultCode::InvalidCredentials
            }
        }
    }

    /// Runs a search on the backend owning the base DN.
    pub async fn search(&self, request: &SearchParams) -> SearchResponse {
        let backend = match self.router.resolve(&request.base_dn) {
            Ok(backend) => backend,
            Err(err) => {
                warn!(error = %err, "search not routed");
                return SearchResponse::from_code(ResultCode::InvalidCredentials);
            }
        };

        let mut session = match backend.pool().acquire().await {
            Ok(session) => session,
            Err(err) => {
                log_error(&backend, "failed to acquire upstream session for search", &err);
                return SearchResponse::from_code(ResultCode::OperationsError);
            }
        };

        if let Err(err) = backend.pool().rebind_service_account(&mut session).await {
            log_error(&backend, "service account rebind failed", &err);
            return SearchResponse::from_code(ResultCode::InvalidCredentials);
        }

        let filter = match backend.engine().rewrite(&request.filter) {
            Ok(rewritten) => {
                for failure in &rewritten.failures {
                    warn!(
                        backend = backend.suffix(),
                        filter = %request.filter,
                        error = %failure,
                        "filter rewrite failed, forwarding filter unchanged"
                    );
                }
                rewritten.filter
            }
            Err(err) => {
                warn!(
                    backend = backend.suffix(),
                    filter = %request.filter,
                    error = %err,
                    "rejecting search with unusable filter"
                );
                return SearchResponse::from_code(ResultCode::OperationsError);
            }
        };

        let upstream = backend.upstream_request(request, filter);
        self.trace_query(&backend, request, &upstream);

        let response = match session.search(&upstream).await {
            Ok(response) => response,
            Err(err) => {
                log_error(&backend, "upstream search failed", &err);
                return SearchResponse::from_code(ResultCode::OperationsError);
            }
        };
        drop(session);

        let returned = response.entries.len();
        let entries = backend.translate_entries(&request.filter, response.entries);
        if self.log_queries {
            info!(base_dn = %request.base_dn, returned, sent = entries.len(), "search completed");
        } else {
            debug!(base_dn = %request.base_dn, returned, sent = entries.len(), "search completed");
        }

        SearchResponse {
            entries,
            referrals: response.referrals,
            code: response.code,
        }
    }

    fn trace_query(&self, backend: &Backend, request: &SearchParams, upstream: &SearchParams) {
        if self.log_queries {
            info!(
                backend = backend.suffix(),
                base_dn = %request.base_dn,
                source_filter = %request.filter,
                filter = %upstream.filter,
                attributes = ?upstream.attributes,
                "forwarding search"
            );
        } else {
            debug!(
                backend = backend.suffix(),
                base_dn = %request.base_dn,
                source_filter = %request.filter,
                filter = %upstream.filter,
                attributes = ?upstream.attributes,
                "forwarding search"
            );
        }
    }
}

fn log_error(backend: &Backend, message: &str, err: &Error) {
    if err.should_log() {
        error!(
            backend = backend.suffix(),
            code = err.error_code(),
            error = %err,
            "{message}"
        );
    } else {
        warn!(
            backend = backend.suffix(),
            code = err.error_code(),
            error = %err,
            "{message}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ConnectionPool;
    use crate::rename::AttributeRenamer;
    use crate::rewrite::FilterRewriteEngine;
    use crate::upstream::{MockUpstreamConnector, MockUpstreamSession, UpstreamConnector};
    use ldap_proxy_core::types::{DirectoryEntry, EntryAttribute};
    use std::sync::Arc;

    const SUFFIX: &str = "dc=example,dc=com";
    const ADMIN_DN: &str = "cn=proxy,dc=example,dc=com";
    const ADMIN_PW: &str = "proxy-secret";

    fn handler(connector: MockUpstreamConnector, configure: fn(Backend) -> Backend) -> ProxyHandler {
        let connector: Arc<dyn UpstreamConnector> = Arc::new(connector);
        let pool = ConnectionPool::new(
            SUFFIX,
            connector,
            BindCredentials::new("cn=svc,dc=example,dc=com", "svc-secret"),
            2,
        );
        let backend = configure(Backend::new(SUFFIX, pool));
        ProxyHandler::new(
            BindCredentials::new(ADMIN_DN, ADMIN_PW),
            BackendRouter::new(vec![backend]),
        )
    }

    fn connector_with(session: MockUpstreamSession) -> MockUpstreamConnector {
        let mut connector = MockUpstreamConnector::new();
        connector
            .expect_connect()
            .times(1)
            .return_once(move || Ok(Box::new(session)));
        connector
    }

    fn person(uid: &str) -> DirectoryEntry {
        DirectoryEntry::new(
            format!("uid={uid},ou=people,{SUFFIX}"),
            vec![
                EntryAttribute::new("sAMAccountName", [uid]),
                EntryAttribute::new("mail", [format!("{uid}@x.com")]),
            ],
        )
    }

    fn ok_response(entries: Vec<DirectoryEntry>) -> SearchResponse {
        SearchResponse {
            entries,
            referrals: Vec::new(),
            code: ResultCode::Success,
        }
    }

    #[tokio::test]
    async fn admin_bind_never_contacts_upstream() {
        let mut connector = MockUpstreamConnector::new();
        connector.expect_connect().times(0);
        let handler = handler(connector, |backend| backend);

        assert_eq!(handler.bind(ADMIN_DN, ADMIN_PW).await, ResultCode::Success);
        let backend = handler.router().resolve(SUFFIX).unwrap();
        assert_eq!(backend.pool().stats().dialed, 0);
    }

    #[tokio::test]
    async fn wrong_admin_password_is_forwarded() {
        let mut session = MockUpstreamSession::new();
        session
            .expect_simple_bind()
            .withf(|dn, _| dn == "cn=svc,dc=example,dc=com")
            .returning(|_, _| Ok(()));
        session
            .expect_simple_bind()
            .withf(|dn, _| dn == ADMIN_DN)
            .times(1)
            .returning(|_, _| {
                Err(Error::UpstreamResult {
                    code: 49,
                    message: "invalid credentials".to_string(),
                })
            });
        session.expect_unbind().returning(|| Ok(()));
        let handler = handler(connector_with(session), |backend| backend);

        assert_eq!(
            handler.bind(ADMIN_DN, "guess").await,
            ResultCode::InvalidCredentials
        );
    }

    #[tokio::test]
    async fn user_bind_is_forwarded_and_session_pooled() {
        let mut session = MockUpstreamSession::new();
        session.expect_simple_bind().times(2).returning(|_, _| Ok(()));
        session.expect_unbind().returning(|| Ok(()));
        let handler = handler(connector_with(session), |backend| backend);

        assert_eq!(
            handler.bind("uid=bob,ou=people,dc=example,dc=com", "pw").await,
            ResultCode::Success
        );
        let stats = handler.router().resolve(SUFFIX).unwrap().pool().stats();
        assert_eq!(stats.dialed, 1);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn bind_routing_miss_is_invalid_credentials() {
        let mut connector = MockUpstreamConnector::new();
        connector.expect_connect().times(0);
        let handler = handler(connector, |backend| backend);

        assert_eq!(
            handler.bind("uid=bob,dc=other,dc=org", "pw").await,
            ResultCode::InvalidCredentials
        );
    }

    #[tokio::test]
    async fn empty_password_is_rejected_locally() {
        let mut connector = MockUpstreamConnector::new();
        connector.expect_connect().times(0);
        let handler = handler(connector, |backend| backend);

        assert_eq!(
            handler.bind("uid=bob,ou=people,dc=example,dc=com", "").await,
            ResultCode::InvalidCredentials
        );
    }

    #[tokio::test]
    async fn bind_dial_failure_is_invalid_credentials() {
        let mut connector = MockUpstreamConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|| Err(Error::ConnectionError("connection refused".to_string())));
        let handler = handler(connector, |backend| backend);

        assert_eq!(
            handler.bind("uid=bob,ou=people,dc=example,dc=com", "pw").await,
            ResultCode::InvalidCredentials
        );
    }

    #[tokio::test]
    async fn search_returns_renamed_entries() {
        let mut session = MockUpstreamSession::new();
        session.expect_simple_bind().returning(|_, _| Ok(()));
        session
            .expect_search()
            .withf(|request| {
                request.filter == "(sAMAccountName=bob)"
                    && request.attributes == vec!["mail".to_string(), "memberOf".to_string()]
            })
            .times(1)
            .returning(|_| Ok(ok_response(vec![person("bob")])));
        session.expect_unbind().returning(|| Ok(()));

        let handler = handler(connector_with(session), |backend| {
            backend
                .with_renamer(AttributeRenamer::from_rules(["uid<->sAMAccountName"]))
                .with_extra_attributes(["memberOf"])
        });
        let request = SearchParams::new(SUFFIX, "(sAMAccountName=bob)").with_attributes(["mail"]);
        let response = handler.search(&request).await;

        assert_eq!(response.code, ResultCode::Success);
        assert_eq!(response.entries.len(), 1);
        assert_eq!(response.entries[0].attribute_names(), vec!["uid", "mail"]);
    }

    #[tokio::test]
    async fn search_sends_pruned_filter_upstream() {
        let mut session = MockUpstreamSession::new();
        session.expect_simple_bind().returning(|_, _| Ok(()));
        session
            .expect_search()
            .withf(|request| request.filter == "(objectClass=posixAccount)")
            .times(1)
            .returning(|_| Ok(ok_response(Vec::new())));
        session.expect_unbind().returning(|| Ok(()));

        let handler = handler(connector_with(session), |backend| {
            backend.with_engine(FilterRewriteEngine::new(["uid"], false))
        });
        let request = SearchParams::new(SUFFIX, "(&(objectClass=posixAccount)(uid=bob))");
        assert_eq!(handler.search(&request).await.code, ResultCode::Success);
    }

    #[tokio::test]
    async fn account_lookup_returns_single_entry() {
        let mut session = MockUpstreamSession::new();
        session.expect_simple_bind().returning(|_, _| Ok(()));
        session
            .expect_search()
            .times(1)
            .returning(|_| Ok(ok_response(vec![person("bob"), person("bob2"), person("bob3")])));
        session.expect_unbind().returning(|| Ok(()));

        let handler = handler(connector_with(session), |backend| backend);
        let request = SearchParams::new(
            SUFFIX,
            "(&(objectClass=posixAccount)(|(uid=bob)(mail=bob@x.com)))",
        );
        let response = handler.search(&request).await;

        assert_eq!(response.code, ResultCode::Success);
        assert_eq!(response.entries.len(), 1);
        assert_eq!(response.entries[0].dn, format!("uid=bob,ou=people,{SUFFIX}"));
    }

    #[tokio::test]
    async fn search_rebinds_before_every_search() {
        let mut session = MockUpstreamSession::new();
        // Dial bind plus one rebind per search.
        session
            .expect_simple_bind()
            .withf(|dn, password| dn == "cn=svc,dc=example,dc=com" && password == "svc-secret")
            .times(3)
            .returning(|_, _| Ok(()));
        session
            .expect_search()
            .times(2)
            .returning(|_| Ok(ok_response(Vec::new())));
        session.expect_unbind().returning(|| Ok(()));

        let handler = handler(connector_with(session), |backend| backend);
        let request = SearchParams::new(SUFFIX, "(uid=bob)");
        handler.search(&request).await;
        handler.search(&request).await;

        assert_eq!(
            handler.router().resolve(SUFFIX).unwrap().pool().stats().dialed,
            1
        );
    }

    #[tokio::test]
    async fn search_routing_miss_is_invalid_credentials() {
        let mut connector = MockUpstreamConnector::new();
        connector.expect_connect().times(0);
        let handler = handler(connector, |backend| backend);

        let response = handler
            .search(&SearchParams::new("dc=other,dc=org", "(uid=bob)"))
            .await;
        assert_eq!(response.code, ResultCode::InvalidCredentials);
        assert!(response.entries.is_empty());
    }

    #[tokio::test]
    async fn search_acquire_failure_is_operations_error() {
        let mut connector = MockUpstreamConnector::new();
        connector
            .expect_connect()
            .returning(|| Err(Error::Timeout("dial".to_string())));
        let handler = handler(connector, |backend| backend);

        let response = handler.search(&SearchParams::new(SUFFIX, "(uid=bob)")).await;
        assert_eq!(response.code, ResultCode::OperationsError);
    }

    #[tokio::test]
    async fn rebind_failure_is_invalid_credentials() {
        let mut session = MockUpstreamSession::new();
        let mut sequence = mockall::Sequence::new();
        session
            .expect_simple_bind()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| Ok(()));
        session
            .expect_simple_bind()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| {
                Err(Error::UpstreamResult {
                    code: 49,
                    message: "account disabled".to_string(),
                })
            });
        session.expect_search().times(0);
        session.expect_unbind().returning(|| Ok(()));

        let handler = handler(connector_with(session), |backend| backend);
        let response = handler.search(&SearchParams::new(SUFFIX, "(uid=bob)")).await;
        assert_eq!(response.code, ResultCode::InvalidCredentials);
    }

    #[tokio::test]
    async fn upstream_search_failure_is_operations_error() {
        let mut session = MockUpstreamSession::new();
        session.expect_simple_bind().returning(|_, _| Ok(()));
        session
            .expect_search()
            .returning(|_| Err(Error::ConnectionError("reset by peer".to_string())));
        session.expect_unbind().returning(|| Ok(()));

        let handler = handler(connector_with(session), |backend| backend);
        let response = handler.search(&SearchParams::new(SUFFIX, "(uid=bob)")).await;
        assert_eq!(response.code, ResultCode::OperationsError);

        let stats = handler.router().resolve(SUFFIX).unwrap().pool().stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.closed, 1);
    }

    #[tokio::test]
    async fn malformed_filter_fails_open() {
        let mut session = MockUpstreamSession::new();
        session.expect_simple_bind().returning(|_, _| Ok(()));
        session
            .expect_search()
            .withf(|request| request.filter == "(uid=bob")
            .times(1)
            .returning(|_| Ok(ok_response(Vec::new())));
        session.expect_unbind().returning(|| Ok(()));

        let handler = handler(connector_with(session), |backend| {
            backend.with_engine(FilterRewriteEngine::new(["mobile"], true))
        });
        let response = handler.search(&SearchParams::new(SUFFIX, "(uid=bob")).await;
        assert_eq!(response.code, ResultCode::Success);
    }

    #[tokio::test]
    async fn malformed_filter_rejected_when_strict() {
        let mut session = MockUpstreamSession::new();
        session.expect_simple_bind().returning(|_, _| Ok(()));
        session.expect_search().times(0);
        session.expect_unbind().returning(|| Ok(()));

        let handler = handler(connector_with(session), |backend| {
            backend.with_engine(FilterRewriteEngine::new(["mobile"], false).with_fail_open(false))
        });
        let response = handler.search(&SearchParams::new(SUFFIX, "(uid=bob")).await;
        assert_eq!(response.code, ResultCode::OperationsError);
    }

    #[tokio::test]
    async fn size_limit_passes_partial_entries() {
        let mut session = MockUpstreamSession::new();
        session.expect_simple_bind().returning(|_, _| Ok(()));
        session.expect_search().returning(|_| {
            Ok(SearchResponse {
                entries: vec![person("a"), person("b")],
                referrals: vec!["ldap://replica.example.com/dc=example,dc=com".to_string()],
                code: ResultCode::SizeLimitExceeded,
            })
        });
        session.expect_unbind().returning(|| Ok(()));

        let handler = handler(connector_with(session), |backend| backend);
        let request = SearchParams::new(SUFFIX, "(objectClass=*)").with_limits(2, 0);
        let response = handler.search(&request).await;

        assert_eq!(response.code, ResultCode::SizeLimitExceeded);
        assert_eq!(response.entries.len(), 2);
        assert_eq!(response.referrals.len(), 1);
    }
}
