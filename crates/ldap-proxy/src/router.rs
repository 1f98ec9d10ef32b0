//! DN suffix routing.

use crate::backend::Backend;
use crate::Result;
use ldap_proxy_core::config::ProxyConfig;
use ldap_proxy_core::Error;
use std::sync::Arc;

/// Maps distinguished names to backends by suffix.
///
/// Backends are kept ordered longest suffix first, so when configured suffixes overlap the most
/// specific one wins. Matching is a case-sensitive string suffix test.
#[derive(Debug, Default)]
pub struct BackendRouter {
    backends: Vec<Arc<Backend>>,
}

impl BackendRouter {
    /// Creates a router over the given backends.
    #[must_use]
    pub fn new(backends: Vec<Backend>) -> Self {
        let mut backends: Vec<Arc<Backend>> = backends.into_iter().map(Arc::new).collect();
        // Stable sort keeps configuration order among equal lengths.
        backends.sort_by(|a, b| b.suffix().len().cmp(&a.suffix().len()));
        Self { backends }
    }

    /// Builds every configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend's upstream settings are invalid.
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let backends = config
            .ldap_config
            .iter()
            .map(|backend| {
                Backend::from_config(
                    backend,
                    config.connection_timeout(),
                    config.operation_timeout(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(backends))
    }

    /// Returns the backend serving `dn`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoBackend`] when no configured suffix matches.
    pub fn resolve(&self, dn: &str) -> Result<Arc<Backend>> {
        self.backends
            .iter()
            .find(|backend| dn.ends_with(backend.suffix()))
            .cloned()
            .ok_or_else(|| Error::NoBackend(dn.to_string()))
    }

    /// Backends in match order.
    pub fn backends(&self) -> impl Iterator<Item = &Backend> {
        self.backends.iter().map(|backend| &**backend)
    }

    /// Number of configured backends.
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether no backend is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ConnectionPool;
    use crate::upstream::MockUpstreamConnector;
    use ldap_proxy_core::types::BindCredentials;

    fn backend(suffix: &str) -> Backend {
        let pool = ConnectionPool::new(
            suffix,
            Arc::new(MockUpstreamConnector::new()),
            BindCredentials::new("cn=svc", "pw"),
            1,
        );
        Backend::new(suffix, pool)
    }

    #[test]
    fn resolves_single_suffix() {
        let router = BackendRouter::new(vec![backend("dc=example,dc=com")]);
        let resolved = router
            .resolve("uid=bob,ou=people,dc=example,dc=com")
            .unwrap();
        assert_eq!(resolved.suffix(), "dc=example,dc=com");
        assert_eq!(
            router.resolve("uid=bob,dc=other,dc=org").unwrap_err(),
            Error::NoBackend("uid=bob,dc=other,dc=org".to_string())
        );
    }

    #[test]
    fn longest_suffix_wins() {
        let router = BackendRouter::new(vec![
            backend("dc=example,dc=com"),
            backend("ou=people,dc=example,dc=com"),
        ]);
        assert_eq!(
            router
                .resolve("uid=bob,ou=people,dc=example,dc=com")
                .unwrap()
                .suffix(),
            "ou=people,dc=example,dc=com"
        );
        assert_eq!(
            router
                .resolve("cn=admins,ou=groups,dc=example,dc=com")
                .unwrap()
                .suffix(),
            "dc=example,dc=com"
        );
        let order: Vec<&str> = router.backends().map(Backend::suffix).collect();
        assert_eq!(order, vec!["ou=people,dc=example,dc=com", "dc=example,dc=com"]);
    }

    #[test]
    fn matching_is_case_sensitive() {
        let router = BackendRouter::new(vec![backend("dc=example,dc=com")]);
        assert!(matches!(
            router.resolve("uid=bob,DC=example,DC=com"),
            Err(Error::NoBackend(_))
        ));
    }

    #[test]
    fn empty_suffix_catches_everything() {
        let router = BackendRouter::new(vec![backend(""), backend("dc=example,dc=com")]);
        assert_eq!(
            router.resolve("uid=bob,dc=example,dc=com").unwrap().suffix(),
            "dc=example,dc=com"
        );
        assert_eq!(router.resolve("o=elsewhere").unwrap().suffix(), "");
        assert_eq!(router.resolve("").unwrap().suffix(), "");
    }

    #[test]
    fn empty_router() {
        let router = BackendRouter::default();
        assert!(router.is_empty());
        assert!(matches!(
            router.resolve("dc=example,dc=com"),
            Err(Error::NoBackend(dn)) if dn == "dc=example,dc=com"
        ));
    }

    #[test]
    fn from_config_builds_every_backend() {
        let config = ProxyConfig::from_yaml_str(
            r#"
servAddr: "127.0.0.1:3389"
servUser: "cn=proxy"
servPass: "pw"
ldapConfig:
  - suffixDN: "dc=example,dc=com"
    ldapURL: "ldap://localhost:389"
    bindDN: "cn=svc"
    bindPW: "svc"
  - suffixDN: "dc=corp,dc=example,dc=com"
    ldapURL: "ldaps://ad.example.com"
    bindDN: "cn=svc"
    bindPW: "svc"
    clientPoolSize: 3
"#,
        )
        .unwrap();
        let router = BackendRouter::from_config(&config).unwrap();
        assert_eq!(router.len(), 2);
        let corp = router.resolve("uid=x,dc=corp,dc=example,dc=com").unwrap();
        assert_eq!(corp.suffix(), "dc=corp,dc=example,dc=com");
        assert_eq!(corp.pool().max_idle(), 3);
    }
}
