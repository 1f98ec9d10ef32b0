//! Everything the proxy needs to serve one configured backend.

use crate::config::UpstreamConfig;
use crate::filter::FilterNode;
use crate::pool::ConnectionPool;
use crate::rename::AttributeRenamer;
use crate::rewrite::FilterRewriteEngine;
use crate::upstream::LdapConnector;
use crate::Result;
use ldap_proxy_core::config::BackendConfig;
use ldap_proxy_core::types::{DirectoryEntry, SearchParams};
use std::sync::Arc;
use std::time::Duration;

const ACCOUNT_OBJECT_CLASS: &str = "posixAccount";
const ACCOUNT_LOOKUP_ATTRIBUTES: &[&str] = &["uid", "mobile", "mail", "sAMAccountName"];

/// A backend bundle: session pool, rename table, filter rewriting and search augmentation.
///
/// Immutable once built.
#[derive(Debug)]
pub struct Backend {
    suffix: String,
    pool: ConnectionPool,
    renamer: AttributeRenamer,
    engine: FilterRewriteEngine,
    extra_attributes: Vec<String>,
    skip_rename_single_attribute: bool,
    first_entry_for_account_lookup: bool,
}

impl Backend {
    /// Creates a backend with no renames, no filter rewriting and no extra attributes.
    pub fn new(suffix: impl Into<String>, pool: ConnectionPool) -> Self {
        Self {
            suffix: suffix.into(),
            pool,
            renamer: AttributeRenamer::default(),
            engine: FilterRewriteEngine::new(Vec::<String>::new(), false),
            extra_attributes: Vec::new(),
            skip_rename_single_attribute: false,
            first_entry_for_account_lookup: true,
        }
    }

    /// Builds a backend and its `ldap3` connector from its configuration.
    ///
    /// No connection is opened until the first request.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream URL is invalid.
    pub fn from_config(
        config: &BackendConfig,
        connection_timeout: Duration,
        operation_timeout: Duration,
    ) -> Result<Self> {
        let upstream = UpstreamConfig::from_backend(config, connection_timeout, operation_timeout)?;
        let pool = ConnectionPool::new(
            config.suffix_dn.clone(),
            Arc::new(LdapConnector::new(upstream)?),
            config.service_account(),
            config.client_pool_size,
        );
        let engine = FilterRewriteEngine::new(
            config.exclude_filter_keys.iter().cloned(),
            config.rewrite_or_to_and,
        )
        .with_fail_open(config.fail_open_filter_rewrite);

        Ok(Self::new(config.suffix_dn.clone(), pool)
            .with_renamer(AttributeRenamer::from_rules(&config.swap_attribute_name_rule))
            .with_engine(engine)
            .with_extra_attributes(config.extra_attributes.iter().cloned())
            .with_skip_rename_single_attribute(config.skip_rename_single_attribute)
            .with_first_entry_for_account_lookup(config.first_entry_for_account_lookup))
    }

    /// Sets the attribute rename table.
    #[must_use]
    pub fn with_renamer(mut self, renamer: AttributeRenamer) -> Self {
        self.renamer = renamer;
        self
    }

    /// Sets the filter rewrite engine.
    #[must_use]
    pub fn with_engine(mut self, engine: FilterRewriteEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Sets the attributes appended to every search.
    #[must_use]
    pub fn with_extra_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Leave entries that carry a single attribute un-renamed.
    #[must_use]
    pub const fn with_skip_rename_single_attribute(mut self, skip: bool) -> Self {
        self.skip_rename_single_attribute = skip;
        self
    }

    /// Return only the first entry for account lookup filters.
    #[must_use]
    pub const fn with_first_entry_for_account_lookup(mut self, enabled: bool) -> Self {
        self.first_entry_for_account_lookup = enabled;
        self
    }

    /// Routing suffix.
    #[must_use]
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Session pool.
    #[must_use]
    pub const fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Filter rewrite engine.
    #[must_use]
    pub const fn engine(&self) -> &FilterRewriteEngine {
        &self.engine
    }

    /// Rename table.
    #[must_use]
    pub const fn renamer(&self) -> &AttributeRenamer {
        &self.renamer
    }

    /// Attributes appended to every search.
    #[must_use]
    pub fn extra_attributes(&self) -> &[String] {
        &self.extra_attributes
    }

    /// Builds the upstream request: the client's request with the rewritten filter and the extra
    /// attributes appended to the requested ones.
    #[must_use]
    pub fn upstream_request(&self, request: &SearchParams, filter: String) -> SearchParams {
        let mut attributes = request.attributes.clone();
        attributes.extend(self.extra_attributes.iter().cloned());
        SearchParams {
            filter,
            attributes,
            ..request.clone()
        }
    }

    /// Translates upstream entries for the client.
    ///
    /// Attribute names are renamed (unless the entry has a single attribute and the backend skips
    /// those). When `original_filter` is an account lookup and the workaround is enabled, only
    /// the first entry is kept.
    #[must_use]
    pub fn translate_entries(
        &self,
        original_filter: &str,
        entries: Vec<DirectoryEntry>,
    ) -> Vec<DirectoryEntry> {
        let mut translated: Vec<DirectoryEntry> = entries
            .into_iter()
            .map(|entry| self.rename_entry(entry))
            .collect();
        if self.first_entry_for_account_lookup
            && translated.len() > 1
            && FilterNode::parse(original_filter).is_ok_and(|node| is_account_lookup(&node))
        {
            translated.truncate(1);
        }
        translated
    }

    fn rename_entry(&self, entry: DirectoryEntry) -> DirectoryEntry {
        if self.skip_rename_single_attribute && entry.attributes.len() == 1 {
            return entry;
        }
        self.renamer.rename_entry(entry)
    }
}

/// Whether a filter is the account lookup pattern: a conjunction holding
/// `(objectClass=posixAccount)` and a disjunction of equality clauses on `uid`, `mobile`, `mail`
/// or `sAMAccountName`.
#[must_use]
pub fn is_account_lookup(filter: &FilterNode) -> bool {
    let FilterNode::And(children) = filter else {
        return false;
    };

    let has_object_class = children.iter().any(|child| {
        matches!(
            child,
            FilterNode::Equality { attribute, value }
                if attribute.eq_ignore_ascii_case("objectClass")
                    && value.eq_ignore_ascii_case(ACCOUNT_OBJECT_CLASS)
        )
    });

    let has_identifier_disjunction = children.iter().any(|child| match child {
        FilterNode::Or(alternatives) => alternatives.iter().all(|alternative| {
            matches!(
                alternative,
                FilterNode::Equality { attribute, .. }
                    if ACCOUNT_LOOKUP_ATTRIBUTES
                        .iter()
                        .any(|name| name.eq_ignore_ascii_case(attribute))
            )
        }),
        _ => false,
    });

    has_object_class && has_identifier_disjunction
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::MockUpstreamConnector;
    use ldap_proxy_core::types::{BindCredentials, EntryAttribute};

    fn backend() -> Backend {
        let pool = ConnectionPool::new(
            "dc=example,dc=com",
            Arc::new(MockUpstreamConnector::new()),
            BindCredentials::new("cn=svc", "pw"),
            1,
        );
        Backend::new("dc=example,dc=com", pool)
            .with_renamer(AttributeRenamer::from_rules(["uid<->sAMAccountName"]))
            .with_extra_attributes(["memberOf", "uid"])
    }

    fn entry(dn: &str, attributes: &[&str]) -> DirectoryEntry {
        DirectoryEntry::new(
            dn,
            attributes
                .iter()
                .map(|name| EntryAttribute::new(*name, ["x"]))
                .collect(),
        )
    }

    fn lookup(filter: &str) -> bool {
        is_account_lookup(&FilterNode::parse(filter).unwrap())
    }

    #[test]
    fn account_lookup_pattern() {
        assert!(lookup(
            "(&(objectClass=posixAccount)(|(uid=bob)(mail=bob@x.com)))"
        ));
        assert!(lookup(
            "(&(|(sAMAccountName=bob)(mobile=123))(objectclass=POSIXACCOUNT))"
        ));
        assert!(!lookup("(&(objectClass=posixAccount)(uid=bob))"));
        assert!(!lookup("(&(objectClass=person)(|(uid=bob)(mail=bob@x.com)))"));
        assert!(!lookup(
            "(&(objectClass=posixAccount)(|(uid=bob)(cn=bob)))"
        ));
        assert!(!lookup(
            "(|(objectClass=posixAccount)(|(uid=bob)(mail=bob@x.com)))"
        ));
    }

    #[test]
    fn extra_attributes_are_appended_without_dedup() {
        let request = SearchParams::new("dc=example,dc=com", "(uid=bob)").with_attributes(["uid"]);
        let upstream = backend().upstream_request(&request, "(sAMAccountName=bob)".to_string());
        assert_eq!(upstream.attributes, vec!["uid", "memberOf", "uid"]);
        assert_eq!(upstream.filter, "(sAMAccountName=bob)");
        assert_eq!(upstream.base_dn, request.base_dn);
        assert_eq!(upstream.scope, request.scope);
    }

    #[test]
    fn entries_are_renamed() {
        let translated = backend().translate_entries(
            "(cn=*)",
            vec![entry("cn=a,dc=example,dc=com", &["sAMAccountName", "mail"])],
        );
        assert_eq!(translated[0].attribute_names(), vec!["uid", "mail"]);
    }

    #[test]
    fn single_attribute_entries_respect_skip_flag() {
        let single = || vec![entry("cn=a,dc=example,dc=com", &["sAMAccountName"])];

        let renamed = backend().translate_entries("(cn=*)", single());
        assert_eq!(renamed[0].attribute_names(), vec!["uid"]);

        let skipped = backend()
            .with_skip_rename_single_attribute(true)
            .translate_entries("(cn=*)", single());
        assert_eq!(skipped[0].attribute_names(), vec!["sAMAccountName"]);
    }

    #[test]
    fn account_lookup_keeps_first_entry_only() {
        let entries = vec![
            entry("uid=bob,ou=a,dc=example,dc=com", &["uid"]),
            entry("uid=bob,ou=b,dc=example,dc=com", &["uid"]),
            entry("uid=bob,ou=c,dc=example,dc=com", &["uid"]),
        ];
        let filter = "(&(objectClass=posixAccount)(|(uid=bob)(mail=bob@x.com)))";

        let translated = backend().translate_entries(filter, entries.clone());
        assert_eq!(translated.len(), 1);
        assert_eq!(translated[0].dn, "uid=bob,ou=a,dc=example,dc=com");

        let disabled = backend()
            .with_first_entry_for_account_lookup(false)
            .translate_entries(filter, entries.clone());
        assert_eq!(disabled.len(), 3);

        let other = backend().translate_entries("(objectClass=posixAccount)", entries);
        assert_eq!(other.len(), 3);
    }
}
