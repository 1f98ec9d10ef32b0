//! Protocol-neutral request and response types.
//!
//! The listener decodes wire messages into these types, the handler works on them, and the
//! upstream client encodes them again. Keeping them free of any codec crate lets the pipeline be
//! tested without sockets.

use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use subtle::ConstantTimeEq;

/// Search breadth requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchScope {
    /// The base entry only.
    Base,
    /// Immediate children of the base entry.
    OneLevel,
    /// The base entry and everything below it.
    Subtree,
    /// Everything below the base entry, excluding the base entry.
    Children,
}

impl SearchScope {
    /// Maps an RFC 4511 scope code onto a scope.
    ///
    /// Unknown codes widen to [`SearchScope::Subtree`].
    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Base,
            1 => Self::OneLevel,
            3 => Self::Children,
            _ => Self::Subtree,
        }
    }

    /// RFC 4511 scope code.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Base => 0,
            Self::OneLevel => 1,
            Self::Subtree => 2,
            Self::Children => 3,
        }
    }
}

/// Alias dereferencing policy requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DerefPolicy {
    /// Never dereference aliases.
    Never,
    /// Dereference while searching below the base.
    Searching,
    /// Dereference when locating the base object.
    FindingBase,
    /// Always dereference.
    Always,
}

impl DerefPolicy {
    /// Maps an RFC 4511 `derefAliases` code onto a policy.
    ///
    /// Unknown codes widen to [`DerefPolicy::Always`].
    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Never,
            1 => Self::Searching,
            2 => Self::FindingBase,
            _ => Self::Always,
        }
    }

    /// RFC 4511 `derefAliases` code.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Never => 0,
            Self::Searching => 1,
            Self::FindingBase => 2,
            Self::Always => 3,
        }
    }
}

/// Result codes the proxy reports to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// `success` (0)
    Success,
    /// `operationsError` (1)
    OperationsError,
    /// `sizeLimitExceeded` (4)
    SizeLimitExceeded,
    /// `invalidCredentials` (49)
    InvalidCredentials,
    /// `unwillingToPerform` (53)
    UnwillingToPerform,
}

impl ResultCode {
    /// Numeric LDAP result code.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::OperationsError => 1,
            Self::SizeLimitExceeded => 4,
            Self::InvalidCredentials => 49,
            Self::UnwillingToPerform => 53,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::OperationsError => "operationsError",
            Self::SizeLimitExceeded => "sizeLimitExceeded",
            Self::InvalidCredentials => "invalidCredentials",
            Self::UnwillingToPerform => "unwillingToPerform",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// One attribute of a directory entry with its values in server order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryAttribute {
    /// Attribute description as sent by the server.
    pub name: String,
    /// Raw attribute values.
    pub values: Vec<Vec<u8>>,
}

impl EntryAttribute {
    /// Creates an attribute from textual values.
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values
                .into_iter()
                .map(|value| value.into().into_bytes())
                .collect(),
        }
    }
}

/// A search result entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Distinguished name of the entry.
    pub dn: String,
    /// Attributes of the entry. Renaming keeps their order.
    pub attributes: Vec<EntryAttribute>,
}

impl DirectoryEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(dn: impl Into<String>, attributes: Vec<EntryAttribute>) -> Self {
        Self {
            dn: dn.into(),
            attributes,
        }
    }

    /// Returns the attribute with the given name (case-insensitive).
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&EntryAttribute> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name.eq_ignore_ascii_case(name))
    }

    /// Returns the attribute names in order.
    #[must_use]
    pub fn attribute_names(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .map(|attribute| attribute.name.as_str())
            .collect()
    }
}

/// A search request as seen by the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParams {
    /// Search base.
    pub base_dn: String,
    /// Search scope.
    pub scope: SearchScope,
    /// Alias dereferencing policy.
    pub deref: DerefPolicy,
    /// Maximum number of entries (0 means no limit).
    pub size_limit: i32,
    /// Maximum time in seconds (0 means no limit).
    pub time_limit: i32,
    /// Return attribute names only.
    pub types_only: bool,
    /// RFC 4515 filter string.
    pub filter: String,
    /// Requested attribute names.
    pub attributes: Vec<String>,
}

impl SearchParams {
    /// Creates a subtree search without limits.
    #[must_use]
    pub fn new(base_dn: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            base_dn: base_dn.into(),
            scope: SearchScope::Subtree,
            deref: DerefPolicy::Never,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: filter.into(),
            attributes: Vec::new(),
        }
    }

    /// Overrides the scope.
    #[must_use]
    pub const fn with_scope(mut self, scope: SearchScope) -> Self {
        self.scope = scope;
        self
    }

    /// Overrides the deref policy.
    #[must_use]
    pub const fn with_deref(mut self, deref: DerefPolicy) -> Self {
        self.deref = deref;
        self
    }

    /// Overrides the size and time limits.
    #[must_use]
    pub const fn with_limits(mut self, size_limit: i32, time_limit: i32) -> Self {
        self.size_limit = size_limit;
        self.time_limit = time_limit;
        self
    }

    /// Sets the requested attributes.
    #[must_use]
    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }
}

/// The outcome of a proxied search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    /// Entries to return to the client.
    pub entries: Vec<DirectoryEntry>,
    /// Referral URIs.
    pub referrals: Vec<String>,
    /// Final result code.
    pub code: ResultCode,
}

impl SearchResponse {
    /// A response carrying only a result code.
    #[must_use]
    pub const fn from_code(code: ResultCode) -> Self {
        Self {
            entries: Vec::new(),
            referrals: Vec::new(),
            code,
        }
    }
}

/// A bind DN and password pair.
///
/// Used both for the proxy's own admin identity and for backend service accounts. The password is
/// kept behind [`SecretString`] so it never ends up in `Debug` output.
#[derive(Debug, Clone)]
pub struct BindCredentials {
    bind_dn: String,
    password: SecretString,
}

impl BindCredentials {
    /// Creates a credential pair.
    #[must_use]
    pub fn new(bind_dn: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            bind_dn: bind_dn.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Creates a credential pair from an already secret password.
    #[must_use]
    pub fn from_secret(bind_dn: impl Into<String>, password: SecretString) -> Self {
        Self {
            bind_dn: bind_dn.into(),
            password,
        }
    }

    /// Get the LDAP bind DN.
    #[must_use]
    pub fn bind_dn(&self) -> &str {
        &self.bind_dn
    }

    /// Get the LDAP bind password.
    #[must_use]
    pub fn bind_password(&self) -> &str {
        self.password.expose_secret()
    }

    /// Compares a DN/password pair against these credentials.
    ///
    /// The DN comparison is exact; the password comparison runs in constant time.
    #[must_use]
    pub fn matches(&self, dn: &str, password: &str) -> bool {
        let password_matches: bool = self
            .password
            .expose_secret()
            .as_bytes()
            .ct_eq(password.as_bytes())
            .into();
        self.bind_dn == dn && password_matches
    }
}
