//! Request-translating LDAP proxy.
//!
//! Clients bind and search against the proxy as if it were a directory server. Each request is
//! routed by DN suffix to an upstream backend, its filter is rewritten to suit that backend, the
//! search runs on a pooled upstream session and attribute names in the results are translated
//! back before they are returned.

#![deny(missing_docs)]

mod backend;
mod codec;
mod config;
mod filter;
mod handler;
mod pool;
mod rename;
mod rewrite;
mod router;
mod server;
mod upstream;

pub use backend::Backend;
pub use config::UpstreamConfig;
pub use filter::{FilterError, FilterNode};
pub use handler::ProxyHandler;
pub use pool::{ConnectionPool, PoolStats, PooledSession};
pub use rename::AttributeRenamer;
pub use rewrite::{drop_attributes, rewrite_or_to_and, FilterRewriteEngine, Rewritten};
pub use router::BackendRouter;
pub use server::{serve, LdapServer};
pub use upstream::{LdapConnector, UpstreamConnector, UpstreamSession};

/// Convenient result alias that reuses the core error type.
pub type Result<T> = ldap_proxy_core::Result<T>;
