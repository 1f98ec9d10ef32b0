//! Bounded pool of authenticated upstream sessions.

use crate::upstream::{UpstreamConnector, UpstreamSession};
use crate::Result;
use ldap_proxy_core::types::{BindCredentials, SearchParams, SearchResponse};
use ldap_proxy_core::Error;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Snapshot of pool accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Sessions dialed since the pool was created.
    pub dialed: u64,
    /// Sessions closed by the pool.
    pub closed: u64,
    /// Sessions currently idle.
    pub idle: usize,
}

struct PoolInner {
    name: String,
    connector: Arc<dyn UpstreamConnector>,
    service: BindCredentials,
    max_idle: usize,
    idle: Mutex<VecDeque<Box<dyn UpstreamSession>>>,
    dialed: AtomicU64,
    closed: AtomicU64,
}

impl PoolInner {
    fn release(&self, session: Box<dyn UpstreamSession>) {
        let rejected = {
            let mut idle = self.idle.lock();
            if idle.len() < self.max_idle {
                idle.push_back(session);
                None
            } else {
                Some(session)
            }
        };
        if let Some(session) = rejected {
            debug!(backend = %self.name, "idle set full, closing session");
            self.close(session);
        }
    }

    fn close(&self, mut session: Box<dyn UpstreamSession>) {
        self.closed.fetch_add(1, Ordering::Relaxed);
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let name = self.name.clone();
        handle.spawn(async move {
            if let Err(err) = session.unbind().await {
                debug!(backend = %name, error = %err, "unbind of closed session failed");
            }
        });
    }
}

/// Pool of upstream sessions for one backend.
///
/// Idle sessions are handed out first-in first-out. When none is idle a new session is dialed and
/// bound with the service account. Acquisition never waits for capacity: the idle bound only
/// limits how many sessions are kept once released.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool keeping at most `max_idle` released sessions.
    pub fn new(
        name: impl Into<String>,
        connector: Arc<dyn UpstreamConnector>,
        service: BindCredentials,
        max_idle: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                connector,
                service,
                max_idle,
                idle: Mutex::new(VecDeque::with_capacity(max_idle)),
                dialed: AtomicU64::new(0),
                closed: AtomicU64::new(0),
            }),
        }
    }

    /// Takes an idle session or dials and binds a new one.
    ///
    /// The returned guard gives the session back to the pool when dropped.
    ///
    /// # Errors
    ///
    /// Returns the dial or bind error. Nothing is retried.
    pub async fn acquire(&self) -> Result<PooledSession> {
        let idle = self.inner.idle.lock().pop_front();
        let session = match idle {
            Some(session) => session,
            None => self.dial().await?,
        };
        Ok(PooledSession {
            session: Some(session),
            pool: Arc::clone(&self.inner),
            discard: false,
        })
    }

    /// Returns a session to the idle set, or closes it when the idle set is full.
    ///
    /// Never blocks.
    pub fn release(&self, session: Box<dyn UpstreamSession>) {
        self.inner.release(session);
    }

    /// Binds the session as the backend's service account again.
    ///
    /// Required before a search on a session acquired from the pool, since its last user may
    /// have bound it as somebody else.
    ///
    /// # Errors
    ///
    /// Returns the upstream bind error.
    pub async fn rebind_service_account(&self, session: &mut PooledSession) -> Result<()> {
        let service = &self.inner.service;
        session
            .simple_bind(service.bind_dn(), service.bind_password())
            .await
    }

    /// Current accounting counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            dialed: self.inner.dialed.load(Ordering::Relaxed),
            closed: self.inner.closed.load(Ordering::Relaxed),
            idle: self.inner.idle.lock().len(),
        }
    }

    /// Maximum number of idle sessions kept.
    #[must_use]
    pub fn max_idle(&self) -> usize {
        self.inner.max_idle
    }

    async fn dial(&self) -> Result<Box<dyn UpstreamSession>> {
        let mut session = self.inner.connector.connect().await?;
        self.inner.dialed.fetch_add(1, Ordering::Relaxed);
        debug!(backend = %self.inner.name, "dialed upstream session");

        let service = &self.inner.service;
        if let Err(err) = session
            .simple_bind(service.bind_dn(), service.bind_password())
            .await
        {
            warn!(
                backend = %self.inner.name,
                bind_dn = service.bind_dn(),
                error = %err,
                "service account bind failed"
            );
            self.inner.close(session);
            return Err(err);
        }
        Ok(session)
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.name)
            .field("max_idle", &self.inner.max_idle)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// A session on loan from a [`ConnectionPool`].
///
/// Dropping the guard releases the session. A session whose operation failed at the transport
/// level, or that was explicitly [discarded](Self::discard), is closed instead.
pub struct PooledSession {
    session: Option<Box<dyn UpstreamSession>>,
    pool: Arc<PoolInner>,
    discard: bool,
}

impl PooledSession {
    /// Runs a simple bind on the session.
    ///
    /// # Errors
    ///
    /// Returns the upstream error; transport errors also mark the session for closing.
    pub async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()> {
        let session = self.session_mut()?;
        let result = session.simple_bind(dn, password).await;
        self.note(result)
    }

    /// Runs a search on the session.
    ///
    /// # Errors
    ///
    /// Returns the upstream error; transport errors also mark the session for closing.
    pub async fn search(&mut self, request: &SearchParams) -> Result<SearchResponse> {
        let session = self.session_mut()?;
        let result = session.search(request).await;
        self.note(result)
    }

    /// Marks the session to be closed instead of released.
    pub fn discard(&mut self) {
        self.discard = true;
    }

    /// Whether the session will be closed when the guard drops.
    #[must_use]
    pub const fn is_discarded(&self) -> bool {
        self.discard
    }

    fn session_mut(&mut self) -> Result<&mut Box<dyn UpstreamSession>> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::ConnectionError("session already returned to pool".to_string()))
    }

    fn note<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_transport() {
                self.discard = true;
            }
        }
        result
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if self.discard {
                debug!(backend = %self.pool.name, "closing discarded session");
                self.pool.close(session);
            } else {
                self.pool.release(session);
            }
        }
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("backend", &self.pool.name)
            .field("discard", &self.discard)
            .finish_non_exhaustive()
    }
}
