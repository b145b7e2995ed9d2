//! Session pool.
//!
//! Concurrent callers each check out one session, run commands on it, and
//! hand it back. The idle list is guarded by a mutex held only while a
//! session is pushed or popped; connecting happens outside the lock. The
//! number of sessions checked out at once is bounded by a semaphore whose
//! permit travels with the handle.
//!
//! When the settings say the process runs on the target host, every
//! acquisition returns a local handle that spawns PowerShell directly.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::local::LocalConnection;
use super::transport::TransportConnector;
use super::{Connection, ConnectionError, ConnectionResult, Connector};
use crate::config::Settings;

/// A session checked out of the pool.
///
/// Owned by exactly one caller until passed back to
/// [`SessionPool::release`]. Dropping a remote handle without releasing it
/// frees its slot but discards the session.
pub enum SessionHandle {
    /// Runs PowerShell on this machine.
    Local(Arc<dyn Connection>),
    /// A network session holding one of the pool's slots.
    Remote {
        conn: Arc<dyn Connection>,
        permit: OwnedSemaphorePermit,
    },
}

impl SessionHandle {
    /// The connection commands run through.
    pub fn connection(&self) -> &Arc<dyn Connection> {
        match self {
            SessionHandle::Local(conn) => conn,
            SessionHandle::Remote { conn, .. } => conn,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, SessionHandle::Local(_))
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_local() { "local" } else { "remote" };
        f.debug_struct("SessionHandle")
            .field("kind", &kind)
            .field("host", &self.connection().identifier())
            .finish()
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions waiting for reuse
    pub idle: usize,
    /// Sessions currently checked out
    pub in_use: usize,
    /// Maximum sessions checked out at once
    pub max_sessions: usize,
}

/// Bounded pool of sessions to one endpoint.
pub struct SessionPool {
    connector: Arc<dyn Connector>,
    local: Option<Arc<dyn Connection>>,
    idle: Mutex<Vec<Arc<dyn Connection>>>,
    permits: Arc<Semaphore>,
    max_sessions: usize,
    closed: AtomicBool,
}

impl SessionPool {
    /// Create a pool for `settings`, selecting the transport once.
    pub fn new(settings: Arc<Settings>) -> Self {
        let local = settings.is_connection_type_local();
        let max_sessions = settings.max_sessions.max(1);
        let connector = Arc::new(TransportConnector::new(settings));
        Self::with_connector(connector, max_sessions, local)
    }

    /// Create a pool around any [`Connector`].
    pub fn with_connector(connector: Arc<dyn Connector>, max_sessions: usize, local: bool) -> Self {
        let max_sessions = max_sessions.max(1);
        let local: Option<Arc<dyn Connection>> = if local {
            Some(Arc::new(LocalConnection::new()))
        } else {
            None
        };

        Self {
            connector,
            local,
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max_sessions)),
            max_sessions,
            closed: AtomicBool::new(false),
        }
    }

    /// True when acquisitions bypass the network.
    pub fn is_local(&self) -> bool {
        self.local.is_some()
    }

    /// Check out a session, reusing an idle one when available.
    ///
    /// Waits while `max_sessions` handles are checked out. Transport
    /// construction errors are returned as-is and never retried.
    pub async fn acquire(&self) -> ConnectionResult<SessionHandle> {
        if self.is_closed() {
            return Err(ConnectionError::PoolClosed);
        }

        if let Some(local) = &self.local {
            return Ok(SessionHandle::Local(Arc::clone(local)));
        }

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ConnectionError::PoolClosed)?;

        let reused = self.idle.lock().pop();
        let conn = match reused {
            Some(conn) => {
                debug!(host = %conn.identifier(), "Reusing pooled session");
                conn
            }
            None => {
                let conn = self.connector.connect().await?;
                debug!(host = %conn.identifier(), "Opened new session");
                conn
            }
        };

        Ok(SessionHandle::Remote { conn, permit })
    }

    /// Return a session to the pool. Local handles are accepted and ignored.
    pub fn release(&self, handle: SessionHandle) {
        match handle {
            SessionHandle::Local(_) => {}
            SessionHandle::Remote { conn, permit } => {
                // The closed check and the push share the idle lock so that
                // close_all cannot drain between them.
                let mut idle = self.idle.lock();
                if self.is_closed() {
                    debug!(host = %conn.identifier(), "Discarding session released after close");
                } else {
                    idle.push(conn);
                }
                drop(idle);
                drop(permit);
            }
        }
    }

    /// Close every idle session and refuse further acquisitions.
    pub async fn close_all(&self) {
        let drained: Vec<_> = {
            let mut idle = self.idle.lock();
            self.closed.store(true, Ordering::SeqCst);
            std::mem::take(&mut *idle)
        };
        self.permits.close();

        for conn in drained {
            if let Err(e) = conn.close().await {
                warn!(host = %conn.identifier(), error = %e, "Failed to close session");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        let in_use = if self.is_closed() {
            0
        } else {
            self.max_sessions - self.permits.available_permits()
        };
        PoolStats {
            idle: self.idle.lock().len(),
            in_use,
            max_sessions: self.max_sessions,
        }
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("local", &self.is_local())
            .field("stats", &self.stats())
            .finish()
    }
}
