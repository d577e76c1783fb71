//! SessionRegistry: bidirectional map between live connections and session ids.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::client::{ClientConnection, ConnectionId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} already has a session")]
    AlreadyRegistered(ConnectionId),
}

/// One registered session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub connection: Arc<ClientConnection>,
    pub created_at: DateTime<Utc>,
}

/// Diagnostic snapshot of a session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub connection_id: String,
    pub remote_addr: SocketAddr,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryInner {
    by_connection: HashMap<ConnectionId, Session>,
    by_session: HashMap<String, Arc<ClientConnection>>,
}

/// Maps connections to session ids and back.
///
/// Both directions live behind one `RwLock`, so a reader never observes a
/// session in one map but not the other. Session ids are
/// `"{client_ip}_{n}"` with `n` drawn from a per-registry counter and never
/// reused.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
    next_token: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a session id to `conn` and store both directions.
    pub fn register(&self, conn: Arc<ClientConnection>) -> Result<String, RegistryError> {
        let mut inner = self.inner.write();
        if inner.by_connection.contains_key(&conn.id()) {
            return Err(RegistryError::AlreadyRegistered(conn.id()));
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        let session_id = format!("{}_{}", conn.client_ip(), token);

        inner.by_session.insert(session_id.clone(), conn.clone());
        inner.by_connection.insert(
            conn.id(),
            Session {
                id: session_id.clone(),
                connection: conn,
                created_at: Utc::now(),
            },
        );

        Ok(session_id)
    }

    /// Find the live connection holding `session_id`.
    pub fn lookup(&self, session_id: &str) -> Option<Arc<ClientConnection>> {
        self.inner.read().by_session.get(session_id).cloned()
    }

    /// Session id currently held by a connection.
    pub fn session_of(&self, conn_id: ConnectionId) -> Option<String> {
        self.inner.read().by_connection.get(&conn_id).map(|s| s.id.clone())
    }

    /// Remove a connection. Unknown connections are ignored.
    pub fn deregister(&self, conn_id: ConnectionId) -> Option<Session> {
        let mut inner = self.inner.write();
        let session = inner.by_connection.remove(&conn_id)?;
        inner.by_session.remove(&session.id);
        debug!(session_id = %session.id, "session deregistered");
        Some(session)
    }

    pub fn active_count(&self) -> usize {
        self.inner.read().by_connection.len()
    }

    /// Connections currently registered.
    pub fn connections(&self) -> Vec<Arc<ClientConnection>> {
        self.inner
            .read()
            .by_connection
            .values()
            .map(|s| s.connection.clone())
            .collect()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.inner
            .read()
            .by_connection
            .values()
            .map(|s| SessionInfo {
                session_id: s.id.clone(),
                connection_id: s.connection.id().to_string(),
                remote_addr: s.connection.remote_addr(),
                created_at: s.created_at,
            })
            .collect()
    }

    /// Drop every session, returning the connections that held them.
    pub fn clear(&self) -> Vec<Arc<ClientConnection>> {
        let mut inner = self.inner.write();
        inner.by_session.clear();
        inner.by_connection.drain().map(|(_, s)| s.connection).collect()
    }
}
