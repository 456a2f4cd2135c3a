//! Session table

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use kp_protocol::SessionKey;

use super::client::ClientId;
use super::session::Session;

/// Live sessions indexed by key, shared by every client connection
///
/// Lookups and structural changes only hold a shard lock for the duration
/// of the map operation, never across an await.
pub struct SessionTable {
    sessions: DashMap<SessionKey, Arc<Session>>,
    creating: DashMap<SessionKey, Arc<Mutex<()>>>,
}

/// Exclusive right to create the session for one key
pub struct CreationGuard<'a> {
    table: &'a SessionTable,
    key: SessionKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.table
            .creating
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl SessionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            creating: DashMap::new(),
        }
    }

    /// Serialize creation for a key
    ///
    /// Holders run check-then-create without racing other requests for the
    /// same key. Different keys never wait on each other.
    pub async fn creation_lock(&self, key: &SessionKey) -> CreationGuard<'_> {
        let lock = {
            let entry = self.creating.entry(key.clone()).or_default();
            Arc::clone(entry.value())
        };
        let guard = lock.lock_owned().await;
        CreationGuard {
            table: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Get a session by key
    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|r| Arc::clone(&r))
    }

    /// Register a session, returning the one it replaced
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions.insert(session.key().clone(), session)
    }

    /// Remove a session by key
    pub fn remove(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.remove(key).map(|(_, s)| s)
    }

    /// Remove the entry only if it is still this exact session
    pub fn remove_if_same(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(session.key(), |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    /// All sessions
    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|r| Arc::clone(&r)).collect()
    }

    /// Sessions owned by one client connection
    pub fn list_for_client(&self, client: ClientId) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|r| r.owner() == client)
            .map(|r| Arc::clone(&r))
            .collect()
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
