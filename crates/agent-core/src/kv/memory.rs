//! In-process key-value store with Consul-like semantics.
//!
//! Sessions expire exactly `ttl` after creation (nothing in this system renews
//! them). Expired sessions release their keys lazily, on the next store call,
//! the same way Consul's "release" session behavior leaves the value in place
//! and only clears the holder.

use super::{KvEntry, KvStore, SessionId};
use crate::{AgentError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredKey {
    value: Bytes,
    modify_index: u64,
    session: Option<SessionId>,
}

#[derive(Default)]
struct MemoryState {
    /// Last index handed out; every write takes the next one.
    index: u64,
    keys: BTreeMap<String, StoredKey>,
    /// Session id -> expiry
    sessions: HashMap<SessionId, Instant>,
}

impl MemoryState {
    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn expire_sessions(&mut self, now: Instant) {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, expiry)| **expiry <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for session in expired {
            debug!("Session {} expired", session);
            self.drop_session(&session);
        }
    }

    fn drop_session(&mut self, session: &SessionId) {
        self.sessions.remove(session);
        let held: Vec<String> = self
            .keys
            .iter()
            .filter(|(_, stored)| stored.session.as_ref() == Some(session))
            .map(|(key, _)| key.clone())
            .collect();
        for key in held {
            let index = self.next_index();
            if let Some(stored) = self.keys.get_mut(&key) {
                stored.session = None;
                stored.modify_index = index;
            }
        }
    }

    fn entry(key: &str, stored: &StoredKey) -> KvEntry {
        KvEntry {
            key: key.to_string(),
            value: stored.value.clone(),
            modify_index: stored.modify_index,
            session: stored.session.clone(),
        }
    }
}

/// Key-value store held entirely in memory.
///
/// Cloning shares the underlying state, so clones behave like several
/// clients of one server.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.expire_sessions(Instant::now());
        state.sessions.len()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let mut state = self.state.lock().await;
        state.expire_sessions(Instant::now());
        Ok(state.keys.get(key).map(|stored| MemoryState::entry(key, stored)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let mut state = self.state.lock().await;
        state.expire_sessions(Instant::now());
        Ok(state
            .keys
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, stored)| MemoryState::entry(key, stored))
            .collect())
    }

    async fn put_cas(&self, key: &str, value: &[u8], cas: u64) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.expire_sessions(Instant::now());

        let current = state.keys.get(key).map(|stored| stored.modify_index);
        let matches = match current {
            None => cas == 0,
            Some(index) => index == cas,
        };
        if !matches {
            return Ok(false);
        }

        let index = state.next_index();
        let session = state.keys.get(key).and_then(|stored| stored.session.clone());
        state.keys.insert(
            key.to_string(),
            StoredKey {
                value: Bytes::copy_from_slice(value),
                modify_index: index,
                session,
            },
        );
        Ok(true)
    }

    async fn delete_cas(&self, key: &str, cas: u64) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.expire_sessions(Instant::now());

        match state.keys.get(key) {
            Some(stored) if stored.modify_index == cas => {
                state.keys.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_session(&self, name: &str, ttl: Duration) -> Result<SessionId> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.expire_sessions(now);

        let id = SessionId::new(uuid::Uuid::new_v4().to_string());
        state.sessions.insert(id.clone(), now + ttl);
        debug!("Created session {} ({}) with ttl {:?}", id, name, ttl);
        Ok(id)
    }

    async fn destroy_session(&self, session: &SessionId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.expire_sessions(Instant::now());
        state.drop_session(session);
        Ok(())
    }

    async fn acquire(&self, key: &str, value: &[u8], session: &SessionId) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.expire_sessions(Instant::now());

        if !state.sessions.contains_key(session) {
            return Err(AgentError::store(format!("invalid session {}", session)));
        }

        if let Some(holder) = state.keys.get(key).and_then(|stored| stored.session.as_ref()) {
            if holder != session {
                return Ok(false);
            }
        }

        let index = state.next_index();
        state.keys.insert(
            key.to_string(),
            StoredKey {
                value: Bytes::copy_from_slice(value),
                modify_index: index,
                session: Some(session.clone()),
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, session: &SessionId) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.expire_sessions(Instant::now());

        let held = state
            .keys
            .get(key)
            .map(|stored| stored.session.as_ref() == Some(session))
            .unwrap_or(false);
        if !held {
            return Ok(false);
        }

        let index = state.next_index();
        if let Some(stored) = state.keys.get_mut(key) {
            stored.session = None;
            stored.modify_index = index;
        }
        Ok(true)
    }
}
