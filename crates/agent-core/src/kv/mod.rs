//! Versioned key-value store abstraction.
//!
//! The lock subsystem never keeps lock state in process; every decision is
//! made against a store that offers:
//! - a per-key modify index used as the compare-and-swap token
//! - server-side sessions with a TTL
//! - `acquire`/`release` of a key on behalf of a session
//!
//! Two implementations are provided: [`ConsulClient`](crate::ConsulClient)
//! talks to a Consul agent over HTTP, [`MemoryKvStore`] keeps everything in
//! process with the same semantics.

mod memory;

pub use memory::MemoryKvStore;

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

/// Identifier of a server-side session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A key as read from the store, with its CAS token.
#[derive(Debug, Clone, PartialEq)]
pub struct KvEntry {
    pub key: String,
    pub value: Bytes,
    /// Version of the key; changes on every write.
    pub modify_index: u64,
    /// Session currently holding the key, if any.
    pub session: Option<SessionId>,
}

impl KvEntry {
    /// Value as UTF-8, lossy.
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }

    /// Value as a non-empty string, `None` when the key carries no value.
    pub fn holder(&self) -> Option<String> {
        if self.value.is_empty() {
            None
        } else {
            Some(self.value_str())
        }
    }
}

/// Operations the lock subsystem needs from a versioned store.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Read a single key.
    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Read every key under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>>;

    /// Write `value` only if the key's modify index equals `cas`.
    ///
    /// A `cas` of 0 writes only if the key does not exist. Returns `false`
    /// when the index moved; never errors for a lost race.
    async fn put_cas(&self, key: &str, value: &[u8], cas: u64) -> Result<bool>;

    /// Delete the key only if its modify index equals `cas`.
    async fn delete_cas(&self, key: &str, cas: u64) -> Result<bool>;

    /// Create a session that the store invalidates after `ttl`.
    async fn create_session(&self, name: &str, ttl: Duration) -> Result<SessionId>;

    /// Destroy a session, releasing any keys it holds.
    async fn destroy_session(&self, session: &SessionId) -> Result<()>;

    /// Take `key` for `session`. Fails if another live session holds it.
    async fn acquire(&self, key: &str, value: &[u8], session: &SessionId) -> Result<bool>;

    /// Give up `key` if `session` holds it.
    async fn release(&self, key: &str, session: &SessionId) -> Result<bool>;
}
