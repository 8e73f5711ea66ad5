//! Check-and-set lock map over a versioned store.
//!
//! Setting a lock reads the key and its modify index, refuses if someone else
//! already holds it, then writes with the index it read:
//!
//! ```text
//! locker 1 - get(key)            -> index 50, empty
//! locker 2 - get(key)            -> index 50, empty
//! locker 1 - put(key, a, cas=50) -> true  (index becomes 51)
//! locker 2 - put(key, b, cas=50) -> false (index != 50)
//! locker 2 - get(key)            -> a, reported as Locked
//! ```
//!
//! The loser is told who won; it is never retried or blocked.

use crate::config::LockConfig;
use crate::kv::KvStore;
use crate::{AgentError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Driver locks stored one key per driver under a prefix.
#[derive(Clone)]
pub struct CasLockMap {
    store: Arc<dyn KvStore>,
    prefix: String,
}

impl CasLockMap {
    /// Lock map under the default `lock/` prefix.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_prefix(store, LockConfig::KEY_PREFIX)
    }

    pub fn with_prefix(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { store, prefix }
    }

    /// The store this map writes to.
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Key reserved for the master session lock.
    pub fn master_key(&self) -> String {
        format!("{}{}", self.prefix, LockConfig::MASTER_NAME)
    }

    /// Store key for a driver, rejecting ids that would escape the prefix or
    /// collide with the master key.
    pub fn key_for(&self, driver_id: &str) -> Result<String> {
        if driver_id.is_empty() || driver_id.contains('/') {
            return Err(AgentError::Validation {
                field: "driver_id".to_string(),
                message: format!("invalid driver id {:?}", driver_id),
            });
        }
        if driver_id == LockConfig::MASTER_NAME {
            return Err(AgentError::Validation {
                field: "driver_id".to_string(),
                message: format!("{:?} is reserved", driver_id),
            });
        }
        Ok(format!("{}{}", self.prefix, driver_id))
    }

    /// Current holder of a driver lock.
    pub async fn get(&self, driver_id: &str) -> Result<Option<String>> {
        let key = self.key_for(driver_id)?;
        Ok(self.store.get(&key).await?.and_then(|entry| entry.holder()))
    }

    /// Lock `driver_id` for `holder`.
    ///
    /// Returns the holder on success. Locking again with the same holder is
    /// a no-op success. Fails with [`AgentError::Locked`] carrying the current
    /// holder when someone else holds the lock or wins a concurrent write.
    pub async fn try_lock(&self, driver_id: &str, holder: &str) -> Result<String> {
        let key = self.key_for(driver_id)?;
        if holder.is_empty() {
            return Err(AgentError::Validation {
                field: "key".to_string(),
                message: "lock holder must not be empty".to_string(),
            });
        }

        let cas = match self.store.get(&key).await? {
            Some(entry) => match entry.holder() {
                Some(existing) if existing == holder => return Ok(existing),
                Some(existing) => return Err(AgentError::Locked { holder: existing }),
                None => entry.modify_index,
            },
            None => 0,
        };

        if self.store.put_cas(&key, holder.as_bytes(), cas).await? {
            debug!("Locked {} for {}", driver_id, holder);
            return Ok(holder.to_string());
        }

        // Lost the race; report whoever won
        debug!("Lost CAS race on {} (index {})", key, cas);
        match self.get(driver_id).await? {
            Some(winner) if winner == holder => Ok(winner),
            Some(winner) => Err(AgentError::Locked { holder: winner }),
            None => Err(AgentError::store(format!(
                "{} changed during lock but has no holder",
                key
            ))),
        }
    }

    /// Remove a driver lock. Returns `false` if there was nothing to remove
    /// or the key changed between read and delete.
    pub async fn remove(&self, driver_id: &str) -> Result<bool> {
        let key = self.key_for(driver_id)?;
        match self.store.get(&key).await? {
            Some(entry) => self.store.delete_cas(&key, entry.modify_index).await,
            None => Ok(false),
        }
    }

    /// Every held driver lock.
    pub async fn entries(&self) -> Result<BTreeMap<String, String>> {
        let entries = self.store.list(&self.prefix).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let driver_id = entry.key.strip_prefix(&self.prefix)?.to_string();
                if driver_id.is_empty() || driver_id == LockConfig::MASTER_NAME {
                    return None;
                }
                entry.holder().map(|holder| (driver_id, holder))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvEntry, MemoryKvStore, SessionId};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Store that lets a rival writer in between our read and our write.
    struct RacingStore {
        inner: MemoryKvStore,
        rival: &'static str,
        raced: AtomicBool,
    }

    #[async_trait]
    impl KvStore for RacingStore {
        async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
            self.inner.get(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>> {
            self.inner.list(prefix).await
        }
        async fn put_cas(&self, key: &str, value: &[u8], cas: u64) -> Result<bool> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                assert!(self.inner.put_cas(key, self.rival.as_bytes(), cas).await?);
            }
            self.inner.put_cas(key, value, cas).await
        }
        async fn delete_cas(&self, key: &str, cas: u64) -> Result<bool> {
            self.inner.delete_cas(key, cas).await
        }
        async fn create_session(&self, name: &str, ttl: Duration) -> Result<SessionId> {
            self.inner.create_session(name, ttl).await
        }
        async fn destroy_session(&self, session: &SessionId) -> Result<()> {
            self.inner.destroy_session(session).await
        }
        async fn acquire(&self, key: &str, value: &[u8], session: &SessionId) -> Result<bool> {
            self.inner.acquire(key, value, session).await
        }
        async fn release(&self, key: &str, session: &SessionId) -> Result<bool> {
            self.inner.release(key, session).await
        }
    }

    fn map() -> CasLockMap {
        CasLockMap::new(Arc::new(MemoryKvStore::new()))
    }

    #[tokio::test]
    async fn test_lock_unheld_driver() {
        let locks = map();
        assert_eq!(locks.get("CE01").await.unwrap(), None);
        assert_eq!(locks.try_lock("CE01", "alice").await.unwrap(), "alice");
        assert_eq!(locks.get("CE01").await.unwrap(), Some("alice".to_string()));
    }

    #[tokio::test]
    async fn test_lock_held_by_other_reports_holder() {
        let locks = map();
        locks.try_lock("CE01", "alice").await.unwrap();
        match locks.try_lock("CE01", "bob").await {
            Err(AgentError::Locked { holder }) => assert_eq!(holder, "alice"),
            other => panic!("expected Locked, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_relock_by_same_holder_is_noop() {
        let locks = map();
        assert_eq!(locks.try_lock("CE01", "alice").await.unwrap(), "alice");
        assert_eq!(locks.try_lock("CE01", "alice").await.unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_concurrent_locks_have_one_winner() {
        let locks = map();
        let (a, b) = tokio::join!(locks.try_lock("CE01", "alice"), locks.try_lock("CE01", "bob"));

        let winner = locks.get("CE01").await.unwrap().unwrap();
        let outcomes = [a, b];
        let wins: Vec<&String> = outcomes.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(wins, vec![&winner]);
        for outcome in &outcomes {
            if let Err(AgentError::Locked { holder }) = outcome {
                assert_eq!(holder, &winner);
            }
        }
    }

    #[tokio::test]
    async fn test_lost_cas_reports_winner() {
        let store = Arc::new(RacingStore {
            inner: MemoryKvStore::new(),
            rival: "mallory",
            raced: AtomicBool::new(false),
        });
        let locks = CasLockMap::new(store);

        match locks.try_lock("CE01", "alice").await {
            Err(AgentError::Locked { holder }) => assert_eq!(holder, "mallory"),
            other => panic!("expected Locked, got {:?}", other),
        }
        assert_eq!(locks.get("CE01").await.unwrap(), Some("mallory".to_string()));
    }

    #[tokio::test]
    async fn test_remove_and_entries() {
        let locks = map();
        locks.try_lock("CE01", "alice").await.unwrap();
        locks.try_lock("CE02", "bob").await.unwrap();

        let entries = locks.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["CE02"], "bob");

        assert!(locks.remove("CE01").await.unwrap());
        assert!(!locks.remove("CE01").await.unwrap());
        assert_eq!(locks.get("CE01").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_skip_master_key() {
        let store = Arc::new(MemoryKvStore::new());
        let locks = CasLockMap::new(store.clone());
        store
            .put_cas(&locks.master_key(), b"session", 0)
            .await
            .unwrap();
        locks.try_lock("CE01", "alice").await.unwrap();

        let entries = locks.entries().await.unwrap();
        assert_eq!(entries.keys().collect::<Vec<_>>(), vec!["CE01"]);
    }

    #[tokio::test]
    async fn test_invalid_driver_ids_rejected() {
        let locks = map();
        for bad in ["", "a/b", "master"] {
            assert!(matches!(
                locks.try_lock(bad, "alice").await,
                Err(AgentError::Validation { .. })
            ));
        }
        assert!(matches!(
            locks.try_lock("CE01", "").await,
            Err(AgentError::Validation { .. })
        ));
    }
}
