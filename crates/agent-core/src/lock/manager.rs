//! Driver lock manager.
//!
//! All lock mutations run under the session lock on the reserved master key,
//! so every mutation sees the result of the previous one even on stores
//! without multi-key transactions. Reads go straight to the store.

use super::{CasLockMap, SessionLock};
use crate::config::SessionLockOptions;
use crate::kv::KvStore;
use crate::{AgentError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Stateless facade over the driver locks held in the store.
#[derive(Clone)]
pub struct LockManager {
    locks: CasLockMap,
    master: SessionLock,
}

impl LockManager {
    /// Lock manager with the default prefix and session lock tuning.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_options(store, SessionLockOptions::default())
    }

    pub fn with_options(store: Arc<dyn KvStore>, options: SessionLockOptions) -> Self {
        let master = SessionLock::new(store.clone(), options);
        Self {
            locks: CasLockMap::new(store),
            master,
        }
    }

    /// Current holder of a driver lock.
    pub async fn check(&self, driver_id: &str) -> Result<Option<String>> {
        self.locks.get(driver_id).await
    }

    /// Lock `driver_id` for `holder` and return whoever holds it afterwards.
    ///
    /// An existing holder is returned unchanged rather than raised; callers
    /// compare the result with `holder` to tell a grant from a refusal.
    pub async fn set(&self, driver_id: &str, holder: &str) -> Result<String> {
        self.locks.key_for(driver_id)?;
        let locks = &self.locks;
        let effective = self
            .master
            .scoped(&self.locks.master_key(), || async move {
                match locks.try_lock(driver_id, holder).await {
                    Ok(holder) => Ok(holder),
                    Err(AgentError::Locked { holder }) => Ok(holder),
                    Err(e) => Err(e),
                }
            })
            .await?;

        if effective == holder {
            info!("Driver {} locked by {}", driver_id, holder);
        } else {
            info!(
                "Driver {} lock request by {} refused, held by {}",
                driver_id, holder, effective
            );
        }
        Ok(effective)
    }

    /// Clear a driver lock and return the holder afterwards (normally `None`).
    pub async fn delete(&self, driver_id: &str) -> Result<Option<String>> {
        self.delete_if(driver_id, None).await
    }

    /// Clear a driver lock held by `expected`.
    ///
    /// The holder is read under the master lock, so a lock taken by someone
    /// else after the caller last looked is never cleared; that case fails
    /// with [`AgentError::Locked`]. An unheld driver is a successful no-op.
    /// `None` clears whatever holder is present.
    pub async fn delete_if(
        &self,
        driver_id: &str,
        expected: Option<&str>,
    ) -> Result<Option<String>> {
        self.locks.key_for(driver_id)?;
        let locks = &self.locks;
        let after = self
            .master
            .scoped(&self.locks.master_key(), || async move {
                if let (Some(expected), Some(holder)) = (expected, locks.get(driver_id).await?) {
                    if holder != expected {
                        return Err(AgentError::Locked { holder });
                    }
                }
                locks.remove(driver_id).await?;
                locks.get(driver_id).await
            })
            .await?;
        info!("Driver {} unlocked", driver_id);
        Ok(after)
    }

    /// Every currently held driver lock.
    pub async fn list(&self) -> Result<BTreeMap<String, String>> {
        self.locks.entries().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvEntry, MemoryKvStore, SessionId};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Store that stalls driver lock writes and records when they ran.
    struct SlowStore {
        inner: MemoryKvStore,
        delay: Duration,
        writes: std::sync::Mutex<Vec<(Instant, Instant)>>,
    }

    #[async_trait]
    impl KvStore for SlowStore {
        async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
            self.inner.get(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>> {
            self.inner.list(prefix).await
        }
        async fn put_cas(&self, key: &str, value: &[u8], cas: u64) -> Result<bool> {
            let start = Instant::now();
            tokio::time::sleep(self.delay).await;
            let written = self.inner.put_cas(key, value, cas).await;
            self.writes.lock().unwrap().push((start, Instant::now()));
            written
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

    /// Store where another client takes over `key` just before the first
    /// read of it.
    struct HandoverStore {
        inner: MemoryKvStore,
        key: String,
        new_holder: &'static str,
        armed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl KvStore for HandoverStore {
        async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
            if key == self.key && self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
                let cas = self
                    .inner
                    .get(key)
                    .await?
                    .map(|entry| entry.modify_index)
                    .unwrap_or(0);
                assert!(self.inner.put_cas(key, self.new_holder.as_bytes(), cas).await?);
            }
            self.inner.get(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>> {
            self.inner.list(prefix).await
        }
        async fn put_cas(&self, key: &str, value: &[u8], cas: u64) -> Result<bool> {
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

    #[tokio::test]
    async fn test_set_check_delete() {
        let manager = LockManager::new(Arc::new(MemoryKvStore::new()));

        assert_eq!(manager.check("CE01").await.unwrap(), None);
        assert_eq!(manager.set("CE01", "alice").await.unwrap(), "alice");
        assert_eq!(manager.check("CE01").await.unwrap(), Some("alice".into()));
        assert_eq!(manager.delete("CE01").await.unwrap(), None);
        assert_eq!(manager.check("CE01").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_on_held_driver_returns_holder() {
        let manager = LockManager::new(Arc::new(MemoryKvStore::new()));
        manager.set("CE01", "alice").await.unwrap();

        assert_eq!(manager.set("CE01", "bob").await.unwrap(), "alice");
        // Same holder again is a no-op
        assert_eq!(manager.set("CE01", "alice").await.unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_delete_absent_is_ok() {
        let manager = LockManager::new(Arc::new(MemoryKvStore::new()));
        assert_eq!(manager.delete("CE01").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_if_checks_holder() {
        let manager = LockManager::new(Arc::new(MemoryKvStore::new()));
        manager.set("CE01", "alice").await.unwrap();

        assert!(matches!(
            manager.delete_if("CE01", Some("bob")).await,
            Err(AgentError::Locked { holder }) if holder == "alice"
        ));
        assert_eq!(manager.check("CE01").await.unwrap(), Some("alice".into()));

        assert_eq!(manager.delete_if("CE01", Some("alice")).await.unwrap(), None);
        assert_eq!(manager.check("CE01").await.unwrap(), None);
        // Unheld is a no-op for any key
        assert_eq!(manager.delete_if("CE01", Some("bob")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_if_keeps_lock_taken_over_by_another_holder() {
        let store = Arc::new(HandoverStore {
            inner: MemoryKvStore::new(),
            key: "lock/CE01".to_string(),
            new_holder: "bob",
            armed: std::sync::atomic::AtomicBool::new(false),
        });
        let manager = LockManager::new(store.clone());
        manager.set("CE01", "alice").await.unwrap();

        // Alice's stale unlock lands after bob took the driver over
        store.armed.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(matches!(
            manager.delete_if("CE01", Some("alice")).await,
            Err(AgentError::Locked { holder }) if holder == "bob"
        ));
        assert_eq!(manager.check("CE01").await.unwrap(), Some("bob".into()));
    }

    #[tokio::test]
    async fn test_list_excludes_master() {
        let manager = LockManager::new(Arc::new(MemoryKvStore::new()));
        manager.set("CE01", "alice").await.unwrap();
        manager.set("CE02", "bob").await.unwrap();

        let locks = manager.list().await.unwrap();
        assert_eq!(locks.len(), 2);
        assert_eq!(locks["CE01"], "alice");
        assert_eq!(locks["CE02"], "bob");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sets_same_driver_agree_on_winner() {
        let manager = LockManager::new(Arc::new(MemoryKvStore::new()));
        let (a, b) = tokio::join!(manager.set("CE01", "alice"), manager.set("CE01", "bob"));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a, b);
        assert!(a == "alice" || a == "bob");
        assert_eq!(manager.check("CE01").await.unwrap(), Some(a));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sets_on_different_drivers_serialize() {
        let store = Arc::new(SlowStore {
            inner: MemoryKvStore::new(),
            delay: Duration::from_millis(40),
            writes: std::sync::Mutex::new(Vec::new()),
        });
        let manager = LockManager::new(store.clone());

        let (a, b) = tokio::join!(manager.set("CE01", "alice"), manager.set("CE02", "bob"));
        assert_eq!(a.unwrap(), "alice");
        assert_eq!(b.unwrap(), "bob");

        let mut writes = store.writes.lock().unwrap().clone();
        writes.sort();
        assert_eq!(writes.len(), 2);
        assert!(writes[0].1 <= writes[1].0, "lock writes overlapped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_contention_surfaces_acquisition_failure() {
        let store = Arc::new(MemoryKvStore::new());
        let manager = LockManager::new(store.clone());
        let other = SessionLock::new(store, SessionLockOptions::default());

        let held = other.acquire("lock/master").await.unwrap();
        assert!(matches!(
            manager.set("CE01", "alice").await,
            Err(AgentError::LockAcquisitionFailed { .. })
        ));
        held.release().await.unwrap();

        assert_eq!(manager.set("CE01", "alice").await.unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_reserved_name_rejected_before_locking() {
        let store = Arc::new(MemoryKvStore::new());
        let manager = LockManager::new(store.clone());
        assert!(matches!(
            manager.set("master", "alice").await,
            Err(AgentError::Validation { .. })
        ));
        assert_eq!(store.session_count().await, 0);
    }
}
