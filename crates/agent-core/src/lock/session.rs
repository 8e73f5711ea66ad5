//! TTL-bound session lock with bounded retries.
//!
//! ```text
//! IDLE -> ACQUIRING -> HELD -> IDLE
//!            |
//!            +-> IDLE (retry budget exhausted: LockAcquisitionFailed)
//! ```
//!
//! Each attempt creates a fresh session and tries to acquire the key with it.
//! A losing attempt destroys its session before backing off, so no session
//! ever outlives a failed acquire. A holder that dies without releasing is
//! reclaimed when the store invalidates its session (at most `2 x TTL` for
//! Consul).

use crate::config::SessionLockOptions;
use crate::kv::{KvStore, SessionId};
use crate::{AgentError, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Mutual exclusion on a single store key, backed by store sessions.
#[derive(Clone)]
pub struct SessionLock {
    store: Arc<dyn KvStore>,
    options: SessionLockOptions,
}

impl SessionLock {
    pub fn new(store: Arc<dyn KvStore>, options: SessionLockOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &SessionLockOptions {
        &self.options
    }

    /// Acquire `key`, retrying on contention up to the configured budget.
    pub async fn acquire(&self, key: &str) -> Result<SessionLockGuard> {
        let attempts = self.options.num_retries.max(1);

        for attempt in 1..=attempts {
            let session = self
                .store
                .create_session(&self.options.session_name, self.options.ttl)
                .await?;

            match self
                .store
                .acquire(key, self.options.session_name.as_bytes(), &session)
                .await
            {
                Ok(true) => {
                    debug!("Acquired {} with session {} (attempt {})", key, session, attempt);
                    return Ok(SessionLockGuard {
                        store: self.store.clone(),
                        key: key.to_string(),
                        session,
                        released: false,
                    });
                }
                Ok(false) => {
                    debug!("{} is held, attempt {}/{}", key, attempt, attempts);
                    destroy_quietly(self.store.as_ref(), &session).await;
                    if attempt < attempts {
                        tokio::time::sleep(self.options.backoff).await;
                    }
                }
                Err(e) => {
                    destroy_quietly(self.store.as_ref(), &session).await;
                    return Err(e);
                }
            }
        }

        warn!("Giving up on {} after {} attempts", key, attempts);
        Err(AgentError::LockAcquisitionFailed {
            key: key.to_string(),
            attempts,
        })
    }

    /// Run `work` while holding `key`.
    ///
    /// The lock is released whether `work` succeeds or fails. A failed
    /// release is logged and left to the session TTL; it does not replace
    /// the result of `work`.
    pub async fn scoped<F, Fut, T>(&self, key: &str, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(key).await?;
        let result = work().await;
        if let Err(e) = guard.release().await {
            warn!("Failed to release {}: {}", key, e);
        }
        result
    }
}

async fn destroy_quietly(store: &dyn KvStore, session: &SessionId) {
    if let Err(e) = store.destroy_session(session).await {
        warn!("Failed to destroy session {}: {}", session, e);
    }
}

/// A held session lock.
///
/// Call [`release`](Self::release) when done. A guard dropped without
/// releasing (early return, panic, cancelled future) releases in a task
/// spawned on the current runtime; outside a runtime the session TTL
/// reclaims the key.
pub struct SessionLockGuard {
    store: Arc<dyn KvStore>,
    key: String,
    session: SessionId,
    released: bool,
}

impl SessionLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Release the key and destroy the session.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let released = self.store.release(&self.key, &self.session).await;
        let destroyed = self.store.destroy_session(&self.session).await;
        debug!("Released {} (session {})", self.key, self.session);
        released?;
        destroyed
    }
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let key = self.key.clone();
                let session = self.session.clone();
                handle.spawn(async move {
                    if let Err(e) = store.release(&key, &session).await {
                        warn!("Failed to release {} in drop: {}", key, e);
                    }
                    destroy_quietly(store.as_ref(), &session).await;
                });
            }
            Err(_) => {
                warn!(
                    "Session lock on {} dropped outside a runtime; it will expire with its session",
                    self.key
                );
            }
        }
    }
}
