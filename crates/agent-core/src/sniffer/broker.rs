//! Per-key sniffer connection cache.
//!
//! ```text
//! ABSENT -> PENDING -> CONNECTED -> ABSENT   (closed, idle or shut down)
//!              |
//!              +-> ABSENT                    (discovery or dial failed)
//! ```
//!
//! The first caller for a key inserts `Pending` under the map lock and spawns
//! the discovery+dial task. Later callers find `Pending` and wait on the same
//! watch channel, so a key is dialed at most once at a time and every waiter
//! sees the same outcome. The dial runs in its own task, so a caller that
//! gives up waiting does not cancel it for the others.

use super::session::{run_reader, Closed, ReaderSettings, SniffSession};
use super::SniffKey;
use crate::config::{SnifferConfig, SnifferOptions};
use crate::registry::{locate_unique, ServiceRegistry};
use crate::{AgentError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

#[derive(Clone)]
enum DialState {
    Dialing,
    Ready(Arc<SniffSession>),
    Failed,
}

enum Entry {
    Pending(watch::Receiver<DialState>),
    Connected(Arc<SniffSession>),
}

struct BrokerInner {
    registry: Arc<dyn ServiceRegistry>,
    options: SnifferOptions,
    entries: Mutex<HashMap<SniffKey, Entry>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<Closed>,
}

/// Lazily connected, buffered sniffer sessions keyed by
/// `(designator, client_key)`.
#[derive(Clone)]
pub struct SniffBroker {
    inner: Arc<BrokerInner>,
}

impl SniffBroker {
    /// Create a broker and start its cleanup task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(registry: Arc<dyn ServiceRegistry>, options: SnifferOptions) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(BrokerInner {
            registry,
            options,
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            events,
        });
        tokio::spawn(Self::cleanup_loop(Arc::downgrade(&inner), events_rx));
        Self { inner }
    }

    pub fn options(&self) -> &SnifferOptions {
        &self.inner.options
    }

    /// Session for the key, connecting on first use.
    ///
    /// Returns `None` when the sniffer cannot be found or reached; the next
    /// call tries again.
    pub async fn get_or_create(
        &self,
        designator: &str,
        client_key: &str,
    ) -> Option<Arc<SniffSession>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return None;
        }
        let key = SniffKey::new(designator, client_key);

        let mut dial_rx = {
            let mut entries = self.inner.entries.lock().await;
            match entries.get(&key) {
                Some(Entry::Connected(session)) if !session.is_closed() => {
                    return Some(session.clone())
                }
                Some(Entry::Pending(rx)) => rx.clone(),
                _ => {
                    let (tx, rx) = watch::channel(DialState::Dialing);
                    entries.insert(key.clone(), Entry::Pending(rx.clone()));
                    debug!("Dialing sniffer for {}", key);
                    tokio::spawn(Self::dial(self.inner.clone(), key, tx));
                    rx
                }
            }
        };

        let state = dial_rx
            .wait_for(|state| !matches!(state, DialState::Dialing))
            .await
            .ok()?;
        match &*state {
            DialState::Ready(session) => Some(session.clone()),
            _ => None,
        }
    }

    /// Number of pending and connected sessions.
    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, key: &SniffKey) -> bool {
        self.inner.entries.lock().await.contains_key(key)
    }

    /// Close every session and refuse new ones.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let drained: Vec<Entry> = {
            let mut entries = self.inner.entries.lock().await;
            entries.drain().map(|(_, entry)| entry).collect()
        };
        let mut closed = 0;
        for entry in drained {
            if let Entry::Connected(session) = entry {
                session.close();
                closed += 1;
            }
        }
        info!("Sniffer broker shut down, closed {} sessions", closed);
    }

    async fn connect(inner: &BrokerInner, key: &SniffKey) -> Result<(TcpStream, SocketAddr)> {
        let instance = locate_unique(
            inner.registry.as_ref(),
            &inner.options.service_name,
            &key.designator,
        )
        .await?;
        let address = instance.endpoint();
        let stream = TcpStream::connect((instance.address.as_str(), instance.port))
            .await
            .map_err(|e| AgentError::DialFailed {
                address: address.clone(),
                message: e.to_string(),
            })?;
        let peer = stream.peer_addr()?;
        Ok((stream, peer))
    }

    async fn dial(inner: Arc<BrokerInner>, key: SniffKey, tx: watch::Sender<DialState>) {
        let timeout = inner.options.connect_timeout;
        let outcome = match tokio::time::timeout(timeout, Self::connect(&inner, &key)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(timeout)),
        };

        let mut entries = inner.entries.lock().await;
        if inner.closed.load(Ordering::Acquire) {
            entries.remove(&key);
            tx.send_replace(DialState::Failed);
            return;
        }

        match outcome {
            Ok((stream, peer)) => {
                let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
                let session = Arc::new(SniffSession::new(
                    id,
                    key.clone(),
                    peer,
                    inner.options.buffer_capacity,
                ));
                entries.insert(key.clone(), Entry::Connected(session.clone()));
                drop(entries);

                info!("Connected to sniffer port for {} at {}", key, peer);
                let settings = ReaderSettings {
                    idle_window: inner.options.idle_window,
                    check_interval: inner.options.idle_check_interval(),
                    chunk_size: SnifferConfig::READ_CHUNK_SIZE,
                };
                tokio::spawn(run_reader(
                    session.clone(),
                    stream,
                    settings,
                    inner.events.clone(),
                ));
                tx.send_replace(DialState::Ready(session));
            }
            Err(e) => {
                entries.remove(&key);
                drop(entries);
                warn!("No sniffer session for {}: {}", key, e);
                tx.send_replace(DialState::Failed);
            }
        }
    }

    async fn cleanup_loop(inner: Weak<BrokerInner>, mut events: mpsc::UnboundedReceiver<Closed>) {
        while let Some(closed) = events.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let mut entries = inner.entries.lock().await;
            let current = matches!(
                entries.get(&closed.key),
                Some(Entry::Connected(session)) if session.id() == closed.session_id
            );
            if current {
                entries.remove(&closed.key);
                debug!("Removed sniffer session {} ({:?})", closed.key, closed.reason);
            }
        }
    }
}
