//! One live sniffer connection and the task draining it.

use super::buffer::SniffBuffer;
use super::SniffKey;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Why a reader task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    RemoteClosed,
    ReadError,
    Idle,
    Shutdown,
}

/// Posted by a reader task when its connection is gone.
#[derive(Debug)]
pub(crate) struct Closed {
    pub key: SniffKey,
    pub session_id: u64,
    pub reason: CloseReason,
}

struct SessionState {
    buffer: SniffBuffer,
    last_read: Instant,
}

/// Connected sniffer session.
///
/// Handed out by the broker as `Arc<SniffSession>`; the connection itself is
/// owned by the reader task.
pub struct SniffSession {
    id: u64,
    key: SniffKey,
    peer: SocketAddr,
    state: Mutex<SessionState>,
    close_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for SniffSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniffSession")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("peer", &self.peer)
            .finish()
    }
}

impl SniffSession {
    pub(crate) fn new(id: u64, key: SniffKey, peer: SocketAddr, capacity: usize) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            id,
            key,
            peer,
            state: Mutex::new(SessionState {
                buffer: SniffBuffer::new(capacity),
                last_read: Instant::now(),
            }),
            close_tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &SniffKey {
        &self.key
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        // A panic while holding the lock leaves the buffer usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drain everything buffered so far and reset the idle clock.
    ///
    /// Never waits for data; returns empty bytes when nothing is buffered.
    pub fn read_and_clear(&self) -> Bytes {
        let mut state = self.lock_state();
        state.last_read = Instant::now();
        state.buffer.drain()
    }

    /// Time of the last [`read_and_clear`](Self::read_and_clear), or of the
    /// connect if there has been none.
    pub fn last_read(&self) -> Instant {
        self.lock_state().last_read
    }

    pub fn buffered_chunks(&self) -> usize {
        self.lock_state().buffer.len()
    }

    /// Ask the reader task to drop the connection.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }

    fn push(&self, chunk: Bytes) {
        self.lock_state().buffer.push(chunk);
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_read())
    }
}

/// Reader task settings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReaderSettings {
    pub idle_window: Duration,
    pub check_interval: Duration,
    pub chunk_size: usize,
}

/// Append everything read from `stream` to the session buffer until the
/// connection ends, goes idle or is closed, then report it on `events`.
pub(crate) async fn run_reader(
    session: std::sync::Arc<SniffSession>,
    mut stream: TcpStream,
    settings: ReaderSettings,
    events: mpsc::UnboundedSender<Closed>,
) {
    let mut close_rx = session.close_tx.subscribe();
    let mut buf = vec![0u8; settings.chunk_size.max(1)];
    let mut tick = tokio::time::interval(settings.check_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        if *close_rx.borrow_and_update() {
            break CloseReason::Shutdown;
        }
        tokio::select! {
            _ = close_rx.changed() => continue,
            _ = tick.tick() => {
                if session.idle_for(Instant::now()) > settings.idle_window {
                    break CloseReason::Idle;
                }
            }
            read = stream.read(&mut buf) => match read {
                Ok(0) => break CloseReason::RemoteClosed,
                Ok(n) => {
                    debug!("{} received {} bytes", session.key, n);
                    session.push(Bytes::copy_from_slice(&buf[..n]));
                    if session.idle_for(Instant::now()) > settings.idle_window {
                        break CloseReason::Idle;
                    }
                }
                Err(e) => {
                    warn!("Read from sniffer {} ({}) failed: {}", session.key, session.peer, e);
                    break CloseReason::ReadError;
                }
            },
        }
    };

    drop(stream);
    session.close();
    info!(
        "Disconnected from sniffer port for {} ({:?})",
        session.key, reason
    );
    let _ = events.send(Closed {
        key: session.key.clone(),
        session_id: session.id,
        reason,
    });
}
