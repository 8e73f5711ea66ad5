//! Unix socket front end for the sniffer broker.
//!
//! Protocol, one request per connection:
//!
//! ```text
//! client -> ["<designator>", "<client_key>"]     (JSON, no framing)
//! server -> <buffered bytes> | SNIFFER_UNAVAILABLE
//! server closes the connection
//! ```
//!
//! The request is read until it parses as a complete JSON value, so clients
//! need not half-close their end.

use super::{SniffBroker, SniffKey};
use crate::config::GatewayConfig;
use crate::{AgentError, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running gateway. Dropping shuts it down and removes the
/// socket file.
pub struct GatewayHandle {
    path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl GatewayHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting connections and close the ones in flight.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }

    /// Wait for the accept loop to exit.
    pub async fn join(mut self) {
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Sniffer request gateway.
pub struct SnifferGateway;

impl SnifferGateway {
    /// Bind `path` and serve requests from `broker` in background tasks.
    ///
    /// A stale socket file at `path` is removed first.
    pub async fn start(path: impl AsRef<Path>, broker: SniffBroker) -> Result<GatewayHandle> {
        Self::start_with_limit(path, broker, GatewayConfig::MAX_CONNECTIONS).await
    }

    /// Like [`start`](Self::start), serving at most `max_connections`
    /// requests at once. Connections over the limit get the failure marker.
    pub async fn start_with_limit(
        path: impl AsRef<Path>,
        broker: SniffBroker,
        max_connections: usize,
    ) -> Result<GatewayHandle> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        let listener = UnixListener::bind(&path)?;
        info!("Sniffer gateway listening on {}", path.display());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            broker,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
            max_connections.max(1),
        ));

        Ok(GatewayHandle {
            path,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: UnixListener,
        broker: SniffBroker,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
        max_connections: usize,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Sniffer gateway shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= max_connections {
                                warn!(
                                    "Rejecting sniffer request: at max capacity ({})",
                                    max_connections
                                );
                                tokio::spawn(Self::reject(stream));
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let broker = broker.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("New request connection received");
                                if let Err(e) = Self::handle_connection(stream, &broker, &mut conn_shutdown).await {
                                    debug!("Sniffer request ended: {}", e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Sniffer gateway accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn reject(mut stream: UnixStream) {
        let written = async {
            stream.write_all(GatewayConfig::FAILURE_MARKER).await?;
            stream.shutdown().await
        };
        if let Err(e) = written.await {
            debug!("Failed to reject sniffer request: {}", e);
        }
    }

    async fn handle_connection(
        mut stream: UnixStream,
        broker: &SniffBroker,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let response = tokio::select! {
            response = Self::serve_request(&mut stream, broker) => response,
            _ = shutdown_rx.changed() => return Ok(()),
        };
        stream.write_all(&response).await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn serve_request(stream: &mut UnixStream, broker: &SniffBroker) -> Bytes {
        let read = tokio::time::timeout(
            GatewayConfig::REQUEST_READ_TIMEOUT,
            read_request(stream),
        )
        .await
        .map_err(|_| AgentError::Timeout(GatewayConfig::REQUEST_READ_TIMEOUT))
        .and_then(|read| read);

        let key = match read.and_then(|raw| parse_request(&raw)) {
            Ok(key) => key,
            Err(e) => {
                debug!("Rejected sniffer request: {}", e);
                return Bytes::from_static(GatewayConfig::FAILURE_MARKER);
            }
        };

        match broker.get_or_create(&key.designator, &key.client_key).await {
            Some(session) => {
                let data = session.read_and_clear();
                debug!("{} bytes for {}", data.len(), key);
                data
            }
            None => Bytes::from_static(GatewayConfig::FAILURE_MARKER),
        }
    }
}

/// Read until the buffer holds one complete JSON value or the peer stops
/// sending.
async fn read_request(stream: &mut UnixStream) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(raw);
        }
        raw.extend_from_slice(&chunk[..n]);
        if raw.len() > GatewayConfig::MAX_REQUEST_SIZE {
            return Err(AgentError::Validation {
                field: "request".to_string(),
                message: format!("exceeds {} bytes", GatewayConfig::MAX_REQUEST_SIZE),
            });
        }
        match serde_json::from_slice::<serde_json::Value>(&raw) {
            Err(e) if e.is_eof() => continue,
            _ => return Ok(raw),
        }
    }
}

/// Parse `["designator", "client_key"]`.
fn parse_request(raw: &[u8]) -> Result<SniffKey> {
    let (designator, client_key): (String, String) =
        serde_json::from_slice(raw).map_err(|e| AgentError::Validation {
            field: "request".to_string(),
            message: format!("expected [designator, client_key]: {}", e),
        })?;
    Ok(SniffKey::new(designator, client_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SnifferOptions;
    use crate::registry::{ServiceInstance, StaticRegistry};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    async fn port_agent() -> (u16, mpsc::UnboundedReceiver<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if tx.send(stream).is_err() {
                    break;
                }
            }
        });
        (port, rx)
    }

    async fn request(path: &Path, payload: &[u8]) -> Vec<u8> {
        let mut stream = UnixStream::connect(path).await.unwrap();
        stream.write_all(payload).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        response
    }

    async fn gateway() -> (
        tempfile::TempDir,
        GatewayHandle,
        mpsc::UnboundedReceiver<TcpStream>,
    ) {
        let (port, accepted) = port_agent().await;
        let registry = StaticRegistry::new();
        registry.register(
            "sniff-port-agent",
            ServiceInstance::new("127.0.0.1", port).with_tag("X1"),
        );
        let broker = SniffBroker::new(Arc::new(registry), SnifferOptions::default());

        let dir = tempfile::tempdir().unwrap();
        let handle = SnifferGateway::start(dir.path().join("sniff.sock"), broker)
            .await
            .unwrap();
        (dir, handle, accepted)
    }

    #[test]
    fn test_parse_request() {
        assert_eq!(
            parse_request(br#"["X1", "k1"]"#).unwrap(),
            SniffKey::new("X1", "k1")
        );
        assert!(parse_request(br#"["X1"]"#).is_err());
        assert!(parse_request(br#"["X1", "k1", "extra"]"#).is_err());
        assert!(parse_request(br#"{"designator": "X1"}"#).is_err());
        assert!(parse_request(b"").is_err());
    }

    #[tokio::test]
    async fn test_first_request_is_empty_then_data_flows() {
        let (_dir, handle, mut accepted) = gateway().await;

        let first = request(handle.path(), br#"["X1","k1"]"#).await;
        assert!(first.is_empty());

        let mut remote = accepted.recv().await.unwrap();
        remote.write_all(b"\x02CTD sample\x03").await.unwrap();

        let mut received = Vec::new();
        for _ in 0..100 {
            received.extend(request(handle.path(), br#"["X1","k1"]"#).await);
            if !received.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(received, b"\x02CTD sample\x03");
    }

    #[tokio::test]
    async fn test_unknown_designator_gets_failure_marker() {
        let (_dir, handle, _accepted) = gateway().await;
        let response = request(handle.path(), br#"["NOPE","k1"]"#).await;
        assert_eq!(response, GatewayConfig::FAILURE_MARKER);
    }

    #[tokio::test]
    async fn test_malformed_request_gets_failure_marker() {
        let (_dir, handle, _accepted) = gateway().await;

        let mut stream = UnixStream::connect(handle.path()).await.unwrap();
        stream.write_all(b"not json").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, GatewayConfig::FAILURE_MARKER);

        let response = request(handle.path(), br#"["X1"]"#).await;
        assert_eq!(response, GatewayConfig::FAILURE_MARKER);
    }

    #[tokio::test]
    async fn test_request_split_across_writes() {
        let (_dir, handle, _accepted) = gateway().await;

        let mut stream = UnixStream::connect(handle.path()).await.unwrap();
        stream.write_all(br#"["X1", "#).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(br#""k1"]"#).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn test_over_capacity_gets_failure_marker() {
        let (port, _accepted) = port_agent().await;
        let registry = StaticRegistry::new();
        registry.register(
            "sniff-port-agent",
            ServiceInstance::new("127.0.0.1", port).with_tag("X1"),
        );
        let broker = SniffBroker::new(Arc::new(registry), SnifferOptions::default());
        let dir = tempfile::tempdir().unwrap();
        let handle = SnifferGateway::start_with_limit(dir.path().join("sniff.sock"), broker, 1)
            .await
            .unwrap();

        // Holds the only slot while it waits for a request
        let mut idle = UnixStream::connect(handle.path()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut rejected = UnixStream::connect(handle.path()).await.unwrap();
        let mut response = Vec::new();
        rejected.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, GatewayConfig::FAILURE_MARKER);

        idle.write_all(br#"["X1","k1"]"#).await.unwrap();
        let mut response = Vec::new();
        idle.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn test_stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sniff.sock");
        std::fs::write(&path, b"stale").unwrap();

        let broker = SniffBroker::new(Arc::new(StaticRegistry::new()), SnifferOptions::default());
        let handle = SnifferGateway::start(&path, broker).await.unwrap();
        assert_eq!(
            request(handle.path(), br#"["X1","k1"]"#).await,
            GatewayConfig::FAILURE_MARKER
        );

        drop(handle);
        assert!(!path.exists());
    }
}
