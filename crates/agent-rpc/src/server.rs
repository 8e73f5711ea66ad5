//! HTTP server implementation using Axum.

use crate::handlers::{handle_health, instrument, locks};
use axum::{
    routing::{get, post},
    Router,
};
use instrument_agent::registry::locate_driver;
use instrument_agent::{DriverClient, DriverTransport, LockManager, ServiceRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Requests handled at once; driver calls can block for their full timeout.
const MAX_CONCURRENT_REQUESTS: usize = 512;

/// Application state shared across handlers.
pub struct AppState {
    /// Driver and port agent discovery
    pub registry: Arc<dyn ServiceRegistry>,
    /// Driver locks
    pub locks: LockManager,
    /// Transport used for every driver command
    pub transport: Arc<dyn DriverTransport>,
}

impl AppState {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        locks: LockManager,
        transport: Arc<dyn DriverTransport>,
    ) -> Self {
        Self {
            registry,
            locks,
            transport,
        }
    }

    /// Client for a registered driver.
    pub async fn driver_client(&self, driver_id: &str) -> instrument_agent::Result<DriverClient> {
        let endpoint = locate_driver(self.registry.as_ref(), driver_id).await?;
        Ok(DriverClient::new(endpoint, self.transport.clone()))
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/api", get(instrument::list_drivers))
        .route("/api/locks", get(locks::list_locks))
        .route("/api/:driver_id", get(instrument::get_driver))
        .route("/api/:driver_id/portagent", get(instrument::get_port_agent))
        .route("/api/:driver_id/ping", get(instrument::ping))
        .route("/api/:driver_id/discover", post(instrument::discover))
        .route(
            "/api/:driver_id/set_init_params",
            post(instrument::set_init_params),
        )
        .route(
            "/api/:driver_id/resource",
            get(instrument::get_resource).post(instrument::set_resource),
        )
        .route("/api/:driver_id/execute", post(instrument::execute))
        .route("/api/:driver_id/shutdown", post(instrument::shutdown))
        .route(
            "/api/:driver_id/set_log_level",
            post(instrument::set_log_level),
        )
        .route(
            "/api/:driver_id/lock",
            get(locks::get_lock)
                .post(locks::set_lock)
                .delete(locks::unlock),
        )
        .route("/api/:driver_id/unlock", post(locks::unlock));

    Router::new()
        .route("/health", get(handle_health))
        .nest("/instrument", api)
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(state: AppState, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let app = router(Arc::new(state));

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Server error: {}", e);
        }
    });

    Ok(actual_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use instrument_agent::{MemoryKvStore, StaticRegistry, ZmqTransport};

    #[tokio::test]
    async fn test_server_starts() {
        let state = AppState::new(
            Arc::new(StaticRegistry::new()),
            LockManager::new(Arc::new(MemoryKvStore::new())),
            Arc::new(ZmqTransport::new()),
        );

        let addr = start_server(state, "127.0.0.1", 0).await.unwrap();
        assert!(addr.port() > 0);
    }

    #[tokio::test]
    async fn test_unregistered_driver_is_not_found() {
        let state = AppState::new(
            Arc::new(StaticRegistry::new()),
            LockManager::new(Arc::new(MemoryKvStore::new())),
            Arc::new(ZmqTransport::new()),
        );
        assert!(matches!(
            state.driver_client("CE01").await,
            Err(instrument_agent::AgentError::DriverNotFound { .. })
        ));
    }
}
