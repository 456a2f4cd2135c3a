//! HTTP and WebSocket server
//!
//! Serves the multiplexer WebSocket and a few JSON endpoints the console
//! uses to discover clusters. With dynamic clusters enabled, clusters can
//! also be added and removed at runtime.

mod handlers;

pub use handlers::{
    ApiError, ClientConfig, ClusterRequest, ClusterSummary, ContextKeyResponse, KubeconfigRequest,
};

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;

use crate::state::GatewayState;

/// Path of the client-facing multiplexer socket
pub const WS_MULTIPLEXER_PATH: &str = "/wsMultiplexer";

/// Build the gateway router
pub fn router(state: Arc<GatewayState>) -> Router {
    let mut router = Router::new()
        .route(WS_MULTIPLEXER_PATH, get(handlers::ws_multiplexer))
        .route("/config", get(handlers::get_config))
        .route("/parseKubeconfig", post(handlers::parse_kubeconfig))
        .route("/clusters/:cluster/context", get(handlers::resolve_context))
        .route("/healthz", get(handlers::healthz));

    if state.config.enable_dynamic_clusters {
        router = router
            .route("/cluster", post(handlers::add_cluster))
            .route("/cluster/:name", delete(handlers::delete_cluster));
    }

    router.with_state(state)
}

/// HTTP server bound to the gateway state
pub struct GatewayServer {
    state: Arc<GatewayState>,
}

impl GatewayServer {
    /// Create a new server
    pub fn new(state: Arc<GatewayState>) -> Self {
        Self { state }
    }

    /// Bind and serve until the shutdown token fires
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.serve(listener).await
    }

    /// Serve on an existing listener until the shutdown token fires
    ///
    /// Open sessions are closed once the listener stops.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Gateway listening on {}", local_addr);

        let shutdown = self.state.shutdown.clone();
        axum::serve(listener, router(Arc::clone(&self.state)))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("HTTP server failed")?;

        tracing::info!("Gateway server shutting down");
        self.state.multiplexer.shutdown().await;
        Ok(())
    }
}
