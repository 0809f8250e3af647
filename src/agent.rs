//! Agent mode runtime
//!
//! Wires the offset store, the Docker label resolver and the metrics
//! registry into a [`LogOrchestrator`], optionally serves the metrics over
//! HTTP and runs until the cancellation token fires.

use crate::logs::{AgentConfig, DockerConfigResolver, LogOrchestrator, OffsetStore};
use crate::metrics::AgentMetrics;
use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// Log shipping agent
pub struct Agent {
    config: AgentConfig,
    registry: Registry,
    orchestrator: LogOrchestrator,
}

impl Agent {
    /// Create a new agent with the given configuration
    pub fn new(config: AgentConfig) -> Result<Self> {
        let registry = Registry::new();
        let metrics = Arc::new(AgentMetrics::new(&registry)?);
        let offset_store = OffsetStore::new(&config.offsets_dir)
            .context("Failed to open offset storage")?;
        let resolver = Arc::new(DockerConfigResolver::new(config.kubernetes_only));
        let orchestrator = LogOrchestrator::new(config.clone(), offset_store, resolver, metrics);

        Ok(Self {
            config,
            registry,
            orchestrator,
        })
    }

    /// Registry holding the agent metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn orchestrator(&self) -> &LogOrchestrator {
        &self.orchestrator
    }

    /// Run until `cancel` fires, then stop every shipper
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let metrics_server = match &self.config.metrics_listen {
            Some(addr) => {
                let (bound, handle) =
                    start_metrics_server(addr, self.registry.clone(), cancel.child_token()).await?;
                info!("Metrics endpoint available at http://{}/metrics", bound);
                Some(handle)
            }
            None => None,
        };

        let result = self.orchestrator.run(cancel.clone()).await;

        if let Some(handle) = metrics_server {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!(error = %e, "metrics server task failed");
            }
        }

        info!("agent stopped");
        result
    }
}

/// Render every metric in `registry` in the Prometheus text format
pub fn render_metrics(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("Failed to encode metrics")?;
    String::from_utf8(buffer).context("Metrics are not valid UTF-8")
}

async fn metrics_handler(State(registry): State<Registry>) -> (StatusCode, String) {
    match render_metrics(&registry) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Router serving `GET /metrics`
pub fn metrics_router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry)
        .layer(CorsLayer::permissive())
}

/// Serve the metrics endpoint on `addr` until `cancel` fires
///
/// Returns the bound address, which differs from `addr` when it asked for port 0.
pub async fn start_metrics_server(
    addr: &str,
    registry: Registry,
    cancel: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics endpoint {}", addr))?;
    let bound = listener.local_addr()?;
    let app = metrics_router(registry);

    let handle = tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "metrics server failed");
        }
    });

    Ok((bound, handle))
}
