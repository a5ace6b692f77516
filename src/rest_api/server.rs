//! Axum HTTP server for the REST API

use std::sync::Arc;

use axum::{routing::get, Router};
use prometheus_client::encoding::text::encode;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::controller::{metrics, ControllerState, ResourceCache};
use crate::crd::DataCenter;
use crate::{Error, Result};

use super::handlers;

/// Metrics endpoint handler
async fn metrics_handler() -> String {
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &metrics::REGISTRY) {
        error!("Failed to encode metrics: {}", e);
    }
    buffer
}

/// Routes served over the datacenter cache
pub fn router(datacenters: ResourceCache<DataCenter>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/datacenters", get(handlers::list_datacenters))
        .route(
            "/api/v1/datacenters/{namespace}",
            get(handlers::list_namespace_datacenters),
        )
        .route(
            "/api/v1/datacenters/{namespace}/{name}",
            get(handlers::get_datacenter),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(datacenters)
}

/// Run the REST API server
pub async fn run_server(state: Arc<ControllerState>) -> Result<()> {
    let addr = state.config.api_bind_address.clone();
    let app = router(state.datacenters.clone());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("REST API server listening on {}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}
