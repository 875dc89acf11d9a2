//! HTTP API server: device WebSocket endpoint plus the producer surface

pub mod commands;
pub mod devices;
pub mod health;
pub mod socket;

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::db::{CommandRepo, DbPool, DeviceRepo};
use crate::dispatch::DispatchQueue;
use crate::registry::ConnectionRegistry;
use crate::Result;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub db: DbPool,
    pub registry: Arc<ConnectionRegistry>,
    pub device_repo: DeviceRepo,
    pub command_repo: CommandRepo,
    pub queue: DispatchQueue,
    /// Capacity of each device socket's outbound channel
    pub outbound_buffer: usize,
}

/// Build the full application router
pub fn build_router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(socket::router(Arc::clone(&state)))
        .nest("/api/commands", commands::router(Arc::clone(&state)))
        .nest("/api/devices", devices::router(Arc::clone(&state)))
        .merge(health::router(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Serve the API until the process is stopped
///
/// # Errors
///
/// Returns error if the listener cannot bind or the server fails
pub async fn serve(state: Arc<ApiState>, port: u16) -> Result<()> {
    let app = build_router(state);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;

    tracing::info!(port, "api server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
