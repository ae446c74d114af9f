//! REST API routes configuration

use crate::api::handlers::{self, ApiState};
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

/// Create the API router with all routes
pub fn create_router(state: ApiState) -> Router {
    // Configure CORS for browser access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/status", get(handlers::get_status))
        .route("/api/connections", get(handlers::get_connections))
        .route("/api/commands", get(handlers::get_commands))
        .route("/api/shutdown", post(handlers::shutdown))
        .with_state(state)
        .layer(cors)
}

/// Serve the API on `port` until `state.shutdown` is cancelled
pub async fn serve(port: u16, state: ApiState) -> Result<(), std::io::Error> {
    let shutdown = state.shutdown.clone();
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Status API listening on http://{}", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
