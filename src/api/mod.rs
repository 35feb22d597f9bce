// src/api/mod.rs — Inbound OpenAI-compatible HTTP surface

pub mod auth;
pub mod handlers;
pub mod types;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::gateway::Gateway;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub gateway: Arc<Gateway>,
    /// When set, inbound `Authorization: Bearer` must match.
    pub master_key: Option<String>,
}

/// Build the axum router with all API routes. `/v1` aliases exist because
/// OpenAI SDKs join their base URL with `/v1/...` paths.
pub fn build_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/models", get(handlers::models))
        .route("/v1/models", get(handlers::models))
        .route("/health", get(handlers::health))
        .layer(cors)
        .with_state(state)
}

/// Start the API server (blocking until shutdown).
pub async fn start_server(host: &str, port: u16, state: ApiState) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let router = build_router(state);

    tracing::info!("gateway listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
