// src/api/handlers.rs

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use crate::api::{auth, types::ErrorBody, ApiState};
use crate::infra::errors::GatewayError;
use crate::provider::ChatContext;

/// POST /chat/completions — relay one chat request to whichever upstream
/// the selector picks. Streaming requests are relayed as SSE.
pub async fn chat_completions(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(rejection) = auth::check_auth(&state, &headers) {
        return rejection.into_response();
    }

    let Some(model) = body["model"].as_str().map(str::to_string) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new("'model' is required")),
        )
            .into_response();
    };

    let ctx = ChatContext {
        endpoint: "/chat/completions".into(),
        model,
        stream: body["stream"].as_bool().unwrap_or(false),
        accept: headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    };

    match state.gateway.chat(ctx).await {
        Ok(upstream) => {
            let content_type = upstream.content_type.unwrap_or_else(|| {
                "application/json".to_string()
            });
            Response::builder()
                .status(upstream.status)
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from_stream(upstream.body))
                .unwrap_or_else(|e| {
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(ErrorBody::new(format!("response build failed: {e}"))),
                    )
                        .into_response()
                })
        }
        Err(error) => error_response(error),
    }
}

/// GET /models — union of model lists across providers.
pub async fn models(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if let Err(rejection) = auth::check_auth(&state, &headers) {
        return rejection.into_response();
    }

    match state.gateway.models().await {
        Ok(document) => Json(document).into_response(),
        Err(error) => error_response(error),
    }
}

/// GET /health — liveness probe.
pub async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Map terminal gateway errors onto client-facing statuses: upstream 4xx
/// pass through verbatim, exhaustion is 503 (or 504 when the last failures
/// were pre-first-byte timeouts), anything else is a bad gateway.
fn error_response(error: GatewayError) -> Response {
    match error {
        GatewayError::UpstreamHttp { status, body, .. } => {
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap_or_else(|_| status.into_response())
        }
        GatewayError::NoProviderAvailable { reasons } => {
            let status = if reasons.iter().any(|r| r.timed_out) {
                StatusCode::GATEWAY_TIMEOUT
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (status, Json(ErrorBody::no_provider(reasons))).into_response()
        }
        other => (
            StatusCode::BAD_GATEWAY,
            Json(ErrorBody::new(other.to_string())),
        )
            .into_response(),
    }
}
