// src/infra/errors.rs — Error types for the gateway

use std::time::Duration;

use thiserror::Error;

/// One provider's reason for sitting out a request. Collected while the
/// selector walks the provider list so a terminal 503 can name them all.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SkipEntry {
    pub provider: String,
    pub reason: String,
    /// The provider's last attempt died on a pre-first-byte timeout.
    #[serde(skip)]
    pub timed_out: bool,
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Token refresh failed for account '{account}': {message}")]
    Token { account: String, message: String },

    #[error("Upstream transport error via '{provider}': {message}")]
    UpstreamTransport {
        provider: String,
        message: String,
        timed_out: bool,
    },

    #[error("Upstream '{provider}' returned HTTP {status}")]
    UpstreamHttp {
        provider: String,
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("No provider available")]
    NoProviderAvailable { reasons: Vec<SkipEntry> },

    #[error("Stream truncated after {received_chunks} chunks: {message}")]
    StreamTruncated {
        received_chunks: usize,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Whether re-issuing the request against a different slot is safe.
    ///
    /// Mirrors the cooldown table: transport failures, rate refusals, auth
    /// failures (after the provider's inline refresh-retry) and 5xx all fail
    /// over; other 4xx are the client's problem and pass through verbatim.
    pub fn is_failover_eligible(&self) -> bool {
        match self {
            GatewayError::UpstreamTransport { .. } => true,
            GatewayError::Token { .. } => true,
            GatewayError::UpstreamHttp { status, .. } => {
                matches!(status, 401 | 403 | 429) || *status >= 500
            }
            _ => false,
        }
    }

    /// How long the failing slot should cool before re-entering selection.
    /// `None` means the error carries no cooldown (e.g. client errors).
    pub fn cooldown(&self) -> Option<Duration> {
        match self {
            GatewayError::UpstreamHttp {
                status, retry_after, ..
            } => match status {
                401 | 403 => Some(Duration::from_secs(600)),
                429 => Some(retry_after.unwrap_or_default().max(Duration::from_secs(30))),
                s if *s >= 500 => Some(Duration::from_secs(60)),
                _ => None,
            },
            GatewayError::UpstreamTransport { .. } => Some(Duration::from_secs(30)),
            GatewayError::Token { .. } => Some(Duration::from_secs(60)),
            _ => None,
        }
    }
}
