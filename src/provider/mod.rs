// src/provider/mod.rs — Upstream provider layer

pub mod copilot;
pub mod model_cache;
pub mod openai_compat;
pub mod registry;
pub mod token;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::infra::errors::GatewayError;

/// Relayed response body: a single buffered chunk for plain JSON responses,
/// the upstream's own chunking for SSE.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, GatewayError>> + Send>>;

/// One inbound request, as far as the selection core cares about it. The
/// body is kept as loose JSON so unknown client fields survive the relay.
#[derive(Debug, Clone)]
pub struct ChatContext {
    /// Inbound path, forwarded to the upstream (`/chat/completions`).
    pub endpoint: String,
    pub model: String,
    pub stream: bool,
    pub accept: Option<String>,
    pub body: serde_json::Value,
}

/// The unit acquired from a provider to run one request: an account for
/// Copilot, the provider itself otherwise. Carries the resolved bearer so
/// execution never re-enters the token path. Never logged with the bearer.
#[derive(Clone)]
pub struct Slot {
    pub provider: String,
    pub account: Option<String>,
    pub bearer: Option<String>,
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("provider", &self.provider)
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

/// Why a provider declined to offer a slot. Internal; drives failover and
/// the terminal 503 body, never reaches a client as an error of its own.
#[derive(Debug, Clone)]
pub enum SkipReason {
    Disabled,
    RateExhausted { retry_in: Option<Duration> },
    AllAccountsUnavailable,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "disabled"),
            SkipReason::RateExhausted { retry_in: Some(d) } => {
                write!(f, "rate limit exhausted, retry in {}s", d.as_secs())
            }
            SkipReason::RateExhausted { retry_in: None } => {
                write!(f, "rate limit exhausted")
            }
            SkipReason::AllAccountsUnavailable => {
                write!(f, "all accounts cooling or unauthorized")
            }
        }
    }
}

/// What execution produced, reported back so the provider can bump LRU
/// state or start a cooldown.
pub enum Outcome<'a> {
    Success,
    Failed(&'a GatewayError),
}

/// Upstream response handed back to the HTTP layer for transparent relay.
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: BodyStream,
    /// Which provider/account served this, for logging and traffic capture.
    pub provider: String,
    pub account: Option<String>,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("body", &"<BodyStream>")
            .field("provider", &self.provider)
            .field("account", &self.account)
            .finish()
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    fn priority(&self) -> i32;

    /// Resolve an execution slot, or say why not. `exclude` lists account
    /// ids already burned on this request so same-provider retries land on
    /// a different account when one exists.
    async fn try_select(
        &self,
        ctx: &ChatContext,
        exclude: &[String],
    ) -> Result<Slot, SkipReason>;

    async fn execute(
        &self,
        slot: &Slot,
        ctx: &ChatContext,
    ) -> Result<UpstreamResponse, GatewayError>;

    fn on_result(&self, slot: &Slot, outcome: Outcome<'_>);

    /// The provider's `/models` document entries (cached by the provider).
    async fn list_models(&self) -> Result<Vec<serde_json::Value>, GatewayError>;

    /// Background hook: pre-refresh bearers that expire within `window`.
    /// Providers without a token lifecycle ignore it.
    async fn refresh_tokens(&self, window: Duration) {
        let _ = window;
    }
}
