// src/provider/openai_compat.rs — Generic OpenAI-compatible provider
//
// Single endpoint, single key, optional model-name remap. The provider
// itself is the execution slot; rate limiting is provider-granularity only.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use super::model_cache::ModelCache;
use super::{ChatContext, Outcome, Provider, SkipReason, Slot, UpstreamResponse};
use crate::executor;
use crate::infra::config::OpenAiCompatConfig;
use crate::infra::errors::GatewayError;
use crate::ratelimit::RateLimiter;

pub struct OpenAiCompatProvider {
    id: String,
    priority: i32,
    base_url: String,
    api_key: String,
    model_mapping: HashMap<String, String>,
    limiter: RateLimiter,
    client: reqwest::Client,
    request_timeout: Duration,
    cooling_until: Mutex<Option<Instant>>,
    models: ModelCache,
}

impl OpenAiCompatProvider {
    pub fn from_config(
        id: String,
        config: &OpenAiCompatConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            id,
            priority: config.priority,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model_mapping: config.model_mapping.clone(),
            limiter: RateLimiter::new(config.rate_limits.iter().map(|r| r.window())),
            client: reqwest::Client::new(),
            request_timeout,
            cooling_until: Mutex::new(None),
            models: ModelCache::default(),
        }
    }

    fn is_cooling(&self, now: Instant) -> bool {
        let mut cooling = self.cooling_until.lock().unwrap();
        match *cooling {
            Some(until) if until > now => true,
            Some(_) => {
                *cooling = None;
                false
            }
            None => false,
        }
    }

    /// Remap the client's model name; identity when unmapped.
    fn remap_model(&self, body: &Value, model: &str) -> Value {
        match self.model_mapping.get(model) {
            Some(upstream_model) => {
                let mut body = body.clone();
                body["model"] = Value::String(upstream_model.clone());
                body
            }
            None => body.clone(),
        }
    }

    fn auth_headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "Authorization",
            format!("Bearer {}", self.api_key)
                .parse()
                .expect("valid header"),
        );
        headers
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn try_select(
        &self,
        _ctx: &ChatContext,
        _exclude: &[String],
    ) -> Result<Slot, SkipReason> {
        if self.is_cooling(Instant::now()) {
            return Err(SkipReason::AllAccountsUnavailable);
        }
        if !self.limiter.try_acquire() {
            return Err(SkipReason::RateExhausted {
                retry_in: self
                    .limiter
                    .next_available()
                    .map(|at| at.saturating_duration_since(Instant::now())),
            });
        }
        Ok(Slot {
            provider: self.id.clone(),
            account: None,
            bearer: None,
        })
    }

    async fn execute(
        &self,
        _slot: &Slot,
        ctx: &ChatContext,
    ) -> Result<UpstreamResponse, GatewayError> {
        let url = format!("{}{}", self.base_url, ctx.endpoint);
        let body = self.remap_model(&ctx.body, &ctx.model);
        executor::send_chat(
            &self.client,
            &url,
            self.auth_headers(),
            &body,
            ctx.stream,
            self.request_timeout,
            &self.id,
        )
        .await
    }

    fn on_result(&self, _slot: &Slot, outcome: Outcome<'_>) {
        if let Outcome::Failed(error) = outcome {
            if let Some(cooldown) = error.cooldown() {
                tracing::warn!(
                    provider = %self.id,
                    cooldown_s = cooldown.as_secs(),
                    "cooling provider after error: {error}"
                );
                *self.cooling_until.lock().unwrap() = Some(Instant::now() + cooldown);
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<Value>, GatewayError> {
        if let Some(models) = self.models.get() {
            return Ok(models);
        }

        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamTransport {
                provider: self.id.clone(),
                message: e.to_string(),
                timed_out: e.is_timeout(),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::UpstreamHttp {
                provider: self.id.clone(),
                status,
                body,
                retry_after: None,
            });
        }

        let document: Value =
            response
                .json()
                .await
                .map_err(|e| GatewayError::UpstreamTransport {
                    provider: self.id.clone(),
                    message: format!("unparseable /models response: {e}"),
                    timed_out: false,
                })?;

        // Client-visible ids are the mapping keys, so remapped entries are
        // surfaced under the name clients actually send.
        let mut models = document["data"].as_array().cloned().unwrap_or_default();
        for (client_model, upstream_model) in &self.model_mapping {
            if !models
                .iter()
                .any(|m| m["id"].as_str() == Some(client_model))
            {
                models.push(serde_json::json!({
                    "id": client_model,
                    "object": "model",
                    "owned_by": self.id,
                    "root": upstream_model,
                }));
            }
        }
        self.models.put(models.clone());
        Ok(models)
    }
}
