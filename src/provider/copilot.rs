// src/provider/copilot.rs — GitHub Copilot provider (multi-account)
//
// Owns an ordered set of accounts, each with its own refresh token, token
// cache, rate budget and (optionally) SOCKS5 egress proxy. Selection picks
// the least-recently-used account among those that are not cooling and whose
// rate windows admit; the provider-level budget must admit as well.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::Value;

use super::model_cache::ModelCache;
use super::token::TokenCache;
use super::{ChatContext, Outcome, Provider, SkipReason, Slot, UpstreamResponse};
use crate::executor;
use crate::infra::config::{AccountConfig, CopilotConfig};
use crate::infra::errors::GatewayError;
use crate::ratelimit::RateLimiter;

/// Copilot rejects chat requests asking for more output tokens than this.
const MAX_TOKENS_CAP: u64 = 10_240;

/// Cooldown applied when an account cannot produce a bearer at selection.
const TOKEN_FAILURE_COOLDOWN: Duration = Duration::from_secs(60);

struct AccountState {
    cooling_until: Option<Instant>,
    last_used: Option<Instant>,
}

pub struct Account {
    id: String,
    tokens: TokenCache,
    limiter: RateLimiter,
    client: reqwest::Client,
    state: Mutex<AccountState>,
}

impl Account {
    fn from_config(config: &AccountConfig, token_url: &str) -> Result<Self, GatewayError> {
        let mut builder = reqwest::Client::builder();
        if let Some(proxy) = &config.proxy {
            let mut p = reqwest::Proxy::all(proxy.url()).map_err(|e| {
                GatewayError::Config(format!("account '{}': bad proxy: {e}", config.id))
            })?;
            if let Some(user) = &proxy.username {
                p = p.basic_auth(user, proxy.password.as_deref().unwrap_or(""));
            }
            builder = builder.proxy(p);
        }
        let client = builder.build().map_err(|e| {
            GatewayError::Config(format!("account '{}': http client: {e}", config.id))
        })?;

        Ok(Self {
            id: config.id.clone(),
            tokens: TokenCache::new(&config.id, &config.token, token_url, client.clone()),
            limiter: RateLimiter::new(config.rate_limits.iter().map(|r| r.window())),
            client,
            state: Mutex::new(AccountState {
                cooling_until: None,
                last_used: None,
            }),
        })
    }

    fn is_cooling(&self, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.cooling_until {
            Some(until) if until > now => true,
            Some(_) => {
                // Cooldown elapsed; clear it so logs stop mentioning it
                state.cooling_until = None;
                false
            }
            None => false,
        }
    }

    fn last_used(&self) -> Option<Instant> {
        self.state.lock().unwrap().last_used
    }

    fn bump_lru(&self, now: Instant) {
        self.state.lock().unwrap().last_used = Some(now);
    }

    fn cool(&self, duration: Duration) {
        let until = Instant::now() + duration;
        self.state.lock().unwrap().cooling_until = Some(until);
    }
}

pub struct CopilotProvider {
    id: String,
    priority: i32,
    accounts: Vec<Account>,
    limiter: RateLimiter,
    chat_base: String,
    request_timeout: Duration,
    models: ModelCache,
}

impl CopilotProvider {
    pub fn from_config(
        id: String,
        config: &CopilotConfig,
        request_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let accounts = config
            .accounts
            .iter()
            .map(|a| Account::from_config(a, &config.token_url))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id,
            priority: config.priority,
            accounts,
            limiter: RateLimiter::new(config.rate_limits.iter().map(|r| r.window())),
            chat_base: config.chat_base_url.trim_end_matches('/').to_string(),
            request_timeout,
            models: ModelCache::default(),
        })
    }

    fn account(&self, slot: &Slot) -> Option<&Account> {
        let id = slot.account.as_deref()?;
        self.accounts.iter().find(|a| a.id == id)
    }

    /// Headers required by the Copilot chat endpoint. The editor identity is
    /// centralised here; upstream occasionally tightens what it accepts.
    fn copilot_headers(&self, bearer: &str, accept: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Authorization",
            format!("Bearer {bearer}").parse().expect("valid header"),
        );
        headers.insert("Editor-Version", "vscode/1.85.0".parse().expect("static"));
        headers.insert(
            "Editor-Plugin-Version",
            "copilot-chat/0.11.1".parse().expect("static"),
        );
        headers.insert(
            "Copilot-Integration-Id",
            "vscode-chat".parse().expect("static"),
        );
        headers.insert(
            "User-Agent",
            format!("copilot-fanout/{}", env!("CARGO_PKG_VERSION"))
                .parse()
                .expect("valid header"),
        );
        if let Some(accept) = accept {
            if let Ok(value) = accept.parse() {
                headers.insert("Accept", value);
            }
        }
        headers
    }

    async fn send(
        &self,
        account: &Account,
        bearer: &str,
        ctx: &ChatContext,
        body: &Value,
    ) -> Result<UpstreamResponse, GatewayError> {
        let url = format!("{}{}", self.chat_base, ctx.endpoint);
        let headers = self.copilot_headers(bearer, ctx.accept.as_deref());
        executor::send_chat(
            &account.client,
            &url,
            headers,
            body,
            ctx.stream,
            self.request_timeout,
            &self.id,
        )
        .await
    }
}

/// Flatten content-part arrays into plain strings and clamp `max_tokens`.
///
/// Copilot rejects messages whose `content` is an array of typed parts:
/// textual parts are joined with a newline into a single string; non-text
/// parts (images etc.) are dropped. Applying the transform twice is a no-op.
pub fn normalize_body(mut body: Value) -> Value {
    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        for message in messages.iter_mut() {
            let Some(parts) = message.get("content").and_then(Value::as_array) else {
                continue;
            };
            let mut texts: Vec<&str> = Vec::new();
            let mut dropped = 0usize;
            for part in parts {
                if let Some(s) = part.as_str() {
                    texts.push(s);
                } else if part.get("type").and_then(Value::as_str) == Some("text") {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        texts.push(text);
                    }
                } else {
                    dropped += 1;
                }
            }
            if dropped > 0 {
                tracing::warn!(
                    dropped,
                    "dropped non-text content parts; vision input is not supported"
                );
            }
            let flattened = texts.join("\n");
            message["content"] = Value::String(flattened);
        }
    }

    if let Some(max_tokens) = body.get("max_tokens").and_then(Value::as_u64) {
        if max_tokens > MAX_TOKENS_CAP {
            tracing::debug!(max_tokens, cap = MAX_TOKENS_CAP, "clamping max_tokens");
            body["max_tokens"] = Value::from(MAX_TOKENS_CAP);
        }
    }

    body
}

#[async_trait]
impl Provider for CopilotProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn try_select(
        &self,
        _ctx: &ChatContext,
        exclude: &[String],
    ) -> Result<Slot, SkipReason> {
        let now = Instant::now();

        // Least-recently-used first; never-used accounts sort ahead, ties
        // keep config order (stable sort).
        let mut candidates: Vec<(usize, Option<Instant>)> = self
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| !exclude.contains(&a.id) && !a.is_cooling(now))
            .map(|(i, a)| (i, a.last_used()))
            .collect();
        candidates.sort_by_key(|&(_, last_used)| last_used);

        if candidates.is_empty() {
            return Err(SkipReason::AllAccountsUnavailable);
        }

        let mut any_admitted = false;
        for (index, _) in candidates {
            let account = &self.accounts[index];
            if !account.limiter.try_acquire() {
                tracing::debug!(account = %account.id, "account rate window full");
                continue;
            }
            any_admitted = true;
            if !self.limiter.try_acquire() {
                // Provider budget spent; no account can help
                return Err(SkipReason::RateExhausted {
                    retry_in: self
                        .limiter
                        .next_available()
                        .map(|at| at.saturating_duration_since(Instant::now())),
                });
            }
            match account.tokens.bearer().await {
                Ok(bearer) => {
                    return Ok(Slot {
                        provider: self.id.clone(),
                        account: Some(account.id.clone()),
                        bearer: Some(bearer),
                    })
                }
                Err(e) => {
                    tracing::warn!(account = %account.id, "no bearer at selection: {e}");
                    account.cool(TOKEN_FAILURE_COOLDOWN);
                }
            }
        }

        if any_admitted {
            Err(SkipReason::AllAccountsUnavailable)
        } else {
            Err(SkipReason::RateExhausted {
                retry_in: self
                    .accounts
                    .iter()
                    .filter_map(|a| a.limiter.next_available())
                    .min()
                    .map(|at| at.saturating_duration_since(Instant::now())),
            })
        }
    }

    async fn execute(
        &self,
        slot: &Slot,
        ctx: &ChatContext,
    ) -> Result<UpstreamResponse, GatewayError> {
        let account = self.account(slot).ok_or_else(|| {
            GatewayError::Config(format!("slot names unknown account {:?}", slot.account))
        })?;
        let bearer = slot.bearer.clone().ok_or_else(|| {
            GatewayError::Config("copilot slot carries no bearer".into())
        })?;

        let body = normalize_body(ctx.body.clone());

        let mut result = self.send(account, &bearer, ctx, &body).await;

        // A rejected bearer gets one forced refresh and one retry; a second
        // rejection flows to on_result, which cools the account.
        if let Err(GatewayError::UpstreamHttp { status: 401 | 403, .. }) = result {
            tracing::info!(account = %account.id, "bearer rejected, refreshing once");
            account.tokens.invalidate().await;
            let fresh = account.tokens.bearer().await?;
            result = self.send(account, &fresh, ctx, &body).await;
        }

        result.map(|mut response| {
            response.account = Some(account.id.clone());
            response
        })
    }

    fn on_result(&self, slot: &Slot, outcome: Outcome<'_>) {
        let Some(account) = self.account(slot) else {
            return;
        };
        match outcome {
            Outcome::Success => account.bump_lru(Instant::now()),
            Outcome::Failed(error) => {
                if let Some(cooldown) = error.cooldown() {
                    tracing::warn!(
                        account = %account.id,
                        cooldown_s = cooldown.as_secs(),
                        "cooling account after error: {error}"
                    );
                    account.cool(cooldown);
                }
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<Value>, GatewayError> {
        if let Some(models) = self.models.get() {
            return Ok(models);
        }

        // Any account with an obtainable bearer can enumerate models
        let now = Instant::now();
        let mut last_error: Option<GatewayError> = None;
        for account in self.accounts.iter().filter(|a| !a.is_cooling(now)) {
            let bearer = match account.tokens.bearer().await {
                Ok(b) => b,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };
            let url = format!("{}/models", self.chat_base);
            let response = account
                .client
                .get(&url)
                .headers(self.copilot_headers(&bearer, Some("application/json")))
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

            let document: Value = response.json().await.map_err(|e| {
                GatewayError::UpstreamTransport {
                    provider: self.id.clone(),
                    message: format!("unparseable /models response: {e}"),
                    timed_out: false,
                }
            })?;

            let models = document["data"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            self.models.put(models.clone());
            return Ok(models);
        }

        Err(last_error.unwrap_or_else(|| GatewayError::Token {
            account: "-".into(),
            message: "no account available for model listing".into(),
        }))
    }

    async fn refresh_tokens(&self, window: Duration) {
        for account in &self.accounts {
            if let Err(e) = account.tokens.refresh_if_expiring(window).await {
                tracing::warn!(account = %account.id, "background refresh failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_normalize_flattens_text_parts() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "a"},
                    {"type": "text", "text": "b"}
                ]
            }]
        });
        let out = normalize_body(body);
        assert_eq!(out["messages"][0]["content"], json!("a\nb"));
    }

    #[test]
    fn test_normalize_drops_non_text_parts() {
        let body = json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "look at this"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,xyz"}}
                ]
            }]
        });
        let out = normalize_body(body);
        assert_eq!(out["messages"][0]["content"], json!("look at this"));
    }

    #[test]
    fn test_normalize_accepts_bare_string_parts() {
        let body = json!({
            "messages": [{"role": "user", "content": ["plain", "strings"]}]
        });
        let out = normalize_body(body);
        assert_eq!(out["messages"][0]["content"], json!("plain\nstrings"));
    }

    #[test]
    fn test_normalize_leaves_string_content_alone() {
        let body = json!({
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hello"}
            ],
            "stream": true
        });
        let out = normalize_body(body.clone());
        assert_eq!(out, body);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let body = json!({
            "messages": [{
                "role": "user",
                "content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]
            }],
            "max_tokens": 99999
        });
        let once = normalize_body(body);
        let twice = normalize_body(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_max_tokens_clamped() {
        let out = normalize_body(json!({"max_tokens": 32768}));
        assert_eq!(out["max_tokens"], json!(MAX_TOKENS_CAP));

        let out = normalize_body(json!({"max_tokens": 512}));
        assert_eq!(out["max_tokens"], json!(512));

        // Absent max_tokens stays absent
        let out = normalize_body(json!({"model": "gpt-4o"}));
        assert!(out.get("max_tokens").is_none());
    }

    #[test]
    fn test_stream_flag_forwarded_unchanged() {
        let out = normalize_body(json!({"stream": true}));
        assert_eq!(out["stream"], json!(true));
        let out = normalize_body(json!({"stream": false}));
        assert_eq!(out["stream"], json!(false));
    }

    fn test_account(id: &str) -> Account {
        Account {
            id: id.into(),
            tokens: TokenCache::new(id, "refresh", "http://127.0.0.1:1/token",
                reqwest::Client::new()),
            limiter: RateLimiter::unlimited(),
            client: reqwest::Client::new(),
            state: Mutex::new(AccountState {
                cooling_until: None,
                last_used: None,
            }),
        }
    }

    #[test]
    fn test_account_cooling_decays() {
        let account = test_account("a");
        let now = Instant::now();
        assert!(!account.is_cooling(now));

        account.cool(Duration::from_secs(30));
        assert!(account.is_cooling(Instant::now()));
        // A query from the far future sees the cooldown expired
        assert!(!account.is_cooling(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_lru_ordering_prefers_never_used() {
        let a = test_account("a");
        let b = test_account("b");
        let now = Instant::now();
        a.bump_lru(now);

        // None sorts before Some: b (never used) wins
        let mut candidates = vec![(0usize, a.last_used()), (1usize, b.last_used())];
        candidates.sort_by_key(|&(_, last_used)| last_used);
        assert_eq!(candidates[0].0, 1);
    }
}
