// src/provider/registry.rs — Provider registry and the selection/failover loop
//
// Providers are sorted ascending by priority at startup (stable sort keeps
// config order on ties) and the list never changes afterwards. One inbound
// request walks the list until a provider both offers a slot and succeeds.
// Disabled providers stay in the walk so a terminal 503 can name them, but
// are never selected.

use std::sync::Arc;
use std::time::Duration;

use super::copilot::CopilotProvider;
use super::model_cache;
use super::openai_compat::OpenAiCompatProvider;
use super::{ChatContext, Outcome, Provider, SkipReason, UpstreamResponse};
use crate::infra::config::{Config, ProviderConfig};
use crate::infra::errors::{GatewayError, SkipEntry};

/// Extra attempts against the same provider before advancing, each with a
/// different account when the provider has one to offer.
const SAME_PROVIDER_RETRIES: usize = 2;

struct Entry {
    provider: Arc<dyn Provider>,
    enabled: bool,
}

pub struct ProviderRegistry {
    entries: Vec<Entry>,
}

impl ProviderRegistry {
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let request_timeout = config.request_timeout();
        let mut entries: Vec<Entry> = Vec::new();

        for (index, entry) in config.providers.iter().enumerate() {
            let provider: Arc<dyn Provider> = match entry {
                ProviderConfig::Copilot(c) => {
                    let id = c
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("github-copilot#{index}"));
                    Arc::new(CopilotProvider::from_config(id, c, request_timeout)?)
                }
                ProviderConfig::OpenAiCompatible(c) => {
                    let id = c
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("openai-compatible#{index}"));
                    Arc::new(OpenAiCompatProvider::from_config(id, c, request_timeout))
                }
            };
            entries.push(Entry {
                provider,
                enabled: entry.enabled(),
            });
        }

        entries.sort_by_key(|e| e.provider.priority());
        for e in &entries {
            tracing::info!(
                provider = e.provider.id(),
                priority = e.provider.priority(),
                enabled = e.enabled,
                "registered"
            );
        }

        Ok(Self { entries })
    }

    /// Test hook: build a registry straight from provider implementations.
    pub fn from_providers(providers: Vec<Arc<dyn Provider>>) -> Self {
        let mut entries: Vec<Entry> = providers
            .into_iter()
            .map(|provider| Entry {
                provider,
                enabled: true,
            })
            .collect();
        entries.sort_by_key(|e| e.provider.priority());
        Self { entries }
    }

    /// Drive one request to exactly one upstream success or a terminal
    /// error. Failover-eligible errors and skips advance through the
    /// candidate list; anything else returns to the client as-is.
    pub async fn select_and_execute(
        &self,
        ctx: &ChatContext,
    ) -> Result<UpstreamResponse, GatewayError> {
        let mut reasons: Vec<SkipEntry> = Vec::new();

        for entry in &self.entries {
            let provider = &entry.provider;
            if !entry.enabled {
                reasons.push(SkipEntry {
                    provider: provider.id().to_string(),
                    reason: SkipReason::Disabled.to_string(),
                    timed_out: false,
                });
                continue;
            }

            let mut tried_accounts: Vec<String> = Vec::new();
            let mut last_reason = String::from("not attempted");
            let mut last_timed_out = false;

            for attempt in 0..=SAME_PROVIDER_RETRIES {
                let slot = match provider.try_select(ctx, &tried_accounts).await {
                    Ok(slot) => slot,
                    Err(skip) => {
                        tracing::debug!(
                            provider = provider.id(),
                            attempt,
                            "provider skipped: {skip}"
                        );
                        last_reason = skip.to_string();
                        break;
                    }
                };

                match provider.execute(&slot, ctx).await {
                    Ok(response) => {
                        provider.on_result(&slot, Outcome::Success);
                        tracing::debug!(
                            provider = provider.id(),
                            account = slot.account.as_deref().unwrap_or("-"),
                            status = response.status,
                            "request served"
                        );
                        return Ok(response);
                    }
                    Err(error) => {
                        provider.on_result(&slot, Outcome::Failed(&error));
                        if !error.is_failover_eligible() {
                            return Err(error);
                        }
                        tracing::warn!(
                            provider = provider.id(),
                            account = slot.account.as_deref().unwrap_or("-"),
                            attempt,
                            "failover-eligible error: {error}"
                        );
                        last_timed_out = matches!(
                            error,
                            GatewayError::UpstreamTransport { timed_out: true, .. }
                        );
                        last_reason = error.to_string();
                        if let Some(account) = slot.account {
                            tried_accounts.push(account);
                        }
                    }
                }
            }

            reasons.push(SkipEntry {
                provider: provider.id().to_string(),
                reason: last_reason,
                timed_out: last_timed_out,
            });
        }

        Err(GatewayError::NoProviderAvailable { reasons })
    }

    /// Union of every enabled provider's model list, deduped by id in
    /// priority order. Providers that fail contribute nothing; if none
    /// contributes, the whole listing is unavailable.
    pub async fn list_models(&self) -> Result<Vec<serde_json::Value>, GatewayError> {
        let mut per_provider = Vec::new();
        let mut reasons: Vec<SkipEntry> = Vec::new();

        for entry in &self.entries {
            let provider = &entry.provider;
            if !entry.enabled {
                reasons.push(SkipEntry {
                    provider: provider.id().to_string(),
                    reason: SkipReason::Disabled.to_string(),
                    timed_out: false,
                });
                continue;
            }
            match provider.list_models().await {
                Ok(models) => {
                    tracing::debug!(
                        provider = provider.id(),
                        count = models.len(),
                        "models listed"
                    );
                    per_provider.push(models);
                }
                Err(e) => {
                    tracing::warn!(provider = provider.id(), "model listing failed: {e}");
                    reasons.push(SkipEntry {
                        provider: provider.id().to_string(),
                        reason: e.to_string(),
                        timed_out: false,
                    });
                }
            }
        }

        if per_provider.is_empty() {
            return Err(GatewayError::NoProviderAvailable { reasons });
        }
        Ok(model_cache::union(per_provider))
    }

    /// Spawn the background bearer pre-refresher. Wakes every `interval`
    /// and refreshes bearers expiring within the next interval.
    pub fn spawn_token_refresher(registry: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would race startup; skip it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for entry in registry.entries.iter().filter(|e| e.enabled) {
                    entry.provider.refresh_tokens(interval).await;
                }
            }
        });
    }
}
