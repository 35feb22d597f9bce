// src/provider/token.rs — Copilot bearer exchange and caching
//
// A long-lived refresh token from the GitHub device flow is exchanged for a
// short-lived bearer at api.github.com/copilot_internal/v2/token. The bearer
// (~30min TTL) authenticates all chat-endpoint requests. The exchange runs
// under an async mutex held for its whole duration, so per account there is
// never more than one refresh in flight; concurrent callers queue on the
// lock and pick up the fresh result.

use std::time::{Duration, SystemTime};

use tokio::sync::Mutex;

use crate::infra::errors::GatewayError;

/// Refresh this long before the recorded expiry.
const EXPIRY_SKEW: u64 = 60;

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone)]
struct Bearer {
    token: String,
    /// Unix seconds.
    expires_at: u64,
}

impl Bearer {
    /// Usable for a new request: expiry is at least the skew away.
    fn is_fresh(&self) -> bool {
        unix_now() + EXPIRY_SKEW < self.expires_at
    }

    /// Not yet past its recorded expiry. A stale-but-valid bearer is still
    /// worth returning when a refresh attempt fails.
    fn is_valid(&self) -> bool {
        unix_now() < self.expires_at
    }

    fn expires_within(&self, window: Duration) -> bool {
        unix_now() + window.as_secs() >= self.expires_at
    }
}

pub struct TokenCache {
    account: String,
    refresh_token: String,
    token_url: String,
    client: reqwest::Client,
    state: Mutex<Option<Bearer>>,
}

impl TokenCache {
    pub fn new(
        account: impl Into<String>,
        refresh_token: impl Into<String>,
        token_url: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            account: account.into(),
            refresh_token: refresh_token.into(),
            token_url: token_url.into(),
            client,
            state: Mutex::new(None),
        }
    }

    /// Current bearer, refreshing if stale. Callers racing a refresh all
    /// wait on the same exchange.
    pub async fn bearer(&self) -> Result<String, GatewayError> {
        let mut guard = self.state.lock().await;
        if let Some(ref bearer) = *guard {
            if bearer.is_fresh() {
                return Ok(bearer.token.clone());
            }
            tracing::debug!(account = %self.account, "bearer stale, refreshing");
        }
        self.refresh_locked(&mut guard).await
    }

    /// Drop the cached bearer (after an upstream 401/403). The next
    /// `bearer()` call performs a fresh exchange.
    pub async fn invalidate(&self) {
        *self.state.lock().await = None;
    }

    /// Background hook: refresh when no bearer is cached or the current one
    /// expires inside `window`.
    pub async fn refresh_if_expiring(&self, window: Duration) -> Result<(), GatewayError> {
        let mut guard = self.state.lock().await;
        match *guard {
            Some(ref bearer) if !bearer.expires_within(window) => Ok(()),
            _ => {
                self.refresh_locked(&mut guard).await?;
                Ok(())
            }
        }
    }

    async fn refresh_locked(
        &self,
        guard: &mut Option<Bearer>,
    ) -> Result<String, GatewayError> {
        match self.exchange().await {
            Ok(bearer) => {
                tracing::info!(
                    account = %self.account,
                    expires_at = bearer.expires_at,
                    "bearer refreshed"
                );
                let token = bearer.token.clone();
                *guard = Some(bearer);
                Ok(token)
            }
            Err(e) => {
                // A failed refresh keeps the previous bearer while it is
                // still within its recorded lifetime.
                if let Some(ref prev) = *guard {
                    if prev.is_valid() {
                        tracing::warn!(
                            account = %self.account,
                            "bearer refresh failed, reusing valid bearer: {e}"
                        );
                        return Ok(prev.token.clone());
                    }
                }
                *guard = None;
                Err(e)
            }
        }
    }

    async fn exchange(&self) -> Result<Bearer, GatewayError> {
        let response = self
            .client
            .get(&self.token_url)
            .header("Authorization", format!("token {}", self.refresh_token))
            .header(
                "User-Agent",
                format!("copilot-fanout/{}", env!("CARGO_PKG_VERSION")),
            )
            .header("Editor-Version", "vscode/1.85.0")
            .header("Editor-Plugin-Version", "copilot-chat/0.11.1")
            .timeout(EXCHANGE_TIMEOUT)
            .send()
            .await
            .map_err(|e| GatewayError::Token {
                account: self.account.clone(),
                message: format!("exchange request failed: {e}"),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Token {
                account: self.account.clone(),
                message: format!("exchange returned HTTP {status}: {body}"),
            });
        }

        let body: serde_json::Value =
            response.json().await.map_err(|e| GatewayError::Token {
                account: self.account.clone(),
                message: format!("unparseable exchange response: {e}"),
            })?;

        let token = body["token"]
            .as_str()
            .ok_or_else(|| GatewayError::Token {
                account: self.account.clone(),
                message: "exchange response missing 'token'".into(),
            })?
            .to_string();

        // Missing expiry: assume 25 minutes, matching observed bearer TTLs.
        let expires_at = body["expires_at"]
            .as_u64()
            .unwrap_or_else(|| unix_now() + 25 * 60);

        Ok(Bearer { token, expires_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_freshness() {
        let fresh = Bearer {
            token: "t".into(),
            expires_at: unix_now() + 300,
        };
        assert!(fresh.is_fresh());
        assert!(fresh.is_valid());

        // Inside the skew: valid for an in-flight response, not for reuse
        let stale = Bearer {
            token: "t".into(),
            expires_at: unix_now() + 30,
        };
        assert!(!stale.is_fresh());
        assert!(stale.is_valid());

        let dead = Bearer {
            token: "t".into(),
            expires_at: unix_now().saturating_sub(1),
        };
        assert!(!dead.is_fresh());
        assert!(!dead.is_valid());
    }

    #[test]
    fn test_expires_within() {
        let bearer = Bearer {
            token: "t".into(),
            expires_at: unix_now() + 1000,
        };
        assert!(!bearer.expires_within(Duration::from_secs(500)));
        assert!(bearer.expires_within(Duration::from_secs(1500)));
    }
}
