// src/infra/config.rs — Configuration loading (JSON)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::infra::errors::GatewayError;

/// Default Copilot chat endpoint for individual subscriptions.
pub const DEFAULT_COPILOT_BASE: &str = "https://api.individual.githubcopilot.com";

/// Default GitHub endpoint for the refresh-token → bearer exchange.
pub const DEFAULT_TOKEN_URL: &str = "https://api.github.com/copilot_internal/v2/token";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub providers: Vec<ProviderConfig>,

    /// Background bearer pre-refresh cadence, seconds.
    #[serde(default = "default_token_refresh_interval")]
    pub token_refresh_interval: u64,

    /// Total outbound request timeout, seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    #[serde(default)]
    pub record_traffic: bool,

    #[serde(default = "default_capture_dir")]
    pub capture_dir: PathBuf,

    /// When set, inbound `Authorization: Bearer` must match this key.
    #[serde(default)]
    pub master_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ProviderConfig {
    #[serde(rename = "github-copilot")]
    Copilot(CopilotConfig),
    #[serde(rename = "openai-compatible")]
    OpenAiCompatible(OpenAiCompatConfig),
}

impl ProviderConfig {
    pub fn enabled(&self) -> bool {
        match self {
            ProviderConfig::Copilot(c) => c.enabled,
            ProviderConfig::OpenAiCompatible(c) => c.enabled,
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            ProviderConfig::Copilot(c) => c.priority,
            ProviderConfig::OpenAiCompatible(c) => c.priority,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CopilotConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub priority: i32,
    #[serde(default)]
    pub rate_limits: Vec<RateLimitConfig>,
    pub accounts: Vec<AccountConfig>,
    /// Override for GitHub Enterprise deployments (and tests).
    #[serde(default = "default_copilot_base")]
    pub chat_base_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    /// Long-lived refresh token from the GitHub device flow. Never logged.
    pub token: String,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// Absent means the account itself is unlimited; the provider-level
    /// budget still applies.
    #[serde(default)]
    pub rate_limits: Vec<RateLimitConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// SOCKS5 URL with remote DNS resolution, credentials excluded.
    pub fn url(&self) -> String {
        format!("socks5h://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiCompatConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub priority: i32,
    #[serde(default)]
    pub rate_limits: Vec<RateLimitConfig>,
    pub base_url: String,
    pub api_key: String,
    /// client model name → upstream model name; identity when absent.
    #[serde(default)]
    pub model_mapping: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    /// Window length, seconds.
    pub duration: u64,
    pub max_requests: usize,
}

impl RateLimitConfig {
    pub fn window(&self) -> (Duration, usize) {
        (Duration::from_secs(self.duration), self.max_requests)
    }
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self, GatewayError> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Config = serde_json::from_str(&data)
            .map_err(|e| GatewayError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation. Anything wrong here is fatal before the listener
    /// binds; a half-configured gateway must not accept traffic.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.providers.is_empty() {
            return Err(GatewayError::Config("no providers configured".into()));
        }
        for (i, provider) in self.providers.iter().enumerate() {
            match provider {
                ProviderConfig::Copilot(c) => {
                    if c.accounts.is_empty() {
                        return Err(GatewayError::Config(format!(
                            "github-copilot provider #{i} has no accounts"
                        )));
                    }
                    for account in &c.accounts {
                        if account.id.is_empty() || account.token.is_empty() {
                            return Err(GatewayError::Config(format!(
                                "github-copilot provider #{i}: account id and token are required"
                            )));
                        }
                    }
                }
                ProviderConfig::OpenAiCompatible(c) => {
                    url::Url::parse(&c.base_url).map_err(|e| {
                        GatewayError::Config(format!(
                            "openai-compatible provider #{i}: bad base_url '{}': {e}",
                            c.base_url
                        ))
                    })?;
                    if c.api_key.is_empty() {
                        return Err(GatewayError::Config(format!(
                            "openai-compatible provider #{i}: api_key is required"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn token_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.token_refresh_interval)
    }
}

fn default_true() -> bool {
    true
}

fn default_token_refresh_interval() -> u64 {
    1500
}

fn default_request_timeout() -> u64 {
    100
}

fn default_capture_dir() -> PathBuf {
    PathBuf::from("./captures")
}

fn default_copilot_base() -> String {
    DEFAULT_COPILOT_BASE.into()
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.into()
}
