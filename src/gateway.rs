// src/gateway.rs — Orchestrator: the gateway's single public entry point
//
// Owns the provider registry and the optional traffic recorder. The HTTP
// layer hands each inbound request to `chat` or `models` and relays whatever
// comes back; everything about upstream choice happens behind this type.

use std::sync::Arc;

use crate::infra::config::Config;
use crate::infra::errors::GatewayError;
use crate::provider::registry::ProviderRegistry;
use crate::provider::{ChatContext, UpstreamResponse};
use crate::recorder::TrafficRecorder;

pub struct Gateway {
    registry: Arc<ProviderRegistry>,
    recorder: Option<TrafficRecorder>,
}

impl Gateway {
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let registry = Arc::new(ProviderRegistry::from_config(config)?);

        ProviderRegistry::spawn_token_refresher(
            registry.clone(),
            config.token_refresh_interval(),
        );

        let recorder = config
            .record_traffic
            .then(|| TrafficRecorder::new(config.capture_dir.clone()));

        Ok(Self { registry, recorder })
    }

    /// Test hook: wire a registry directly, no background tasks.
    pub fn from_registry(registry: ProviderRegistry, recorder: Option<TrafficRecorder>) -> Self {
        Self {
            registry: Arc::new(registry),
            recorder,
        }
    }

    /// One client request in, exactly one upstream success out, unless the
    /// selector exhausts its candidates and returns a terminal error.
    pub async fn chat(&self, ctx: ChatContext) -> Result<UpstreamResponse, GatewayError> {
        let result = self.registry.select_and_execute(&ctx).await;
        if let Some(recorder) = &self.recorder {
            recorder.capture(&ctx, &result);
        }
        result
    }

    /// The `/models` union document body.
    pub async fn models(&self) -> Result<serde_json::Value, GatewayError> {
        let models = self.registry.list_models().await?;
        Ok(serde_json::json!({
            "object": "list",
            "data": models,
        }))
    }
}
