// src/recorder.rs — Optional traffic capture for debugging
//
// When enabled, each chat request writes one JSON file to the capture
// directory. Captures hold the inbound body and routing outcome, never
// credentials: no Authorization values, refresh tokens or bearers are
// written. Capture failures are logged and swallowed; recording must never
// fail a request.

use std::path::PathBuf;

use serde::Serialize;

use crate::infra::errors::GatewayError;
use crate::provider::ChatContext;

pub struct TrafficRecorder {
    dir: PathBuf,
}

#[derive(Debug, Serialize)]
struct Capture<'a> {
    timestamp: String,
    endpoint: &'a str,
    model: &'a str,
    stream: bool,
    request_body: &'a serde_json::Value,
    outcome: CaptureOutcome,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum CaptureOutcome {
    Served {
        provider: String,
        account: Option<String>,
        status: u16,
    },
    Failed {
        error: String,
    },
}

impl TrafficRecorder {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn capture(
        &self,
        ctx: &ChatContext,
        result: &Result<crate::provider::UpstreamResponse, GatewayError>,
    ) {
        let outcome = match result {
            Ok(response) => CaptureOutcome::Served {
                provider: response.provider.clone(),
                account: response.account.clone(),
                status: response.status,
            },
            Err(e) => CaptureOutcome::Failed {
                error: e.to_string(),
            },
        };

        let capture = Capture {
            timestamp: chrono::Utc::now().to_rfc3339(),
            endpoint: &ctx.endpoint,
            model: &ctx.model,
            stream: ctx.stream,
            request_body: &ctx.body,
            outcome,
        };

        let name = format!(
            "{}-{}.json",
            chrono::Utc::now().format("%Y%m%dT%H%M%S"),
            uuid::Uuid::new_v4()
        );
        let path = self.dir.join(name);

        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            tracing::warn!("capture dir unavailable: {e}");
            return;
        }
        match serde_json::to_vec_pretty(&capture) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    tracing::warn!("capture write failed: {e}");
                } else {
                    tracing::debug!(path = %path.display(), "traffic captured");
                }
            }
            Err(e) => tracing::warn!("capture serialize failed: {e}"),
        }
    }
}
