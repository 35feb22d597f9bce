// src/api/types.rs

use serde::Serialize;

use crate::infra::errors::SkipEntry;

/// OpenAI-style error envelope.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Last skip/error reason per provider, for debuggability on 503.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<SkipEntry>>,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                kind: "gateway_error".into(),
                providers: None,
            },
        }
    }

    pub fn no_provider(reasons: Vec<SkipEntry>) -> Self {
        Self {
            error: ErrorDetail {
                message: "no provider available".into(),
                kind: "no_provider_available".into(),
                providers: Some(reasons),
            },
        }
    }
}
