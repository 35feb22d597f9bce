// src/executor.rs — Outbound request execution and streaming relay
//
// Single choke point for talking to an upstream chat endpoint: issues the
// request, classifies non-2xx statuses for the failover machinery, and for
// SSE responses relays the raw bytes chunk-for-chunk. Frames are never
// parsed; the gateway's contract is byte transparency.

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};

use crate::infra::errors::GatewayError;
use crate::provider::{BodyStream, UpstreamResponse};

/// Per-chunk idle read timeout once a stream has started.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Issue a chat request to `url` and hand back a relayable response.
///
/// `total_timeout` bounds the whole call for buffered responses; for
/// streaming it bounds the connection/header phase only, after which the
/// per-chunk idle timeout takes over. Every error returned here is
/// pre-first-byte and therefore classifiable for failover.
pub async fn send_chat(
    client: &reqwest::Client,
    url: &str,
    headers: HeaderMap,
    body: &serde_json::Value,
    stream: bool,
    total_timeout: Duration,
    provider: &str,
) -> Result<UpstreamResponse, GatewayError> {
    let request = client.post(url).headers(headers).json(body);

    let sent = if stream {
        // Total timeout covers the header phase only; the idle timeout
        // governs the body once it starts flowing.
        match tokio::time::timeout(total_timeout, request.send()).await {
            Err(_) => {
                return Err(GatewayError::UpstreamTransport {
                    provider: provider.to_string(),
                    message: format!("no response headers within {}s", total_timeout.as_secs()),
                    timed_out: true,
                })
            }
            Ok(result) => result,
        }
    } else {
        request.timeout(total_timeout).send().await
    };
    let response = sent.map_err(|e| GatewayError::UpstreamTransport {
        provider: provider.to_string(),
        message: e.to_string(),
        timed_out: e.is_timeout(),
    })?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::UpstreamHttp {
            provider: provider.to_string(),
            status: status.as_u16(),
            body,
            retry_after,
        });
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body: BodyStream = if stream {
        relay_stream(response, STREAM_IDLE_TIMEOUT)
    } else {
        buffered(response, provider.to_string()).await?
    };

    Ok(UpstreamResponse {
        status: status.as_u16(),
        content_type,
        body,
        provider: provider.to_string(),
        account: None,
    })
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    // Seconds form only; the HTTP-date form falls back to the cooldown floor.
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

async fn buffered(
    response: reqwest::Response,
    provider: String,
) -> Result<BodyStream, GatewayError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| GatewayError::UpstreamTransport {
            provider,
            message: format!("body read failed: {e}"),
            timed_out: e.is_timeout(),
        })?;
    Ok(Box::pin(futures::stream::once(async move { Ok(bytes) })))
}

/// Relay the upstream body in arrival order. A read error or idle timeout
/// after the first byte is surfaced as a final SSE error frame followed by
/// an orderly end of stream; it is never failed over, the client already
/// holds partial output.
fn relay_stream(response: reqwest::Response, idle_timeout: Duration) -> BodyStream {
    let mut chunks = Box::pin(response.bytes_stream());

    Box::pin(async_stream::stream! {
        let mut received = 0usize;
        loop {
            match tokio::time::timeout(idle_timeout, chunks.next()).await {
                Err(_) => {
                    tracing::warn!(received, "stream idle past {}s, truncating", idle_timeout.as_secs());
                    yield Ok(truncation_frame(received, "idle read timeout"));
                    break;
                }
                Ok(None) => break,
                Ok(Some(Ok(bytes))) => {
                    received += 1;
                    yield Ok(bytes);
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!(received, "stream read error, truncating: {e}");
                    yield Ok(truncation_frame(received, &e.to_string()));
                    break;
                }
            }
        }
    })
}

/// Terminal SSE frame appended to a truncated stream.
fn truncation_frame(received_chunks: usize, message: &str) -> Bytes {
    let payload = serde_json::json!({
        "error": {
            "type": "stream_truncated",
            "message": message,
            "received_chunks": received_chunks,
        }
    });
    Bytes::from(format!("event: error\ndata: {payload}\n\n"))
}
