use std::sync::OnceLock;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use conduit_protocol::sse::{SseEvent, SseParser};

use crate::{ProviderFailure, TransformedRequest};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

static SHARED_CLIENT: OnceLock<wreq::Client> = OnceLock::new();

/// Process-wide upstream HTTP client, built once.
pub fn shared_client() -> Result<wreq::Client, String> {
    if let Some(client) = SHARED_CLIENT.get() {
        return Ok(client.clone());
    }
    let client = wreq::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|err| err.to_string())?;
    Ok(SHARED_CLIENT.get_or_init(|| client).clone())
}

fn classify_wreq_error(
    provider: &'static str,
    deployment: &str,
    err: wreq::Error,
) -> ProviderFailure {
    let message = if err.is_timeout() {
        format!("timed out: {err}")
    } else if err.is_connect() {
        format!("connect failed: {err}")
    } else {
        err.to_string()
    };
    ProviderFailure::Transport {
        provider,
        deployment: deployment.to_string(),
        message,
    }
}

fn classify_status(
    provider: &'static str,
    deployment: &str,
    status: u16,
    body: &str,
) -> ProviderFailure {
    match status {
        401 => ProviderFailure::AuthFailed {
            provider,
            deployment: deployment.to_string(),
        },
        429 => ProviderFailure::RateLimited {
            provider,
            deployment: deployment.to_string(),
        },
        _ => ProviderFailure::UpstreamStatus {
            provider,
            deployment: deployment.to_string(),
            status,
            detail: body.chars().take(200).collect(),
        },
    }
}

async fn dispatch(
    provider: &'static str,
    deployment: &str,
    transformed: &TransformedRequest,
) -> Result<wreq::Response, ProviderFailure> {
    let client = shared_client().map_err(|message| ProviderFailure::Transport {
        provider,
        deployment: deployment.to_string(),
        message,
    })?;

    let mut request = client.post(&transformed.url);
    for (name, value) in &transformed.headers {
        request = request.header(*name, value.as_str());
    }
    request
        .json(&transformed.body)
        .send()
        .await
        .map_err(|err| classify_wreq_error(provider, deployment, err))
}

/// POST the transformed request and return the parsed JSON body of a 2xx
/// response. Non-2xx statuses are classified per the shared error mapping.
pub(crate) async fn send_json(
    provider: &'static str,
    deployment: &str,
    transformed: &TransformedRequest,
) -> Result<JsonValue, ProviderFailure> {
    let response = dispatch(provider, deployment, transformed).await?;
    let status = response.status().as_u16();

    if !(200..300).contains(&status) {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(provider, deployment, status, "upstream error response");
        return Err(classify_status(provider, deployment, status, &body));
    }

    response
        .json::<JsonValue>()
        .await
        .map_err(|err| ProviderFailure::Decode {
            provider,
            deployment: deployment.to_string(),
            message: err.to_string(),
        })
}

/// POST the transformed request and return the upstream SSE event stream.
/// The status line is checked before this resolves, so callers can still
/// fall back to another deployment on a refused request.
pub(crate) async fn open_sse(
    provider: &'static str,
    deployment: &str,
    transformed: &TransformedRequest,
) -> Result<ReceiverStream<SseEvent>, ProviderFailure> {
    let response = dispatch(provider, deployment, transformed).await?;
    let status = response.status().as_u16();

    if !(200..300).contains(&status) {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(provider, deployment, status, "upstream refused stream");
        return Err(classify_status(provider, deployment, status, &body));
    }

    let deployment = deployment.to_string();
    let (tx, rx) = mpsc::channel::<SseEvent>(32);
    tokio::spawn(async move {
        let mut parser = SseParser::new();
        let mut bytes = response.bytes_stream();
        while let Some(chunk) = bytes.next().await {
            let chunk: Bytes = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::warn!(provider, deployment = %deployment, error = %err, "upstream stream aborted");
                    break;
                }
            };
            for event in parser.feed(&chunk) {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
        for event in parser.finish() {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    });

    Ok(ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status("openai", "d", 401, ""),
            ProviderFailure::AuthFailed { .. }
        ));
        assert!(matches!(
            classify_status("openai", "d", 429, ""),
            ProviderFailure::RateLimited { .. }
        ));
        match classify_status("openai", "d", 500, &"x".repeat(500)) {
            ProviderFailure::UpstreamStatus { status, detail, .. } => {
                assert_eq!(status, 500);
                assert_eq!(detail.len(), 200);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
