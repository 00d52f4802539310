//! OpenAI adapter (also serves any OpenAI-compatible base URL, Azure
//! included). The request body is a near pass-through; only the model name
//! and stream flag are rewritten for the selected deployment.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use tokio_stream::wrappers::ReceiverStream;

use conduit_protocol::openai::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use conduit_protocol::sse::DONE_SENTINEL;

use crate::client::{open_sse, send_json};
use crate::{ChunkStream, ProviderAdapter, ProviderFailure, TransformedRequest, UpstreamTarget};

const PROVIDER: &str = "openai";

#[derive(Debug, Default)]
pub struct OpenAiAdapter;

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn transform_request(
        &self,
        request: &ChatCompletionRequest,
        target: &UpstreamTarget,
        stream: bool,
    ) -> TransformedRequest {
        let url = format!("{}/chat/completions", target.api_base.trim_end_matches('/'));
        let headers = vec![
            ("authorization", format!("Bearer {}", target.api_key)),
            ("content-type", "application/json".to_string()),
        ];

        // Optional fields were already pruned by serde; the upstream model
        // name replaces whatever alias the caller used.
        let mut body = serde_json::to_value(request).unwrap_or_else(|_| JsonValue::Null);
        body["model"] = JsonValue::from(target.model.clone());
        if stream {
            body["stream"] = JsonValue::Bool(true);
        } else if let Some(map) = body.as_object_mut() {
            map.remove("stream");
        }

        TransformedRequest { url, headers, body }
    }

    async fn send(
        &self,
        request: &ChatCompletionRequest,
        target: &UpstreamTarget,
    ) -> Result<ChatCompletionResponse, ProviderFailure> {
        let transformed = self.transform_request(request, target, false);
        let raw = send_json(PROVIDER, &target.deployment_name, &transformed).await?;
        let mut response: ChatCompletionResponse =
            serde_json::from_value(raw).map_err(|err| ProviderFailure::Decode {
                provider: PROVIDER,
                deployment: target.deployment_name.clone(),
                message: err.to_string(),
            })?;
        // Reflect the caller-facing model name, not the upstream alias, and
        // fill envelope fields lax upstreams omit.
        response.model = request.model.clone();
        if response.id.is_empty() {
            response.id = crate::completion_id();
        }
        if response.object.is_empty() {
            response.object = ChatCompletionResponse::OBJECT.to_string();
        }
        if response.created == 0 {
            response.created = crate::unix_now();
        }
        Ok(response)
    }

    async fn stream(
        &self,
        request: &ChatCompletionRequest,
        target: &UpstreamTarget,
    ) -> Result<ChunkStream, ProviderFailure> {
        let transformed = self.transform_request(request, target, true);
        let mut events = open_sse(PROVIDER, &target.deployment_name, &transformed).await?;

        let model = request.model.clone();
        let deployment = target.deployment_name.clone();
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<ChatCompletionChunk, ProviderFailure>>(32);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.data == DONE_SENTINEL {
                    break;
                }
                let mut chunk: ChatCompletionChunk = match serde_json::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        tracing::debug!(
                            deployment = %deployment,
                            error = %err,
                            "skipping undecodable stream chunk"
                        );
                        continue;
                    }
                };
                chunk.model = model.clone();
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_protocol::openai::ChatMessage;

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-5".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: Some(0.2),
            top_p: None,
            n: None,
            stream: None,
            stop: None,
            max_tokens: Some(64),
            presence_penalty: None,
            frequency_penalty: None,
            tools: None,
            tool_choice: None,
            response_format: None,
            seed: None,
            user: None,
        }
    }

    fn target() -> UpstreamTarget {
        UpstreamTarget {
            deployment_name: "primary".into(),
            model: "gpt-5-upstream".into(),
            api_base: "https://api.openai.com/v1/".into(),
            api_key: "sk-test".into(),
        }
    }

    #[test]
    fn transform_is_passthrough_with_model_rewrite() {
        let transformed = OpenAiAdapter.transform_request(&request(), &target(), false);
        assert_eq!(transformed.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(transformed.body["model"], "gpt-5-upstream");
        assert_eq!(transformed.body["temperature"], 0.2);
        assert_eq!(transformed.body["max_tokens"], 64);
        assert!(transformed.body.get("stream").is_none());
        assert!(transformed.body.get("tools").is_none());
        assert!(
            transformed
                .headers
                .iter()
                .any(|(name, value)| *name == "authorization" && value == "Bearer sk-test")
        );
    }

    #[test]
    fn transform_sets_stream_flag() {
        let transformed = OpenAiAdapter.transform_request(&request(), &target(), true);
        assert_eq!(transformed.body["stream"], true);
    }
}
