//! Google Gemini adapter (AI Studio dialect).
//!
//! Divergences handled here: the URL embeds model and API key, roles map
//! `assistant -> model` and `tool -> user`, system messages become
//! `systemInstruction`, generation parameters nest under
//! `generationConfig`, and response function-call parts are lifted into
//! OpenAI `tool_calls`.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use tokio_stream::wrappers::ReceiverStream;

use conduit_protocol::gemini::{
    Candidate, Content, FileData, FunctionDeclaration, FunctionResponsePart, GenerateContentBody,
    GenerateContentResponse, GenerationConfig, InlineData, Part, SystemInstruction,
    ToolDeclarations,
};
use conduit_protocol::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice,
    ContentPart, Delta, FunctionCall, MessageContent, MessageRole, ToolCall, ToolDefinition,
    Usage,
};

use crate::client::{open_sse, send_json};
use crate::{
    ChunkStream, ProviderAdapter, ProviderFailure, TransformedRequest, UpstreamTarget,
    completion_id, unix_now,
};

const PROVIDER: &str = "google";
const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Default)]
pub struct GoogleAdapter;

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn transform_request(
        &self,
        request: &ChatCompletionRequest,
        target: &UpstreamTarget,
        stream: bool,
    ) -> TransformedRequest {
        let mut base = target.api_base.trim_end_matches('/');
        if base.is_empty() {
            base = DEFAULT_API_BASE;
        }
        let url = if stream {
            format!(
                "{base}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
                target.model, target.api_key
            )
        } else {
            format!(
                "{base}/v1beta/models/{}:generateContent?key={}",
                target.model, target.api_key
            )
        };
        let headers = vec![("content-type", "application/json".to_string())];

        let mut system_instruction: Option<SystemInstruction> = None;
        let mut contents: Vec<Content> = Vec::new();
        for message in &request.messages {
            if message.role == MessageRole::System {
                system_instruction = Some(SystemInstruction {
                    parts: vec![Part::text(message.flat_text())],
                });
            } else {
                contents.push(Content {
                    role: Some(map_role(message.role).to_string()),
                    parts: make_parts(message),
                });
            }
        }

        let generation_config = GenerationConfig {
            temperature: request.temperature,
            top_p: request.top_p,
            max_output_tokens: request.max_tokens,
            stop_sequences: request.stop.clone().map(|stop| stop.into_vec()),
            response_mime_type: request
                .response_format
                .as_ref()
                .filter(|format| format.kind == "json_object")
                .map(|_| "application/json".to_string()),
        };

        let body = GenerateContentBody {
            contents,
            system_instruction,
            generation_config: (!generation_config.is_empty()).then_some(generation_config),
            tools: request.tools.as_ref().map(|tools| {
                vec![ToolDeclarations {
                    function_declarations: tools.iter().map(map_tool).collect(),
                }]
            }),
        };

        TransformedRequest {
            url,
            headers,
            body: serde_json::to_value(&body).unwrap_or_else(|_| JsonValue::Null),
        }
    }

    async fn send(
        &self,
        request: &ChatCompletionRequest,
        target: &UpstreamTarget,
    ) -> Result<ChatCompletionResponse, ProviderFailure> {
        let transformed = self.transform_request(request, target, false);
        let raw = send_json(PROVIDER, &target.deployment_name, &transformed).await?;
        let response: GenerateContentResponse =
            serde_json::from_value(raw).map_err(|err| ProviderFailure::Decode {
                provider: PROVIDER,
                deployment: target.deployment_name.clone(),
                message: err.to_string(),
            })?;
        Ok(map_response(response, &request.model))
    }

    async fn stream(
        &self,
        request: &ChatCompletionRequest,
        target: &UpstreamTarget,
    ) -> Result<ChunkStream, ProviderFailure> {
        let transformed = self.transform_request(request, target, true);
        let mut events = open_sse(PROVIDER, &target.deployment_name, &transformed).await?;

        let model = request.model.clone();
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<ChatCompletionChunk, ProviderFailure>>(32);
        tokio::spawn(async move {
            let chunk_id = completion_id();
            let created = unix_now();
            let mut is_first = true;
            let mut prompt_tokens = 0i64;
            let mut completion_tokens = 0i64;

            while let Some(event) = events.next().await {
                let Ok(payload) = serde_json::from_str::<GenerateContentResponse>(&event.data)
                else {
                    continue;
                };
                if let Some(usage) = payload.usage_metadata {
                    prompt_tokens = usage.prompt_token_count;
                    completion_tokens = usage.candidates_token_count;
                }
                let Some(candidate) = payload.candidates.first() else {
                    continue;
                };

                let text: String = candidate
                    .content
                    .iter()
                    .flat_map(|content| content.parts.iter())
                    .filter_map(|part| part.text.as_deref())
                    .collect();

                let finish_reason = candidate
                    .finish_reason
                    .as_deref()
                    .filter(|reason| *reason != "FINISH_REASON_UNSPECIFIED")
                    .map(|reason| map_finish_reason(Some(reason)).to_string());

                let mut delta = Delta::default();
                if is_first {
                    delta.role = Some("assistant".into());
                    is_first = false;
                }
                if !text.is_empty() {
                    delta.content = Some(text);
                }

                let chunk = ChatCompletionChunk {
                    usage: finish_reason
                        .is_some()
                        .then(|| Usage::new(prompt_tokens, completion_tokens)),
                    ..ChatCompletionChunk::new(&chunk_id, created, &model)
                }
                .with_delta(delta, finish_reason);

                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

fn map_role(role: MessageRole) -> &'static str {
    match role {
        MessageRole::Assistant => "model",
        // Tool results come from the user side in Gemini.
        MessageRole::User | MessageRole::Tool | MessageRole::System => "user",
    }
}

fn make_parts(message: &ChatMessage) -> Vec<Part> {
    if message.role == MessageRole::Tool {
        let name = message
            .name
            .clone()
            .or_else(|| message.tool_call_id.clone())
            .unwrap_or_default();
        return vec![Part {
            function_response: Some(FunctionResponsePart {
                name,
                response: serde_json::json!({ "result": message.flat_text() }),
            }),
            ..Part::default()
        }];
    }

    match &message.content {
        Some(MessageContent::Text(text)) => vec![Part::text(text.clone())],
        Some(MessageContent::Parts(parts)) => {
            let mapped: Vec<Part> = parts.iter().map(map_content_part).collect();
            if mapped.is_empty() {
                vec![Part::text("")]
            } else {
                mapped
            }
        }
        None => vec![Part::text("")],
    }
}

fn map_content_part(part: &ContentPart) -> Part {
    match part {
        ContentPart::Text { text } => Part::text(text.clone()),
        ContentPart::ImageUrl { image_url } => {
            let url = &image_url.url;
            if let Some(rest) = url.strip_prefix("data:")
                && let Some((meta, data)) = rest.split_once(',')
            {
                Part {
                    inline_data: Some(InlineData {
                        mime_type: meta.replace(";base64", ""),
                        data: data.to_string(),
                    }),
                    ..Part::default()
                }
            } else {
                Part {
                    file_data: Some(FileData {
                        file_uri: url.clone(),
                    }),
                    ..Part::default()
                }
            }
        }
    }
}

fn map_tool(tool: &ToolDefinition) -> FunctionDeclaration {
    FunctionDeclaration {
        name: tool.function.name.clone(),
        description: tool.function.description.clone(),
        parameters: tool.function.parameters.clone(),
    }
}

fn map_response(response: GenerateContentResponse, model: &str) -> ChatCompletionResponse {
    let choices = response
        .candidates
        .iter()
        .enumerate()
        .map(|(index, candidate)| map_candidate(index as i64, candidate))
        .collect();

    let usage = response.usage_metadata.unwrap_or_default();
    ChatCompletionResponse {
        id: completion_id(),
        object: ChatCompletionResponse::OBJECT.into(),
        created: unix_now(),
        model: model.to_string(),
        choices,
        usage: Usage::new(usage.prompt_token_count, usage.candidates_token_count),
    }
}

fn map_candidate(index: i64, candidate: &Candidate) -> Choice {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    for part in candidate.content.iter().flat_map(|content| content.parts.iter()) {
        if let Some(text) = &part.text {
            text_parts.push(text);
        }
        if let Some(call) = &part.function_call {
            let hex = uuid::Uuid::new_v4().simple().to_string();
            tool_calls.push(ToolCall {
                id: format!("call_{}", &hex[..24]),
                kind: "function".into(),
                function: FunctionCall {
                    name: call.name.clone(),
                    arguments: call.args.to_string(),
                },
            });
        }
    }

    Choice {
        index,
        message: ChatMessage {
            role: MessageRole::Assistant,
            content: (!text_parts.is_empty())
                .then(|| MessageContent::Text(text_parts.join("\n"))),
            name: None,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
        },
        finish_reason: Some(map_finish_reason(candidate.finish_reason.as_deref()).to_string()),
    }
}

fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("MAX_TOKENS") => "length",
        Some("SAFETY") | Some("RECITATION") => "content_filter",
        // STOP, OTHER, and anything unexpected.
        _ => "stop",
    }
}
