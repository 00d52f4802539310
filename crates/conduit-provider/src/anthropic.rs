//! Anthropic Messages adapter.
//!
//! Divergences handled here: system messages move to a top-level field,
//! conversation roles must alternate (consecutive same-role messages are
//! merged), tool calls become `tool_use` content blocks, tool results become
//! a `user` message with a `tool_result` block, and streaming is a typed
//! event sequence instead of bare chunks.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use tokio_stream::wrappers::ReceiverStream;

use conduit_protocol::anthropic::{
    ANTHROPIC_VERSION, BlockDelta, ContentBlock, DEFAULT_MAX_TOKENS, ImageSource, MessageParam,
    MessageParamContent, MessagesRequestBody, MessagesResponse, StreamEvent, Tool,
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

const PROVIDER: &str = "anthropic";

#[derive(Debug, Default)]
pub struct AnthropicAdapter;

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn transform_request(
        &self,
        request: &ChatCompletionRequest,
        target: &UpstreamTarget,
        stream: bool,
    ) -> TransformedRequest {
        let url = format!("{}/v1/messages", target.api_base.trim_end_matches('/'));
        let headers = vec![
            ("x-api-key", target.api_key.clone()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
            ("content-type", "application/json".to_string()),
        ];

        let mut system_texts: Vec<String> = Vec::new();
        let mut messages: Vec<MessageParam> = Vec::new();
        for message in &request.messages {
            if message.role == MessageRole::System {
                let text = message.text_fragments().join(" ");
                if !text.is_empty() {
                    system_texts.push(text);
                }
            } else {
                messages.push(map_message(message));
            }
        }
        let messages = merge_consecutive_roles(messages);

        let body = MessagesRequestBody {
            model: target.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: (!system_texts.is_empty()).then(|| system_texts.join("\n")),
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop.clone().map(|stop| stop.into_vec()),
            stream: stream.then_some(true),
            tools: request.tools.as_ref().map(|tools| {
                tools.iter().map(map_tool).collect()
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
        let response: MessagesResponse =
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
            let mut chunk_id = completion_id();
            let created = unix_now();
            let mut input_tokens = 0i64;

            while let Some(event) = events.next().await {
                let Ok(event) = serde_json::from_str::<StreamEvent>(&event.data) else {
                    continue;
                };
                let chunk = match event {
                    StreamEvent::MessageStart { message } => {
                        chunk_id = format!("chatcmpl-{}", message.id);
                        input_tokens = message.usage.input_tokens;
                        ChatCompletionChunk::new(&chunk_id, created, &model).with_delta(
                            Delta {
                                role: Some("assistant".into()),
                                content: Some(String::new()),
                            },
                            None,
                        )
                    }
                    StreamEvent::ContentBlockDelta {
                        delta: BlockDelta::TextDelta { text },
                        ..
                    } => ChatCompletionChunk::new(&chunk_id, created, &model)
                        .with_delta(Delta::content_only(text), None),
                    StreamEvent::MessageDelta { delta, usage } => {
                        let output_tokens = usage.map(|usage| usage.output_tokens).unwrap_or(0);
                        ChatCompletionChunk {
                            usage: Some(Usage::new(input_tokens, output_tokens)),
                            ..ChatCompletionChunk::new(&chunk_id, created, &model)
                        }
                        .with_delta(
                            Delta::default(),
                            Some(map_stop_reason(delta.stop_reason.as_deref()).to_string()),
                        )
                    }
                    StreamEvent::MessageStop => break,
                    _ => continue,
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

fn map_message(message: &ChatMessage) -> MessageParam {
    if message.role == MessageRole::Tool {
        return MessageParam {
            role: "user".into(),
            content: MessageParamContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                content: message.flat_text(),
            }]),
        };
    }

    let mut content = match &message.content {
        Some(MessageContent::Text(text)) => MessageParamContent::Text(text.clone()),
        Some(MessageContent::Parts(parts)) => {
            MessageParamContent::Blocks(parts.iter().filter_map(map_content_part).collect())
        }
        None => MessageParamContent::Text(String::new()),
    };

    // Assistant tool calls re-encode as tool_use blocks after any text.
    if let Some(tool_calls) = &message.tool_calls
        && !tool_calls.is_empty()
    {
        let mut blocks = match content {
            MessageParamContent::Text(text) if !text.is_empty() => {
                vec![ContentBlock::Text { text }]
            }
            MessageParamContent::Text(_) => Vec::new(),
            MessageParamContent::Blocks(blocks) => blocks,
        };
        for call in tool_calls {
            blocks.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.function.name.clone(),
                input: serde_json::from_str(&call.function.arguments)
                    .unwrap_or_else(|_| JsonValue::Object(Default::default())),
            });
        }
        content = MessageParamContent::Blocks(blocks);
    }

    MessageParam {
        role: message.role.as_str().to_string(),
        content,
    }
}

fn map_content_part(part: &ContentPart) -> Option<ContentBlock> {
    match part {
        ContentPart::Text { text } => Some(ContentBlock::Text { text: text.clone() }),
        ContentPart::ImageUrl { image_url } => {
            let url = &image_url.url;
            if let Some(rest) = url.strip_prefix("data:") {
                let (meta, data) = rest.split_once(',')?;
                Some(ContentBlock::Image {
                    source: ImageSource::base64(meta.replace(";base64", ""), data),
                })
            } else {
                Some(ContentBlock::Image {
                    source: ImageSource::url(url),
                })
            }
        }
    }
}

fn map_tool(tool: &ToolDefinition) -> Tool {
    Tool {
        name: tool.function.name.clone(),
        description: tool.function.description.clone(),
        input_schema: tool
            .function
            .parameters
            .clone()
            .unwrap_or_else(|| JsonValue::Object(Default::default())),
    }
}

/// Anthropic requires alternating user/assistant roles; consecutive
/// same-role messages merge into one.
fn merge_consecutive_roles(messages: Vec<MessageParam>) -> Vec<MessageParam> {
    let mut merged: Vec<MessageParam> = Vec::with_capacity(messages.len());
    for message in messages {
        match merged.last_mut() {
            Some(last) if last.role == message.role => {
                last.content = merge_content(
                    std::mem::replace(&mut last.content, MessageParamContent::Text(String::new())),
                    message.content,
                );
            }
            _ => merged.push(message),
        }
    }
    merged
}

fn merge_content(
    previous: MessageParamContent,
    next: MessageParamContent,
) -> MessageParamContent {
    use MessageParamContent::{Blocks, Text};
    match (previous, next) {
        (Text(a), Text(b)) => Text(format!("{a}\n{b}")),
        (Blocks(mut a), Blocks(b)) => {
            a.extend(b);
            Blocks(a)
        }
        (Text(a), Blocks(b)) => {
            let mut blocks = vec![ContentBlock::Text { text: a }];
            blocks.extend(b);
            Blocks(blocks)
        }
        (Blocks(mut a), Text(b)) => {
            a.push(ContentBlock::Text { text: b });
            Blocks(a)
        }
    }
}

fn map_response(response: MessagesResponse, model: &str) -> ChatCompletionResponse {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    for block in response.content {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                kind: "function".into(),
                function: FunctionCall {
                    name,
                    arguments: input.to_string(),
                },
            }),
            _ => {}
        }
    }

    let message = ChatMessage {
        role: MessageRole::Assistant,
        content: (!text_parts.is_empty()).then(|| MessageContent::Text(text_parts.join("\n"))),
        name: None,
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
    };

    ChatCompletionResponse {
        id: format!("chatcmpl-{}", response.id),
        object: ChatCompletionResponse::OBJECT.into(),
        created: unix_now(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason: Some(map_stop_reason(response.stop_reason.as_deref()).to_string()),
        }],
        usage: Usage::new(response.usage.input_tokens, response.usage.output_tokens),
    }
}

fn map_stop_reason(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        // end_turn, stop_sequence, and anything unexpected.
        _ => "stop",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_protocol::openai::{FunctionDefinition, ImageUrl, StopSequences};

    fn request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "claude-sonnet".into(),
            messages,
            temperature: Some(0.5),
            top_p: None,
            n: None,
            stream: None,
            stop: Some(StopSequences::Single("END".into())),
            max_tokens: None,
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
            deployment_name: "claude-primary".into(),
            model: "claude-sonnet-4-20250514".into(),
            api_base: "https://api.anthropic.com".into(),
            api_key: "sk-ant-test".into(),
        }
    }

    #[test]
    fn system_messages_lift_to_top_level_field() {
        let transformed = AnthropicAdapter.transform_request(
            &request(vec![
                ChatMessage::system("be terse"),
                ChatMessage::user("hello"),
            ]),
            &target(),
            false,
        );
        assert_eq!(transformed.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(transformed.body["system"], "be terse");
        assert_eq!(transformed.body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(transformed.body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(transformed.body["stop_sequences"][0], "END");
        assert!(
            transformed
                .headers
                .iter()
                .any(|(name, value)| *name == "x-api-key" && value == "sk-ant-test")
        );
    }

    #[test]
    fn consecutive_same_role_messages_merge() {
        let transformed = AnthropicAdapter.transform_request(
            &request(vec![ChatMessage::user("first"), ChatMessage::user("second")]),
            &target(),
            false,
        );
        let messages = transformed.body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["content"], "first\nsecond");
    }

    #[test]
    fn merge_promotes_string_to_text_block_when_mixed() {
        let merged = merge_content(
            MessageParamContent::Text("plain".into()),
            MessageParamContent::Blocks(vec![ContentBlock::Text { text: "block".into() }]),
        );
        match merged {
            MessageParamContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert!(matches!(&blocks[0], ContentBlock::Text { text } if text == "plain"));
            }
            other => panic!("unexpected merge result: {other:?}"),
        }
    }

    #[test]
    fn tool_messages_become_tool_result_user_turns() {
        let tool_message = ChatMessage {
            role: MessageRole::Tool,
            content: Some(MessageContent::Text("42".into())),
            name: None,
            tool_calls: None,
            tool_call_id: Some("tu_1".into()),
        };
        let param = map_message(&tool_message);
        assert_eq!(param.role, "user");
        match param.content {
            MessageParamContent::Blocks(blocks) => {
                assert!(matches!(
                    &blocks[0],
                    ContentBlock::ToolResult { tool_use_id, content }
                        if tool_use_id == "tu_1" && content == "42"
                ));
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn assistant_tool_calls_become_tool_use_blocks() {
        let assistant = ChatMessage {
            role: MessageRole::Assistant,
            content: Some(MessageContent::Text("thinking".into())),
            name: None,
            tool_calls: Some(vec![ToolCall {
                id: "call_1".into(),
                kind: "function".into(),
                function: FunctionCall {
                    name: "lookup".into(),
                    arguments: r#"{"city":"Paris"}"#.into(),
                },
            }]),
            tool_call_id: None,
        };
        let param = map_message(&assistant);
        match param.content {
            MessageParamContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert!(matches!(
                    &blocks[1],
                    ContentBlock::ToolUse { name, input, .. }
                        if name == "lookup" && input["city"] == "Paris"
                ));
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn data_uri_images_become_base64_sources() {
        let part = ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: "data:image/png;base64,AAAA".into(),
                detail: None,
            },
        };
        match map_content_part(&part).unwrap() {
            ContentBlock::Image { source } => {
                assert_eq!(source.kind, "base64");
                assert_eq!(source.media_type.as_deref(), Some("image/png"));
                assert_eq!(source.data.as_deref(), Some("AAAA"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn tools_map_to_input_schema() {
        let tool = ToolDefinition {
            kind: "function".into(),
            function: FunctionDefinition {
                name: "lookup".into(),
                description: Some("find things".into()),
                parameters: Some(serde_json::json!({"type": "object"})),
            },
        };
        let mapped = map_tool(&tool);
        assert_eq!(mapped.name, "lookup");
        assert_eq!(mapped.input_schema["type"], "object");
    }

    #[test]
    fn stop_reason_mapping_is_total() {
        assert_eq!(map_stop_reason(Some("end_turn")), "stop");
        assert_eq!(map_stop_reason(Some("stop_sequence")), "stop");
        assert_eq!(map_stop_reason(Some("max_tokens")), "length");
        assert_eq!(map_stop_reason(Some("tool_use")), "tool_calls");
        assert_eq!(map_stop_reason(None), "stop");
        assert_eq!(map_stop_reason(Some("anything-new")), "stop");
    }

    #[test]
    fn response_round_trips_tool_use() {
        let response: MessagesResponse = serde_json::from_str(
            r#"{
              "id": "msg_1",
              "content": [
                {"type": "text", "text": "Looking that up."},
                {"type": "tool_use", "id": "tu_9", "name": "lookup", "input": {"q": "x"}}
              ],
              "stop_reason": "tool_use",
              "usage": {"input_tokens": 11, "output_tokens": 7}
            }"#,
        )
        .unwrap();
        let mapped = map_response(response, "claude-sonnet");
        assert_eq!(mapped.id, "chatcmpl-msg_1");
        let choice = &mapped.choices[0];
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        let calls = choice.message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "lookup");
        assert_eq!(
            serde_json::from_str::<JsonValue>(&calls[0].function.arguments).unwrap()["q"],
            "x"
        );
        assert_eq!(mapped.usage.total_tokens, 18);
    }
}
