use serde::{Deserialize, Serialize};

use crate::openai::types::ChatMessage;

/// Upstreams are not all strict about the envelope; missing fields
/// deserialize to defaults and the adapter fills in the gaps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: String,
    /// Always `"chat.completion"`.
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
}

impl ChatCompletionResponse {
    pub const OBJECT: &'static str = "chat.completion";

    /// Text of the first assistant choice, empty when the provider returned
    /// only tool calls.
    pub fn assistant_text(&self) -> String {
        self.choices
            .first()
            .map(|choice| choice.message.flat_text())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: i64,
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl Usage {
    pub fn new(prompt_tokens: i64, completion_tokens: i64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    /// Always `"list"`.
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    /// Always `"model"`.
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::types::{MessageContent, MessageRole};

    fn response_with(content: Option<MessageContent>) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: "chatcmpl-1".into(),
            object: ChatCompletionResponse::OBJECT.into(),
            created: 1,
            model: "m".into(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage {
                    role: MessageRole::Assistant,
                    content,
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                },
                finish_reason: Some("stop".into()),
            }],
            usage: Usage::new(3, 5),
        }
    }

    #[test]
    fn usage_totals() {
        assert_eq!(Usage::new(3, 5).total_tokens, 8);
    }

    #[test]
    fn assistant_text_handles_missing_content() {
        assert_eq!(response_with(None).assistant_text(), "");
        assert_eq!(
            response_with(Some(MessageContent::Text("hello".into()))).assistant_text(),
            "hello"
        );
    }
}
