use serde::{Deserialize, Serialize};

use crate::openai::response::Usage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: String,
    /// Always `"chat.completion.chunk"`.
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatCompletionChunk {
    pub const OBJECT: &'static str = "chat.completion.chunk";

    pub fn new(id: impl Into<String>, created: i64, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: Self::OBJECT.to_string(),
            created,
            model: model.into(),
            choices: Vec::new(),
            usage: None,
        }
    }

    pub fn with_delta(mut self, delta: Delta, finish_reason: Option<String>) -> Self {
        self.choices.push(StreamChoice {
            index: 0,
            delta,
            finish_reason,
        });
        self
    }

    pub fn delta_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.delta.content.as_deref())
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.finish_reason.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub index: i64,
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl Delta {
    pub fn role_only(role: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
            content: None,
        }
    }

    pub fn content_only(content: impl Into<String>) -> Self {
        Self {
            role: None,
            content: Some(content.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_accessors() {
        let chunk = ChatCompletionChunk::new("chatcmpl-1", 7, "m")
            .with_delta(Delta::content_only("hi"), None);
        assert_eq!(chunk.delta_content(), Some("hi"));
        assert_eq!(chunk.finish_reason(), None);
    }

    #[test]
    fn terminal_chunk_serializes_usage() {
        let chunk = ChatCompletionChunk {
            usage: Some(Usage::new(1, 2)),
            ..ChatCompletionChunk::new("c", 0, "m")
        }
        .with_delta(Delta::default(), Some("stop".into()));
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["usage"]["total_tokens"], 3);
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        // An empty delta renders as an empty object, not null.
        assert_eq!(json["choices"][0]["delta"], serde_json::json!({}));
    }
}
