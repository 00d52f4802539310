//! Streaming accumulation and post-stream token fallback.

use conduit_common::tokens::count_tokens;
use conduit_protocol::openai::{ChatCompletionChunk, ChatMessage};

/// Running state across streamed chunks; inspected after the stream closes
/// to compute final token counts, cost, and the request log row.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub finish_reason: Option<String>,
    pub chunks_sent: u64,
    assembled: String,
}

impl StreamAccumulator {
    pub fn observe(&mut self, chunk: &ChatCompletionChunk) {
        self.chunks_sent += 1;
        if let Some(content) = chunk.delta_content() {
            self.assembled.push_str(content);
        }
        if let Some(finish_reason) = chunk.finish_reason() {
            self.finish_reason = Some(finish_reason.to_string());
        }
        if let Some(usage) = &chunk.usage {
            if usage.prompt_tokens > 0 {
                self.prompt_tokens = usage.prompt_tokens;
            }
            if usage.completion_tokens > 0 {
                self.completion_tokens = usage.completion_tokens;
            }
        }
    }

    pub fn assembled_content(&self) -> &str {
        &self.assembled
    }

    /// Fill any token counts the provider did not report, using the local
    /// tokenizer over the request messages and the assembled text.
    pub fn finalize_tokens(&mut self, messages: &[ChatMessage], model: &str) {
        if self.prompt_tokens == 0 {
            self.prompt_tokens = count_message_tokens(messages, model);
        }
        if self.completion_tokens == 0 && !self.assembled.is_empty() {
            self.completion_tokens = count_tokens(&self.assembled, model) as i64;
        }
    }

    pub fn total_tokens(&self) -> i64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Message token estimate using the OpenAI counting convention: four tokens
/// of overhead per message plus two for reply priming.
pub fn count_message_tokens(messages: &[ChatMessage], model: &str) -> i64 {
    let mut tokens = 2i64;
    for message in messages {
        tokens += 4;
        for fragment in message.text_fragments() {
            tokens += count_tokens(fragment, model) as i64;
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_protocol::openai::{Delta, Usage};

    fn content_chunk(text: &str) -> ChatCompletionChunk {
        ChatCompletionChunk::new("c", 0, "m").with_delta(Delta::content_only(text), None)
    }

    #[test]
    fn assembles_content_in_order() {
        let mut accumulator = StreamAccumulator::default();
        accumulator.observe(
            &ChatCompletionChunk::new("c", 0, "m").with_delta(Delta::role_only("assistant"), None),
        );
        accumulator.observe(&content_chunk("Hello"));
        accumulator.observe(&content_chunk("!"));
        let terminal = ChatCompletionChunk {
            usage: Some(Usage::new(9, 2)),
            ..ChatCompletionChunk::new("c", 0, "m")
        }
        .with_delta(Delta::default(), Some("stop".into()));
        accumulator.observe(&terminal);

        assert_eq!(accumulator.assembled_content(), "Hello!");
        assert_eq!(accumulator.chunks_sent, 4);
        assert_eq!(accumulator.finish_reason.as_deref(), Some("stop"));
        assert_eq!(accumulator.prompt_tokens, 9);
        assert_eq!(accumulator.completion_tokens, 2);
        assert_eq!(accumulator.total_tokens(), 11);
    }

    #[test]
    fn finalize_fills_missing_counts_from_tokenizer() {
        let mut accumulator = StreamAccumulator::default();
        accumulator.observe(&content_chunk("The capital of France is Paris."));
        accumulator.finalize_tokens(&[ChatMessage::user("capital of France?")], "gpt-4o");
        assert!(accumulator.prompt_tokens > 0);
        assert!(accumulator.completion_tokens > 0);
    }

    #[test]
    fn finalize_keeps_provider_counts() {
        let mut accumulator = StreamAccumulator::default();
        let terminal = ChatCompletionChunk {
            usage: Some(Usage::new(100, 50)),
            ..ChatCompletionChunk::new("c", 0, "m")
        }
        .with_delta(Delta::default(), Some("stop".into()));
        accumulator.observe(&terminal);
        accumulator.finalize_tokens(&[ChatMessage::user("q")], "gpt-4o");
        assert_eq!(accumulator.prompt_tokens, 100);
        assert_eq!(accumulator.completion_tokens, 50);
    }

    #[test]
    fn message_overhead_convention() {
        let messages = vec![ChatMessage::user("a"), ChatMessage::assistant("b")];
        let count = count_message_tokens(&messages, "gpt-4o");
        // 2 priming + 2 * 4 overhead + 2 content tokens.
        assert!(count >= 12);
    }
}
