//! Server-sent events: an incremental parser for upstream byte streams and
//! the writer half used to frame downstream chunks.

use bytes::Bytes;

pub const DONE_SENTINEL: &str = "[DONE]";

/// A complete SSE event: optional `event:` name and joined `data:` payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub name: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data == DONE_SENTINEL
    }
}

/// Incremental SSE parser. Feed it raw upstream bytes as they arrive; it
/// emits events whenever a blank line completes one. Partial lines and
/// events survive across `feed` calls.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    pending_name: Option<String>,
    pending_data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        // Invalid UTF-8 mid-chunk is dropped rather than aborting the stream.
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        self.buffer.push_str(text);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let mut line = self.buffer[..newline].to_string();
            self.buffer.drain(..=newline);
            if line.ends_with('\r') {
                line.pop();
            }
            self.consume_line(&line, &mut events);
        }
        events
    }

    /// Flush whatever remains when the upstream closes without a final
    /// blank line.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            let line = line.strip_suffix('\r').unwrap_or(&line).to_string();
            self.consume_line(&line, &mut events);
        }
        self.flush_pending(&mut events);
        events
    }

    fn consume_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.flush_pending(events);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.pending_name = (!value.is_empty()).then(|| value.to_string());
            }
            "data" => self.pending_data.push(value.to_string()),
            _ => {}
        }
    }

    fn flush_pending(&mut self, events: &mut Vec<SseEvent>) {
        if self.pending_name.is_none() && self.pending_data.is_empty() {
            return;
        }
        events.push(SseEvent {
            name: self.pending_name.take(),
            data: std::mem::take(&mut self.pending_data).join("\n"),
        });
    }
}

/// Frame a serializable payload as a single `data: ...` SSE line.
pub fn data_frame<T: serde::Serialize>(payload: &T) -> Bytes {
    match serde_json::to_string(payload) {
        Ok(json) => Bytes::from(format!("data: {json}\n\n")),
        Err(_) => Bytes::new(),
    }
}

pub fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_events_across_chunk_boundaries() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {\"a\":").is_empty());
        let events = parser.feed(b"1}\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert!(events[1].is_done());
    }

    #[test]
    fn named_events_and_comments() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": keep-alive\nevent: message_start\ndata: {}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn multi_line_data_joins_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: first\ndata: second\n\n");
        assert_eq!(events[0].data, "first\nsecond");
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: tail").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn crlf_lines_are_handled() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: x\r\n\r\n");
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn frames_are_newline_terminated() {
        let frame = data_frame(&serde_json::json!({"k": "v"}));
        assert_eq!(&frame[..], b"data: {\"k\":\"v\"}\n\n");
        assert_eq!(&done_frame()[..], b"data: [DONE]\n\n");
    }
}
