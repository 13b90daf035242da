use serde_json::Value;

use crate::format::events::DONE_MARKER;

/// Longest line held while waiting for its terminator. Longer lines are dropped.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental splitter for a newline-delimited byte stream.
///
/// Chunks arrive at arbitrary boundaries, including inside a multi-byte character.
/// Bytes are held until a `\n` completes the line, so only whole lines are decoded.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    /// Set after an oversized fragment was dropped; skips up to the next newline
    discarding: bool,
    oversized: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            ..Default::default()
        }
    }

    /// Feed a chunk and get every line it completes, without terminators.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }

            self.buffer.extend_from_slice(head);
            lines.push(self.take_line());
        }

        if !self.discarding {
            self.buffer.extend_from_slice(rest);
            if self.buffer.len() > MAX_LINE_BYTES {
                tracing::warn!(
                    buffered = self.buffer.len(),
                    max = MAX_LINE_BYTES,
                    "Dropping oversized upstream line"
                );
                self.buffer.clear();
                self.discarding = true;
                self.oversized += 1;
            }
        }

        lines
    }

    /// Return the unterminated trailing fragment, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.discarding || self.buffer.is_empty() {
            self.buffer.clear();
            return None;
        }
        Some(self.take_line())
    }

    /// Bytes held for an incomplete line.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Lines dropped for exceeding [`MAX_LINE_BYTES`].
    pub fn oversized(&self) -> usize {
        self.oversized
    }

    fn take_line(&mut self) -> String {
        if self.buffer.last() == Some(&b'\r') {
            self.buffer.pop();
        }
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        line
    }
}

/// Why a line produced no outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Blank line, comment, or a non-`data` field
    NotData,
    /// `data` payload that is not valid JSON
    Malformed,
    /// Valid JSON without a non-empty text delta
    NoDelta,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotData => "not_data",
            SkipReason::Malformed => "malformed",
            SkipReason::NoDelta => "no_delta",
        }
    }
}

/// One classified upstream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Done,
    /// Valid JSON the relay does not understand; carries the payload unchanged
    Unrecognized(String),
    /// Error object reported inside the stream
    Error(String),
    Skip(SkipReason),
}

/// Classify one complete line of the upstream event stream.
pub fn classify_line(line: &str) -> StreamEvent {
    let data = if let Some(stripped) = line.strip_prefix("data: ") {
        stripped
    } else if let Some(stripped) = line.strip_prefix("data:") {
        stripped
    } else {
        return StreamEvent::Skip(SkipReason::NotData);
    };

    let data = data.trim();
    if data.is_empty() {
        return StreamEvent::Skip(SkipReason::NotData);
    }

    // Checked before any JSON parsing
    if data == DONE_MARKER {
        return StreamEvent::Done;
    }

    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => {
            tracing::debug!(
                data = %data.chars().take(200).collect::<String>(),
                "Skipping unparseable upstream line"
            );
            return StreamEvent::Skip(SkipReason::Malformed);
        }
    };

    if let Some(text) = extract_delta(&value) {
        return StreamEvent::Delta(text.to_string());
    }

    // e.g. {"error": {"message": "...", "type": "server_error"}}
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return StreamEvent::Error(message);
    }

    if value.is_object() {
        StreamEvent::Unrecognized(data.to_string())
    } else {
        StreamEvent::Skip(SkipReason::NoDelta)
    }
}

/// Text delta from `choices[0].delta.content`, or the flat `{"delta": "..."}` shape.
pub fn extract_delta(value: &Value) -> Option<&str> {
    value
        .pointer("/choices/0/delta/content")
        .and_then(non_empty_str)
        .or_else(|| value.get("delta").and_then(non_empty_str))
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(decoder: &mut LineDecoder, chunks: &[&[u8]]) -> Vec<String> {
        chunks.iter().flat_map(|c| decoder.feed(c)).collect()
    }

    #[test]
    fn test_decoder_whole_lines() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.feed(b"data: a\n\ndata: b\n");
        assert_eq!(lines, vec!["data: a", "", "data: b"]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_holds_partial_line() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.feed(b"data: {\"delta\":").is_empty());
        assert_eq!(decoder.pending(), 15);
        let lines = decoder.feed(b"\"hi\"}\n");
        assert_eq!(lines, vec!["data: {\"delta\":\"hi\"}"]);
    }

    #[test]
    fn test_decoder_every_split_point() {
        let stream = "data: {\"delta\":\"book by [DATE_PLUS_7] now\"}\n\ndata: [DONE]\n\n";
        let bytes = stream.as_bytes();

        for split in 0..=bytes.len() {
            let mut decoder = LineDecoder::new();
            let mut lines = feed_all(&mut decoder, &[&bytes[..split], &bytes[split..]]);
            lines.extend(decoder.finish());
            assert_eq!(
                lines,
                vec![
                    "data: {\"delta\":\"book by [DATE_PLUS_7] now\"}",
                    "",
                    "data: [DONE]",
                    "",
                ],
                "split at {split}"
            );
        }
    }

    #[test]
    fn test_decoder_byte_at_a_time() {
        let stream = "data: one\r\ndata: two\r\n";
        let mut decoder = LineDecoder::new();
        let lines: Vec<String> = stream
            .as_bytes()
            .iter()
            .flat_map(|b| decoder.feed(std::slice::from_ref(b)))
            .collect();
        assert_eq!(lines, vec!["data: one", "data: two"]);
    }

    #[test]
    fn test_decoder_multibyte_split() {
        // "é" is 0xC3 0xA9; split between the two bytes
        let line = "data: {\"delta\":\"café\"}\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut decoder = LineDecoder::new();
        assert!(decoder.feed(&line[..split]).is_empty());
        let lines = decoder.feed(&line[split..]);
        assert_eq!(lines, vec!["data: {\"delta\":\"café\"}"]);
    }

    #[test]
    fn test_decoder_strips_crlf() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.feed(b"data: x\r\n\r\n");
        assert_eq!(lines, vec!["data: x", ""]);
    }

    #[test]
    fn test_decoder_finish_returns_leftover() {
        let mut decoder = LineDecoder::new();
        decoder.feed(b"data: [DONE]");
        assert_eq!(decoder.finish().as_deref(), Some("data: [DONE]"));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_decoder_drops_oversized_line() {
        let mut decoder = LineDecoder::new();
        let big = vec![b'x'; MAX_LINE_BYTES + 1];
        assert!(decoder.feed(&big).is_empty());
        assert_eq!(decoder.oversized(), 1);
        assert_eq!(decoder.pending(), 0);

        // Rest of the oversized line is skipped, the next line survives
        let lines = decoder.feed(b"xxxx\ndata: ok\n");
        assert_eq!(lines, vec!["data: ok"]);
    }

    #[test]
    fn test_classify_done() {
        assert_eq!(classify_line("data: [DONE]"), StreamEvent::Done);
        assert_eq!(classify_line("data:[DONE]"), StreamEvent::Done);
        assert_eq!(classify_line("data: [DONE]  "), StreamEvent::Done);
    }

    #[test]
    fn test_classify_openai_delta() {
        let line = r#"data: {"id":"c1","choices":[{"index":0,"delta":{"content":"Hello"}}]}"#;
        assert_eq!(classify_line(line), StreamEvent::Delta("Hello".to_string()));
    }

    #[test]
    fn test_classify_flat_delta() {
        assert_eq!(
            classify_line(r#"data: {"delta":"Hi there"}"#),
            StreamEvent::Delta("Hi there".to_string())
        );
    }

    #[test]
    fn test_classify_role_only_chunk_is_unrecognized() {
        let line = r#"data: {"choices":[{"index":0,"delta":{"role":"assistant","content":""}}]}"#;
        assert!(matches!(classify_line(line), StreamEvent::Unrecognized(_)));
    }

    #[test]
    fn test_classify_empty_nested_falls_back_to_flat() {
        let line = r#"data: {"choices":[{"delta":{"content":""}}],"delta":"flat"}"#;
        assert_eq!(classify_line(line), StreamEvent::Delta("flat".to_string()));
    }

    #[test]
    fn test_classify_non_string_delta() {
        let line = r#"data: {"delta":42}"#;
        assert!(matches!(classify_line(line), StreamEvent::Unrecognized(_)));
    }

    #[test]
    fn test_classify_malformed_json() {
        assert_eq!(
            classify_line("data: {not json"),
            StreamEvent::Skip(SkipReason::Malformed)
        );
    }

    #[test]
    fn test_classify_non_object_json() {
        assert_eq!(
            classify_line("data: 17"),
            StreamEvent::Skip(SkipReason::NoDelta)
        );
    }

    #[test]
    fn test_classify_not_data() {
        assert_eq!(classify_line(""), StreamEvent::Skip(SkipReason::NotData));
        assert_eq!(
            classify_line(": keep-alive"),
            StreamEvent::Skip(SkipReason::NotData)
        );
        assert_eq!(
            classify_line("event: message"),
            StreamEvent::Skip(SkipReason::NotData)
        );
        assert_eq!(classify_line("data:"), StreamEvent::Skip(SkipReason::NotData));
    }

    #[test]
    fn test_classify_error_object() {
        let line = r#"data: {"error":{"message":"The server had an error","type":"server_error"}}"#;
        assert_eq!(
            classify_line(line),
            StreamEvent::Error("The server had an error".to_string())
        );
    }

    #[test]
    fn test_delta_keeps_whitespace() {
        let line = r#"data: {"choices":[{"delta":{"content":"  spaced  "}}]}"#;
        assert_eq!(
            classify_line(line),
            StreamEvent::Delta("  spaced  ".to_string())
        );
    }
}
