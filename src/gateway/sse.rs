//! SSE (Server-Sent Events) stream decoder for the upstream gateway.
//!
//! Handles the `data: ` prefix, `[DONE]` termination, line buffering across
//! TCP chunk boundaries, empty keep-alive lines, and comment lines.
//! Malformed JSON payload lines are tolerated and skipped.

use serde_json::Value;

/// Incremental decoder for `data: {...}` event streams.
///
/// # Example
///
/// ```
/// use llm_council::gateway::sse::SseDecoder;
///
/// let mut decoder = SseDecoder::new();
/// let data = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\ndata: [DONE]\n\n";
/// let values = decoder.decode(data);
/// assert_eq!(values.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes into the decoder and return any complete JSON payloads.
    ///
    /// `data:` lines that are empty, comments (`:` prefix), the `[DONE]`
    /// terminator, or unparseable JSON produce nothing.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Value> {
        let text = String::from_utf8_lossy(chunk);
        self.buffer.push_str(&text);

        let mut values = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(value) = Self::parse_line(line.trim()) {
                values.push(value);
            }
        }

        values
    }

    /// Flush any remaining buffered content (stream ended without newline).
    pub fn flush(&mut self) -> Vec<Value> {
        let remaining = std::mem::take(&mut self.buffer);
        remaining
            .lines()
            .filter_map(|line| Self::parse_line(line.trim()))
            .collect()
    }

    fn parse_line(line: &str) -> Option<Value> {
        if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
            return None;
        }

        let data = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))?
            .trim();

        if data == "[DONE]" {
            return None;
        }

        serde_json::from_str(data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_decode() {
        let mut decoder = SseDecoder::new();
        let chunk = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n";
        let values = decoder.decode(chunk);
        assert_eq!(values.len(), 1);
        assert!(values[0]["choices"][0]["delta"]["content"].as_str().is_some());
    }

    #[test]
    fn test_done_ignored() {
        let mut decoder = SseDecoder::new();
        let chunk = b"data: {\"x\":1}\n\ndata: [DONE]\n\n";
        assert_eq!(decoder.decode(chunk).len(), 1);
    }

    #[test]
    fn test_empty_and_comment_lines_ignored() {
        let mut decoder = SseDecoder::new();
        let chunk = b"\n\n: keep-alive\ndata: {\"x\":1}\n\n";
        let values = decoder.decode(chunk);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["x"], 1);
    }

    #[test]
    fn test_malformed_json_skipped() {
        let mut decoder = SseDecoder::new();
        let chunk = b"data: {not json}\ndata: {\"ok\":true}\n";
        let values = decoder.decode(chunk);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["ok"], true);
    }

    #[test]
    fn test_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode(b"data: {\"cho").is_empty());
        let values = decoder.decode(b"ices\":[]}\n\n");
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn test_multiple_events_one_chunk() {
        let mut decoder = SseDecoder::new();
        let chunk = b"data: {\"a\":1}\n\ndata: {\"a\":2}\n\ndata: {\"a\":3}\n\ndata: [DONE]\n\n";
        assert_eq!(decoder.decode(chunk).len(), 3);
    }

    #[test]
    fn test_flush_handles_trailing_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode(b"data: {\"a\":1}").is_empty());
        let values = decoder.flush();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["a"], 1);
    }
}
