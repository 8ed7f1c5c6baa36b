//! Streaming chat responses
//!
//! The server answers a streaming request with lines of the form
//! `data: <json>` separated by blank lines, terminated by `data: [DONE]`.

use std::collections::BTreeMap;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, StudioError};
use crate::types::{Message, Role, StreamingChunk, ToolCall, Usage};

/// Lazy, single-pass stream of decoded chunks
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamingChunk>> + Send>>;

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, PartialEq)]
pub(crate) enum SseLine {
    Chunk(StreamingChunk),
    Done,
    Skip,
}

/// Classify one line of the response body
pub(crate) fn parse_line(line: &str) -> SseLine {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:") else {
        // Blank separators, comments and `event:` lines carry nothing for us
        return SseLine::Skip;
    };

    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return SseLine::Done;
    }

    match serde_json::from_str::<StreamingChunk>(payload) {
        Ok(chunk) => SseLine::Chunk(chunk),
        Err(e) => {
            debug!(error = %e, payload_len = payload.len(), "Skipping malformed stream chunk");
            SseLine::Skip
        }
    }
}

/// Splits an incoming byte stream into complete lines
#[derive(Debug, Default)]
struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            lines.push(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        lines
    }

    /// Trailing bytes of a body that did not end with a newline
    fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = self.buf.split();
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Decode a response body into a stream of chunks
///
/// Ends on the sentinel or when the body closes. A read error is yielded once
/// and ends the stream.
pub(crate) fn decode_sse<S, E>(body: S) -> ChatStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut body = Box::pin(body);
        let mut lines = LineBuffer::default();

        while let Some(item) = body.next().await {
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(StudioError::Network(format!("Stream read failed: {}", e)));
                    return;
                }
            };

            for line in lines.push(&bytes) {
                match parse_line(&line) {
                    SseLine::Chunk(chunk) => yield Ok(chunk),
                    SseLine::Done => {
                        debug!("Stream finished with sentinel");
                        return;
                    }
                    SseLine::Skip => {}
                }
            }
        }

        if let Some(line) = lines.finish() {
            if let SseLine::Chunk(chunk) = parse_line(&line) {
                yield Ok(chunk);
            }
        }
    })
}

/// Stop yielding as soon as `cancel` fires; the inner stream (and its
/// connection) is dropped with the returned stream
pub fn with_cancellation(stream: ChatStream, cancel: CancellationToken) -> ChatStream {
    let cancelled = async move { cancel.cancelled().await };
    Box::pin(stream.take_until(cancelled))
}

/// Folds streaming chunks into a single assistant message
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    reasoning: String,
    tool_calls: BTreeMap<usize, ToolCall>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &StreamingChunk) {
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        let Some(choice) = chunk.choices.first() else {
            return;
        };

        if let Some(ref content) = choice.delta.content {
            self.content.push_str(content);
        }
        if let Some(ref reasoning) = choice.delta.reasoning {
            self.reasoning.push_str(reasoning);
        }
        for delta in choice.delta.tool_calls.iter().flatten() {
            let call = self
                .tool_calls
                .entry(delta.index)
                .or_insert_with(|| ToolCall::new(String::new(), String::new(), String::new()));

            if let Some(ref id) = delta.id {
                if !id.is_empty() {
                    call.id = id.clone();
                }
            }
            if let Some(ref function) = delta.function {
                if let Some(ref name) = function.name {
                    call.function.name.push_str(name);
                }
                if let Some(ref arguments) = function.arguments {
                    call.function.arguments.push_str(arguments);
                }
            }
        }
        if let Some(ref reason) = choice.finish_reason {
            self.finish_reason = Some(reason.clone());
        }
    }

    /// Content received so far
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn into_message(self) -> Message {
        let tool_calls: Vec<ToolCall> = self.tool_calls.into_values().collect();
        let content = if self.content.is_empty() && !tool_calls.is_empty() {
            None
        } else {
            Some(self.content)
        };

        Message {
            role: Role::Assistant,
            content,
            reasoning: (!self.reasoning.is_empty()).then_some(self.reasoning),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn body(parts: &[&str]) -> impl Stream<Item = std::result::Result<Bytes, std::io::Error>> {
        let parts: Vec<_> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        stream::iter(parts)
    }

    async fn collect(stream: ChatStream) -> Vec<Result<StreamingChunk>> {
        stream.collect().await
    }

    const CHUNK_A: &str = r#"{"id":"1","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"}}]}"#;
    const CHUNK_B: &str = r#"{"id":"1","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":"stop"}]}"#;

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line(""), SseLine::Skip);
        assert_eq!(parse_line(": keep-alive"), SseLine::Skip);
        assert_eq!(parse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_line("data: not-json"), SseLine::Skip);
        assert!(matches!(parse_line(&format!("data: {}", CHUNK_A)), SseLine::Chunk(_)));
        assert!(matches!(parse_line(&format!("data:{}\r", CHUNK_B)), SseLine::Chunk(_)));
    }

    #[tokio::test]
    async fn test_two_chunks_then_sentinel() {
        let text = format!("data: {}\n\ndata: {}\n\ndata: [DONE]\n", CHUNK_A, CHUNK_B);
        let chunks = collect(decode_sse(body(&[&text]))).await;

        assert_eq!(chunks.len(), 2);
        let first = chunks[0].as_ref().unwrap();
        assert_eq!(first.content(), Some("Hel"));
        assert_eq!(chunks[1].as_ref().unwrap().finish_reason(), Some("stop"));
    }

    #[tokio::test]
    async fn test_malformed_line_is_skipped() {
        let text = format!(
            "data: {}\n\ndata: not-json\n\ndata: {}\n\ndata: [DONE]\n",
            CHUNK_A, CHUNK_B
        );
        let chunks = collect(decode_sse(body(&[&text]))).await;

        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.is_ok()));
    }

    #[tokio::test]
    async fn test_lines_split_across_reads() {
        let text = format!("data: {}\n\ndata: [DONE]\n", CHUNK_A);
        let (head, tail) = text.split_at(20);
        let chunks = collect(decode_sse(body(&[head, tail]))).await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap().content(), Some("Hel"));
    }

    #[tokio::test]
    async fn test_nothing_after_sentinel() {
        let text = format!("data: {}\n\ndata: [DONE]\n\ndata: {}\n", CHUNK_A, CHUNK_B);
        let chunks = collect(decode_sse(body(&[&text]))).await;
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_body_close_without_sentinel() {
        let text = format!("data: {}\n\ndata: {}", CHUNK_A, CHUNK_B);
        let chunks = collect(decode_sse(body(&[&text]))).await;
        assert_eq!(chunks.len(), 2);
    }

    #[tokio::test]
    async fn test_read_error_ends_stream() {
        let parts: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from(format!("data: {}\n\n", CHUNK_A))),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from(format!("data: {}\n\n", CHUNK_B))),
        ];
        let chunks = collect(decode_sse(stream::iter(parts))).await;

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_ok());
        let err = chunks[1].as_ref().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NetworkError);
    }

    #[tokio::test]
    async fn test_cancellation_stops_open_stream() {
        let first = Ok::<_, std::io::Error>(Bytes::from(format!("data: {}\n\n", CHUNK_A)));
        let endless = stream::iter(vec![first]).chain(stream::pending());

        let token = CancellationToken::new();
        let mut chunks = with_cancellation(decode_sse(endless), token.clone());

        assert!(chunks.next().await.unwrap().is_ok());
        token.cancel();
        assert!(chunks.next().await.is_none());
    }

    #[tokio::test]
    async fn test_accumulator_merges_deltas() {
        let tool_a = r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"get_current_time","arguments":"{\"tz\":"}}]}}]}"#;
        let tool_b = r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"UTC\"}"}}]},"finish_reason":"tool_calls"}],"usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#;
        let text = format!("data: {}\n\ndata: {}\n\ndata: [DONE]\n", tool_a, tool_b);

        let mut acc = StreamAccumulator::new();
        let mut chunks = decode_sse(body(&[&text]));
        while let Some(chunk) = chunks.next().await {
            acc.push(&chunk.unwrap());
        }

        assert_eq!(acc.finish_reason(), Some("tool_calls"));
        assert_eq!(acc.usage().unwrap().total_tokens, 7);

        let message = acc.into_message();
        assert!(message.content.is_none());
        let calls = message.requested_tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name(), "get_current_time");
        assert_eq!(calls[0].arguments(), r#"{"tz":"UTC"}"#);
    }

    #[test]
    fn test_accumulator_text_message() {
        let mut acc = StreamAccumulator::new();
        acc.push(&serde_json::from_str(CHUNK_A).unwrap());
        acc.push(&serde_json::from_str(CHUNK_B).unwrap());

        assert_eq!(acc.content(), "Hello");
        let message = acc.into_message();
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.text(), "Hello");
        assert!(message.tool_calls.is_none());
    }
}
