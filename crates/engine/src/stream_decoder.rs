//! StreamDecoder (C5, SPEC_FULL.md §4.5).
//!
//! Consumes Server-Sent Events of the form `data: <json>\n`, reassembling a
//! sealed assistant `Message` plus any `usage` block. Line/event framing is
//! grounded in `sa-providers::sse::{drain_data_lines, sse_response_stream}`:
//! bytes arrive as a `reqwest` byte stream, get buffered, and are split on
//! blank-line-delimited event blocks before per-line `data:` stripping runs.

use std::collections::BTreeMap;
use std::time::Duration;

use sa_domain::stream::Usage;
use sa_domain::tool::{Message, ToolCall};

use crate::cancel::CancelSignal;
use crate::collaborators::UiSink;
use crate::error::EngineError;

#[derive(Debug, Clone, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// The result of fully decoding one streaming response.
pub struct Decoded {
    pub message: Message,
    pub usage: Option<Usage>,
}

/// Extract complete `data:` payloads from an SSE buffer, draining consumed
/// bytes in place. Mirrors `sa-providers::sse::drain_data_lines`.
fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);
        for line in block.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }
    data_lines
}

/// Stateful decoder for one streaming response. Every call to `decode`
/// clears all buffers and whitespace state first, so a decoder instance can
/// safely be reused across requests — including after a previous call
/// returned an error, which is the "finally-equivalent reset" the spec asks
/// for (§4.5): there is no separate cleanup path because the *next* call is
/// always the one that resets state, not the failing one.
#[derive(Default)]
pub struct StreamDecoder {
    content: String,
    tool_calls: BTreeMap<u32, PendingCall>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    started_output: bool,
    pending_ws: String,
    monotonic: u32,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.content.clear();
        self.tool_calls.clear();
        self.finish_reason = None;
        self.usage = None;
        self.started_output = false;
        self.pending_ws.clear();
        self.monotonic = 0;
    }

    /// Apply the whitespace policy (§4.5) while forwarding live text to the
    /// UI sink: drop whitespace preceding the first printable character;
    /// buffer trailing whitespace until a printable character arrives (or
    /// the stream ends, in which case it's dropped by simply never being
    /// flushed).
    fn emit_filtered(&mut self, frag: &str, ui: &dyn UiSink) {
        let mut to_emit = String::new();
        for ch in frag.chars() {
            if ch.is_whitespace() {
                if self.started_output {
                    self.pending_ws.push(ch);
                }
            } else {
                if !self.pending_ws.is_empty() {
                    to_emit.push_str(&self.pending_ws);
                    self.pending_ws.clear();
                }
                to_emit.push(ch);
                self.started_output = true;
            }
        }
        if !to_emit.is_empty() {
            ui.stream_chunk(&to_emit);
        }
    }

    fn apply_chunk(&mut self, v: &serde_json::Value, ui: &dyn UiSink) {
        if let Some(choice) = v.get("choices").and_then(|c| c.get(0)) {
            let delta = choice.get("delta").cloned().unwrap_or(serde_json::Value::Null);
            if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
                self.content.push_str(content);
                self.emit_filtered(content, ui);
            } else if let Some(reasoning) = delta.get("reasoning").and_then(|c| c.as_str()) {
                self.content.push_str(reasoning);
                self.emit_filtered(reasoning, ui);
            }

            if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                for tc in tool_calls {
                    let index = tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as u32;
                    let is_new = !self.tool_calls.contains_key(&index);
                    let entry = self.tool_calls.entry(index).or_default();
                    if let Some(id) = tc.get("id").and_then(|i| i.as_str()) {
                        entry.id.push_str(id);
                    }
                    if let Some(func) = tc.get("function") {
                        if let Some(name) = func.get("name").and_then(|n| n.as_str()) {
                            entry.name.push_str(name);
                        }
                        if let Some(args) = func.get("arguments").and_then(|a| a.as_str()) {
                            entry.arguments.push_str(args);
                        }
                    }
                    if is_new {
                        ui.notice("tool-call-started", &format!("index {index}"));
                    }
                }
            }

            if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
                self.finish_reason = Some(fr.to_string());
            }
        }

        if let Some(usage) = v.get("usage") {
            if !usage.is_null() {
                if let Ok(u) = serde_json::from_value::<Usage>(usage.clone()) {
                    self.usage = Some(u);
                }
            }
        }
    }

    fn seal(&mut self, ui: &dyn UiSink) -> Message {
        let mut calls: Vec<ToolCall> = Vec::new();
        for (index, pending) in std::mem::take(&mut self.tool_calls) {
            if pending.name.trim().is_empty() {
                ui.notice(
                    "stream-decode-error",
                    &format!("tool call at index {index} sealed with a blank name, dropped"),
                );
                continue;
            }
            let id = if pending.id.is_empty() {
                self.monotonic += 1;
                format!("tool_call_{index}_{}", self.monotonic)
            } else {
                pending.id
            };
            calls.push(ToolCall {
                id,
                name: pending.name,
                arguments_json: pending.arguments,
            });
        }

        if calls.is_empty() {
            Message::assistant(self.content.clone())
        } else {
            Message::assistant_with_tool_calls(self.content.clone(), calls)
        }
    }

    /// Decode one streaming HTTP response into a sealed assistant message.
    #[tracing::instrument(skip_all)]
    pub async fn decode(
        &mut self,
        mut response: reqwest::Response,
        inactivity_timeout: Duration,
        ui: &dyn UiSink,
        cancel: &CancelSignal,
    ) -> Result<Decoded, EngineError> {
        self.reset();
        let mut buffer = String::new();
        let mut saw_done = false;
        let mut cancelled = false;

        loop {
            if cancel.is_raised(crate::cancel::CancelScope::Turn) {
                tracing::warn!("stream cancelled mid-decode, keeping partial content");
                cancelled = true;
                break;
            }

            let chunk = tokio::time::timeout(inactivity_timeout, response.chunk()).await;
            let chunk = match chunk {
                Err(_) => return Err(EngineError::HttpTimeout),
                Ok(Err(e)) => return Err(EngineError::Transport(e)),
                Ok(Ok(c)) => c,
            };

            match chunk {
                Some(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    let lines = drain_data_lines(&mut buffer);
                    for line in lines {
                        if line == "[DONE]" {
                            saw_done = true;
                            break;
                        }
                        match serde_json::from_str::<serde_json::Value>(&line) {
                            Ok(v) => self.apply_chunk(&v, ui),
                            Err(e) => {
                                ui.notice("stream-decode-error", &format!("dropped unparseable chunk: {e}"));
                            }
                        }
                    }
                    if saw_done {
                        break;
                    }
                }
                None => break, // physical EOF
            }
        }

        if cancelled {
            // §5: a cancelled stream keeps its already-decoded content but
            // discards any in-flight tool calls, since they're necessarily
            // incomplete.
            self.tool_calls.clear();
            let usage = self.usage;
            let message = self.seal(ui);
            return Ok(Decoded { message, usage });
        }

        if !saw_done && self.usage.is_none() {
            tracing::warn!("stream ended without a [DONE] sentinel or usage block");
            return Err(EngineError::ConnectionDropped);
        }

        let usage = self.usage;
        let message = self.seal(ui);
        Ok(Decoded { message, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        chunks: Mutex<Vec<String>>,
        notices: Mutex<Vec<(String, String)>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                chunks: Mutex::new(Vec::new()),
                notices: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl UiSink for RecordingSink {
        fn stream_chunk(&self, text: &str) {
            self.chunks.lock().unwrap().push(text.to_string());
        }
        fn notice(&self, kind: &str, message: &str) {
            self.notices
                .lock()
                .unwrap()
                .push((kind.to_string(), message.to_string()));
        }
        async fn ask_approval(
            &self,
            _tool_name: &str,
            _args: &serde_json::Value,
        ) -> crate::collaborators::ApprovalAnswer {
            crate::collaborators::ApprovalAnswer::Deny
        }
        fn before_user_prompt(&self) {}
        fn before_ai_prompt(&self) {}
    }

    fn sse_body(events: &[&str]) -> String {
        events
            .iter()
            .map(|e| format!("data: {e}\n\n"))
            .collect::<Vec<_>>()
            .join("")
    }

    async fn respond_with(body: String) -> reqwest::Response {
        use tokio::io::AsyncWriteExt;
        use tokio::net::TcpListener;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let http = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n{body}"
        );
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(http.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        reqwest::get(format!("http://{addr}/")).await.unwrap()
    }

    #[tokio::test]
    async fn plain_content_with_done_sentinel() {
        let body = sse_body(&[
            r#"{"choices":[{"delta":{"content":"hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ]);
        let response = respond_with(body).await;
        let sink = RecordingSink::new();
        let mut decoder = StreamDecoder::new();
        let decoded = decoder
            .decode(response, Duration::from_secs(5), &sink, &CancelSignal::new())
            .await
            .unwrap();
        assert_eq!(decoded.message.content.extract_all_text(), "hello");
        assert!(!decoded.message.has_tool_calls());
    }

    #[tokio::test]
    async fn whitespace_policy_drops_leading_and_trailing_whitespace() {
        let body = sse_body(&[
            r#"{"choices":[{"delta":{"content":"   "}}]}"#,
            r#"{"choices":[{"delta":{"content":"hi"}}]}"#,
            r#"{"choices":[{"delta":{"content":"  \n"}}]}"#,
            "[DONE]",
        ]);
        let response = respond_with(body).await;
        let sink = RecordingSink::new();
        let mut decoder = StreamDecoder::new();
        decoder
            .decode(response, Duration::from_secs(5), &sink, &CancelSignal::new())
            .await
            .unwrap();
        let emitted: String = sink.chunks.lock().unwrap().concat();
        assert_eq!(emitted, "hi");
    }

    #[tokio::test]
    async fn whitespace_between_two_words_is_preserved() {
        let body = sse_body(&[
            r#"{"choices":[{"delta":{"content":"hi"}}]}"#,
            r#"{"choices":[{"delta":{"content":" there"}}]}"#,
            "[DONE]",
        ]);
        let response = respond_with(body).await;
        let sink = RecordingSink::new();
        let mut decoder = StreamDecoder::new();
        decoder
            .decode(response, Duration::from_secs(5), &sink, &CancelSignal::new())
            .await
            .unwrap();
        let emitted: String = sink.chunks.lock().unwrap().concat();
        assert_eq!(emitted, "hi there");
    }

    #[tokio::test]
    async fn tool_call_deltas_merge_by_index() {
        let body = sse_body(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"t1","function":{"name":"read_","arguments":"{\"pa"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"file","arguments":"th\":\"a\"}"}}]}}]}"#,
            r#"{"choices":[{"finish_reason":"tool_calls"}],"usage":{"prompt_tokens":10,"completion_tokens":2,"total_tokens":12}}"#,
        ]);
        let response = respond_with(body).await;
        let sink = RecordingSink::new();
        let mut decoder = StreamDecoder::new();
        let decoded = decoder
            .decode(response, Duration::from_secs(5), &sink, &CancelSignal::new())
            .await
            .unwrap();
        assert!(decoded.message.has_tool_calls());
        let calls = decoded.message.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "t1");
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments_json, "{\"path\":\"a\"}");
        assert_eq!(decoded.usage.unwrap().prompt_tokens, 10);
    }

    #[tokio::test]
    async fn tool_call_without_id_gets_synthesized_id() {
        let body = sse_body(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"read_file","arguments":"{}"}}]}}]}"#,
            "[DONE]",
        ]);
        let response = respond_with(body).await;
        let sink = RecordingSink::new();
        let mut decoder = StreamDecoder::new();
        let decoded = decoder
            .decode(response, Duration::from_secs(5), &sink, &CancelSignal::new())
            .await
            .unwrap();
        let calls = decoded.message.tool_calls.unwrap();
        assert!(calls[0].id.starts_with("tool_call_0_"));
    }

    #[tokio::test]
    async fn tool_call_with_blank_name_after_sealing_is_dropped() {
        let body = sse_body(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"t1","function":{"arguments":"{}"}}]}}]}"#,
            "[DONE]",
        ]);
        let response = respond_with(body).await;
        let sink = RecordingSink::new();
        let mut decoder = StreamDecoder::new();
        let decoded = decoder
            .decode(response, Duration::from_secs(5), &sink, &CancelSignal::new())
            .await
            .unwrap();
        assert!(!decoded.message.has_tool_calls());
        assert!(sink
            .notices
            .lock()
            .unwrap()
            .iter()
            .any(|(kind, _)| kind == "stream-decode-error"));
    }

    #[tokio::test]
    async fn eof_without_done_but_with_usage_is_success() {
        let body = sse_body(&[
            r#"{"choices":[{"delta":{"content":"hi"}}],"usage":{"prompt_tokens":5,"completion_tokens":1,"total_tokens":6}}"#,
        ]);
        let response = respond_with(body).await;
        let sink = RecordingSink::new();
        let mut decoder = StreamDecoder::new();
        let decoded = decoder
            .decode(response, Duration::from_secs(5), &sink, &CancelSignal::new())
            .await
            .unwrap();
        assert_eq!(decoded.message.content.extract_all_text(), "hi");
        assert_eq!(decoded.usage.unwrap().prompt_tokens, 5);
    }

    #[tokio::test]
    async fn eof_without_done_and_without_usage_is_connection_dropped() {
        let body = sse_body(&[r#"{"choices":[{"delta":{"content":"hi"}}]}"#]);
        let response = respond_with(body).await;
        let sink = RecordingSink::new();
        let mut decoder = StreamDecoder::new();
        let result = decoder
            .decode(response, Duration::from_secs(5), &sink, &CancelSignal::new())
            .await;
        assert!(matches!(result, Err(EngineError::ConnectionDropped)));
    }

    #[tokio::test]
    async fn malformed_chunk_is_dropped_not_fatal() {
        let body = sse_body(&["not json at all", r#"{"choices":[{"delta":{"content":"ok"}}]}"#, "[DONE]"]);
        let response = respond_with(body).await;
        let sink = RecordingSink::new();
        let mut decoder = StreamDecoder::new();
        let decoded = decoder
            .decode(response, Duration::from_secs(5), &sink, &CancelSignal::new())
            .await
            .unwrap();
        assert_eq!(decoded.message.content.extract_all_text(), "ok");
    }

    #[tokio::test]
    async fn decode_reset_is_independent_across_calls() {
        let mut decoder = StreamDecoder::new();
        let sink = RecordingSink::new();

        let body1 = sse_body(&[r#"{"choices":[{"delta":{"content":"first"}}]}"#, "[DONE]"]);
        let response1 = respond_with(body1).await;
        let decoded1 = decoder
            .decode(response1, Duration::from_secs(5), &sink, &CancelSignal::new())
            .await
            .unwrap();
        assert_eq!(decoded1.message.content.extract_all_text(), "first");

        let body2 = sse_body(&[r#"{"choices":[{"delta":{"content":"second"}}]}"#, "[DONE]"]);
        let response2 = respond_with(body2).await;
        let decoded2 = decoder
            .decode(response2, Duration::from_secs(5), &sink, &CancelSignal::new())
            .await
            .unwrap();
        assert_eq!(decoded2.message.content.extract_all_text(), "second");
    }

    #[tokio::test]
    async fn cancellation_before_any_bytes_yields_empty_message_not_an_error() {
        let body = sse_body(&[r#"{"choices":[{"delta":{"content":"never seen"}}]}"#, "[DONE]"]);
        let response = respond_with(body).await;
        let sink = RecordingSink::new();
        let mut decoder = StreamDecoder::new();
        let cancel = CancelSignal::new();
        cancel.raise(crate::cancel::CancelScope::Turn);

        let decoded = decoder
            .decode(response, Duration::from_secs(5), &sink, &cancel)
            .await
            .unwrap();
        assert_eq!(decoded.message.content.extract_all_text(), "");
        assert!(!decoded.message.has_tool_calls());
    }

    #[tokio::test]
    async fn cancellation_mid_stream_keeps_partial_content_and_drops_tool_calls() {
        use tokio::io::AsyncWriteExt;
        use tokio::net::TcpListener;

        let first = sse_body(&[r#"{"choices":[{"delta":{"content":"partial answer"}}]}"#]);
        let tool_delta = sse_body(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"t1","function":{"name":"read_file","arguments":"{}"}}]}}]}"#,
        ]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let header =
                    "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";
                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(first.as_bytes()).await;
                let _ = socket.write_all(tool_delta.as_bytes()).await;
                // Never sends [DONE]; holds the connection open past the
                // point the test cancels the turn.
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = socket.shutdown().await;
            }
        });
        let response = reqwest::get(format!("http://{addr}/")).await.unwrap();

        let sink = RecordingSink::new();
        let mut decoder = StreamDecoder::new();
        let cancel = CancelSignal::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel2.raise(crate::cancel::CancelScope::Turn);
        });

        let decoded = decoder
            .decode(response, Duration::from_secs(5), &sink, &cancel)
            .await
            .unwrap();
        assert_eq!(decoded.message.content.extract_all_text(), "partial answer");
        assert!(!decoded.message.has_tool_calls());
    }

    #[test]
    fn drain_data_lines_parses_done_sentinel() {
        let mut buf = String::from("data: [DONE]\n\n");
        let lines = drain_data_lines(&mut buf);
        assert_eq!(lines, vec!["[DONE]"]);
    }
}
