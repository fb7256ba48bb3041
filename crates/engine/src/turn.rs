//! TurnController / Engine (C10, SPEC_FULL.md §4.10): the main
//! request → tools → request loop, owning every other component for the
//! life of a session.
//!
//! The loop shape and its `MAX_TOOL_LOOPS` guard are grounded in
//! `sa-gateway::runtime::turn::run_turn_inner`; the retry-wrapped send is
//! this crate's `TransportClient` + `RetryPolicy` standing in for that
//! function's inline retry handling.

use std::time::{Duration, Instant};

use sa_domain::config::Config;
use sa_domain::stream::Usage;
use sa_domain::tool::{Message, ToolCall};

use crate::approval::ApprovalCache;
use crate::cancel::CancelSignal;
use crate::collaborators::{JsonRpcTransport, McpStdioPool, ToolRegistry, UiSink};
use crate::dispatch::ToolDispatcher;
use crate::error::EngineError;
use crate::history::HistoryStore;
use crate::mode::ModeGate;
use crate::request::{self, RequestSpec};
use crate::retry::{RetryClass, RetryDecision, RetryPolicy};
use crate::stats::Stats;
use crate::stream_decoder::StreamDecoder;
use crate::token::{self, TokenEstimator};
use crate::transport::{TransportClient, TransportOutcome, TransportResponse};

/// Grounded in the teacher's identical constant: a misbehaving model that
/// never stops calling tools must not loop forever.
pub const MAX_TOOL_LOOPS: u32 = 25;

/// Owns history, mode, approvals, stats, and the transport/decoder pair for
/// one session. Constructed once; `run_turn` is called once per user
/// message.
pub struct Engine {
    pub config: Config,
    pub history: HistoryStore,
    pub cancel: CancelSignal,
    pub stats: Stats,
    pub mode: ModeGate,
    pub approvals: parking_lot::Mutex<ApprovalCache>,
    token_estimator: TokenEstimator,
    transport: TransportClient,
    decoder: StreamDecoder,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            history: HistoryStore::new(),
            cancel: CancelSignal::new(),
            stats: Stats::new(),
            mode: ModeGate::new(),
            approvals: parking_lot::Mutex::new(ApprovalCache::new()),
            token_estimator: TokenEstimator::new(),
            transport: TransportClient::new(),
            decoder: StreamDecoder::new(),
        }
    }

    /// Start a fresh session: clears history, stats, approvals, mode, and
    /// the token estimator's per-index message cache (which would otherwise
    /// map stale indices onto the new, shorter history).
    pub fn reset_session(&mut self) {
        self.history.reset();
        self.token_estimator.clear_message_cache();
        self.stats = Stats::new();
        self.mode = ModeGate::new();
        self.approvals = parking_lot::Mutex::new(ApprovalCache::new());
    }

    /// Testing/advanced-embedding hook: supply a pre-built `reqwest::Client`
    /// (e.g. with a custom connector) instead of the default one.
    pub fn with_client(config: Config, client: reqwest::Client) -> Self {
        Self {
            transport: TransportClient::with_client(client),
            ..Self::new(config)
        }
    }

    /// Run one full turn: append the user's message, then loop
    /// request → (tool dispatch → request)* until the model stops calling
    /// tools, a fatal error occurs, the turn is cancelled, or the loop guard
    /// is hit.
    #[tracing::instrument(skip_all)]
    pub async fn run_turn(
        &mut self,
        user_message: Message,
        registry: &dyn ToolRegistry,
        ui: &dyn UiSink,
        jsonrpc: Option<&dyn JsonRpcTransport>,
        mcp: Option<&dyn McpStdioPool>,
    ) -> Result<(), EngineError> {
        self.cancel.reset();
        ui.before_user_prompt();
        tracing::debug!("turn started");

        if let Some(reminder) = self.mode.consume_transition_reminder() {
            self.history.append_user(Message::user(reminder));
        }
        if let Some(reminder) = self.mode.plan_reminder() {
            self.history.append_user(Message::user(reminder));
        }
        self.history.append_user(user_message);

        let mut retry = RetryPolicy::new(self.config.retry.clone());

        for _ in 0..MAX_TOOL_LOOPS {
            if self.cancel.turn_cancelled() {
                return Err(EngineError::Cancelled);
            }
            ui.before_ai_prompt();

            let tool_defs = self.mode.filter_tools(registry.definitions());
            let mut diagnostics = Vec::new();
            let body = request::build(
                &RequestSpec {
                    history: self.history.messages(),
                    config: &self.config,
                    tool_defs: &tool_defs,
                    streaming: self.config.enable_streaming,
                    disable_tools: false,
                    mode: &self.mode,
                },
                &mut diagnostics,
            );
            for d in diagnostics {
                ui.notice("request-diagnostic", &d);
            }

            let response = match self
                .send_with_retry(&mut retry, body, self.config.enable_streaming, ui)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    if matches!(e, EngineError::Cancelled) {
                        return Err(e);
                    }
                    ui.notice(e.notice_kind(), &e.to_string());
                    self.history
                        .append_assistant(Message::assistant(format!("Error: {e}")));
                    return Err(e);
                }
            };

            if self.cancel.turn_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let (assistant_msg, usage) = match response {
                TransportResponse::Stream(resp) => {
                    let timeout = Duration::from_secs(self.config.timeouts.streaming_timeout_secs.max(1));
                    match self.decoder.decode(resp, timeout, ui, &self.cancel).await {
                        Ok(decoded) => (decoded.message, decoded.usage),
                        Err(e) => {
                            if matches!(e, EngineError::Cancelled) {
                                return Err(e);
                            }
                            ui.notice(e.notice_kind(), &e.to_string());
                            self.history
                                .append_assistant(Message::assistant(format!("Error: {e}")));
                            return Err(e);
                        }
                    }
                }
                TransportResponse::Json(v) => {
                    let usage = v
                        .get("usage")
                        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());
                    (parse_non_streaming_message(&v), usage)
                }
            };

            if self.cancel.turn_cancelled() {
                // §5: partial assistant content is kept; any tool calls are
                // necessarily incomplete and were already stripped by the
                // decoder (or never existed, on the non-streaming path).
                self.history.append_assistant(assistant_msg);
                return Err(EngineError::Cancelled);
            }

            // §4.8: the provider's `usage.prompt_tokens` is authoritative
            // (estimated=false) only when `trust_usage_info_prompt_tokens`
            // is set and the value looks sane; otherwise always fall back
            // to estimation, even when `usage` was present.
            let (prompt_tokens, completion_tokens, estimated) = match usage {
                Some(u) if self.config.trust_usage_info_prompt_tokens && u.prompt_tokens > 0 => {
                    (u.prompt_tokens as u64, u.completion_tokens as u64, false)
                }
                _ => {
                    let prompt = self.token_estimator.estimate_messages(self.history.messages())
                        + self.token_estimator.estimate_tool_definitions(&tool_defs);
                    let completion = token::estimate(&assistant_msg.content.extract_all_text());
                    (prompt, completion, true)
                }
            };
            self.stats.record_usage(prompt_tokens, completion_tokens, estimated);
            self.history.record_prompt_size(prompt_tokens, estimated);

            let calls: Vec<ToolCall> = assistant_msg.tool_calls.clone().unwrap_or_default();
            self.history.append_assistant(assistant_msg);

            if calls.is_empty() {
                retry.reset();
                return Ok(());
            }

            let dispatcher = ToolDispatcher {
                registry,
                ui,
                approvals: &self.approvals,
                mode: &self.mode,
                yolo_mode: self.config.yolo_mode,
                jsonrpc,
                mcp,
            };
            let results = dispatcher.dispatch_all(&calls, &self.cancel).await;

            for (call, result) in calls.iter().zip(results.iter()) {
                self.stats.record_tool_call();
                if looks_like_tool_error(&result.content) {
                    self.stats.record_tool_error();
                }
                self.history
                    .append_tool(result.tool_call_id.clone(), call.name.clone(), result.content.clone());
                if let Some(guidance) = &result.guidance {
                    self.history.append_user(Message::user(guidance.clone()));
                }
            }

            retry.reset();
        }

        tracing::warn!(max_tool_loops = MAX_TOOL_LOOPS, "tool loop limit reached");
        self.history.append_assistant(Message::assistant(format!(
            "Error: tool loop limit reached ({MAX_TOOL_LOOPS} iterations)"
        )));
        Ok(())
    }

    /// A disable-streaming, disable-tools request used for summarization and
    /// similar helpers. Does not touch `self.history` and never enters the
    /// tool loop — returns the model's plain-text reply.
    pub async fn internal_request(
        &mut self,
        context: &[Message],
        ui: &dyn UiSink,
    ) -> Result<String, EngineError> {
        if self.cancel.turn_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let mut diagnostics = Vec::new();
        let body = request::build(
            &RequestSpec {
                history: context,
                config: &self.config,
                tool_defs: &[],
                streaming: false,
                disable_tools: true,
                mode: &self.mode,
            },
            &mut diagnostics,
        );
        for d in diagnostics {
            ui.notice("request-diagnostic", &d);
        }

        let mut retry = RetryPolicy::new(self.config.retry.clone());
        let response = self.send_with_retry(&mut retry, body, false, ui).await?;
        match response {
            TransportResponse::Json(v) => Ok(parse_non_streaming_message(&v).content.extract_all_text()),
            TransportResponse::Stream(_) => {
                Err(EngineError::BadRequest("internal request unexpectedly streamed".into()))
            }
        }
    }

    /// Send `body`, retrying classified-retryable failures per `retry`
    /// (cancellably sleeping between attempts) until success, a fatal
    /// error, budget exhaustion, or cancellation.
    #[tracing::instrument(skip_all, fields(attempt = tracing::field::Empty))]
    async fn send_with_retry(
        &mut self,
        retry: &mut RetryPolicy,
        body: serde_json::Value,
        streaming: bool,
        ui: &dyn UiSink,
    ) -> Result<TransportResponse, EngineError> {
        loop {
            if self.cancel.turn_cancelled() {
                return Err(EngineError::Cancelled);
            }
            self.stats.record_request();
            let start = Instant::now();
            let outcome = self
                .transport
                .send(body.clone(), streaming, &self.config, &self.cancel)
                .await;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            match outcome {
                TransportOutcome::Success(resp) => {
                    self.stats.record_success(elapsed_ms);
                    return Ok(resp);
                }
                TransportOutcome::Fatal(e) => {
                    self.stats.record_error(elapsed_ms);
                    tracing::error!(error = %e, "fatal response from model endpoint");
                    return Err(e);
                }
                TransportOutcome::Retryable(class, message) => {
                    self.stats.record_error(elapsed_ms);
                    tracing::warn!(attempt = retry.attempt_count(), ?class, "retrying after classified failure");
                    ui.notice(retry_notice_kind(class), &message);
                    match retry.consult(class, &self.cancel).await {
                        RetryDecision::Retry => continue,
                        RetryDecision::GiveUp => return Err(retry_class_to_error(class, message)),
                    }
                }
            }
        }
    }
}

fn retry_notice_kind(class: RetryClass) -> &'static str {
    match class {
        RetryClass::RetryRateLimited => "rate-limited",
        _ => "server-transient",
    }
}

fn retry_class_to_error(class: RetryClass, message: String) -> EngineError {
    match class {
        RetryClass::RetryRateLimited => EngineError::RateLimited(message),
        _ => EngineError::ServerTransient(message),
    }
}

/// A dispatcher result counts as a tool error for `Stats` purposes if its
/// content matches one of the dispatcher's own failure-path conventions
/// (§4.6). This is a stats heuristic only — it never changes what gets
/// appended to history.
fn looks_like_tool_error(content: &str) -> bool {
    content.starts_with("Error:")
        || content == "Tool call rejected by user"
        || content == "Tool call cancelled"
        || content.starts_with("command exited with status")
}

fn parse_non_streaming_message(v: &serde_json::Value) -> Message {
    let msg = &v["choices"][0]["message"];
    let content = msg.get("content").and_then(|c| c.as_str()).unwrap_or("").to_string();
    let tool_calls = msg
        .get("tool_calls")
        .and_then(|t| t.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let id = tc.get("id").and_then(|i| i.as_str())?.to_string();
                    let func = tc.get("function")?;
                    let name = func.get("name").and_then(|n| n.as_str())?.to_string();
                    let arguments_json = func
                        .get("arguments")
                        .and_then(|a| a.as_str())
                        .unwrap_or("{}")
                        .to_string();
                    Some(ToolCall { id, name, arguments_json })
                })
                .collect::<Vec<_>>()
        })
        .filter(|calls| !calls.is_empty());

    match tool_calls {
        Some(calls) => Message::assistant_with_tool_calls(content, calls),
        None => Message::assistant(content),
    }
}
