//! Counters for tokens, requests, errors, and time (C12, SPEC_FULL.md
//! §4.12). All updates happen on the `TurnController` task, so plain
//! interior mutability (a `Mutex`-free struct mutated through `&mut self`)
//! is correct; `Engine` owns the single instance.
//!
//! Field names and "estimate on failure" semantics are grounded in the
//! original Python `Stats`/`APIClient._update_stats_on_success` /
//! `_process_token_fallback` (see `examples/original_source/aicoder/api_client.py`).

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub api_requests: u64,
    pub api_success: u64,
    pub api_errors: u64,
    pub api_time_spent_ms: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub tool_calls: u64,
    pub tool_errors: u64,
    /// Running size of the current prompt, in tokens. Never resets on
    /// failure — it only advances (§4.8).
    pub current_prompt_size: u64,
    pub current_prompt_size_estimated: bool,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&mut self) {
        self.api_requests += 1;
    }

    pub fn record_success(&mut self, elapsed_ms: u64) {
        self.api_success += 1;
        self.api_time_spent_ms += elapsed_ms;
    }

    pub fn record_error(&mut self, elapsed_ms: u64) {
        self.api_errors += 1;
        self.api_time_spent_ms += elapsed_ms;
    }

    /// Record token usage for one *successful* round-trip. Callers must not
    /// invoke this on a failed request — `current_prompt_size` is only ever
    /// updated here, so skipping the call on failure is what makes it "not
    /// reset on API failure; it only advances" (§4.8).
    pub fn record_usage(&mut self, prompt_tokens: u64, completion_tokens: u64, estimated: bool) {
        self.prompt_tokens += prompt_tokens;
        self.completion_tokens += completion_tokens;
        self.current_prompt_size = prompt_tokens;
        self.current_prompt_size_estimated = estimated;
    }

    pub fn record_tool_call(&mut self) {
        self.tool_calls += 1;
    }

    pub fn record_tool_error(&mut self) {
        self.tool_errors += 1;
    }
}
