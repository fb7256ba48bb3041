//! TransportClient (C4, SPEC_FULL.md §4.4).
//!
//! Replaces the "exceptions used as control flow for retry" anti-pattern
//! flagged in §9 with the sum type the design notes prescribe:
//! `TransportOutcome = Success | Retryable | Fatal`.
//!
//! Backed by a single shared `reqwest::Client`, built once and held by the
//! `Engine`, mirroring every provider adapter in `sa-providers` holding its
//! client as a struct field rather than building one per call.

use std::time::Duration;

use sa_domain::config::Config;

use crate::cancel::CancelSignal;
use crate::error::EngineError;
use crate::retry::{classify, classify_transport_failure, RetryClass};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A successful round-trip: either the decoded JSON body (non-streaming) or
/// the raw response to hand to `StreamDecoder` (streaming). The caller
/// closes the stream handle when done (§4.4).
pub enum TransportResponse {
    Json(serde_json::Value),
    Stream(reqwest::Response),
}

/// The sum type named in §9 in place of exception-based retry control flow.
pub enum TransportOutcome {
    Success(TransportResponse),
    Retryable(RetryClass, String),
    Fatal(EngineError),
}

pub struct TransportClient {
    client: reqwest::Client,
}

impl TransportClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// POST `body` to `config.api.endpoint`, observing the total HTTP
    /// deadline and polling `cancel` at least every 100 ms (§4.4/§5).
    #[tracing::instrument(skip(self, body, config, cancel))]
    pub async fn send(
        &self,
        body: serde_json::Value,
        streaming: bool,
        config: &Config,
        cancel: &CancelSignal,
    ) -> TransportOutcome {
        let total_timeout = Duration::from_secs(config.timeouts.http_timeout_secs.max(1));
        let request_fut = self.send_once(body, streaming, config);
        tokio::pin!(request_fut);
        let mut elapsed = Duration::ZERO;

        loop {
            tokio::select! {
                outcome = &mut request_fut => return outcome,
                _ = tokio::time::sleep(POLL_INTERVAL.min(total_timeout)) => {
                    if cancel.turn_cancelled() {
                        return TransportOutcome::Fatal(EngineError::Cancelled);
                    }
                    elapsed += POLL_INTERVAL;
                    if elapsed >= total_timeout {
                        tracing::warn!(?elapsed, "http request timed out");
                        return TransportOutcome::Retryable(
                            RetryClass::RetryTransient,
                            "http request timed out".into(),
                        );
                    }
                }
            }
        }
    }

    async fn send_once(
        &self,
        body: serde_json::Value,
        streaming: bool,
        config: &Config,
    ) -> TransportOutcome {
        let mut req = self
            .client
            .post(&config.api.endpoint)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", config.api.api_key))
            .header("User-Agent", &config.http_user_agent);

        // Provider-specific header rule, keyed off the endpoint host. The
        // `openrouter.ai` `HTTP-Referer`/`X-Title` pair is kept as the one
        // concrete example the original source applied.
        if config.api.endpoint.contains("openrouter.ai") {
            req = req
                .header("HTTP-Referer", "https://github.com/aicoder")
                .header("X-Title", "aicoder");
        }

        let response = match req.json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                if e.is_timeout() || e.is_connect() {
                    return TransportOutcome::Retryable(
                        classify_transport_failure(),
                        e.to_string(),
                    );
                }
                return TransportOutcome::Fatal(EngineError::Transport(e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let text = response.text().await.unwrap_or_default();
            let class = classify(code, &text);
            tracing::warn!(status = code, ?class, "non-success response from model endpoint");
            return match class {
                RetryClass::Fatal => TransportOutcome::Fatal(fatal_from_status(code, &text)),
                _ => TransportOutcome::Retryable(class, text),
            };
        }

        if streaming {
            TransportOutcome::Success(TransportResponse::Stream(response))
        } else {
            match response.json::<serde_json::Value>().await {
                Ok(v) => TransportOutcome::Success(TransportResponse::Json(v)),
                Err(e) => TransportOutcome::Fatal(EngineError::Transport(e)),
            }
        }
    }
}

fn fatal_from_status(code: u16, body: &str) -> EngineError {
    match code {
        401 => EngineError::AuthFailed(body.to_string()),
        400 => EngineError::BadRequest(body.to_string()),
        _ => EngineError::ServerTransient(format!("{code}: {body}")),
    }
}

impl Default for TransportClient {
    fn default() -> Self {
        Self::new()
    }
}
