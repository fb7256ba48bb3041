//! RetryPolicy (C1, SPEC_FULL.md §4.1).
//!
//! Classifies a failed HTTP round-trip into `{retry-transient,
//! retry-rate-limited, fatal}`, and computes the cancellable backoff delay
//! for retryable classes.
//!
//! Grounded in the original Python `APIRetryHandler.should_retry_error` /
//! `_calculate_retry_delay` (`examples/original_source/aicoder/retry_utils.py`):
//! the 500-special-case (retry only when the body contains a rate-limit
//! marker or the literal string "429 Too Many Requests") is carried over
//! verbatim as the fatal/rate-limited split for code 500.

use std::time::Duration;

use sa_domain::config::RetryConfig;

use crate::cancel::CancelSignal;

const RATE_LIMIT_MARKERS: &[&str] = &[
    "too many requests",
    "rate limit",
    "rate limited",
    "quota exceeded",
];

/// The outcome of classifying one failed HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    RetryTransient,
    RetryRateLimited,
    Fatal,
}

impl RetryClass {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RetryClass::Fatal)
    }
}

/// Classify an HTTP status code plus decoded body per §4.1.
pub fn classify(status: u16, body: &str) -> RetryClass {
    let lower = body.to_ascii_lowercase();
    let has_rate_limit_marker = RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m));

    match status {
        429 => RetryClass::RetryRateLimited,
        502 | 503 | 504 | 524 => {
            if has_rate_limit_marker {
                RetryClass::RetryRateLimited
            } else {
                RetryClass::RetryTransient
            }
        }
        500 => {
            // Carried over from the original's literal 500-special-case:
            // only retry a 500 when it actually smells like rate limiting.
            if lower.contains("429 too many requests") || has_rate_limit_marker {
                RetryClass::RetryRateLimited
            } else {
                RetryClass::Fatal
            }
        }
        400 | 401 => RetryClass::Fatal,
        s if (500..600).contains(&s) => {
            if has_rate_limit_marker {
                RetryClass::RetryRateLimited
            } else {
                RetryClass::Fatal
            }
        }
        _ => RetryClass::Fatal,
    }
}

/// Classification for transport-level failures that never produced a status
/// code at all (§4.1: "socket timeouts and EOF during header read").
pub fn classify_transport_failure() -> RetryClass {
    RetryClass::RetryTransient
}

/// Stateful retry policy: tracks the attempt counter across one turn's
/// worth of retries and computes cancellable backoff sleeps.
pub struct RetryPolicy {
    config: RetryConfig,
    attempt: u32,
}

/// What the caller should do after consulting the policy for one failure.
pub enum RetryDecision {
    /// Retry after this delay (already slept, unless cancelled).
    Retry,
    /// Stop retrying: either the class was fatal, the attempt budget was
    /// exhausted, or the sleep was cancelled.
    GiveUp,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt
    }

    /// Reset the attempt counter. Called after a successful response.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// `min(base * 2^attempt, max_delay)`, or the configured fixed delay if
    /// exponential backoff is disabled.
    pub fn compute_delay(&self, class: RetryClass) -> Duration {
        if !self.config.enable_exponential_wait_retry {
            return Duration::from_secs(self.config.fixed_delay_secs);
        }
        let base = match class {
            RetryClass::RetryRateLimited => 10,
            _ => self.config.initial_delay_secs.max(1),
        };
        let scaled = base.saturating_mul(1u64 << self.attempt.min(20));
        Duration::from_secs(scaled.min(self.config.max_delay_secs))
    }

    /// Whether another attempt is permitted given `max_attempts` (0 = unbounded).
    fn budget_exhausted(&self) -> bool {
        self.config.max_attempts > 0 && self.attempt >= self.config.max_attempts
    }

    /// Consult the policy for one classified failure: if retryable and
    /// within budget, sleep (cancellably) and return `Retry`; otherwise
    /// `GiveUp`. Advances the attempt counter on every retryable
    /// consultation, matching the source's `retry_attempt_count += 1` before
    /// the sleep.
    pub async fn consult(&mut self, class: RetryClass, cancel: &CancelSignal) -> RetryDecision {
        if !class.is_retryable() || self.budget_exhausted() {
            tracing::debug!(?class, attempt = self.attempt, "giving up retrying");
            return RetryDecision::GiveUp;
        }
        let delay = self.compute_delay(class);
        self.attempt += 1;
        tracing::debug!(?delay, attempt = self.attempt, "sleeping before retry");
        if cancel.cancellable_sleep(delay).await {
            RetryDecision::Retry
        } else {
            RetryDecision::GiveUp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_transient_codes() {
        for code in [502, 503, 504, 524] {
            assert_eq!(classify(code, ""), RetryClass::RetryTransient);
        }
    }

    #[test]
    fn classify_429_is_rate_limited_regardless_of_body() {
        assert_eq!(classify(429, ""), RetryClass::RetryRateLimited);
        assert_eq!(classify(429, "whatever"), RetryClass::RetryRateLimited);
    }

    #[test]
    fn classify_5xx_with_rate_limit_marker_is_rate_limited() {
        assert_eq!(
            classify(503, "Quota Exceeded for this key"),
            RetryClass::RetryRateLimited
        );
        assert_eq!(
            classify(502, "Too Many Requests"),
            RetryClass::RetryRateLimited
        );
    }

    #[test]
    fn classify_400_401_are_fatal() {
        assert_eq!(classify(400, "bad request"), RetryClass::Fatal);
        assert_eq!(classify(401, ""), RetryClass::Fatal);
    }

    #[test]
    fn classify_500_without_marker_is_fatal() {
        assert_eq!(classify(500, "internal server error"), RetryClass::Fatal);
    }

    #[test]
    fn classify_500_with_marker_is_rate_limited() {
        assert_eq!(
            classify(500, "429 Too Many Requests upstream"),
            RetryClass::RetryRateLimited
        );
        assert_eq!(
            classify(500, "rate limited, try later"),
            RetryClass::RetryRateLimited
        );
    }

    #[test]
    fn classify_other_5xx_without_marker_is_fatal() {
        assert_eq!(classify(501, "not implemented"), RetryClass::Fatal);
    }

    #[test]
    fn classify_is_case_insensitive() {
        assert_eq!(
            classify(503, "RATE LIMIT EXCEEDED"),
            RetryClass::RetryRateLimited
        );
    }

    fn cfg() -> RetryConfig {
        RetryConfig {
            enable_exponential_wait_retry: true,
            initial_delay_secs: 2,
            max_delay_secs: 64,
            fixed_delay_secs: 10,
            max_attempts: 0,
        }
    }

    #[test]
    fn backoff_monotonicity_until_cap() {
        let mut policy = RetryPolicy::new(cfg());
        let expected = [2u64, 4, 8, 16, 32, 64, 64, 64];
        for exp in expected {
            let delay = policy.compute_delay(RetryClass::RetryTransient);
            assert_eq!(delay, Duration::from_secs(exp));
            policy.attempt += 1;
        }
    }

    #[test]
    fn rate_limited_base_delay_is_ten() {
        let policy = RetryPolicy::new(cfg());
        assert_eq!(
            policy.compute_delay(RetryClass::RetryRateLimited),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn fixed_delay_mode_ignores_attempt_count() {
        let mut config = cfg();
        config.enable_exponential_wait_retry = false;
        let mut policy = RetryPolicy::new(config);
        policy.attempt = 5;
        assert_eq!(
            policy.compute_delay(RetryClass::RetryTransient),
            Duration::from_secs(10)
        );
    }

    #[tokio::test]
    async fn consult_gives_up_immediately_on_fatal() {
        let mut policy = RetryPolicy::new(cfg());
        let cancel = CancelSignal::new();
        let decision = policy.consult(RetryClass::Fatal, &cancel).await;
        assert!(matches!(decision, RetryDecision::GiveUp));
        assert_eq!(policy.attempt_count(), 0);
    }

    #[tokio::test]
    async fn consult_retries_within_budget() {
        let mut config = cfg();
        config.initial_delay_secs = 0;
        config.max_delay_secs = 0;
        let mut policy = RetryPolicy::new(config);
        let cancel = CancelSignal::new();
        let decision = policy.consult(RetryClass::RetryTransient, &cancel).await;
        assert!(matches!(decision, RetryDecision::Retry));
        assert_eq!(policy.attempt_count(), 1);
    }

    #[tokio::test]
    async fn consult_gives_up_when_budget_exhausted() {
        let mut config = cfg();
        config.max_attempts = 1;
        config.initial_delay_secs = 0;
        config.max_delay_secs = 0;
        let mut policy = RetryPolicy::new(config);
        let cancel = CancelSignal::new();
        assert!(matches!(
            policy.consult(RetryClass::RetryTransient, &cancel).await,
            RetryDecision::Retry
        ));
        assert!(matches!(
            policy.consult(RetryClass::RetryTransient, &cancel).await,
            RetryDecision::GiveUp
        ));
    }

    #[tokio::test]
    async fn consult_gives_up_on_cancellation() {
        let mut config = cfg();
        config.initial_delay_secs = 5;
        config.max_delay_secs = 64;
        let mut policy = RetryPolicy::new(config);
        let cancel = CancelSignal::new();
        cancel.raise(crate::cancel::CancelScope::Turn);
        let decision = policy.consult(RetryClass::RetryTransient, &cancel).await;
        assert!(matches!(decision, RetryDecision::GiveUp));
    }

    #[test]
    fn reset_zeroes_attempt_counter() {
        let mut policy = RetryPolicy::new(cfg());
        policy.attempt = 4;
        policy.reset();
        assert_eq!(policy.attempt_count(), 0);
    }
}
