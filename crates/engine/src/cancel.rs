//! Cooperative cancellation (C11, SPEC_FULL.md §4.11 / §5).
//!
//! A single-shot flag with sub-flags for the current turn, the current
//! retry sleep, and the current tool call. Consumers poll at least every
//! 100 ms. Raising is idempotent; lowering happens at the next turn
//! boundary (`CancelSignal::reset`).
//!
//! Grounded in `CancelToken`/`CancelMap` from this workspace's gateway
//! runtime, generalized from one flag per session to one flag per
//! cancellation scope within a single turn.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The granularity at which a cancellation request applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelScope {
    Turn,
    RetrySleep,
    ToolCall,
}

#[derive(Clone)]
pub struct CancelSignal {
    turn: Arc<AtomicBool>,
    retry_sleep: Arc<AtomicBool>,
    tool_call: Arc<AtomicBool>,
}

/// Poll granularity every consumer must honor (§4.11, §5).
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

impl CancelSignal {
    pub fn new() -> Self {
        Self {
            turn: Arc::new(AtomicBool::new(false)),
            retry_sleep: Arc::new(AtomicBool::new(false)),
            tool_call: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Raise cancellation for the given scope. Raising `Turn` also raises
    /// `RetrySleep` and `ToolCall` — cancelling a turn cancels everything
    /// happening inside it.
    pub fn raise(&self, scope: CancelScope) {
        match scope {
            CancelScope::Turn => {
                self.turn.store(true, Ordering::Release);
                self.retry_sleep.store(true, Ordering::Release);
                self.tool_call.store(true, Ordering::Release);
            }
            CancelScope::RetrySleep => self.retry_sleep.store(true, Ordering::Release),
            CancelScope::ToolCall => self.tool_call.store(true, Ordering::Release),
        }
    }

    pub fn is_raised(&self, scope: CancelScope) -> bool {
        match scope {
            CancelScope::Turn => self.turn.load(Ordering::Acquire),
            CancelScope::RetrySleep => self.retry_sleep.load(Ordering::Acquire),
            CancelScope::ToolCall => self.tool_call.load(Ordering::Acquire),
        }
    }

    /// Any cancellation at all is observable through the turn flag: once a
    /// turn is cancelled, every poll site should stop.
    pub fn turn_cancelled(&self) -> bool {
        self.is_raised(CancelScope::Turn)
    }

    /// Reset all flags. Called at the start of a new turn.
    pub fn reset(&self) {
        self.turn.store(false, Ordering::Release);
        self.retry_sleep.store(false, Ordering::Release);
        self.tool_call.store(false, Ordering::Release);
    }

    /// Sleep for `duration`, waking early (and returning `false`) if the
    /// turn or the retry-sleep sub-flag is raised before it elapses. Polls
    /// in `POLL_INTERVAL` increments so cancellation is observed within
    /// ≤100 ms, matching §4.1's "yields control every ≤100 ms" requirement.
    pub async fn cancellable_sleep(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            if self.turn_cancelled() || self.is_raised(CancelScope::RetrySleep) {
                return false;
            }
            let step = remaining.min(POLL_INTERVAL);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
        !(self.turn_cancelled() || self.is_raised(CancelScope::RetrySleep))
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}
