//! ModeGate (C9, SPEC_FULL.md §4.9): plan vs. build mode.
//!
//! Grounded in the original `planning_mode.py`'s read-only-posture reminder;
//! the exact wording is this engine's own (the spec only requires it
//! "clearly disables/enables destructive tools").

use sa_domain::tool::ToolDefinition;

pub const PLAN_MODE_REMINDER: &str = "[plan mode] You are in read-only planning mode. \
Tools that write, edit, or otherwise mutate the workspace are unavailable. \
Investigate and propose a plan; do not make changes.";

pub const BUILD_MODE_REMINDER: &str =
    "[build mode] Plan mode has ended. All tools are available again.";

/// Plan vs. build posture, plus the one-shot "just left plan" transition
/// flag consumed on the next user message (§4.9).
#[derive(Debug, Default)]
pub struct ModeGate {
    plan_active: bool,
    just_left_plan: bool,
}

impl ModeGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_plan_active(&self) -> bool {
        self.plan_active
    }

    /// Set plan mode to `active`. Setting to the current value is a no-op
    /// (§4.9 "setting to current value is a no-op").
    pub fn set_plan_active(&mut self, active: bool) {
        if active == self.plan_active {
            return;
        }
        if self.plan_active && !active {
            self.just_left_plan = true;
        }
        self.plan_active = active;
    }

    /// Consume (and clear) the one-shot "just left plan" flag, producing the
    /// reminder text to inject if it was set. Call this once per new user
    /// message.
    pub fn consume_transition_reminder(&mut self) -> Option<&'static str> {
        if self.just_left_plan {
            self.just_left_plan = false;
            Some(BUILD_MODE_REMINDER)
        } else {
            None
        }
    }

    /// The reminder to inject alongside the user's next message while plan
    /// mode is active.
    pub fn plan_reminder(&self) -> Option<&'static str> {
        self.plan_active.then_some(PLAN_MODE_REMINDER)
    }

    /// Filter out tools unavailable in plan mode, when plan mode is active.
    /// Outside plan mode, all tools pass through unchanged.
    pub fn filter_tools(&self, defs: Vec<ToolDefinition>) -> Vec<ToolDefinition> {
        if !self.plan_active {
            return defs;
        }
        defs.into_iter()
            .filter(|d| d.is_available_in_plan_mode())
            .collect()
    }
}
