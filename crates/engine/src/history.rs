//! HistoryStore (C8, SPEC_FULL.md §4.8 / §3).
//!
//! Owns the ordered message sequence for the life of a session and the
//! running `current_prompt_size` the engine updates after each round-trip.
//! Save/load is an external collaborator (§6); `snapshot`/`from_snapshot`
//! are the round-trip boundary, and `from_snapshot` re-validates the §3
//! well-formedness invariants so a corrupt or hand-edited session file
//! fails fast rather than silently producing an orphaned-tool-message
//! history.

use sa_domain::tool::{Message, Role};

/// A history failed the §3 well-formedness invariants.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("history must start with a single system message")]
    MissingOrMisplacedSystemMessage,
    #[error("tool message at index {0} answers unknown tool_call_id {1:?}")]
    OrphanedToolMessage(usize, String),
    #[error("tool_call_id {0:?} answered more than once before the next user message")]
    DuplicateToolAnswer(String),
    #[error("tool_call_id {0:?} never answered before the next user message")]
    UnansweredToolCall(String),
}

#[derive(Debug, Default)]
pub struct HistoryStore {
    messages: Vec<Message>,
    system_appended: bool,
    current_prompt_size: u64,
    current_prompt_size_estimated: bool,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the single system message. Must be called exactly once, at
    /// init, before any other append.
    pub fn append_system(&mut self, text: impl Into<String>) {
        assert!(
            !self.system_appended,
            "appendSystem called more than once"
        );
        assert!(self.messages.is_empty(), "system message must be index 0");
        self.messages.push(Message::system(text));
        self.system_appended = true;
    }

    pub fn append_user(&mut self, msg: Message) {
        debug_assert_eq!(msg.role, Role::User);
        self.messages.push(msg);
    }

    pub fn append_assistant(&mut self, msg: Message) {
        debug_assert_eq!(msg.role, Role::Assistant);
        self.messages.push(msg);
    }

    pub fn append_tool(&mut self, tool_call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) {
        self.messages.push(Message::tool(tool_call_id, name, content));
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// An immutable copy of the full history, in original order (§3/§6:
    /// JSON array of Message objects, original order).
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Rebuild a `HistoryStore` from a previously saved snapshot,
    /// re-validating well-formedness (§4.8).
    pub fn from_snapshot(messages: Vec<Message>) -> Result<Self, HistoryError> {
        validate_well_formed(&messages)?;
        let system_appended = matches!(messages.first(), Some(m) if m.role == Role::System);
        Ok(Self {
            messages,
            system_appended,
            current_prompt_size: 0,
            current_prompt_size_estimated: true,
        })
    }

    /// Clear everything: messages, prompt-size accounting, and the
    /// "system appended" latch, for a fresh session.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.system_appended = false;
        self.current_prompt_size = 0;
        self.current_prompt_size_estimated = false;
    }

    pub fn current_prompt_size(&self) -> u64 {
        self.current_prompt_size
    }

    pub fn current_prompt_size_estimated(&self) -> bool {
        self.current_prompt_size_estimated
    }

    /// Record the prompt size used by the most recent round-trip.
    /// `current_prompt_size` must not reset on API failure — callers simply
    /// never invoke this after a failed round-trip, so the field only ever
    /// advances to a newer measurement (§4.8).
    pub fn record_prompt_size(&mut self, size: u64, estimated: bool) {
        self.current_prompt_size = size;
        self.current_prompt_size_estimated = estimated;
    }

    /// Validate the current in-memory history against §3's invariants.
    pub fn validate(&self) -> Result<(), HistoryError> {
        validate_well_formed(&self.messages)
    }
}

/// Validate the §3 well-formedness invariants over a full message list:
/// index 0 is a single system message; every `tool_call_id` emitted by an
/// assistant message is answered exactly once by a subsequent tool message
/// before the next user message; no tool message is orphaned.
fn validate_well_formed(messages: &[Message]) -> Result<(), HistoryError> {
    if let Some(first) = messages.first() {
        if first.role != Role::System {
            return Err(HistoryError::MissingOrMisplacedSystemMessage);
        }
    }
    for (idx, m) in messages.iter().enumerate().skip(1) {
        if m.role == Role::System {
            return Err(HistoryError::MissingOrMisplacedSystemMessage);
        }
        let _ = idx;
    }

    let mut pending: Vec<String> = Vec::new();
    let mut answered_this_window: std::collections::HashSet<String> = std::collections::HashSet::new();

    for (idx, m) in messages.iter().enumerate() {
        match m.role {
            Role::User => {
                if let Some(unanswered) = pending.first() {
                    return Err(HistoryError::UnansweredToolCall(unanswered.clone()));
                }
                answered_this_window.clear();
            }
            Role::Assistant => {
                if let Some(calls) = &m.tool_calls {
                    for call in calls {
                        pending.push(call.id.clone());
                    }
                }
            }
            Role::Tool => {
                let id = m.tool_call_id.clone().unwrap_or_default();
                let pos = pending.iter().position(|p| *p == id);
                match pos {
                    Some(i) => {
                        pending.remove(i);
                        if !answered_this_window.insert(id.clone()) {
                            return Err(HistoryError::DuplicateToolAnswer(id));
                        }
                    }
                    None => {
                        if answered_this_window.contains(&id) {
                            return Err(HistoryError::DuplicateToolAnswer(id));
                        }
                        return Err(HistoryError::OrphanedToolMessage(idx, id));
                    }
                }
            }
            Role::System => {}
        }
    }
    if let Some(unanswered) = pending.first() {
        return Err(HistoryError::UnansweredToolCall(unanswered.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::tool::ToolCall;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: "read_file".into(),
            arguments_json: "{}".into(),
        }
    }

    #[test]
    fn fresh_store_validates() {
        let store = HistoryStore::new();
        assert!(store.validate().is_ok());
    }

    #[test]
    fn system_then_user_then_assistant_validates() {
        let mut store = HistoryStore::new();
        store.append_system("sys");
        store.append_user(Message::user("hi"));
        store.append_assistant(Message::assistant("hello"));
        assert!(store.validate().is_ok());
    }

    #[test]
    fn single_tool_call_answered_validates() {
        let mut store = HistoryStore::new();
        store.append_system("sys");
        store.append_user(Message::user("read a"));
        store.append_assistant(Message::assistant_with_tool_calls("", vec![call("t1")]));
        store.append_tool("t1", "read_file", "CONTENT");
        store.append_assistant(Message::assistant("done"));
        assert!(store.validate().is_ok());
    }

    #[test]
    fn two_tool_calls_answered_out_of_order_still_validates() {
        let mut store = HistoryStore::new();
        store.append_system("sys");
        store.append_user(Message::user("do two things"));
        store.append_assistant(Message::assistant_with_tool_calls(
            "",
            vec![call("t1"), call("t2")],
        ));
        // Ordering of appends is the dispatcher's job (§4.6); the store just
        // validates that both get answered once before the next user msg.
        store.append_tool("t1", "read_file", "A");
        store.append_tool("t2", "read_file", "B");
        assert!(store.validate().is_ok());
    }

    #[test]
    fn orphaned_tool_message_is_rejected() {
        let mut store = HistoryStore::new();
        store.append_system("sys");
        store.append_user(Message::user("hi"));
        store.append_tool("ghost", "read_file", "huh");
        assert!(matches!(
            store.validate(),
            Err(HistoryError::OrphanedToolMessage(_, _))
        ));
    }

    #[test]
    fn unanswered_tool_call_before_next_user_message_is_rejected() {
        let mut store = HistoryStore::new();
        store.append_system("sys");
        store.append_user(Message::user("hi"));
        store.append_assistant(Message::assistant_with_tool_calls("", vec![call("t1")]));
        store.append_user(Message::user("are you done?"));
        assert!(matches!(
            store.validate(),
            Err(HistoryError::UnansweredToolCall(_))
        ));
    }

    #[test]
    fn missing_system_message_at_index_zero_is_rejected() {
        let messages = vec![Message::user("hi")];
        assert!(matches!(
            HistoryStore::from_snapshot(messages),
            Err(HistoryError::MissingOrMisplacedSystemMessage)
        ));
    }

    #[test]
    fn from_snapshot_round_trips_a_valid_history() {
        let mut store = HistoryStore::new();
        store.append_system("sys");
        store.append_user(Message::user("hi"));
        store.append_assistant(Message::assistant("hello"));
        let snap = store.snapshot();
        let reloaded = HistoryStore::from_snapshot(snap).unwrap();
        assert_eq!(reloaded.len(), 3);
    }

    #[test]
    fn record_prompt_size_advances_and_is_read_back() {
        let mut store = HistoryStore::new();
        store.record_prompt_size(100, true);
        assert_eq!(store.current_prompt_size(), 100);
        assert!(store.current_prompt_size_estimated());
        store.record_prompt_size(250, false);
        assert_eq!(store.current_prompt_size(), 250);
        assert!(!store.current_prompt_size_estimated());
    }

    #[test]
    fn reset_clears_everything() {
        let mut store = HistoryStore::new();
        store.append_system("sys");
        store.append_user(Message::user("hi"));
        store.record_prompt_size(10, true);
        store.reset();
        assert!(store.is_empty());
        assert_eq!(store.current_prompt_size(), 0);
    }
}
