use serde::{Deserialize, Serialize};

/// One user input and the chain of assistant/tool messages it induces, up to
/// the next user input. A `Message` is created once and never mutated after
/// append, except that an in-flight assistant message may be extended by the
/// stream decoder and then sealed; sealed messages are immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    /// Only meaningful for `role == Assistant`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Only meaningful for `role == Tool`: the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Only meaningful for `role == Tool`: the name of the tool invoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Either plain text or an ordered list of content parts. Only user and
/// assistant messages may be multipart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { mime: String, bytes: Vec<u8> },
}

/// A request, emitted by the model inside an assistant message, to invoke a
/// named tool with JSON arguments. `id` is unique within the assistant
/// message that carries it; if the provider omits one, `StreamDecoder`
/// synthesizes a stable one. `arguments_json` is the exact string the model
/// emitted — parsing is deferred to `ToolDispatcher` so malformed JSON
/// surfaces as a structured tool result, never as a panic or engine error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments_json: String,
}

/// The outcome of dispatching one `ToolCall`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    /// Appended to history as the tool message body.
    pub content: String,
    /// Suppresses UI display but not history.
    #[serde(default)]
    pub hidden: bool,
    /// Optional follow-up text appended as a user message to steer the next
    /// turn (e.g. "file was truncated, ask before reading more").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
}

impl ToolResult {
    pub fn new(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            hidden: false,
            guidance: None,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.guidance = Some(guidance.into());
        self
    }
}

/// How a tool kind is executed. `Internal` and `Command` are implemented in
/// this workspace; `Jsonrpc` and `McpStdio` are dispatched against a trait
/// boundary owned by an external collaborator (the MCP launcher, out of
/// scope per the engine's charter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolKind {
    Internal,
    Command,
    Jsonrpc,
    McpStdio,
}

/// How `ApprovalCache` computes a fingerprint's argument component for a
/// tool. Mirrors the three cases named in §4.7 of the spec: the default
/// (sorted-key canonical JSON of the arguments), a tool that ignores
/// arguments entirely, and a tool that ignores only a named subset of
/// fields (e.g. a `reason` field that varies every call but doesn't change
/// the blast radius of the operation).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKeyPolicy {
    Default,
    ExcludesArguments,
    ExcludeFields(Vec<String>),
}

impl Default for ApprovalKeyPolicy {
    fn default() -> Self {
        ApprovalKeyPolicy::Default
    }
}

impl ApprovalKeyPolicy {
    /// Compute the approval-key component of a fingerprint for `args`.
    pub fn approval_key(&self, args: &serde_json::Value) -> String {
        match self {
            ApprovalKeyPolicy::ExcludesArguments => String::new(),
            ApprovalKeyPolicy::Default => canonical_json(args),
            ApprovalKeyPolicy::ExcludeFields(fields) => {
                let mut pruned = args.clone();
                if let serde_json::Value::Object(map) = &mut pruned {
                    for f in fields {
                        map.remove(f);
                    }
                }
                canonical_json(&pruned)
            }
        }
    }
}

/// Deterministic JSON encoding with sorted object keys, used for fingerprint
/// and token-estimation hashing.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut sorted: Vec<_> = map.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, v) in sorted {
                    out.insert(k.clone(), sort(v));
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(value)).unwrap_or_default()
}

/// `{name, kind, description, jsonSchema, autoApproved, approvalKey,
/// hideResults, availableInPlanMode}`. The schema is what the model sees;
/// the engine never validates argument *values* against it, only
/// well-formedness of the JSON the model emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub kind: ToolKind,
    pub description: String,
    pub json_schema: serde_json::Value,
    #[serde(default)]
    pub auto_approved: bool,
    #[serde(default)]
    pub approval_key: ApprovalKeyPolicy,
    #[serde(default)]
    pub hide_results: bool,
    /// `None` means "deny-list governs" (§9.1.2 of SPEC_FULL.md); `Some`
    /// overrides the deny-list in either direction.
    #[serde(default)]
    pub available_in_plan_mode: Option<bool>,
    /// Command-kind only: argv template, `{name}` placeholders substituted
    /// from parsed arguments before spawning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_argv: Option<Vec<String>>,
    /// When true, calls to this tool are never run in parallel with any
    /// other tool call in the same assistant message turn (§4.6).
    #[serde(default)]
    pub serialize: bool,
    /// mcp-stdio only: which server this tool's calls must be serialized
    /// against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_server_id: Option<String>,
}

/// The built-in deny-list of write-kind tools consulted when a tool does not
/// declare `available_in_plan_mode` at all (§4.9, §9.1.2).
pub const PLAN_MODE_DENY_LIST: &[&str] = &["write", "edit", "backup"];

impl ToolDefinition {
    /// Whether this tool may run while plan mode is active.
    pub fn is_available_in_plan_mode(&self) -> bool {
        match self.available_in_plan_mode {
            Some(flag) => flag,
            None => !PLAN_MODE_DENY_LIST.contains(&self.name.as_str()),
        }
    }
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant_with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Text(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        matches!(&self.tool_calls, Some(calls) if !calls.is_empty())
    }
}

impl MessageContent {
    /// Extract the plain-text content (first text part, or the full text).
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(t) => Some(t.as_str()),
            MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            }),
        }
    }

    /// Extract and join all text content, returning an owned String.
    pub fn extract_all_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_all_text_from_text_variant() {
        let content = MessageContent::Text("hello world".into());
        assert_eq!(content.extract_all_text(), "hello world");
    }

    #[test]
    fn extract_all_text_from_parts_joins_with_newline() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text { text: "line one".into() },
            ContentPart::Image { mime: "image/png".into(), bytes: vec![1, 2, 3] },
            ContentPart::Text { text: "line two".into() },
        ]);
        assert_eq!(content.extract_all_text(), "line one\nline two");
    }

    #[test]
    fn extract_all_text_empty_parts() {
        let content = MessageContent::Parts(vec![]);
        assert_eq!(content.extract_all_text(), "");
    }

    #[test]
    fn has_tool_calls_false_when_none() {
        let msg = Message::assistant("hi");
        assert!(!msg.has_tool_calls());
    }

    #[test]
    fn has_tool_calls_false_when_empty_vec() {
        let msg = Message::assistant_with_tool_calls("hi", vec![]);
        assert!(!msg.has_tool_calls());
    }

    #[test]
    fn has_tool_calls_true() {
        let msg = Message::assistant_with_tool_calls(
            "",
            vec![ToolCall {
                id: "t1".into(),
                name: "read_file".into(),
                arguments_json: "{}".into(),
            }],
        );
        assert!(msg.has_tool_calls());
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn approval_key_excludes_arguments() {
        let policy = ApprovalKeyPolicy::ExcludesArguments;
        assert_eq!(policy.approval_key(&serde_json::json!({"path": "a"})), "");
        assert_eq!(policy.approval_key(&serde_json::json!({"path": "b"})), "");
    }

    #[test]
    fn approval_key_exclude_fields_ignores_named_field() {
        let policy = ApprovalKeyPolicy::ExcludeFields(vec!["reason".into()]);
        let k1 = policy.approval_key(&serde_json::json!({"path": "a", "reason": "x"}));
        let k2 = policy.approval_key(&serde_json::json!({"path": "a", "reason": "y"}));
        assert_eq!(k1, k2);
    }

    #[test]
    fn plan_mode_deny_list_applies_when_flag_absent() {
        let def = ToolDefinition {
            name: "write".into(),
            kind: ToolKind::Internal,
            description: String::new(),
            json_schema: serde_json::json!({}),
            auto_approved: false,
            approval_key: ApprovalKeyPolicy::Default,
            hide_results: false,
            available_in_plan_mode: None,
            command_argv: None,
            serialize: false,
            mcp_server_id: None,
        };
        assert!(!def.is_available_in_plan_mode());
    }

    #[test]
    fn explicit_flag_overrides_deny_list() {
        let mut def = ToolDefinition {
            name: "write".into(),
            kind: ToolKind::Internal,
            description: String::new(),
            json_schema: serde_json::json!({}),
            auto_approved: false,
            approval_key: ApprovalKeyPolicy::Default,
            hide_results: false,
            available_in_plan_mode: Some(true),
            command_argv: None,
            serialize: false,
            mcp_server_id: None,
        };
        assert!(def.is_available_in_plan_mode());
        def.available_in_plan_mode = Some(false);
        def.name = "read_file".into();
        assert!(!def.is_available_in_plan_mode());
    }

    #[test]
    fn non_deny_list_tool_defaults_to_available() {
        let def = ToolDefinition {
            name: "read_file".into(),
            kind: ToolKind::Internal,
            description: String::new(),
            json_schema: serde_json::json!({}),
            auto_approved: true,
            approval_key: ApprovalKeyPolicy::Default,
            hide_results: false,
            available_in_plan_mode: None,
            command_argv: None,
            serialize: false,
            mcp_server_id: None,
        };
        assert!(def.is_available_in_plan_mode());
    }
}
