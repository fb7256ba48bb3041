//! Interfaces the engine consumes but does not own (§6): `UiSink` and
//! `ToolRegistry` are implemented by the host application; `JsonRpcTransport`
//! and `McpStdioPool` are the thin traits the `jsonrpc`/`mcp-stdio` tool
//! kinds dispatch through (§4.6) — the engine owns only the per-server
//! serialization rule above this boundary, not the transport itself.

use async_trait::async_trait;
use serde_json::Value;

use sa_domain::tool::ToolDefinition;

/// The user's answer to an approval prompt (§4.6 step 4, §8 "askApproval").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalAnswer {
    AllowOnce,
    AllowSession,
    Deny,
}

/// The terminal UI / host application, as consumed by the engine (§6).
///
/// Deliberately out of scope per §1: input line editing, key capture,
/// colored output, and animation all live on the other side of this trait.
#[async_trait]
pub trait UiSink: Send + Sync {
    /// A chunk of streamed assistant text, already whitespace-policy-filtered
    /// (§4.5).
    fn stream_chunk(&self, text: &str);

    /// A diagnostic or status notice, tagged with the taxonomy kind from §7
    /// (e.g. `"rate-limited"`, `"cancelled"`, `"stream-decode-error"`).
    fn notice(&self, kind: &str, message: &str);

    /// Ask the user whether a tool call may proceed.
    async fn ask_approval(&self, tool_name: &str, args: &Value) -> ApprovalAnswer;

    /// Invoked once, right before the engine appends the user's message.
    fn before_user_prompt(&self);

    /// Invoked once, right before the engine sends the request to the model.
    fn before_ai_prompt(&self);
}

/// The pluggable tool registry (§6). Argument *values* are never validated
/// against `json_schema` by the engine — only well-formedness of the JSON
/// the model emits (§3 ToolDefinition).
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// All definitions currently exposed to the model.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Look up one definition by name.
    fn resolve(&self, name: &str) -> Option<ToolDefinition>;

    /// Invoke an `internal`-kind tool in-process with already-parsed
    /// arguments. Returns `Err` with a human-readable message on failure;
    /// the dispatcher converts that into `ToolResult` content, never an
    /// engine error (§4.6 step 5, §7).
    async fn invoke_internal(&self, name: &str, args: Value) -> Result<String, String>;
}

/// Transport for the `jsonrpc` tool kind: a JSON-RPC 2.0 request to a
/// declared HTTP or stdio endpoint, whose response body becomes the tool
/// result content (§4.6 step 5).
#[async_trait]
pub trait JsonRpcTransport: Send + Sync {
    async fn call(&self, endpoint: &str, method: &str, params: Value) -> Result<String, String>;
}

/// Transport for the `mcp-stdio` tool kind: a JSON-RPC call sent over the
/// persistent stdio pipe of an already-launched MCP server process. The
/// engine serializes calls per server above this trait (§4.6, §5); the pool
/// itself owns the subprocess and its pipes, which is the explicitly
/// out-of-scope "MCP subprocess launcher" collaborator (§1).
#[async_trait]
pub trait McpStdioPool: Send + Sync {
    async fn call(&self, server_id: &str, method: &str, params: Value) -> Result<String, String>;
}
