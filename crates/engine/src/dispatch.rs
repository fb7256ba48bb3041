//! ToolDispatcher (C6, SPEC_FULL.md §4.6).
//!
//! Resolves, parses, mode-checks, approves, executes and normalizes one
//! `ToolCall` into a `ToolResult`, then fans the per-message batch out
//! across eligible calls in parallel while reassembling results in the
//! assistant message's original order.
//!
//! `internal`/`command` execution is grounded in
//! `sa-gateway::runtime::tools::dispatch_tool` and `sa-tools::exec::exec`'s
//! `tokio::process::Command` usage; `jsonrpc`/`mcp-stdio` dispatch through
//! the thin trait boundary in `collaborators.rs`.

use std::collections::HashSet;
use std::process::Stdio;

use sa_domain::tool::{ToolCall, ToolDefinition, ToolKind, ToolResult};

use crate::approval::{fingerprint, ApprovalCache};
use crate::cancel::{CancelScope, CancelSignal};
use crate::collaborators::{ApprovalAnswer, JsonRpcTransport, McpStdioPool, ToolRegistry, UiSink};
use crate::mode::ModeGate;

pub struct ToolDispatcher<'a> {
    pub registry: &'a dyn ToolRegistry,
    pub ui: &'a dyn UiSink,
    /// Behind a lock so a prompted `allow-session` answer can be recorded
    /// from `dispatch_one` without requiring `&mut self` — `dispatch_all`'s
    /// parallel branch holds only shared borrows of `self` while its calls
    /// race inside `join_all`.
    pub approvals: &'a parking_lot::Mutex<ApprovalCache>,
    pub mode: &'a ModeGate,
    pub yolo_mode: bool,
    pub jsonrpc: Option<&'a dyn JsonRpcTransport>,
    pub mcp: Option<&'a dyn McpStdioPool>,
}

impl<'a> ToolDispatcher<'a> {
    /// Dispatch every tool call in one assistant message, in original
    /// order, parallelizing where §4.6's eligibility rules allow it.
    #[tracing::instrument(skip(self, calls, cancel), fields(n = calls.len()))]
    pub async fn dispatch_all(
        &self,
        calls: &[ToolCall],
        cancel: &CancelSignal,
    ) -> Vec<ToolResult> {
        let defs: Vec<Option<ToolDefinition>> =
            calls.iter().map(|c| self.registry.resolve(&c.name)).collect();

        if self.all_parallel_eligible(calls, &defs) {
            tracing::debug!("dispatching tool calls in parallel");
            let mut futures = Vec::with_capacity(calls.len());
            for (call, def) in calls.iter().zip(defs.iter()) {
                futures.push(self.dispatch_one(call, def.clone(), cancel));
            }
            futures_util::future::join_all(futures).await
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for (call, def) in calls.iter().zip(defs.iter()) {
                results.push(self.dispatch_one(call, def.clone(), cancel).await);
            }
            results
        }
    }

    /// §4.6's parallel-eligibility rule: none may need interactive
    /// approval, none may be `serialize:true`, and no two may target the
    /// same mcp-stdio server.
    fn all_parallel_eligible(&self, calls: &[ToolCall], defs: &[Option<ToolDefinition>]) -> bool {
        if calls.len() < 2 {
            return false;
        }
        let mut seen_mcp_servers: HashSet<String> = HashSet::new();
        for (call, def) in calls.iter().zip(defs.iter()) {
            let Some(def) = def else { continue };
            if def.serialize {
                return false;
            }
            if !self.is_pre_approved(def, call) {
                return false;
            }
            if def.kind == ToolKind::McpStdio {
                if let Some(server) = &def.mcp_server_id {
                    if !seen_mcp_servers.insert(server.clone()) {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn is_pre_approved(&self, def: &ToolDefinition, call: &ToolCall) -> bool {
        if def.auto_approved || self.yolo_mode {
            return true;
        }
        match serde_json::from_str::<serde_json::Value>(&call.arguments_json) {
            Ok(args) => self.approvals.lock().contains(&fingerprint(def, &args)),
            Err(_) => false,
        }
    }

    #[tracing::instrument(skip(self, call, def, cancel), fields(tool_name = %call.name))]
    async fn dispatch_one(
        &self,
        call: &ToolCall,
        def: Option<ToolDefinition>,
        cancel: &CancelSignal,
    ) -> ToolResult {
        // Step 1: resolve.
        let Some(def) = def else {
            tracing::warn!("unknown tool requested by model");
            return ToolResult::new(
                call.id.clone(),
                format!("Error: unknown tool {:?}", call.name),
            );
        };

        // Step 2: parse arguments.
        let args: serde_json::Value = match serde_json::from_str(&call.arguments_json) {
            Ok(v) => v,
            Err(e) => {
                return ToolResult::new(
                    call.id.clone(),
                    format!("Error: malformed arguments for {:?}: {e}", def.name),
                );
            }
        };

        // Step 3: mode check.
        if self.mode.is_plan_active() && !def.is_available_in_plan_mode() {
            return ToolResult::new(
                call.id.clone(),
                format!(
                    "Error: {:?} is unavailable in plan mode (read-only)",
                    def.name
                ),
            );
        }

        // Step 4: approval.
        if !def.auto_approved && !self.yolo_mode {
            let fp = fingerprint(&def, &args);
            if !self.approvals.lock().contains(&fp) {
                if cancel.is_raised(CancelScope::ToolCall) {
                    return ToolResult::new(call.id.clone(), "Tool call cancelled".to_string());
                }
                match self.ui.ask_approval(&def.name, &args).await {
                    ApprovalAnswer::Deny => {
                        return ToolResult::new(
                            call.id.clone(),
                            "Tool call rejected by user".to_string(),
                        );
                    }
                    ApprovalAnswer::AllowOnce => {}
                    ApprovalAnswer::AllowSession => {
                        self.approvals.lock().add(fp);
                    }
                }
            }
        }

        // Step 5: execute by kind. Success and failure both become plain
        // `ToolResult` content (§4.6 step 6) — nothing downstream of the
        // dispatcher distinguishes an error tool result from any other.
        let content = match def.kind {
            ToolKind::Internal => match self.registry.invoke_internal(&def.name, args).await {
                Ok(out) => out,
                Err(e) => e,
            },
            ToolKind::Command => self.execute_command(&def, &args).await,
            ToolKind::Jsonrpc => match self.jsonrpc {
                Some(transport) => {
                    let endpoint = def.command_argv.as_ref().and_then(|v| v.first());
                    match endpoint {
                        Some(endpoint) => match transport.call(endpoint, &def.name, args).await {
                            Ok(out) => out,
                            Err(e) => e,
                        },
                        None => format!("Error: {:?} has no declared jsonrpc endpoint", def.name),
                    }
                }
                None => "Error: no jsonrpc transport configured".to_string(),
            },
            ToolKind::McpStdio => match self.mcp {
                Some(pool) => {
                    let server = def.mcp_server_id.clone().unwrap_or_default();
                    match pool.call(&server, &def.name, args).await {
                        Ok(out) => out,
                        Err(e) => e,
                    }
                }
                None => "Error: no mcp-stdio pool configured".to_string(),
            },
        };

        ToolResult::new(call.id.clone(), content)
    }

    /// Spawn the declared argv template, substituting `{name}` placeholders
    /// from the parsed arguments, and capture combined stdout+stderr.
    async fn execute_command(&self, def: &ToolDefinition, args: &serde_json::Value) -> String {
        let Some(argv) = &def.command_argv else {
            return format!("Error: {:?} has no declared command argv template", def.name);
        };
        if argv.is_empty() {
            return format!("Error: {:?} has an empty argv template", def.name);
        }

        let substituted: Vec<String> = argv.iter().map(|part| substitute(part, args)).collect();

        let mut cmd = tokio::process::Command::new(&substituted[0]);
        cmd.args(&substituted[1..]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = match cmd.output().await {
            Ok(o) => o,
            Err(e) => return format!("Error: failed to spawn {:?}: {e}", substituted[0]),
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        if output.status.success() {
            combined
        } else {
            let code = output.status.code().unwrap_or(-1);
            format!("command exited with status {code}\n{combined}")
        }
    }
}

/// Replace every `{field}` placeholder with the string form of the matching
/// top-level argument. A missing field is replaced with an empty string.
fn substitute(template: &str, args: &serde_json::Value) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i..].find('}') {
                let field = &template[i + 1..i + end];
                let value = args.get(field).map(value_to_string).unwrap_or_default();
                out.push_str(&value);
                i += end + 1;
                continue;
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

fn value_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
