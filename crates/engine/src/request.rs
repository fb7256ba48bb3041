//! RequestBuilder (C3, SPEC_FULL.md §4.3): assembles the JSON request body
//! from `History`, `Config`, and the (mode-filtered) tool definitions.
//!
//! Wire shape follows the OpenAI-compatible chat-completions contract this
//! workspace's provider adapters already speak (`sa-providers::openai_compat`),
//! adapted to this crate's own `Message`/`ToolCall` model.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use sa_domain::config::Config;
use sa_domain::tool::{ContentPart, Message, MessageContent, Role, ToolDefinition};

use crate::mode::ModeGate;

/// What to build the request body for.
pub struct RequestSpec<'a> {
    pub history: &'a [Message],
    pub config: &'a Config,
    pub tool_defs: &'a [ToolDefinition],
    pub streaming: bool,
    pub disable_tools: bool,
    pub mode: &'a ModeGate,
}

/// Build the request body per the table in §4.3. A malformed `json_schema`
/// is replaced by `{type:"object", properties:{}}` with a diagnostic
/// pushed to `diagnostics` (never a hard failure) instead of to a UI sink
/// directly, so this function stays synchronous and side-effect free; the
/// caller forwards `diagnostics` to `UiSink::notice`.
pub fn build(spec: &RequestSpec<'_>, diagnostics: &mut Vec<String>) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": spec.config.api.model,
        "messages": spec.history.iter().map(message_to_wire).collect::<Vec<_>>(),
    });

    if let Some(t) = spec.config.sampling.temperature {
        body["temperature"] = serde_json::json!(t);
    }
    if let Some(top_p) = spec.config.sampling.top_p {
        if (top_p - 1.0).abs() > f64::EPSILON {
            body["top_p"] = serde_json::json!(top_p);
        }
    }
    if let Some(top_k) = spec.config.sampling.top_k {
        if top_k != 0 {
            body["top_k"] = serde_json::json!(top_k);
        }
    }
    if let Some(rp) = spec.config.sampling.repetition_penalty {
        if (rp - 1.0).abs() > f64::EPSILON {
            body["repetition_penalty"] = serde_json::json!(rp);
        }
    }
    if let Some(max_tokens) = spec.config.sampling.max_tokens {
        body["max_tokens"] = serde_json::json!(max_tokens);
    }

    if spec.streaming {
        body["stream"] = serde_json::json!(true);
        body["stream_options"] = serde_json::json!({"include_usage": true});
    }

    if !spec.disable_tools && !spec.tool_defs.is_empty() {
        let tools: Vec<serde_json::Value> = spec
            .tool_defs
            .iter()
            .map(|d| tool_def_to_wire(d, diagnostics))
            .collect();
        body["tools"] = serde_json::Value::Array(tools);
        body["tool_choice"] = serde_json::json!("auto");

        if spec.mode.is_plan_active() {
            let names: Vec<&str> = spec
                .tool_defs
                .iter()
                .filter(|d| d.is_available_in_plan_mode())
                .map(|d| d.name.as_str())
                .collect();
            body["active_tools"] = serde_json::json!(names);
        }
    }

    body
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn message_to_wire(msg: &Message) -> serde_json::Value {
    match msg.role {
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
            "content": msg.content.extract_all_text(),
        }),
        Role::Assistant => {
            let mut obj = serde_json::json!({"role": "assistant"});
            let text = msg.content.extract_all_text();
            obj["content"] = if text.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::Value::String(text)
            };
            if let Some(calls) = &msg.tool_calls {
                if !calls.is_empty() {
                    obj["tool_calls"] = serde_json::Value::Array(
                        calls
                            .iter()
                            .map(|c| {
                                serde_json::json!({
                                    "id": c.id,
                                    "type": "function",
                                    "function": {
                                        "name": c.name,
                                        "arguments": c.arguments_json,
                                    }
                                })
                            })
                            .collect(),
                    );
                }
            }
            obj
        }
        _ => serde_json::json!({
            "role": role_str(msg.role),
            "content": content_to_wire(&msg.content),
        }),
    }
}

/// Multipart content (text + image parts) renders as an array of content
/// parts when there's more than plain text; otherwise a bare string.
fn content_to_wire(content: &MessageContent) -> serde_json::Value {
    match content {
        MessageContent::Text(t) => serde_json::Value::String(t.clone()),
        MessageContent::Parts(parts) => serde_json::Value::Array(
            parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => {
                        serde_json::json!({"type": "text", "text": text})
                    }
                    ContentPart::Image { mime, bytes } => serde_json::json!({
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:{mime};base64,{}", B64.encode(bytes)),
                        }
                    }),
                })
                .collect(),
        ),
    }
}

/// Tool definitions are validated for JSON-serializability; a malformed
/// `parameters` object is replaced with an empty-object schema and a
/// diagnostic, never a hard failure (§4.3).
fn tool_def_to_wire(def: &ToolDefinition, diagnostics: &mut Vec<String>) -> serde_json::Value {
    let parameters = if is_valid_json_schema_shape(&def.json_schema) {
        def.json_schema.clone()
    } else {
        diagnostics.push(format!(
            "tool {:?}: malformed parameters schema, replaced with an empty object schema",
            def.name
        ));
        serde_json::json!({"type": "object", "properties": {}})
    };

    serde_json::json!({
        "type": "function",
        "function": {
            "name": def.name,
            "description": def.description,
            "parameters": parameters,
        }
    })
}

fn is_valid_json_schema_shape(value: &serde_json::Value) -> bool {
    value.is_object()
}
