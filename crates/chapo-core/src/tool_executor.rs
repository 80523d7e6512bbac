// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool Executor (C4, §4.4).
//!
//! Builds on `chapo_tools::{Tool, ToolRegistry, ApprovalPolicy}`, adding the
//! action-pending suspend/resume bridge the registry's plain `Auto/Ask/Deny`
//! dispatch does not provide on its own.

use std::collections::HashMap;
use std::sync::Mutex;

use chapo_tools::{ApprovalPolicy, ToolCall, ToolOutput, ToolRegistry};
use uuid::Uuid;

/// Names listed in a tool's JSON-Schema `"required"` array whose own
/// `properties` entry is typed `"string"` — the subset `preflight` can
/// actually validate (it checks for a non-empty string value).
fn required_string_fields_of(schema: &serde_json::Value) -> Vec<String> {
    let required = schema.get("required").and_then(|v| v.as_array());
    let properties = schema.get("properties");
    match (required, properties) {
        (Some(required), Some(properties)) => required
            .iter()
            .filter_map(|v| v.as_str())
            .filter(|name| properties.get(name).and_then(|p| p.get("type")).and_then(|t| t.as_str()) == Some("string"))
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Normalized outcome of one tool invocation, duck-typed over whatever shape
/// the underlying tool actually returned (§9, "Duck-typed tool outputs").
#[derive(Debug, Clone)]
pub struct NormalizedToolOutcome {
    pub success: bool,
    pub pending_approval: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl NormalizedToolOutcome {
    /// Parse a raw [`ToolOutput`] into the normalized quadruple.
    ///
    /// Tries `{success, result}`/`{success, error}` envelopes first; falls
    /// back to treating the whole payload as a raw success value. A nested
    /// `success: false` inside an otherwise non-error `ToolOutput` is still
    /// treated as failed (§4.4).
    pub fn from_tool_output(out: &ToolOutput) -> Self {
        if out.is_error {
            return Self { success: false, pending_approval: false, data: None, error: Some(out.content.clone()) };
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&out.content) {
            if let Some(obj) = value.as_object() {
                if let Some(success) = obj.get("success").and_then(|v| v.as_bool()) {
                    let error = obj.get("error").and_then(|v| v.as_str()).map(str::to_string);
                    let result = obj.get("result").cloned().unwrap_or(value.clone());
                    return Self { success, pending_approval: false, data: Some(result), error };
                }
            }
            return Self { success: true, pending_approval: false, data: Some(value), error: None };
        }
        Self {
            success: true,
            pending_approval: false,
            data: Some(serde_json::Value::String(out.content.clone())),
            error: None,
        }
    }
}

/// A privileged tool call suspended pending user approval.
#[derive(Debug, Clone)]
pub struct PendingAction {
    pub action_id: String,
    pub tool_name: String,
    pub call: ToolCall,
    pub description: String,
}

/// Executes tool calls through a registry, bridging privileged (`Ask`-policy)
/// tools through an internal suspend/resume step instead of blocking inline.
pub struct ToolExecutor {
    registry: std::sync::Arc<ToolRegistry>,
    pending: Mutex<HashMap<String, PendingAction>>,
}

impl ToolExecutor {
    pub fn new(registry: std::sync::Arc<ToolRegistry>) -> Self {
        Self { registry, pending: Mutex::new(HashMap::new()) }
    }

    /// Execute `call`. Privileged tools (`ApprovalPolicy::Ask`) are not run;
    /// instead an `action_pending` record is stored and the outcome carries
    /// `pending_approval = true`. Non-privileged tools run synchronously.
    pub async fn execute(&self, call: &ToolCall) -> (NormalizedToolOutcome, Option<PendingAction>) {
        let tool = match self.registry.get(&call.name) {
            Some(t) => t,
            None => {
                return (
                    NormalizedToolOutcome {
                        success: false,
                        pending_approval: false,
                        data: None,
                        error: Some(format!("unknown tool: {}", call.name)),
                    },
                    None,
                );
            }
        };

        if tool.default_policy() == ApprovalPolicy::Deny {
            return (
                NormalizedToolOutcome {
                    success: false,
                    pending_approval: false,
                    data: None,
                    error: Some(format!("tool '{}' is denied by policy", call.name)),
                },
                None,
            );
        }

        if tool.default_policy() == ApprovalPolicy::Ask {
            let required_fields = required_string_fields_of(&tool.parameters_schema());
            let required: Vec<&str> = required_fields.iter().map(String::as_str).collect();
            if let Err(err) = Self::preflight(call, &required) {
                return (NormalizedToolOutcome { success: false, pending_approval: false, data: None, error: Some(err) }, None);
            }

            let action_id = Uuid::new_v4().to_string();
            let pending = PendingAction {
                action_id: action_id.clone(),
                tool_name: call.name.clone(),
                call: call.clone(),
                description: format!("run `{}` with {}", call.name, call.args),
            };
            self.pending.lock().unwrap().insert(action_id.clone(), pending.clone());
            return (
                NormalizedToolOutcome { success: false, pending_approval: true, data: None, error: None },
                Some(pending),
            );
        }

        let output = tool.execute(call).await;
        (NormalizedToolOutcome::from_tool_output(&output), None)
    }

    /// Resolve a previously suspended privileged call. Returns `None` if
    /// `action_id` is unknown (already resolved, or never issued).
    pub async fn resolve_approval(&self, action_id: &str, approved: bool) -> Option<NormalizedToolOutcome> {
        let pending = self.pending.lock().unwrap().remove(action_id)?;
        if !approved {
            return Some(NormalizedToolOutcome {
                success: false,
                pending_approval: false,
                data: None,
                error: Some("user denied approval".into()),
            });
        }
        let tool = self.registry.get(&pending.tool_name)?;
        let output = tool.execute(&pending.call).await;
        Some(NormalizedToolOutcome::from_tool_output(&output))
    }

    /// Preflight validation for external-action tools handled by sub-agents:
    /// verify required string fields are present before any execution is
    /// attempted. On failure, no tool call is made.
    pub fn preflight(call: &ToolCall, required_fields: &[&str]) -> Result<(), String> {
        for field in required_fields {
            match call.args.get(*field).and_then(|v| v.as_str()) {
                Some(s) if !s.trim().is_empty() => {}
                _ => return Err(format!("missing or empty required field '{field}'")),
            }
        }
        Ok(())
    }
}
