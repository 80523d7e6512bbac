// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Sub-Agent Runner (C5, §4.5).
//!
//! Generalizes the teacher's `task_tool.rs` (`MAX_DEPTH`-bounded nesting,
//! `build_sub_registry()` excluding recursive tools, fresh per-call agent
//! construction) from a single generic "mode" sub-agent into three named
//! identities, each with its own system prompt (C11) and tool allow-list,
//! and from plain-text output accumulation into per-tool-call evidence
//! accounting.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;

use chapo_model::{CompletionRequest, Message, ModelProvider, ResponseEvent, ToolSchema};
use chapo_tools::{ToolCall as RegistryToolCall, ToolRegistry};

use crate::error_handler::ErrorHandler;
use crate::prompts::sub_agent_system_prompt;
use crate::tool_executor::ToolExecutor;
use crate::types::{Delegation, DelegationStatus, EvidenceItem, SubAgentResult, derive_delegation_status};

/// Default bound on sub-agent turns (§4.5, §6 `maxSubTurns`).
pub const MAX_TURNS_SUB_DEFAULT: u32 = 10;

const ESCALATE_TOOL_NAME: &str = "escalateToChapo";

fn escalate_tool_schema() -> ToolSchema {
    ToolSchema {
        name: ESCALATE_TOOL_NAME.to_string(),
        description: "Escalate this delegation back to the coordinator when the task falls \
                       outside your responsibility or needs a coordinator-level decision."
            .to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": { "reason": { "type": "string" } },
            "required": ["reason"]
        }),
    }
}

/// `chapo_tools::ToolSchema` and `chapo_model::ToolSchema` carry the same
/// three fields but are distinct types so the tools crate stays independent
/// of the model crate; this is the one conversion point between them.
pub(crate) fn to_model_schemas(schemas: Vec<chapo_tools::ToolSchema>) -> Vec<ToolSchema> {
    schemas
        .into_iter()
        .map(|s| ToolSchema { name: s.name, description: s.description, parameters: s.parameters })
        .collect()
}

#[derive(Default, Clone)]
struct PendingCall {
    id: String,
    name: String,
    args_buf: String,
}

fn objective_prompt(delegation: &Delegation) -> String {
    let mut out = format!("Objective: {}\n", delegation.objective);
    if let Some(outcome) = &delegation.expected_outcome {
        out.push_str(&format!("Expected Outcome: {outcome}\n"));
    }
    if !delegation.constraints.is_empty() {
        out.push_str(&format!("Constraints: {}\n", delegation.constraints.join("; ")));
    }
    if !delegation.context_facts.is_empty() {
        out.push_str(&format!("Context Facts: {}\n", delegation.context_facts.join("; ")));
    }
    if let Some(ctx) = &delegation.context {
        out.push_str(&format!("Context: {ctx}\n"));
    }
    if let Some(scope) = delegation.scope {
        out.push_str(&format!("Research Scope: {scope:?}\n"));
    }
    out
}

pub(crate) fn external_id_from(data: &Option<serde_json::Value>) -> Option<String> {
    let obj = data.as_ref()?.as_object()?;
    for key in ["messageId", "ticketId", "eventId"] {
        if let Some(v) = obj.get(key).and_then(|v| v.as_str()) {
            return Some(v.to_string());
        }
    }
    None
}

pub(crate) fn summarize(data: &Option<serde_json::Value>, error: &Option<String>) -> String {
    if let Some(e) = error {
        return e.clone();
    }
    match data {
        Some(serde_json::Value::String(s)) => truncate(s, 160),
        Some(v) => truncate(&v.to_string(), 160),
        None => "ok".to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{head}…")
    }
}

/// Runs one delegation through a bounded decision sub-loop against a
/// reduced, allow-listed view of the shared tool registry.
pub struct SubAgentRunner {
    model: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    executor: ToolExecutor,
    error_handler: Arc<ErrorHandler>,
    max_turns: u32,
}

impl SubAgentRunner {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        error_handler: Arc<ErrorHandler>,
        max_turns: u32,
    ) -> Self {
        let executor = ToolExecutor::new(tools.clone());
        Self { model, tools, executor, error_handler, max_turns }
    }

    /// Run `delegation` to completion, a turn limit, or an escalation.
    pub async fn run(&self, delegation: &Delegation, allowlist: &HashSet<String>) -> SubAgentResult {
        let mut messages = vec![
            Message::system(sub_agent_system_prompt(delegation.target)),
            Message::user(objective_prompt(delegation)),
        ];

        let mut schemas = to_model_schemas(self.tools.schemas_for_allowlist(allowlist));
        schemas.push(escalate_tool_schema());

        let mut evidence: Vec<EvidenceItem> = Vec::new();
        let recommendations: Vec<String> = Vec::new();

        for turn in 0..self.max_turns {
            let req = CompletionRequest {
                messages: messages.clone(),
                tools: schemas.clone(),
                stream: true,
                system_dynamic_suffix: None,
            };

            let op_key = format!("sub_agent:{}:{turn}", delegation.target);
            let model = self.model.clone();
            let (stream, err) = self.error_handler.safe(&op_key, || model.complete(req)).await;
            let mut stream = match stream {
                Some(s) => s,
                None => {
                    let detail = err.map(|e| e.to_string()).unwrap_or_default();
                    let status = derive_delegation_status(&evidence, false, false);
                    return SubAgentResult {
                        status,
                        response: format!("model call failed: {detail}"),
                        evidence,
                        escalation: None,
                        recommendations,
                    };
                }
            };

            let mut full_text = String::new();
            let mut pending: HashMap<usize, PendingCall> = HashMap::new();
            while let Some(event) = stream.next().await {
                match event {
                    Ok(ResponseEvent::TextDelta(delta)) => full_text.push_str(&delta),
                    Ok(ResponseEvent::ToolCall { index, id, name, arguments }) => {
                        let entry = pending.entry(index).or_default();
                        if !id.is_empty() {
                            entry.id = id;
                        }
                        if !name.is_empty() {
                            entry.name = name;
                        }
                        entry.args_buf.push_str(&arguments);
                    }
                    Ok(ResponseEvent::Done) => break,
                    Ok(_) => {}
                    Err(_) => {}
                }
            }

            let mut indexed: Vec<(usize, PendingCall)> = pending.into_iter().collect();
            indexed.sort_by_key(|(idx, _)| *idx);
            let tool_calls: Vec<PendingCall> = indexed.into_iter().map(|(_, c)| c).collect();

            if tool_calls.is_empty() {
                let has_content = !full_text.trim().is_empty();
                let status = derive_delegation_status(&evidence, false, has_content);
                return SubAgentResult { status, response: full_text, evidence, escalation: None, recommendations };
            }

            if !full_text.is_empty() {
                messages.push(Message::assistant(full_text));
            }
            for tc in &tool_calls {
                messages.push(Message {
                    role: chapo_model::Role::Assistant,
                    content: chapo_model::MessageContent::ToolCall {
                        tool_call_id: tc.id.clone(),
                        function: chapo_model::FunctionCall { name: tc.name.clone(), arguments: tc.args_buf.clone() },
                    },
                });
            }

            if let Some(escalated) = tool_calls.iter().find(|tc| tc.name == ESCALATE_TOOL_NAME) {
                let reason = serde_json::from_str::<serde_json::Value>(&escalated.args_buf)
                    .ok()
                    .and_then(|v| v.get("reason").and_then(|r| r.as_str()).map(str::to_string))
                    .unwrap_or_else(|| "sub-agent requested escalation".to_string());
                return SubAgentResult {
                    status: DelegationStatus::Escalated,
                    response: reason.clone(),
                    evidence,
                    escalation: Some(reason),
                    recommendations,
                };
            }

            for tc in &tool_calls {
                let args = serde_json::from_str::<serde_json::Value>(&tc.args_buf)
                    .unwrap_or_else(|_| serde_json::json!({}));
                if !allowlist.contains(&tc.name) {
                    let msg = format!("{} is outside this agent's tool allow-list", tc.name);
                    messages.push(Message::tool_result(&tc.id, format!("Error: {msg}")));
                    evidence.push(EvidenceItem {
                        tool_name: tc.name.clone(),
                        success: false,
                        pending_approval: false,
                        external_id: None,
                        summary: msg,
                        error: Some("tool outside allow-list".to_string()),
                        timestamp: chrono::Utc::now().to_rfc3339(),
                    });
                    continue;
                }

                let call = RegistryToolCall { id: tc.id.clone(), name: tc.name.clone(), args };
                let (outcome, _pending_action) = self.executor.execute(&call).await;
                let content = if outcome.pending_approval {
                    "pending user approval".to_string()
                } else if outcome.success {
                    summarize(&outcome.data, &None)
                } else {
                    format!("Error: {}", outcome.error.clone().unwrap_or_else(|| "tool failed".into()))
                };
                messages.push(Message::tool_result(&tc.id, content));

                evidence.push(EvidenceItem {
                    tool_name: tc.name.clone(),
                    success: outcome.success,
                    pending_approval: outcome.pending_approval,
                    external_id: external_id_from(&outcome.data),
                    summary: summarize(&outcome.data, &outcome.error),
                    error: outcome.error.clone(),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                });
            }
        }

        let status = derive_delegation_status(&evidence, false, false);
        SubAgentResult {
            status,
            response: format!("sub-agent turn limit ({}) reached without a final answer", self.max_turns),
            evidence,
            escalation: None,
            recommendations,
        }
    }
}
