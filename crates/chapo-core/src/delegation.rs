// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Delegation Runner (C6, §4.6).
//!
//! Dependency-injected via an explicit [`DelegationRunnerDeps`] record rather
//! than a singleton, the way the pack's Krusty orchestrator example splits
//! `OrchestratorServices`/`OrchestratorConfig` out of its agentic loop.
//! Parallel fan-out wraps each sub-agent run in its own `tokio::spawn` and
//! folds a `JoinError` into a `Failed` result rather than propagating it, so
//! one panicking task cannot poison its siblings (§9).

use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::session::{SessionStore, StreamEventKind};
use crate::sub_agent::SubAgentRunner;
use crate::types::{Delegation, DelegationStatus, DelegationTarget, ResearchScope, SessionId, SubAgentResult};

static BACKTICKED_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`[a-zA-Z][a-zA-Z0-9_]*`").unwrap());

const RESERVED_TOOL_NAMES: &[&str] =
    &["askUser", "requestApproval", "delegateParallel", "delegateToDevo", "delegateToCaio", "delegateToScout"];

/// Strip concrete tool names the coordinator may have echoed into an
/// objective before handing it to a sub-agent, which must never see them
/// (§4.6, §4.11).
fn sanitize_objective(raw: &str) -> String {
    let mut out = BACKTICKED_NAME_RE.replace_all(raw, "").to_string();
    for reserved in RESERVED_TOOL_NAMES {
        out = out.replace(reserved, "");
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn string_array(v: Option<&serde_json::Value>) -> Vec<String> {
    v.and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|x| x.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

/// Build a [`Delegation`] from a single-delegation tool-call's arguments
/// (§4.6: domain normalization, objective sanitization, string-array parsing,
/// expected-outcome carry-through, research-scope parsing).
pub fn parse_delegation_args(target: DelegationTarget, args: &serde_json::Value) -> Delegation {
    let raw_objective = args
        .get("objective")
        .or_else(|| args.get("task"))
        .or_else(|| args.get("query"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    Delegation {
        target,
        domain: args.get("domain").and_then(|v| v.as_str()).map(str::to_string).unwrap_or_else(|| target.domain().to_string()),
        objective: sanitize_objective(raw_objective),
        expected_outcome: args.get("expectedOutcome").and_then(|v| v.as_str()).map(str::to_string),
        constraints: string_array(args.get("constraints")),
        context_facts: string_array(args.get("contextFacts")),
        context: args.get("context").and_then(|v| v.as_str()).map(str::to_string),
        scope: args.get("scope").and_then(|v| v.as_str()).and_then(ResearchScope::parse),
    }
}

/// Parse the `delegateParallel` tool-call's argument array (§6, "Parallel-
/// delegation JSON input"). Entries naming an unrecognized `agent` are
/// dropped rather than aborting the whole batch.
pub fn parse_parallel_args(args: &serde_json::Value) -> Vec<ParallelEntry> {
    let Some(arr) = args.as_array() else { return vec![] };
    arr.iter()
        .filter_map(|entry| {
            let agent = entry.get("agent").and_then(|v| v.as_str())?;
            let target = DelegationTarget::from_label(agent)?;
            Some(ParallelEntry { delegation: parse_delegation_args(target, entry) })
        })
        .collect()
}

/// Everything the delegation runner needs, passed explicitly rather than
/// resolved from a global (§9, "Cyclic ownership").
pub struct DelegationRunnerDeps {
    pub session_id: SessionId,
    pub events: Arc<SessionStore>,
    pub sub_agent: Arc<SubAgentRunner>,
    pub allowlists: AgentAllowlists,
}

/// Per-target tool allow-lists, intersected against the shared registry by
/// the sub-agent runner itself.
#[derive(Clone)]
pub struct AgentAllowlists {
    pub devo: HashSet<String>,
    pub caio: HashSet<String>,
    pub scout: HashSet<String>,
}

impl AgentAllowlists {
    pub fn for_target(&self, target: DelegationTarget) -> &HashSet<String> {
        match target {
            DelegationTarget::Devo => &self.devo,
            DelegationTarget::Caio => &self.caio,
            DelegationTarget::Scout => &self.scout,
        }
    }
}

const LAST_N_EVIDENCE_LINES: usize = 8;

/// Build the verification envelope (§6) from a finished sub-agent run.
pub fn build_verification_envelope(delegation: &Delegation, result: &SubAgentResult) -> String {
    let mut out = format!("[DELEGATION RESULT — {}]\n", delegation.target);
    out.push_str(&format!("Objective: {}\n", delegation.objective));
    if let Some(outcome) = &delegation.expected_outcome {
        out.push_str(&format!("Expected Outcome: {outcome}\n"));
    }
    out.push('\n');
    out.push_str(&format!("Status: {}\n", result.status));
    out.push_str("Evidence:\n");
    for item in result.evidence.iter().rev().take(LAST_N_EVIDENCE_LINES).collect::<Vec<_>>().into_iter().rev() {
        let id = item.external_id.as_deref().map(|id| format!(" id={id}")).unwrap_or_default();
        out.push_str(&format!("  - [{}] {}{}: {}\n", item.icon(), item.tool_name, id, item.summary));
    }
    if let Some(escalation) = &result.escalation {
        out.push_str(&format!("Escalation: {escalation}\n"));
    }
    if !result.recommendations.is_empty() {
        out.push_str(&format!("Recommendations: {}\n", result.recommendations.join("; ")));
    }
    out.push_str("\nAgent Response:\n");
    out.push_str(&result.response);
    out
}

/// Whether a verification envelope's status line reports failure (§6, §7:
/// "is-error iff status is failed").
pub fn is_error_status(result: &SubAgentResult) -> bool {
    matches!(result.status, DelegationStatus::Failed)
}

// ─── Verification envelope parsing ──────────────────────────────────────────

static ENVELOPE_HEADER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[DELEGATION RESULT — (\w+)\]$").unwrap());
static OBJECTIVE_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Objective: (.*)$").unwrap());
static STATUS_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Status: (SUCCESS|PARTIAL|FAILED|ESCALATED)$").unwrap());
static EVIDENCE_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*-\s*\[(OK|PENDING|ERROR)\]\s*(\S+?)(?:\s+id=(\S+))?:\s*(.*)$").unwrap());

/// One evidence line recovered from a parsed envelope.
#[derive(Debug, Clone)]
pub struct ParsedEvidenceLine {
    pub icon: String,
    pub tool_name: String,
    pub external_id: Option<String>,
    pub summary: String,
}

/// The structured form of a [`build_verification_envelope`] string, recovered
/// by parsing back its fixed textual layout (§8, envelope round-trip).
#[derive(Debug, Clone)]
pub struct ParsedEnvelope {
    pub target: String,
    pub objective: String,
    pub status: DelegationStatus,
    pub evidence: Vec<ParsedEvidenceLine>,
    pub agent_response: String,
}

/// Parse a verification envelope back into its structured parts. Returns
/// `None` when the text does not start with a recognizable envelope header.
pub fn parse_verification_envelope(text: &str) -> Option<ParsedEnvelope> {
    let mut lines = text.lines();
    let header = lines.next()?;
    let target = ENVELOPE_HEADER_RE.captures(header)?.get(1)?.as_str().to_string();

    let mut objective = String::new();
    let mut status = None;
    let mut evidence = Vec::new();
    let mut in_evidence = false;
    let mut in_response = false;
    let mut response_lines: Vec<&str> = Vec::new();

    for line in lines {
        if in_response {
            response_lines.push(line);
            continue;
        }
        if line == "Agent Response:" {
            in_response = true;
            continue;
        }
        if let Some(c) = OBJECTIVE_LINE_RE.captures(line) {
            objective = c[1].to_string();
            in_evidence = false;
            continue;
        }
        if let Some(c) = STATUS_LINE_RE.captures(line) {
            status = Some(match &c[1] {
                "SUCCESS" => DelegationStatus::Success,
                "PARTIAL" => DelegationStatus::Partial,
                "FAILED" => DelegationStatus::Failed,
                _ => DelegationStatus::Escalated,
            });
            continue;
        }
        if line == "Evidence:" {
            in_evidence = true;
            continue;
        }
        if in_evidence {
            if let Some(c) = EVIDENCE_LINE_RE.captures(line) {
                evidence.push(ParsedEvidenceLine {
                    icon: c[1].to_string(),
                    tool_name: c[2].to_string(),
                    external_id: c.get(3).map(|m| m.as_str().to_string()),
                    summary: c[4].to_string(),
                });
                continue;
            }
            in_evidence = false;
        }
    }

    Some(ParsedEnvelope {
        target,
        objective,
        status: status?,
        evidence,
        agent_response: response_lines.join("\n").trim().to_string(),
    })
}

/// Whether an envelope's status line reports failure, parsed straight from
/// text (§7: "is-error iff status is failed").
pub fn envelope_is_error(text: &str) -> bool {
    parse_verification_envelope(text)
        .map(|e| e.status == DelegationStatus::Failed)
        .unwrap_or(false)
}

/// Run one delegation end to end and return its verification envelope.
pub async fn run_single(deps: &DelegationRunnerDeps, delegation: &Delegation) -> String {
    deps.events.emit(
        deps.session_id,
        StreamEventKind::Delegation { target: delegation.target.to_string(), objective: delegation.objective.clone() },
    );
    deps.events.emit(deps.session_id, StreamEventKind::AgentThinking);

    let allow = deps.allowlists.for_target(delegation.target);
    let result = deps.sub_agent.run(delegation, allow).await;
    build_verification_envelope(delegation, &result)
}

/// One entry resolved from a `delegateParallel` argument list (§6, "Parallel-
/// delegation JSON input").
pub struct ParallelEntry {
    pub delegation: Delegation,
}

struct ParallelOutcome {
    target: DelegationTarget,
    objective: String,
    ok: bool,
    preview: String,
}

fn preview(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(max).collect();
        format!("{head}…")
    }
}

/// Run a batch of delegations concurrently, preserving input order in the
/// returned summary while individual sub-agent runs may finish out of order.
pub async fn run_parallel(deps: &DelegationRunnerDeps, entries: Vec<ParallelEntry>) -> String {
    if entries.is_empty() {
        return "Error: delegateParallel requires at least one delegation entry".to_string();
    }

    deps.events.emit(deps.session_id, StreamEventKind::ParallelStart { count: entries.len() });

    let mut tasks = Vec::with_capacity(entries.len());
    for entry in entries {
        let sub_agent = deps.sub_agent.clone();
        let allow = deps.allowlists.for_target(entry.delegation.target).clone();
        let delegation = entry.delegation;
        tasks.push(tokio::spawn(async move {
            let result = sub_agent.run(&delegation, &allow).await;
            (delegation, result)
        }));
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    let mut successful = 0usize;
    let total = tasks.len();
    for task in tasks {
        match task.await {
            Ok((delegation, result)) => {
                let ok = !is_error_status(&result) && result.status != DelegationStatus::Escalated;
                if ok {
                    successful += 1;
                }
                outcomes.push(ParallelOutcome {
                    target: delegation.target,
                    objective: delegation.objective.clone(),
                    ok,
                    preview: preview(&result.response, 160),
                });
            }
            Err(join_err) => {
                outcomes.push(ParallelOutcome {
                    target: DelegationTarget::Devo,
                    objective: "(unknown — sub-agent task panicked)".to_string(),
                    ok: false,
                    preview: format!("sub-agent task failed: {join_err}"),
                });
            }
        }
    }

    deps.events.emit(
        deps.session_id,
        StreamEventKind::ParallelComplete { successful, total },
    );

    let mut out = format!("Parallel delegation completed: {successful}/{total} successful.\n");
    let (ok, failed): (Vec<_>, Vec<_>) = outcomes.into_iter().partition(|o| o.ok);
    out.push_str("Successful delegations:\n");
    for o in &ok {
        out.push_str(&format!("  - [{}/{}] {}: {}\n", o.target, o.target.domain(), o.objective, o.preview));
    }
    out.push_str("Failed delegations:\n");
    for o in &failed {
        out.push_str(&format!("  - [{}/{}] {}: {}\n", o.target, o.target.domain(), o.objective, o.preview));
    }
    out
}
