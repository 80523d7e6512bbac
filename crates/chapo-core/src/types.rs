// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared data types for the decision loop (§3 / §3.1).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three named sub-agent identities a coordinator may delegate to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationTarget {
    Devo,
    Caio,
    Scout,
}

impl DelegationTarget {
    /// The tool-name suffix used to resolve a reserved delegation tool-call
    /// (`delegateToDevo` → `Devo`, etc.) back to a target.
    pub fn from_tool_name(name: &str) -> Option<Self> {
        match name {
            "delegateToDevo" => Some(Self::Devo),
            "delegateToCaio" => Some(Self::Caio),
            "delegateToScout" => Some(Self::Scout),
            _ => None,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "devo" => Some(Self::Devo),
            "caio" => Some(Self::Caio),
            "scout" => Some(Self::Scout),
            _ => None,
        }
    }

    /// The default domain for this target, used when a delegation does not
    /// specify one explicitly.
    pub fn domain(&self) -> &'static str {
        match self {
            Self::Devo => "development",
            Self::Caio => "communication",
            Self::Scout => "research",
        }
    }
}

impl std::fmt::Display for DelegationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Devo => "DEVO",
            Self::Caio => "CAIO",
            Self::Scout => "SCOUT",
        };
        write!(f, "{s}")
    }
}

/// Research delegation scope (§3, Delegation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResearchScope {
    Codebase,
    Web,
    Both,
}

impl ResearchScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "codebase" => Some(Self::Codebase),
            "web" => Some(Self::Web),
            "both" => Some(Self::Both),
            _ => None,
        }
    }
}

/// A structured sub-objective handed from the coordinator to a sub-agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub target: DelegationTarget,
    pub domain: String,
    pub objective: String,
    pub expected_outcome: Option<String>,
    pub constraints: Vec<String>,
    pub context_facts: Vec<String>,
    pub context: Option<String>,
    pub scope: Option<ResearchScope>,
}

/// Terminal status of a sub-agent run, or of one delegation in a parallel batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationStatus {
    Success,
    Partial,
    Failed,
    Escalated,
}

impl std::fmt::Display for DelegationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "SUCCESS",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
            Self::Escalated => "ESCALATED",
        };
        write!(f, "{s}")
    }
}

/// One record of a tool call made by a sub-agent (§3, Evidence Item).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub tool_name: String,
    pub success: bool,
    pub pending_approval: bool,
    pub external_id: Option<String>,
    pub summary: String,
    pub error: Option<String>,
    pub timestamp: String,
}

impl EvidenceItem {
    /// `[OK|PENDING|ERROR]` icon used in the verification envelope (§6).
    pub fn icon(&self) -> &'static str {
        if self.pending_approval {
            "PENDING"
        } else if self.success {
            "OK"
        } else {
            "ERROR"
        }
    }
}

/// Outcome of a bounded sub-agent run (§3, Sub-Agent Result).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentResult {
    pub status: DelegationStatus,
    pub response: String,
    pub evidence: Vec<EvidenceItem>,
    pub escalation: Option<String>,
    pub recommendations: Vec<String>,
}

/// Derives the sub-agent status from its accumulated evidence, per §4.5 and
/// the `partial` open-question decision in §9.
pub fn derive_delegation_status(evidence: &[EvidenceItem], escalated: bool, has_content: bool) -> DelegationStatus {
    if escalated {
        return DelegationStatus::Escalated;
    }
    if evidence.is_empty() {
        return if has_content {
            DelegationStatus::Success
        } else {
            DelegationStatus::Failed
        };
    }
    let any_success = evidence.iter().any(|e| e.success && !e.pending_approval);
    let any_failure = evidence.iter().any(|e| !e.success && !e.pending_approval);
    let any_pending = evidence.iter().any(|e| e.pending_approval);

    if any_failure && any_success {
        DelegationStatus::Partial
    } else if any_pending && !any_success && !any_failure {
        DelegationStatus::Partial
    } else if any_failure {
        DelegationStatus::Failed
    } else {
        DelegationStatus::Success
    }
}

/// Session phase (§3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Qualification,
    Execution,
    WaitingUser,
    Error,
    Review,
}

/// Terminal result of one top-level decision-loop run (§3.1, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopOutcome {
    pub answer: String,
    pub status: LoopStatus,
    pub total_iterations: u32,
    pub question: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Completed,
    WaitingForUser,
    Error,
}

/// A message arriving via the session inbox while a loop is mid-flight (§3, C1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: String,
    pub content: String,
    pub received_at: String,
    pub source: String,
    pub acknowledged: bool,
}

/// Kind of a pending gate request (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Clarification,
    Continue,
    Approval,
}

/// A pending question or approval the loop is suspended on (§3, Gate Request).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRequest {
    pub id: String,
    pub kind: GateKind,
    pub originating_agent: String,
    pub issued_at: String,
    pub turn_id: Option<String>,
    pub expires_at: Option<String>,
    pub fingerprint: Option<String>,
    pub text: String,
}
