// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session State & Event Stream (C8, §4.8).
//!
//! The teacher's `AgentEvent` enum grounds the *shape* of a flat,
//! `Clone`-able event enum; this module's `StreamEvent` is the richer,
//! sequence-numbered enum matching §6's event-type vocabulary, kept behind
//! the same per-session lock the inbox (C1) and gate manager (C10) use.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::Serialize;

use crate::types::{GateRequest, SessionId, SessionPhase};

/// One typed event emitted during a session's lifetime (§6, outbound events).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEventKind {
    AgentStart,
    AgentThinking,
    AgentComplete { result: String },
    AgentSwitch { agent: String },
    AgentHistory,
    ToolCall { call_id: String, tool_name: String, args: serde_json::Value },
    ToolResult { call_id: String, tool_name: String, content: String, is_error: bool },
    ActionPending { action_id: String, tool_name: String, description: String },
    UserQuestion { id: String, text: String },
    ApprovalRequest { id: String, description: String },
    Error { message: String },
    Delegation { target: String, objective: String },
    InboxProcessing { count: usize },
    MessageQueued { id: String },
    ParallelStart { count: usize },
    ParallelComplete { successful: usize, total: usize },
    /// A `tool_result` with the synthetic tool-name `decision_path` (§6).
    DecisionPath { path: String, reason: String, confidence: f32, unresolved_assumptions: Vec<String> },
}

/// Envelope fields every event carries (§6: `{sessionId, seq, type}`).
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    pub session_id: SessionId,
    pub seq: u64,
    #[serde(flatten)]
    pub kind: StreamEventKind,
}

struct SessionRecord {
    phase: SessionPhase,
    active_agent: Option<String>,
    loop_running: bool,
    current_turn_id: Option<String>,
    events: Vec<StreamEvent>,
    next_seq: u64,
    pending_questions: Vec<GateRequest>,
    pending_approvals: Vec<GateRequest>,
    fingerprints: HashSet<String>,
}

impl Default for SessionRecord {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Qualification,
            active_agent: None,
            loop_running: false,
            current_turn_id: None,
            events: Vec::new(),
            next_seq: 1,
            pending_questions: Vec::new(),
            pending_approvals: Vec::new(),
            fingerprints: HashSet::new(),
        }
    }
}

/// Per-session state machine plus append-only, sequence-numbered event log.
pub struct SessionStore {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    /// Append a new event, assigning the next sequence number for `session`.
    pub fn emit(&self, session: SessionId, kind: StreamEventKind) -> StreamEvent {
        let mut sessions = self.sessions.lock().unwrap();
        let rec = sessions.entry(session).or_default();
        let seq = rec.next_seq;
        rec.next_seq += 1;
        let event = StreamEvent { session_id: session, seq, kind };
        rec.events.push(event.clone());
        event
    }

    /// Events with `seq` strictly greater than `since_seq`, in order.
    pub fn replay_since(&self, session: SessionId, since_seq: u64) -> Vec<StreamEvent> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(&session)
            .map(|r| r.events.iter().filter(|e| e.seq > since_seq).cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_phase(&self, session: SessionId, phase: SessionPhase) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.entry(session).or_default().phase = phase;
    }

    pub fn phase(&self, session: SessionId) -> SessionPhase {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(&session).map(|r| r.phase).unwrap_or(SessionPhase::Qualification)
    }

    pub fn set_active_agent(&self, session: SessionId, agent: Option<String>) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.entry(session).or_default().active_agent = agent;
    }

    pub fn set_loop_running(&self, session: SessionId, running: bool) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.entry(session).or_default().loop_running = running;
    }

    pub fn is_loop_running(&self, session: SessionId) -> bool {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(&session).map(|r| r.loop_running).unwrap_or(false)
    }

    pub fn set_current_turn_id(&self, session: SessionId, turn_id: impl Into<String>) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.entry(session).or_default().current_turn_id = Some(turn_id.into());
    }

    pub fn current_turn_id(&self, session: SessionId) -> Option<String> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(&session).and_then(|r| r.current_turn_id.clone())
    }

    /// Enqueue a pending gate request unless its fingerprint was already
    /// observed this session (§4.10 dedup). Returns `true` if queued.
    pub fn push_gate(&self, session: SessionId, is_approval: bool, req: GateRequest) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        let rec = sessions.entry(session).or_default();
        if let Some(fp) = &req.fingerprint {
            if rec.fingerprints.contains(fp) {
                return false;
            }
            rec.fingerprints.insert(fp.clone());
        }
        if is_approval {
            rec.pending_approvals.push(req);
        } else {
            rec.pending_questions.push(req);
        }
        true
    }

    pub fn pending_questions(&self, session: SessionId) -> Vec<GateRequest> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(&session).map(|r| r.pending_questions.clone()).unwrap_or_default()
    }

    pub fn pending_approvals(&self, session: SessionId) -> Vec<GateRequest> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(&session).map(|r| r.pending_approvals.clone()).unwrap_or_default()
    }

    pub fn resolve_question(&self, session: SessionId, id: &str) -> Option<GateRequest> {
        let mut sessions = self.sessions.lock().unwrap();
        let rec = sessions.get_mut(&session)?;
        let idx = rec.pending_questions.iter().position(|q| q.id == id)?;
        Some(rec.pending_questions.remove(idx))
    }

    pub fn resolve_approval(&self, session: SessionId, id: &str) -> Option<GateRequest> {
        let mut sessions = self.sessions.lock().unwrap();
        let rec = sessions.get_mut(&session)?;
        let idx = rec.pending_approvals.iter().position(|q| q.id == id)?;
        Some(rec.pending_approvals.remove(idx))
    }

    /// Drop all state for a session (terminal loop exit in test builds; a
    /// production TTL sweep would call this after the idle window, §9).
    pub fn clear(&self, session: SessionId) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.remove(&session);
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_strictly_increase() {
        let store = SessionStore::new();
        let s = SessionId::new();
        let e1 = store.emit(s, StreamEventKind::AgentStart);
        let e2 = store.emit(s, StreamEventKind::AgentThinking);
        assert!(e2.seq > e1.seq);
    }

    #[test]
    fn replay_since_returns_only_newer_events() {
        let store = SessionStore::new();
        let s = SessionId::new();
        let e1 = store.emit(s, StreamEventKind::AgentStart);
        store.emit(s, StreamEventKind::AgentThinking);
        let replay = store.replay_since(s, e1.seq);
        assert_eq!(replay.len(), 1);
    }

    #[test]
    fn replay_from_zero_returns_everything() {
        let store = SessionStore::new();
        let s = SessionId::new();
        store.emit(s, StreamEventKind::AgentStart);
        store.emit(s, StreamEventKind::AgentThinking);
        assert_eq!(store.replay_since(s, 0).len(), 2);
    }

    #[test]
    fn gate_dedup_suppresses_repeated_fingerprint() {
        let store = SessionStore::new();
        let s = SessionId::new();
        let req = |text: &str| GateRequest {
            id: "q1".into(),
            kind: crate::types::GateKind::Continue,
            originating_agent: "chapo".into(),
            issued_at: "2026-01-01T00:00:00Z".into(),
            turn_id: Some("t1".into()),
            expires_at: None,
            fingerprint: Some("limit:plain:t1".into()),
            text: text.into(),
        };
        assert!(store.push_gate(s, false, req("first")));
        assert!(!store.push_gate(s, false, req("second")));
        assert_eq!(store.pending_questions(s).len(), 1);
    }

    #[test]
    fn loop_running_flag_round_trips() {
        let store = SessionStore::new();
        let s = SessionId::new();
        assert!(!store.is_loop_running(s));
        store.set_loop_running(s, true);
        assert!(store.is_loop_running(s));
    }

    #[test]
    fn clear_removes_events_and_state() {
        let store = SessionStore::new();
        let s = SessionId::new();
        store.emit(s, StreamEventKind::AgentStart);
        store.clear(s);
        assert!(store.replay_since(s, 0).is_empty());
    }

    #[test]
    fn resolve_question_removes_it_from_pending() {
        let store = SessionStore::new();
        let s = SessionId::new();
        let req = GateRequest {
            id: "q1".into(),
            kind: crate::types::GateKind::Clarification,
            originating_agent: "chapo".into(),
            issued_at: "2026-01-01T00:00:00Z".into(),
            turn_id: None,
            expires_at: None,
            fingerprint: None,
            text: "was meinst du?".into(),
        };
        store.push_gate(s, false, req);
        let resolved = store.resolve_question(s, "q1");
        assert!(resolved.is_some());
        assert!(store.pending_questions(s).is_empty());
    }
}
