// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Gate Manager (C10, §4.10).
//!
//! `GateRequest` construction and dedup checking are pure functions over
//! session state built on top of [`crate::session::SessionStore`], so they
//! are testable without a running decision loop.

use std::sync::Arc;

use uuid::Uuid;

use crate::session::{SessionStore, StreamEventKind};
use crate::types::{GateKind, GateRequest, SessionId};

pub struct GateManager {
    store: Arc<SessionStore>,
}

/// Outcome of queuing a gate request.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub request: GateRequest,
    /// `false` when an identical fingerprint was already queued this session
    /// (§4.10 dedup) — in that case no event was emitted.
    pub queued: bool,
}

impl GateManager {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    /// Queue a pending question; emits `user_question` unless suppressed by
    /// fingerprint dedup.
    pub fn queue_question(
        &self,
        session: SessionId,
        text: impl Into<String>,
        kind: GateKind,
        turn_id: Option<String>,
        fingerprint: Option<String>,
    ) -> GateOutcome {
        let req = GateRequest {
            id: Uuid::new_v4().to_string(),
            kind,
            originating_agent: "chapo".into(),
            issued_at: chrono::Utc::now().to_rfc3339(),
            turn_id,
            expires_at: None,
            fingerprint,
            text: text.into(),
        };
        let queued = self.store.push_gate(session, false, req.clone());
        if queued {
            self.store.emit(
                session,
                StreamEventKind::UserQuestion { id: req.id.clone(), text: req.text.clone() },
            );
        }
        GateOutcome { request: req, queued }
    }

    /// Queue a pending approval request; emits `approval_request` unless
    /// suppressed by fingerprint dedup.
    pub fn queue_approval(
        &self,
        session: SessionId,
        description: impl Into<String>,
        turn_id: Option<String>,
    ) -> GateOutcome {
        let req = GateRequest {
            id: Uuid::new_v4().to_string(),
            kind: GateKind::Approval,
            originating_agent: "chapo".into(),
            issued_at: chrono::Utc::now().to_rfc3339(),
            turn_id,
            expires_at: None,
            fingerprint: None,
            text: description.into(),
        };
        let queued = self.store.push_gate(session, true, req.clone());
        if queued {
            self.store.emit(
                session,
                StreamEventKind::ApprovalRequest { id: req.id.clone(), description: req.text.clone() },
            );
        }
        GateOutcome { request: req, queued }
    }

    /// Whether a resumed answer for `pending` should re-enter the loop as a
    /// brand-new request rather than resuming the suspended turn (§4.10):
    /// true when the turn-id no longer matches the session's current turn,
    /// or the gate has expired.
    pub fn should_start_new_request(&self, session: SessionId, pending: &GateRequest) -> bool {
        if let Some(expires_at) = &pending.expires_at {
            if let (Ok(exp), now) = (chrono::DateTime::parse_from_rfc3339(expires_at), chrono::Utc::now()) {
                if exp < now {
                    return true;
                }
            }
        }
        match (&pending.turn_id, self.store.current_turn_id(session)) {
            (Some(pending_turn), Some(current_turn)) => *pending_turn != current_turn,
            _ => false,
        }
    }
}
