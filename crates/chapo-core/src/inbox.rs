// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session Inbox & Event Bus (C1, §4.1).
//!
//! Mirrors the locking discipline of `chapo_tools::ToolRegistry`: handlers
//! are cloned out of the lock before being invoked so a slow or panicking
//! handler never blocks a concurrent `push`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::types::{InboxMessage, SessionId};

type Handler = Box<dyn Fn(&InboxMessage) + Send + Sync>;

#[derive(Default)]
struct InboxEntry {
    messages: Vec<InboxMessage>,
    handlers: Vec<(u64, Handler)>,
}

/// Per-process, in-memory inbox of user messages arriving mid-loop.
pub struct SessionInbox {
    sessions: Mutex<HashMap<SessionId, InboxEntry>>,
    next_handler_id: Mutex<u64>,
}

/// Handle returned by [`SessionInbox::subscribe`]; pass to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

impl SessionInbox {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_handler_id: Mutex::new(0),
        }
    }

    /// Append a message and notify all currently-registered listeners, in
    /// registration order. Listener failures never block delivery to later
    /// listeners — handlers here are plain closures so there is nothing to
    /// catch, but the clone-then-call pattern keeps the session lock held
    /// only as long as it takes to snapshot the handler list.
    pub fn push(&self, session: SessionId, content: impl Into<String>, source: impl Into<String>) -> InboxMessage {
        let msg = InboxMessage {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            received_at: chrono::Utc::now().to_rfc3339(),
            source: source.into(),
            acknowledged: false,
        };

        {
            let mut sessions = self.sessions.lock().unwrap();
            let entry = sessions.entry(session).or_default();
            entry.messages.push(msg.clone());
        }
        // Handlers are boxed closures (not `Clone`), so the call itself
        // re-acquires the lock per handler rather than cloning a snapshot.
        let ids: Vec<u64> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .get(&session)
                .map(|e| e.handlers.iter().map(|(id, _)| *id).collect())
                .unwrap_or_default()
        };
        for id in ids {
            let sessions = self.sessions.lock().unwrap();
            if let Some(entry) = sessions.get(&session) {
                if let Some((_, h)) = entry.handlers.iter().find(|(hid, _)| *hid == id) {
                    h(&msg);
                }
            }
        }
        msg
    }

    /// Return and remove all currently queued messages, oldest first.
    pub fn drain(&self, session: SessionId) -> Vec<InboxMessage> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&session) {
            Some(entry) => std::mem::take(&mut entry.messages),
            None => Vec::new(),
        }
    }

    /// Snapshot the queue without removing anything.
    pub fn peek(&self, session: SessionId) -> Vec<InboxMessage> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(&session).map(|e| e.messages.clone()).unwrap_or_default()
    }

    /// Register a handler invoked synchronously on every future `push`.
    pub fn subscribe(&self, session: SessionId, handler: Handler) -> SubscriptionId {
        let id = {
            let mut n = self.next_handler_id.lock().unwrap();
            *n += 1;
            *n
        };
        let mut sessions = self.sessions.lock().unwrap();
        sessions.entry(session).or_default().handlers.push((id, handler));
        SubscriptionId(id)
    }

    /// Remove a handler previously returned by `subscribe`. When it was the
    /// last handler for the session, the handler set is released (the entry
    /// itself is left in place since messages may still be queued).
    pub fn unsubscribe(&self, session: SessionId, sub: SubscriptionId) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(entry) = sessions.get_mut(&session) {
            entry.handlers.retain(|(id, _)| *id != sub.0);
        }
    }

    /// Drop the queue and handler set entirely for a session.
    pub fn clear(&self, session: SessionId) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.remove(&session);
    }
}

impl Default for SessionInbox {
    fn default() -> Self {
        Self::new()
    }
}
