// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Error Handler (C3, §4.3).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use thiserror::Error;

/// Library-internal error kinds the loop needs to match on.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("model call failed: {0}")]
    Model(String),
    #[error("delegation failed: {0}")]
    Delegation(String),
    #[error("tool execution failed: {0}")]
    Tool(String),
}

/// Per-operation retry counters, owned by a single session.
pub struct ErrorHandler {
    attempts: Mutex<HashMap<String, u32>>,
    max_retries: u32,
}

impl ErrorHandler {
    pub fn new(max_retries: u32) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            max_retries,
        }
    }

    /// Run `fut`; on failure, increment the attempt counter for `op_key` and
    /// return the error alongside a `None` value.
    pub async fn safe<T, E, F, Fut>(&self, op_key: &str, fut: F) -> (Option<T>, Option<E>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match fut().await {
            Ok(v) => (Some(v), None),
            Err(e) => {
                let mut attempts = self.attempts.lock().unwrap();
                *attempts.entry(op_key.to_string()).or_insert(0) += 1;
                (None, Some(e))
            }
        }
    }

    /// Whether `op_key` still has retry budget remaining.
    pub fn can_retry(&self, op_key: &str) -> bool {
        let attempts = self.attempts.lock().unwrap();
        attempts.get(op_key).copied().unwrap_or(0) < self.max_retries
    }

    pub fn attempt_count(&self, op_key: &str) -> u32 {
        let attempts = self.attempts.lock().unwrap();
        attempts.get(op_key).copied().unwrap_or(0)
    }

    /// Short, model-readable rendering of an arbitrary error.
    pub fn format_for_llm(err: &anyhow::Error) -> String {
        format!("[LLM Error] {err}")
    }
}
