// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Conversation Manager (C2, §4.2).
//!
//! The snapshot-before/adjust-split-point technique here is carried over
//! structurally from the teacher's `compact_session_with_strategy`, retargeted
//! at the `[Context compacted — N tokens summarized]` / `[ORIGINAL REQUEST —
//! pinned]` textual contract instead of the teacher's Structured/Narrative
//! checkpoint headers. The summarizer itself is injected so this module never
//! depends on a concrete model call to compact.

use chapo_model::{Message, MessageContent, Role};

/// Injected text-summarization step. The loop supplies the messages to be
/// compacted and accepts an opaque summary string back.
pub type Summarizer = Box<dyn Fn(&[Message]) -> String + Send + Sync>;

/// Ordered message log with token accounting, compaction, and pinning.
pub struct ConversationManager {
    system_prompt: String,
    messages: Vec<Message>,
    pinned_original_request: Option<String>,
}

/// Statistics returned by a successful compaction run.
#[derive(Debug, Clone, Copy)]
pub struct CompactionStats {
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub messages_summarized: usize,
    pub messages_kept: usize,
}

impl ConversationManager {
    pub fn new() -> Self {
        Self {
            system_prompt: String::new(),
            messages: Vec::new(),
            pinned_original_request: None,
        }
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Pin the user's original request text so compaction can re-surface it.
    pub fn pin_original_request(&mut self, text: impl Into<String>) {
        self.pinned_original_request = Some(text.into());
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// View suitable for the model call; the system prompt is passed
    /// separately by the caller and is therefore excluded here.
    pub fn build_llm_messages(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Estimated total token count: system prompt plus every message.
    pub fn token_usage(&self) -> usize {
        let system_tokens = (self.system_prompt.len() / 4).max(if self.system_prompt.is_empty() { 0 } else { 1 });
        system_tokens + self.messages.iter().map(Message::approx_tokens).sum::<usize>()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Whether `token_usage()` strictly exceeds `threshold` — exactly at the
    /// threshold must NOT trigger (§8, Boundary behaviors).
    pub fn should_compact(&self, threshold: usize) -> bool {
        self.token_usage() > threshold
    }

    /// Run compaction: summarize the oldest `1 - keep_fraction` of the log
    /// into a single synthetic system message, then re-append the pinned
    /// original request, then the retained tail in order.
    ///
    /// The split point is walked backward so no tool-call in the summarized
    /// region is ever separated from its tool-result in the kept tail.
    pub fn compact(&mut self, keep_fraction: f32, summarizer: &Summarizer) -> CompactionStats {
        let total = self.messages.len();
        let tokens_before = self.token_usage();
        if total == 0 {
            return CompactionStats { tokens_before, tokens_after: tokens_before, messages_summarized: 0, messages_kept: 0 };
        }

        let keep_count = ((total as f32) * keep_fraction).ceil() as usize;
        let mut split_idx = total.saturating_sub(keep_count);

        // Never let the kept tail start on a tool-result whose tool-call is
        // in the summarized region.
        while split_idx > 0 && is_tool_result(&self.messages[split_idx]) {
            split_idx -= 1;
        }

        let summarized: Vec<Message> = self.messages[..split_idx].to_vec();
        let kept: Vec<Message> = self.messages[split_idx..].to_vec();
        let tokens_summarized: usize = summarized.iter().map(Message::approx_tokens).sum();

        let summary_text = summarizer(&summarized);
        let compacted_msg = Message::system(format!(
            "[Context compacted — {tokens_summarized} tokens summarized] {summary_text}"
        ));

        self.messages.clear();
        self.messages.push(compacted_msg);
        if let Some(orig) = &self.pinned_original_request {
            self.messages.push(Message::user(format!("[ORIGINAL REQUEST — pinned]\n{orig}")));
        }
        self.messages.extend(kept);

        let tokens_after = self.token_usage();
        CompactionStats {
            tokens_before,
            tokens_after,
            messages_summarized: summarized.len(),
            messages_kept: self.messages.len(),
        }
    }
}

impl Default for ConversationManager {
    fn default() -> Self {
        Self::new()
    }
}

fn is_tool_result(m: &Message) -> bool {
    matches!(m.content, MessageContent::ToolResult { .. })
}

/// Default, deterministic summarizer used when no richer one is injected:
/// a short structural digest rather than a full LLM call (kept for tests and
/// as the crate's `Default`-equivalent fallback).
pub fn structural_summarizer() -> Summarizer {
    Box::new(|messages: &[Message]| {
        let mut user_turns = 0usize;
        let mut assistant_turns = 0usize;
        let mut tool_calls = 0usize;
        for m in messages {
            match (&m.role, &m.content) {
                (Role::User, _) => user_turns += 1,
                (Role::Assistant, MessageContent::ToolCall { .. }) => tool_calls += 1,
                (Role::Assistant, _) => assistant_turns += 1,
                _ => {}
            }
        }
        format!(
            "{user_turns} user message(s), {assistant_turns} assistant reply(ies), {tool_calls} tool call(s) were exchanged before this point."
        )
    })
}
