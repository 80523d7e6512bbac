// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// YAML-configured mock model provider for end-to-end and bats tests.
///
/// The provider reads a YAML file that maps input patterns to canned
/// responses (text only, or a tool-call sequence followed by a final
/// text reply).  This makes test behaviour fully deterministic and lets
/// test authors express scenarios in readable YAML rather than Rust code.
///
/// # YAML format
///
/// ```yaml
/// responses:
///   - match_type: contains       # contains | equals | starts_with | regex | default
///     pattern: "ping"
///     reply: "pong"
///
///   - match_type: contains
///     pattern: "write a file"
///     tool_calls:
///       - id: tc-1
///         tool: fs
///         args:
///           operation: write
///           path: /tmp/test.txt
///           content: "hello"
///     after_tool_reply: "File written."
///
///   - match_type: default
///     reply: "I understand your request."
/// ```
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use futures::stream;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{provider::ResponseStream, CompletionRequest, ResponseEvent, Role};

// ─── YAML schema ─────────────────────────────────────────────────────────────

/// Root document.
#[derive(Debug, Deserialize)]
pub struct MockConfig {
    pub responses: Vec<ResponseRule>,
}

/// One entry in the responses list.
#[derive(Debug, Deserialize)]
pub struct ResponseRule {
    /// How to match the last user message.
    pub match_type: MatchType,
    /// Pattern string (ignored for `default` match type).
    #[serde(default)]
    pub pattern: String,
    /// Simple text reply (used when there are no tool_calls, or as the
    /// after-tool reply when tool_calls is also set).
    pub reply: Option<String>,
    /// Tool calls to emit in the first round.
    #[serde(default)]
    pub tool_calls: Vec<ToolCallDef>,
    /// Text reply to send after tool results arrive (second round).
    pub after_tool_reply: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Contains,
    Equals,
    StartsWith,
    Regex,
    Default,
}

/// A single tool call defined in the YAML.
#[derive(Debug, Deserialize)]
pub struct ToolCallDef {
    pub id: String,
    pub tool: String,
    /// YAML map that is serialized to a JSON string for the tool arguments.
    pub args: serde_json::Value,
}

// ─── Provider ────────────────────────────────────────────────────────────────

/// A model provider whose responses are driven by a YAML configuration file.
/// Suitable for end-to-end tests and bats scripts.
pub struct YamlMockProvider {
    config: Arc<MockConfig>,
    /// Counts how many times `complete` has been called overall, used for
    /// debugging and deterministic sequencing.
    call_count: Arc<Mutex<u32>>,
    name: String,
}

impl YamlMockProvider {
    /// Load a provider from a YAML file at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading mock responses file: {}", path.display()))?;
        Self::load(&text)
    }

    /// Load a provider from a YAML string.
    pub fn load(yaml: &str) -> anyhow::Result<Self> {
        let config: MockConfig = serde_yaml::from_str(yaml)
            .context("parsing mock responses YAML")?;
        Ok(Self {
            config: Arc::new(config),
            call_count: Arc::new(Mutex::new(0)),
            name: "yaml-mock".into(),
        })
    }
}

#[async_trait]
impl crate::ModelProvider for YamlMockProvider {
    fn name(&self) -> &str { &self.name }
    fn model_name(&self) -> &str { "yaml-mock-model" }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let call_num = {
            let mut c = self.call_count.lock().unwrap();
            *c += 1;
            *c
        };

        // Determine whether we are responding after tool results were added.
        let has_tool_results = req.messages.iter()
            .any(|m| m.role == Role::Tool);

        // Find the last user message – this is the key we match against.
        let last_user_text = req.messages.iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.as_text())
            .unwrap_or("[no user message]")
            .to_string();

        debug!(call_num, has_tool_results, last_user = %last_user_text, "yaml mock complete()");

        let rule = self.find_rule(&last_user_text);

        let events = if has_tool_results {
            // Round 2: tool results are in – respond with after_tool_reply or reply
            let text = rule
                .and_then(|r| r.after_tool_reply.as_deref().or(r.reply.as_deref()))
                .unwrap_or("[no after-tool reply configured]");
            text_events(text)
        } else {
            match rule {
                None => text_events("[no mock rule matched]"),
                Some(r) if r.tool_calls.is_empty() => {
                    // Simple text response
                    let text = r.reply.as_deref().unwrap_or("[no reply configured]");
                    text_events(text)
                }
                Some(r) => {
                    // Emit tool calls
                    tool_call_events(&r.tool_calls)
                }
            }
        };

        Ok(Box::pin(stream::iter(events)))
    }
}

impl YamlMockProvider {
    fn find_rule<'a>(&'a self, user_text: &str) -> Option<&'a ResponseRule> {
        let lower = user_text.to_lowercase();
        let mut default_rule = None;

        for rule in &self.config.responses {
            match rule.match_type {
                MatchType::Default => {
                    default_rule = Some(rule);
                }
                MatchType::Contains => {
                    if lower.contains(&rule.pattern.to_lowercase()) {
                        return Some(rule);
                    }
                }
                MatchType::Equals => {
                    if lower == rule.pattern.to_lowercase() {
                        return Some(rule);
                    }
                }
                MatchType::StartsWith => {
                    if lower.starts_with(&rule.pattern.to_lowercase()) {
                        return Some(rule);
                    }
                }
                MatchType::Regex => {
                    if let Ok(re) = regex::Regex::new(&rule.pattern) {
                        if re.is_match(user_text) {
                            return Some(rule);
                        }
                    }
                }
            }
        }

        default_rule
    }
}

// ─── Event constructors ───────────────────────────────────────────────────────

fn text_events(text: &str) -> Vec<anyhow::Result<ResponseEvent>> {
    vec![
        Ok(ResponseEvent::TextDelta(text.to_string())),
        Ok(ResponseEvent::Usage { input_tokens: 5, output_tokens: text.len() as u32 / 4 + 1, cache_read_tokens: 0, cache_write_tokens: 0 }),
        Ok(ResponseEvent::Done),
    ]
}

fn tool_call_events(tool_calls: &[ToolCallDef]) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events: Vec<anyhow::Result<ResponseEvent>> = tool_calls
        .iter()
        .enumerate()
        .map(|(index, tc)| Ok(ResponseEvent::ToolCall {
            index,
            id: tc.id.clone(),
            name: tc.tool.clone(),
            arguments: tc.args.to_string(),
        }))
        .collect();
    events.push(Ok(ResponseEvent::Done));
    events
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
