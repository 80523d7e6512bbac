// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! External-action tools.
//!
//! Each tool here stands in for a real integration (an SMTP relay, a
//! ticketing system's HTTP API, a calendar service). The concrete back-end
//! is deliberately out of scope — what matters is the uniform `Tool`
//! interface and the observable success/failure/external-id shape that the
//! evidence-of-side-effects validator keys off.
use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

fn require_str<'a>(call: &'a ToolCall, field: &str) -> Result<&'a str, ToolOutput> {
    call.args
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ToolOutput::err(
                &call.id,
                format!("missing required parameter '{field}'"),
            )
        })
}

fn looks_like_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

fn require_rfc3339<'a>(call: &'a ToolCall, field: &str) -> Result<&'a str, ToolOutput> {
    let raw = require_str(call, field)?;
    match chrono::DateTime::parse_from_rfc3339(raw) {
        Ok(_) => Ok(raw),
        Err(_) => Err(ToolOutput::err(
            &call.id,
            format!("parameter '{field}' is not a valid RFC3339 timestamp: {raw}"),
        )),
    }
}

fn synthetic_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

// ─── send_email ──────────────────────────────────────────────────────────────

pub struct SendEmailTool;

#[async_trait]
impl Tool for SendEmailTool {
    fn name(&self) -> &str {
        "send_email"
    }

    fn description(&self) -> &str {
        "Send an email to a recipient. Requires explicit approval — the message is dispatched \
         immediately with no undo."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "to": {"type": "string", "description": "Recipient email address"},
                "subject": {"type": "string", "description": "Email subject line"},
                "body": {"type": "string", "description": "Email body text"}
            },
            "required": ["to", "subject", "body"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let to = match require_str(call, "to") {
            Ok(v) => v,
            Err(e) => return e,
        };
        if !looks_like_email(to) {
            return ToolOutput::err(&call.id, format!("'to' is not a valid email address: {to}"));
        }
        let subject = match require_str(call, "subject") {
            Ok(v) => v,
            Err(e) => return e,
        };
        if let Err(e) = require_str(call, "body") {
            return e;
        }

        let message_id = synthetic_id("msg");
        ToolOutput::ok(
            &call.id,
            format!("email queued to {to} (subject: \"{subject}\"); messageId={message_id}"),
        )
    }
}

// ─── taskforge_create / taskforge_move / taskforge_comment ──────────────────

pub struct TaskforgeCreateTool;

#[async_trait]
impl Tool for TaskforgeCreateTool {
    fn name(&self) -> &str {
        "taskforge_create"
    }

    fn description(&self) -> &str {
        "Create a new ticket in Taskforge. Requires explicit approval."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string"},
                "description": {"type": "string"},
                "column": {"type": "string", "description": "Initial column/status"}
            },
            "required": ["title"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let title = match require_str(call, "title") {
            Ok(v) => v,
            Err(e) => return e,
        };
        let ticket_id = synthetic_id("tkt");
        ToolOutput::ok(&call.id, format!("created ticket \"{title}\"; ticketId={ticket_id}"))
    }
}

pub struct TaskforgeMoveTool;

#[async_trait]
impl Tool for TaskforgeMoveTool {
    fn name(&self) -> &str {
        "taskforge_move"
    }

    fn description(&self) -> &str {
        "Move an existing Taskforge ticket to a different column. Requires explicit approval."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "ticketId": {"type": "string"},
                "column": {"type": "string", "description": "Destination column/status"}
            },
            "required": ["ticketId", "column"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let ticket_id = match require_str(call, "ticketId") {
            Ok(v) => v,
            Err(e) => return e,
        };
        let column = match require_str(call, "column") {
            Ok(v) => v,
            Err(e) => return e,
        };
        ToolOutput::ok(
            &call.id,
            format!("moved ticket {ticket_id} to column \"{column}\"; ticketId={ticket_id}"),
        )
    }
}

pub struct TaskforgeCommentTool;

#[async_trait]
impl Tool for TaskforgeCommentTool {
    fn name(&self) -> &str {
        "taskforge_comment"
    }

    fn description(&self) -> &str {
        "Post a comment on an existing Taskforge ticket. Requires explicit approval."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "ticketId": {"type": "string"},
                "body": {"type": "string"}
            },
            "required": ["ticketId", "body"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let ticket_id = match require_str(call, "ticketId") {
            Ok(v) => v,
            Err(e) => return e,
        };
        if let Err(e) = require_str(call, "body") {
            return e;
        }
        ToolOutput::ok(
            &call.id,
            format!("commented on ticket {ticket_id}; ticketId={ticket_id}"),
        )
    }
}

// ─── scheduler_create / scheduler_update / scheduler_delete ─────────────────

pub struct SchedulerCreateTool;

#[async_trait]
impl Tool for SchedulerCreateTool {
    fn name(&self) -> &str {
        "scheduler_create"
    }

    fn description(&self) -> &str {
        "Create a calendar event. Requires explicit approval."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string"},
                "datetime": {"type": "string", "description": "RFC3339 timestamp"}
            },
            "required": ["title", "datetime"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let title = match require_str(call, "title") {
            Ok(v) => v,
            Err(e) => return e,
        };
        let datetime = match require_rfc3339(call, "datetime") {
            Ok(v) => v,
            Err(e) => return e,
        };
        let event_id = synthetic_id("evt");
        ToolOutput::ok(
            &call.id,
            format!("scheduled \"{title}\" at {datetime}; eventId={event_id}"),
        )
    }
}

pub struct SchedulerUpdateTool;

#[async_trait]
impl Tool for SchedulerUpdateTool {
    fn name(&self) -> &str {
        "scheduler_update"
    }

    fn description(&self) -> &str {
        "Update an existing calendar event's time. Requires explicit approval."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "eventId": {"type": "string"},
                "datetime": {"type": "string", "description": "RFC3339 timestamp"}
            },
            "required": ["eventId", "datetime"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let event_id = match require_str(call, "eventId") {
            Ok(v) => v,
            Err(e) => return e,
        };
        let datetime = match require_rfc3339(call, "datetime") {
            Ok(v) => v,
            Err(e) => return e,
        };
        ToolOutput::ok(
            &call.id,
            format!("rescheduled event {event_id} to {datetime}; eventId={event_id}"),
        )
    }
}

pub struct SchedulerDeleteTool;

#[async_trait]
impl Tool for SchedulerDeleteTool {
    fn name(&self) -> &str {
        "scheduler_delete"
    }

    fn description(&self) -> &str {
        "Delete a calendar event. Requires explicit approval. Permanent — no recovery."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "eventId": {"type": "string"}
            },
            "required": ["eventId"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let event_id = match require_str(call, "eventId") {
            Ok(v) => v,
            Err(e) => return e,
        };
        ToolOutput::ok(&call.id, format!("deleted event {event_id}; eventId={event_id}"))
    }
}

// ─── reminder_create ─────────────────────────────────────────────────────────

pub struct ReminderCreateTool;

#[async_trait]
impl Tool for ReminderCreateTool {
    fn name(&self) -> &str {
        "reminder_create"
    }

    fn description(&self) -> &str {
        "Create a one-off reminder for the user. Requires explicit approval."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "datetime": {"type": "string", "description": "RFC3339 timestamp"},
                "message": {"type": "string"}
            },
            "required": ["datetime", "message"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let datetime = match require_rfc3339(call, "datetime") {
            Ok(v) => v,
            Err(e) => return e,
        };
        if let Err(e) = require_str(call, "message") {
            return e;
        }
        let reminder_id = synthetic_id("rem");
        ToolOutput::ok(
            &call.id,
            format!("reminder set for {datetime}; reminderId={reminder_id}"),
        )
    }
}

// ─── notify_user ─────────────────────────────────────────────────────────────

pub struct NotifyUserTool;

#[async_trait]
impl Tool for NotifyUserTool {
    fn name(&self) -> &str {
        "notify_user"
    }

    fn description(&self) -> &str {
        "Send a non-destructive notification to the user. No external side effect beyond the \
         user's own inbox — runs without approval."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {"type": "string"}
            },
            "required": ["message"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let message = match require_str(call, "message") {
            Ok(v) => v,
            Err(e) => return e,
        };
        ToolOutput::ok(&call.id, format!("notified user: {message}"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
