// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Answer Validator (C7, §4.7).
//!
//! The regex heuristics are kept as pure, case-insensitive, independently
//! testable functions compiled once via `once_cell::Lazy<Regex>`, the same
//! technique `chapo_tools::policy` uses for glob-to-regex compilation. The
//! evidence/wording tables are plain data, not hardcoded branches.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::EvidenceItem;

// ── Inline-clarification conversion ─────────────────────────────────────────

static CATCH_PHRASES: &[&str] = &["mach es besser", "mach das besser", "fix it", "do it"];

static VAGUE_VERBS: &[&str] = &["mach", "fix", "do", "change", "update", "ändere", "verbessere", "repariere"];
static AMBIGUOUS_PRONOUNS: &[&str] = &["es", "das", "it", "this", "that"];
static ANCHOR_NOUNS: &[&str] = &["file", "function", "endpoint", "datei", "funktion"];

static CLARIFICATION_CUES: &[&str] = &[
    "was", "welche", "wie", "meinst", "genau", "konkret", "what", "which", "can you", "clarify", "specify", "details",
];

static QUESTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\n?]{6,220}\?").unwrap());
static FALLBACK_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[^\n]*\?\s*$").unwrap());

fn has_anchor(lower: &str) -> bool {
    lower.contains('"')
        || lower.contains('/')
        || lower.contains('.')
        || lower.chars().any(|c| c.is_ascii_digit())
        || ANCHOR_NOUNS.iter().any(|n| lower.contains(n))
}

/// Whether the user's original request is ambiguous (§4.7).
pub fn is_ambiguous_request(text: &str) -> bool {
    if text.chars().count() > 120 {
        return false;
    }
    let lower = text.to_lowercase();
    if CATCH_PHRASES.iter().any(|p| lower.contains(p)) {
        return true;
    }
    let words: Vec<&str> = lower.split_whitespace().collect();
    let has_vague_verb = VAGUE_VERBS.iter().any(|v| lower.contains(v));
    let has_pronoun = AMBIGUOUS_PRONOUNS.iter().any(|p| words.contains(p));
    let short_enough = words.len() <= 10;
    let no_anchor = !has_anchor(&lower);
    has_vague_verb && has_pronoun && short_enough && no_anchor
}

/// Extract the first question-terminated substring, falling back to the
/// first line ending in `?`, falling back to a canned prompt (§4.7).
pub fn extract_question(text: &str) -> String {
    if let Some(m) = QUESTION_RE.find(text) {
        return m.as_str().trim().to_string();
    }
    if let Some(m) = FALLBACK_LINE_RE.find(text) {
        return m.as_str().trim().to_string();
    }
    "Kannst du das genauer spezifizieren?".to_string()
}

/// Whether `response` looks like a clarification question rather than a
/// final answer (§4.7).
pub fn looks_like_clarification(response: &str) -> bool {
    if !response.contains('?') {
        return false;
    }
    let question = extract_question(response);
    let lower = question.to_lowercase();
    let has_cue = CLARIFICATION_CUES.iter().any(|c| lower.starts_with(c) || lower.contains(c));
    has_cue || question.chars().count() <= 220
}

// ── Evidence-of-side-effects check ──────────────────────────────────────────

/// Tool-name prefix to claim-token table (§4.7). Data-driven so locale
/// additions do not require code changes.
pub static EVIDENCE_MAP: &[(&str, &[&str])] = &[
    ("send_email", &["email", "mail", "gesendet", "zugestellt"]),
    ("taskforge_", &["ticket", "task", "aufgabe", "erstellt", "verschoben", "kommentar"]),
    ("scheduler_", &["scheduler", "termin", "kalender", "reminder", "erinnerung"]),
    ("reminder_create", &["scheduler", "termin", "kalender", "reminder", "erinnerung"]),
    ("notify_user", &["notification", "benachrichtigung", "notify"]),
];

/// Result of an external self-validator (§4.7).
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub confidence: f32,
    pub is_complete: bool,
    pub issues: Vec<String>,
    pub suggestion: Option<String>,
}

fn claims_external_action(answer_lower: &str) -> bool {
    EVIDENCE_MAP.iter().any(|(_, tokens)| tokens.iter().any(|t| answer_lower.contains(t)))
}

fn mentions_hallucination(issues: &[String]) -> bool {
    issues.iter().any(|i| {
        let l = i.to_lowercase();
        l.contains("hallucin") || l.contains("invent") || l.contains("erfunden")
    })
}

fn has_matching_successful_evidence(answer_lower: &str, evidence: &[EvidenceItem]) -> bool {
    evidence.iter().any(|e| {
        if !e.success || e.pending_approval {
            return false;
        }
        EVIDENCE_MAP
            .iter()
            .filter(|(prefix, _)| e.tool_name.starts_with(prefix))
            .any(|(_, tokens)| tokens.iter().any(|t| answer_lower.contains(t)))
    })
}

const FALLBACK_ANSWER: &str = "Ich konnte das Ergebnis nicht zuverlässig bestätigen.";

/// Validate and possibly replace a proposed final answer (§4.7).
///
/// Returns the (possibly replaced) answer text.
pub fn validate_and_normalize(
    answer: &str,
    report: Option<&ValidationReport>,
    evidence: &[EvidenceItem],
) -> String {
    let mut out = answer.to_string();

    if let Some(r) = report {
        let lower = answer.to_lowercase();
        let replace = !r.is_complete
            && r.confidence < 0.4
            && mentions_hallucination(&r.issues)
            && claims_external_action(&lower)
            && !has_matching_successful_evidence(&lower, evidence);
        if replace {
            return FALLBACK_ANSWER.to_string();
        }
    }

    if evidence.iter().any(|e| e.tool_name == "send_email" && e.success) {
        out = normalize_email_wording(&out);
    }
    out
}

static HEDGE_PHRASES: &[&str] =
    &["vielleicht", "könnte", "wahrscheinlich", "ich glaube", "maybe", "might", "probably", "i think"];

/// Hedging phrases found in a final answer, plus any validator-reported
/// issues, surfaced to the coordinator's `decision_path` event as
/// `unresolvedAssumptions` (§4.9, §6).
pub fn unresolved_assumptions(text: &str, report: Option<&ValidationReport>) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut out: Vec<String> = HEDGE_PHRASES.iter().filter(|p| lower.contains(**p)).map(|p| p.to_string()).collect();
    if let Some(r) = report {
        out.extend(r.issues.iter().cloned());
    }
    out
}

/// Rewrite phrasing that overstates email delivery (§4.7).
pub fn normalize_email_wording(text: &str) -> String {
    let mut out = text.to_string();
    for (from, to) in [
        ("wurde erfolgreich gesendet", "wurde vom E-Mail-Provider zur Zustellung angenommen"),
        ("wurde erfolgreich versendet", "wurde vom E-Mail-Provider zur Zustellung angenommen"),
        ("ist jetzt unterwegs", "ist beim Provider in der Zustellung"),
    ] {
        out = out.replace(from, to);
    }
    out
}
