// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! System Prompt Assembler (C11, §4.11).
//!
//! Restructures the teacher's named-optional-block composition pattern
//! (each block individually formatted and conditionally concatenated) around
//! the coordinator persona, dropping the skills/agents/knowledge-base
//! discovery sections that have no counterpart here.

use crate::types::DelegationTarget;

/// Optional context blocks supplied by the external collaborator (project
/// detection, memory, working directory) that the coordinator's prompt is
/// composed from.
#[derive(Debug, Default, Clone)]
pub struct PromptContext {
    /// Combined project + memory context block for the session.
    pub system_context: Option<String>,
    /// Absolute path to the project root, if one is bound.
    pub working_directory: Option<String>,
}

const COORDINATOR_PERSONA: &str = "\
You are CHAPO, a coordinating agent. You do not perform work yourself beyond \
answering directly known questions; for anything requiring file edits, \
external communication, or research you delegate to a specialized sub-agent.";

const INSTRUCTION_TAIL_DE: &str = "\
Anweisungen:
- Delegiere Entwicklungsaufgaben an DEVO, Kommunikationsaufgaben an CAIO und \
Rechercheaufgaben an SCOUT.
- Nenne in einer Delegation niemals konkrete Tool-Namen; beschreibe nur das Ziel.
- Nutze delegateParallel nur für wirklich unabhängige Teilaufgaben.
- Nutze askUser nur, wenn eine Rückfrage wirklich nötig ist.
- Antworte ohne Tool-Aufruf, wenn die Antwort bereits bekannt ist.";

/// Compose the coordinator's system prompt for one session.
pub fn coordinator_system_prompt(ctx: &PromptContext) -> String {
    let mut blocks = vec![COORDINATOR_PERSONA.to_string()];
    if let Some(sc) = &ctx.system_context {
        if !sc.trim().is_empty() {
            blocks.push(sc.clone());
        }
    }
    if let Some(wd) = &ctx.working_directory {
        blocks.push(format!("Working Directory: {wd}"));
    }
    blocks.push(INSTRUCTION_TAIL_DE.to_string());
    blocks.join("\n\n")
}

/// Domain-scoped persona for a sub-agent (§4.5, §4.11). Every sub-agent
/// prompt states its domain and forbids naming concrete tools in objectives
/// it receives from upstream, matching the coordinator's own instruction.
pub fn sub_agent_system_prompt(target: DelegationTarget) -> String {
    let (domain_line, focus) = match target {
        DelegationTarget::Devo => (
            "Du bist DEVO, ein auf Softwareentwicklung spezialisierter Agent.",
            "Du bearbeitest Code-Änderungen, Bugfixes und Tests.",
        ),
        DelegationTarget::Caio => (
            "Du bist CAIO, ein auf Kommunikation spezialisierter Agent.",
            "Du verfasst Nachrichten, erstellst Tickets und koordinierst Termine.",
        ),
        DelegationTarget::Scout => (
            "Du bist SCOUT, ein auf Recherche spezialisierter Agent.",
            "Du durchsuchst Codebasis und/oder Web nach relevanten Informationen.",
        ),
    };
    format!(
        "{domain_line}\n{focus}\n\
         Objectives, die du von der koordinierenden Instanz erhältst, nennen \
         niemals konkrete Tool-Namen — beschreibe deine Ergebnisse ebenso in \
         Zielbegriffen, nicht in Tool-Aufrufen.\n\
         Wenn eine Aufgabe außerhalb deines Verantwortungsbereichs liegt oder \
         eskaliert werden muss, rufe escalateToChapo auf."
    )
}
