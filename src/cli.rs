// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::Parser;

/// chapo — run one request through the multi-agent decision loop and print
/// the resulting outcome.
///
/// This binary is a thin illustrative harness around `chapo_core::Coordinator`.
/// It does not implement a transport (HTTP/WebSocket/CLI-session protocol);
/// a future transport crate wraps the same typed `Coordinator` API this
/// binary calls directly.
#[derive(Parser, Debug)]
#[command(name = "chapo", version, about)]
pub struct Cli {
    /// The request to send to the coordinator.
    pub message: String,

    /// Path to an additional config file, merged on top of the discovered
    /// search-path layers (see `chapo_config::load`).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Emit verbose tracing output on stderr.
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Print the final `LoopOutcome` as JSON instead of plain text.
    #[arg(long)]
    pub json: bool,
}
