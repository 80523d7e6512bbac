// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use chapo_core::{
    AgentAllowlists, Coordinator, CoordinatorConfig, CoordinatorDeps, ErrorHandler, PromptContext,
    SessionId, SessionInbox, SessionStore, SubAgentRunner,
};
use chapo_tools::{
    ApplyPatchTool, DeleteFileTool, EditFileTool, GlobFileSearchTool, GrepTool, ListDirTool,
    NotifyUserTool, ReadFileTool, ReminderCreateTool, RunTerminalCommandTool, SchedulerCreateTool,
    SchedulerDeleteTool, SchedulerUpdateTool, SendEmailTool, TaskforgeCommentTool,
    TaskforgeCreateTool, TaskforgeMoveTool, ToolRegistry, WebFetchTool, WebSearchTool, WriteTool,
};

use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = chapo_config::load(cli.config.as_deref()).context("loading configuration")?;
    let model = chapo_model::from_config(&config.model).context("constructing model provider")?;
    let model: Arc<dyn chapo_model::ModelProvider> = Arc::from(model);

    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool);
    registry.register(WriteTool);
    registry.register(EditFileTool);
    registry.register(DeleteFileTool);
    registry.register(GlobFileSearchTool);
    registry.register(GrepTool);
    registry.register(ListDirTool);
    registry.register(RunTerminalCommandTool::default());
    registry.register(WebFetchTool);
    registry.register(WebSearchTool::default());
    registry.register(ApplyPatchTool);
    registry.register(SendEmailTool);
    registry.register(TaskforgeCreateTool);
    registry.register(TaskforgeMoveTool);
    registry.register(TaskforgeCommentTool);
    registry.register(SchedulerCreateTool);
    registry.register(SchedulerUpdateTool);
    registry.register(SchedulerDeleteTool);
    registry.register(ReminderCreateTool);
    registry.register(NotifyUserTool);
    let tools = Arc::new(registry);

    // Every registered tool is available to every delegated agent until a
    // per-agent policy is introduced in the config schema; the coordinator
    // itself never calls tools directly, only DEVO/CAIO/SCOUT do.
    let all_names: HashSet<String> = tools.schemas().into_iter().map(|s| s.name).collect();
    let allowlists = AgentAllowlists {
        devo: all_names.clone(),
        caio: all_names.clone(),
        scout: all_names,
    };

    let error_handler = Arc::new(ErrorHandler::new(config.agent.error_handler_max_retries));
    let sub_agent = Arc::new(SubAgentRunner::new(
        model.clone(),
        tools.clone(),
        error_handler.clone(),
        config.agent.sub_agent_max_iterations,
    ));

    let deps = CoordinatorDeps {
        model,
        tools,
        sessions: Arc::new(SessionStore::new()),
        inbox: Arc::new(SessionInbox::new()),
        error_handler,
        sub_agent,
        allowlists,
        config: CoordinatorConfig::from(&config.agent),
        self_validator: None,
    };
    let coordinator = Coordinator::new(deps);

    let session = SessionId::new();
    let ctx = PromptContext::default();
    let outcome = coordinator.handle_request(session, cli.message.clone(), ctx).await;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("status: {:?}", outcome.status);
        println!("{}", outcome.answer);
        if let Some(question) = &outcome.question {
            println!("\nwaiting for input: {}", question);
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chapo=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr)).with(filter).init();
}
