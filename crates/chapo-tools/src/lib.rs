// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod actions;
pub mod builtin;
pub mod policy;
pub mod registry;
pub mod tool;

pub use policy::{ApprovalPolicy, ToolPolicy};
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{OutputCategory, Tool, ToolCall, ToolOutput, ToolOutputPart};

// Filesystem / codebase tools
pub use builtin::delete_file::DeleteFileTool;
pub use builtin::edit_file::EditFileTool;
pub use builtin::glob_file_search::GlobFileSearchTool;
pub use builtin::grep::GrepTool;
pub use builtin::list_dir::ListDirTool;
pub use builtin::read_file::ReadFileTool;
pub use builtin::run_terminal_command::RunTerminalCommandTool;
pub use builtin::write::WriteTool;

// Research tools
pub use builtin::web_fetch::WebFetchTool;
pub use builtin::web_search::WebSearchTool;

// Patch application (DEVO)
pub use builtin::apply_patch::ApplyPatchTool;

// External-action tools (C6/C7 evidence-mapping targets)
pub use actions::{
    NotifyUserTool, ReminderCreateTool, SchedulerCreateTool, SchedulerDeleteTool,
    SchedulerUpdateTool, SendEmailTool, TaskforgeCommentTool, TaskforgeCreateTool,
    TaskforgeMoveTool,
};
