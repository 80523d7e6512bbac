// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod apply_patch;
pub mod delete_file;
pub mod edit_file;
pub mod fs;
pub mod glob_file_search;
pub mod grep;
pub mod list_dir;
pub mod read_file;
pub mod run_terminal_command;
pub mod web_fetch;
pub mod web_search;
pub mod write;

// ─── OutputCategory contract tests ───────────────────────────────────────────
//
// Each builtin tool that overrides `output_category()` is verified here so
// that renames or copy-paste errors are caught at compile time with a clear
// failure message.  Tools that intentionally use the default (Generic) are
// also listed so that adding an override never silently goes un-reviewed.
#[cfg(test)]
mod output_category_tests {
    use crate::tool::OutputCategory;
    use crate::Tool;

    // ── HeadTail tools (terminal / process output) ────────────────────────────

    #[test]
    fn run_terminal_command_is_headtail() {
        let t = super::run_terminal_command::RunTerminalCommandTool { timeout_secs: 30 };
        assert_eq!(t.output_category(), OutputCategory::HeadTail);
    }

    // ── MatchList tools (ordered result sets) ────────────────────────────────

    #[test]
    fn grep_tool_is_matchlist() {
        let t = super::grep::GrepTool;
        assert_eq!(t.output_category(), OutputCategory::MatchList);
    }

    // ── FileContent tools (file reads) ────────────────────────────────────────

    #[test]
    fn read_file_is_filecontent() {
        let t = super::read_file::ReadFileTool;
        assert_eq!(t.output_category(), OutputCategory::FileContent);
    }

    // ── Generic tools (no override — hard truncation) ─────────────────────────

    #[test]
    fn write_tool_is_generic() {
        let t = super::write::WriteTool;
        assert_eq!(t.output_category(), OutputCategory::Generic);
    }

    #[test]
    fn list_dir_is_generic() {
        let t = super::list_dir::ListDirTool;
        assert_eq!(t.output_category(), OutputCategory::Generic);
    }

    #[test]
    fn edit_file_is_generic() {
        let t = super::edit_file::EditFileTool;
        assert_eq!(t.output_category(), OutputCategory::Generic);
    }

    #[test]
    fn delete_file_is_generic() {
        let t = super::delete_file::DeleteFileTool;
        assert_eq!(t.output_category(), OutputCategory::Generic);
    }

    #[test]
    fn web_fetch_is_generic() {
        let t = super::web_fetch::WebFetchTool;
        assert_eq!(t.output_category(), OutputCategory::Generic);
    }

    #[test]
    fn web_search_is_generic() {
        let t = super::web_search::WebSearchTool { api_key: None };
        assert_eq!(t.output_category(), OutputCategory::Generic);
    }
}
