//! Translates a standalone Service tool action into a normalized
//! `{requestId, toolName, args}` triple, using the inverse of the
//! tool-name mapper's forward schema.

use serde_json::Value;

use crate::protocol::{ToolAction, ToolActionKind};

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRequest {
    pub request_id: String,
    pub tool_name: String,
    pub args: Value,
}

/// Map a standalone action to a normalized tool request. Returns `None`
/// ("no request") when the action has no `requestID`, routes to
/// `runHTTPRequest` (handled locally by the session, never surfaced as a
/// tool request), or carries no recognizable payload.
pub fn map_action(action: &ToolAction) -> Option<NormalizedRequest> {
    let request_id = action.request_id.clone()?;

    if action.kind == ToolActionKind::RunMcpTool {
        let obj = action.args.as_object()?;
        let tool_name = obj.get("name")?.as_str()?.to_string();
        let args = obj.get("args").cloned().unwrap_or(Value::Null);
        return Some(NormalizedRequest {
            request_id,
            tool_name,
            args,
        });
    }

    let tool_name = match action.kind {
        ToolActionKind::RunReadFile => "read_file",
        ToolActionKind::RunReadFiles => "read_files",
        ToolActionKind::RunWriteFile => "create_file_with_contents",
        ToolActionKind::RunEditFile => "edit_file",
        ToolActionKind::RunShellCommand => "shell_command",
        ToolActionKind::RunCommand => "run_command",
        ToolActionKind::RunGitCommand => "run_git_command",
        ToolActionKind::RunHttpRequest => return None,
        ToolActionKind::ListDirectory => "list_dir",
        ToolActionKind::Grep => "grep",
        ToolActionKind::FindFiles => "find_files",
        ToolActionKind::Mkdir => "mkdir",
        ToolActionKind::RunMcpTool => unreachable!("handled above"),
    };

    Some(NormalizedRequest {
        request_id,
        tool_name: tool_name.to_string(),
        args: action.args.clone(),
    })
}
