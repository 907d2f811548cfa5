//! Extracts agent text deltas and unhandled tool requests from successive
//! checkpoint snapshots.
//!
//! A checkpoint is the cumulative `ui_chat_log`: each new snapshot is a
//! superset-with-growth of the previous one, so deltas are computed by
//! prefix comparison rather than diffing arbitrary text. This is the same
//! "state carried between calls, output derived from the delta against
//! it" shape as `ToolCallTracker` in `vscodelm::session_actor`, just over
//! chat-log entries instead of tool-call fragments.

use std::collections::HashSet;

use serde_json::Value;
use uuid::Uuid;

const AGENT: &str = "agent";
const REQUEST: &str = "request";

#[derive(Debug, Clone, PartialEq)]
pub struct ChatLogEntry {
    pub message_type: String,
    pub content: String,
    pub correlation_id: Option<String>,
    pub tool_info: Option<ToolInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInfo {
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointState {
    log: Vec<ChatLogEntry>,
    processed_request_indices: HashSet<usize>,
}

impl CheckpointState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedToolRequest {
    pub request_id: String,
    pub tool_name: String,
    pub args: Value,
}

fn parse_log(raw: &str) -> Vec<ChatLogEntry> {
    let Ok(doc) = serde_json::from_str::<Value>(raw) else {
        return Vec::new();
    };
    let Some(entries) = doc
        .get("channel_values")
        .and_then(|v| v.get("ui_chat_log"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|e| {
            let obj = e.as_object()?;
            let message_type = obj.get("message_type")?.as_str()?.to_string();
            if !matches!(message_type.as_str(), "user" | "agent" | "tool" | REQUEST) {
                return None;
            }
            let content = obj
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let correlation_id = obj
                .get("correlation_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            let tool_info = obj.get("tool_info").and_then(|ti| {
                let tio = ti.as_object()?;
                Some(ToolInfo {
                    name: tio.get("name")?.as_str()?.to_string(),
                    args: tio.get("args").cloned().unwrap_or(Value::Null),
                })
            });
            Some(ChatLogEntry {
                message_type,
                content,
                correlation_id,
                tool_info,
            })
        })
        .collect()
}

/// Extract agent text deltas from a new checkpoint snapshot, updating
/// `state.log` to the new log. Non-agent entries are retained in state
/// but never produce deltas.
pub fn extract_agent_text_deltas(raw: &str, state: &mut CheckpointState) -> Vec<String> {
    let new_log = parse_log(raw);
    let mut deltas = Vec::new();

    for (i, entry) in new_log.iter().enumerate() {
        if entry.message_type != AGENT {
            continue;
        }
        match state.log.get(i) {
            Some(prev) if prev.message_type == AGENT => {
                if entry.content == prev.content {
                    // nothing new
                } else if let Some(suffix) = entry.content.strip_prefix(prev.content.as_str()) {
                    if !suffix.is_empty() {
                        deltas.push(suffix.to_string());
                    }
                } else {
                    deltas.push(entry.content.clone());
                }
            }
            _ => {
                if !entry.content.is_empty() {
                    deltas.push(entry.content.clone());
                }
            }
        }
    }

    state.log = new_log;
    deltas
}

/// Extract tool requests from `request`-typed entries not already
/// processed. Defined for completeness: the session uses standalone tool
/// actions instead of this path (see the design notes on the call site
/// being intentionally disabled).
pub fn extract_tool_requests(raw: &str, state: &mut CheckpointState) -> Vec<ExtractedToolRequest> {
    let new_log = parse_log(raw);
    let mut out = Vec::new();

    for (i, entry) in new_log.iter().enumerate() {
        if entry.message_type != REQUEST {
            continue;
        }
        if state.processed_request_indices.contains(&i) {
            continue;
        }
        let Some(tool_info) = &entry.tool_info else {
            continue;
        };
        let request_id = entry
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        out.push(ExtractedToolRequest {
            request_id,
            tool_name: tool_info.name.clone(),
            args: tool_info.args.clone(),
        });
        state.processed_request_indices.insert(i);
    }

    out
}
