//! Pulls the goal, system prompt, tool results, and agent reminders out
//! of the Host's structured prompt messages (§4.9).
//!
//! Prompt messages arrive as untyped JSON the same way checkpoints do, so
//! this stays a set of free functions over `serde_json::Value` rather
//! than a typed message model the rest of the crate would have to keep
//! in lockstep with the Host's own evolving shape.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static RE_WRAPPED_REMINDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<system-reminder>The user sent the following message:\n(.*?)\nPlease address this message and continue with your tasks\.</system-reminder>").unwrap()
});
static RE_ANY_REMINDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<system-reminder>(.*?)</system-reminder>").unwrap());
static RE_URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").unwrap());
static RE_TRIPLE_BLANK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

fn role_is(message: &Value, role: &str) -> bool {
    message.get("role").and_then(Value::as_str) == Some(role)
}

fn text_parts(message: &Value) -> Vec<&Value> {
    message
        .get("parts")
        .and_then(Value::as_array)
        .map(|parts| parts.iter().filter(|p| p.get("type").and_then(Value::as_str) == Some("text")).collect())
        .unwrap_or_default()
}

fn last_message_with_role<'a>(messages: &'a [Value], role: &str) -> Option<&'a Value> {
    messages.iter().rev().find(|m| role_is(m, role))
}

/// Text content of the last user message, with `<system-reminder>` blocks
/// removed except the wrapped-user form, whose inner text is preserved.
pub fn extract_goal(messages: &[Value]) -> String {
    let Some(last_user) = last_message_with_role(messages, "user") else {
        return String::new();
    };
    let raw: String = text_parts(last_user)
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    strip_system_reminders(&raw)
}

fn strip_system_reminders(text: &str) -> String {
    let preserved = RE_WRAPPED_REMINDER.replace_all(text, "$1");
    RE_ANY_REMINDER.replace_all(&preserved, "").to_string()
}

/// Concatenates `content` of `role: system` messages (string content
/// only) with `\n`.
pub fn extract_system_prompt(messages: &[Value]) -> String {
    messages
        .iter()
        .filter(|m| role_is(m, "system"))
        .filter_map(|m| m.get("content").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Removes Host-identity phrases and URLs, rewrites the Host product
/// name to the Service product name, and collapses triple-blank lines to
/// double.
pub fn sanitize_system_prompt(prompt: &str) -> String {
    let rewritten = prompt.replace("OpenCode", "GitLab Duo").replace("opencode", "GitLab Duo");
    let without_urls = RE_URL.replace_all(&rewritten, "");
    RE_TRIPLE_BLANK.replace_all(&without_urls, "\n\n").to_string()
}

/// From the last user message's text parts: synthetic parts are taken
/// whole (trimmed) as complete reminders; non-synthetic parts are
/// scanned for every `<system-reminder>...</system-reminder>` match.
pub fn extract_agent_reminders(messages: &[Value]) -> Vec<String> {
    let Some(last_user) = last_message_with_role(messages, "user") else {
        return Vec::new();
    };
    let mut reminders = Vec::new();
    for part in text_parts(last_user) {
        let text = part.get("text").and_then(Value::as_str).unwrap_or_default();
        let synthetic = part.get("synthetic").and_then(Value::as_bool).unwrap_or(false);
        if synthetic {
            reminders.push(text.trim().to_string());
        } else {
            for cap in RE_ANY_REMINDER.captures_iter(text) {
                reminders.push(cap[0].to_string());
            }
        }
    }
    reminders
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolResultValue {
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Every `tool-result`/`tool-error` part across all messages, normalized
/// across the `output: {type, value}` shape and the legacy `result`
/// field.
pub fn extract_tool_results(messages: &[Value]) -> Vec<(String, ToolResultValue)> {
    let mut out = Vec::new();
    for message in messages {
        let Some(parts) = message.get("parts").and_then(Value::as_array) else {
            continue;
        };
        for part in parts {
            let part_type = part.get("type").and_then(Value::as_str).unwrap_or("");
            if part_type != "tool-result" && part_type != "tool-error" {
                continue;
            }
            let Some(tool_call_id) = part.get("toolCallId").and_then(Value::as_str) else {
                continue;
            };
            out.push((tool_call_id.to_string(), parse_tool_output(part)));
        }
    }
    out
}

fn parse_tool_output(part: &Value) -> ToolResultValue {
    if let Some(output) = part.get("output") {
        let output_type = output.get("type").and_then(Value::as_str).unwrap_or("");
        return match output_type {
            "text" => ToolResultValue {
                output: output.get("value").and_then(Value::as_str).map(str::to_string),
                error: None,
            },
            "json" => ToolResultValue {
                output: output.get("value").map(|v| v.to_string()),
                error: None,
            },
            "error-text" => ToolResultValue {
                output: None,
                error: output.get("value").and_then(Value::as_str).map(str::to_string),
            },
            "error-json" => ToolResultValue {
                output: None,
                error: output.get("value").map(|v| v.to_string()),
            },
            "content" => {
                let joined = output
                    .get("value")
                    .and_then(Value::as_array)
                    .map(|parts| {
                        parts
                            .iter()
                            .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                            .filter_map(|p| p.get("text").and_then(Value::as_str))
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                ToolResultValue {
                    output: Some(joined),
                    error: None,
                }
            }
            _ => ToolResultValue::default(),
        };
    }

    if let Some(result) = part.get("result") {
        return match result {
            Value::String(s) => ToolResultValue {
                output: Some(s.clone()),
                error: None,
            },
            other => ToolResultValue {
                output: Some(other.to_string()),
                error: None,
            },
        };
    }

    ToolResultValue::default()
}
