//! Pure translation of a Service-native tool invocation into one or more
//! Host-native tool calls.
//!
//! This is the inverse of [`crate::action_mapper`]: where the action mapper
//! turns a standalone Service action into a normalized request, this module
//! turns the resolved `(name, args)` pair — wherever it came from — into
//! what the Host actually calls. Kept as free functions over
//! `serde_json::Value` rather than a typed request enum, the same way
//! `conductor::mcp_bridge` treats every frame crossing the stdio/TCP
//! boundary as an opaque JSON line until a specific field is needed.

use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::LazyLock;

use crate::bridge_tools;

#[derive(Debug, Clone, PartialEq)]
pub struct HostToolCall {
    pub tool_name: String,
    pub args: Value,
}

impl HostToolCall {
    pub(crate) fn new(tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MapOutput {
    One(HostToolCall),
    Many(Vec<HostToolCall>),
}

impl MapOutput {
    pub fn into_vec(self) -> Vec<HostToolCall> {
        match self {
            MapOutput::One(c) => vec![c],
            MapOutput::Many(cs) => cs,
        }
    }
}

static BARE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_\-./=:@]+$").unwrap());

/// Shell-quote a single token: bare if it matches the safe-token regex,
/// else single-quoted with internal `'` escaped as `'\''`.
pub fn shell_quote(token: &str) -> String {
    if BARE_TOKEN.is_match(token) {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', "'\\''"))
    }
}

fn quote_preserving_expansion(token: &str) -> String {
    format!("\"{}\"", token.replace('\\', "\\\\").replace('"', "\\\""))
}

fn obj(args: &Value) -> Option<&Map<String, Value>> {
    args.as_object()
}

fn get_str(m: &Map<String, Value>, key: &str) -> Option<String> {
    m.get(key).and_then(Value::as_str).map(str::to_string)
}

fn get_first_str(m: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| get_str(m, k))
}

fn get_str_vec(m: &Map<String, Value>, key: &str) -> Vec<String> {
    m.get(key)
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn passthrough(name: &str, args: &Value) -> HostToolCall {
    HostToolCall::new(name, json!({ "name": name, "args": args }))
}

/// Map a resolved `(serviceToolName, args)` pair to one or more Host tool
/// calls.
pub fn map(name: &str, args: &Value) -> MapOutput {
    match name {
        "list_dir" => map_list_dir(args),
        "read_file" => map_read_file(name, args),
        "read_files" => map_read_files(name, args),
        "create_file_with_contents" => map_create_file(name, args),
        "edit_file" => map_edit_file(name, args),
        "find_files" => map_find_files(name, args),
        "grep" => map_grep(name, args),
        "mkdir" => map_mkdir(name, args),
        "shell_command" => map_shell_command(args),
        "run_command" => map_run_command(args),
        "run_git_command" => map_run_git_command(name, args),
        "gitlab_api_request" => map_gitlab_api_request(name, args),
        _ => MapOutput::One(passthrough(name, args)),
    }
}

fn map_list_dir(args: &Value) -> MapOutput {
    let directory = obj(args)
        .and_then(|m| get_str(m, "directory"))
        .unwrap_or_else(|| ".".to_string());
    MapOutput::One(HostToolCall::new("read", json!({ "filePath": directory })))
}

fn map_read_file(name: &str, args: &Value) -> MapOutput {
    let Some(m) = obj(args) else {
        return MapOutput::One(passthrough(name, args));
    };
    let Some(path) = get_first_str(m, &["file_path", "filepath", "filePath", "path"]) else {
        return MapOutput::One(passthrough(name, args));
    };
    let mut out = Map::new();
    out.insert("filePath".to_string(), Value::String(path));
    if let Some(offset) = m.get("offset") {
        out.insert("offset".to_string(), offset.clone());
    }
    if let Some(limit) = m.get("limit") {
        out.insert("limit".to_string(), limit.clone());
    }
    MapOutput::One(HostToolCall::new("read", Value::Object(out)))
}

fn map_read_files(name: &str, args: &Value) -> MapOutput {
    let Some(m) = obj(args) else {
        return MapOutput::One(passthrough(name, args));
    };
    let paths = get_str_vec(m, "file_paths");
    if paths.is_empty() {
        return MapOutput::One(passthrough(name, args));
    }
    MapOutput::Many(
        paths
            .into_iter()
            .map(|p| HostToolCall::new("read", json!({ "filePath": p })))
            .collect(),
    )
}

fn map_create_file(name: &str, args: &Value) -> MapOutput {
    let Some(m) = obj(args) else {
        return MapOutput::One(passthrough(name, args));
    };
    let (Some(path), Some(contents)) = (get_str(m, "file_path"), get_str(m, "contents")) else {
        return MapOutput::One(passthrough(name, args));
    };
    MapOutput::One(HostToolCall::new(
        "write",
        json!({ "filePath": path, "content": contents }),
    ))
}

fn map_edit_file(name: &str, args: &Value) -> MapOutput {
    let Some(m) = obj(args) else {
        return MapOutput::One(passthrough(name, args));
    };
    let (Some(path), Some(old), Some(new)) = (
        get_str(m, "file_path"),
        get_str(m, "old_str"),
        get_str(m, "new_str"),
    ) else {
        return MapOutput::One(passthrough(name, args));
    };
    MapOutput::One(HostToolCall::new(
        "edit",
        json!({ "filePath": path, "oldString": old, "newString": new }),
    ))
}

fn map_find_files(name: &str, args: &Value) -> MapOutput {
    let Some(pattern) = obj(args).and_then(|m| get_str(m, "name_pattern")) else {
        return MapOutput::One(passthrough(name, args));
    };
    MapOutput::One(HostToolCall::new("glob", json!({ "pattern": pattern })))
}

fn map_grep(name: &str, args: &Value) -> MapOutput {
    let Some(m) = obj(args) else {
        return MapOutput::One(passthrough(name, args));
    };
    let Some(pattern) = get_str(m, "pattern") else {
        return MapOutput::One(passthrough(name, args));
    };
    let case_insensitive = m.get("case_insensitive").and_then(Value::as_bool).unwrap_or(false);
    let pattern = if case_insensitive && !pattern.starts_with("(?i)") {
        format!("(?i){pattern}")
    } else {
        pattern
    };
    let mut out = Map::new();
    out.insert("pattern".to_string(), Value::String(pattern));
    if let Some(dir) = get_str(m, "search_directory") {
        out.insert("path".to_string(), Value::String(dir));
    }
    MapOutput::One(HostToolCall::new("grep", Value::Object(out)))
}

fn map_mkdir(name: &str, args: &Value) -> MapOutput {
    let Some(path) = obj(args).and_then(|m| get_str(m, "directory_path")) else {
        return MapOutput::One(passthrough(name, args));
    };
    let command = format!("mkdir -p {}", shell_quote(&path));
    MapOutput::One(HostToolCall::new("bash", json!({ "command": command })))
}

fn tokens_from(value: &Value) -> Vec<String> {
    match value {
        Value::Array(arr) => arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn map_shell_command(args: &Value) -> MapOutput {
    let Some(m) = obj(args) else {
        return MapOutput::One(passthrough("shell_command", args));
    };
    let Some(command_value) = m.get("command") else {
        return MapOutput::One(passthrough("shell_command", args));
    };
    if let Value::String(s) = command_value {
        if let Some((program, payload)) = split_bridge_invocation(s) {
            return MapOutput::One(bridge_tools::dispatch(&program, &payload));
        }
    }
    let tokens = tokens_from(command_value);
    let command = tokens.iter().map(|t| shell_quote(t)).collect::<Vec<_>>().join(" ");
    MapOutput::One(HostToolCall::new("bash", json!({ "command": command })))
}

/// Recognize the "<program> <json>" embedded-bridge-invocation form: the
/// command text begins with a sentinel program name followed by whitespace.
fn split_bridge_invocation(command: &str) -> Option<(String, String)> {
    let trimmed = command.trim_start();
    for program in bridge_tools::PROGRAM_NAMES {
        if let Some(rest) = trimmed.strip_prefix(program) {
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                return Some((program.to_string(), rest.trim_start().to_string()));
            }
        }
    }
    None
}

fn map_run_command(args: &Value) -> MapOutput {
    let Some(m) = obj(args) else {
        return MapOutput::One(passthrough("run_command", args));
    };
    if let Some(program) = get_str(m, "program") {
        if bridge_tools::PROGRAM_NAMES.contains(&program.as_str()) {
            let payload = m
                .get("arguments")
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .and_then(Value::as_str)
                .unwrap_or("");
            return MapOutput::One(bridge_tools::dispatch(&program, payload));
        }
    }
    let mut tokens = Vec::new();
    if let Some(program) = get_str(m, "program") {
        tokens.push(program);
    }
    tokens.extend(get_str_vec(m, "flags"));
    tokens.extend(get_str_vec(m, "arguments"));
    if tokens.is_empty() {
        if let Some(command_value) = m.get("command") {
            tokens = tokens_from(command_value);
        }
    }
    let command = tokens.iter().map(|t| shell_quote(t)).collect::<Vec<_>>().join(" ");
    MapOutput::One(HostToolCall::new("bash", json!({ "command": command })))
}

fn map_run_git_command(name: &str, args: &Value) -> MapOutput {
    let Some(m) = obj(args) else {
        return MapOutput::One(passthrough(name, args));
    };
    let Some(subcommand) = get_str(m, "command") else {
        return MapOutput::One(passthrough(name, args));
    };
    let mut command = format!("git {}", shell_quote(&subcommand));
    for arg in get_str_vec(m, "args") {
        command.push(' ');
        command.push_str(&shell_quote(&arg));
    }
    MapOutput::One(HostToolCall::new("bash", json!({ "command": command })))
}

fn map_gitlab_api_request(name: &str, args: &Value) -> MapOutput {
    let Some(m) = obj(args) else {
        return MapOutput::One(passthrough(name, args));
    };
    let Some(path) = get_str(m, "path") else {
        return MapOutput::One(passthrough(name, args));
    };
    let method = get_str(m, "method").unwrap_or_else(|| "GET".to_string());
    let body = get_str(m, "body");
    let url = format!("${{DUO_WORKFLOW_INSTANCE_URL}}/api/v4/{path}");

    let mut tokens = vec![
        "curl".to_string(),
        "-s".to_string(),
        "-X".to_string(),
        method,
        "-H".to_string(),
        quote_preserving_expansion("Authorization: Bearer $TOKEN"),
        "-H".to_string(),
        quote_preserving_expansion("Content-Type: application/json"),
    ];
    if let Some(body) = body {
        tokens.push("-d".to_string());
        tokens.push(shell_quote(&body));
    }
    tokens.push(shell_quote(&url));
    MapOutput::One(HostToolCall::new("bash", json!({ "command": tokens.join(" ") })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_tokens_emit_unquoted() {
        assert_eq!(shell_quote("foo-bar.txt"), "foo-bar.txt");
        assert_eq!(shell_quote("/a/b:c@d=e_f"), "/a/b:c@d=e_f");
    }

    #[test]
    fn unsafe_tokens_are_single_quoted_with_escape() {
        assert_eq!(shell_quote("hello world"), "'hello world'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn list_dir_defaults_to_cwd() {
        let out = map("list_dir", &json!({}));
        assert_eq!(
            out,
            MapOutput::One(HostToolCall::new("read", json!({ "filePath": "." })))
        );
    }

    #[test]
    fn read_file_resolves_any_path_alias() {
        let out = map("read_file", &json!({ "filepath": "a.txt", "offset": 3 }));
        assert_eq!(
            out,
            MapOutput::One(HostToolCall::new(
                "read",
                json!({ "filePath": "a.txt", "offset": 3 })
            ))
        );
    }

    #[test]
    fn read_file_without_path_falls_through() {
        let args = json!({ "weird": true });
        let out = map("read_file", &args);
        assert_eq!(out, MapOutput::One(passthrough("read_file", &args)));
    }

    #[test]
    fn read_files_expands_to_many() {
        let out = map("read_files", &json!({ "file_paths": ["a.txt", "b.txt"] }));
        assert_eq!(
            out,
            MapOutput::Many(vec![
                HostToolCall::new("read", json!({ "filePath": "a.txt" })),
                HostToolCall::new("read", json!({ "filePath": "b.txt" })),
            ])
        );
    }

    #[test]
    fn empty_read_files_passes_through() {
        let args = json!({ "file_paths": [] });
        assert_eq!(
            map("read_files", &args),
            MapOutput::One(passthrough("read_files", &args))
        );
    }

    #[test]
    fn grep_prefixes_case_insensitive_flag_once() {
        let out = map(
            "grep",
            &json!({ "pattern": "foo", "case_insensitive": true, "search_directory": "src" }),
        );
        assert_eq!(
            out,
            MapOutput::One(HostToolCall::new(
                "grep",
                json!({ "pattern": "(?i)foo", "path": "src" })
            ))
        );
    }

    #[test]
    fn mkdir_builds_mkdir_p_with_quoting() {
        let out = map("mkdir", &json!({ "directory_path": "a b" }));
        assert_eq!(
            out,
            MapOutput::One(HostToolCall::new("bash", json!({ "command": "mkdir -p 'a b'" })))
        );
    }

    #[test]
    fn run_command_dispatches_bridge_program() {
        let out = map(
            "run_command",
            &json!({
                "program": "__todo_write__",
                "arguments": ["{\"todos\":[{\"content\":\"x\",\"status\":\"pending\",\"priority\":\"high\"}]}"]
            }),
        );
        match out {
            MapOutput::One(call) => {
                assert_eq!(call.tool_name, "todowrite");
                assert_eq!(
                    call.args,
                    json!({"todos":[{"content":"x","status":"pending","priority":"high"}]})
                );
            }
            _ => panic!("expected single call"),
        }
    }

    #[test]
    fn run_command_surfaces_invalid_bridge_payload() {
        let out = map(
            "run_command",
            &json!({ "program": "__todo_write__", "arguments": ["{not json"] }),
        );
        match out {
            MapOutput::One(call) => {
                assert_eq!(call.tool_name, "invalid");
                assert_eq!(
                    call.args,
                    json!({"tool": "todowrite", "error": "__todo_write__ payload is not valid JSON"})
                );
            }
            _ => panic!("expected single call"),
        }
    }

    #[test]
    fn shell_command_embedded_bridge_form_is_recognized() {
        let out = map(
            "shell_command",
            &json!({ "command": "__skill__ {\"name\":\"rust-reviewer\"}" }),
        );
        match out {
            MapOutput::One(call) => {
                assert_eq!(call.tool_name, "skill");
                assert_eq!(call.args, json!({"name": "rust-reviewer"}));
            }
            _ => panic!("expected single call"),
        }
    }

    #[test]
    fn unrecognized_name_passes_through_unchanged() {
        let args = json!({ "foo": "bar" });
        assert_eq!(map("mystery_tool", &args), MapOutput::One(passthrough("mystery_tool", &args)));
    }
}
