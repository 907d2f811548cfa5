//! Bridge-tool JSON payload parsing and validation (§6).
//!
//! Five sentinel `run_command` program names route to dedicated Host
//! tools. Validation failures never throw — they turn into a synthetic
//! `invalid` tool call the Host can render, the same "structured error
//! instead of a raw exception" convention `vscode_tools_mcp::call_tool`
//! uses when an unknown tool name is invoked: the error becomes the
//! `CallToolResult`, not a panic.

use serde_json::{json, Map, Value};

use crate::tool_mapper::HostToolCall;

pub const TODO_READ: &str = "__todo_read__";
pub const TODO_WRITE: &str = "__todo_write__";
pub const WEBFETCH: &str = "__webfetch__";
pub const QUESTION: &str = "__question__";
pub const SKILL: &str = "__skill__";

pub const PROGRAM_NAMES: &[&str] = &[TODO_READ, TODO_WRITE, WEBFETCH, QUESTION, SKILL];

fn host_tool_name(program: &str) -> &'static str {
    match program {
        TODO_READ => "todoread",
        TODO_WRITE => "todowrite",
        WEBFETCH => "webfetch",
        QUESTION => "question",
        SKILL => "skill",
        _ => "invalid",
    }
}

/// Strip one layer of wrapping `'...'` or `"..."` quotes, if present.
fn unwrap_once(raw: &str) -> &str {
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return &raw[1..raw.len() - 1];
        }
    }
    raw
}

/// Validate a raw bridge payload for `program` and produce the resulting
/// Host tool call — either the mapped bridge tool, or a synthetic
/// `invalid` call carrying a descriptive error.
pub fn dispatch(program: &str, raw_payload: &str) -> HostToolCall {
    match validate(program, raw_payload) {
        Ok(args) => HostToolCall::new(host_tool_name(program), args),
        Err(error) => HostToolCall::new(
            "invalid",
            json!({ "tool": host_tool_name(program), "error": error }),
        ),
    }
}

fn validate(program: &str, raw_payload: &str) -> Result<Value, String> {
    let unwrapped = unwrap_once(raw_payload.trim());
    let value: Value = serde_json::from_str(unwrapped)
        .map_err(|_| format!("{program} payload is not valid JSON"))?;
    let obj = value
        .as_object()
        .ok_or_else(|| format!("{program} payload must be a JSON object"))?;

    match program {
        TODO_WRITE => validate_todowrite(obj),
        WEBFETCH => validate_webfetch(obj),
        QUESTION => validate_question(obj),
        SKILL => validate_skill(obj),
        TODO_READ => Ok(Value::Object(obj.clone())),
        other => Err(format!("unknown bridge program {other}")),
    }
}

const TODO_STATUSES: &[&str] = &["pending", "in_progress", "completed", "cancelled"];
const TODO_PRIORITIES: &[&str] = &["high", "medium", "low"];

fn validate_todowrite(obj: &Map<String, Value>) -> Result<Value, String> {
    let todos = obj
        .get("todos")
        .and_then(Value::as_array)
        .ok_or("todowrite payload requires a todos array")?;
    for (i, todo) in todos.iter().enumerate() {
        let t = todo
            .as_object()
            .ok_or_else(|| format!("todos[{i}] must be an object"))?;
        let content = t
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("todos[{i}].content must be a string"))?;
        if content.is_empty() {
            return Err(format!("todos[{i}].content must not be empty"));
        }
        let status = t
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("todos[{i}].status must be a string"))?;
        if !TODO_STATUSES.contains(&status) {
            return Err(format!("todos[{i}].status must be one of {TODO_STATUSES:?}"));
        }
        let priority = t
            .get("priority")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("todos[{i}].priority must be a string"))?;
        if !TODO_PRIORITIES.contains(&priority) {
            return Err(format!("todos[{i}].priority must be one of {TODO_PRIORITIES:?}"));
        }
    }
    Ok(Value::Object(obj.clone()))
}

const WEBFETCH_FORMATS: &[&str] = &["text", "markdown", "html"];

fn validate_webfetch(obj: &Map<String, Value>) -> Result<Value, String> {
    obj.get("url")
        .and_then(Value::as_str)
        .ok_or("webfetch payload requires a url string")?;
    if let Some(format) = obj.get("format") {
        let f = format.as_str().ok_or("webfetch format must be a string")?;
        if !WEBFETCH_FORMATS.contains(&f) {
            return Err(format!("webfetch format must be one of {WEBFETCH_FORMATS:?}"));
        }
    }
    if let Some(timeout) = obj.get("timeout") {
        let t = timeout.as_f64().ok_or("webfetch timeout must be a number")?;
        if !(t > 0.0) {
            return Err("webfetch timeout must be positive".to_string());
        }
    }
    Ok(Value::Object(obj.clone()))
}

fn validate_question(obj: &Map<String, Value>) -> Result<Value, String> {
    let questions = obj
        .get("questions")
        .and_then(Value::as_array)
        .ok_or("question payload requires a questions array")?;
    if questions.is_empty() {
        return Err("question payload requires at least one question".to_string());
    }
    for (i, q) in questions.iter().enumerate() {
        let qo = q
            .as_object()
            .ok_or_else(|| format!("questions[{i}] must be an object"))?;
        qo.get("question")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("questions[{i}].question must be a string"))?;
        qo.get("header")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("questions[{i}].header must be a string"))?;
        let options = qo
            .get("options")
            .and_then(Value::as_array)
            .ok_or_else(|| format!("questions[{i}].options must be an array"))?;
        if options.is_empty() {
            return Err(format!("questions[{i}].options must have at least one entry"));
        }
        for (j, opt) in options.iter().enumerate() {
            let oo = opt
                .as_object()
                .ok_or_else(|| format!("questions[{i}].options[{j}] must be an object"))?;
            oo.get("label")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("questions[{i}].options[{j}].label must be a string"))?;
            oo.get("description")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("questions[{i}].options[{j}].description must be a string"))?;
        }
        if let Some(multiple) = qo.get("multiple") {
            multiple
                .as_bool()
                .ok_or_else(|| format!("questions[{i}].multiple must be a bool"))?;
        }
    }
    Ok(Value::Object(obj.clone()))
}

fn validate_skill(obj: &Map<String, Value>) -> Result<Value, String> {
    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .ok_or("skill payload requires a name string")?;
    if name.trim().is_empty() {
        return Err("skill name must not be empty after trim".to_string());
    }
    Ok(Value::Object(obj.clone()))
}
