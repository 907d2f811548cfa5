//! Wire types for both directions of the Service protocol and the
//! Host-facing stream.
//!
//! Client events (§4.7/§6) are plain `Serialize` types: we control their
//! shape entirely, so normal derives are enough. Service actions arrive as
//! untyped JSON and are decoded by hand in [`Action::parse`] — the
//! checkpoint JSON and the tool-action payloads are dynamic documents the
//! core doesn't own the schema of, so we walk `serde_json::Value` the way
//! `conductor::conductor::manage_proxy_capability` walks the `_meta`
//! object of an `InitializeRequest` it doesn't fully control either.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------
// Client -> Service events
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub enum ClientEvent {
    #[serde(rename = "startRequest")]
    StartRequest(StartRequest),
    #[serde(rename = "actionResponse")]
    ActionResponse(ActionResponse),
    #[serde(rename = "heartbeat")]
    Heartbeat(Heartbeat),
    #[serde(rename = "stopWorkflow")]
    StopWorkflow(StopWorkflow),
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// An item of `additional_context` attached to a start request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum AdditionalContextItem {
    OsInformation { content: String },
    UserRule { content: String },
    AgentContext { content: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalMarker {
    pub approval: Value,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(rename = "workflowID")]
    pub workflow_id: String,
    pub client_version: String,
    pub workflow_definition: String,
    pub goal: String,
    pub workflow_metadata: String,
    pub client_capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_tools: Vec<McpTool>,
    #[serde(rename = "additional_context", default, skip_serializing_if = "Vec::is_empty")]
    pub additional_context: Vec<AdditionalContextItem>,
    #[serde(rename = "preapproved_tools", default, skip_serializing_if = "Vec::is_empty")]
    pub preapproved_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_config_schema_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalMarker>,
}

impl StartRequest {
    /// The ordinary (non-reconnect) request built by `sendStartRequest`.
    pub fn new(
        workflow_id: String,
        workflow_definition: String,
        goal: String,
        mcp_tools: Vec<McpTool>,
        additional_context: Vec<AdditionalContextItem>,
        flow_config: Option<Value>,
        flow_config_schema_version: Option<String>,
    ) -> Self {
        let preapproved_tools = mcp_tools.iter().map(|t| t.name.clone()).collect();
        Self {
            workflow_id,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            workflow_definition,
            goal,
            workflow_metadata: "{extended_logging:false}".to_string(),
            client_capabilities: vec!["shell_command".to_string()],
            mcp_tools,
            additional_context,
            preapproved_tools,
            flow_config,
            flow_config_schema_version,
            approval: None,
        }
    }

    /// The variant sent by `reconnectWithApproval`: empty goal and
    /// context, carrying the approval marker instead.
    pub fn reconnect_approval(
        workflow_id: String,
        workflow_definition: String,
        mcp_tools: Vec<McpTool>,
    ) -> Self {
        let preapproved_tools = mcp_tools.iter().map(|t| t.name.clone()).collect();
        Self {
            workflow_id,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            workflow_definition,
            goal: String::new(),
            workflow_metadata: "{extended_logging:false}".to_string(),
            client_capabilities: vec!["shell_command".to_string()],
            mcp_tools,
            additional_context: Vec::new(),
            preapproved_tools,
            flow_config: None,
            flow_config_schema_version: None,
            approval: Some(ApprovalMarker {
                approval: serde_json::json!({}),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlainTextResponse {
    pub response: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponsePayload {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plain_text_response: Option<PlainTextResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_response: Option<HttpResponsePayload>,
}

impl ActionResponse {
    pub fn plain_text(request_id: impl Into<String>, response: String, error: String) -> Self {
        Self {
            request_id: request_id.into(),
            plain_text_response: Some(PlainTextResponse { response, error }),
            http_response: None,
        }
    }

    pub fn http(request_id: impl Into<String>, http_response: HttpResponsePayload) -> Self {
        Self {
            request_id: request_id.into(),
            plain_text_response: None,
            http_response: Some(http_response),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopWorkflow {
    pub reason: String,
}

// ---------------------------------------------------------------------
// Service -> Client actions
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    Created,
    Running,
    InputRequired,
    PlanApprovalRequired,
    ToolCallApprovalRequired,
    Finished,
    Failed,
    Stopped,
}

impl CheckpointStatus {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CREATED" => Self::Created,
            "RUNNING" => Self::Running,
            "INPUT_REQUIRED" => Self::InputRequired,
            "PLAN_APPROVAL_REQUIRED" => Self::PlanApprovalRequired,
            "TOOL_CALL_APPROVAL_REQUIRED" => Self::ToolCallApprovalRequired,
            "FINISHED" => Self::Finished,
            "FAILED" => Self::Failed,
            "STOPPED" => Self::Stopped,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Stopped)
    }

    pub fn is_turn_boundary(self) -> bool {
        matches!(self, Self::InputRequired | Self::PlanApprovalRequired)
    }

    pub fn is_tool_approval(self) -> bool {
        matches!(self, Self::ToolCallApprovalRequired)
    }
}

#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    pub status: CheckpointStatus,
    /// Raw checkpoint JSON text (`channel_values.ui_chat_log` lives inside).
    pub checkpoint_json: String,
    pub goal: String,
    pub errors: Vec<String>,
}

/// The fixed set of standalone tool-action names the Service can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolActionKind {
    RunReadFile,
    RunReadFiles,
    RunWriteFile,
    RunEditFile,
    RunShellCommand,
    RunCommand,
    RunGitCommand,
    RunHttpRequest,
    ListDirectory,
    Grep,
    FindFiles,
    RunMcpTool,
    Mkdir,
}

impl ToolActionKind {
    const ALL: &'static [(&'static str, ToolActionKind)] = &[
        ("runReadFile", Self::RunReadFile),
        ("runReadFiles", Self::RunReadFiles),
        ("runWriteFile", Self::RunWriteFile),
        ("runEditFile", Self::RunEditFile),
        ("runShellCommand", Self::RunShellCommand),
        ("runCommand", Self::RunCommand),
        ("runGitCommand", Self::RunGitCommand),
        ("runHTTPRequest", Self::RunHttpRequest),
        ("listDirectory", Self::ListDirectory),
        ("grep", Self::Grep),
        ("findFiles", Self::FindFiles),
        ("runMCPTool", Self::RunMcpTool),
        ("mkdir", Self::Mkdir),
    ];

    fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }
}

#[derive(Debug, Clone)]
pub struct ToolAction {
    pub request_id: Option<String>,
    pub kind: ToolActionKind,
    pub args: Value,
}

#[derive(Debug, Clone)]
pub enum Action {
    Checkpoint {
        request_id: Option<String>,
        checkpoint: NewCheckpoint,
    },
    Tool(ToolAction),
}

impl Action {
    /// Decode a single Service action frame. Returns `None` for anything
    /// unrecognized (dropped silently at debug level by the caller, per
    /// §4.7's "unknown actions are silently dropped").
    pub fn parse(value: &Value) -> Option<Action> {
        let obj = value.as_object()?;
        let top_level_request_id = obj
            .get("requestID")
            .or_else(|| obj.get("requestId"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        if let Some(cp) = obj.get("newCheckpoint") {
            let checkpoint = parse_checkpoint(cp)?;
            return Some(Action::Checkpoint {
                request_id: top_level_request_id,
                checkpoint,
            });
        }

        for (key, val) in obj.iter() {
            if let Some(kind) = ToolActionKind::from_key(key) {
                let request_id = top_level_request_id.clone().or_else(|| {
                    val.as_object()
                        .and_then(|o| o.get("requestID").or_else(|| o.get("requestId")))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                });
                return Some(Action::Tool(ToolAction {
                    request_id,
                    kind,
                    args: val.clone(),
                }));
            }
        }

        None
    }
}

fn parse_checkpoint(value: &Value) -> Option<NewCheckpoint> {
    let obj = value.as_object()?;
    let status = CheckpointStatus::parse(obj.get("status")?.as_str()?)?;
    let checkpoint_json = obj.get("checkpoint")?.as_str()?.to_string();
    let goal = obj
        .get("goal")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let errors = obj
        .get("errors")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|e| e.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Some(NewCheckpoint {
        status,
        checkpoint_json,
        goal,
        errors,
    })
}

// ---------------------------------------------------------------------
// Host-facing stream events
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Usage {
    #[serde(rename = "in", default, skip_serializing_if = "Option::is_none")]
    pub input: Option<u64>,
    #[serde(rename = "out", default, skip_serializing_if = "Option::is_none")]
    pub output: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostStreamEvent {
    StreamStart {
        warnings: Vec<String>,
    },
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputStart {
        id: String,
        tool_name: String,
    },
    ToolInputDelta {
        id: String,
        delta: String,
    },
    ToolInputEnd {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    Finish {
        #[serde(rename = "finishReason")]
        finish_reason: FinishReason,
        usage: Usage,
    },
    Error {
        error: String,
    },
}
