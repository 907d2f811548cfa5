//! Per-session state machine: create/resume a remote workflow, send the
//! start request, correlate standalone actions, drive the
//! approval-reconnect handshake (§4.7).
//!
//! The session owns its socket and queue exclusively (§3 ownership rule)
//! and is always handled behind an `Arc` so the background frame-reader
//! task it spawns in [`WorkflowSession::wire_socket`] can re-enter it
//! without borrowing — the same acyclic "events flow through a channel,
//! not a captured callback" shape the design notes call for, modeled
//! after how `conductor::Conductor::serve` drains `mpsc::Receiver`
//! messages instead of invoking callbacks captured at spawn time.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::checkpoint::{extract_agent_text_deltas, CheckpointState};
use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::http::HttpTransport;
use crate::protocol::{
    Action, ActionResponse, AdditionalContextItem, ClientEvent, HttpResponsePayload, McpTool,
    NewCheckpoint, StartRequest, StopWorkflow, ToolAction, ToolActionKind,
};
use crate::queue::EventQueue;
use crate::socket::{SocketClient, SocketEvent};
use crate::token::CachingTokenService;
use crate::{action_mapper, protocol};

#[derive(Debug, Clone)]
pub enum SessionEvent {
    TextDelta(String),
    ToolRequest {
        request_id: String,
        tool_name: String,
        args: Value,
    },
    Error(String),
}

/// Static per-session configuration: instance, workflow definition, and
/// the scope in which the remote workflow should be created.
pub struct SessionContext {
    pub instance_url: String,
    pub workflow_definition: String,
    pub environment: String,
    pub project_id: Option<String>,
    pub root_namespace_id: Option<String>,
    pub mcp_tools: Vec<McpTool>,
}

struct Inner {
    workflow_id: Option<String>,
    socket: Option<Arc<SocketClient>>,
    queue: Option<Arc<EventQueue<SessionEvent>>>,
    checkpoint_state: CheckpointState,
    start_request_sent: bool,
    pending_approval: bool,
    resumed: bool,
}

pub struct WorkflowSession {
    inner: Mutex<Inner>,
    ctx: SessionContext,
    http: Arc<dyn HttpTransport>,
    token_service: Arc<CachingTokenService>,
    config: Config,
}

impl WorkflowSession {
    pub fn new(
        ctx: SessionContext,
        existing_workflow_id: Option<String>,
        http: Arc<dyn HttpTransport>,
        token_service: Arc<CachingTokenService>,
        config: Config,
    ) -> Arc<Self> {
        let resumed = existing_workflow_id.is_some();
        Arc::new(Self {
            inner: Mutex::new(Inner {
                workflow_id: existing_workflow_id,
                socket: None,
                queue: None,
                checkpoint_state: CheckpointState::new(),
                start_request_sent: false,
                pending_approval: false,
                resumed,
            }),
            ctx,
            http,
            token_service,
            config,
        })
    }

    pub async fn workflow_id(&self) -> Option<String> {
        self.inner.lock().await.workflow_id.clone()
    }

    pub async fn start_request_sent(&self) -> bool {
        self.inner.lock().await.start_request_sent
    }

    pub async fn pending_approval(&self) -> bool {
        self.inner.lock().await.pending_approval
    }

    fn socket_url(&self, workflow_id: &str) -> String {
        let ws_base = self
            .ctx
            .instance_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!(
            "{}/api/v4/ai/duo_workflows/ws/{}",
            ws_base.trim_end_matches('/'),
            workflow_id
        )
    }

    async fn current_queue(&self) -> Option<Arc<EventQueue<SessionEvent>>> {
        self.inner.lock().await.queue.clone()
    }

    async fn current_socket(&self) -> Option<Arc<SocketClient>> {
        self.inner.lock().await.socket.clone()
    }

    /// Create the remote workflow if none exists yet, then open the
    /// socket if neither it nor the queue are already present.
    pub async fn ensure_connected(self: &Arc<Self>, goal: &str) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            if inner.socket.is_some() && inner.queue.is_some() {
                return Ok(());
            }
        }

        let workflow_id = self.get_or_create_workflow_id(goal).await?;
        let socket = SocketClient::connect(&self.socket_url(&workflow_id), &self.config).await?;
        info!(workflow_id = %workflow_id, "socket opened");
        let socket = Arc::new(socket);
        let queue = Arc::new(EventQueue::new());

        {
            let mut inner = self.inner.lock().await;
            inner.workflow_id = Some(workflow_id);
            inner.socket = Some(socket.clone());
            inner.queue = Some(queue.clone());
        }
        self.spawn_reader(socket);
        Ok(())
    }

    async fn get_or_create_workflow_id(&self, goal: &str) -> Result<String> {
        if let Some(id) = self.inner.lock().await.workflow_id.clone() {
            return Ok(id);
        }
        let token = self.token_service.get(self.ctx.root_namespace_id.as_deref()).await;
        let body = serde_json::json!({
            "goal": goal,
            "workflow_definition": self.ctx.workflow_definition,
            "environment": self.ctx.environment,
            "allow_agent_to_request_user": true,
            "project_id": self.ctx.project_id,
        });
        let response = self
            .http
            .create_workflow(&self.ctx.instance_url, body, token.as_deref())
            .await
            .map_err(|e| BridgeError::WorkflowCreateFailed(e.to_string()))?;
        if response.id.is_empty() {
            let message = response
                .error
                .or(response.message)
                .unwrap_or_else(|| "workflow creation returned no id".to_string());
            return Err(BridgeError::WorkflowCreateFailed(message));
        }
        info!(workflow_id = %response.id, "workflow created");
        Ok(response.id)
    }

    pub async fn send_start_request(
        self: &Arc<Self>,
        goal: &str,
        additional_context: Vec<AdditionalContextItem>,
        flow_config: Option<Value>,
        flow_config_schema_version: Option<String>,
    ) -> Result<()> {
        let (socket, workflow_id) = {
            let inner = self.inner.lock().await;
            (inner.socket.clone(), inner.workflow_id.clone())
        };
        let socket = socket.ok_or(BridgeError::NotConnected)?;
        let workflow_id = workflow_id.ok_or(BridgeError::NotConnected)?;

        let request = StartRequest::new(
            workflow_id,
            self.ctx.workflow_definition.clone(),
            goal.to_string(),
            self.ctx.mcp_tools.clone(),
            additional_context,
            flow_config,
            flow_config_schema_version,
        );
        if !socket.send(&ClientEvent::StartRequest(request)) {
            return Err(BridgeError::NotConnected);
        }
        self.inner.lock().await.start_request_sent = true;
        Ok(())
    }

    pub async fn send_tool_result(&self, request_id: &str, output: &str, error: Option<&str>) -> Result<()> {
        let socket = self.current_socket().await.ok_or(BridgeError::NotConnected)?;
        let response = ActionResponse::plain_text(request_id, output.to_string(), error.unwrap_or("").to_string());
        if !socket.send(&ClientEvent::ActionResponse(response)) {
            return Err(BridgeError::NotConnected);
        }
        Ok(())
    }

    /// Take from the session's event queue. Returns `None` ("end") once
    /// closed, or immediately if no connection has ever been made.
    pub async fn wait_for_event(&self) -> Option<SessionEvent> {
        let queue = self.current_queue().await?;
        queue.take().await
    }

    pub async fn abort(&self) {
        if let Some(socket) = self.current_socket().await {
            let _ = socket.send(&ClientEvent::StopWorkflow(StopWorkflow {
                reason: "ABORTED".to_string(),
            }));
        }
        self.close_connection().await;
    }

    async fn close_connection(&self) {
        let (socket, queue) = {
            let mut inner = self.inner.lock().await;
            inner.start_request_sent = false;
            (inner.socket.take(), inner.queue.take())
        };
        if let Some(socket) = socket {
            socket.close().await;
        }
        if let Some(queue) = queue {
            queue.close().await;
        }
    }

    fn spawn_reader(self: &Arc<Self>, socket: Arc<SocketClient>) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                match socket.next_event().await {
                    Some(SocketEvent::Frame(value)) => session.handle_frame(value).await,
                    Some(SocketEvent::DecodeError(message)) => {
                        if let Some(queue) = session.current_queue().await {
                            queue.push(SessionEvent::Error(message)).await;
                        }
                    }
                    Some(SocketEvent::Closed { .. }) | None => {
                        session.handle_socket_closed().await;
                        break;
                    }
                }
            }
        })
    }

    async fn handle_frame(self: &Arc<Self>, value: Value) {
        let Some(action) = Action::parse(&value) else {
            debug!(frame = %value, "unrecognized action dropped");
            return;
        };
        match action {
            Action::Checkpoint { checkpoint, .. } => self.handle_checkpoint(checkpoint).await,
            Action::Tool(tool_action) => self.handle_tool_action(tool_action).await,
        }
    }

    async fn handle_checkpoint(self: &Arc<Self>, checkpoint: NewCheckpoint) {
        let (deltas, was_resumed) = {
            let mut inner = self.inner.lock().await;
            let deltas = extract_agent_text_deltas(&checkpoint.checkpoint_json, &mut inner.checkpoint_state);
            let was_resumed = inner.resumed;
            if was_resumed {
                inner.resumed = false;
            }
            (deltas, was_resumed)
        };

        if !was_resumed {
            if let Some(queue) = self.current_queue().await {
                for delta in deltas {
                    queue.push(SessionEvent::TextDelta(delta)).await;
                }
            }
        }

        if checkpoint.status.is_tool_approval() {
            self.inner.lock().await.pending_approval = true;
            return;
        }

        if checkpoint.status.is_terminal() || checkpoint.status.is_turn_boundary() {
            self.close_connection().await;
        }
    }

    async fn handle_tool_action(self: &Arc<Self>, tool_action: ToolAction) {
        if tool_action.kind == ToolActionKind::RunHttpRequest {
            self.handle_http_request_action(tool_action).await;
            return;
        }
        if let Some(normalized) = action_mapper::map_action(&tool_action) {
            if let Some(queue) = self.current_queue().await {
                queue
                    .push(SessionEvent::ToolRequest {
                        request_id: normalized.request_id,
                        tool_name: normalized.tool_name,
                        args: normalized.args,
                    })
                    .await;
            }
        }
    }

    async fn handle_http_request_action(&self, tool_action: ToolAction) {
        let Some(request_id) = tool_action.request_id.clone() else {
            return;
        };
        let method = tool_action
            .args
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_string();
        let path = tool_action
            .args
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let body = tool_action.args.get("body").map(|b| match b {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });

        let token = self.token_service.get(self.ctx.root_namespace_id.as_deref()).await;
        let result = self
            .http
            .api_request(&self.ctx.instance_url, &method, &path, body, token.as_deref(), self.config.connect_timeout)
            .await;

        let response = match result {
            Ok(r) => HttpResponsePayload {
                status_code: r.status_code,
                headers: r.headers,
                body: r.body,
                error: String::new(),
            },
            Err(e) => {
                warn!(error = %e, request_id = %request_id, "HTTP passthrough failed");
                HttpResponsePayload {
                    status_code: 0,
                    headers: Default::default(),
                    body: String::new(),
                    error: e.to_string(),
                }
            }
        };

        if let Some(socket) = self.current_socket().await {
            socket.send(&ClientEvent::ActionResponse(ActionResponse::http(request_id, response)));
        }
    }

    async fn handle_socket_closed(self: &Arc<Self>) {
        let was_pending = {
            let mut inner = self.inner.lock().await;
            let was_pending = inner.pending_approval;
            inner.pending_approval = false;
            inner.socket = None;
            was_pending
        };

        if was_pending {
            if let Some(queue) = self.current_queue().await {
                info!("approval granted, reconnecting");
                self.reconnect_with_approval(queue).await;
            }
        } else {
            let queue = self.inner.lock().await.queue.take();
            if let Some(queue) = queue {
                queue.close().await;
            }
        }
    }

    async fn reconnect_with_approval(self: &Arc<Self>, queue: Arc<EventQueue<SessionEvent>>) {
        let Some(workflow_id) = self.inner.lock().await.workflow_id.clone() else {
            queue.close().await;
            return;
        };

        let socket = match SocketClient::connect(&self.socket_url(&workflow_id), &self.config).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!(error = %e, "approval-reconnect failed to open a new socket");
                queue.close().await;
                return;
            }
        };

        {
            let mut inner = self.inner.lock().await;
            inner.socket = Some(socket.clone());
        }

        let start = protocol::StartRequest::reconnect_approval(
            workflow_id,
            self.ctx.workflow_definition.clone(),
            self.ctx.mcp_tools.clone(),
        );
        if !socket.send(&ClientEvent::StartRequest(start)) {
            queue.close().await;
            return;
        }
        self.spawn_reader(socket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{CreateWorkflowResponse, HttpPassthroughResult};
    use async_trait::async_trait;
    use futures_util::SinkExt;
    use std::collections::BTreeMap;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    struct StubHttp {
        workflow_id: String,
    }

    #[async_trait]
    impl HttpTransport for StubHttp {
        async fn create_workflow(
            &self,
            _instance_url: &str,
            _body: Value,
            _bearer_token: Option<&str>,
        ) -> anyhow::Result<CreateWorkflowResponse> {
            Ok(CreateWorkflowResponse {
                id: self.workflow_id.clone(),
                message: None,
                error: None,
            })
        }

        async fn api_request(
            &self,
            _instance_url: &str,
            _method: &str,
            _path: &str,
            _body: Option<String>,
            _bearer_token: Option<&str>,
            _timeout: std::time::Duration,
        ) -> anyhow::Result<HttpPassthroughResult> {
            Ok(HttpPassthroughResult {
                status_code: 200,
                headers: BTreeMap::new(),
                body: "{}".into(),
            })
        }
    }

    struct NullCredentials;
    #[async_trait]
    impl crate::token::CredentialProvider for NullCredentials {
        async fn direct_access(
            &self,
            _workflow_definition: &str,
            _root_namespace_id: Option<&str>,
        ) -> anyhow::Result<crate::token::TokenResponse> {
            Ok(crate::token::TokenResponse {
                value: "tok".into(),
                workflow_expires_at: None,
                rails_expires_at: None,
            })
        }
    }

    fn test_session(instance_url: String, workflow_id: String) -> Arc<WorkflowSession> {
        let ctx = SessionContext {
            instance_url,
            workflow_definition: "software_development".into(),
            environment: "ide".into(),
            project_id: None,
            root_namespace_id: None,
            mcp_tools: Vec::new(),
        };
        let token_service = Arc::new(CachingTokenService::new(
            Arc::new(NullCredentials),
            ctx.workflow_definition.clone(),
            &Config::default(),
        ));
        WorkflowSession::new(ctx, None, Arc::new(StubHttp { workflow_id }), token_service, Config::default())
    }

    #[tokio::test]
    async fn pure_text_response_scenario() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(WsMessage::Text(
                r#"{"newCheckpoint":{"status":"RUNNING","checkpoint":"{\"channel_values\":{\"ui_chat_log\":[{\"message_type\":\"agent\",\"content\":\"Hel\"}]}}","goal":"hi"}}"#
                    .into(),
            ))
            .await
            .unwrap();
            ws.send(WsMessage::Text(
                r#"{"newCheckpoint":{"status":"FINISHED","checkpoint":"{\"channel_values\":{\"ui_chat_log\":[{\"message_type\":\"agent\",\"content\":\"Hello.\"}]}}","goal":"hi"}}"#
                    .into(),
            ))
            .await
            .unwrap();
        });

        let session = test_session(format!("http://127.0.0.1:{port}"), "wf-1".into());
        session.ensure_connected("hi").await.unwrap();

        let mut deltas = Vec::new();
        loop {
            match session.wait_for_event().await {
                Some(SessionEvent::TextDelta(d)) => deltas.push(d),
                Some(_) => {}
                None => break,
            }
        }
        assert_eq!(deltas, vec!["Hel".to_string(), "lo.".to_string()]);
    }

    #[tokio::test]
    async fn tool_approval_checkpoint_does_not_close_the_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(WsMessage::Text(
                r#"{"newCheckpoint":{"status":"TOOL_CALL_APPROVAL_REQUIRED","checkpoint":"{\"channel_values\":{\"ui_chat_log\":[]}}","goal":""}}"#
                    .into(),
            ))
            .await
            .unwrap();
        });

        let session = test_session(format!("http://127.0.0.1:{port}"), "wf-2".into());
        session.ensure_connected("do it").await.unwrap();
        // Give the reader task a moment to process the frame.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(session.pending_approval().await);
        assert!(session.inner.lock().await.queue.is_some());
    }
}
