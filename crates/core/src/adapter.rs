//! Host-facing streaming surface (§4.8): turn orchestration, tool-result
//! forwarding, and multi-call group aggregation.
//!
//! One `ModelAdapter` is shared across turns for a given provider
//! instance; its tool-tracking maps are reset whenever the host-session-ID
//! changes (§3's `stateSessionId` invariant), the same reset-on-session-
//! change shape `vscodelm::session_actor` uses for its own per-conversation
//! bookkeeping. Everything else — the socket, the queue, the workflow ID —
//! lives on the [`WorkflowSession`] this adapter resolves from the
//! registry; the adapter never reaches into that state directly.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{BridgeError, Result};
use crate::persistence::SessionKey;
use crate::prompt;
use crate::protocol::{AdditionalContextItem, FinishReason, HostStreamEvent, Usage};
use crate::queue::EventQueue;
use crate::registry::SessionRegistry;
use crate::session::{SessionContext, SessionEvent, WorkflowSession};
use crate::tool_mapper::{self, MapOutput};

/// A single pending multi-call expansion: the sub-IDs handed to the Host,
/// the label captured for each at expansion time, and whatever sub-results
/// have been collected so far.
#[derive(Debug, Clone, Default)]
struct MultiCallGroup {
    sub_ids: Vec<String>,
    labels: Vec<String>,
    collected: HashMap<String, String>,
}

/// Tool-tracking state, reset in its entirety whenever the host-session-ID
/// this adapter is serving changes (§3).
#[derive(Default)]
struct TrackingState {
    pending_tool_requests: HashSet<String>,
    multi_call_groups: HashMap<String, MultiCallGroup>,
    sent_tool_call_ids: HashSet<String>,
    last_sent_goal: Option<String>,
    state_session_id: Option<String>,
}

impl TrackingState {
    fn reset_for(&mut self, host_session_id: &str) {
        self.pending_tool_requests.clear();
        self.multi_call_groups.clear();
        self.sent_tool_call_ids.clear();
        self.last_sent_goal = None;
        self.state_session_id = Some(host_session_id.to_string());
    }
}

/// Everything extracted from one Host turn's structured prompt.
pub struct StreamOptions {
    pub messages: Vec<Value>,
    pub instance_url: String,
    pub model_id: String,
    pub workflow_definition: String,
    pub environment: String,
    pub project_id: Option<String>,
    pub root_namespace_id: Option<String>,
    pub host_session_id: Option<String>,
    pub provider_session_header: Option<String>,
}

impl StreamOptions {
    /// Resolve the host-session-ID per §6: the options-carried field first,
    /// then the `x-opencode-session` header, trimmed and non-empty.
    fn resolve_session_id(&self) -> Result<String> {
        if let Some(id) = &self.host_session_id {
            let trimmed = id.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
        if let Some(id) = &self.provider_session_header {
            let trimmed = id.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
        Err(BridgeError::MissingSessionId)
    }
}

/// Snapshot of in-flight tool tracking, exposed so an embedding Host can
/// surface it in its own status UI. Observability only — adds no new
/// routing behavior.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterDiagnostics {
    pub pending_tool_requests: usize,
    pub multi_call_groups: usize,
}

pub struct ModelAdapter {
    registry: Arc<SessionRegistry>,
    tracking: tokio::sync::Mutex<TrackingState>,
}

impl ModelAdapter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            tracking: tokio::sync::Mutex::new(TrackingState::default()),
        }
    }

    /// Current sizes of the pending-request and multi-call-group maps.
    pub async fn diagnostics(&self) -> AdapterDiagnostics {
        let tracking = self.tracking.lock().await;
        AdapterDiagnostics {
            pending_tool_requests: tracking.pending_tool_requests.len(),
            multi_call_groups: tracking.multi_call_groups.len(),
        }
    }

    /// Drive one Host turn end-to-end, pushing Host stream events onto
    /// `sink` as they're produced. Returns once `finish` has been emitted.
    pub async fn stream(
        &self,
        options: StreamOptions,
        sink: &EventQueue<HostStreamEvent>,
    ) -> Result<()> {
        let host_session_id = options.resolve_session_id()?;
        let goal = prompt::extract_goal(&options.messages);
        let tool_results = prompt::extract_tool_results(&options.messages);

        let key = SessionKey {
            instance_url: options.instance_url.clone(),
            model_id: options.model_id.clone(),
            host_session_id: host_session_id.clone(),
        };
        let ctx = SessionContext {
            instance_url: options.instance_url.clone(),
            workflow_definition: options.workflow_definition.clone(),
            environment: options.environment.clone(),
            project_id: options.project_id.clone(),
            root_namespace_id: options.root_namespace_id.clone(),
            mcp_tools: Vec::new(),
        };
        let session = self.registry.resolve_session(key.clone(), ctx).await;

        {
            let mut tracking = self.tracking.lock().await;
            if tracking.state_session_id.as_deref() != Some(host_session_id.as_str()) {
                tracking.reset_for(&host_session_id);
            }
        }

        sink.push(HostStreamEvent::StreamStart { warnings: Vec::new() }).await;

        if !session.start_request_sent().await {
            let mut tracking = self.tracking.lock().await;
            let pending = tracking.pending_tool_requests.clone();
            for (id, _) in &tool_results {
                if !pending.contains(id) {
                    tracking.sent_tool_call_ids.insert(id.clone());
                }
            }
            tracking.last_sent_goal = None;
        }

        session.ensure_connected(&goal).await?;
        self.registry.persist_workflow_id(&key).await;

        let forwarded_any = self.forward_fresh_tool_results(&session, &tool_results).await;

        if !forwarded_any && !goal.is_empty() {
            let should_send = {
                let tracking = self.tracking.lock().await;
                tracking.last_sent_goal.as_deref() != Some(goal.as_str())
            };
            if should_send && !session.start_request_sent().await {
                self.send_new_goal(&session, &options, &goal).await?;
            }
        }

        self.consume_events(&session, sink).await;
        Ok(())
    }

    /// Phase 1: forward every incoming tool result not already sent,
    /// aggregating multi-call sub-results as they complete. Returns whether
    /// anything was sent this turn (gates phase 2 per §5's ordering rule).
    async fn forward_fresh_tool_results(
        &self,
        session: &Arc<WorkflowSession>,
        tool_results: &[(String, prompt::ToolResultValue)],
    ) -> bool {
        let mut forwarded = false;
        for (id, value) in tool_results {
            let already_sent = self.tracking.lock().await.sent_tool_call_ids.contains(id);
            if already_sent {
                continue;
            }

            if let Some((original_id, _)) = split_sub_id(id) {
                self.handle_sub_result(session, &original_id, id, value).await;
                forwarded = true;
                continue;
            }

            let is_pending = self.tracking.lock().await.pending_tool_requests.contains(id);
            if is_pending {
                let output = value.output.clone().unwrap_or_default();
                let _ = session.send_tool_result(id, &output, value.error.as_deref()).await;
                let mut tracking = self.tracking.lock().await;
                tracking.sent_tool_call_ids.insert(id.clone());
                tracking.pending_tool_requests.remove(id);
                forwarded = true;
            } else {
                self.tracking.lock().await.sent_tool_call_ids.insert(id.clone());
            }
        }
        forwarded
    }

    async fn handle_sub_result(
        &self,
        session: &Arc<WorkflowSession>,
        original_id: &str,
        sub_id: &str,
        value: &prompt::ToolResultValue,
    ) {
        let text = value.output.clone().or_else(|| value.error.clone()).unwrap_or_default();
        let completed = {
            let mut tracking = self.tracking.lock().await;
            tracking.sent_tool_call_ids.insert(sub_id.to_string());
            tracking.pending_tool_requests.remove(sub_id);
            let Some(group) = tracking.multi_call_groups.get_mut(original_id) else {
                return;
            };
            group.collected.insert(sub_id.to_string(), text);
            group.collected.len() == group.sub_ids.len()
        };

        if !completed {
            return;
        }

        let mut tracking = self.tracking.lock().await;
        let Some(group) = tracking.multi_call_groups.remove(original_id) else {
            return;
        };
        tracking.pending_tool_requests.remove(original_id);
        drop(tracking);

        let mut aggregate = serde_json::Map::new();
        for (i, sub_id) in group.sub_ids.iter().enumerate() {
            let label = group.labels.get(i).cloned().unwrap_or_else(|| format!("file_{i}"));
            let content = group.collected.get(sub_id).cloned().unwrap_or_default();
            aggregate.insert(label, json!({ "content": content }));
        }
        let output = Value::Object(aggregate).to_string();
        let _ = session.send_tool_result(original_id, &output, None).await;
    }

    async fn send_new_goal(
        &self,
        session: &Arc<WorkflowSession>,
        options: &StreamOptions,
        goal: &str,
    ) -> Result<()> {
        let mut context = vec![AdditionalContextItem::OsInformation {
            content: std::env::consts::OS.to_string(),
        }];
        context.push(AdditionalContextItem::UserRule {
            content: SYSTEM_RULES.to_string(),
        });
        let reminders = prompt::extract_agent_reminders(&options.messages);
        if !reminders.is_empty() {
            context.push(AdditionalContextItem::AgentContext {
                content: reminders.join("\n"),
            });
        }

        let system_prompt = {
            let extracted = prompt::extract_system_prompt(&options.messages);
            if extracted.is_empty() {
                DEFAULT_SYSTEM_PROMPT.to_string()
            } else {
                extracted
            }
        };
        let sanitized = prompt::sanitize_system_prompt(&system_prompt);
        let flow_config = Some(json!({ "system_prompt": sanitized }));

        session
            .send_start_request(goal, context, flow_config, None)
            .await?;
        self.tracking.lock().await.last_sent_goal = Some(goal.to_string());
        Ok(())
    }

    /// Phase 3: drain session events onto the Host stream until a tool
    /// request, an error, or end-of-stream closes the turn.
    async fn consume_events(&self, session: &Arc<WorkflowSession>, sink: &EventQueue<HostStreamEvent>) {
        let mut open_text_id: Option<String> = None;
        loop {
            match session.wait_for_event().await {
                Some(SessionEvent::TextDelta(delta)) => {
                    let text_id = match &open_text_id {
                        Some(id) => id.clone(),
                        None => {
                            let id = Uuid::new_v4().to_string();
                            sink.push(HostStreamEvent::TextStart { id: id.clone() }).await;
                            open_text_id = Some(id.clone());
                            id
                        }
                    };
                    sink.push(HostStreamEvent::TextDelta { id: text_id, delta }).await;
                }
                Some(SessionEvent::ToolRequest { request_id, tool_name, args }) => {
                    if let Some(id) = open_text_id.take() {
                        sink.push(HostStreamEvent::TextEnd { id }).await;
                    }
                    self.emit_tool_call(&request_id, &tool_name, &args, sink).await;
                    sink.push(HostStreamEvent::Finish {
                        finish_reason: FinishReason::ToolCalls,
                        usage: Usage::default(),
                    })
                    .await;
                    sink.close().await;
                    return;
                }
                Some(SessionEvent::Error(message)) => {
                    sink.push(HostStreamEvent::Error { error: message }).await;
                    sink.push(HostStreamEvent::Finish {
                        finish_reason: FinishReason::Error,
                        usage: Usage::default(),
                    })
                    .await;
                    sink.close().await;
                    return;
                }
                None => {
                    if let Some(id) = open_text_id.take() {
                        sink.push(HostStreamEvent::TextEnd { id }).await;
                    }
                    sink.push(HostStreamEvent::Finish {
                        finish_reason: FinishReason::Stop,
                        usage: Usage::default(),
                    })
                    .await;
                    sink.close().await;
                    return;
                }
            }
        }
    }

    async fn emit_tool_call(
        &self,
        request_id: &str,
        tool_name: &str,
        args: &Value,
        sink: &EventQueue<HostStreamEvent>,
    ) {
        let mapped = tool_mapper::map(tool_name, args);
        match mapped {
            MapOutput::One(call) => {
                self.tracking.lock().await.pending_tool_requests.insert(request_id.to_string());
                emit_single_tool_call(sink, request_id, &call.tool_name, &call.args).await;
            }
            MapOutput::Many(calls) => {
                let sub_ids: Vec<String> =
                    (0..calls.len()).map(|i| format!("{request_id}_sub_{i}")).collect();
                let labels: Vec<String> = calls
                    .iter()
                    .map(|c| {
                        c.args
                            .get("filePath")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_default()
                    })
                    .collect();

                {
                    let mut tracking = self.tracking.lock().await;
                    tracking.pending_tool_requests.insert(request_id.to_string());
                    for sub_id in &sub_ids {
                        tracking.pending_tool_requests.insert(sub_id.clone());
                    }
                    tracking.multi_call_groups.insert(
                        request_id.to_string(),
                        MultiCallGroup {
                            sub_ids: sub_ids.clone(),
                            labels,
                            collected: HashMap::new(),
                        },
                    );
                }

                for (sub_id, call) in sub_ids.iter().zip(calls.iter()) {
                    emit_single_tool_call(sink, sub_id, &call.tool_name, &call.args).await;
                }
            }
        }
    }
}

async fn emit_single_tool_call(
    sink: &EventQueue<HostStreamEvent>,
    tool_call_id: &str,
    tool_name: &str,
    input: &Value,
) {
    let input_json = input.to_string();
    sink.push(HostStreamEvent::ToolInputStart {
        id: tool_call_id.to_string(),
        tool_name: tool_name.to_string(),
    })
    .await;
    sink.push(HostStreamEvent::ToolInputDelta {
        id: tool_call_id.to_string(),
        delta: input_json,
    })
    .await;
    sink.push(HostStreamEvent::ToolInputEnd {
        id: tool_call_id.to_string(),
    })
    .await;
    sink.push(HostStreamEvent::ToolCall {
        tool_call_id: tool_call_id.to_string(),
        tool_name: tool_name.to_string(),
        input: input.clone(),
    })
    .await;
}

/// Split `"<reqId>_sub_<i>"` into its original request ID. Returns `None`
/// for IDs with no `_sub_` marker.
fn split_sub_id(id: &str) -> Option<(String, usize)> {
    let idx = id.rfind("_sub_")?;
    let (original, suffix) = id.split_at(idx);
    let index: usize = suffix.trim_start_matches("_sub_").parse().ok()?;
    Some((original.to_string(), index))
}

const SYSTEM_RULES: &str = "Follow the user's instructions precisely and use the available tools to accomplish the stated goal.";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful coding assistant.";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::http::{CreateWorkflowResponse, HttpPassthroughResult, HttpTransport};
    use crate::persistence::WorkflowIdStore;
    use crate::token::{CachingTokenService, CredentialProvider, TokenResponse};
    use async_trait::async_trait;
    use futures_util::SinkExt;
    use std::collections::BTreeMap;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    struct StubHttp;
    #[async_trait]
    impl HttpTransport for StubHttp {
        async fn create_workflow(
            &self,
            _instance_url: &str,
            _body: Value,
            _bearer_token: Option<&str>,
        ) -> anyhow::Result<CreateWorkflowResponse> {
            Ok(CreateWorkflowResponse {
                id: "wf-1".into(),
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
                body: String::new(),
            })
        }
    }

    struct StubCredentials;
    #[async_trait]
    impl CredentialProvider for StubCredentials {
        async fn direct_access(&self, _wd: &str, _ns: Option<&str>) -> anyhow::Result<TokenResponse> {
            Ok(TokenResponse {
                value: "tok".into(),
                workflow_expires_at: None,
                rails_expires_at: None,
            })
        }
    }

    struct NullStore;
    #[async_trait]
    impl WorkflowIdStore for NullStore {
        async fn get(&self, _key: &SessionKey) -> Option<String> {
            None
        }
        async fn put(&self, _key: &SessionKey, _workflow_id: &str) {}
    }

    fn adapter() -> ModelAdapter {
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(StubHttp),
            Arc::new(CachingTokenService::new(
                Arc::new(StubCredentials),
                "software_development".into(),
                &Config::default(),
            )),
            Arc::new(NullStore),
            Config::default(),
        ));
        ModelAdapter::new(registry)
    }

    fn user_message(text: &str) -> Value {
        json!({"role": "user", "parts": [{"type": "text", "text": text}]})
    }

    #[tokio::test]
    async fn missing_session_id_fails_fast() {
        let adapter = adapter();
        let options = StreamOptions {
            messages: vec![user_message("hi")],
            instance_url: "https://example.com".into(),
            model_id: "claude".into(),
            workflow_definition: "software_development".into(),
            environment: "ide".into(),
            project_id: None,
            root_namespace_id: None,
            host_session_id: None,
            provider_session_header: None,
        };
        let sink = EventQueue::new();
        let err = adapter.stream(options, &sink).await.unwrap_err();
        assert!(matches!(err, BridgeError::MissingSessionId));
    }

    #[tokio::test]
    async fn pure_text_scenario_s1() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(WsMessage::Text(
                r#"{"newCheckpoint":{"status":"RUNNING","checkpoint":"{\"channel_values\":{\"ui_chat_log\":[{\"message_type\":\"agent\",\"content\":\"Hel\"}]}}","goal":"hi"}}"#.into(),
            ))
            .await
            .unwrap();
            ws.send(WsMessage::Text(
                r#"{"newCheckpoint":{"status":"FINISHED","checkpoint":"{\"channel_values\":{\"ui_chat_log\":[{\"message_type\":\"agent\",\"content\":\"Hello.\"}]}}","goal":"hi"}}"#.into(),
            ))
            .await
            .unwrap();
        });

        let adapter = adapter();
        let options = StreamOptions {
            messages: vec![user_message("hi")],
            instance_url: format!("http://127.0.0.1:{port}"),
            model_id: "claude".into(),
            workflow_definition: "software_development".into(),
            environment: "ide".into(),
            project_id: None,
            root_namespace_id: None,
            host_session_id: Some("s1".into()),
            provider_session_header: None,
        };
        let sink = EventQueue::new();
        adapter.stream(options, &sink).await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = sink.take().await {
            events.push(event);
        }
        assert!(matches!(events[0], HostStreamEvent::StreamStart { .. }));
        assert!(matches!(events[1], HostStreamEvent::TextStart { .. }));
        match &events[2] {
            HostStreamEvent::TextDelta { delta, .. } => assert_eq!(delta, "Hel"),
            other => panic!("unexpected {other:?}"),
        }
        match &events[3] {
            HostStreamEvent::TextDelta { delta, .. } => assert_eq!(delta, "lo."),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(events[4], HostStreamEvent::TextEnd { .. }));
        assert!(matches!(
            events[5],
            HostStreamEvent::Finish { finish_reason: FinishReason::Stop, .. }
        ));
    }

    #[test]
    fn split_sub_id_recovers_original_and_index() {
        assert_eq!(split_sub_id("R_sub_0"), Some(("R".to_string(), 0)));
        assert_eq!(split_sub_id("R_sub_12"), Some(("R".to_string(), 12)));
        assert_eq!(split_sub_id("plain"), None);
    }
}
