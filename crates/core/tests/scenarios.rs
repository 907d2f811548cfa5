//! Cross-module end-to-end scenarios (S2, S3, S6) driving the full
//! `ModelAdapter` / `WorkflowSession` pair against an in-process fake
//! socket, the same shape `conductor`'s
//! `mcp_bridge_end_to_end_helpers::{mock_agent,mock_proxy}` use for their
//! own protocol instead of a mocking crate.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::SinkExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use workflow_bridge_core::adapter::{ModelAdapter, StreamOptions};
use workflow_bridge_core::config::Config;
use workflow_bridge_core::http::{CreateWorkflowResponse, HttpPassthroughResult, HttpTransport};
use workflow_bridge_core::persistence::{SessionKey, WorkflowIdStore};
use workflow_bridge_core::protocol::{FinishReason, HostStreamEvent};
use workflow_bridge_core::queue::EventQueue;
use workflow_bridge_core::registry::SessionRegistry;
use workflow_bridge_core::token::{CachingTokenService, CredentialProvider, TokenResponse};

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
            id: "wf-scenario".into(),
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
            headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
            body: r#"{"id":1}"#.to_string(),
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

fn tool_result_message(id: &str, text: &str) -> Value {
    json!({
        "role": "tool",
        "parts": [{"type": "tool-result", "toolCallId": id, "output": {"type": "text", "value": text}}]
    })
}

/// S2 — Multi-call expansion: a standalone `run_read_files` action expands
/// into two Host `tool-call` events with `_sub_` IDs; results for both are
/// aggregated into a single `actionResponse` keyed by path.
#[tokio::test]
async fn s2_multi_call_expansion_and_aggregation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (agg_tx, agg_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(WsMessage::Text(
            r#"{"runReadFiles":{"requestID":"R","file_paths":["a.txt","b.txt"]}}"#.into(),
        ))
        .await
        .unwrap();

        // Drain the client's next actionResponse frame (the aggregate).
        use futures_util::StreamExt;
        while let Some(Ok(WsMessage::Text(text))) = ws.next().await {
            if text.contains("\"requestID\":\"R\"") {
                let _ = agg_tx.send(text);
                break;
            }
        }
    });

    let adapter = adapter();
    let instance_url = format!("http://127.0.0.1:{port}");

    // Turn 1: no tool results yet, just drains the expansion.
    let options = StreamOptions {
        messages: vec![user_message("read both files")],
        instance_url: instance_url.clone(),
        model_id: "claude".into(),
        workflow_definition: "software_development".into(),
        environment: "ide".into(),
        project_id: None,
        root_namespace_id: None,
        host_session_id: Some("s2".into()),
        provider_session_header: None,
    };
    let sink = EventQueue::new();
    adapter.stream(options, &sink).await.unwrap();

    let mut tool_call_ids = Vec::new();
    let mut finish_reason = None;
    while let Some(event) = sink.take().await {
        if let HostStreamEvent::ToolCall { tool_call_id, tool_name, .. } = &event {
            assert_eq!(tool_name, "read");
            tool_call_ids.push(tool_call_id.clone());
        }
        if let HostStreamEvent::Finish { finish_reason: fr, .. } = &event {
            finish_reason = Some(fr.clone());
        }
    }
    assert_eq!(tool_call_ids, vec!["R_sub_0".to_string(), "R_sub_1".to_string()]);
    assert_eq!(finish_reason, Some(FinishReason::ToolCalls));

    // Turn 2: results for both sub-IDs arrive; the session should send one
    // aggregated actionResponse keyed by path.
    let options = StreamOptions {
        messages: vec![
            user_message("read both files"),
            tool_result_message("R_sub_0", "A"),
            tool_result_message("R_sub_1", "B"),
        ],
        instance_url,
        model_id: "claude".into(),
        workflow_definition: "software_development".into(),
        environment: "ide".into(),
        project_id: None,
        root_namespace_id: None,
        host_session_id: Some("s2".into()),
        provider_session_header: None,
    };
    let sink = EventQueue::new();
    let result = tokio::time::timeout(std::time::Duration::from_secs(5), adapter.stream(options, &sink)).await;
    assert!(result.is_ok());

    let aggregate_text = tokio::time::timeout(std::time::Duration::from_secs(5), agg_rx)
        .await
        .expect("aggregate response timed out")
        .unwrap();
    let parsed: Value = serde_json::from_str(&aggregate_text).unwrap();
    let response: Value = serde_json::from_str(
        parsed["actionResponse"]["plainTextResponse"]["response"].as_str().unwrap(),
    )
    .unwrap();
    assert_eq!(response["a.txt"]["content"], "A");
    assert_eq!(response["b.txt"]["content"], "B");
}

/// S6 — HTTP passthrough: a `runHTTPRequest` action is handled locally by
/// the session; the Host never sees a tool-call for it.
#[tokio::test]
async fn s6_http_passthrough_never_reaches_the_host() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(WsMessage::Text(
            r#"{"runHTTPRequest":{"requestID":"R","method":"GET","path":"projects/1"}}"#.into(),
        ))
        .await
        .unwrap();
        ws.send(WsMessage::Text(
            r#"{"newCheckpoint":{"status":"FINISHED","checkpoint":"{\"channel_values\":{\"ui_chat_log\":[]}}","goal":""}}"#.into(),
        ))
        .await
        .unwrap();
    });

    let adapter = adapter();
    let options = StreamOptions {
        messages: vec![user_message("fetch project 1")],
        instance_url: format!("http://127.0.0.1:{port}"),
        model_id: "claude".into(),
        workflow_definition: "software_development".into(),
        environment: "ide".into(),
        project_id: None,
        root_namespace_id: None,
        host_session_id: Some("s6".into()),
        provider_session_header: None,
    };
    let sink = EventQueue::new();
    adapter.stream(options, &sink).await.unwrap();

    let mut saw_tool_call = false;
    while let Some(event) = sink.take().await {
        if matches!(event, HostStreamEvent::ToolCall { .. }) {
            saw_tool_call = true;
        }
    }
    assert!(!saw_tool_call, "HTTP passthrough must not surface a Host tool-call");
}
