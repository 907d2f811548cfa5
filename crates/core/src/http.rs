//! Narrow HTTP collaborator boundary plus its default `reqwest`-backed
//! implementations.
//!
//! §6 lists two REST endpoints the core consumes directly (workflow
//! creation, token issuance) and one it proxies arbitrarily
//! (`runHTTPRequest` passthrough). All three go through [`HttpTransport`]
//! so the session and token service stay testable without a live Service
//! endpoint, the same narrow-trait-at-the-boundary shape
//! `node-sdk::types::ToolContext` uses to keep tool execution decoupled
//! from the gateway connection itself.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::token::{CredentialProvider, TokenResponse};

#[derive(Debug, Clone)]
pub struct CreateWorkflowResponse {
    pub id: String,
    pub message: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpPassthroughResult {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn create_workflow(
        &self,
        instance_url: &str,
        body: Value,
        bearer_token: Option<&str>,
    ) -> anyhow::Result<CreateWorkflowResponse>;

    async fn api_request(
        &self,
        instance_url: &str,
        method: &str,
        path: &str,
        body: Option<String>,
        bearer_token: Option<&str>,
        timeout: Duration,
    ) -> anyhow::Result<HttpPassthroughResult>;
}

pub struct ReqwestHttpTransport {
    client: reqwest::Client,
}

impl ReqwestHttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestHttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_method(method: &str) -> reqwest::Method {
    method.parse().unwrap_or(reqwest::Method::GET)
}

#[async_trait]
impl HttpTransport for ReqwestHttpTransport {
    async fn create_workflow(
        &self,
        instance_url: &str,
        body: Value,
        bearer_token: Option<&str>,
    ) -> anyhow::Result<CreateWorkflowResponse> {
        let url = format!("{}/ai/duo_workflows/workflows", instance_url.trim_end_matches('/'));
        let mut req = self.client.post(&url).json(&body);
        if let Some(token) = bearer_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let value: Value = resp.json().await?;
        let id = match value.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        Ok(CreateWorkflowResponse {
            id,
            message: value.get("message").and_then(Value::as_str).map(str::to_string),
            error: value.get("error").and_then(Value::as_str).map(str::to_string),
        })
    }

    async fn api_request(
        &self,
        instance_url: &str,
        method: &str,
        path: &str,
        body: Option<String>,
        bearer_token: Option<&str>,
        timeout: Duration,
    ) -> anyhow::Result<HttpPassthroughResult> {
        let url = format!(
            "{}/api/v4/{}",
            instance_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut req = self.client.request(parse_method(method), &url).timeout(timeout);
        if let Some(token) = bearer_token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.header("Content-Type", "application/json").body(body);
        }
        let resp = req.send().await?;
        let status_code = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = resp.text().await?;
        Ok(HttpPassthroughResult {
            status_code,
            headers,
            body,
        })
    }
}

/// `CredentialProvider` backed by `POST ai/duo_workflows/direct_access`.
pub struct ReqwestCredentialProvider {
    client: reqwest::Client,
    instance_url: String,
    bearer_token: String,
}

impl ReqwestCredentialProvider {
    pub fn new(instance_url: String, bearer_token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            instance_url,
            bearer_token,
        }
    }
}

#[async_trait]
impl CredentialProvider for ReqwestCredentialProvider {
    async fn direct_access(
        &self,
        workflow_definition: &str,
        root_namespace_id: Option<&str>,
    ) -> anyhow::Result<TokenResponse> {
        let url = format!(
            "{}/ai/duo_workflows/direct_access",
            self.instance_url.trim_end_matches('/')
        );
        let mut body = serde_json::json!({ "workflow_definition": workflow_definition });
        if let Some(ns) = root_namespace_id {
            body["root_namespace_id"] = Value::String(ns.to_string());
        }
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.bearer_token)
            .json(&body)
            .send()
            .await?;
        let value: Value = resp.json().await?;
        let workflow_expires_at = value
            .get("duo_workflow_service")
            .and_then(|v| v.get("token_expires_at"))
            .and_then(Value::as_f64);
        let rails_expires_at = value
            .get("gitlab_rails")
            .and_then(|v| v.get("token_expires_at"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let token_value = value
            .get("duo_workflow_service")
            .and_then(|v| v.get("token"))
            .and_then(Value::as_str)
            .or_else(|| value.get("token").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();
        Ok(TokenResponse {
            value: token_value,
            workflow_expires_at,
            rails_expires_at,
        })
    }
}
