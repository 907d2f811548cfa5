//! The process-wide session registry (§3, §9): lazily creates sessions,
//! disposes them explicitly, and is the Model adapter's only shared
//! lookup into session state (the adapter never mutates socket state
//! directly — see [`crate::session::WorkflowSession`]'s ownership rule).
//!
//! A single `tokio::sync::Mutex` over the whole map serializes
//! resolve/dispose the way the design notes ask for ("access must be
//! serialized"); this is deliberately coarser than per-entry locking
//! because entries are created rarely compared to how often a session,
//! once resolved, is used.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::config::Config;
use crate::http::HttpTransport;
use crate::persistence::{SessionKey, WorkflowIdStore};
use crate::session::{SessionContext, WorkflowSession};
use crate::token::CachingTokenService;

pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, Arc<WorkflowSession>>>,
    workflow_id_store: Arc<dyn WorkflowIdStore>,
    http: Arc<dyn HttpTransport>,
    token_service: Arc<CachingTokenService>,
    config: Config,
}

impl SessionRegistry {
    pub fn new(
        http: Arc<dyn HttpTransport>,
        token_service: Arc<CachingTokenService>,
        workflow_id_store: Arc<dyn WorkflowIdStore>,
        config: Config,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            workflow_id_store,
            http,
            token_service,
            config,
        }
    }

    /// Resolve an existing session for `key`, or create one, resuming the
    /// persisted workflow ID if one is on file.
    pub async fn resolve_session(&self, key: SessionKey, ctx: SessionContext) -> Arc<WorkflowSession> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&key) {
            return existing.clone();
        }
        let existing_workflow_id = self.workflow_id_store.get(&key).await;
        info!(
            host_session_id = %key.host_session_id,
            resuming = existing_workflow_id.is_some(),
            "session created"
        );
        let session = WorkflowSession::new(
            ctx,
            existing_workflow_id,
            self.http.clone(),
            self.token_service.clone(),
            self.config.clone(),
        );
        sessions.insert(key, session.clone());
        session
    }

    /// Persist the session's current workflow ID, if it has one. Call
    /// this after `ensure_connected` so a freshly created workflow
    /// survives a process restart.
    pub async fn persist_workflow_id(&self, key: &SessionKey) {
        let session = self.sessions.lock().await.get(key).cloned();
        let Some(session) = session else { return };
        if let Some(workflow_id) = session.workflow_id().await {
            self.workflow_id_store.put(key, &workflow_id).await;
        }
    }

    /// Remove and return a session. Callers are responsible for tearing
    /// it down (e.g. `session.abort()`) if it was still connected.
    pub async fn dispose_session(&self, key: &SessionKey) -> Option<Arc<WorkflowSession>> {
        self.sessions.lock().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{CreateWorkflowResponse, HttpPassthroughResult};
    use crate::token::{CredentialProvider, TokenResponse};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::BTreeMap;

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
                id: "wf".into(),
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
        async fn direct_access(&self, _workflow_definition: &str, _root_namespace_id: Option<&str>) -> anyhow::Result<TokenResponse> {
            Ok(TokenResponse {
                value: "tok".into(),
                workflow_expires_at: None,
                rails_expires_at: None,
            })
        }
    }

    struct InMemoryStore(Mutex<HashMap<SessionKey, String>>);
    #[async_trait]
    impl WorkflowIdStore for InMemoryStore {
        async fn get(&self, key: &SessionKey) -> Option<String> {
            self.0.lock().await.get(key).cloned()
        }
        async fn put(&self, key: &SessionKey, workflow_id: &str) {
            self.0.lock().await.insert(key.clone(), workflow_id.to_string());
        }
    }

    fn key() -> SessionKey {
        SessionKey {
            instance_url: "https://example.com".into(),
            model_id: "claude".into(),
            host_session_id: "s1".into(),
        }
    }

    fn ctx() -> SessionContext {
        SessionContext {
            instance_url: "https://example.com".into(),
            workflow_definition: "software_development".into(),
            environment: "ide".into(),
            project_id: None,
            root_namespace_id: None,
            mcp_tools: Vec::new(),
        }
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(
            Arc::new(StubHttp),
            Arc::new(CachingTokenService::new(Arc::new(StubCredentials), "software_development".into(), &Config::default())),
            Arc::new(InMemoryStore(Mutex::new(HashMap::new()))),
            Config::default(),
        )
    }

    #[tokio::test]
    async fn resolve_session_is_idempotent_per_key() {
        let registry = registry();
        let a = registry.resolve_session(key(), ctx()).await;
        let b = registry.resolve_session(key(), ctx()).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn dispose_removes_the_entry() {
        let registry = registry();
        registry.resolve_session(key(), ctx()).await;
        assert!(registry.dispose_session(&key()).await.is_some());
        assert_eq!(registry.len().await, 0);
    }
}
