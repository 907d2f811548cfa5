//! The session key and the persisted workflow-ID store (§3, §6).
//!
//! A session maps to exactly one remote workflow ID that may outlive the
//! socket; this file persists that mapping across process restarts.
//! Kept behind a trait so sessions can be exercised in tests with an
//! in-memory store, and tolerant of every failure mode on the file path —
//! missing file, corrupt JSON, failed mkdir/write — exactly as §6
//! specifies, because losing this cache only costs a redundant workflow
//! creation, never correctness.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

/// A session is keyed by (instance URL, model ID, host-session ID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub instance_url: String,
    pub model_id: String,
    pub host_session_id: String,
}

impl SessionKey {
    fn storage_key(&self) -> String {
        format!("{}\u{1}{}\u{1}{}", self.instance_url, self.model_id, self.host_session_id)
    }
}

#[async_trait]
pub trait WorkflowIdStore: Send + Sync {
    async fn get(&self, key: &SessionKey) -> Option<String>;
    async fn put(&self, key: &SessionKey, workflow_id: &str);
}

/// A per-user JSON file mapping session-key -> workflow-ID.
pub struct JsonFileWorkflowIdStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl JsonFileWorkflowIdStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn load_from_disk(path: &Path) -> HashMap<String, String> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(error = %e, path = %path.display(), "workflow-id store file is corrupt, starting empty");
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to read workflow-id store");
                HashMap::new()
            }
        }
    }

    async fn ensure_loaded(&self) {
        let mut cache = self.cache.lock().await;
        if cache.is_empty() {
            *cache = Self::load_from_disk(&self.path);
        }
    }

    fn persist(&self, map: &HashMap<String, String>) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(error = %e, path = %parent.display(), "failed to create workflow-id store directory");
                return;
            }
        }
        let Ok(contents) = serde_json::to_string(map) else {
            return;
        };
        if let Err(e) = std::fs::write(&self.path, contents) {
            warn!(error = %e, path = %self.path.display(), "failed to write workflow-id store");
        }
    }
}

#[async_trait]
impl WorkflowIdStore for JsonFileWorkflowIdStore {
    async fn get(&self, key: &SessionKey) -> Option<String> {
        self.ensure_loaded().await;
        self.cache.lock().await.get(&key.storage_key()).cloned()
    }

    async fn put(&self, key: &SessionKey, workflow_id: &str) {
        self.ensure_loaded().await;
        let mut cache = self.cache.lock().await;
        cache.insert(key.storage_key(), workflow_id.to_string());
        self.persist(&cache);
    }
}
