//! Caches and refreshes short-lived Service-access tokens keyed by
//! namespace (§4.5).
//!
//! Credential issuance is an external collaborator (§6 calls out
//! authentication resolution as out of scope for the core), so it's
//! reached through a narrow [`CredentialProvider`] trait the same way
//! `node-sdk`'s `NodeClient` takes a `ToolContext` rather than owning how
//! tools are authenticated — the default [`ReqwestCredentialProvider`]
//! lives in [`crate::http`].

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::Config;

/// Response shape of `POST ai/duo_workflows/direct_access`.
#[derive(Debug, Clone)]
pub struct TokenResponse {
    pub value: String,
    /// `duo_workflow_service.token_expires_at`, unix seconds.
    pub workflow_expires_at: Option<f64>,
    /// `gitlab_rails.token_expires_at`, ISO-8601.
    pub rails_expires_at: Option<String>,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn direct_access(
        &self,
        workflow_definition: &str,
        root_namespace_id: Option<&str>,
    ) -> anyhow::Result<TokenResponse>;
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Keyed mapping `namespaceID -> {value, expiresAt}`, refreshed lazily on
/// expiry.
pub struct CachingTokenService {
    provider: std::sync::Arc<dyn CredentialProvider>,
    workflow_definition: String,
    safety_margin: Duration,
    default_ttl: Duration,
    cache: Mutex<HashMap<Option<String>, CachedToken>>,
}

impl CachingTokenService {
    pub fn new(
        provider: std::sync::Arc<dyn CredentialProvider>,
        workflow_definition: String,
        config: &Config,
    ) -> Self {
        Self {
            provider,
            workflow_definition,
            safety_margin: config.token_safety_margin,
            default_ttl: config.default_token_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Return a cached or freshly-issued token. Failures are soft: they
    /// return `None` and the caller proceeds without extended metadata.
    pub async fn get(&self, namespace_id: Option<&str>) -> Option<String> {
        let key = namespace_id.map(str::to_string);

        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&key) {
                if cached.expires_at > Instant::now() {
                    return Some(cached.value.clone());
                }
            }
        }

        let response = match self
            .provider
            .direct_access(&self.workflow_definition, namespace_id)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "token issuance failed, proceeding without extended metadata");
                return None;
            }
        };

        let ttl = self.resolve_ttl(&response);
        let expires_at = Instant::now() + ttl;
        let value = response.value.clone();
        self.cache.lock().await.insert(
            key,
            CachedToken {
                value: value.clone(),
                expires_at,
            },
        );
        Some(value)
    }

    fn resolve_ttl(&self, response: &TokenResponse) -> Duration {
        let workflow_epoch_ms = response.workflow_expires_at.map(|secs| (secs * 1000.0) as i64);
        let rails_epoch_ms = response
            .rails_expires_at
            .as_deref()
            .and_then(parse_rfc3339_epoch_ms);

        let candidates: Vec<i64> = [workflow_epoch_ms, rails_epoch_ms].into_iter().flatten().collect();
        if candidates.is_empty() {
            return self.default_ttl;
        }

        let min_epoch_ms = *candidates.iter().min().unwrap();
        let now_epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let safety_ms = self.safety_margin.as_millis() as i64;
        let remaining_ms = (min_epoch_ms - now_epoch_ms - safety_ms).max(1000);
        Duration::from_millis(remaining_ms as u64)
    }
}

fn parse_rfc3339_epoch_ms(s: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}
