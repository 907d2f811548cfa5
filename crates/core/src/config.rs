//! Tunables for the socket client and token service.
//!
//! Kept as a plain struct with a `Default` impl plus an `from_env`
//! constructor, the way `symposium-acp-agent`'s `config.rs` reads small
//! pieces of environment-driven configuration rather than pulling in a
//! full config-file crate — this crate is embedded into a host process
//! that owns its own configuration story, so we only need a few numeric
//! knobs.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Timeout for the initial websocket handshake.
    pub connect_timeout: Duration,
    /// Interval between `{heartbeat: {...}}` client events.
    pub heartbeat_interval: Duration,
    /// Interval between protocol-level keepalive pings.
    pub keepalive_interval: Duration,
    /// Safety margin subtracted from a token's reported expiry.
    pub token_safety_margin: Duration,
    /// Fallback token lifetime when neither expiry source is finite.
    pub default_token_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(20),
            keepalive_interval: Duration::from_secs(45),
            token_safety_margin: Duration::from_secs(60),
            default_token_ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl Config {
    /// Build from environment variables, falling back to [`Default`] for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            connect_timeout: env_secs("WORKFLOW_BRIDGE_CONNECT_TIMEOUT_SECS")
                .unwrap_or(defaults.connect_timeout),
            heartbeat_interval: env_secs("WORKFLOW_BRIDGE_HEARTBEAT_SECS")
                .unwrap_or(defaults.heartbeat_interval),
            keepalive_interval: env_secs("WORKFLOW_BRIDGE_KEEPALIVE_SECS")
                .unwrap_or(defaults.keepalive_interval),
            token_safety_margin: env_secs("WORKFLOW_BRIDGE_TOKEN_SAFETY_MARGIN_SECS")
                .unwrap_or(defaults.token_safety_margin),
            default_token_ttl: env_secs("WORKFLOW_BRIDGE_DEFAULT_TOKEN_TTL_SECS")
                .unwrap_or(defaults.default_token_ttl),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
