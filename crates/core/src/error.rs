//! Crate-wide error type.
//!
//! Mirrors the error kinds enumerated in the bridge's error-handling design:
//! each failure mode the session/adapter can hit gets its own variant so
//! callers can match on it instead of string-sniffing, the way
//! `NodeSdkError` in the node-sdk crate separates `WebSocket`, `Handshake`,
//! and `ReconnectExhausted` rather than collapsing everything into `anyhow`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("host session id missing from request options and x-opencode-session header")]
    MissingSessionId,

    #[error("attempted to send on a session with no open socket")]
    NotConnected,

    #[error("timed out connecting to the workflow service after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("failed to connect to the workflow service: {0}")]
    ConnectFailed(String),

    #[error("workflow creation failed: {0}")]
    WorkflowCreateFailed(String),

    #[error("failed to decode a socket frame: {0}")]
    DecodeFailed(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
