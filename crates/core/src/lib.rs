//! Core workflow-bridge engine: session lifecycle, socket persistence,
//! tool-call correlation, and translation between a Host's turn-oriented
//! streaming contract and a remote Service's checkpoint-oriented protocol.
//!
//! Layout mirrors the dependency order leaves-first, the same way
//! `scp`'s module tree builds `jsonrpc` before `acp` before `proxy`:
//! [`queue`] and [`protocol`] have no internal dependents; [`tool_mapper`],
//! [`bridge_tools`], [`action_mapper`] and [`checkpoint`] build on
//! `protocol`; [`token`] and [`socket`] are the transport layer; [`session`]
//! and [`registry`] own the per-session state machine; [`adapter`] is the
//! Host-facing surface; [`prompt`] is a small utility module it depends on.

pub mod action_mapper;
pub mod adapter;
pub mod bridge_tools;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod http;
pub mod persistence;
pub mod progress_log;
pub mod prompt;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod session;
pub mod socket;
pub mod token;
pub mod tool_mapper;

pub use adapter::ModelAdapter;
pub use config::Config;
pub use error::{BridgeError, Result};
pub use registry::SessionRegistry;
pub use session::WorkflowSession;
