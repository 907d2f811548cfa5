//! Smoke-test CLI for `workflow-bridge-core`.
//!
//! `map-tool` and `bridge-tool` exercise the pure mapping layers without a
//! live Service socket, the same poke-at-the-translation-rules role
//! `vscodelm_cli` plays for the agent example it sits alongside.
//! `drive-session` goes further and actually opens a workflow session
//! against a real (or locally mocked) Service instance, printing every
//! Host-facing stream event a single turn produces — useful for
//! confirming end-to-end wiring without a real Host attached.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use workflow_bridge_core::adapter::{ModelAdapter, StreamOptions};
use workflow_bridge_core::config::Config;
use workflow_bridge_core::http::{ReqwestCredentialProvider, ReqwestHttpTransport};
use workflow_bridge_core::persistence::JsonFileWorkflowIdStore;
use workflow_bridge_core::queue::EventQueue;
use workflow_bridge_core::registry::SessionRegistry;
use workflow_bridge_core::token::CachingTokenService;
use workflow_bridge_core::{bridge_tools, tool_mapper};

#[derive(Parser, Debug)]
#[command(name = "workflow-bridge")]
#[command(about = "Smoke-test CLI for the workflow-bridge core crate")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Map a Service tool name + JSON args to the Host tool call(s) it
    /// translates to.
    MapTool {
        /// Service-native tool name, e.g. `read_file`.
        name: String,
        /// JSON object of arguments.
        args: String,
    },
    /// Validate a raw bridge-tool payload for one of the sentinel program
    /// names (`__todo_write__`, `__webfetch__`, `__question__`, `__skill__`,
    /// `__todo_read__`).
    BridgeTool {
        /// Bridge program name, e.g. `__todo_write__`.
        program: String,
        /// Raw JSON payload, optionally wrapped in one layer of quotes.
        payload: String,
    },
    /// Shell-quote a single token the way `run_command`/`shell_command`
    /// mapping does.
    Quote {
        token: String,
    },
    /// Drive one Host turn against a live instance: create/resume a
    /// workflow, send the goal, and print every Host stream event.
    DriveSession {
        /// GitLab instance base URL, e.g. `https://gitlab.example.com`.
        instance_url: String,
        /// Bearer token used to request a direct-access Service token.
        bearer_token: String,
        /// The user goal for this turn.
        goal: String,
        /// Host session ID; defaults to a fixed smoke-test value.
        #[arg(long, default_value = "cli-smoke-test")]
        session_id: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::MapTool { name, args } => run_map_tool(&name, &args),
        Command::BridgeTool { program, payload } => run_bridge_tool(&program, &payload),
        Command::Quote { token } => {
            println!("{}", tool_mapper::shell_quote(&token));
            Ok(())
        }
        Command::DriveSession {
            instance_url,
            bearer_token,
            goal,
            session_id,
        } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_drive_session(instance_url, bearer_token, goal, session_id))
        }
    }
}

fn run_map_tool(name: &str, args: &str) -> Result<()> {
    let args: Value = serde_json::from_str(args).context("args must be valid JSON")?;
    let mapped = tool_mapper::map(name, &args);
    let calls = mapped.into_vec();
    let rendered = serde_json::to_string_pretty(&calls_to_json(&calls))?;
    println!("{rendered}");
    Ok(())
}

fn calls_to_json(calls: &[tool_mapper::HostToolCall]) -> Value {
    serde_json::Value::Array(
        calls
            .iter()
            .map(|c| serde_json::json!({ "toolName": c.tool_name, "args": c.args }))
            .collect(),
    )
}

async fn run_drive_session(
    instance_url: String,
    bearer_token: String,
    goal: String,
    session_id: String,
) -> Result<()> {
    let config = Config::from_env();
    let workflow_definition = "software_development".to_string();

    let credentials = Arc::new(ReqwestCredentialProvider::new(instance_url.clone(), bearer_token));
    let token_service = Arc::new(CachingTokenService::new(credentials, workflow_definition.clone(), &config));
    let http = Arc::new(ReqwestHttpTransport::new());
    let store_path = workflow_id_store_path();
    let store = Arc::new(JsonFileWorkflowIdStore::new(store_path));
    let registry = Arc::new(SessionRegistry::new(http, token_service, store, config));
    let adapter = ModelAdapter::new(registry);

    let options = StreamOptions {
        messages: vec![json!({"role": "user", "parts": [{"type": "text", "text": goal}]})],
        instance_url,
        model_id: "cli-smoke-test".to_string(),
        workflow_definition,
        environment: "ide".to_string(),
        project_id: None,
        root_namespace_id: None,
        host_session_id: Some(session_id),
        provider_session_header: None,
    };

    let sink = EventQueue::new();
    adapter.stream(options, &sink).await.context("turn failed")?;

    while let Some(event) = sink.take().await {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

fn workflow_id_store_path() -> std::path::PathBuf {
    std::env::temp_dir().join("workflow-bridge-cli").join("workflow-ids.json")
}

fn run_bridge_tool(program: &str, payload: &str) -> Result<()> {
    let call = bridge_tools::dispatch(program, payload);
    let rendered = serde_json::to_string_pretty(&serde_json::json!({
        "toolName": call.tool_name,
        "args": call.args,
    }))?;
    println!("{rendered}");
    Ok(())
}
