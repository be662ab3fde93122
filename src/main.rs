//! `mcp-orchestrator` command-line host.
//!
//! Builds the process-wide connection manager from `orchestrator.yaml` and
//! `mcp-servers.json`, runs one command against it, prints the structured
//! result as JSON, then shuts every server down.

use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;

use mcp_orchestrator::commands::{self, CommandResult};
use mcp_orchestrator::logging::{self, LogTarget};
use mcp_orchestrator::mcp_client::{singleton, ServerEvent, SingletonGuard};

#[derive(Debug, Parser)]
#[command(name = "mcp-orchestrator", version, about = "Manage and call MCP tool servers")]
struct Cli {
    /// Write logs to the data directory instead of stderr.
    #[arg(long, global = true)]
    log_file: bool,

    /// Upper bound for the whole command, in seconds.
    #[arg(long, global = true, default_value_t = 120)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect configured servers and print the status snapshot.
    Status,
    /// Per-server diagnostics (pids, pending requests, last errors).
    Diagnostics,
    /// Names of connected servers.
    Servers,
    /// List tools, either aggregated or for one server.
    Tools {
        #[arg(long)]
        server: Option<String>,
        /// Print the raw server-tagged list instead of the aggregated catalog.
        #[arg(long)]
        raw: bool,
    },
    /// Invoke a tool with JSON arguments.
    Call {
        tool: String,
        #[arg(default_value = "{}")]
        arguments: String,
    },
    /// Register an extra server for this run and connect it.
    Add {
        name: String,
        command: String,
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print server notifications and log lines until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(if cli.log_file {
        LogTarget::File
    } else {
        LogTarget::Stderr
    });

    let guard = singleton::global();
    let outcome = tokio::time::timeout(
        Duration::from_secs(cli.timeout_secs),
        run(guard, cli.command),
    )
    .await;
    guard.reset().await;

    match outcome {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => std::process::exit(1),
        Ok(Err(e)) => Err(e),
        Err(_) => bail!("command timed out after {}s", cli.timeout_secs),
    }
}

/// Run one command. Returns whether it succeeded.
async fn run(guard: &SingletonGuard, command: Command) -> anyhow::Result<bool> {
    match command {
        Command::Status => emit(&commands::status::get_status(guard).await),
        Command::Diagnostics => emit(&commands::status::get_diagnostics(guard).await),
        Command::Servers => emit(&commands::status::get_connected_servers(guard).await),
        Command::Tools { server: Some(name), .. } => {
            emit(&commands::tools::get_server_tools(guard, &name).await)
        }
        Command::Tools { server: None, raw: true } => {
            emit(&commands::tools::get_all_tools(guard).await)
        }
        Command::Tools { server: None, raw: false } => {
            emit(&commands::tools::list_tools(guard).await)
        }
        Command::Call { tool, arguments } => {
            let arguments: serde_json::Value = serde_json::from_str(&arguments)
                .with_context(|| format!("arguments for '{tool}' are not valid JSON"))?;
            emit(&commands::tools::call_tool(guard, &tool, arguments).await)
        }
        Command::Add {
            name,
            command,
            env,
            args,
        } => {
            let request = commands::servers::AddServerRequest {
                name,
                command,
                args,
                env: env.into_iter().collect(),
                cwd: None,
            };
            emit(&commands::servers::add_server(guard, request).await)
        }
        Command::Watch => watch(guard).await,
    }
}

async fn watch(guard: &SingletonGuard) -> anyhow::Result<bool> {
    let manager = guard
        .get_instance()
        .await
        .context("failed to initialize MCP servers")?;
    let mut events = manager.subscribe();
    emit(&CommandResult::ok(manager.status()))?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(true),
            event = events.recv() => match event {
                Ok(event) => {
                    if let ServerEvent::Closed { reason } = &event.event {
                        tracing::warn!(server = %event.server, %reason, "server closed");
                    }
                    println!("{}", serde_json::to_string(&serde_json::json!({
                        "server": event.server,
                        "event": event.event,
                    }))?);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(true),
            },
        }
    }
}

fn emit<T: Serialize>(result: &CommandResult<T>) -> anyhow::Result<bool> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(result.is_success())
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))
}
