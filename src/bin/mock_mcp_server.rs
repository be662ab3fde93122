//! Scriptable MCP server speaking line-delimited JSON-RPC over stdio.
//!
//! Used by the integration tests to exercise spawn, handshake, routing and
//! failure paths against a real subprocess.

use std::fs::OpenOptions;
use std::io::{BufRead, Write};
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "mock-mcp-server")]
struct Args {
    /// Reported in `serverInfo.name`.
    #[arg(long, default_value = "mock")]
    name: String,

    /// Comma-separated tool names.
    #[arg(long, default_value = "ping", value_delimiter = ',')]
    tools: Vec<String>,

    /// Tools per `tools/list` page; 0 disables pagination.
    #[arg(long, default_value_t = 0)]
    page_size: usize,

    /// Exit with this code before reading any input.
    #[arg(long)]
    exit_immediately: Option<i32>,

    /// Answer `initialize` with an error.
    #[arg(long)]
    fail_init: bool,

    /// Delay before answering `initialize`.
    #[arg(long, default_value_t = 0)]
    init_delay_ms: u64,

    /// Interleave non-JSON lines and notifications with responses.
    #[arg(long)]
    noise: bool,

    /// Never answer `tools/call`.
    #[arg(long)]
    hang_on_call: bool,

    /// Answer `tools/call` with a JSON-RPC error.
    #[arg(long)]
    error_on_call: bool,

    /// Exit (code 3) when a `tools/call` arrives.
    #[arg(long)]
    exit_on_call: bool,

    /// Append `<name> <pid>` to this file at startup.
    #[arg(long)]
    spawn_log: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.spawn_log {
        let mut log = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(log, "{} {}", args.name, std::process::id())?;
    }

    if let Some(code) = args.exit_immediately {
        eprintln!("{}: exiting immediately with code {code}", args.name);
        std::process::exit(code);
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if args.noise {
        writeln!(out, "{} booting (this line is not JSON)", args.name)?;
        out.flush()?;
    }
    eprintln!("{}: ready", args.name);

    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("{}: ignoring non-JSON input", args.name);
            continue;
        };
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            continue;
        };
        // Notifications get no reply.
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let reply = match method {
            "initialize" => {
                if args.init_delay_ms > 0 {
                    std::thread::sleep(Duration::from_millis(args.init_delay_ms));
                }
                if args.fail_init {
                    eprintln!("{}: refusing to initialize", args.name);
                    error(id, -32603, "initialization refused")
                } else {
                    success(
                        id,
                        json!({
                            "protocolVersion": params
                                .get("protocolVersion")
                                .cloned()
                                .unwrap_or(json!("2024-11-05")),
                            "capabilities": {"tools": {}},
                            "serverInfo": {"name": args.name, "version": "0.0.1"},
                        }),
                    )
                }
            }
            "tools/list" => success(id, list_tools(&args, &params)),
            "tools/call" => {
                if args.exit_on_call {
                    eprintln!("{}: crashing on tools/call", args.name);
                    std::process::exit(3);
                }
                if args.hang_on_call {
                    continue;
                }
                if args.noise {
                    writeln!(out, "handling tools/call (debug output)")?;
                    writeln!(
                        out,
                        "{}",
                        json!({
                            "jsonrpc": "2.0",
                            "method": "notifications/message",
                            "params": {"level": "info", "data": "tool called"},
                        })
                    )?;
                }
                call_tool(&args, id, &params)
            }
            "ping" => success(id, json!({})),
            other => error(id, -32601, &format!("method not found: {other}")),
        };

        writeln!(out, "{reply}")?;
        out.flush()?;
    }

    Ok(())
}

fn list_tools(args: &Args, params: &Value) -> Value {
    let descriptors: Vec<Value> = args
        .tools
        .iter()
        .map(|name| {
            json!({
                "name": name,
                "description": format!("{name} from {}", args.name),
                "inputSchema": {"type": "object", "properties": {}},
            })
        })
        .collect();

    if args.page_size == 0 {
        return json!({"tools": descriptors});
    }

    let start: usize = params
        .get("cursor")
        .and_then(Value::as_str)
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    let end = (start + args.page_size).min(descriptors.len());
    let mut page = json!({"tools": descriptors[start.min(end)..end]});
    if end < descriptors.len() {
        page["nextCursor"] = json!(end.to_string());
    }
    page
}

fn call_tool(args: &Args, id: Value, params: &Value) -> Value {
    let tool = params.get("name").and_then(Value::as_str).unwrap_or_default();
    if !args.tools.iter().any(|t| t == tool) {
        return error(id, -32602, &format!("unknown tool: {tool}"));
    }
    if args.error_on_call {
        return error(id, -32000, &format!("{tool} failed"));
    }
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
    success(
        id,
        json!({
            "content": [{"type": "text", "text": format!("{tool} handled by {}", args.name)}],
            "echo": {"server": args.name, "tool": tool, "arguments": arguments},
        }),
    )
}

fn success(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error(id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}
