//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, server definitions and
//! the status snapshots handed to callers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no `id`, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// Reply we send back for a request the server initiated.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcReply {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcReply {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: &str) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Payload of a response, already validated.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Result(Value),
    Error(JsonRpcError),
    /// Had an `id` but neither a usable `result` nor `error`.
    Malformed(String),
}

/// One protocol frame read from a server's stdout.
///
/// Discriminated by the presence of `id` / `method` / `result` / `error`.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Answer to one of our requests.
    Response { id: u64, outcome: ResponseOutcome },
    /// Server-initiated request that expects a reply.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    /// Server-initiated notification.
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl IncomingMessage {
    /// Classify one line of server output.
    ///
    /// Returns `None` for anything that is not a routable JSON-RPC frame:
    /// non-JSON text, non-object JSON, or a response whose id we could never
    /// have issued. Those lines are surfaced as log output by the transport.
    pub fn parse(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line).ok()?;
        let obj = value.as_object()?;

        let id = obj.get("id").filter(|v| !v.is_null());

        if let Some(method) = obj.get("method").and_then(Value::as_str) {
            let params = obj.get("params").cloned();
            return Some(match id {
                Some(id) => IncomingMessage::Request {
                    id: id.clone(),
                    method: method.to_string(),
                    params,
                },
                None => IncomingMessage::Notification {
                    method: method.to_string(),
                    params,
                },
            });
        }

        let id = id?.as_u64()?;
        let outcome = match (obj.get("error").filter(|v| !v.is_null()), obj.get("result")) {
            (Some(err), _) => match serde_json::from_value::<JsonRpcError>(err.clone()) {
                Ok(err) => ResponseOutcome::Error(err),
                Err(e) => ResponseOutcome::Malformed(format!("invalid error object: {e}")),
            },
            (None, Some(result)) => ResponseOutcome::Result(result.clone()),
            (None, None) => {
                ResponseOutcome::Malformed("response missing both result and error".into())
            }
        };
        Some(IncomingMessage::Response { id, outcome })
    }
}

/// Which stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Unsolicited event from a server, delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// JSON-RPC notification sent by the server.
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Non-protocol output (diagnostic text interleaved with frames).
    Log { stream: LogStream, line: String },
    /// The transport stopped reading; no further events follow.
    Closed { reason: String },
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// A tool exposed by a server, tagged with the server that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "input_schema")]
    pub input_schema: Value,
    /// Filled in by the client; servers never send it.
    #[serde(default)]
    pub server_name: String,
}

/// MCP `initialize` response payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// MCP `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

// ─── Server Definitions ──────────────────────────────────────────────────────

/// Launch configuration of one server, as it appears in `mcp-servers.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Top-level MCP servers configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

/// Immutable definition of a tool-provider server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDefinition {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl ServerDefinition {
    pub fn new(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn from_config(name: &str, config: ServerConfig) -> Self {
        Self {
            name: name.to_string(),
            command: config.command,
            args: config.args,
            env: config.env,
            cwd: config.cwd,
        }
    }
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// Lifecycle state of one configured server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Per-server entry of a status snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub name: String,
    pub connected: bool,
    pub tool_count: usize,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Snapshot returned by `ConnectionManager::status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub total_servers: usize,
    pub connected_servers: usize,
    pub servers: Vec<ServerStatus>,
}

impl ManagerStatus {
    pub fn server(&self, name: &str) -> Option<&ServerStatus> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// Detailed, read-only view of one server for debug endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDiagnostics {
    pub name: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub process_alive: bool,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub pending_requests: usize,
    pub next_message_id: u64,
    pub tool_count: usize,
    pub restart_count: u32,
    pub server_info: Option<ServerInfo>,
    pub connected_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
