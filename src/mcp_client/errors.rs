//! MCP client error types.
//!
//! Every variant carries the server (or tool) name it concerns so a failure
//! can be reported against that server without aborting the others.
//! `Clone` is required because one connect or initialization attempt is
//! shared by every caller awaiting it.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// Malformed server definition or unreadable configuration.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// A server with this name is already registered.
    #[error("server '{name}' is already registered")]
    DuplicateServer { name: String },

    /// No server with this name is registered.
    #[error("unknown server: '{name}'")]
    ServerNotFound { name: String },

    /// The server is registered but has no usable connection.
    #[error("server '{name}' is not connected")]
    NotConnected { name: String },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The `initialize` / `tools/list` handshake failed.
    #[error("server '{name}' handshake failed: {reason}")]
    HandshakeFailed { name: String, reason: String },

    /// I/O or framing failure while talking to a server.
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// The connection was closed locally while the request was pending.
    #[error("connection to server '{server}' closed")]
    ConnectionClosed { server: String },

    /// The server process exited (or its stdout closed) mid-session.
    #[error("server '{server}' process terminated")]
    ProcessTerminated { server: String },

    /// No response arrived within the configured bound.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No connected server exposes this tool.
    #[error("tool not found: '{name}'")]
    ToolNotFound { name: String },

    /// A bare tool name is exposed by more than one server.
    #[error("tool '{name}' is ambiguous; use one of: {}", candidates.join(", "))]
    AmbiguousTool {
        name: String,
        candidates: Vec<String>,
    },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The server answered `tools/call` with a protocol-level error object.
    #[error("tool invocation failed for '{tool}' on '{server}' [{code}]: {message}")]
    ToolInvocationFailed {
        tool: String,
        server: String,
        code: i64,
        message: String,
    },

    /// All reconnect attempts exhausted for a server.
    #[error("server '{name}' failed after {attempts} restart attempts")]
    RestartExhausted { name: String, attempts: u32 },

    /// The connection manager has been shut down.
    #[error("connection manager has been shut down")]
    ManagerShutDown,

    /// The singleton could not be constructed.
    #[error("initialization failed: {reason}")]
    InitializationFailed { reason: String },
}

impl McpError {
    /// Short category name used in structured results.
    pub fn kind(&self) -> &'static str {
        match self {
            McpError::ConfigError { .. } | McpError::DuplicateServer { .. } => "config",
            McpError::SpawnFailed { .. } => "spawn",
            McpError::HandshakeFailed { .. } => "handshake",
            McpError::ServerError { .. }
            | McpError::ToolInvocationFailed { .. }
            | McpError::InvalidArguments { .. } => "rpc",
            McpError::TransportError { .. }
            | McpError::ConnectionClosed { .. }
            | McpError::ProcessTerminated { .. }
            | McpError::NotConnected { .. }
            | McpError::RestartExhausted { .. } => "transport",
            McpError::Timeout { .. } => "timeout",
            McpError::ServerNotFound { .. }
            | McpError::ToolNotFound { .. }
            | McpError::AmbiguousTool { .. } => "not_found",
            McpError::ManagerShutDown | McpError::InitializationFailed { .. } => "singleton",
        }
    }

    /// Whether the failure came from the connection itself rather than the
    /// request (the server may need reconnecting).
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            McpError::TransportError { .. }
                | McpError::ConnectionClosed { .. }
                | McpError::ProcessTerminated { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            McpError::ConfigError {
                reason: "x".into()
            }
            .kind(),
            "config"
        );
        assert_eq!(
            McpError::Timeout {
                server: "s".into(),
                method: "tools/call".into(),
                timeout_ms: 10,
            }
            .kind(),
            "timeout"
        );
        assert_eq!(McpError::ToolNotFound { name: "t".into() }.kind(), "not_found");
        assert_eq!(McpError::ManagerShutDown.kind(), "singleton");
    }

    #[test]
    fn test_ambiguous_tool_message_lists_candidates() {
        let err = McpError::AmbiguousTool {
            name: "b".into(),
            candidates: vec!["one.b".into(), "two.b".into()],
        };
        assert_eq!(err.to_string(), "tool 'b' is ambiguous; use one of: one.b, two.b");
    }

    #[test]
    fn test_is_transport_failure() {
        assert!(McpError::ProcessTerminated { server: "s".into() }.is_transport_failure());
        assert!(!McpError::ToolNotFound { name: "t".into() }.is_transport_failure());
    }
}
