//! Boundary operations exposed to request handlers.
//!
//! Every command takes the [`SingletonGuard`](crate::mcp_client::SingletonGuard)
//! it operates on and returns a [`CommandResult`]; no error escapes as a
//! panic or a bare `Err`.

pub mod servers;
pub mod status;
pub mod tools;

use serde::Serialize;

use crate::mcp_client::McpError;

/// Structured success/failure envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
}

/// Error half of a [`CommandResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandError {
    /// Category from [`McpError::kind`].
    pub kind: String,
    pub message: String,
}

impl<T> CommandResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: &McpError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(CommandError {
                kind: error.kind().to_string(),
                message: error.to_string(),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}

impl<T> From<Result<T, McpError>> for CommandResult<T> {
    fn from(result: Result<T, McpError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => {
                tracing::debug!(kind = e.kind(), error = %e, "command failed");
                Self::err(&e)
            }
        }
    }
}
