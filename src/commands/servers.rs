//! Server management commands: add, remove, disconnect, reconnect.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::CommandResult;
use crate::mcp_client::{
    ConnectionManager, McpError, ServerDefinition, ServerStatus, SingletonGuard,
};

/// Payload accepted when registering a server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddServerRequest {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

impl From<AddServerRequest> for ServerDefinition {
    fn from(request: AddServerRequest) -> Self {
        ServerDefinition {
            name: request.name,
            command: request.command,
            args: request.args,
            env: request.env,
            cwd: request.cwd,
        }
    }
}

/// Register a server and connect it. Returns its status once the handshake
/// has succeeded.
pub async fn add_server(
    guard: &SingletonGuard,
    request: AddServerRequest,
) -> CommandResult<ServerStatus> {
    let result = async {
        let manager = guard.get_instance().await?;
        let name = request.name.clone();
        manager.add_server(request.into()).await?;
        server_status(&manager, &name)
    }
    .await;
    result.into()
}

/// Disconnect and unregister a server.
pub async fn remove_server(guard: &SingletonGuard, name: &str) -> CommandResult<()> {
    let result = async {
        let manager = guard.get_instance().await?;
        manager.remove_server(name).await
    }
    .await;
    result.into()
}

/// Close a server's connection. Succeeds if it was already disconnected.
pub async fn disconnect_server(guard: &SingletonGuard, name: &str) -> CommandResult<ServerStatus> {
    let result = async {
        let manager = guard.get_instance().await?;
        manager.disconnect_server(name).await?;
        server_status(&manager, name)
    }
    .await;
    result.into()
}

/// Reconnect a server, subject to the restart backoff policy.
pub async fn reconnect_server(guard: &SingletonGuard, name: &str) -> CommandResult<ServerStatus> {
    let result = async {
        let manager = guard.get_instance().await?;
        manager.reconnect_server(name).await?;
        server_status(&manager, name)
    }
    .await;
    result.into()
}

fn server_status(manager: &ConnectionManager, name: &str) -> Result<ServerStatus, McpError> {
    manager
        .status()
        .server(name)
        .cloned()
        .ok_or_else(|| McpError::ServerNotFound {
            name: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::{ManagerSettings, ServerRegistry};

    fn empty_guard() -> SingletonGuard {
        SingletonGuard::new(|| Ok((ServerRegistry::new(), ManagerSettings::default())))
    }

    #[test]
    fn test_request_deserialization() {
        let request: AddServerRequest = serde_json::from_str(
            r#"{"name": "fs", "command": "npx", "args": ["-y", "fs-mcp"], "env": {"ROOT": "/tmp"}}"#,
        )
        .unwrap();
        let definition = ServerDefinition::from(request);
        assert_eq!(definition.name, "fs");
        assert_eq!(definition.args, vec!["-y", "fs-mcp"]);
        assert_eq!(definition.env["ROOT"], "/tmp");
        assert!(definition.cwd.is_none());
    }

    #[test]
    fn test_request_env_is_optional() {
        let request: AddServerRequest =
            serde_json::from_str(r#"{"name": "echo", "command": "echo-mcp"}"#).unwrap();
        assert!(request.args.is_empty());
        assert!(request.env.is_empty());
    }

    #[tokio::test]
    async fn test_add_invalid_server_is_config_failure() {
        let guard = empty_guard();
        let request = AddServerRequest {
            name: "bad.name".into(),
            command: "x".into(),
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
        };
        let result = add_server(&guard, request).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, "config");
    }

    #[tokio::test]
    async fn test_disconnect_unknown_server_fails() {
        let guard = empty_guard();
        let result = disconnect_server(&guard, "ghost").await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, "not_found");
    }
}
