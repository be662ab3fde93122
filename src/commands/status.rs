//! Status, diagnostics and singleton lifecycle commands.

use serde::Serialize;

use super::CommandResult;
use crate::mcp_client::types::ServerDiagnostics;
use crate::mcp_client::{InstanceInfo, ManagerStatus, SingletonGuard};

/// Instance snapshot plus per-server detail, for debug endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    pub instance: InstanceInfo,
    pub checked_at: String,
    pub servers: Vec<ServerDiagnostics>,
}

/// Build (or join the build of) the manager and report the instance.
pub async fn initialize(guard: &SingletonGuard) -> CommandResult<InstanceInfo> {
    match guard.get_instance().await {
        Ok(_) => CommandResult::ok(guard.instance_info()),
        Err(e) => CommandResult::err(&e),
    }
}

/// Tear down the current manager. The next command builds a fresh one.
pub async fn reset(guard: &SingletonGuard) -> CommandResult<InstanceInfo> {
    guard.reset().await;
    CommandResult::ok(guard.instance_info())
}

/// Instance info without triggering initialization.
pub fn instance_info(guard: &SingletonGuard) -> CommandResult<InstanceInfo> {
    CommandResult::ok(guard.instance_info())
}

pub async fn get_status(guard: &SingletonGuard) -> CommandResult<ManagerStatus> {
    match guard.get_instance().await {
        Ok(manager) => CommandResult::ok(manager.status()),
        Err(e) => CommandResult::err(&e),
    }
}

pub async fn get_connected_servers(guard: &SingletonGuard) -> CommandResult<Vec<String>> {
    match guard.get_instance().await {
        Ok(manager) => CommandResult::ok(manager.connected_server_names()),
        Err(e) => CommandResult::err(&e),
    }
}

pub async fn get_diagnostics(guard: &SingletonGuard) -> CommandResult<DiagnosticsReport> {
    match guard.get_instance().await {
        Ok(manager) => CommandResult::ok(DiagnosticsReport {
            instance: guard.instance_info(),
            checked_at: chrono::Utc::now().to_rfc3339(),
            servers: manager.diagnostics(),
        }),
        Err(e) => CommandResult::err(&e),
    }
}
