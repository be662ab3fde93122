//! Tool listing and invocation commands.

use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use super::CommandResult;
use crate::mcp_client::{
    AggregatedTool, McpError, SingletonGuard, ToolAggregator, ToolDescriptor,
};

/// Result of a routed tool call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    /// Name the caller asked for.
    pub tool: String,
    /// Server that handled the call.
    pub server: String,
    /// The server's result payload, unchanged.
    pub result: Value,
    pub execution_time_ms: u64,
}

/// Every connected server's tools, tagged with the owning server.
pub async fn get_all_tools(guard: &SingletonGuard) -> CommandResult<Vec<ToolDescriptor>> {
    match guard.get_instance().await {
        Ok(manager) => CommandResult::ok(manager.all_tools().await),
        Err(e) => CommandResult::err(&e),
    }
}

/// The collision-resolved catalog, in exposed-name order.
pub async fn list_tools(guard: &SingletonGuard) -> CommandResult<Vec<AggregatedTool>> {
    match guard.get_instance().await {
        Ok(manager) => {
            CommandResult::ok(ToolAggregator::new(manager).list_tools().into_iter().collect())
        }
        Err(e) => CommandResult::err(&e),
    }
}

pub async fn get_server_tools(
    guard: &SingletonGuard,
    name: &str,
) -> CommandResult<Vec<ToolDescriptor>> {
    let result = async {
        let manager = guard.get_instance().await?;
        manager.server_tools(name).await
    }
    .await;
    result.into()
}

/// Invoke a tool by bare, exposed or `server.tool` name.
pub async fn call_tool(
    guard: &SingletonGuard,
    name: &str,
    arguments: Value,
) -> CommandResult<ToolCallResult> {
    let start = Instant::now();
    let result = async {
        let aggregator = ToolAggregator::new(guard.get_instance().await?);
        let tool = aggregator.resolve(name).into_result(name)?;
        let result = aggregator.invoke_resolved(&tool, arguments).await?;
        Ok::<_, McpError>(ToolCallResult {
            tool: name.to_string(),
            server: tool.server_name,
            result,
            execution_time_ms: start.elapsed().as_millis() as u64,
        })
    }
    .await;

    if let Err(e) = &result {
        tracing::warn!(tool = %name, error = %e, "tool call failed");
    }
    result.into()
}
