//! MCP orchestrator: spawns MCP tool-provider subprocesses, speaks
//! line-delimited JSON-RPC 2.0 to them over stdio, and exposes their tools
//! through one process-wide connection manager.

pub mod commands;
pub mod config;
pub mod logging;
pub mod mcp_client;
