//! MCP Client: JSON-RPC over stdio orchestration of MCP tool servers.
//!
//! This module handles:
//! - Spawning and managing MCP server child processes
//! - JSON-RPC 2.0 communication over process stdio, with request correlation
//! - The `initialize` → `tools/list` handshake and per-server health
//! - Tool aggregation across all servers and routing of `tools/call`
//! - A process-wide singleton that survives concurrent and re-entrant setup

pub mod aggregator;
pub mod errors;
pub mod lifecycle;
pub mod manager;
pub mod servers;
pub mod singleton;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use aggregator::{AggregatedCatalog, AggregatedTool, ToolAggregator, ToolResolution};
pub use errors::McpError;
pub use lifecycle::ManagerSettings;
pub use manager::{ConnectionManager, ManagerEvent};
pub use servers::ServerRegistry;
pub use singleton::{InstanceInfo, SingletonGuard};
pub use types::{
    ConnectionState, ManagerStatus, ServerDefinition, ServerEvent, ServerStatus, ToolDescriptor,
};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Critical sections never run user code, so a poisoned lock still guards
// consistent data.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
