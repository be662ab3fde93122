//! Connection manager: lifecycle orchestration for all configured servers.
//!
//! Owns the map of server name → live [`ManagedServer`]. Only the manager
//! writes that map; the aggregator and external callers read snapshots.
//!
//! Per-server state machine:
//! `connecting → connected → disconnected`, `connecting → failed`.
//! A connect request for a server that is already connecting awaits the
//! in-flight attempt instead of spawning a second process.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::errors::McpError;
use super::lifecycle::{self, ManagedServer, ManagerSettings};
use super::servers::ServerRegistry;
use super::types::{
    ConnectionState, ManagerStatus, ServerDefinition, ServerDiagnostics, ServerEvent,
    ServerStatus, ToolDescriptor,
};
use super::{lock, read, write};

/// Buffered manager-wide events per subscriber.
const EVENT_CAPACITY: usize = 512;

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), McpError>>>;

/// A server event, tagged with the server it came from.
#[derive(Debug, Clone)]
pub struct ManagerEvent {
    pub server: String,
    pub event: ServerEvent,
}

/// Bookkeeping kept per configured server, connected or not.
#[derive(Debug, Clone)]
struct ServerRecord {
    state: ConnectionState,
    last_error: Option<String>,
    restart_count: u32,
}

impl Default for ServerRecord {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_error: None,
            restart_count: 0,
        }
    }
}

struct ManagerInner {
    settings: ManagerSettings,
    registry: RwLock<ServerRegistry>,
    connections: RwLock<HashMap<String, Arc<ManagedServer>>>,
    records: Mutex<HashMap<String, ServerRecord>>,
    attempts: Mutex<HashMap<String, ConnectAttempt>>,
    /// Servers whose connection died without being asked to. Cleared when
    /// the server reconnects or is disconnected or removed explicitly.
    lost: Mutex<HashSet<String>>,
    shut_down: AtomicBool,
    events: broadcast::Sender<ManagerEvent>,
}

impl ManagerInner {
    fn update_record(&self, name: &str, f: impl FnOnce(&mut ServerRecord)) {
        f(lock(&self.records).entry(name.to_string()).or_default());
    }

    fn forget_lost(&self, name: &str) {
        lock(&self.lost).remove(name);
    }

    fn set_state(&self, name: &str, state: ConnectionState, last_error: Option<String>) {
        self.update_record(name, |record| {
            record.state = state;
            record.last_error = last_error;
        });
    }
}

// ─── ConnectionManager ───────────────────────────────────────────────────────

/// Manages every MCP server connection. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create a manager over a registry. Nothing is spawned until
    /// [`Self::start`] or [`Self::connect`].
    pub fn new(registry: ServerRegistry, settings: ManagerSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                settings,
                registry: RwLock::new(registry),
                connections: RwLock::new(HashMap::new()),
                records: Mutex::new(HashMap::new()),
                attempts: Mutex::new(HashMap::new()),
                lost: Mutex::new(HashSet::new()),
                shut_down: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    /// Whether two handles refer to the same manager.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect every registered server concurrently.
    ///
    /// Returns the servers that failed (partial startup is OK).
    pub async fn start(&self) -> Vec<(String, McpError)> {
        let names = read(&self.inner.registry).names();
        let results = join_all(names.iter().map(|name| self.connect(name))).await;

        let errors: Vec<(String, McpError)> = names
            .into_iter()
            .zip(results)
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect();

        for (name, err) in &errors {
            tracing::warn!(
                server = %name,
                error = %err,
                "MCP server failed to start (non-fatal)"
            );
        }
        errors
    }

    /// Connect a registered server, or join the attempt already in flight.
    ///
    /// A server that is already connected is left alone.
    pub async fn connect(&self, name: &str) -> Result<(), McpError> {
        self.ensure_running()?;

        let attempt = {
            let mut attempts = lock(&self.inner.attempts);
            match attempts.get(name) {
                Some(attempt) => attempt.clone(),
                None => {
                    let already_connected = read(&self.inner.connections)
                        .get(name)
                        .is_some_and(|server| server.is_connected());
                    if already_connected {
                        return Ok(());
                    }

                    let definition = read(&self.inner.registry)
                        .get(name)
                        .cloned()
                        .ok_or(McpError::ServerNotFound {
                            name: name.to_string(),
                        })?;

                    self.inner
                        .set_state(name, ConnectionState::Connecting, None);

                    let task = tokio::spawn(run_connect(Arc::clone(&self.inner), definition));
                    let task_name = name.to_string();
                    let attempt = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(McpError::SpawnFailed {
                                name: task_name,
                                reason: format!("connect task failed: {e}"),
                            }),
                        }
                    }
                    .boxed()
                    .shared();

                    attempts.insert(name.to_string(), attempt.clone());
                    attempt
                }
            }
        };

        attempt.await
    }

    /// Register a server and connect it.
    ///
    /// An existing server with the same name is closed first. Returns once
    /// the handshake has succeeded or failed; on failure the server is left
    /// not connected, never half-initialized.
    pub async fn add_server(&self, definition: ServerDefinition) -> Result<(), McpError> {
        self.ensure_running()?;
        let name = definition.name.clone();

        let previous = write(&self.inner.registry).upsert(definition)?;
        if previous.is_some() {
            tracing::info!(server = %name, "replacing existing server definition");
            self.close_connection(&name).await;
        }
        self.inner.update_record(&name, |record| record.restart_count = 0);

        self.connect(&name).await
    }

    /// Close a server's connection. Idempotent: disconnecting a server that
    /// is not connected is a no-op.
    pub async fn disconnect_server(&self, name: &str) -> Result<(), McpError> {
        if !read(&self.inner.registry).contains(name) {
            return Err(McpError::ServerNotFound {
                name: name.to_string(),
            });
        }
        self.close_connection(name).await;
        self.inner.forget_lost(name);
        self.inner.update_record(name, |record| {
            record.state = ConnectionState::Disconnected;
        });
        Ok(())
    }

    /// Disconnect a server and delete its definition.
    pub async fn remove_server(&self, name: &str) -> Result<(), McpError> {
        let removed = write(&self.inner.registry).remove(name);
        if removed.is_none() {
            return Err(McpError::ServerNotFound {
                name: name.to_string(),
            });
        }
        self.close_connection(name).await;
        self.inner.forget_lost(name);
        lock(&self.inner.records).remove(name);
        tracing::info!(server = %name, "removed MCP server");
        Ok(())
    }

    /// Tear down and reconnect a server with exponential backoff.
    ///
    /// Fails with `RestartExhausted` once `max_restart_attempts` reconnects
    /// have been made since the server was last added.
    pub async fn reconnect_server(&self, name: &str) -> Result<(), McpError> {
        self.ensure_running()?;
        if !read(&self.inner.registry).contains(name) {
            return Err(McpError::ServerNotFound {
                name: name.to_string(),
            });
        }

        let attempt = lock(&self.inner.records)
            .get(name)
            .map_or(0, |record| record.restart_count);
        let max = self.inner.settings.max_restart_attempts;
        if attempt >= max {
            return Err(McpError::RestartExhausted {
                name: name.to_string(),
                attempts: max,
            });
        }

        // Exponential backoff: base, 2×base, 4×base, ...
        let delay = self
            .inner
            .settings
            .restart_base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        tracing::info!(
            server = %name,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "reconnecting MCP server"
        );
        tokio::time::sleep(delay).await;

        self.inner
            .update_record(name, |record| record.restart_count = attempt + 1);
        self.close_connection(name).await;
        self.connect(name).await
    }

    /// Close every connection. The manager refuses new work afterwards.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);

        let in_flight: Vec<ConnectAttempt> =
            lock(&self.inner.attempts).values().cloned().collect();
        let _ = join_all(in_flight).await;

        let servers: Vec<Arc<ManagedServer>> = write(&self.inner.connections)
            .drain()
            .map(|(_, server)| server)
            .collect();
        let timeout = self.inner.settings.shutdown_timeout;
        join_all(servers.iter().map(|server| server.shutdown(timeout))).await;

        for record in lock(&self.inner.records).values_mut() {
            record.state = ConnectionState::Disconnected;
        }
        tracing::info!(closed = servers.len(), "connection manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Whether this manager's connections can no longer be trusted: it was
    /// shut down, or no connection has a live process while some server is
    /// still marked lost or holds a dead connection.
    ///
    /// Servers the caller disconnected or removed never count.
    pub fn is_stale(&self) -> bool {
        if self.is_shut_down() {
            return true;
        }
        let connections = read(&self.inner.connections);
        let live = connections
            .values()
            .filter(|server| server.is_process_alive())
            .count();
        live == 0 && (!lock(&self.inner.lost).is_empty() || !connections.is_empty())
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    /// Synchronous snapshot of every configured server. Never performs I/O.
    pub fn status(&self) -> ManagerStatus {
        let names = read(&self.inner.registry).names();
        let connections = self.connection_snapshot();
        let records = lock(&self.inner.records).clone();

        let servers: Vec<ServerStatus> = names
            .into_iter()
            .map(|name| {
                let server = connections.get(&name);
                let connected = server.is_some_and(|s| s.is_connected());
                let record = records.get(&name).cloned().unwrap_or_default();
                ServerStatus {
                    connected,
                    tool_count: match server {
                        Some(s) if connected => s.tool_count(),
                        _ => 0,
                    },
                    state: effective_state(record.state, connected),
                    last_error: record.last_error,
                    name,
                }
            })
            .collect();

        ManagerStatus {
            total_servers: servers.len(),
            connected_servers: servers.iter().filter(|s| s.connected).count(),
            servers,
        }
    }

    /// Read-only per-server detail for debug endpoints.
    pub fn diagnostics(&self) -> Vec<ServerDiagnostics> {
        let names = read(&self.inner.registry).names();
        let connections = self.connection_snapshot();
        let records = lock(&self.inner.records).clone();

        names
            .into_iter()
            .map(|name| {
                let server = connections.get(&name);
                let record = records.get(&name).cloned().unwrap_or_default();
                let connected = server.is_some_and(|s| s.is_connected());
                ServerDiagnostics {
                    state: effective_state(record.state, connected),
                    connected,
                    process_alive: server.is_some_and(|s| s.is_process_alive()),
                    pid: server.and_then(|s| s.pid()),
                    exit_code: server.and_then(|s| s.exit_code()),
                    pending_requests: server.map_or(0, |s| s.pending_requests()),
                    next_message_id: server.map_or(0, |s| s.next_message_id()),
                    tool_count: server.map_or(0, |s| s.tool_count()),
                    restart_count: record.restart_count,
                    server_info: server.and_then(|s| s.server_info().cloned()),
                    connected_at: server.map(|s| s.connected_at()),
                    last_error: record.last_error,
                    name,
                }
            })
            .collect()
    }

    /// Names of all configured servers, sorted.
    pub fn configured_servers(&self) -> Vec<String> {
        read(&self.inner.registry).names()
    }

    pub fn definition(&self, name: &str) -> Option<ServerDefinition> {
        read(&self.inner.registry).get(name).cloned()
    }

    /// Names of connected servers, sorted.
    pub fn connected_server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.inner.connections)
            .iter()
            .filter(|(_, server)| server.is_connected())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Tools of one server: the cached list, fetched live only when the cache
    /// is empty and the server is connected.
    pub async fn server_tools(&self, name: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        if !read(&self.inner.registry).contains(name) {
            return Err(McpError::ServerNotFound {
                name: name.to_string(),
            });
        }
        match self.connection(name) {
            Some(server) if server.is_connected() => {
                let cached = server.tools();
                if cached.is_empty() {
                    server.refresh_tools().await
                } else {
                    Ok(cached)
                }
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Tools of every connected server, each tagged with its server.
    ///
    /// A server whose live fetch fails is logged and skipped.
    pub async fn all_tools(&self) -> Vec<ToolDescriptor> {
        let names = self.connected_server_names();
        let results = join_all(names.iter().map(|name| self.server_tools(name))).await;

        let mut tools = Vec::new();
        for (name, result) in names.iter().zip(results) {
            match result {
                Ok(server_tools) => tools.extend(server_tools),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "failed to list server tools");
                }
            }
        }
        tools
    }

    /// Manager-wide stream of server notifications, logs and close events.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Live connection for a server, if any.
    pub(crate) fn connection(&self, name: &str) -> Option<Arc<ManagedServer>> {
        read(&self.inner.connections).get(name).cloned()
    }

    /// Every connected server, sorted by name.
    pub(crate) fn connected_servers(&self) -> Vec<Arc<ManagedServer>> {
        let mut servers: Vec<Arc<ManagedServer>> = read(&self.inner.connections)
            .values()
            .filter(|server| server.is_connected())
            .cloned()
            .collect();
        servers.sort_by(|a, b| a.name().cmp(b.name()));
        servers
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn ensure_running(&self) -> Result<(), McpError> {
        if self.is_shut_down() {
            Err(McpError::ManagerShutDown)
        } else {
            Ok(())
        }
    }

    fn connection_snapshot(&self) -> HashMap<String, Arc<ManagedServer>> {
        read(&self.inner.connections).clone()
    }

    /// Wait out any in-flight attempt, then remove and shut down the
    /// server's connection.
    async fn close_connection(&self, name: &str) {
        let attempt = lock(&self.inner.attempts).get(name).cloned();
        if let Some(attempt) = attempt {
            let _ = attempt.await;
        }

        let removed = write(&self.inner.connections).remove(name);
        if let Some(server) = removed {
            server.shutdown(self.inner.settings.shutdown_timeout).await;
            tracing::info!(server = %name, "disconnected MCP server");
        }
    }
}

/// Report `connected` only while the connection is actually usable.
fn effective_state(recorded: ConnectionState, connected: bool) -> ConnectionState {
    match (recorded, connected) {
        (_, true) => ConnectionState::Connected,
        (ConnectionState::Connected, false) => ConnectionState::Disconnected,
        (state, false) => state,
    }
}

// ─── Connect Task ────────────────────────────────────────────────────────────

/// One connect attempt: spawn, handshake, publish. Runs as its own task so
/// it completes even if every caller awaiting it goes away.
async fn run_connect(inner: Arc<ManagerInner>, definition: ServerDefinition) -> Result<(), McpError> {
    let name = definition.name.clone();

    // A dead leftover connection is replaced, never duplicated.
    let leftover = write(&inner.connections).remove(&name);
    if let Some(old) = leftover {
        old.shutdown(Duration::ZERO).await;
    }

    let outcome = match lifecycle::spawn_server(&definition, &inner.settings).await {
        Ok(server) => publish(&inner, server).await,
        Err(e) => {
            tracing::warn!(server = %name, error = %e, "failed to connect MCP server");
            inner.set_state(&name, ConnectionState::Failed, Some(e.to_string()));
            Err(e)
        }
    };

    lock(&inner.attempts).remove(&name);
    outcome
}

async fn publish(inner: &Arc<ManagerInner>, server: ManagedServer) -> Result<(), McpError> {
    let name = server.name().to_string();

    // Removed or shut down while the handshake was running.
    let abandoned = if inner.shut_down.load(Ordering::SeqCst) {
        Some(McpError::ManagerShutDown)
    } else if !read(&inner.registry).contains(&name) {
        Some(McpError::ServerNotFound { name: name.clone() })
    } else {
        None
    };
    if let Some(err) = abandoned {
        server.shutdown(Duration::ZERO).await;
        inner.set_state(&name, ConnectionState::Disconnected, None);
        return Err(err);
    }

    let restart_count = lock(&inner.records)
        .get(&name)
        .map_or(0, |record| record.restart_count);
    server.set_restart_count(restart_count);

    let server = Arc::new(server);
    let events = server.subscribe();
    write(&inner.connections).insert(name.clone(), Arc::clone(&server));
    inner.forget_lost(&name);
    inner.set_state(&name, ConnectionState::Connected, None);

    tokio::spawn(monitor(
        Arc::downgrade(inner),
        Arc::downgrade(&server),
        name.clone(),
        events,
    ));

    // The process may have died between the handshake and subscribing.
    if !server.is_connected() {
        connection_lost(inner, &server, "process exited right after handshake").await;
    }

    Ok(())
}

/// Forward a connection's events and clean up once it closes.
async fn monitor(
    inner: Weak<ManagerInner>,
    server: Weak<ManagedServer>,
    name: String,
    mut events: broadcast::Receiver<ServerEvent>,
) {
    let reason = loop {
        match events.recv().await {
            Ok(ServerEvent::Closed { reason }) => break reason,
            Ok(event) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let _ = inner.events.send(ManagerEvent {
                    server: name.clone(),
                    event,
                });
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(server = %name, skipped, "event monitor lagged");
            }
            Err(RecvError::Closed) => break "event channel closed".to_string(),
        }
    };

    let (Some(inner), Some(server)) = (inner.upgrade(), server.upgrade()) else {
        return;
    };
    let _ = inner.events.send(ManagerEvent {
        server: name,
        event: ServerEvent::Closed {
            reason: reason.clone(),
        },
    });
    connection_lost(&inner, &server, &reason).await;
}

/// Drop a connection that closed without the manager asking it to.
///
/// Explicit disconnects remove the entry before closing, so they are a
/// no-op here.
async fn connection_lost(inner: &Arc<ManagerInner>, server: &Arc<ManagedServer>, reason: &str) {
    let name = server.name().to_string();
    let removed = {
        let mut connections = write(&inner.connections);
        match connections.get(&name) {
            Some(current) if Arc::ptr_eq(current, server) => {
                // Marked while the map is still locked, so an explicit
                // disconnect that follows always clears it.
                lock(&inner.lost).insert(name.clone());
                connections.remove(&name)
            }
            _ => None,
        }
    };
    let Some(removed) = removed else {
        return;
    };

    tracing::warn!(
        server = %name,
        reason = %reason,
        exit_code = ?removed.exit_code(),
        "MCP server connection lost"
    );
    inner.set_state(
        &name,
        ConnectionState::Disconnected,
        Some(format!("process terminated: {reason}")),
    );
    removed.shutdown(Duration::ZERO).await;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_binary(name: &str) -> ServerDefinition {
        ServerDefinition::new(name, "/definitely/not/a/real/binary", &[])
    }

    fn manager_with(definitions: Vec<ServerDefinition>) -> ConnectionManager {
        let mut registry = ServerRegistry::new();
        for definition in definitions {
            registry.register(definition).unwrap();
        }
        ConnectionManager::new(registry, ManagerSettings::default())
    }

    #[test]
    fn test_empty_status() {
        let manager = manager_with(vec![]);
        let status = manager.status();
        assert_eq!(status.total_servers, 0);
        assert_eq!(status.connected_servers, 0);
        assert!(status.servers.is_empty());
        assert!(!manager.is_stale());
    }

    #[test]
    fn test_status_lists_unconnected_servers() {
        let manager = manager_with(vec![missing_binary("zeta"), missing_binary("alpha")]);
        let status = manager.status();
        assert_eq!(status.total_servers, 2);
        let names: Vec<&str> = status.servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(status.servers.iter().all(|s| !s.connected && s.tool_count == 0));
        assert_eq!(status.servers[0].state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_connect_is_recorded() {
        let manager = manager_with(vec![]);
        let err = manager.add_server(missing_binary("fs")).await.unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }));

        let status = manager.status();
        let fs = status.server("fs").unwrap();
        assert!(!fs.connected);
        assert_eq!(fs.tool_count, 0);
        assert_eq!(fs.state, ConnectionState::Failed);
        assert!(fs.last_error.as_ref().unwrap().contains("failed to spawn"));
        assert!(manager.connected_server_names().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_definition_never_spawns() {
        let manager = manager_with(vec![]);
        let err = manager
            .add_server(ServerDefinition::new("bad name", "node", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
        assert_eq!(manager.status().total_servers, 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let manager = manager_with(vec![missing_binary("fs")]);
        manager.disconnect_server("fs").await.unwrap();
        manager.disconnect_server("fs").await.unwrap();
        let status = manager.status();
        assert!(!status.server("fs").unwrap().connected);
    }

    #[tokio::test]
    async fn test_unknown_server_operations() {
        let manager = manager_with(vec![]);
        assert!(matches!(
            manager.disconnect_server("nope").await,
            Err(McpError::ServerNotFound { .. })
        ));
        assert!(matches!(
            manager.remove_server("nope").await,
            Err(McpError::ServerNotFound { .. })
        ));
        assert!(matches!(
            manager.server_tools("nope").await,
            Err(McpError::ServerNotFound { .. })
        ));
        assert!(matches!(
            manager.connect("nope").await,
            Err(McpError::ServerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_server_deletes_definition() {
        let manager = manager_with(vec![missing_binary("fs")]);
        manager.remove_server("fs").await.unwrap();
        assert!(manager.configured_servers().is_empty());
        assert!(manager.definition("fs").is_none());
    }

    #[tokio::test]
    async fn test_server_tools_for_disconnected_server_is_empty() {
        let manager = manager_with(vec![missing_binary("fs")]);
        assert!(manager.server_tools("fs").await.unwrap().is_empty());
        assert!(manager.all_tools().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_reports_partial_failures() {
        let manager = manager_with(vec![missing_binary("a"), missing_binary("b")]);
        let errors = manager.start().await;
        let mut failed: Vec<String> = errors.into_iter().map(|(name, _)| name).collect();
        failed.sort();
        assert_eq!(failed, vec!["a", "b"]);
        // failures alone never make a manager stale
        assert!(!manager.is_stale());
    }

    #[tokio::test]
    async fn test_reconnect_exhausted() {
        let mut registry = ServerRegistry::new();
        registry.register(missing_binary("fs")).unwrap();
        let settings = ManagerSettings {
            max_restart_attempts: 0,
            ..ManagerSettings::default()
        };
        let manager = ConnectionManager::new(registry, settings);
        assert!(matches!(
            manager.reconnect_server("fs").await,
            Err(McpError::RestartExhausted { attempts: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_reconnect_counts_attempts() {
        let mut registry = ServerRegistry::new();
        registry.register(missing_binary("fs")).unwrap();
        let settings = ManagerSettings {
            max_restart_attempts: 1,
            restart_base_delay: Duration::from_millis(1),
            ..ManagerSettings::default()
        };
        let manager = ConnectionManager::new(registry, settings);

        assert!(matches!(
            manager.reconnect_server("fs").await,
            Err(McpError::SpawnFailed { .. })
        ));
        assert!(matches!(
            manager.reconnect_server("fs").await,
            Err(McpError::RestartExhausted { .. })
        ));
        assert_eq!(manager.diagnostics()[0].restart_count, 1);
    }

    #[tokio::test]
    async fn test_shutdown_marks_stale_and_rejects_work() {
        let manager = manager_with(vec![missing_binary("fs")]);
        manager.shutdown().await;
        assert!(manager.is_shut_down());
        assert!(manager.is_stale());
        assert!(matches!(
            manager.add_server(missing_binary("git")).await,
            Err(McpError::ManagerShutDown)
        ));
    }

    #[test]
    fn test_effective_state() {
        assert_eq!(
            effective_state(ConnectionState::Connected, false),
            ConnectionState::Disconnected
        );
        assert_eq!(
            effective_state(ConnectionState::Failed, false),
            ConnectionState::Failed
        );
        assert_eq!(
            effective_state(ConnectionState::Connecting, true),
            ConnectionState::Connected
        );
    }

    #[test]
    fn test_clones_share_state() {
        let manager = manager_with(vec![]);
        let other = manager.clone();
        assert!(manager.ptr_eq(&other));
        assert!(!manager.ptr_eq(&manager_with(vec![])));
    }
}
