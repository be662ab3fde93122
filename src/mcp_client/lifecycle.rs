//! Server process lifecycle management.
//!
//! Handles spawning an MCP server child process, the `initialize` →
//! `tools/list` handshake, watching for process exit, and graceful shutdown.
//! A `ManagedServer` only exists once its handshake has succeeded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::StdioTransport;
use super::types::{
    InitializeResult, ListToolsResult, LogStream, ServerDefinition, ServerEvent, ServerInfo,
    ToolDescriptor, PROTOCOL_VERSION,
};
use super::{lock, read, write};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Longest stderr excerpt attached to an error message.
const STDERR_CONTEXT_CHARS: usize = 2000;

/// Upper bound on `tools/list` pages followed per fetch.
const MAX_TOOL_PAGES: usize = 64;

/// How long to wait for a killed process to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(2);

// ─── Settings ────────────────────────────────────────────────────────────────

/// Timeouts, retry policy and client identity used for every connection.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Bound on any single request (handshake steps, `tools/list`).
    pub request_timeout: Duration,
    /// Bound on the whole `initialize` + `tools/list` handshake.
    pub init_timeout: Duration,
    /// Bound on one `tools/call`.
    pub call_timeout: Duration,
    /// Grace period between closing stdin and force-killing.
    pub shutdown_timeout: Duration,
    /// First reconnect delay; doubles with each attempt.
    pub restart_base_delay: Duration,
    pub max_restart_attempts: u32,
    pub client_name: String,
    pub client_version: String,
    pub protocol_version: String,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            init_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            restart_base_delay: Duration::from_secs(1),
            max_restart_attempts: 3,
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

// ─── ManagedServer ───────────────────────────────────────────────────────────

/// How a server process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when terminated by a signal.
    pub code: Option<i32>,
}

/// A running, handshaken MCP server: process, transport and tool cache.
pub struct ManagedServer {
    definition: ServerDefinition,
    transport: StdioTransport,
    pid: Option<u32>,
    exit: watch::Receiver<Option<ProcessExit>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    tools: RwLock<Vec<ToolDescriptor>>,
    server_info: Option<ServerInfo>,
    connected_at: DateTime<Utc>,
    restart_count: AtomicU32,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl ManagedServer {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &ServerDefinition {
        &self.definition
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status, once the process has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        (*self.exit.borrow()).and_then(|exit| exit.code)
    }

    /// Raw process liveness. Diagnostic only; see [`Self::is_connected`].
    pub fn is_process_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Usable for requests: handshake done, transport open, process running.
    pub fn is_connected(&self) -> bool {
        !self.transport.is_closed() && self.is_process_alive()
    }

    /// Cached tool list.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        read(&self.tools).clone()
    }

    pub fn tool_count(&self) -> usize {
        read(&self.tools).len()
    }

    /// Replace the cached tool list, tagging each tool with this server.
    pub fn set_tools(&self, tools: Vec<ToolDescriptor>) {
        let name = self.name().to_string();
        *write(&self.tools) = tools
            .into_iter()
            .map(|mut tool| {
                tool.server_name = name.clone();
                tool
            })
            .collect();
    }

    /// Fetch the tool list from the server and cache it.
    pub async fn refresh_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let tools = fetch_tools(&self.transport).await?;
        self.set_tools(tools);
        Ok(self.tools())
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Relaxed)
    }

    pub(crate) fn set_restart_count(&self, count: u32) {
        self.restart_count.store(count, Ordering::Relaxed);
    }

    pub fn pending_requests(&self) -> usize {
        self.transport.pending_count()
    }

    pub fn next_message_id(&self) -> u64 {
        self.transport.next_message_id()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.transport.subscribe()
    }

    /// Send a request bounded by the default request timeout.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.transport.request(method, params).await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        self.transport
            .request_with_timeout(method, params, timeout)
            .await
    }

    /// Last stderr lines, for error context.
    pub fn stderr_context(&self) -> String {
        stderr_context(&self.stderr_tail)
    }

    /// Shut down gracefully: close stdin, give the process `timeout` to exit,
    /// then kill it.
    pub async fn shutdown(&self, timeout: Duration) {
        terminate(&self.transport, &self.kill, self.exit.clone(), timeout).await;
        tracing::info!(server = %self.name(), exit_code = ?self.exit_code(), "server shut down");
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a single MCP server process and perform the initialization handshake.
///
/// On any failure the process is terminated before returning, so no
/// half-initialized subprocess outlives the call.
pub async fn spawn_server(
    definition: &ServerDefinition,
    settings: &ManagerSettings,
) -> Result<ManagedServer, McpError> {
    let name = definition.name.as_str();

    let mut cmd = Command::new(&definition.command);
    cmd.args(&definition.args);
    cmd.envs(&definition.env);
    if let Some(dir) = &definition.cwd {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{e}"),
    })?;

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;
    let stderr = child.stderr.take();
    let pid = child.id();

    tracing::info!(
        server = name,
        command = %definition.command,
        pid = ?pid,
        "spawned MCP server"
    );

    let transport = StdioTransport::new(name, stdout, stdin, settings.request_timeout);
    let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
    let stderr_pump = stderr.map(|stderr| {
        spawn_stderr_pump(
            name.to_string(),
            stderr,
            Arc::clone(&stderr_tail),
            transport.event_sender(),
        )
    });
    let (exit, kill) = spawn_exit_watcher(name.to_string(), child);
    let kill = Mutex::new(Some(kill));

    let outcome = tokio::time::timeout(settings.init_timeout, handshake(&transport, settings)).await;

    let (init, tools) = match outcome {
        Ok(Ok(done)) => done,
        Ok(Err(e)) => {
            let reason = e.to_string();
            let err =
                fail_handshake(name, reason, &transport, &kill, exit, stderr_pump, &stderr_tail)
                    .await;
            return Err(err);
        }
        Err(_) => {
            let reason = format!(
                "initialization timed out after {}ms",
                settings.init_timeout.as_millis()
            );
            let err =
                fail_handshake(name, reason, &transport, &kill, exit, stderr_pump, &stderr_tail)
                    .await;
            return Err(err);
        }
    };

    let server = ManagedServer {
        definition: definition.clone(),
        transport,
        pid,
        exit,
        kill,
        tools: RwLock::new(Vec::new()),
        server_info: init.server_info,
        connected_at: Utc::now(),
        restart_count: AtomicU32::new(0),
        stderr_tail,
    };
    server.set_tools(tools);

    tracing::info!(
        server = name,
        tools = server.tool_count(),
        protocol_version = ?init.protocol_version,
        "MCP server connected"
    );

    Ok(server)
}

/// Tear down a process whose handshake failed and build the error for it.
async fn fail_handshake(
    name: &str,
    reason: String,
    transport: &StdioTransport,
    kill: &Mutex<Option<oneshot::Sender<()>>>,
    exit: watch::Receiver<Option<ProcessExit>>,
    stderr_pump: Option<JoinHandle<()>>,
    stderr_tail: &Mutex<VecDeque<String>>,
) -> McpError {
    // No grace period: the process is of no further use.
    terminate(transport, kill, exit, Duration::ZERO).await;

    // Let the pump drain whatever the process wrote before dying.
    if let Some(pump) = stderr_pump {
        let _ = tokio::time::timeout(Duration::from_millis(500), pump).await;
    }

    let stderr_ctx = stderr_context(stderr_tail);
    if !stderr_ctx.is_empty() {
        tracing::warn!(
            server = name,
            stderr = %stderr_ctx,
            "server stderr captured on failure"
        );
    }

    McpError::HandshakeFailed {
        name: name.to_string(),
        reason: format!("{reason}{}", format_stderr_suffix(&stderr_ctx)),
    }
}

/// Perform the MCP initialization handshake.
async fn handshake(
    transport: &StdioTransport,
    settings: &ManagerSettings,
) -> Result<(InitializeResult, Vec<ToolDescriptor>), McpError> {
    let params = serde_json::json!({
        "protocolVersion": settings.protocol_version,
        "capabilities": {},
        "clientInfo": {
            "name": settings.client_name,
            "version": settings.client_version,
        },
    });
    let result = transport.request("initialize", Some(params)).await?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::TransportError {
            server: transport.server_name().to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    transport
        .send_notification("notifications/initialized", None)
        .await?;

    let tools = fetch_tools(transport).await?;
    Ok((init, tools))
}

/// Fetch the full tool list, following `nextCursor` pagination.
async fn fetch_tools(transport: &StdioTransport) -> Result<Vec<ToolDescriptor>, McpError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
        let result = transport.request("tools/list", params).await?;
        let page: ListToolsResult =
            serde_json::from_value(result).map_err(|e| McpError::TransportError {
                server: transport.server_name().to_string(),
                reason: format!("failed to parse tools/list response: {e}"),
            })?;
        tools.extend(page.tools);

        match page.next_cursor {
            Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                cursor = Some(next);
            }
            _ => return Ok(tools),
        }
    }

    tracing::warn!(
        server = %transport.server_name(),
        pages = MAX_TOOL_PAGES,
        "tools/list pagination limit reached"
    );
    Ok(tools)
}

// ─── Process Plumbing ────────────────────────────────────────────────────────

/// Own the child in a task that reaps it, so liveness can be read without
/// locking and a kill can be requested from anywhere.
///
/// Dropping the returned kill sender also kills the process.
fn spawn_exit_watcher(
    name: String,
    mut child: Child,
) -> (watch::Receiver<Option<ProcessExit>>, oneshot::Sender<()>) {
    let (exit_tx, exit_rx) = watch::channel(None);
    let (kill_tx, kill_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let code = status.ok().and_then(|s| s.code());
        tracing::debug!(server = %name, exit_code = ?code, "server process exited");
        let _ = exit_tx.send(Some(ProcessExit { code }));
    });

    (exit_rx, kill_tx)
}

/// Close the transport, wait up to `timeout` for a clean exit, then kill.
async fn terminate(
    transport: &StdioTransport,
    kill: &Mutex<Option<oneshot::Sender<()>>>,
    mut exit: watch::Receiver<Option<ProcessExit>>,
    timeout: Duration,
) {
    transport.close().await;

    if !timeout.is_zero()
        && tokio::time::timeout(timeout, wait_exited(&mut exit))
            .await
            .is_ok()
    {
        return;
    }

    if let Some(kill) = lock(kill).take() {
        let _ = kill.send(());
    }
    if tokio::time::timeout(KILL_GRACE, wait_exited(&mut exit))
        .await
        .is_err()
    {
        tracing::warn!(server = %transport.server_name(), "server process did not exit after kill");
    }
}

async fn wait_exited(exit: &mut watch::Receiver<Option<ProcessExit>>) {
    let _ = exit.wait_for(Option::is_some).await.map(|_| ());
}

/// Forward stderr lines to the log and the event channel, keeping a short tail.
fn spawn_stderr_pump(
    name: String,
    stderr: ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
    events: broadcast::Sender<ServerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    tracing::debug!(server = %name, line = %line, "server stderr");
                    {
                        let mut tail = lock(&tail);
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.clone());
                    }
                    let _ = events.send(ServerEvent::Log {
                        stream: LogStream::Stderr,
                        line,
                    });
                }
            }
        }
    })
}

fn stderr_context(tail: &Mutex<VecDeque<String>>) -> String {
    let joined = lock(tail).iter().cloned().collect::<Vec<_>>().join("\n");
    if joined.chars().count() > STDERR_CONTEXT_CHARS {
        let mut truncated: String = joined.chars().take(STDERR_CONTEXT_CHARS).collect();
        truncated.push_str("...(truncated)");
        truncated
    } else {
        joined
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = ManagerSettings::default();
        assert_eq!(settings.init_timeout, Duration::from_secs(30));
        assert_eq!(settings.max_restart_attempts, 3);
        assert_eq!(settings.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_format_stderr_suffix() {
        assert_eq!(format_stderr_suffix(""), "");
        assert_eq!(format_stderr_suffix("boom\n"), " | stderr: boom");
    }

    #[test]
    fn test_stderr_context_truncates() {
        let tail = Mutex::new(VecDeque::from(vec!["x".repeat(STDERR_CONTEXT_CHARS + 10)]));
        let ctx = stderr_context(&tail);
        assert!(ctx.ends_with("...(truncated)"));
        assert_eq!(ctx.chars().count(), STDERR_CONTEXT_CHARS + "...(truncated)".len());
    }

    #[tokio::test]
    async fn test_spawn_missing_command_is_spawn_error() {
        let definition = ServerDefinition::new("ghost", "/definitely/not/a/real/binary", &[]);
        let err = spawn_server(&definition, &ManagerSettings::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::SpawnFailed { ref name, .. } if name == "ghost"));
    }
}
