//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with one MCP server:
//! - Writing line-delimited JSON-RPC requests to the server's stdin
//! - A background read loop that correlates responses to pending requests by id
//! - Forwarding notifications and non-protocol output to observers
//!
//! The transport is generic over the byte streams, so tests drive it through
//! in-memory pipes instead of a child process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::lock;
use super::types::{
    error_codes, IncomingMessage, JsonRpcNotification, JsonRpcReply, JsonRpcRequest, LogStream,
    ResponseOutcome, ServerEvent,
};

/// Buffered events per observer before slow observers start lagging.
const EVENT_CAPACITY: usize = 256;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<tokio::sync::Mutex<BoxedWriter>>;
type Waiter = oneshot::Sender<Result<Value, McpError>>;

// ─── Pending Requests ────────────────────────────────────────────────────────

/// In-flight requests, plus the error new requests fail with once closed.
#[derive(Default)]
struct PendingTable {
    waiters: HashMap<u64, Waiter>,
    closed: Option<McpError>,
}

impl PendingTable {
    /// Close the table and fail every waiter. Returns `false` if it was
    /// already closed.
    fn close_with(&mut self, err: McpError) -> bool {
        if self.closed.is_some() {
            return false;
        }
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(err.clone()));
        }
        self.closed = Some(err);
        true
    }
}

/// Removes its pending entry when dropped, so timed-out or cancelled callers
/// never leave a stale waiter behind.
struct PendingEntry<'a> {
    table: &'a Mutex<PendingTable>,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        lock(self.table).waiters.remove(&self.id);
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over one server's stdio.
pub struct StdioTransport {
    server_name: String,
    writer: SharedWriter,
    pending: Arc<Mutex<PendingTable>>,
    /// Private to this connection; ids are never reused.
    next_id: AtomicU64,
    events: broadcast::Sender<ServerEvent>,
    request_timeout: Duration,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Create a transport and start its read loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<R, W>(server_name: &str, reader: R, writer: W, request_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(Box::new(writer)));
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let reader_task = tokio::spawn(read_loop(
            server_name.to_string(),
            reader,
            Arc::clone(&pending),
            Arc::clone(&writer),
            events.clone(),
        ));

        Self {
            server_name: server_name.to_string(),
            writer,
            pending,
            next_id: AtomicU64::new(1),
            events,
            request_timeout,
            reader_task: Mutex::new(Some(reader_task)),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Send a request and wait for its response, bounded by the default
    /// request timeout.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.request_with_timeout(method, params, self.request_timeout)
            .await
    }

    /// Send a request and wait for the matching response.
    ///
    /// Many requests may be in flight at once; responses can arrive in any
    /// order and each resolves exactly the request carrying its id.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut table = lock(&self.pending);
            if let Some(err) = &table.closed {
                return Err(err.clone());
            }
            table.waiters.insert(id, tx);
        }
        let _entry = PendingEntry {
            table: &self.pending,
            id,
        };

        let line = self.encode(&JsonRpcRequest::new(id, method, params))?;
        self.write_line(&line).await?;

        tracing::trace!(server = %self.server_name, id, method, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::ConnectionClosed {
                server: self.server_name.clone(),
            }),
            Err(_) => {
                tracing::warn!(
                    server = %self.server_name,
                    id,
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(McpError::Timeout {
                    server: self.server_name.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), McpError> {
        if let Some(err) = &lock(&self.pending).closed {
            return Err(err.clone());
        }
        let line = self.encode(&JsonRpcNotification::new(method, params))?;
        self.write_line(&line).await
    }

    /// Observe notifications, log output and the final close event.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Sender half of the event channel, for sources outside the read loop
    /// (the stderr pump).
    pub(crate) fn event_sender(&self) -> broadcast::Sender<ServerEvent> {
        self.events.clone()
    }

    /// Whether the transport stopped accepting requests.
    pub fn is_closed(&self) -> bool {
        lock(&self.pending).closed.is_some()
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).waiters.len()
    }

    /// The id the next request will carry.
    pub fn next_message_id(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }

    /// Close the transport: reject pending requests, stop the read loop and
    /// close the write half so the server sees EOF on stdin.
    pub async fn close(&self) {
        let transitioned = lock(&self.pending).close_with(McpError::ConnectionClosed {
            server: self.server_name.clone(),
        });

        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }

        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;

        if transitioned {
            let _ = self.events.send(ServerEvent::Closed {
                reason: "closed by client".into(),
            });
        }
    }

    fn encode<T: serde::Serialize>(&self, message: &T) -> Result<String, McpError> {
        let mut json = serde_json::to_string(message).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        json.push('\n');
        Ok(json)
    }

    async fn write_line(&self, line: &str) -> Result<(), McpError> {
        write_line(&self.writer, line)
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
    }
}

async fn write_line(writer: &SharedWriter, line: &str) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

// ─── Read Loop ───────────────────────────────────────────────────────────────

/// Read newline-delimited frames until EOF, dispatching each one.
///
/// Lines that are not JSON-RPC frames are forwarded as log events: many
/// servers interleave diagnostic text with protocol output.
async fn read_loop<R>(
    server: String,
    reader: R,
    pending: Arc<Mutex<PendingTable>>,
    writer: SharedWriter,
    events: broadcast::Sender<ServerEvent>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    let reason = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break "server stdout closed (process may have exited)".to_string(),
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    dispatch_line(&server, trimmed, &pending, &writer, &events);
                }
            }
            Err(e) => break format!("failed to read from stdout: {e}"),
        }
    };

    tracing::debug!(server = %server, reason = %reason, "read loop finished");

    let transitioned = lock(&pending).close_with(McpError::ProcessTerminated {
        server: server.clone(),
    });
    if transitioned {
        let _ = events.send(ServerEvent::Closed { reason });
    }
}

fn dispatch_line(
    server: &str,
    line: &str,
    pending: &Mutex<PendingTable>,
    writer: &SharedWriter,
    events: &broadcast::Sender<ServerEvent>,
) {
    match IncomingMessage::parse(line) {
        Some(IncomingMessage::Response { id, outcome }) => {
            let waiter = lock(pending).waiters.remove(&id);
            let Some(waiter) = waiter else {
                // Timed out or never issued. Ids are not reused, so it can
                // never be matched to a newer request.
                tracing::debug!(server = %server, id, "dropping response for unknown request id");
                return;
            };
            let result = match outcome {
                ResponseOutcome::Result(value) => Ok(value),
                ResponseOutcome::Error(err) => Err(McpError::ServerError {
                    code: err.code,
                    message: err.message,
                    data: err.data,
                }),
                ResponseOutcome::Malformed(reason) => Err(McpError::TransportError {
                    server: server.to_string(),
                    reason,
                }),
            };
            let _ = waiter.send(result);
        }
        Some(IncomingMessage::Notification { method, params }) => {
            tracing::debug!(server = %server, method = %method, "server notification");
            let _ = events.send(ServerEvent::Notification { method, params });
        }
        Some(IncomingMessage::Request { id, method, .. }) => {
            let reply = if method == "ping" {
                JsonRpcReply::result(id, serde_json::json!({}))
            } else {
                tracing::debug!(server = %server, method = %method, "unsupported server request");
                JsonRpcReply::error(id, error_codes::METHOD_NOT_FOUND, "method not found")
            };
            // Replying must not stall the read loop behind a pending write.
            let writer = Arc::clone(writer);
            let server = server.to_string();
            tokio::spawn(async move {
                let Ok(mut line) = serde_json::to_string(&reply) else {
                    return;
                };
                line.push('\n');
                if let Err(e) = write_line(&writer, &line).await {
                    tracing::debug!(server = %server, error = %e, "failed to answer server request");
                }
            });
        }
        None => {
            tracing::debug!(server = %server, line = %line, "non-protocol output");
            let _ = events.send(ServerEvent::Log {
                stream: LogStream::Stdout,
                line: line.to_string(),
            });
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
