//! Tracing setup for the orchestrator binaries.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "mcp_orchestrator=info,warn";
const LOG_FILE_NAME: &str = "orchestrator.log";
const KEEP_ROTATED: u32 = 3;

/// Env var selecting `json` log lines instead of the human format.
pub const LOG_FORMAT_ENV: &str = "MCP_LOG_FORMAT";

/// Where logs go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    /// Rotated `orchestrator.log` in the platform data directory.
    File,
}

/// Return the platform-standard data directory for the orchestrator.
///
/// Falls back to `~/.mcp-orchestrator/` if the platform directory can't be
/// resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-orchestrator");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-orchestrator")
}

/// Install the global subscriber. Returns the log file path when logging to
/// a file.
///
/// Filter comes from `RUST_LOG`, defaulting to `mcp_orchestrator=info,warn`.
/// A file that cannot be opened falls back to stderr. Calling this twice is
/// harmless; the second call is ignored.
pub fn init_tracing(target: LogTarget) -> Option<PathBuf> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let (writer, log_path) = match target {
        LogTarget::Stderr => (BoxMakeWriter::new(std::io::stderr), None),
        LogTarget::File => match open_log_file(&data_dir()) {
            Ok((writer, path)) => (BoxMakeWriter::new(writer), Some(path)),
            Err(e) => {
                eprintln!("failed to open log file, logging to stderr: {e}");
                (BoxMakeWriter::new(std::io::stderr), None)
            }
        },
    };
    let ansi = log_path.is_none() && !json;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_thread_ids(false);
    let installed = if json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_file = ?log_path.as_ref().map(|p| p.display().to_string()),
            pid = std::process::id(),
            "=== mcp-orchestrator starting ==="
        );
    }
    log_path
}

/// Path of a log generation: `orchestrator.log` is the live one and
/// `orchestrator.log.N` the Nth most recent run before it.
fn generation_path(dir: &Path, generation: u32) -> PathBuf {
    match generation {
        0 => dir.join(LOG_FILE_NAME),
        n => dir.join(format!("{LOG_FILE_NAME}.{n}")),
    }
}

/// Age every earlier log by one generation, then open a fresh live log.
///
/// At most `KEEP_ROTATED` earlier runs survive; the oldest is deleted.
fn open_log_file(dir: &Path) -> std::io::Result<(FlushingWriter, PathBuf)> {
    std::fs::create_dir_all(dir)?;

    let expired = generation_path(dir, KEEP_ROTATED);
    if expired.exists() {
        std::fs::remove_file(&expired)?;
    }
    for generation in (0..KEEP_ROTATED).rev() {
        let current = generation_path(dir, generation);
        if current.exists() {
            std::fs::rename(&current, generation_path(dir, generation + 1))?;
        }
    }

    let path = generation_path(dir, 0);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    Ok((FlushingWriter::new(file), path))
}

/// File writer that flushes after every write, so a crash loses no lines.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    fn with_file<T>(
        &self,
        f: impl FnOnce(&mut std::fs::File) -> std::io::Result<T>,
    ) -> std::io::Result<T> {
        let mut file = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        f(&mut file)
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.with_file(|file| {
            let n = file.write(buf)?;
            file.flush()?;
            Ok(n)
        })
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.with_file(|file| file.flush())
    }
}

impl<'a> MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
