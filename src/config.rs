//! Orchestrator configuration loading.
//!
//! Reads `orchestrator.yaml` (timeouts, restart policy, client identity,
//! server allowlist) and resolves the `mcp-servers.json` location.
//! `${VAR}` and `${VAR:-default}` are interpolated before parsing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::mcp_client::{McpError, ManagerSettings, ServerRegistry};

/// Env var pointing at an `orchestrator.yaml`.
pub const CONFIG_ENV: &str = "MCP_ORCHESTRATOR_CONFIG";
/// Env var overriding the servers file location.
pub const SERVERS_FILE_ENV: &str = "MCP_SERVERS_FILE";

const DEFAULT_CONFIG_FILE: &str = "orchestrator.yaml";
const DEFAULT_SERVERS_FILE: &str = "mcp-servers.json";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level settings (mirrors `orchestrator.yaml`). Every field is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Path to `mcp-servers.json`. Overridden by `MCP_SERVERS_FILE`.
    pub servers_file: Option<String>,
    pub request_timeout_ms: u64,
    pub init_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub max_restart_attempts: u32,
    pub restart_base_delay_ms: u64,
    /// `clientInfo.name` sent in `initialize`.
    pub client_name: Option<String>,
    pub protocol_version: Option<String>,
    /// Optional allowlist of server names to start.
    ///
    /// When set, only servers named here are registered; all others in the
    /// servers file are skipped.
    ///
    /// Default: `None` (every configured server is started).
    pub enabled_servers: Option<Vec<String>>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let settings = ManagerSettings::default();
        Self {
            servers_file: None,
            request_timeout_ms: millis(settings.request_timeout),
            init_timeout_ms: millis(settings.init_timeout),
            call_timeout_ms: millis(settings.call_timeout),
            shutdown_timeout_ms: millis(settings.shutdown_timeout),
            max_restart_attempts: settings.max_restart_attempts,
            restart_base_delay_ms: millis(settings.restart_base_delay),
            client_name: None,
            protocol_version: None,
            enabled_servers: None,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl OrchestratorConfig {
    /// Locate and load the config, falling back to defaults when no file
    /// exists.
    pub fn load() -> Result<Self, McpError> {
        match find_config_path(Path::new(".")) {
            Some(path) => load_config(&path),
            None => {
                tracing::debug!("no orchestrator.yaml found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Parse YAML text after env-var interpolation.
    pub fn from_yaml(raw: &str) -> Result<Self, McpError> {
        let interpolated = interpolate_env_vars(raw);
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })
    }

    /// Where to read server definitions from.
    pub fn servers_file_path(&self) -> PathBuf {
        if let Ok(path) = std::env::var(SERVERS_FILE_ENV) {
            return PathBuf::from(expand_tilde(&path));
        }
        match &self.servers_file {
            Some(path) => PathBuf::from(expand_tilde(path)),
            None => PathBuf::from(DEFAULT_SERVERS_FILE),
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        let defaults = ManagerSettings::default();
        ManagerSettings {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            init_timeout: Duration::from_millis(self.init_timeout_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            restart_base_delay: Duration::from_millis(self.restart_base_delay_ms),
            max_restart_attempts: self.max_restart_attempts,
            client_name: self.client_name.clone().unwrap_or(defaults.client_name),
            client_version: defaults.client_version,
            protocol_version: self
                .protocol_version
                .clone()
                .unwrap_or(defaults.protocol_version),
        }
    }

    /// Load the servers file and apply the `enabled_servers` allowlist.
    pub fn load_registry(&self) -> Result<ServerRegistry, McpError> {
        let mut registry = ServerRegistry::load_from_file(&self.servers_file_path())?;
        if let Some(enabled) = &self.enabled_servers {
            registry.retain_names(enabled);
        }
        Ok(registry)
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve the config path.
///
/// `MCP_ORCHESTRATOR_CONFIG` wins when set (a missing file is then an error
/// at load time); otherwise `orchestrator.yaml` in `dir` if it exists.
pub fn find_config_path(dir: &Path) -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(expand_tilde(&path)));
    }
    let candidate = dir.join(DEFAULT_CONFIG_FILE);
    candidate.exists().then_some(candidate)
}

/// Load and parse an `orchestrator.yaml`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    let config = OrchestratorConfig::from_yaml(&raw)?;
    tracing::info!(path = %path.display(), "loaded orchestrator config");
    Ok(config)
}

/// Everything a fresh connection manager is built from.
///
/// Used as the loader of the process-wide singleton.
pub fn load_manager_inputs() -> Result<(ServerRegistry, ManagerSettings), McpError> {
    let config = OrchestratorConfig::load()?;
    let registry = config.load_registry()?;
    Ok((registry, config.manager_settings()))
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                result.push_str(&resolve_var_expr(&after[..end]));
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated: keep the text as written.
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name)
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_interpolate_with_default() {
        std::env::remove_var("__MCPO_TEST_UNSET__");
        assert_eq!(
            interpolate_env_vars("dir: ${__MCPO_TEST_UNSET__:-/srv/mcp}"),
            "dir: /srv/mcp"
        );
    }

    #[test]
    fn test_interpolate_with_value() {
        std::env::set_var("__MCPO_TEST_SET__", "/custom");
        assert_eq!(
            interpolate_env_vars("${__MCPO_TEST_SET__:-/fallback}/x"),
            "/custom/x"
        );
        std::env::remove_var("__MCPO_TEST_SET__");
    }

    #[test]
    fn test_interpolate_plain_and_unterminated() {
        assert_eq!(interpolate_env_vars("no vars here"), "no vars here");
        assert_eq!(interpolate_env_vars("cost: $5"), "cost: $5");
        assert_eq!(interpolate_env_vars("broken ${VAR"), "broken ${VAR");
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/mcp-servers.json");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/mcp-servers.json"));
        assert_eq!(expand_tilde("/abs/path"), "/abs/path");
    }

    #[test]
    fn test_defaults_match_manager_settings() {
        let config = OrchestratorConfig::from_yaml("{}").unwrap();
        let settings = config.manager_settings();
        let defaults = ManagerSettings::default();
        assert_eq!(settings.request_timeout, defaults.request_timeout);
        assert_eq!(settings.shutdown_timeout, defaults.shutdown_timeout);
        assert_eq!(settings.max_restart_attempts, defaults.max_restart_attempts);
        assert_eq!(settings.protocol_version, defaults.protocol_version);
        assert!(config.enabled_servers.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
            servers_file: /etc/mcp/servers.json
            request_timeout_ms: 1500
            init_timeout_ms: 2500
            call_timeout_ms: 90000
            shutdown_timeout_ms: 100
            max_restart_attempts: 5
            restart_base_delay_ms: 250
            client_name: web-ide
            protocol_version: "2025-03-26"
            enabled_servers: [fs, echo]
        "#;
        let config = OrchestratorConfig::from_yaml(yaml).unwrap();
        let settings = config.manager_settings();
        assert_eq!(settings.request_timeout, Duration::from_millis(1500));
        assert_eq!(settings.init_timeout, Duration::from_millis(2500));
        assert_eq!(settings.call_timeout, Duration::from_secs(90));
        assert_eq!(settings.restart_base_delay, Duration::from_millis(250));
        assert_eq!(settings.max_restart_attempts, 5);
        assert_eq!(settings.client_name, "web-ide");
        assert_eq!(settings.protocol_version, "2025-03-26");
        assert_eq!(
            config.enabled_servers.as_deref(),
            Some(&["fs".to_string(), "echo".to_string()][..])
        );
    }

    #[test]
    fn test_malformed_config_is_error() {
        let err = OrchestratorConfig::from_yaml("request_timeout_ms: [nope").unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_load_registry_applies_allowlist() {
        let tmp = TempDir::new().unwrap();
        let servers = tmp.path().join("servers.json");
        std::fs::write(
            &servers,
            r#"{"servers": {"fs": {"command": "fs-mcp"}, "git": {"command": "git-mcp"}}}"#,
        )
        .unwrap();

        let config = OrchestratorConfig {
            servers_file: Some(servers.display().to_string()),
            enabled_servers: Some(vec!["git".to_string()]),
            ..OrchestratorConfig::default()
        };
        // MCP_SERVERS_FILE is not set by any test, so `servers_file` applies.
        let registry = config.load_registry().unwrap();
        assert_eq!(registry.names(), vec!["git"]);
    }

    #[test]
    fn test_load_config_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("orchestrator.yaml");
        std::fs::write(&path, "max_restart_attempts: 7\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.max_restart_attempts, 7);

        assert!(load_config(&tmp.path().join("missing.yaml")).is_err());
    }
}
