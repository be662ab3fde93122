//! Server registry: the configured tool-provider definitions, keyed by name.
//!
//! The registry is independent of connection state: adding or removing a
//! definition never spawns or kills anything by itself.

use std::collections::BTreeMap;
use std::path::Path;

use super::errors::McpError;
use super::types::{McpServersConfig, ServerDefinition};

/// Separator between server and tool in a qualified tool name (`server.tool`).
pub const QUALIFIER: char = '.';

/// Ordered set of server definitions.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: BTreeMap<String, ServerDefinition>,
}

impl ServerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load definitions from an `mcp-servers.json` file.
    ///
    /// A missing file yields an empty registry; an unreadable or malformed one
    /// is a configuration error.
    pub fn load_from_file(path: &Path) -> Result<Self, McpError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no MCP servers file, starting empty");
                return Ok(Self::new());
            }
            Err(e) => {
                return Err(McpError::ConfigError {
                    reason: format!("failed to read {}: {e}", path.display()),
                })
            }
        };

        let config: McpServersConfig =
            serde_json::from_str(&raw).map_err(|e| McpError::ConfigError {
                reason: format!("failed to parse {}: {e}", path.display()),
            })?;

        let registry = Self::from_config(config)?;
        tracing::info!(
            path = %path.display(),
            count = registry.len(),
            servers = ?registry.names(),
            "loaded MCP servers file"
        );
        Ok(registry)
    }

    /// Build a registry from a parsed servers file.
    pub fn from_config(config: McpServersConfig) -> Result<Self, McpError> {
        let mut registry = Self::new();
        for (name, server) in config.servers {
            registry.register(ServerDefinition::from_config(&name, server))?;
        }
        Ok(registry)
    }

    /// Add a definition. Fails if the name is taken or the definition is invalid.
    pub fn register(&mut self, definition: ServerDefinition) -> Result<(), McpError> {
        validate_definition(&definition)?;
        if self.servers.contains_key(&definition.name) {
            return Err(McpError::DuplicateServer {
                name: definition.name,
            });
        }
        self.servers.insert(definition.name.clone(), definition);
        Ok(())
    }

    /// Add or replace a definition, returning the one it replaced.
    pub fn upsert(
        &mut self,
        definition: ServerDefinition,
    ) -> Result<Option<ServerDefinition>, McpError> {
        validate_definition(&definition)?;
        Ok(self.servers.insert(definition.name.clone(), definition))
    }

    /// Remove a definition.
    pub fn remove(&mut self, name: &str) -> Option<ServerDefinition> {
        self.servers.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&ServerDefinition> {
        self.servers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerDefinition> {
        self.servers.values()
    }

    /// Keep only the servers named in `allowed`.
    pub fn retain_names(&mut self, allowed: &[String]) {
        let before = self.servers.len();
        self.servers.retain(|name, _| allowed.contains(name));
        tracing::info!(
            before,
            after = self.servers.len(),
            enabled = ?allowed,
            "filtered MCP servers by enabled_servers allowlist"
        );
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// Reject definitions that could never be spawned or addressed.
pub fn validate_definition(definition: &ServerDefinition) -> Result<(), McpError> {
    let name = &definition.name;
    if name.trim().is_empty() {
        return Err(McpError::ConfigError {
            reason: "server name must not be empty".into(),
        });
    }
    if name.contains(QUALIFIER) || name.chars().any(char::is_whitespace) {
        return Err(McpError::ConfigError {
            reason: format!(
                "server name '{name}' must not contain whitespace or '{QUALIFIER}'"
            ),
        });
    }
    if definition.command.trim().is_empty() {
        return Err(McpError::ConfigError {
            reason: format!("server '{name}' has an empty command"),
        });
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
