//! Tool aggregator: one flat namespace over every connected server's tools.
//!
//! Provides:
//! - A catalog recomputed from live connection state on every call
//! - Collision handling: a tool name exposed by one server stays bare, a name
//!   exposed by several servers is exposed as `server.tool` for each
//! - Resolution of bare, exposed and server-qualified names
//! - Required-argument validation and routing of `tools/call`

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use serde_json::Value;

use super::errors::McpError;
use super::manager::ConnectionManager;
use super::servers::QUALIFIER;
use super::types::ToolDescriptor;

// ─── Catalog ─────────────────────────────────────────────────────────────────

/// One entry of the aggregated catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedTool {
    /// Name exposed to callers (bare, or `server.tool` on collision).
    pub name: String,
    /// Name the owning server knows the tool by.
    pub tool_name: String,
    pub description: String,
    pub input_schema: Value,
    pub server_name: String,
}

/// Snapshot of the aggregated namespace, keyed by exposed name.
///
/// Finite and restartable: iterate it as many times as needed.
#[derive(Debug, Clone, Default)]
pub struct AggregatedCatalog {
    tools: BTreeMap<String, AggregatedTool>,
    /// Bare tool name → exposed names, for names shared by several servers.
    collisions: HashMap<String, Vec<String>>,
}

/// Outcome of looking up a tool name in the catalog.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResolution {
    Found(AggregatedTool),
    /// Bare name exposed by several servers; holds the qualified candidates.
    Ambiguous(Vec<String>),
    NotFound,
}

impl ToolResolution {
    /// Convert to the tool, or the matching lookup error.
    pub fn into_result(self, requested: &str) -> Result<AggregatedTool, McpError> {
        match self {
            ToolResolution::Found(tool) => Ok(tool),
            ToolResolution::Ambiguous(candidates) => Err(McpError::AmbiguousTool {
                name: requested.to_string(),
                candidates,
            }),
            ToolResolution::NotFound => Err(McpError::ToolNotFound {
                name: requested.to_string(),
            }),
        }
    }
}

impl AggregatedCatalog {
    /// Build a catalog from server-tagged tool descriptors.
    ///
    /// Every distinct `(server, tool)` pair gets its own exposed name. A
    /// bare name that would shadow another tool's qualified name is
    /// qualified as well. Repeated descriptors from one server are listed
    /// once.
    pub fn from_tools(tools: impl IntoIterator<Item = ToolDescriptor>) -> Self {
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let tools: Vec<ToolDescriptor> = tools
            .into_iter()
            .filter(|tool| {
                let fresh = seen.insert((tool.server_name.clone(), tool.name.clone()));
                if !fresh {
                    tracing::warn!(
                        server = %tool.server_name,
                        tool = %tool.name,
                        "server listed the same tool twice"
                    );
                }
                fresh
            })
            .collect();

        let mut owners: HashMap<&str, usize> = HashMap::new();
        for tool in &tools {
            *owners.entry(tool.name.as_str()).or_default() += 1;
        }
        let shared: HashSet<String> = owners
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(name, _)| name.to_string())
            .collect();

        let qualified: Vec<String> = tools
            .iter()
            .map(|tool| format!("{}{QUALIFIER}{}", tool.server_name, tool.name))
            .collect();
        let mut qualify: Vec<bool> = tools
            .iter()
            .map(|tool| shared.contains(tool.name.as_str()))
            .collect();

        // Qualifying one entry can claim a name another entry holds bare
        // (a tool named `alpha.b` next to `alpha`'s `b`), so repeat until no
        // bare name is taken.
        loop {
            let taken: HashSet<&str> = qualified
                .iter()
                .zip(&qualify)
                .filter(|(_, q)| **q)
                .map(|(name, _)| name.as_str())
                .collect();
            let mut changed = false;
            for (i, tool) in tools.iter().enumerate() {
                if !qualify[i] && taken.contains(tool.name.as_str()) {
                    tracing::debug!(
                        server = %tool.server_name,
                        tool = %tool.name,
                        "tool name shadows a qualified name; qualifying it"
                    );
                    qualify[i] = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let mut catalog = Self::default();
        for ((tool, exposed), qualify) in tools.into_iter().zip(qualified).zip(qualify) {
            let name = if qualify { exposed } else { tool.name.clone() };
            if shared.contains(tool.name.as_str()) {
                catalog
                    .collisions
                    .entry(tool.name.clone())
                    .or_default()
                    .push(name.clone());
            }
            catalog.tools.insert(
                name.clone(),
                AggregatedTool {
                    name,
                    tool_name: tool.name,
                    description: tool.description,
                    input_schema: tool.input_schema,
                    server_name: tool.server_name,
                },
            );
        }
        for candidates in catalog.collisions.values_mut() {
            candidates.sort();
        }
        catalog
    }

    /// Resolve a bare, exposed or `server.tool` name.
    pub fn resolve(&self, name: &str) -> ToolResolution {
        if let Some(tool) = self.tools.get(name) {
            return ToolResolution::Found(tool.clone());
        }

        // `server.tool` also addresses tools that are exposed bare.
        if let Some((server, tool_name)) = name.split_once(QUALIFIER) {
            if let Some(tool) = self
                .tools
                .values()
                .find(|t| t.server_name == server && t.tool_name == tool_name)
            {
                return ToolResolution::Found(tool.clone());
            }
        }

        match self.collisions.get(name) {
            Some(candidates) => ToolResolution::Ambiguous(candidates.clone()),
            None => ToolResolution::NotFound,
        }
    }

    pub fn get(&self, exposed_name: &str) -> Option<&AggregatedTool> {
        self.tools.get(exposed_name)
    }

    /// Entries in exposed-name order.
    pub fn iter(&self) -> impl Iterator<Item = &AggregatedTool> {
        self.tools.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl IntoIterator for AggregatedCatalog {
    type Item = AggregatedTool;
    type IntoIter = std::collections::btree_map::IntoValues<String, AggregatedTool>;

    fn into_iter(self) -> Self::IntoIter {
        self.tools.into_values()
    }
}

/// Structural check of the `required` list in a tool's input schema.
///
/// Full JSON Schema validation is left to the server.
pub fn validate_arguments(tool: &AggregatedTool, arguments: &Value) -> Result<(), McpError> {
    if !arguments.is_object() {
        return Err(McpError::InvalidArguments {
            tool: tool.name.clone(),
            reason: "arguments must be a JSON object".into(),
        });
    }

    let required = tool
        .input_schema
        .get("required")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for field in required.iter().filter_map(Value::as_str) {
        if arguments.get(field).is_none() {
            return Err(McpError::InvalidArguments {
                tool: tool.name.clone(),
                reason: format!("missing required field: '{field}'"),
            });
        }
    }
    Ok(())
}

// ─── ToolAggregator ──────────────────────────────────────────────────────────

/// Lists and invokes tools across a manager's connected servers.
///
/// Only reads the manager's connection map; never mutates it.
#[derive(Clone)]
pub struct ToolAggregator {
    manager: ConnectionManager,
}

impl ToolAggregator {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Current catalog over every connected server's cached tools.
    pub fn list_tools(&self) -> AggregatedCatalog {
        AggregatedCatalog::from_tools(
            self.manager
                .connected_servers()
                .iter()
                .flat_map(|server| server.tools()),
        )
    }

    pub fn resolve(&self, name: &str) -> ToolResolution {
        self.list_tools().resolve(name)
    }

    /// Route a `tools/call` to the owning server and return its result
    /// payload unchanged.
    ///
    /// `Value::Null` arguments are sent as `{}`.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let tool = self.resolve(name).into_result(name)?;
        self.invoke_resolved(&tool, arguments).await
    }

    /// Call a tool that was already resolved, without looking its name up
    /// again. The catalog may have changed since; the call still goes to
    /// `tool.server_name`.
    pub async fn invoke_resolved(
        &self,
        tool: &AggregatedTool,
        arguments: Value,
    ) -> Result<Value, McpError> {
        let arguments = match arguments {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        validate_arguments(tool, &arguments)?;

        let server = self
            .manager
            .connection(&tool.server_name)
            .filter(|server| server.is_connected())
            .ok_or_else(|| McpError::NotConnected {
                name: tool.server_name.clone(),
            })?;

        tracing::debug!(
            tool = %tool.tool_name,
            server = %tool.server_name,
            "invoking tool"
        );

        let params = serde_json::json!({
            "name": tool.tool_name,
            "arguments": arguments,
        });
        let timeout = self.manager.settings().call_timeout;

        server
            .request_with_timeout("tools/call", Some(params), timeout)
            .await
            .map_err(|e| match e {
                McpError::ServerError { code, message, .. } => McpError::ToolInvocationFailed {
                    tool: tool.name.clone(),
                    server: tool.server_name.clone(),
                    code,
                    message,
                },
                other => other,
            })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(server: &str, name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: format!("{name} from {server}"),
            input_schema: json!({"type": "object"}),
            server_name: server.to_string(),
        }
    }

    fn two_server_catalog() -> AggregatedCatalog {
        AggregatedCatalog::from_tools(vec![
            tool("alpha", "a"),
            tool("alpha", "b"),
            tool("beta", "b"),
            tool("beta", "c"),
        ])
    }

    #[test]
    fn test_collisions_are_qualified() {
        let catalog = two_server_catalog();
        assert_eq!(catalog.len(), 4);
        assert_eq!(catalog.names(), vec!["a", "alpha.b", "beta.b", "c"]);

        let b = catalog.get("beta.b").unwrap();
        assert_eq!(b.tool_name, "b");
        assert_eq!(b.server_name, "beta");
    }

    #[test]
    fn test_dotted_tool_name_never_overwrites_qualified_name() {
        let catalog = AggregatedCatalog::from_tools(vec![
            tool("alpha", "b"),
            tool("beta", "b"),
            tool("gamma", "alpha.b"),
        ]);
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.names(), vec!["alpha.b", "beta.b", "gamma.alpha.b"]);

        let shadowed = catalog.get("gamma.alpha.b").unwrap();
        assert_eq!(shadowed.server_name, "gamma");
        assert_eq!(shadowed.tool_name, "alpha.b");
        match catalog.resolve("alpha.b") {
            ToolResolution::Found(t) => assert_eq!(t.server_name, "alpha"),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn test_dotted_tool_name_stays_bare_without_conflict() {
        let catalog =
            AggregatedCatalog::from_tools(vec![tool("alpha", "b"), tool("gamma", "alpha.b")]);
        assert_eq!(catalog.names(), vec!["alpha.b", "b"]);
        assert_eq!(catalog.get("alpha.b").unwrap().server_name, "gamma");
    }

    #[test]
    fn test_repeated_tool_from_one_server_is_listed_once() {
        let catalog = AggregatedCatalog::from_tools(vec![
            tool("alpha", "a"),
            tool("alpha", "a"),
            tool("beta", "c"),
        ]);
        assert_eq!(catalog.names(), vec!["a", "c"]);
        assert!(matches!(catalog.resolve("a"), ToolResolution::Found(_)));
    }

    #[test]
    fn test_catalog_is_restartable() {
        let catalog = two_server_catalog();
        let first: Vec<_> = catalog.iter().map(|t| t.name.clone()).collect();
        let second: Vec<_> = catalog.iter().map(|t| t.name.clone()).collect();
        assert_eq!(first, second);
        assert_eq!(catalog.clone().into_iter().count(), 4);
    }

    #[test]
    fn test_resolve_bare_unique() {
        let catalog = two_server_catalog();
        match catalog.resolve("c") {
            ToolResolution::Found(t) => assert_eq!(t.server_name, "beta"),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn test_resolve_qualified_unique_name() {
        let catalog = two_server_catalog();
        match catalog.resolve("alpha.a") {
            ToolResolution::Found(t) => assert_eq!(t.name, "a"),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn test_resolve_ambiguous() {
        let catalog = two_server_catalog();
        assert_eq!(
            catalog.resolve("b"),
            ToolResolution::Ambiguous(vec!["alpha.b".to_string(), "beta.b".to_string()])
        );
        let err = catalog.resolve("b").into_result("b").unwrap_err();
        assert!(matches!(err, McpError::AmbiguousTool { .. }));
    }

    #[test]
    fn test_resolve_not_found() {
        let catalog = two_server_catalog();
        assert_eq!(catalog.resolve("zzz"), ToolResolution::NotFound);
        assert_eq!(catalog.resolve("gamma.a"), ToolResolution::NotFound);
        assert!(matches!(
            catalog.resolve("zzz").into_result("zzz"),
            Err(McpError::ToolNotFound { .. })
        ));
    }

    #[test]
    fn test_empty_catalog() {
        let catalog = AggregatedCatalog::from_tools(Vec::new());
        assert!(catalog.is_empty());
        assert_eq!(catalog.resolve("ping"), ToolResolution::NotFound);
    }

    #[test]
    fn test_validate_required_arguments() {
        let mut t = AggregatedCatalog::from_tools(vec![tool("fs", "read_file")])
            .get("read_file")
            .cloned()
            .unwrap();
        t.input_schema = json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        });

        assert!(validate_arguments(&t, &json!({"path": "/tmp/x"})).is_ok());
        let err = validate_arguments(&t, &json!({})).unwrap_err();
        assert!(err.to_string().contains("missing required field: 'path'"));
        assert!(validate_arguments(&t, &json!("path")).is_err());
    }

    #[test]
    fn test_validate_without_schema_requirements() {
        let t = AggregatedCatalog::from_tools(vec![tool("echo", "ping")])
            .get("ping")
            .cloned()
            .unwrap();
        assert!(validate_arguments(&t, &json!({})).is_ok());
    }

    #[test]
    fn test_aggregator_without_connections() {
        let manager = ConnectionManager::new(Default::default(), Default::default());
        let aggregator = ToolAggregator::new(manager);
        assert!(aggregator.list_tools().is_empty());
    }

    #[tokio::test]
    async fn test_invoke_resolved_requires_connection() {
        let manager = ConnectionManager::new(Default::default(), Default::default());
        let aggregator = ToolAggregator::new(manager);
        let resolved = AggregatedCatalog::from_tools(vec![tool("echo", "ping")])
            .get("ping")
            .cloned()
            .unwrap();
        let err = aggregator
            .invoke_resolved(&resolved, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::NotConnected { ref name } if name == "echo"));
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool() {
        let manager = ConnectionManager::new(Default::default(), Default::default());
        let aggregator = ToolAggregator::new(manager);
        let err = aggregator.invoke("ping", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::ToolNotFound { .. }));
    }
}
