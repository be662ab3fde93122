//! Shared helpers for integration tests that drive `mock-mcp-server`.

#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use mcp_orchestrator::mcp_client::{
    ConnectionManager, ManagerSettings, ServerDefinition, ServerRegistry,
};

/// Path of the mock server binary built alongside the tests.
pub const MOCK_SERVER: &str = env!("CARGO_BIN_EXE_mock-mcp-server");

/// Bound for any single test step.
const STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Definition running the mock server under `name` with extra flags.
pub fn mock(name: &str, flags: &[&str]) -> ServerDefinition {
    let mut args = vec!["--name", name];
    args.extend_from_slice(flags);
    ServerDefinition::new(name, MOCK_SERVER, &args)
}

/// Flags appending each spawn to `log`.
pub fn spawn_log_flags(log: &Path) -> Vec<String> {
    vec!["--spawn-log".to_string(), log.display().to_string()]
}

pub fn with_flags(name: &str, flags: &[String]) -> ServerDefinition {
    let flags: Vec<&str> = flags.iter().map(String::as_str).collect();
    mock(name, &flags)
}

/// Settings with short timeouts so failures surface quickly.
pub fn fast_settings() -> ManagerSettings {
    ManagerSettings {
        request_timeout: Duration::from_secs(5),
        init_timeout: Duration::from_secs(10),
        call_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(2),
        restart_base_delay: Duration::from_millis(10),
        ..ManagerSettings::default()
    }
}

pub fn registry(definitions: Vec<ServerDefinition>) -> ServerRegistry {
    let mut registry = ServerRegistry::new();
    for definition in definitions {
        registry.register(definition).expect("valid definition");
    }
    registry
}

pub fn manager(definitions: Vec<ServerDefinition>) -> ConnectionManager {
    ConnectionManager::new(registry(definitions), fast_settings())
}

/// Await `future`, failing the test instead of hanging.
pub async fn bounded<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(STEP_TIMEOUT, future)
        .await
        .expect("test step timed out")
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Number of lines in a spawn log (0 if it does not exist yet).
pub fn spawn_count(log: &Path) -> usize {
    std::fs::read_to_string(log)
        .map(|raw| raw.lines().filter(|l| !l.trim().is_empty()).count())
        .unwrap_or(0)
}
