//! Process-wide singleton guard for the connection manager.
//!
//! Concurrent callers of [`SingletonGuard::get_instance`] share one
//! initialization attempt: one spawned task loads the server registry,
//! starts every server and only then publishes the manager. A cached
//! instance whose connections have all died is treated as stale and rebuilt.

use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use uuid::Uuid;

use super::errors::McpError;
use super::lifecycle::ManagerSettings;
use super::lock;
use super::manager::ConnectionManager;
use super::servers::ServerRegistry;

/// Produces the registry and settings a fresh manager is built from.
pub type Loader =
    Box<dyn Fn() -> Result<(ServerRegistry, ManagerSettings), McpError> + Send + Sync>;

/// `None` when a reset superseded the attempt before it could publish.
type InitFuture = Shared<BoxFuture<'static, Result<Option<ConnectionManager>, McpError>>>;

struct Instance {
    id: Uuid,
    manager: ConnectionManager,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Slot {
    instance: Option<Instance>,
    in_flight: Option<InitFuture>,
    /// Bumped by every new attempt and every reset; an attempt publishes
    /// only if it is still current.
    generation: u64,
}

struct GuardInner {
    loader: Loader,
    slot: Mutex<Slot>,
}

/// Diagnostic snapshot of the guard. Observability only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub has_instance: bool,
    pub instance_id: Option<String>,
    pub initializing: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub stale: bool,
}

/// Guards the single shared [`ConnectionManager`].
#[derive(Clone)]
pub struct SingletonGuard {
    inner: Arc<GuardInner>,
}

impl SingletonGuard {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> Result<(ServerRegistry, ManagerSettings), McpError> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(GuardInner {
                loader: Box::new(loader),
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    /// Return the live manager, building it if needed.
    ///
    /// Loader failures are returned and leave nothing cached, so a later
    /// call retries.
    pub async fn get_instance(&self) -> Result<ConnectionManager, McpError> {
        loop {
            let (attempt, stale) = {
                let mut slot = lock(&self.inner.slot);
                if let Some(instance) = &slot.instance {
                    if !instance.manager.is_stale() {
                        return Ok(instance.manager.clone());
                    }
                }
                let stale = slot.instance.take();
                let attempt = match slot.in_flight.clone() {
                    Some(attempt) => attempt,
                    None => self.begin_initialization(&mut slot),
                };
                (attempt, stale)
            };

            if let Some(stale) = stale {
                tracing::warn!(
                    instance_id = %stale.id,
                    "cached MCP manager is stale, rebuilding"
                );
                // Reap whatever the dead generation left behind.
                tokio::spawn(async move { stale.manager.shutdown().await });
            }

            if let Some(manager) = attempt.await? {
                return Ok(manager);
            }
        }
    }

    /// Tear down the current instance and clear the slot. An initialization
    /// still in flight is superseded and will not publish.
    pub async fn reset(&self) {
        let instance = {
            let mut slot = lock(&self.inner.slot);
            slot.generation += 1;
            slot.in_flight = None;
            slot.instance.take()
        };

        match instance {
            Some(instance) => {
                tracing::info!(instance_id = %instance.id, "resetting MCP manager");
                instance.manager.shutdown().await;
            }
            None => tracing::debug!("reset with no MCP manager instance"),
        }
    }

    pub fn instance_info(&self) -> InstanceInfo {
        let slot = lock(&self.inner.slot);
        let instance = slot.instance.as_ref();
        InstanceInfo {
            has_instance: instance.is_some(),
            instance_id: instance.map(|i| i.id.to_string()),
            initializing: slot.in_flight.is_some(),
            created_at: instance.map(|i| i.created_at),
            stale: instance.is_some_and(|i| i.manager.is_stale()),
        }
    }

    fn begin_initialization(&self, slot: &mut Slot) -> InitFuture {
        slot.generation += 1;
        let generation = slot.generation;

        let task = tokio::spawn(initialize(Arc::clone(&self.inner), generation));
        let attempt = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(McpError::InitializationFailed {
                    reason: format!("initialization task failed: {e}"),
                }),
            }
        }
        .boxed()
        .shared();

        slot.in_flight = Some(attempt.clone());
        attempt
    }
}

async fn initialize(
    inner: Arc<GuardInner>,
    generation: u64,
) -> Result<Option<ConnectionManager>, McpError> {
    let (registry, settings) = match (inner.loader)() {
        Ok(loaded) => loaded,
        Err(e) => {
            tracing::error!(error = %e, "failed to load MCP server configuration");
            let mut slot = lock(&inner.slot);
            if slot.generation == generation {
                slot.in_flight = None;
            }
            return Err(e);
        }
    };

    let manager = ConnectionManager::new(registry, settings);
    let failures = manager.start().await;

    let id = Uuid::new_v4();
    let published = {
        let mut slot = lock(&inner.slot);
        if slot.generation == generation {
            slot.in_flight = None;
            slot.instance = Some(Instance {
                id,
                manager: manager.clone(),
                created_at: Utc::now(),
            });
            true
        } else {
            false
        }
    };

    if !published {
        tracing::info!("MCP manager initialization superseded by reset");
        manager.shutdown().await;
        return Ok(None);
    }

    let status = manager.status();
    tracing::info!(
        instance_id = %id,
        total = status.total_servers,
        connected = status.connected_servers,
        failed = failures.len(),
        "MCP manager initialized"
    );
    Ok(Some(manager))
}

// ─── Process-wide instance ───────────────────────────────────────────────────

static GLOBAL: OnceLock<SingletonGuard> = OnceLock::new();

/// The process-wide guard, loading configuration from the environment.
pub fn global() -> &'static SingletonGuard {
    GLOBAL.get_or_init(|| SingletonGuard::new(crate::config::load_manager_inputs))
}

pub async fn get_instance() -> Result<ConnectionManager, McpError> {
    global().get_instance().await
}

pub async fn reset() {
    global().reset().await
}

pub fn instance_info() -> InstanceInfo {
    global().instance_info()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
