//! CLI command implementations.
//!
//! | Module      | Commands handled |
//! |-------------|------------------|
//! | `serve`     | `Serve`          |
//! | `reconcile` | `Reconcile`      |
//! | `config`    | `Config`         |

pub mod config;
pub mod reconcile;
pub mod serve;

pub use config::cmd_config;
pub use reconcile::cmd_reconcile;
pub use serve::cmd_serve;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dockyard::config::DockyardConfig;
use dockyard::events::EventBus;
use dockyard::orchestrator::{Orchestrator, OrchestratorSettings};
use dockyard::runtime::docker::DockerRuntime;
use dockyard::store::{Store, StoreHandle};
use dockyard::tasks::TaskTracker;

/// Open the store and connect to the runtime described by `config`.
pub fn connect(config: &DockyardConfig) -> Result<(Orchestrator, DockerRuntime)> {
    let db_path = &config.storage.db_path;
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let store = Store::open(db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    let runtime = DockerRuntime::connect(
        config.runtime.docker_host.as_deref(),
        config.runtime.stop_timeout_secs,
    )
    .context("Failed to connect to the container runtime")?;

    let events = EventBus::default();
    let tasks = TaskTracker::new(
        events.clone(),
        Duration::from_secs(config.orchestrator.task_retention_secs),
    );
    let orchestrator = Orchestrator::new(
        StoreHandle::new(store),
        Arc::new(runtime.clone()),
        events,
        tasks,
        OrchestratorSettings::from(config),
    );
    Ok((orchestrator, runtime))
}
