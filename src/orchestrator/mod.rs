//! Lifecycle Orchestrator.
//!
//! Owns the container cache, the per-container delete locks and the set of
//! in-flight create workflows, and drives the runtime through the
//! `RuntimeClient` seam. Every state change is written to the store first,
//! then mirrored into the cache and published on the Event Bus.
//!
//! | File           | Operations |
//! |----------------|------------|
//! | `create.rs`    | `create`, `create_async` |
//! | `lifecycle.rs` | `start`, `start_with_task`, `stop`, `stop_with_task`, `restart`, `restart_with_task` |
//! | `delete.rs`    | `delete`, `delete_with_task` |
//! | `limits.rs`    | `update_limits`, `update_limits_with_task` |
//! | `reconcile.rs` | `reconcile`, runtime event forwarding |
//! | `locks.rs`     | `OperationLocks` |

pub mod create;
pub mod delete;
pub mod lifecycle;
pub mod limits;
pub mod locks;
pub mod reconcile;

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use dockyard_common::{
    ContainerListItem, ContainerRecord, ContainerStatus, DockyardError, Event, MetricsSample,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{DockyardConfig, TemplateConfig};
use crate::events::EventBus;
use crate::runtime::{ExecOptions, RuntimeClient, RuntimeEvent, shell};
use crate::store::{StoreHandle, UniqueViolation};
use crate::tasks::TaskTracker;

pub use create::{CreateContainerRequest, CreateOutcome, SetupFailure, SetupReport};
pub use delete::DeleteOutcome;
pub use locks::OperationLocks;
pub use reconcile::ReconcileReport;

/// Outcome shared with callers that wait on an in-flight delete:
/// `Ok(already_deleted)` or the owner's error message.
pub type DeleteLockOutcome = Result<bool, String>;

// ── Collaborators ────────────────────────────────────────────────────

/// Terminal / editor sessions attached to a container.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Close every session of `container_id`, returning how many were open.
    async fn close_sessions(&self, container_id: &str) -> usize;
}

/// Registry used when no session bridge is wired in.
pub struct NoopSessions;

#[async_trait]
impl SessionRegistry for NoopSessions {
    async fn close_sessions(&self, _container_id: &str) -> usize {
        0
    }
}

// ── Settings ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub templates: BTreeMap<String, TemplateConfig>,
    pub default_template: String,
    pub allowed_git_hosts: Vec<String>,
    pub network: Option<String>,
    pub enforce_disk_quota: bool,
    pub readiness_timeout: Duration,
    pub exec_ready_timeout: Duration,
    pub poll_interval: Duration,
    pub reconcile_interval: Duration,
    pub metrics_interval: Duration,
    pub metrics_retention: Duration,
    pub task_sweep_interval: Duration,
}

impl From<&DockyardConfig> for OrchestratorSettings {
    fn from(config: &DockyardConfig) -> Self {
        let o = &config.orchestrator;
        Self {
            templates: config.templates.clone(),
            default_template: o.default_template.clone(),
            allowed_git_hosts: config.runtime.allowed_git_hosts.clone(),
            network: config.runtime.network.clone(),
            enforce_disk_quota: config.runtime.enforce_disk_quota,
            readiness_timeout: Duration::from_secs(o.readiness_timeout_secs),
            exec_ready_timeout: Duration::from_secs(o.exec_ready_timeout_secs),
            poll_interval: Duration::from_millis(o.poll_interval_ms),
            reconcile_interval: Duration::from_secs(o.reconcile_interval_secs),
            metrics_interval: Duration::from_secs(o.metrics_interval_secs),
            metrics_retention: config.metrics_retention(),
            task_sweep_interval: Duration::from_secs(o.task_sweep_interval_secs),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&DockyardConfig::default())
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────

pub struct Orchestrator {
    store: StoreHandle,
    runtime: Arc<dyn RuntimeClient>,
    events: EventBus,
    tasks: TaskTracker,
    settings: OrchestratorSettings,
    sessions: Arc<dyn SessionRegistry>,
    cache: DashMap<String, ContainerRecord>,
    locks: OperationLocks<DeleteLockOutcome>,
    /// Container ids whose create workflow runs in this process.
    creating: DashSet<String>,
    runtime_events: Mutex<Option<mpsc::Receiver<RuntimeEvent>>>,
}

impl Orchestrator {
    pub fn new(
        store: StoreHandle,
        runtime: Arc<dyn RuntimeClient>,
        events: EventBus,
        tasks: TaskTracker,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            runtime,
            events,
            tasks,
            settings,
            sessions: Arc::new(NoopSessions),
            cache: DashMap::new(),
            locks: OperationLocks::new(),
            creating: DashSet::new(),
            runtime_events: Mutex::new(None),
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionRegistry>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Runtime push events consumed by the forwarder `start_background` spawns.
    pub fn with_runtime_events(self, rx: mpsc::Receiver<RuntimeEvent>) -> Self {
        if let Ok(mut slot) = self.runtime_events.lock() {
            *slot = Some(rx);
        }
        self
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeClient> {
        &self.runtime
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Spawn the long-running loops: runtime event forwarder, periodic
    /// reconciliation, task sweeper and metrics collector.
    pub fn start_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let rx = self
            .runtime_events
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(rx) = rx {
            handles.push(self.spawn_event_forwarder(rx));
        }
        handles.push(self.spawn_reconciler(self.settings.reconcile_interval));
        handles.push(self.tasks.spawn_sweeper(self.settings.task_sweep_interval));
        handles.push(crate::metrics::spawn_collector(
            self.clone(),
            self.settings.metrics_interval,
            self.settings.metrics_retention,
        ));
        info!(loops = handles.len(), "background loops started");
        handles
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Every record, read from the store (the cache is refreshed on the way).
    pub async fn get_all(
        &self,
        include_metrics: bool,
    ) -> Result<Vec<ContainerListItem>, DockyardError> {
        let records = self
            .store
            .call(|store| store.list_containers())
            .await
            .map_err(DockyardError::Store)?;
        self.refresh_cache(&records);

        let mut items = Vec::with_capacity(records.len());
        for record in records {
            items.push(self.enrich(record, include_metrics).await?);
        }
        Ok(items)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<ContainerRecord, DockyardError> {
        self.require(id).await
    }

    pub async fn metrics_history(
        &self,
        id: &str,
        limit: usize,
    ) -> Result<Vec<MetricsSample>, DockyardError> {
        self.require(id).await?;
        let id = id.to_string();
        self.store
            .call(move |store| store.metrics_history(&id, limit))
            .await
            .map_err(DockyardError::Store)
    }

    /// Attach the latest metrics sample (when asked) and the active task.
    pub async fn enrich(
        &self,
        record: ContainerRecord,
        include_metrics: bool,
    ) -> Result<ContainerListItem, DockyardError> {
        let metrics = if include_metrics {
            let id = record.id.clone();
            self.store
                .call(move |store| store.latest_metrics(&id))
                .await
                .map_err(DockyardError::Store)?
        } else {
            None
        };
        let active_task = record.task_id().and_then(|task_id| self.tasks.get(task_id));
        Ok(ContainerListItem {
            container: record,
            metrics,
            active_task,
        })
    }

    // ── Record helpers ───────────────────────────────────────────────

    /// Cache first, then the store.
    pub(crate) async fn load(&self, id: &str) -> Result<Option<ContainerRecord>, DockyardError> {
        if let Some(record) = self.cache.get(id) {
            return Ok(Some(record.clone()));
        }
        let owned = id.to_string();
        let record = self
            .store
            .call(move |store| store.get_container(&owned))
            .await
            .map_err(DockyardError::Store)?;
        if let Some(record) = &record {
            self.cache.insert(record.id.clone(), record.clone());
        }
        Ok(record)
    }

    pub(crate) async fn require(&self, id: &str) -> Result<ContainerRecord, DockyardError> {
        self.load(id)
            .await?
            .ok_or_else(|| DockyardError::ContainerNotFound { id: id.to_string() })
    }

    /// Like `require`, but refuses records that another workflow owns:
    /// a delete in flight, or a create still provisioning.
    pub(crate) async fn require_idle(&self, id: &str) -> Result<ContainerRecord, DockyardError> {
        let record = self.require(id).await?;
        if self.locks.is_locked(id)
            || self.creating.contains(id)
            || matches!(
                record.status,
                ContainerStatus::Removing | ContainerStatus::Creating
            )
        {
            return Err(DockyardError::OperationInProgress { id: id.to_string() });
        }
        Ok(record)
    }

    /// Persist a status change, mirror it into the cache and publish it.
    pub(crate) async fn set_status(
        &self,
        id: &str,
        status: ContainerStatus,
    ) -> Result<ContainerRecord, DockyardError> {
        let owned = id.to_string();
        let record = self
            .store
            .call(move |store| store.update_status(&owned, status))
            .await
            .map_err(DockyardError::Store)?
            .ok_or_else(|| DockyardError::ContainerNotFound { id: id.to_string() })?;
        self.cache.insert(record.id.clone(), record.clone());
        self.events.publish(Event::container_status(id, status));
        debug!(container_id = %id, status = %status, "status updated");
        Ok(record)
    }

    /// Drop a record together with its metrics, evict it, and announce it.
    pub(crate) async fn forget(&self, id: &str) -> Result<(), DockyardError> {
        let owned = id.to_string();
        self.store
            .call(move |store| {
                store.delete_metrics(&owned)?;
                store.delete_container(&owned)
            })
            .await
            .map_err(DockyardError::Store)?;
        self.cache.remove(id);
        self.events.publish(Event::ContainerRemoved {
            container_id: id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Align the cache with a store snapshot. Ids missing from the snapshot
    /// are evicted; a cached entry newer than its snapshot row is kept, since
    /// a write may have landed after the snapshot was read.
    pub(crate) fn refresh_cache(&self, records: &[ContainerRecord]) {
        let ids: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        self.cache.retain(|id, _| ids.contains(id.as_str()));
        for record in records {
            match self.cache.entry(record.id.clone()) {
                Entry::Occupied(mut cached) => {
                    if cached.get().updated_at <= record.updated_at {
                        cached.insert(record.clone());
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(record.clone());
                }
            }
        }
    }

    pub(crate) fn cache_put(&self, record: &ContainerRecord) {
        self.cache.insert(record.id.clone(), record.clone());
    }

    pub fn cached(&self, id: &str) -> Option<ContainerRecord> {
        self.cache.get(id).map(|r| r.clone())
    }

    pub fn is_delete_in_flight(&self, id: &str) -> bool {
        self.locks.is_locked(id)
    }

    pub fn is_create_in_flight(&self, id: &str) -> bool {
        self.creating.contains(id)
    }

    // ── Runtime helpers ──────────────────────────────────────────────

    /// Poll `command` inside the container until it exits 0 or `timeout`
    /// elapses. Returns whether it succeeded.
    pub(crate) async fn poll_until_success(
        &self,
        runtime_id: &str,
        command: &[String],
        opts: &ExecOptions,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.runtime.exec(runtime_id, command, opts).await {
                Ok(output) if output.success() => return true,
                Ok(output) => debug!(%runtime_id, exit_code = output.exit_code, "probe not ready"),
                Err(e) => debug!(%runtime_id, error = %e, "probe failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Run the template health check, if any. A timeout only logs.
    pub(crate) async fn wait_ready(&self, record: &ContainerRecord) {
        let Some(template) = self.settings.templates.get(&record.template) else {
            return;
        };
        let Some(check) = &template.health_check else {
            return;
        };
        let opts = ExecOptions::as_user(template.user.clone());
        let ready = self
            .poll_until_success(
                &record.runtime_id,
                &shell(check),
                &opts,
                self.settings.readiness_timeout,
            )
            .await;
        if !ready {
            warn!(
                container_id = %record.id,
                timeout_secs = self.settings.readiness_timeout.as_secs(),
                "container not ready before timeout, continuing"
            );
        }
    }
}

/// Map a store error from a unique index into a name conflict.
pub(crate) fn conflict_or_store(err: anyhow::Error, name: &str) -> DockyardError {
    if err.downcast_ref::<UniqueViolation>().is_some() {
        DockyardError::NameTaken {
            name: name.to_string(),
        }
    } else {
        DockyardError::Store(err)
    }
}
