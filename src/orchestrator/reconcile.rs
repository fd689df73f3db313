//! Store ↔ runtime reconciliation and runtime event forwarding.
//!
//! Reconciliation treats the runtime as the source of truth for managed
//! objects: unknown managed objects are recovered into records, drifted
//! statuses are corrected, and records whose runtime object vanished are
//! dropped. Records owned by an in-flight create or delete are left alone.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dockyard_common::{
    AgentMode, ContainerRecord, ContainerStatus, DockyardError, Event, RepoType, ResourceLimits,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Orchestrator;
use super::create::RUNTIME_NAME_PREFIX;
use crate::runtime::{
    LABEL_CPU, LABEL_DISK_MB, LABEL_ID, LABEL_MEMORY_MB, LABEL_NAME, LABEL_TEMPLATE,
    RuntimeContainer, RuntimeEvent,
};
use crate::sanitize::sanitize_name;
use crate::store::UniqueViolation;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ReconcileReport {
    pub recovered: usize,
    pub updated: usize,
    pub removed: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.recovered == 0 && self.updated == 0 && self.removed == 0
    }
}

impl Orchestrator {
    pub async fn reconcile(&self) -> Result<ReconcileReport, DockyardError> {
        let records = self
            .store
            .call(|store| store.list_containers())
            .await
            .map_err(DockyardError::Store)?;
        self.refresh_cache(&records);

        let observed = self.runtime.list(true).await?;
        let mut report = ReconcileReport::default();

        let by_runtime: HashMap<&str, &ContainerRecord> = records
            .iter()
            .map(|r| (r.runtime_id.as_str(), r))
            .collect();
        let by_id: HashMap<&str, &ContainerRecord> =
            records.iter().map(|r| (r.id.as_str(), r)).collect();
        let mut names: HashSet<String> = records.iter().map(|r| r.name.clone()).collect();
        let mut seen: HashSet<String> = HashSet::new();

        for container in observed.iter().filter(|c| c.is_managed()) {
            // Only an in-flight create is really `creating`; those are skipped
            // below, so a `created` object here was provisioned but never started.
            let status = match ContainerStatus::from_runtime_state(&container.state) {
                ContainerStatus::Creating => ContainerStatus::Stopped,
                other => other,
            };
            let known = by_runtime.get(container.id.as_str()).copied().or_else(|| {
                container
                    .labels
                    .get(LABEL_ID)
                    .and_then(|id| by_id.get(id.as_str()).copied())
            });

            match known {
                Some(record) => {
                    seen.insert(record.id.clone());
                    if self.is_busy(&record.id) {
                        continue;
                    }
                    match self.converge(record, &container.id, status).await {
                        Ok(true) => report.updated += 1,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(container_id = %record.id, error = %e, "failed to update drifted record")
                        }
                    }
                }
                None => match self.recover(container, status, &mut names).await {
                    Ok(record) => {
                        seen.insert(record.id.clone());
                        report.recovered += 1;
                    }
                    Err(e) => {
                        warn!(runtime_id = %container.id, error = %e, "failed to recover container")
                    }
                },
            }
        }

        for record in &records {
            if seen.contains(&record.id) || self.is_busy(&record.id) {
                continue;
            }
            match self.forget(&record.id).await {
                Ok(()) => {
                    info!(container_id = %record.id, name = %record.name, "dropped record with no runtime container");
                    report.removed += 1;
                }
                Err(e) => warn!(container_id = %record.id, error = %e, "failed to drop stale record"),
            }
        }

        if !report.is_noop() {
            info!(
                recovered = report.recovered,
                updated = report.updated,
                removed = report.removed,
                "reconciliation changed state"
            );
        }
        Ok(report)
    }

    pub fn spawn_reconciler(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = this.reconcile().await {
                    warn!(error = %e, "reconciliation failed, retrying next pass");
                }
            }
        })
    }

    /// Records a create or delete in this process is still working on.
    fn is_busy(&self, id: &str) -> bool {
        self.creating.contains(id) || self.locks.is_locked(id)
    }

    /// Bring one record in line with its runtime object. Returns whether
    /// anything changed.
    async fn converge(
        &self,
        record: &ContainerRecord,
        runtime_id: &str,
        status: ContainerStatus,
    ) -> Result<bool, DockyardError> {
        let mut changed = false;
        if record.runtime_id != runtime_id {
            let (id, rt) = (record.id.clone(), runtime_id.to_string());
            let updated = self
                .store
                .call(move |store| store.update_runtime_id(&id, &rt))
                .await
                .map_err(DockyardError::Store)?;
            if let Some(updated) = updated {
                self.cache_put(&updated);
            }
            changed = true;
        }
        if record.status != status {
            debug!(container_id = %record.id, from = %record.status, to = %status, "status drift");
            self.set_status(&record.id, status).await?;
            changed = true;
        }
        Ok(changed)
    }

    /// Rebuild a record from a managed runtime object's labels.
    async fn recover(
        &self,
        container: &RuntimeContainer,
        status: ContainerStatus,
        names: &mut HashSet<String>,
    ) -> Result<ContainerRecord, DockyardError> {
        let label = |key: &str| container.labels.get(key).map(String::as_str);
        let defaults = ResourceLimits::default();

        let base_name = label(LABEL_NAME)
            .map(str::to_string)
            .unwrap_or_else(|| {
                container
                    .name
                    .trim_start_matches(RUNTIME_NAME_PREFIX)
                    .to_string()
            });
        let base_name = sanitize_name(&base_name).unwrap_or_else(|_| "recovered".to_string());
        let name = unique_name(&base_name, names);

        let now = Utc::now();
        let record = ContainerRecord {
            id: label(LABEL_ID)
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            runtime_id: container.id.clone(),
            name,
            status,
            cpu_limit: label(LABEL_CPU)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.cpu_cores),
            memory_limit: label(LABEL_MEMORY_MB)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.memory_mb),
            disk_limit: label(LABEL_DISK_MB)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.disk_mb),
            repo_type: RepoType::Empty,
            repo_url: None,
            template: label(LABEL_TEMPLATE)
                .map(str::to_string)
                .unwrap_or_else(|| self.settings.default_template.clone()),
            mode: AgentMode::default(),
            config: serde_json::json!({ "recovered": true }),
            created_at: now,
            updated_at: now,
            started_at: (status == ContainerStatus::Running).then_some(now),
            stopped_at: None,
        };

        let insert = record.clone();
        self.store
            .call(move |store| store.insert_container(&insert))
            .await
            .map_err(|e| {
                if e.downcast_ref::<UniqueViolation>().is_some() {
                    DockyardError::NameTaken {
                        name: record.name.clone(),
                    }
                } else {
                    DockyardError::Store(e)
                }
            })?;
        names.insert(record.name.clone());
        self.cache_put(&record);
        self.events
            .publish(Event::container_status(&record.id, record.status));
        info!(container_id = %record.id, runtime_id = %record.runtime_id, name = %record.name, "recovered container");
        Ok(record)
    }

    // ── Runtime event forwarding ─────────────────────────────────────

    pub(crate) fn spawn_event_forwarder(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<RuntimeEvent>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = this.handle_runtime_event(&event).await {
                    warn!(runtime_id = %event.runtime_id, action = %event.action, error = %e, "failed to apply runtime event");
                }
            }
            debug!("runtime event channel closed");
        })
    }

    /// Apply one runtime push event to a known record.
    pub async fn handle_runtime_event(&self, event: &RuntimeEvent) -> Result<(), DockyardError> {
        let runtime_id = event.runtime_id.clone();
        let Some(record) = self
            .store
            .call(move |store| store.get_container_by_runtime_id(&runtime_id))
            .await
            .map_err(DockyardError::Store)?
        else {
            return Ok(());
        };
        if self.is_busy(&record.id)
            || matches!(
                record.status,
                ContainerStatus::Creating | ContainerStatus::Removing
            )
        {
            return Ok(());
        }

        let status = match event.action.as_str() {
            "start" | "unpause" => ContainerStatus::Running,
            "pause" => ContainerStatus::Paused,
            "die" => ContainerStatus::Exited,
            "stop" => ContainerStatus::Stopped,
            "destroy" => {
                info!(container_id = %record.id, "runtime container destroyed externally");
                return self.forget(&record.id).await;
            }
            _ => return Ok(()),
        };
        if record.status != status {
            self.set_status(&record.id, status).await?;
        }
        Ok(())
    }
}

/// `base`, or `base-recovered`, `base-recovered-2`, ... whichever is free.
fn unique_name(base: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    let mut candidate = format!("{}-recovered", base);
    let mut n = 2;
    while taken.contains(&candidate) {
        candidate = format!("{}-recovered-{}", base, n);
        n += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::runtime::LABEL_MANAGED;

    fn managed_labels(id: &str, name: &str) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_ID.to_string(), id.to_string());
        labels.insert(LABEL_NAME.to_string(), name.to_string());
        labels.insert(LABEL_CPU.to_string(), "4".to_string());
        labels.insert(LABEL_MEMORY_MB.to_string(), "4096".to_string());
        labels
    }

    #[test]
    fn test_unique_name() {
        let mut taken = HashSet::new();
        assert_eq!(unique_name("a", &taken), "a");
        taken.insert("a".to_string());
        assert_eq!(unique_name("a", &taken), "a-recovered");
        taken.insert("a-recovered".to_string());
        assert_eq!(unique_name("a", &taken), "a-recovered-2");
    }

    #[tokio::test]
    async fn test_recovers_unknown_managed_containers() {
        let h = harness();
        h.runtime
            .insert("rt-x", "dockyard-orphan", "running", managed_labels("c-x", "orphan"));
        h.runtime
            .insert("rt-foreign", "postgres", "running", HashMap::new());

        let report = h.orchestrator.reconcile().await.unwrap();
        assert_eq!(report.recovered, 1);

        let record = h.orchestrator.get_by_id("c-x").await.unwrap();
        assert_eq!(record.name, "orphan");
        assert_eq!(record.runtime_id, "rt-x");
        assert_eq!(record.status, ContainerStatus::Running);
        assert_eq!(record.cpu_limit, 4.0);
        assert_eq!(record.memory_limit, 4096);
        assert_eq!(record.disk_limit, ResourceLimits::default().disk_mb);
        assert_eq!(h.orchestrator.get_all(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recovered_name_is_deduplicated() {
        let h = harness();
        h.orchestrator.create(request("twin"), None).await.unwrap();
        h.runtime
            .insert("rt-twin", "dockyard-twin", "exited", managed_labels("c-twin", "twin"));
        let report = h.orchestrator.reconcile().await.unwrap();
        assert_eq!(report.recovered, 1);
        let recovered = h.orchestrator.get_by_id("c-twin").await.unwrap();
        assert_eq!(recovered.name, "twin-recovered");
        assert_eq!(recovered.status, ContainerStatus::Exited);
    }

    #[tokio::test]
    async fn test_never_started_object_is_recovered_stopped() {
        let h = harness();
        h.runtime
            .insert("rt-new", "dockyard-fresh", "created", managed_labels("c-new", "fresh"));

        h.orchestrator.reconcile().await.unwrap();
        let record = h.orchestrator.get_by_id("c-new").await.unwrap();
        assert_eq!(record.status, ContainerStatus::Stopped);
        assert!(h.orchestrator.reconcile().await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn test_status_drift_is_corrected() {
        let h = harness();
        let record = h.orchestrator.create(request("drift"), None).await.unwrap();
        h.runtime
            .containers
            .lock()
            .unwrap()
            .get_mut(&record.runtime_id)
            .unwrap()
            .state = "paused".to_string();

        let report = h.orchestrator.reconcile().await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(
            h.orchestrator.get_by_id(&record.id).await.unwrap().status,
            ContainerStatus::Paused
        );
    }

    #[tokio::test]
    async fn test_vanished_runtime_object_drops_record() {
        let h = harness();
        let record = h.orchestrator.create(request("vanish"), None).await.unwrap();
        h.runtime.containers.lock().unwrap().clear();
        let report = h.orchestrator.reconcile().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(h.orchestrator.get_by_id(&record.id).await.is_err());
    }

    #[tokio::test]
    async fn test_converges_and_is_idempotent() {
        let h = harness();
        h.orchestrator.create(request("steady"), None).await.unwrap();
        h.runtime
            .insert("rt-y", "dockyard-extra", "running", managed_labels("c-y", "extra"));

        let first = h.orchestrator.reconcile().await.unwrap();
        assert!(!first.is_noop());
        let second = h.orchestrator.reconcile().await.unwrap();
        assert!(second.is_noop());
        assert_eq!(h.orchestrator.get_all(false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_in_flight_create_is_exempt() {
        let h = harness();
        let record = crate::store::tests::sample_record("c-busy", "busy");
        let insert = record.clone();
        h.orchestrator
            .store()
            .call(move |s| s.insert_container(&insert))
            .await
            .unwrap();
        h.orchestrator.creating.insert("c-busy".to_string());

        let report = h.orchestrator.reconcile().await.unwrap();
        assert_eq!(report.removed, 0);
        assert!(h.orchestrator.get_by_id("c-busy").await.is_ok());

        h.orchestrator.creating.remove("c-busy");
        let report = h.orchestrator.reconcile().await.unwrap();
        assert_eq!(report.removed, 1);
    }

    #[tokio::test]
    async fn test_list_failure_is_an_error() {
        let h = harness();
        h.runtime.fail_on("list");
        assert!(h.orchestrator.reconcile().await.is_err());
    }

    #[tokio::test]
    async fn test_runtime_events_update_status() {
        let h = harness();
        let record = h.orchestrator.create(request("events"), None).await.unwrap();
        let rt = record.runtime_id.clone();
        let event = |action: &str| RuntimeEvent {
            runtime_id: rt.clone(),
            action: action.to_string(),
        };

        h.orchestrator.handle_runtime_event(&event("start")).await.unwrap();
        assert_eq!(
            h.orchestrator.get_by_id(&record.id).await.unwrap().status,
            ContainerStatus::Running
        );
        h.orchestrator.handle_runtime_event(&event("die")).await.unwrap();
        assert_eq!(
            h.orchestrator.get_by_id(&record.id).await.unwrap().status,
            ContainerStatus::Exited
        );
        h.orchestrator.handle_runtime_event(&event("exec_start")).await.unwrap();
        h.orchestrator.handle_runtime_event(&event("destroy")).await.unwrap();
        assert!(h.orchestrator.get_by_id(&record.id).await.is_err());

        // Unknown runtime ids are ignored.
        h.orchestrator
            .handle_runtime_event(&RuntimeEvent {
                runtime_id: "rt-unknown".into(),
                action: "start".into(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_forwarder_drains_channel() {
        let h = harness();
        let record = h.orchestrator.create(request("fwd"), None).await.unwrap();
        let (tx, rx) = mpsc::channel(8);
        let handle = h.orchestrator.spawn_event_forwarder(rx);
        tx.send(RuntimeEvent {
            runtime_id: record.runtime_id.clone(),
            action: "pause".into(),
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(
            h.orchestrator.get_by_id(&record.id).await.unwrap().status,
            ContainerStatus::Paused
        );
    }
}
