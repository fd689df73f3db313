//! Resource-limit updates.

use dockyard_common::{
    ContainerListItem, ContainerStatus, DockyardError, LimitsUpdate, ResourceLimits, TaskType,
    validate_cpu, validate_disk, validate_memory,
};
use tracing::info;

use super::Orchestrator;
use crate::runtime::ResourceUpdate;

impl Orchestrator {
    /// Apply a partial limit change. CPU and memory are pushed to a running
    /// container immediately; disk is recorded and applies on next create.
    pub async fn update_limits(
        &self,
        id: &str,
        update: LimitsUpdate,
    ) -> Result<ContainerListItem, DockyardError> {
        let disk_mb = validate_update(&update)?;
        let record = self.require_idle(id).await?;

        let current = record.limits();
        let limits = ResourceLimits {
            cpu_cores: update.cpu_cores.unwrap_or(current.cpu_cores),
            memory_mb: update.memory_mb.unwrap_or(current.memory_mb),
            disk_mb: disk_mb.unwrap_or(current.disk_mb),
        };

        if record.status == ContainerStatus::Running && update.touches_live_resources() {
            let live = ResourceUpdate {
                memory_bytes: update.memory_mb.map(|_| limits.memory_bytes()),
                nano_cpus: update.cpu_cores.map(|_| limits.nano_cpus()),
            };
            self.runtime
                .update_resources(&record.runtime_id, &live)
                .await?;
        }

        let owned = id.to_string();
        let updated = self
            .store
            .call(move |store| {
                store.update_limits(&owned, limits.cpu_cores, limits.memory_mb, limits.disk_mb)
            })
            .await
            .map_err(DockyardError::Store)?
            .ok_or_else(|| DockyardError::ContainerNotFound { id: id.to_string() })?;
        self.cache_put(&updated);
        info!(
            container_id = %id,
            cpu = limits.cpu_cores,
            memory_mb = limits.memory_mb,
            disk_mb = limits.disk_mb,
            "limits updated"
        );
        self.enrich(updated, true).await
    }

    pub async fn update_limits_with_task(
        &self,
        id: &str,
        update: LimitsUpdate,
        task_id: Option<String>,
    ) -> Result<ContainerListItem, DockyardError> {
        let task = self.tasks.get_or_create(task_id, TaskType::UpdateLimits);
        self.tasks.start(&task.id, "Updating resource limits");
        let result = self.update_limits(id, update).await;
        match &result {
            Ok(item) => {
                self.tasks.complete(
                    &task.id,
                    Some(serde_json::json!({
                        "container_id": item.container.id,
                        "cpu_limit": item.container.cpu_limit,
                        "memory_limit": item.container.memory_limit,
                        "disk_limit": item.container.disk_limit,
                    })),
                );
            }
            Err(e) => {
                self.tasks.fail(&task.id, e.to_string());
            }
        }
        result
    }
}

/// Bounds-check every present field. Returns the disk limit in MB.
fn validate_update(update: &LimitsUpdate) -> Result<Option<u64>, DockyardError> {
    if update.is_empty() {
        return Err(DockyardError::validation(
            "limits",
            "at least one of cpu_cores, memory_mb or disk_gb is required",
        ));
    }
    if let Some(cores) = update.cpu_cores {
        validate_cpu(cores)?;
    }
    if let Some(mb) = update.memory_mb {
        validate_memory(mb)?;
    }
    let disk_mb = match update.disk_gb {
        Some(gb) => {
            let mb = gb.checked_mul(1024).ok_or_else(|| {
                DockyardError::validation("disk_limit", format!("{} GB is out of range", gb))
            })?;
            validate_disk(mb)?;
            Some(mb)
        }
        None => None,
    };
    Ok(disk_mb)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use dockyard_common::ErrorKind;

    #[test]
    fn test_validate_update() {
        assert!(validate_update(&LimitsUpdate::default()).is_err());
        assert_eq!(
            validate_update(&LimitsUpdate {
                disk_gb: Some(20),
                ..Default::default()
            })
            .unwrap(),
            Some(20 * 1024)
        );
        assert!(validate_update(&LimitsUpdate {
            cpu_cores: Some(0.25),
            ..Default::default()
        })
        .is_err());
        assert!(validate_update(&LimitsUpdate {
            memory_mb: Some(65_536),
            ..Default::default()
        })
        .is_err());
        assert!(validate_update(&LimitsUpdate {
            disk_gb: Some(u64::MAX),
            ..Default::default()
        })
        .is_err());
    }

    #[tokio::test]
    async fn test_running_container_gets_live_update() {
        let h = harness();
        let record = h.orchestrator.create(request("live"), None).await.unwrap();
        h.orchestrator.start(&record.id).await.unwrap();

        let item = h
            .orchestrator
            .update_limits(
                &record.id,
                LimitsUpdate {
                    cpu_cores: Some(4.0),
                    memory_mb: Some(8192),
                    disk_gb: Some(50),
                },
            )
            .await
            .unwrap();
        assert_eq!(item.container.cpu_limit, 4.0);
        assert_eq!(item.container.memory_limit, 8192);
        assert_eq!(item.container.disk_limit, 50 * 1024);

        let containers = h.runtime.containers.lock().unwrap();
        let live = containers.get(&record.runtime_id).unwrap();
        assert_eq!(live.resources.nano_cpus, Some(4_000_000_000));
        assert_eq!(live.resources.memory_bytes, Some(8192 * 1024 * 1024));
    }

    #[tokio::test]
    async fn test_stopped_container_records_only() {
        let h = harness();
        let record = h.orchestrator.create(request("cold"), None).await.unwrap();
        let before = h.runtime.calls_matching("update ");
        let item = h
            .orchestrator
            .update_limits(
                &record.id,
                LimitsUpdate {
                    memory_mb: Some(1024),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(item.container.memory_limit, 1024);
        assert_eq!(item.container.cpu_limit, record.cpu_limit);
        assert_eq!(h.runtime.calls_matching("update "), before);
    }

    #[tokio::test]
    async fn test_disk_only_update_never_touches_runtime() {
        let h = harness();
        let record = h.orchestrator.create(request("disk"), None).await.unwrap();
        h.orchestrator.start(&record.id).await.unwrap();
        let before = h.runtime.calls_matching("update ");
        h.orchestrator
            .update_limits(
                &record.id,
                LimitsUpdate {
                    disk_gb: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(h.runtime.calls_matching("update "), before);
    }

    #[tokio::test]
    async fn test_invalid_or_unknown() {
        let h = harness();
        let err = h
            .orchestrator
            .update_limits("ghost", LimitsUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = h
            .orchestrator
            .update_limits_with_task(
                "ghost",
                LimitsUpdate {
                    cpu_cores: Some(1.0),
                    ..Default::default()
                },
                Some("t-lim".into()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            h.orchestrator.tasks().get("t-lim").unwrap().status,
            dockyard_common::TaskStatus::Failed
        );
    }
}
