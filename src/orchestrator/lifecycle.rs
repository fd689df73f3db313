//! Start, stop and restart.

use dockyard_common::{ContainerRecord, ContainerStatus, DockyardError, TaskType};
use serde_json::json;
use tracing::{debug, info};

use super::Orchestrator;
use crate::runtime::ResourceUpdate;

impl Orchestrator {
    pub async fn start(&self, id: &str) -> Result<ContainerRecord, DockyardError> {
        self.start_inner(id, None).await
    }

    /// `start` reporting milestones on a task: permission check, runtime
    /// connect, resource allocation, runtime start, readiness, persist.
    pub async fn start_with_task(
        &self,
        id: &str,
        task_id: Option<String>,
    ) -> Result<ContainerRecord, DockyardError> {
        let task = self.tasks.get_or_create(task_id, TaskType::StartContainer);
        self.tasks.start(&task.id, "Starting container");
        let result = self.start_inner(id, Some(&task.id)).await;
        self.finish_task(&task.id, &result);
        result
    }

    pub async fn stop(&self, id: &str) -> Result<ContainerRecord, DockyardError> {
        self.stop_inner(id, None).await
    }

    pub async fn stop_with_task(
        &self,
        id: &str,
        task_id: Option<String>,
    ) -> Result<ContainerRecord, DockyardError> {
        let task = self.tasks.get_or_create(task_id, TaskType::StopContainer);
        self.tasks.start(&task.id, "Stopping container");
        let result = self.stop_inner(id, Some(&task.id)).await;
        self.finish_task(&task.id, &result);
        result
    }

    /// Stop then start. Not atomic: a failed start leaves the container
    /// stopped, and reconciliation corrects any drift.
    pub async fn restart(&self, id: &str) -> Result<ContainerRecord, DockyardError> {
        self.stop_inner(id, None).await?;
        self.start_inner(id, None).await
    }

    pub async fn restart_with_task(
        &self,
        id: &str,
        task_id: Option<String>,
    ) -> Result<ContainerRecord, DockyardError> {
        let task = self.tasks.get_or_create(task_id, TaskType::RestartContainer);
        self.tasks.start(&task.id, "Restarting container");
        let result = async {
            self.stop_inner(id, None).await?;
            self.tasks.set_progress(&task.id, 50, "Stopped, starting again");
            self.start_inner(id, None).await
        }
        .await;
        self.finish_task(&task.id, &result);
        result
    }

    async fn start_inner(
        &self,
        id: &str,
        task_id: Option<&str>,
    ) -> Result<ContainerRecord, DockyardError> {
        self.milestone(task_id, 10, "Checking permissions");
        let record = self.require_idle(id).await?;

        self.milestone(task_id, 20, "Connecting to runtime");
        self.runtime.ping().await?;

        self.milestone(task_id, 35, "Allocating resources");
        let limits = record.limits();
        self.runtime
            .update_resources(
                &record.runtime_id,
                &ResourceUpdate {
                    memory_bytes: Some(limits.memory_bytes()),
                    nano_cpus: Some(limits.nano_cpus()),
                },
            )
            .await?;

        self.milestone(task_id, 60, "Starting container");
        self.runtime.start(&record.runtime_id).await?;

        self.milestone(task_id, 80, "Waiting for container to become ready");
        self.wait_ready(&record).await;

        self.milestone(task_id, 95, "Saving status");
        let record = self.set_status(id, ContainerStatus::Running).await?;
        info!(container_id = %id, runtime_id = %record.runtime_id, "container started");
        Ok(record)
    }

    async fn stop_inner(
        &self,
        id: &str,
        task_id: Option<&str>,
    ) -> Result<ContainerRecord, DockyardError> {
        self.milestone(task_id, 10, "Checking permissions");
        let record = self.require_idle(id).await?;

        self.milestone(task_id, 50, "Stopping container");
        let state = self.runtime.inspect_state(&record.runtime_id).await?;
        if ContainerStatus::from_runtime_state(&state).is_live() {
            self.runtime.stop(&record.runtime_id).await?;
        } else {
            debug!(container_id = %id, %state, "runtime object not running, skipping stop");
        }

        self.milestone(task_id, 95, "Saving status");
        let record = self.set_status(id, ContainerStatus::Stopped).await?;
        info!(container_id = %id, "container stopped");
        Ok(record)
    }

    pub(super) fn milestone(&self, task_id: Option<&str>, progress: u8, message: &str) {
        if let Some(task_id) = task_id {
            self.tasks.set_progress(task_id, progress, message);
        }
    }

    fn finish_task(&self, task_id: &str, result: &Result<ContainerRecord, DockyardError>) {
        match result {
            Ok(record) => {
                self.tasks.complete(
                    task_id,
                    Some(json!({ "container_id": record.id, "status": record.status })),
                );
            }
            Err(e) => {
                self.tasks.fail(task_id, e.to_string());
            }
        }
    }
}
