//! Idempotent, lock-serialized container deletion.

use dockyard_common::{ContainerStatus, DockyardError, TaskType};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::Orchestrator;
use super::locks::Acquire;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DeleteOutcome {
    pub already_deleted: bool,
}

impl Orchestrator {
    /// Remove a container and everything it owns. Deleting an unknown id
    /// succeeds with `already_deleted`. Concurrent calls for the same id
    /// share one removal sequence and its outcome.
    pub async fn delete(&self, id: &str, force: bool) -> Result<DeleteOutcome, DockyardError> {
        self.delete_inner(id, force, None).await
    }

    pub async fn delete_with_task(
        &self,
        id: &str,
        task_id: Option<String>,
        force: bool,
    ) -> Result<DeleteOutcome, DockyardError> {
        let task = self.tasks.get_or_create(task_id, TaskType::DeleteContainer);
        self.tasks.start(&task.id, "Deleting container");
        let result = self.delete_inner(id, force, Some(&task.id)).await;
        match &result {
            Ok(outcome) => {
                self.tasks.complete(
                    &task.id,
                    Some(json!({ "alreadyDeleted": outcome.already_deleted })),
                );
            }
            Err(e) => {
                self.tasks.fail(&task.id, e.to_string());
            }
        }
        result
    }

    async fn delete_inner(
        &self,
        id: &str,
        force: bool,
        task_id: Option<&str>,
    ) -> Result<DeleteOutcome, DockyardError> {
        let guard = match self.locks.acquire(id) {
            Acquire::Owner(guard) => guard,
            Acquire::Waiter(waiter) => {
                debug!(container_id = %id, "delete already in flight, waiting for it");
                return match waiter.outcome().await {
                    Some(Ok(already_deleted)) => Ok(DeleteOutcome { already_deleted }),
                    Some(Err(message)) => Err(DockyardError::runtime("delete", message)),
                    None => Err(DockyardError::OperationInProgress { id: id.to_string() }),
                };
            }
        };

        let result = self.remove_locked(id, force, task_id).await;
        guard.finish(match &result {
            Ok(outcome) => Ok(outcome.already_deleted),
            Err(e) => Err(e.to_string()),
        });
        result
    }

    async fn remove_locked(
        &self,
        id: &str,
        force: bool,
        task_id: Option<&str>,
    ) -> Result<DeleteOutcome, DockyardError> {
        let Some(record) = self.load(id).await? else {
            return Ok(DeleteOutcome {
                already_deleted: true,
            });
        };
        let was_running = record.status == ContainerStatus::Running;

        self.milestone(task_id, 10, "Marking container for removal");
        self.set_status(id, ContainerStatus::Removing).await?;

        self.milestone(task_id, 20, "Closing sessions");
        let closed = self.sessions.close_sessions(id).await;
        if closed > 0 {
            debug!(container_id = %id, closed, "closed sessions");
        }

        if !record.has_placeholder_runtime_id() {
            if was_running && !force {
                self.milestone(task_id, 40, "Stopping container");
                if let Err(e) = self.runtime.stop(&record.runtime_id).await {
                    warn!(container_id = %id, error = %e, "graceful stop failed, forcing removal");
                }
            }

            self.milestone(task_id, 60, "Removing container");
            match self.runtime.remove(&record.runtime_id, true).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(container_id = %id, "runtime container already gone");
                }
                Err(e) => {
                    warn!(container_id = %id, error = %e, "runtime remove failed, parking record as error");
                    if let Err(park) = self.set_status(id, ContainerStatus::Error).await {
                        warn!(container_id = %id, error = %park, "failed to park record");
                    }
                    return Err(e.into());
                }
            }

            self.milestone(task_id, 75, "Removing workspace volume");
            if let Err(e) = self.runtime.remove_volume(&record.workspace_volume()).await
                && !e.is_not_found()
            {
                warn!(container_id = %id, error = %e, "failed to remove workspace volume");
            }
        }

        self.milestone(task_id, 90, "Deleting record");
        self.forget(id).await?;
        info!(container_id = %id, name = %record.name, "container deleted");
        Ok(DeleteOutcome {
            already_deleted: false,
        })
    }
}
