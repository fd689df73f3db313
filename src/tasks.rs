//! Task Tracker: in-memory registry of short-lived lifecycle operations.
//!
//! Every mutation is broadcast on the Event Bus under the task's topic.
//! Tasks are reaped once their `created_at` falls outside the retention
//! window, whatever their status; observers must not rely on a task
//! outliving it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dockyard_common::{
    Event, Task, TaskEvent, TaskEventKind, TaskEventMeta, TaskStatus, TaskType, TaskUpdate,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::EventBus;

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
pub struct TaskTracker {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
    events: EventBus,
    retention: Duration,
}

impl TaskTracker {
    pub fn new(events: EventBus, retention: Duration) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            events,
            retention,
        }
    }

    pub fn create(&self, task_type: TaskType) -> Task {
        self.create_with_id(Uuid::new_v4().to_string(), task_type)
    }

    /// Register a task under a caller-chosen id (clients pre-allocate ids so
    /// they can subscribe before issuing the request). An existing task with
    /// the same id is replaced.
    pub fn create_with_id(&self, id: impl Into<String>, task_type: TaskType) -> Task {
        let task = Task::new(id, task_type);
        match self.tasks.write() {
            Ok(mut tasks) => {
                tasks.insert(task.id.clone(), task.clone());
            }
            Err(e) => warn!(error = %e, "task registry lock poisoned"),
        }
        self.emit(TaskEventKind::Created, &task, None);
        task
    }

    /// Reuse `id` if it names a live task, otherwise register a new one.
    pub fn get_or_create(&self, id: Option<String>, task_type: TaskType) -> Task {
        match id {
            Some(id) => self
                .get(&id)
                .unwrap_or_else(|| self.create_with_id(id, task_type)),
            None => self.create(task_type),
        }
    }

    pub fn update(&self, id: &str, update: TaskUpdate) -> Option<Task> {
        let now = Utc::now();
        let progress_only = update.status.is_none()
            && update.progress.is_some()
            && update.result.is_none()
            && update.error.is_none();

        let (task, previous) = {
            let mut tasks = match self.tasks.write() {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(error = %e, "task registry lock poisoned");
                    return None;
                }
            };
            let task = tasks.get_mut(id)?;
            let previous = task.status;
            update.apply(task, now);
            (task.clone(), previous)
        };

        let kind = match task.status {
            TaskStatus::Completed if previous != TaskStatus::Completed => TaskEventKind::Completed,
            TaskStatus::Failed if previous != TaskStatus::Failed => TaskEventKind::Failed,
            _ if progress_only => TaskEventKind::Progress,
            _ => TaskEventKind::Updated,
        };
        self.emit(kind, &task, Some(previous));
        Some(task)
    }

    pub fn start(&self, id: &str, message: impl Into<String>) -> Option<Task> {
        self.update(
            id,
            TaskUpdate {
                status: Some(TaskStatus::Running),
                message: Some(message.into()),
                ..Default::default()
            },
        )
    }

    pub fn set_progress(&self, id: &str, progress: u8, message: impl Into<String>) -> Option<Task> {
        self.update(id, TaskUpdate::progress(progress, message))
    }

    pub fn complete(&self, id: &str, result: Option<serde_json::Value>) -> Option<Task> {
        self.update(
            id,
            TaskUpdate {
                status: Some(TaskStatus::Completed),
                progress: Some(100),
                message: Some("Completed".to_string()),
                result,
                ..Default::default()
            },
        )
    }

    pub fn fail(&self, id: &str, error: impl Into<String>) -> Option<Task> {
        let error = error.into();
        self.update(
            id,
            TaskUpdate {
                status: Some(TaskStatus::Failed),
                message: Some(format!("Failed: {}", error)),
                error: Some(error),
                ..Default::default()
            },
        )
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().ok()?.get(id).cloned()
    }

    /// All tracked tasks, newest first.
    pub fn get_all(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = match self.tasks.read() {
            Ok(tasks) => tasks.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    pub fn delete(&self, id: &str) -> bool {
        self.tasks
            .write()
            .map(|mut tasks| tasks.remove(id).is_some())
            .unwrap_or(false)
    }

    /// Remove tasks created before `now - retention`. Returns how many went.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return 0;
        };
        let cutoff = now - retention;
        let Ok(mut tasks) = self.tasks.write() else {
            return 0;
        };
        let before = tasks.len();
        tasks.retain(|_, task| task.created_at >= cutoff);
        before - tasks.len()
    }

    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = tracker.sweep_expired(Utc::now());
                if removed > 0 {
                    debug!(removed, "swept expired tasks");
                }
            }
        })
    }

    fn emit(&self, kind: TaskEventKind, task: &Task, previous: Option<TaskStatus>) {
        self.events.publish(Event::Task(TaskEvent {
            event: kind,
            task: task.clone(),
            timestamp: Utc::now(),
            meta: TaskEventMeta {
                previous_status: previous,
            },
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_common::Topic;

    fn tracker() -> (TaskTracker, EventBus) {
        let bus = EventBus::new(64);
        (TaskTracker::new(bus.clone(), DEFAULT_RETENTION), bus)
    }

    #[test]
    fn test_create_and_get() {
        let (tracker, _) = tracker();
        let task = tracker.create(TaskType::CreateContainer);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(tracker.get(&task.id).unwrap().id, task.id);
        assert_eq!(tracker.get_all().len(), 1);
    }

    #[tokio::test]
    async fn test_mutations_publish_typed_events() {
        let (tracker, bus) = tracker();
        let mut rx = bus.subscribe(Topic::Task("t1".into()));
        tracker.create_with_id("t1", TaskType::StartContainer);
        tracker.start("t1", "Starting");
        tracker.set_progress("t1", 40, "Halfway");
        tracker.complete("t1", Some(serde_json::json!({"ok": true})));

        let mut kinds = Vec::new();
        while let Ok(Event::Task(e)) = rx.try_recv() {
            kinds.push((e.event, e.meta.previous_status));
        }
        assert_eq!(
            kinds,
            vec![
                (TaskEventKind::Created, None),
                (TaskEventKind::Updated, Some(TaskStatus::Pending)),
                (TaskEventKind::Progress, Some(TaskStatus::Running)),
                (TaskEventKind::Completed, Some(TaskStatus::Running)),
            ]
        );
        let done = tracker.get("t1").unwrap();
        assert_eq!(done.progress, 100);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn test_fail_records_error() {
        let (tracker, _) = tracker();
        let task = tracker.create(TaskType::DeleteContainer);
        let failed = tracker.fail(&task.id, "runtime unreachable").unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("runtime unreachable"));
    }

    #[test]
    fn test_update_unknown_task_is_none() {
        let (tracker, _) = tracker();
        assert!(tracker.set_progress("ghost", 10, "x").is_none());
        assert!(!tracker.delete("ghost"));
    }

    #[test]
    fn test_get_or_create_reuses_existing() {
        let (tracker, _) = tracker();
        let task = tracker.create_with_id("given", TaskType::CreateContainer);
        tracker.set_progress("given", 30, "busy");
        let reused = tracker.get_or_create(Some("given".into()), TaskType::CreateContainer);
        assert_eq!(reused.id, task.id);
        assert_eq!(reused.progress, 30);

        let fresh = tracker.get_or_create(Some("new-id".into()), TaskType::StartContainer);
        assert_eq!(fresh.id, "new-id");
        assert_eq!(fresh.task_type, TaskType::StartContainer);
    }

    #[test]
    fn test_sweep_removes_old_tasks_regardless_of_status() {
        let (tracker, _) = tracker();
        let running = tracker.create(TaskType::CreateContainer);
        tracker.start(&running.id, "working");
        let done = tracker.create(TaskType::DeleteContainer);
        tracker.complete(&done.id, None);

        assert_eq!(tracker.sweep_expired(Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::minutes(61);
        assert_eq!(tracker.sweep_expired(later), 2);
        assert!(tracker.get_all().is_empty());
    }
}
