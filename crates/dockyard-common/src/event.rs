use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::container::{ContainerStatus, MetricsSample};
use crate::task::{Task, TaskStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Created,
    Updated,
    Progress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskEventMeta {
    pub previous_status: Option<TaskStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEvent {
    pub event: TaskEventKind,
    pub task: Task,
    pub timestamp: DateTime<Utc>,
    pub meta: TaskEventMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerStatusEvent {
    pub container_id: String,
    pub status: ContainerStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CreationStage {
    Validating,
    Creating,
    Starting,
    Cloning,
    Configuring,
    Stopping,
    Saving,
    Ready,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreationProgress {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub stage: CreationStage,
    pub percentage: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything published on the Event Bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    Task(TaskEvent),
    ContainerStatus(ContainerStatusEvent),
    CreationProgress(CreationProgress),
    ContainerRemoved {
        container_id: String,
        timestamp: DateTime<Utc>,
    },
    Metrics(MetricsSample),
}

/// Subscription key on the Event Bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Container(String),
    Task(String),
}

impl Event {
    pub fn container_status(container_id: impl Into<String>, status: ContainerStatus) -> Self {
        Self::ContainerStatus(ContainerStatusEvent {
            container_id: container_id.into(),
            status,
            timestamp: Utc::now(),
        })
    }

    /// Topics this event is delivered to besides the global stream.
    pub fn topics(&self) -> Vec<Topic> {
        match self {
            Self::Task(e) => vec![Topic::Task(e.task.id.clone())],
            Self::ContainerStatus(e) => vec![Topic::Container(e.container_id.clone())],
            Self::CreationProgress(e) => {
                let mut topics = vec![Topic::Task(e.task_id.clone())];
                if let Some(id) = &e.container_id {
                    topics.push(Topic::Container(id.clone()));
                }
                topics
            }
            Self::ContainerRemoved { container_id, .. } => {
                vec![Topic::Container(container_id.clone())]
            }
            Self::Metrics(sample) => vec![Topic::Container(sample.container_id.clone())],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskType;

    #[test]
    fn test_event_is_tagged() {
        let event = Event::container_status("c1", ContainerStatus::Running);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ContainerStatus");
        assert_eq!(json["data"]["container_id"], "c1");
        assert_eq!(json["data"]["status"], "running");
    }

    #[test]
    fn test_creation_progress_topics() {
        let event = Event::CreationProgress(CreationProgress {
            task_id: "t1".into(),
            container_id: Some("c1".into()),
            stage: CreationStage::Cloning,
            percentage: 50,
            message: "Cloning".into(),
            error: None,
        });
        assert_eq!(
            event.topics(),
            vec![Topic::Task("t1".into()), Topic::Container("c1".into())]
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["data"]["stage"], "cloning");
        assert!(json["data"].get("error").is_none());
    }

    #[test]
    fn test_task_event_topic() {
        let event = Event::Task(TaskEvent {
            event: TaskEventKind::Created,
            task: Task::new("t9", TaskType::DeleteContainer),
            timestamp: Utc::now(),
            meta: TaskEventMeta::default(),
        });
        assert_eq!(event.topics(), vec![Topic::Task("t9".into())]);
    }
}
