use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    CreateContainer,
    StartContainer,
    StopContainer,
    RestartContainer,
    DeleteContainer,
    UpdateLimits,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateContainer => "create-container",
            Self::StartContainer => "start-container",
            Self::StopContainer => "stop-container",
            Self::RestartContainer => "restart-container",
            Self::DeleteContainer => "delete-container",
            Self::UpdateLimits => "update-limits",
        }
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create-container" => Ok(Self::CreateContainer),
            "start-container" => Ok(Self::StartContainer),
            "stop-container" => Ok(Self::StopContainer),
            "restart-container" => Ok(Self::RestartContainer),
            "delete-container" => Ok(Self::DeleteContainer),
            "update-limits" => Ok(Self::UpdateLimits),
            _ => Err(format!("Invalid task type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Progress-reporting handle for one asynchronous lifecycle operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, task_type: TaskType) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            task_type,
            status: TaskStatus::Pending,
            progress: 0,
            message: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Partial task mutation. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl TaskUpdate {
    pub fn progress(progress: u8, message: impl Into<String>) -> Self {
        Self {
            progress: Some(progress),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Apply onto `task`, stamping lifecycle timestamps on status transitions.
    pub fn apply(self, task: &mut Task, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            if status == TaskStatus::Running && task.started_at.is_none() {
                task.started_at = Some(now);
            }
            if status.is_terminal() {
                task.completed_at = Some(now);
            }
            task.status = status;
        }
        if let Some(progress) = self.progress {
            task.progress = progress.min(100);
        }
        if let Some(message) = self.message {
            task.message = Some(message);
        }
        if let Some(result) = self.result {
            task.result = Some(result);
        }
        if let Some(error) = self.error {
            task.error = Some(error);
        }
        task.updated_at = now;
    }
}
