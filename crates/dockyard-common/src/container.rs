use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DockyardError;
use crate::task::Task;

/// Prefix of the runtime id a record carries before its runtime object exists.
pub const PENDING_RUNTIME_PREFIX: &str = "pending:";

pub const MAX_NAME_LEN: usize = 64;

pub const MIN_CPU_CORES: f64 = 0.5;
pub const MAX_CPU_CORES: f64 = 16.0;
pub const MIN_MEMORY_MB: u64 = 512;
pub const MAX_MEMORY_MB: u64 = 32_768;
pub const MIN_DISK_MB: u64 = 1_024;
pub const MAX_DISK_MB: u64 = 102_400;

/// Key in `ContainerRecord::config` holding the id of the task driving creation.
pub const CONFIG_TASK_ID: &str = "taskId";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Creating,
    Stopped,
    Running,
    Restarting,
    Removing,
    Exited,
    Paused,
    Dead,
    Error,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Paused => "paused",
            Self::Dead => "dead",
            Self::Error => "error",
        }
    }

    /// Map a runtime-reported state string onto an engine status.
    ///
    /// Unknown states collapse to `Stopped`.
    pub fn from_runtime_state(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "created" => Self::Creating,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Stopped,
        }
    }

    /// Whether the runtime object is (or may be) executing processes.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::Restarting | Self::Paused)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "stopped" => Ok(Self::Stopped),
            "running" => Ok(Self::Running),
            "restarting" => Ok(Self::Restarting),
            "removing" => Ok(Self::Removing),
            "exited" => Ok(Self::Exited),
            "paused" => Ok(Self::Paused),
            "dead" => Ok(Self::Dead),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid container status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RepoType {
    #[default]
    Empty,
    Clone,
}

impl RepoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Clone => "clone",
        }
    }
}

impl FromStr for RepoType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "empty" => Ok(Self::Empty),
            "clone" => Ok(Self::Clone),
            _ => Err(format!("Invalid repo type: {}", s)),
        }
    }
}

/// How the bundled coding agent runs inside the container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    #[default]
    Interactive,
    Autonomous,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::Autonomous => "autonomous",
        }
    }
}

impl FromStr for AgentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interactive" => Ok(Self::Interactive),
            "autonomous" => Ok(Self::Autonomous),
            _ => Err(format!("Invalid agent mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_cores: 2.0,
            memory_mb: 2_048,
            disk_mb: 10_240,
        }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<(), DockyardError> {
        validate_cpu(self.cpu_cores)?;
        validate_memory(self.memory_mb)?;
        validate_disk(self.disk_mb)?;
        Ok(())
    }

    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_cores * 1_000_000_000.0).round() as i64
    }
}

pub fn validate_cpu(cores: f64) -> Result<(), DockyardError> {
    if !cores.is_finite() || !(MIN_CPU_CORES..=MAX_CPU_CORES).contains(&cores) {
        return Err(DockyardError::validation(
            "cpu_limit",
            format!(
                "{} cores is outside {}-{}",
                cores, MIN_CPU_CORES, MAX_CPU_CORES
            ),
        ));
    }
    Ok(())
}

pub fn validate_memory(mb: u64) -> Result<(), DockyardError> {
    if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&mb) {
        return Err(DockyardError::validation(
            "memory_limit",
            format!("{} MB is outside {}-{} MB", mb, MIN_MEMORY_MB, MAX_MEMORY_MB),
        ));
    }
    Ok(())
}

pub fn validate_disk(mb: u64) -> Result<(), DockyardError> {
    if !(MIN_DISK_MB..=MAX_DISK_MB).contains(&mb) {
        return Err(DockyardError::validation(
            "disk_limit",
            format!("{} MB is outside {}-{} MB", mb, MIN_DISK_MB, MAX_DISK_MB),
        ));
    }
    Ok(())
}

/// The durable row describing one development container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerRecord {
    pub id: String,
    pub runtime_id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub cpu_limit: f64,
    pub memory_limit: u64,
    pub disk_limit: u64,
    pub repo_type: RepoType,
    pub repo_url: Option<String>,
    pub template: String,
    pub mode: AgentMode,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl ContainerRecord {
    pub fn pending_runtime_id(id: &str) -> String {
        format!("{}{}", PENDING_RUNTIME_PREFIX, id)
    }

    /// True until the runtime has handed back a real object id.
    pub fn has_placeholder_runtime_id(&self) -> bool {
        self.runtime_id.starts_with(PENDING_RUNTIME_PREFIX)
    }

    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_cores: self.cpu_limit,
            memory_mb: self.memory_limit,
            disk_mb: self.disk_limit,
        }
    }

    /// Name of the runtime volume holding the container's workspace.
    pub fn workspace_volume(&self) -> String {
        workspace_volume_name(&self.id)
    }

    pub fn task_id(&self) -> Option<&str> {
        self.config.get(CONFIG_TASK_ID).and_then(|v| v.as_str())
    }
}

pub fn workspace_volume_name(id: &str) -> String {
    format!("dockyard-{}-workspace", id)
}

/// Partial resource-limit change. At least one field must be set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct LimitsUpdate {
    #[serde(default)]
    pub cpu_cores: Option<f64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub disk_gb: Option<u64>,
}

impl LimitsUpdate {
    pub fn is_empty(&self) -> bool {
        self.cpu_cores.is_none() && self.memory_mb.is_none() && self.disk_gb.is_none()
    }

    /// Whether any field can be applied to a live container.
    pub fn touches_live_resources(&self) -> bool {
        self.cpu_cores.is_some() || self.memory_mb.is_some()
    }
}

/// One sampled point of the metrics time series.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSample {
    pub container_id: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

/// A record enriched for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerListItem {
    #[serde(flatten)]
    pub container: ContainerRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_task: Option<Task>,
}
