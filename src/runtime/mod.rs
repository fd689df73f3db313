//! Runtime Client Adapter.
//!
//! A thin typed façade over the container runtime. It never holds
//! orchestration state: the orchestrator decides *what* to call, this layer
//! only knows *how*.

pub mod docker;
#[cfg(test)]
pub mod fake;

use std::collections::HashMap;

use async_trait::async_trait;
use dockyard_common::DockyardError;
use thiserror::Error;

pub use docker::DockerRuntime;

/// Label marking a runtime object as managed by this engine.
pub const LABEL_MANAGED: &str = "dockyard.managed";
pub const LABEL_ID: &str = "dockyard.id";
pub const LABEL_NAME: &str = "dockyard.name";
pub const LABEL_TEMPLATE: &str = "dockyard.template";
pub const LABEL_CPU: &str = "dockyard.cpu";
pub const LABEL_MEMORY_MB: &str = "dockyard.memory_mb";
pub const LABEL_DISK_MB: &str = "dockyard.disk_mb";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Runtime object {id} not found")]
    NotFound { id: String },

    #[error("Runtime {operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },

    #[error("Failed to connect to container runtime: {0}")]
    Connect(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<RuntimeError> for DockyardError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Api { operation, message } => DockyardError::runtime(operation, message),
            RuntimeError::NotFound { id } => {
                DockyardError::runtime("lookup", format!("object {} not found", id))
            }
            RuntimeError::Connect(message) => DockyardError::runtime("connect", message),
        }
    }
}

/// Everything needed to create one runtime object.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub cmd: Option<Vec<String>>,
    pub working_dir: Option<String>,
    /// `volume:/path` style bindings.
    pub binds: Vec<String>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    /// Filesystem quota; only honoured by storage drivers that support it.
    pub disk_quota_mb: Option<u64>,
    pub network: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub env: Vec<String>,
}

impl ExecOptions {
    pub fn as_user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One entry of a runtime listing.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeContainer {
    pub id: String,
    pub name: String,
    pub state: String,
    pub labels: HashMap<String, String>,
}

impl RuntimeContainer {
    pub fn is_managed(&self) -> bool {
        self.labels.get(LABEL_MANAGED).map(String::as_str) == Some("true")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUpdate {
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
}

/// A push notification from the runtime (start, die, stop, destroy, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeEvent {
    pub runtime_id: String,
    pub action: String,
}

/// Abstraction over the container runtime for testability.
/// Real implementation: `DockerRuntime`. Test double: `FakeRuntime`.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Create a runtime object and return its runtime-assigned id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError>;

    async fn exec(
        &self,
        id: &str,
        argv: &[String],
        opts: &ExecOptions,
    ) -> Result<ExecOutput, RuntimeError>;

    async fn list(&self, all: bool) -> Result<Vec<RuntimeContainer>, RuntimeError>;

    async fn update_resources(&self, id: &str, update: &ResourceUpdate)
    -> Result<(), RuntimeError>;

    /// One raw stats snapshot, as reported by the runtime.
    async fn stats(&self, id: &str) -> Result<serde_json::Value, RuntimeError>;

    /// Current runtime state string (`running`, `exited`, ...).
    async fn inspect_state(&self, id: &str) -> Result<String, RuntimeError>;
}

/// Build a `sh -c` argv.
pub fn shell(command: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), command.to_string()]
}
