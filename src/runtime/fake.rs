//! In-memory `RuntimeClient` used by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    ContainerSpec, ExecOptions, ExecOutput, ResourceUpdate, RuntimeClient, RuntimeContainer,
    RuntimeError,
};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub state: String,
    pub resources: ResourceUpdate,
}

#[derive(Default)]
pub struct FakeRuntime {
    next_id: AtomicU64,
    pub containers: Mutex<HashMap<String, FakeContainer>>,
    pub volumes_removed: Mutex<Vec<String>>,
    pub calls: Mutex<Vec<String>>,
    /// Operations (`create`, `start`, `stop`, `remove`, `exec`, `list`, ...) that fail.
    failing: Mutex<HashSet<&'static str>>,
    /// Exec commands whose joined argv contains the key exit with the value.
    exit_codes: Mutex<Vec<(String, i64)>>,
    remove_delay: Mutex<Option<Duration>>,
    stats: Mutex<Option<serde_json::Value>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn exit_code_for(&self, pattern: &str, code: i64) {
        self.exit_codes
            .lock()
            .unwrap()
            .push((pattern.to_string(), code));
    }

    pub fn delay_remove(&self, delay: Duration) {
        *self.remove_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_stats(&self, stats: serde_json::Value) {
        *self.stats.lock().unwrap() = Some(stats);
    }

    /// Insert a runtime object directly, bypassing `create`.
    pub fn insert(&self, id: &str, name: &str, state: &str, labels: HashMap<String, String>) {
        let spec = ContainerSpec {
            name: name.to_string(),
            labels,
            ..Default::default()
        };
        self.containers.lock().unwrap().insert(
            id.to_string(),
            FakeContainer {
                spec,
                state: state.to_string(),
                resources: ResourceUpdate::default(),
            },
        );
    }

    pub fn state_of(&self, id: &str) -> Option<String> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .map(|c| c.state.clone())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.containers.lock().unwrap().contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn exec_log(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| c.strip_prefix("exec ").map(str::to_string))
            .collect()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, operation: &'static str) -> Result<(), RuntimeError> {
        if self.failing.lock().unwrap().contains(operation) {
            return Err(RuntimeError::Api {
                operation,
                message: format!("injected {} failure", operation),
            });
        }
        Ok(())
    }

    fn set_state(&self, id: &str, state: &str) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound { id: id.to_string() })?;
        container.state = state.to_string();
        Ok(())
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.check("ping")
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.record(format!("create {}", spec.name));
        self.check("create")?;
        let id = format!("rt-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                state: "created".to_string(),
                resources: ResourceUpdate {
                    memory_bytes: Some(spec.memory_bytes),
                    nano_cpus: Some(spec.nano_cpus),
                },
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(format!("start {}", id));
        self.check("start")?;
        self.set_state(id, "running")
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(format!("stop {}", id));
        self.check("stop")?;
        self.set_state(id, "exited")
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        self.record(format!("remove {} force={}", id, force));
        let delay = *self.remove_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check("remove")?;
        match self.containers.lock().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound { id: id.to_string() }),
        }
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(format!("remove_volume {}", name));
        self.check("remove_volume")?;
        self.volumes_removed.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        argv: &[String],
        _opts: &ExecOptions,
    ) -> Result<ExecOutput, RuntimeError> {
        let joined = argv.join(" ");
        self.record(format!("exec {}", joined));
        self.check("exec")?;
        match self.state_of(id).as_deref() {
            Some("running") => {}
            Some(_) => {
                return Err(RuntimeError::Api {
                    operation: "exec",
                    message: format!("container {} is not running", id),
                });
            }
            None => return Err(RuntimeError::NotFound { id: id.to_string() }),
        }
        let exit_code = self
            .exit_codes
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| joined.contains(pattern.as_str()))
            .map(|(_, code)| *code)
            .unwrap_or(0);
        Ok(ExecOutput {
            stdout: String::new(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                "command failed".to_string()
            },
            exit_code,
        })
    }

    async fn list(&self, _all: bool) -> Result<Vec<RuntimeContainer>, RuntimeError> {
        self.check("list")?;
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, c)| RuntimeContainer {
                id: id.clone(),
                name: c.spec.name.clone(),
                state: c.state.clone(),
                labels: c.spec.labels.clone(),
            })
            .collect())
    }

    async fn update_resources(
        &self,
        id: &str,
        update: &ResourceUpdate,
    ) -> Result<(), RuntimeError> {
        self.record(format!("update {}", id));
        self.check("update")?;
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound { id: id.to_string() })?;
        if update.memory_bytes.is_some() {
            container.resources.memory_bytes = update.memory_bytes;
        }
        if update.nano_cpus.is_some() {
            container.resources.nano_cpus = update.nano_cpus;
        }
        Ok(())
    }

    async fn stats(&self, id: &str) -> Result<serde_json::Value, RuntimeError> {
        self.check("stats")?;
        if !self.exists(id) {
            return Err(RuntimeError::NotFound { id: id.to_string() });
        }
        Ok(self
            .stats
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| serde_json::json!({})))
    }

    async fn inspect_state(&self, id: &str) -> Result<String, RuntimeError> {
        self.check("inspect")?;
        self.state_of(id)
            .ok_or_else(|| RuntimeError::NotFound { id: id.to_string() })
    }
}
