use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    container::LogOutput,
    errors::Error as BollardError,
    exec::{StartExecOptions, StartExecResults},
    models::{ContainerCreateBody, ContainerUpdateBody, EventMessage, ExecConfig, HostConfig},
    query_parameters::{
        CreateContainerOptionsBuilder, EventsOptionsBuilder, InspectContainerOptions,
        ListContainersOptionsBuilder, RemoveContainerOptionsBuilder, RemoveVolumeOptionsBuilder,
        StartContainerOptions, StatsOptionsBuilder, StopContainerOptionsBuilder,
    },
};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    ContainerSpec, ExecOptions, ExecOutput, LABEL_MANAGED, ResourceUpdate, RuntimeClient,
    RuntimeContainer, RuntimeError, RuntimeEvent,
};

const CONNECT_TIMEOUT_SECS: u64 = 120;

const EVENT_RETRY_BASE: Duration = Duration::from_secs(1);
const EVENT_RETRY_MAX: Duration = Duration::from_secs(30);

/// Runtime actions worth forwarding to the orchestrator.
const FORWARDED_ACTIONS: &[&str] = &["start", "die", "stop", "pause", "unpause", "destroy"];

/// `RuntimeClient` backed by a Docker-compatible engine through bollard.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    stop_timeout_secs: i32,
}

impl DockerRuntime {
    /// Connect to `host` (`unix://`, `tcp://`, `http://`), or the local
    /// defaults when `None`.
    pub fn connect(host: Option<&str>, stop_timeout_secs: i32) -> Result<Self, RuntimeError> {
        let docker = match host {
            None => Docker::connect_with_local_defaults(),
            Some(h) if h.starts_with("unix://") => {
                Docker::connect_with_socket(h, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(h) => Docker::connect_with_http(h, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION),
        }
        .map_err(|e| RuntimeError::Connect(e.to_string()))?;
        Ok(Self {
            docker,
            stop_timeout_secs,
        })
    }

    /// Stream runtime events for managed containers into `tx` until the
    /// receiver is dropped. A failed or closed stream is reopened after an
    /// exponential delay, so forwarding survives a daemon restart.
    pub fn spawn_event_stream(&self, tx: mpsc::Sender<RuntimeEvent>) -> tokio::task::JoinHandle<()> {
        let docker = self.docker.clone();
        tokio::spawn(async move {
            let mut filters: HashMap<String, Vec<String>> = HashMap::new();
            filters.insert("type".to_string(), vec!["container".to_string()]);
            filters.insert("label".to_string(), vec![format!("{}=true", LABEL_MANAGED)]);
            let mut failures: u32 = 0;

            loop {
                let options = EventsOptionsBuilder::new().filters(&filters).build();
                let mut stream = docker.events(Some(options));

                while let Some(item) = stream.next().await {
                    let message = match item {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(error = %e, "runtime event stream error");
                            break;
                        }
                    };
                    failures = 0;
                    let Some(event) = forwarded_event(message) else {
                        continue;
                    };
                    debug!(runtime_id = %event.runtime_id, action = %event.action, "runtime event");
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }

                if tx.is_closed() {
                    return;
                }
                let delay = reconnect_delay(failures);
                failures = failures.saturating_add(1);
                info!(delay_ms = delay.as_millis() as u64, "reopening runtime event stream");
                tokio::time::sleep(delay).await;
            }
        })
    }
}

/// Delay before the `failures`-th consecutive reconnect attempt.
fn reconnect_delay(failures: u32) -> Duration {
    let factor = 1u64 << failures.min(16);
    EVENT_RETRY_BASE
        .saturating_mul(factor as u32)
        .min(EVENT_RETRY_MAX)
}

/// Keep lifecycle actions on containers; drop exec noise and the rest.
fn forwarded_event(message: EventMessage) -> Option<RuntimeEvent> {
    let action = message.action?;
    // Actions like "exec_start: sh -c ..." carry a suffix.
    let action = action.split(':').next().unwrap_or_default().to_string();
    if !FORWARDED_ACTIONS.contains(&action.as_str()) {
        return None;
    }
    let runtime_id = message.actor.and_then(|a| a.id)?;
    Some(RuntimeEvent { runtime_id, action })
}

fn is_not_found_error(error: &BollardError) -> bool {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => *status_code == 404,
        _ => false,
    }
}

/// Docker answers 304 when the object is already in the requested state.
fn is_not_modified(error: &BollardError) -> bool {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => *status_code == 304,
        _ => false,
    }
}

fn api_error(operation: &'static str, id: &str, error: BollardError) -> RuntimeError {
    if is_not_found_error(&error) {
        RuntimeError::NotFound { id: id.to_string() }
    } else {
        RuntimeError::Api {
            operation,
            message: error.to_string(),
        }
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Connect(e.to_string()))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let storage_opt = spec.disk_quota_mb.map(|mb| {
            let mut opts = HashMap::new();
            opts.insert("size".to_string(), format!("{}M", mb));
            opts
        });

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            labels: Some(spec.labels.clone()),
            cmd: spec.cmd.clone(),
            working_dir: spec.working_dir.clone(),
            tty: Some(true),
            host_config: Some(HostConfig {
                binds: if spec.binds.is_empty() {
                    None
                } else {
                    Some(spec.binds.clone())
                },
                memory: Some(spec.memory_bytes),
                memory_swap: Some(spec.memory_bytes),
                nano_cpus: Some(spec.nano_cpus),
                storage_opt,
                network_mode: spec.network.clone(),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                body,
            )
            .await
            .map_err(|e| api_error("create", &spec.name, e))?;

        for warning in &response.warnings {
            warn!(name = %spec.name, %warning, "runtime create warning");
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(api_error("start", id, e)),
        }
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        let options = StopContainerOptionsBuilder::new()
            .t(self.stop_timeout_secs)
            .build();
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(api_error("stop", id, e)),
        }
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::new()
            .force(force)
            .v(false)
            .build();
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| api_error("remove", id, e))
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let options = RemoveVolumeOptionsBuilder::new().force(true).build();
        self.docker
            .remove_volume(name, Some(options))
            .await
            .map_err(|e| api_error("remove_volume", name, e))
    }

    async fn exec(
        &self,
        id: &str,
        argv: &[String],
        opts: &ExecOptions,
    ) -> Result<ExecOutput, RuntimeError> {
        let config = ExecConfig {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(argv.to_vec()),
            user: opts.user.clone(),
            working_dir: opts.working_dir.clone(),
            env: if opts.env.is_empty() {
                None
            } else {
                Some(opts.env.clone())
            },
            ..ExecConfig::default()
        };

        let exec = self
            .docker
            .create_exec(id, config)
            .await
            .map_err(|e| api_error("exec", id, e))?;

        let mut output = ExecOutput::default();
        match self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| api_error("exec", id, e))?
        {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    match chunk.map_err(|e| api_error("exec", id, e))? {
                        LogOutput::StdErr { message } => {
                            output.stderr.push_str(&String::from_utf8_lossy(&message))
                        }
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            output.stdout.push_str(&String::from_utf8_lossy(&message))
                        }
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| api_error("exec", id, e))?;
        output.exit_code = inspect.exit_code.unwrap_or(-1);
        Ok(output)
    }

    async fn list(&self, all: bool) -> Result<Vec<RuntimeContainer>, RuntimeError> {
        let options = ListContainersOptionsBuilder::new().all(all).build();
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| api_error("list", "*", e))?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                Some(RuntimeContainer {
                    id,
                    name,
                    state: summary.state.map(|s| s.to_string()).unwrap_or_default(),
                    labels: summary.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn update_resources(
        &self,
        id: &str,
        update: &ResourceUpdate,
    ) -> Result<(), RuntimeError> {
        let body = ContainerUpdateBody {
            memory: update.memory_bytes,
            memory_swap: update.memory_bytes,
            nano_cpus: update.nano_cpus,
            ..ContainerUpdateBody::default()
        };
        self.docker
            .update_container(id, body)
            .await
            .map_err(|e| api_error("update", id, e))
    }

    async fn stats(&self, id: &str) -> Result<serde_json::Value, RuntimeError> {
        let options = StatsOptionsBuilder::new().stream(false).one_shot(false).build();
        let mut stream = self.docker.stats(id, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => serde_json::to_value(&stats).map_err(|e| RuntimeError::Api {
                operation: "stats",
                message: e.to_string(),
            }),
            Some(Err(e)) => Err(api_error("stats", id, e)),
            None => Err(RuntimeError::Api {
                operation: "stats",
                message: "empty stats stream".to_string(),
            }),
        }
    }

    async fn inspect_state(&self, id: &str) -> Result<String, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| api_error("inspect", id, e))?;
        Ok(inspect
            .state
            .and_then(|s| s.status)
            .map(|s| s.to_string())
            .unwrap_or_default())
    }
}
