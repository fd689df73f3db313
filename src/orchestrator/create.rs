//! Container creation workflow.
//!
//! Validation, the name check and the record insert run before the caller
//! gets an answer; provisioning (runtime create, optional clone and tooling
//! setup) may run in the background. Any provisioning failure rolls back the
//! runtime object, its workspace volume and the record.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dockyard_common::{
    AgentMode, CONFIG_TASK_ID, ContainerRecord, ContainerStatus, CreationProgress, CreationStage,
    DockyardError, Event, RepoType, ResourceLimits, Task, TaskType,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::{Orchestrator, conflict_or_store};
use crate::config::TemplateConfig;
use crate::runtime::{
    ContainerSpec, ExecOptions, LABEL_CPU, LABEL_DISK_MB, LABEL_ID, LABEL_MANAGED,
    LABEL_MEMORY_MB, LABEL_NAME, LABEL_TEMPLATE, shell,
};
use crate::sanitize::{sanitize_name, sanitize_repo_url};

/// Prefix of runtime object names.
pub const RUNTIME_NAME_PREFIX: &str = "dockyard-";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateContainerRequest {
    pub name: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub mode: AgentMode,
    /// Cores.
    #[serde(default)]
    pub cpu_limit: Option<f64>,
    /// MB.
    #[serde(default)]
    pub memory_limit: Option<u64>,
    /// MB.
    #[serde(default)]
    pub disk_limit: Option<u64>,
    #[serde(default)]
    pub repo_type: RepoType,
    #[serde(default)]
    pub repo_url: Option<String>,
}

/// Returned by `create_async` before provisioning finishes.
#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    pub task: Task,
    pub container: ContainerRecord,
}

/// A tooling command that exited non-zero. Recorded, never fatal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetupFailure {
    pub command: String,
    pub exit_code: i64,
    pub stderr: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SetupReport {
    pub performed: bool,
    pub exec_ready: bool,
    pub cloned: bool,
    pub commands_run: usize,
    pub failures: Vec<SetupFailure>,
}

/// Everything the background half of the workflow needs.
struct Prepared {
    record: ContainerRecord,
    template: TemplateConfig,
    task_id: String,
}

impl Orchestrator {
    /// Run the whole workflow and return the final (`stopped`) record.
    pub async fn create(
        &self,
        request: CreateContainerRequest,
        task_id: Option<String>,
    ) -> Result<ContainerRecord, DockyardError> {
        let prepared = self.prepare_create(request, task_id).await?;
        self.provision(prepared).await
    }

    /// Validate and insert the `creating` record, then provision in the
    /// background. Validation and name conflicts are returned directly.
    pub async fn create_async(
        self: &Arc<Self>,
        request: CreateContainerRequest,
        task_id: Option<String>,
    ) -> Result<CreateOutcome, DockyardError> {
        let prepared = self.prepare_create(request, task_id).await?;
        let container = prepared.record.clone();
        let task_id = prepared.task_id.clone();
        let task = self
            .tasks
            .get(&task_id)
            .ok_or_else(|| DockyardError::TaskNotFound { id: task_id.clone() })?;

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.provision(prepared).await {
                warn!(task_id = %task_id, error = %e, "background create failed");
            }
        });

        Ok(CreateOutcome { task, container })
    }

    // ── Steps 1-3 ────────────────────────────────────────────────────

    async fn prepare_create(
        &self,
        request: CreateContainerRequest,
        task_id: Option<String>,
    ) -> Result<Prepared, DockyardError> {
        let task = self.tasks.get_or_create(task_id, TaskType::CreateContainer);
        self.tasks.start(&task.id, "Validating request");
        self.report(&task.id, None, CreationStage::Validating, 5, "Validating request");

        match self.validate_and_reserve(request, &task.id).await {
            Ok(prepared) => Ok(prepared),
            Err(e) => {
                self.tasks.fail(&task.id, e.to_string());
                self.report_error(&task.id, None, &e);
                Err(e)
            }
        }
    }

    async fn validate_and_reserve(
        &self,
        request: CreateContainerRequest,
        task_id: &str,
    ) -> Result<Prepared, DockyardError> {
        let name = sanitize_name(&request.name)?;
        let repo_url = match request.repo_type {
            RepoType::Clone => {
                let raw = request.repo_url.as_deref().ok_or_else(|| {
                    DockyardError::validation("repo_url", "required when repo_type is clone")
                })?;
                Some(sanitize_repo_url(raw, &self.settings.allowed_git_hosts)?)
            }
            RepoType::Empty => None,
        };
        let defaults = ResourceLimits::default();
        let limits = ResourceLimits {
            cpu_cores: request.cpu_limit.unwrap_or(defaults.cpu_cores),
            memory_mb: request.memory_limit.unwrap_or(defaults.memory_mb),
            disk_mb: request.disk_limit.unwrap_or(defaults.disk_mb),
        };
        limits.validate()?;

        let template_name = request
            .template
            .clone()
            .unwrap_or_else(|| self.settings.default_template.clone());
        let template = self
            .settings
            .templates
            .get(&template_name)
            .cloned()
            .ok_or_else(|| {
                DockyardError::validation(
                    "template",
                    format!("unknown template '{}'", template_name),
                )
            })?;

        self.check_name_available(&name).await?;

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let record = ContainerRecord {
            runtime_id: ContainerRecord::pending_runtime_id(&id),
            id,
            name: name.clone(),
            status: ContainerStatus::Creating,
            cpu_limit: limits.cpu_cores,
            memory_limit: limits.memory_mb,
            disk_limit: limits.disk_mb,
            repo_type: request.repo_type,
            repo_url,
            template: template_name,
            mode: request.mode,
            config: serde_json::json!({ CONFIG_TASK_ID: task_id }),
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
        };

        let insert = record.clone();
        self.store
            .call(move |store| store.insert_container(&insert))
            .await
            .map_err(|e| conflict_or_store(e, &name))?;
        self.creating.insert(record.id.clone());
        self.cache_put(&record);
        self.events
            .publish(Event::container_status(&record.id, ContainerStatus::Creating));
        self.report(
            task_id,
            Some(&record.id),
            CreationStage::Creating,
            10,
            "Container record created",
        );
        info!(container_id = %record.id, name = %record.name, task_id = %task_id, "container record created");

        Ok(Prepared {
            record,
            template,
            task_id: task_id.to_string(),
        })
    }

    /// An `error` record gives its name up; `creating` and every other
    /// status keep it.
    async fn check_name_available(&self, name: &str) -> Result<(), DockyardError> {
        let owned = name.to_string();
        let existing = self
            .store
            .call(move |store| store.get_container_by_name(&owned))
            .await
            .map_err(DockyardError::Store)?;
        match existing {
            None => Ok(()),
            Some(record) if record.status == ContainerStatus::Error => {
                info!(container_id = %record.id, %name, "replacing failed container record");
                self.forget(&record.id).await
            }
            Some(record) if record.status == ContainerStatus::Creating => {
                Err(DockyardError::CreationInProgress {
                    name: record.name,
                })
            }
            Some(record) => Err(DockyardError::NameTaken { name: record.name }),
        }
    }

    // ── Steps 4-6 ────────────────────────────────────────────────────

    async fn provision(&self, prepared: Prepared) -> Result<ContainerRecord, DockyardError> {
        let mut runtime_id = None;
        let result = self.provision_steps(&prepared, &mut runtime_id).await;
        self.creating.remove(&prepared.record.id);
        match result {
            Ok(record) => Ok(record),
            Err(e) => {
                self.rollback(&prepared, runtime_id.as_deref(), &e).await;
                Err(e)
            }
        }
    }

    async fn provision_steps(
        &self,
        prepared: &Prepared,
        runtime_id_out: &mut Option<String>,
    ) -> Result<ContainerRecord, DockyardError> {
        let Prepared {
            record,
            template,
            task_id,
        } = prepared;
        let id = record.id.as_str();

        self.report(task_id, Some(id), CreationStage::Creating, 20, "Creating runtime container");
        let spec = self.container_spec(record, template);
        let runtime_id = self.runtime.create(&spec).await?;
        *runtime_id_out = Some(runtime_id.clone());

        let (owned_id, owned_rt) = (id.to_string(), runtime_id.clone());
        let stored = self
            .store
            .call(move |store| store.update_runtime_id(&owned_id, &owned_rt))
            .await
            .map_err(|e| conflict_or_store(e, &record.name))?
            .ok_or_else(|| DockyardError::ContainerNotFound { id: id.to_string() })?;
        self.cache_put(&stored);
        self.report(task_id, Some(id), CreationStage::Creating, 30, "Runtime container created");

        let report = if record.repo_type == RepoType::Clone || !template.setup_commands.is_empty()
        {
            self.run_setup(record, template, &runtime_id, task_id).await?
        } else {
            SetupReport::default()
        };

        self.report(task_id, Some(id), CreationStage::Saving, 95, "Saving container");
        let owned_id = id.to_string();
        let mut config = stored.config.clone();
        if let Some(map) = config.as_object_mut() {
            map.remove(CONFIG_TASK_ID);
        }
        self.store
            .call(move |store| store.update_config(&owned_id, &config))
            .await
            .map_err(DockyardError::Store)?;
        let final_record = self.set_status(id, ContainerStatus::Stopped).await?;

        self.report(task_id, Some(id), CreationStage::Ready, 100, "Container ready");
        self.tasks.complete(
            task_id,
            Some(serde_json::json!({
                "container_id": id,
                "runtime_id": runtime_id,
                "setup": report,
            })),
        );
        info!(container_id = %id, %runtime_id, failures = report.failures.len(), "container created");
        Ok(final_record)
    }

    fn container_spec(&self, record: &ContainerRecord, template: &TemplateConfig) -> ContainerSpec {
        let limits = record.limits();
        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_ID.to_string(), record.id.clone());
        labels.insert(LABEL_NAME.to_string(), record.name.clone());
        labels.insert(LABEL_TEMPLATE.to_string(), record.template.clone());
        labels.insert(LABEL_CPU.to_string(), limits.cpu_cores.to_string());
        labels.insert(LABEL_MEMORY_MB.to_string(), limits.memory_mb.to_string());
        labels.insert(LABEL_DISK_MB.to_string(), limits.disk_mb.to_string());

        let mut env = template.env.clone();
        env.push(format!("DOCKYARD_CONTAINER_ID={}", record.id));
        env.push(format!("DOCKYARD_CONTAINER_NAME={}", record.name));
        env.push(format!("DOCKYARD_AGENT_MODE={}", record.mode.as_str()));

        ContainerSpec {
            name: format!("{}{}", RUNTIME_NAME_PREFIX, record.name),
            image: template.image.clone(),
            env,
            labels,
            cmd: template.cmd.clone(),
            working_dir: Some(template.workdir.clone()),
            binds: vec![format!("{}:{}", record.workspace_volume(), template.workdir)],
            memory_bytes: limits.memory_bytes(),
            nano_cpus: limits.nano_cpus(),
            disk_quota_mb: self
                .settings
                .enforce_disk_quota
                .then_some(limits.disk_mb),
            network: self.settings.network.clone(),
        }
    }

    /// Start, wait for exec, clone, run tooling, stop.
    async fn run_setup(
        &self,
        record: &ContainerRecord,
        template: &TemplateConfig,
        runtime_id: &str,
        task_id: &str,
    ) -> Result<SetupReport, DockyardError> {
        let id = record.id.as_str();
        let mut report = SetupReport {
            performed: true,
            ..Default::default()
        };

        self.report(task_id, Some(id), CreationStage::Starting, 40, "Starting container for setup");
        self.runtime.start(runtime_id).await?;
        report.exec_ready = self
            .poll_until_success(
                runtime_id,
                &["true".to_string()],
                &ExecOptions::default(),
                self.settings.exec_ready_timeout,
            )
            .await;
        if !report.exec_ready {
            warn!(container_id = %id, "container did not accept exec before timeout, continuing setup");
        }

        if let Some(url) = record.repo_url.as_deref().filter(|_| record.repo_type == RepoType::Clone) {
            self.report(task_id, Some(id), CreationStage::Cloning, 50, "Cloning repository");
            self.clone_repository(runtime_id, url, template).await?;
            report.cloned = true;
        }

        if !template.setup_commands.is_empty() {
            self.report(task_id, Some(id), CreationStage::Configuring, 70, "Installing tooling");
            let opts = ExecOptions {
                user: Some(template.user.clone()),
                working_dir: Some(template.workdir.clone()),
                env: Vec::new(),
            };
            for command in &template.setup_commands {
                report.commands_run += 1;
                let failure = match self.runtime.exec(runtime_id, &shell(command), &opts).await {
                    Ok(output) if output.success() => None,
                    Ok(output) => Some(SetupFailure {
                        command: command.clone(),
                        exit_code: output.exit_code,
                        stderr: output.stderr,
                    }),
                    Err(e) => Some(SetupFailure {
                        command: command.clone(),
                        exit_code: -1,
                        stderr: e.to_string(),
                    }),
                };
                if let Some(failure) = failure {
                    warn!(
                        container_id = %id,
                        command = %failure.command,
                        exit_code = failure.exit_code,
                        "setup command failed, continuing"
                    );
                    report.failures.push(failure);
                }
            }
        }

        self.report(task_id, Some(id), CreationStage::Stopping, 85, "Stopping container");
        self.runtime.stop(runtime_id).await?;
        Ok(report)
    }

    async fn clone_repository(
        &self,
        runtime_id: &str,
        url: &str,
        template: &TemplateConfig,
    ) -> Result<(), DockyardError> {
        let workdir = template.workdir.as_str();
        let root = ExecOptions::as_user("root");
        let steps: Vec<(&str, Vec<String>, &ExecOptions)> = vec![
            (
                "clean",
                vec![
                    "find".into(),
                    workdir.into(),
                    "-mindepth".into(),
                    "1".into(),
                    "-delete".into(),
                ],
                &root,
            ),
            (
                "clone",
                vec![
                    "git".into(),
                    "clone".into(),
                    "--".into(),
                    url.into(),
                    workdir.into(),
                ],
                &root,
            ),
            (
                "chown",
                vec![
                    "chown".into(),
                    "-R".into(),
                    format!("{0}:{0}", template.user),
                    workdir.into(),
                ],
                &root,
            ),
        ];

        for (step, argv, opts) in steps {
            let output = self.runtime.exec(runtime_id, &argv, opts).await?;
            if !output.success() {
                return Err(DockyardError::runtime(
                    format!("clone ({})", step),
                    format!("exit code {}: {}", output.exit_code, output.stderr.trim()),
                ));
            }
        }

        let safe_dir = vec![
            "git".to_string(),
            "config".to_string(),
            "--global".to_string(),
            "--add".to_string(),
            "safe.directory".to_string(),
            workdir.to_string(),
        ];
        let output = self
            .runtime
            .exec(runtime_id, &safe_dir, &ExecOptions::as_user(template.user.clone()))
            .await?;
        if !output.success() {
            return Err(DockyardError::runtime(
                "clone (safe.directory)",
                format!("exit code {}: {}", output.exit_code, output.stderr.trim()),
            ));
        }
        Ok(())
    }

    // ── Rollback and progress ────────────────────────────────────────

    async fn rollback(&self, prepared: &Prepared, runtime_id: Option<&str>, cause: &DockyardError) {
        let id = prepared.record.id.as_str();
        warn!(container_id = %id, error = %cause, "create failed, rolling back");

        if let Some(runtime_id) = runtime_id {
            match self.runtime.remove(runtime_id, true).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(container_id = %id, %runtime_id, error = %e, "rollback: failed to remove runtime container"),
            }
            if let Err(e) = self.runtime.remove_volume(&prepared.record.workspace_volume()).await
                && !e.is_not_found()
            {
                warn!(container_id = %id, error = %e, "rollback: failed to remove workspace volume");
            }
        }
        if let Err(e) = self.forget(id).await {
            warn!(container_id = %id, error = %e, "rollback: failed to delete record");
        }

        self.tasks.fail(&prepared.task_id, cause.to_string());
        self.report_error(&prepared.task_id, Some(id), cause);
    }

    /// Advance the task and publish a `CreationProgress` event.
    fn report(
        &self,
        task_id: &str,
        container_id: Option<&str>,
        stage: CreationStage,
        percentage: u8,
        message: &str,
    ) {
        self.tasks.set_progress(task_id, percentage, message);
        self.events.publish(Event::CreationProgress(CreationProgress {
            task_id: task_id.to_string(),
            container_id: container_id.map(str::to_string),
            stage,
            percentage,
            message: message.to_string(),
            error: None,
        }));
    }

    fn report_error(&self, task_id: &str, container_id: Option<&str>, error: &DockyardError) {
        let percentage = self.tasks.get(task_id).map(|t| t.progress).unwrap_or(0);
        self.events.publish(Event::CreationProgress(CreationProgress {
            task_id: task_id.to_string(),
            container_id: container_id.map(str::to_string),
            stage: CreationStage::Error,
            percentage,
            message: "Creation failed".to_string(),
            error: Some(error.to_string()),
        }));
    }
}
