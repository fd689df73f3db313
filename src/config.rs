//! Configuration for the Dockyard service.
//!
//! Settings are read from `dockyard.toml` and layered: built-in defaults →
//! file → environment → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8420
//!
//! [storage]
//! db_path = "dockyard.db"
//! metrics_retention_hours = 24
//!
//! [runtime]
//! docker_host = "unix:///var/run/docker.sock"
//! stop_timeout_secs = 10
//! enforce_disk_quota = false
//! allowed_git_hosts = ["github.com", "gitlab.com"]
//!
//! [orchestrator]
//! reconcile_interval_secs = 60
//! readiness_timeout_secs = 30
//!
//! [templates.node]
//! image = "dockyard/node:20"
//! setup_commands = ["npm install -g pnpm"]
//! health_check = "test -S /tmp/editor.sock"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use dockyard_common::DockyardError;
use serde::{Deserialize, Serialize};

use crate::sanitize::default_allowed_hosts;

pub const DEFAULT_CONFIG_FILE: &str = "dockyard.toml";
pub const DEFAULT_TEMPLATE: &str = "base";

// ── Sections ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Origins allowed by CORS. `*` allows any; empty disables CORS.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8420
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_metrics_retention_hours")]
    pub metrics_retention_hours: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("dockyard.db")
}

fn default_metrics_retention_hours() -> u64 {
    24
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            metrics_retention_hours: default_metrics_retention_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSection {
    /// `unix://`, `tcp://` or `http://` endpoint. Local defaults when unset.
    #[serde(default)]
    pub docker_host: Option<String>,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: i32,
    /// Network the containers join, if any.
    #[serde(default)]
    pub network: Option<String>,
    /// Pass the disk limit to the runtime as a storage quota. Only storage
    /// drivers with quota support accept it (overlay2 on xfs with pquota,
    /// btrfs, zfs); elsewhere the limit is recorded but not enforced.
    #[serde(default)]
    pub enforce_disk_quota: bool,
    #[serde(default = "default_allowed_hosts")]
    pub allowed_git_hosts: Vec<String>,
}

fn default_stop_timeout_secs() -> i32 {
    10
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            docker_host: None,
            stop_timeout_secs: default_stop_timeout_secs(),
            network: None,
            enforce_disk_quota: false,
            allowed_git_hosts: default_allowed_hosts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    #[serde(default = "default_task_retention_secs")]
    pub task_retention_secs: u64,
    #[serde(default = "default_task_sweep_interval_secs")]
    pub task_sweep_interval_secs: u64,
    /// Upper bound on waiting for a template health check after start.
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,
    /// Upper bound on waiting for the first successful exec during setup.
    #[serde(default = "default_exec_ready_timeout_secs")]
    pub exec_ready_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_template_name")]
    pub default_template: String,
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_metrics_interval_secs() -> u64 {
    30
}

fn default_task_retention_secs() -> u64 {
    60 * 60
}

fn default_task_sweep_interval_secs() -> u64 {
    5 * 60
}

fn default_readiness_timeout_secs() -> u64 {
    30
}

fn default_exec_ready_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_template_name() -> String {
    DEFAULT_TEMPLATE.to_string()
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval_secs(),
            metrics_interval_secs: default_metrics_interval_secs(),
            task_retention_secs: default_task_retention_secs(),
            task_sweep_interval_secs: default_task_sweep_interval_secs(),
            readiness_timeout_secs: default_readiness_timeout_secs(),
            exec_ready_timeout_secs: default_exec_ready_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            default_template: default_template_name(),
        }
    }
}

/// An image plus the tooling that gets installed into it on create.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateConfig {
    pub image: String,
    #[serde(default)]
    pub env: Vec<String>,
    /// Run in order after the optional clone. A failing command is logged
    /// and reported, never fatal.
    #[serde(default)]
    pub setup_commands: Vec<String>,
    /// Polled after start until it exits 0.
    #[serde(default)]
    pub health_check: Option<String>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default = "default_user")]
    pub user: String,
}

fn default_workdir() -> String {
    "/workspace".to_string()
}

fn default_user() -> String {
    "dev".to_string()
}

impl TemplateConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            env: Vec::new(),
            setup_commands: Vec::new(),
            health_check: None,
            cmd: None,
            workdir: default_workdir(),
            user: default_user(),
        }
    }
}

fn default_templates() -> BTreeMap<String, TemplateConfig> {
    let mut templates = BTreeMap::new();
    templates.insert(
        DEFAULT_TEMPLATE.to_string(),
        TemplateConfig::new("dockyard/devbox:latest"),
    );
    templates
}

// ── Root ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockyardConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default = "default_templates")]
    pub templates: BTreeMap<String, TemplateConfig>,
}

impl Default for DockyardConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            storage: StorageSection::default(),
            runtime: RuntimeSection::default(),
            orchestrator: OrchestratorSection::default(),
            templates: default_templates(),
        }
    }
}

impl DockyardConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse dockyard.toml")
    }

    /// Load `path` if it exists, otherwise the built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Defaults → file → process environment.
    pub fn resolve(path: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("DOCKYARD_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid DOCKYARD_PORT '{}'", port))?;
        }
        if let Some(host) = lookup("DOCKYARD_HOST") {
            self.server.host = host;
        }
        if let Some(path) = lookup("DOCKYARD_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Some(host) = lookup("DOCKER_HOST").filter(|h| !h.trim().is_empty()) {
            self.runtime.docker_host = Some(host);
        }
        if let Some(hosts) = lookup("DOCKYARD_ALLOWED_GIT_HOSTS") {
            self.runtime.allowed_git_hosts = hosts
                .split(',')
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect();
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize dockyard.toml")
    }

    /// Write the default configuration to `path`. Refuses to overwrite
    /// unless `force` is set.
    pub fn write_default(path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            anyhow::bail!(
                "{} already exists (use --force to overwrite)",
                path.display()
            );
        }
        Self::default().save(path)
    }

    pub fn template(&self, name: &str) -> Result<&TemplateConfig, DockyardError> {
        self.templates.get(name).ok_or_else(|| {
            DockyardError::validation("template", format!("unknown template '{}'", name))
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn metrics_retention(&self) -> Duration {
        Duration::from_secs(self.storage.metrics_retention_hours * 60 * 60)
    }

    /// Problems that make the configuration unusable or suspicious.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.server.port == 0 {
            problems.push("server.port must be non-zero".to_string());
        }
        if self.templates.is_empty() {
            problems.push("at least one [templates.<name>] section is required".to_string());
        }
        if !self
            .templates
            .contains_key(&self.orchestrator.default_template)
        {
            problems.push(format!(
                "orchestrator.default_template '{}' has no [templates] entry",
                self.orchestrator.default_template
            ));
        }
        for (name, template) in &self.templates {
            if template.image.trim().is_empty() {
                problems.push(format!("templates.{}.image must not be empty", name));
            }
            if !template.workdir.starts_with('/') {
                problems.push(format!(
                    "templates.{}.workdir '{}' must be an absolute path",
                    name, template.workdir
                ));
            }
        }
        if self.runtime.allowed_git_hosts.is_empty() {
            problems.push("runtime.allowed_git_hosts is empty; clone requests will be rejected".to_string());
        }
        if self.runtime.stop_timeout_secs < 0 {
            problems.push("runtime.stop_timeout_secs must not be negative".to_string());
        }
        let intervals = [
            ("reconcile_interval_secs", self.orchestrator.reconcile_interval_secs),
            ("metrics_interval_secs", self.orchestrator.metrics_interval_secs),
            ("task_sweep_interval_secs", self.orchestrator.task_sweep_interval_secs),
        ];
        for (key, value) in intervals {
            if value == 0 {
                problems.push(format!("orchestrator.{} must be non-zero", key));
            }
        }
        if self.orchestrator.poll_interval_ms == 0 {
            problems.push("orchestrator.poll_interval_ms must be non-zero".to_string());
        }

        problems
    }
}
