use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use dockyard_common::{ContainerRecord, ContainerStatus, MetricsSample};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
trait ToDb {
    fn to_db(&self) -> String;
}

impl ToDb for DateTime<Utc> {
    fn to_db(&self) -> String {
        self.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

/// A write hit one of the `containers` unique indexes (`name` or `runtime_id`).
#[derive(Debug, thiserror::Error)]
#[error("Unique constraint violated: {0}")]
pub struct UniqueViolation(pub String);

/// Async-safe handle to the store.
///
/// Wraps `Store` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl StoreHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("Store task panicked")?
    }
}

pub struct Store {
    conn: Connection,
}

const CONTAINER_COLUMNS: &str = "id, runtime_id, name, status, cpu_limit, memory_limit, disk_limit, repo_type, repo_url, template, mode, config, created_at, updated_at, started_at, stopped_at";

impl Store {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing and dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to configure SQLite")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS containers (
                    id TEXT PRIMARY KEY,
                    runtime_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL,
                    cpu_limit REAL NOT NULL,
                    memory_limit INTEGER NOT NULL,
                    disk_limit INTEGER NOT NULL,
                    repo_type TEXT NOT NULL DEFAULT 'empty',
                    repo_url TEXT,
                    template TEXT NOT NULL,
                    mode TEXT NOT NULL DEFAULT 'interactive',
                    config TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    started_at TEXT,
                    stopped_at TEXT
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_containers_name ON containers(name);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_containers_runtime_id ON containers(runtime_id);

                CREATE TABLE IF NOT EXISTS container_metrics (
                    container_id TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    cpu_percent REAL NOT NULL,
                    memory_bytes INTEGER NOT NULL,
                    memory_limit_bytes INTEGER NOT NULL,
                    network_rx_bytes INTEGER NOT NULL,
                    network_tx_bytes INTEGER NOT NULL,
                    PRIMARY KEY (container_id, timestamp)
                );
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Container records ─────────────────────────────────────────────

    pub fn insert_container(&self, record: &ContainerRecord) -> Result<()> {
        let config = serde_json::to_string(&record.config).context("Failed to encode config")?;
        let result = self.conn.execute(
            &format!(
                "INSERT INTO containers ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                CONTAINER_COLUMNS
            ),
            params![
                record.id,
                record.runtime_id,
                record.name,
                record.status.as_str(),
                record.cpu_limit,
                record.memory_limit as i64,
                record.disk_limit as i64,
                record.repo_type.as_str(),
                record.repo_url,
                record.template,
                record.mode.as_str(),
                config,
                record.created_at.to_db(),
                record.updated_at.to_db(),
                record.started_at.map(|t| t.to_db()),
                record.stopped_at.map(|t| t.to_db()),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(UniqueViolation(e.to_string()).into()),
            Err(e) => Err(e).context("Failed to insert container"),
        }
    }

    pub fn get_container(&self, id: &str) -> Result<Option<ContainerRecord>> {
        self.query_one("id = ?1", id)
    }

    pub fn get_container_by_name(&self, name: &str) -> Result<Option<ContainerRecord>> {
        self.query_one("name = ?1", name)
    }

    pub fn get_container_by_runtime_id(&self, runtime_id: &str) -> Result<Option<ContainerRecord>> {
        self.query_one("runtime_id = ?1", runtime_id)
    }

    fn query_one(&self, predicate: &str, value: &str) -> Result<Option<ContainerRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM containers WHERE {}",
                CONTAINER_COLUMNS, predicate
            ))
            .context("Failed to prepare container lookup")?;
        let row = stmt
            .query_row(params![value], ContainerRow::from_row)
            .optional()
            .context("Failed to query container")?;
        row.map(ContainerRow::into_record).transpose()
    }

    pub fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM containers ORDER BY created_at, name",
                CONTAINER_COLUMNS
            ))
            .context("Failed to prepare list_containers")?;
        let rows = stmt
            .query_map([], ContainerRow::from_row)
            .context("Failed to query containers")?;
        let mut records = Vec::new();
        for row in rows {
            let r = row.context("Failed to read container row")?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }

    /// Set `status`, stamping `started_at` / `stopped_at` on the matching
    /// transitions. Returns the updated record, or `None` if it is gone.
    pub fn update_status(&self, id: &str, status: ContainerStatus) -> Result<Option<ContainerRecord>> {
        let now = Utc::now().to_db();
        let sql = match status {
            ContainerStatus::Running => {
                "UPDATE containers SET status = ?1, updated_at = ?2, started_at = ?2 WHERE id = ?3"
            }
            ContainerStatus::Stopped | ContainerStatus::Exited | ContainerStatus::Dead => {
                "UPDATE containers SET status = ?1, updated_at = ?2, stopped_at = ?2 WHERE id = ?3"
            }
            _ => "UPDATE containers SET status = ?1, updated_at = ?2 WHERE id = ?3",
        };
        self.conn
            .execute(sql, params![status.as_str(), now, id])
            .context("Failed to update container status")?;
        self.get_container(id)
    }

    pub fn update_runtime_id(&self, id: &str, runtime_id: &str) -> Result<Option<ContainerRecord>> {
        let result = self.conn.execute(
            "UPDATE containers SET runtime_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![runtime_id, Utc::now().to_db(), id],
        );
        match result {
            Ok(_) => self.get_container(id),
            Err(e) if is_unique_violation(&e) => Err(UniqueViolation(e.to_string()).into()),
            Err(e) => Err(e).context("Failed to update runtime id"),
        }
    }

    pub fn update_limits(
        &self,
        id: &str,
        cpu_limit: f64,
        memory_limit: u64,
        disk_limit: u64,
    ) -> Result<Option<ContainerRecord>> {
        self.conn
            .execute(
                "UPDATE containers SET cpu_limit = ?1, memory_limit = ?2, disk_limit = ?3, updated_at = ?4 WHERE id = ?5",
                params![
                    cpu_limit,
                    memory_limit as i64,
                    disk_limit as i64,
                    Utc::now().to_db(),
                    id
                ],
            )
            .context("Failed to update container limits")?;
        self.get_container(id)
    }

    pub fn update_config(&self, id: &str, config: &serde_json::Value) -> Result<Option<ContainerRecord>> {
        let config = serde_json::to_string(config).context("Failed to encode config")?;
        self.conn
            .execute(
                "UPDATE containers SET config = ?1, updated_at = ?2 WHERE id = ?3",
                params![config, Utc::now().to_db(), id],
            )
            .context("Failed to update container config")?;
        self.get_container(id)
    }

    /// Delete a record. Returns whether a row was removed.
    pub fn delete_container(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM containers WHERE id = ?1", params![id])
            .context("Failed to delete container")?;
        Ok(affected > 0)
    }

    // ── Metrics ───────────────────────────────────────────────────────

    pub fn record_metrics(&self, sample: &MetricsSample) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO container_metrics
                 (container_id, timestamp, cpu_percent, memory_bytes, memory_limit_bytes, network_rx_bytes, network_tx_bytes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    sample.container_id,
                    sample.timestamp.to_db(),
                    sample.cpu_percent,
                    sample.memory_bytes as i64,
                    sample.memory_limit_bytes as i64,
                    sample.network_rx_bytes as i64,
                    sample.network_tx_bytes as i64,
                ],
            )
            .context("Failed to insert metrics sample")?;
        Ok(())
    }

    /// Newest-first samples for one container.
    pub fn metrics_history(&self, container_id: &str, limit: usize) -> Result<Vec<MetricsSample>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT container_id, timestamp, cpu_percent, memory_bytes, memory_limit_bytes, network_rx_bytes, network_tx_bytes
                 FROM container_metrics WHERE container_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
            )
            .context("Failed to prepare metrics_history")?;
        let rows = stmt
            .query_map(params![container_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })
            .context("Failed to query metrics")?;
        let mut samples = Vec::new();
        for row in rows {
            let (container_id, timestamp, cpu_percent, mem, mem_limit, rx, tx) =
                row.context("Failed to read metrics row")?;
            samples.push(MetricsSample {
                container_id,
                timestamp: parse_time(&timestamp)?,
                cpu_percent,
                memory_bytes: mem.max(0) as u64,
                memory_limit_bytes: mem_limit.max(0) as u64,
                network_rx_bytes: rx.max(0) as u64,
                network_tx_bytes: tx.max(0) as u64,
            });
        }
        Ok(samples)
    }

    pub fn latest_metrics(&self, container_id: &str) -> Result<Option<MetricsSample>> {
        Ok(self.metrics_history(container_id, 1)?.into_iter().next())
    }

    /// Drop samples older than `before`. Returns the number removed.
    pub fn prune_metrics(&self, before: DateTime<Utc>) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM container_metrics WHERE timestamp < ?1",
                params![before.to_db()],
            )
            .context("Failed to prune metrics")
    }

    pub fn delete_metrics(&self, container_id: &str) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM container_metrics WHERE container_id = ?1",
                params![container_id],
            )
            .context("Failed to delete container metrics")
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp '{}'", s))?
        .with_timezone(&Utc))
}

fn parse_opt_time(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_time).transpose()
}

/// Raw column values; converted to a `ContainerRecord` outside the rusqlite
/// row closure so parse failures carry context.
struct ContainerRow {
    id: String,
    runtime_id: String,
    name: String,
    status: String,
    cpu_limit: f64,
    memory_limit: i64,
    disk_limit: i64,
    repo_type: String,
    repo_url: Option<String>,
    template: String,
    mode: String,
    config: String,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    stopped_at: Option<String>,
}

impl ContainerRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            runtime_id: row.get(1)?,
            name: row.get(2)?,
            status: row.get(3)?,
            cpu_limit: row.get(4)?,
            memory_limit: row.get(5)?,
            disk_limit: row.get(6)?,
            repo_type: row.get(7)?,
            repo_url: row.get(8)?,
            template: row.get(9)?,
            mode: row.get(10)?,
            config: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            started_at: row.get(14)?,
            stopped_at: row.get(15)?,
        })
    }

    fn into_record(self) -> Result<ContainerRecord> {
        Ok(ContainerRecord {
            status: ContainerStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            repo_type: self.repo_type.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            mode: self.mode.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            config: serde_json::from_str(&self.config)
                .with_context(|| format!("Invalid config JSON for container {}", self.id))?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            started_at: parse_opt_time(self.started_at)?,
            stopped_at: parse_opt_time(self.stopped_at)?,
            id: self.id,
            runtime_id: self.runtime_id,
            name: self.name,
            cpu_limit: self.cpu_limit,
            memory_limit: self.memory_limit.max(0) as u64,
            disk_limit: self.disk_limit.max(0) as u64,
            repo_url: self.repo_url,
            template: self.template,
        })
    }
}
