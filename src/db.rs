//! SQLite store for settings, services, custom configs, instances and jobs
//!
//! The database is the source of truth. Everything written to disk for the
//! renderer or pushed to instances is derived from it.

use crate::catalog::{Catalog, Plugin};
use crate::model::{
    CustomConfig, CustomConfigType, GlobalValue, Instance, InstanceStatus, JobRun, Method, Service, ServiceSetting,
};
use crate::resolver::{EffectiveConfig, Snapshot, Violation};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Plugin row as stored
#[derive(Debug, Clone, PartialEq)]
pub struct PluginRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub external: bool,
    pub method: Method,
    pub checksum: Option<String>,
}

/// Cached file produced by a job
#[derive(Debug, Clone, PartialEq)]
pub struct JobCacheRecord {
    pub job_name: String,
    pub service_id: Option<String>,
    pub file_name: String,
    pub data: Vec<u8>,
    pub checksum: String,
    pub last_update: Option<DateTime<Utc>>,
}

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open the database, retrying with a fixed backoff.
    ///
    /// Fails once `attempts` tries have been used up.
    pub async fn connect_with_retry(path: impl AsRef<Path>, attempts: u32, backoff: Duration) -> Result<Self> {
        let path = path.as_ref();
        let attempts = attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match Self::open(path) {
                Ok(db) => return Ok(db),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Database not reachable");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow!("no connection attempt made"))
            .context(format!("Database unreachable after {attempts} attempts")))
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }

            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: catalog, values, services, custom configs, instances
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS plugins (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                version TEXT NOT NULL,
                stream TEXT NOT NULL DEFAULT 'no',
                external INTEGER NOT NULL DEFAULT 0,
                method TEXT NOT NULL DEFAULT 'default',
                checksum TEXT
            );

            CREATE TABLE IF NOT EXISTS settings (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                plugin_id TEXT NOT NULL,
                context TEXT NOT NULL,
                default_value TEXT NOT NULL DEFAULT '',
                regex TEXT NOT NULL DEFAULT '',
                type TEXT NOT NULL,
                multiple TEXT,
                UNIQUE (id, name),
                FOREIGN KEY (plugin_id) REFERENCES plugins(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS jobs (
                name TEXT NOT NULL,
                plugin_id TEXT NOT NULL,
                file_name TEXT NOT NULL,
                every TEXT NOT NULL,
                reload INTEGER NOT NULL DEFAULT 0,
                run_async INTEGER NOT NULL DEFAULT 0,
                UNIQUE (name, plugin_id),
                FOREIGN KEY (plugin_id) REFERENCES plugins(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS global_values (
                setting_id TEXT NOT NULL,
                suffix INTEGER NOT NULL DEFAULT 0,
                value TEXT NOT NULL,
                method TEXT NOT NULL,
                PRIMARY KEY (setting_id, suffix)
            );

            CREATE TABLE IF NOT EXISTS services (
                id TEXT PRIMARY KEY,
                method TEXT NOT NULL,
                is_draft INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS services_settings (
                service_id TEXT NOT NULL,
                setting_id TEXT NOT NULL,
                suffix INTEGER NOT NULL DEFAULT 0,
                value TEXT NOT NULL,
                method TEXT NOT NULL,
                PRIMARY KEY (service_id, setting_id, suffix),
                FOREIGN KEY (service_id) REFERENCES services(id) ON DELETE CASCADE
            );

            -- service_id '' means the config applies to every service
            CREATE TABLE IF NOT EXISTS custom_configs (
                service_id TEXT NOT NULL DEFAULT '',
                type TEXT NOT NULL,
                name TEXT NOT NULL,
                data BLOB NOT NULL,
                checksum TEXT NOT NULL,
                method TEXT NOT NULL,
                PRIMARY KEY (service_id, type, name)
            );

            CREATE TABLE IF NOT EXISTS instances (
                hostname TEXT PRIMARY KEY,
                port INTEGER NOT NULL,
                server_name TEXT NOT NULL,
                method TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'loading',
                last_seen TEXT
            );

            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    /// Migration v2: job run history and job cache
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: job history and cache");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_name TEXT NOT NULL,
                success INTEGER NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_runs_job ON jobs_runs(job_name);

            CREATE TABLE IF NOT EXISTS jobs_cache (
                job_name TEXT NOT NULL,
                service_id TEXT NOT NULL DEFAULT '',
                file_name TEXT NOT NULL,
                data BLOB NOT NULL,
                checksum TEXT NOT NULL,
                last_update TEXT,
                PRIMARY KEY (job_name, service_id, file_name)
            );

            INSERT INTO schema_migrations (version) VALUES (2);
        "#,
        )?;

        Ok(())
    }

    // ==================== Metadata ====================

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row("SELECT value FROM metadata WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .context("Failed to read metadata")
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Whether the first configuration save has happened
    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.get_metadata("is_initialized")?.as_deref() == Some("yes"))
    }

    pub fn set_initialized(&self) -> Result<()> {
        self.set_metadata("is_initialized", "yes")
    }

    // ==================== Plugins ====================

    /// Mirror the loaded catalog: upsert every plugin with its settings and
    /// jobs, and drop plugins that are no longer loaded.
    pub fn sync_plugins(&self, plugins: &[Plugin]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for plugin in plugins {
            tx.execute(
                "INSERT INTO plugins (id, name, description, version, stream, external, method, checksum)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    description = excluded.description,
                    version = excluded.version,
                    stream = excluded.stream,
                    external = excluded.external,
                    method = excluded.method,
                    checksum = COALESCE(excluded.checksum, plugins.checksum)",
                params![
                    plugin.id,
                    plugin.name,
                    plugin.description,
                    plugin.version,
                    plugin.stream,
                    plugin.external,
                    plugin.method.as_str(),
                    plugin.checksum,
                ],
            )?;
            tx.execute("DELETE FROM settings WHERE plugin_id = ?1", params![plugin.id])?;
            tx.execute("DELETE FROM jobs WHERE plugin_id = ?1", params![plugin.id])?;

            for setting in &plugin.settings {
                tx.execute(
                    "INSERT INTO settings (id, name, plugin_id, context, default_value, regex, type, multiple)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        setting.id,
                        setting.label,
                        plugin.id,
                        setting.context.as_str(),
                        setting.default,
                        setting.regex,
                        format!("{:?}", setting.setting_type).to_lowercase(),
                        setting.multiple,
                    ],
                )
                .with_context(|| format!("Failed to save setting {}", setting.id))?;
            }

            for job in &plugin.jobs {
                tx.execute(
                    "INSERT INTO jobs (name, plugin_id, file_name, every, reload, run_async)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![job.name, plugin.id, job.file, job.every.as_str(), job.reload, job.run_async],
                )
                .with_context(|| format!("Failed to save job {}", job.name))?;
            }
        }

        let loaded: HashSet<&str> = plugins.iter().map(|p| p.id.as_str()).collect();
        let stored: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM plugins")?;
            let ids = stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<String>, _>>()?;
            ids
        };
        for id in stored.iter().filter(|id| !loaded.contains(id.as_str())) {
            debug!(plugin = %id, "Removing unloaded plugin");
            tx.execute("DELETE FROM plugins WHERE id = ?1", params![id])?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_plugins(&self) -> Result<Vec<PluginRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, name, version, external, method, checksum FROM plugins ORDER BY id")?;
        let plugins = stmt
            .query_map([], |row| {
                let method: String = row.get(4)?;
                Ok(PluginRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    version: row.get(2)?,
                    external: row.get(3)?,
                    method: Method::parse(&method).unwrap_or_default(),
                    checksum: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(plugins)
    }

    pub fn set_plugin_checksum(&self, plugin_id: &str, checksum: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE plugins SET checksum = ?1 WHERE id = ?2",
            params![checksum, plugin_id],
        )?;
        Ok(rows > 0)
    }

    pub fn count_jobs(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ==================== Config ====================

    /// Every stored global value, service setting and service
    pub fn load_snapshot(&self) -> Result<Snapshot> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare("SELECT setting_id, suffix, value, method FROM global_values")?;
        let globals = stmt
            .query_map([], |row| {
                let method: String = row.get(3)?;
                Ok(GlobalValue {
                    setting_id: row.get(0)?,
                    suffix: row.get(1)?,
                    value: row.get(2)?,
                    method: Method::parse(&method).unwrap_or_default(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt =
            conn.prepare("SELECT service_id, setting_id, suffix, value, method FROM services_settings")?;
        let service_settings = stmt
            .query_map([], |row| {
                let method: String = row.get(4)?;
                Ok(ServiceSetting {
                    service_id: row.get(0)?,
                    setting_id: row.get(1)?,
                    suffix: row.get(2)?,
                    value: row.get(3)?,
                    method: Method::parse(&method).unwrap_or_default(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare("SELECT id, method, is_draft FROM services ORDER BY rowid")?;
        let services = stmt
            .query_map([], |row| {
                let method: String = row.get(1)?;
                Ok(Service {
                    id: row.get(0)?,
                    method: Method::parse(&method).unwrap_or_default(),
                    is_draft: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Snapshot::new(globals, service_settings, services))
    }

    /// Resolve the stored values against the catalog
    pub fn get_config(&self, catalog: &Catalog) -> Result<EffectiveConfig> {
        Ok(self.load_snapshot()?.resolve(catalog))
    }

    /// Validate and store a flat variables map written by `method`.
    ///
    /// Returns the keys that were dropped; everything else is committed in one
    /// transaction. Custom configs and job cache entries of services removed by
    /// this save go with them.
    pub fn save_config(
        &self,
        catalog: &Catalog,
        vars: &BTreeMap<String, String>,
        method: Method,
        force: bool,
    ) -> Result<Vec<Violation>> {
        let mut snapshot = self.load_snapshot()?;
        let before: Vec<String> = snapshot.services.iter().map(|s| s.id.clone()).collect();
        let violations = snapshot.apply_overrides(catalog, vars, method, force);
        let removed: Vec<String> = before
            .into_iter()
            .filter(|id| !snapshot.services.iter().any(|s| &s.id == id))
            .collect();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        write_snapshot(&tx, &snapshot)?;
        for service_id in &removed {
            tx.execute("DELETE FROM custom_configs WHERE service_id = ?1", params![service_id])?;
            tx.execute("DELETE FROM jobs_cache WHERE service_id = ?1", params![service_id])?;
        }
        tx.execute(
            "INSERT INTO metadata (key, value) VALUES ('is_initialized', 'yes')
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [],
        )?;
        tx.commit().context("Failed to save config")?;

        debug!(
            method = %method,
            keys = vars.len(),
            dropped = violations.len(),
            removed_services = removed.len(),
            "Config saved"
        );
        Ok(violations)
    }

    pub fn set_service_draft(&self, service_id: &str, is_draft: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE services SET is_draft = ?1 WHERE id = ?2",
            params![is_draft, service_id],
        )?;
        Ok(rows > 0)
    }

    // ==================== Custom configs ====================

    pub fn get_custom_configs(&self) -> Result<Vec<CustomConfig>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT service_id, type, name, data, checksum, method FROM custom_configs
             ORDER BY type, service_id, name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let service_id: String = row.get(0)?;
                let config_type: String = row.get(1)?;
                let method: String = row.get(5)?;
                Ok((
                    service_id,
                    config_type,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, String>(4)?,
                    method,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut configs = Vec::with_capacity(rows.len());
        for (service_id, config_type, name, data, checksum, method) in rows {
            let Some(config_type) = CustomConfigType::parse(&config_type) else {
                warn!(name = %name, config_type = %config_type, "Skipping custom config with unknown type");
                continue;
            };
            configs.push(CustomConfig {
                service_id: (!service_id.is_empty()).then_some(service_id),
                config_type,
                name,
                data,
                checksum,
                method: Method::parse(&method).unwrap_or_default(),
            });
        }
        Ok(configs)
    }

    /// Replace the custom configs owned by `method` with `configs`.
    ///
    /// Rows owned by another method are only touched when `method` may
    /// overwrite them. Returns how many configs were skipped for provenance.
    pub fn save_custom_configs(&self, configs: &[CustomConfig], method: Method) -> Result<usize> {
        let existing = self.get_custom_configs()?;
        let key = |c: &CustomConfig| (c.service_id.clone().unwrap_or_default(), c.config_type, c.name.clone());
        let wanted: HashSet<_> = configs.iter().map(key).collect();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for old in existing.iter().filter(|c| c.method == method && !wanted.contains(&key(*c))) {
            tx.execute(
                "DELETE FROM custom_configs WHERE service_id = ?1 AND type = ?2 AND name = ?3",
                params![old.service_id.clone().unwrap_or_default(), old.config_type.as_str(), old.name],
            )?;
        }

        let mut skipped = 0;
        for config in configs {
            if let Some(owner) = existing.iter().find(|c| key(*c) == key(config)).map(|c| c.method) {
                if !method.may_overwrite(owner) {
                    warn!(
                        name = %config.name,
                        config_type = %config.config_type,
                        owner = %owner,
                        method = %method,
                        "Custom config is owned by another method, not overwriting"
                    );
                    skipped += 1;
                    continue;
                }
            }
            tx.execute(
                "INSERT INTO custom_configs (service_id, type, name, data, checksum, method)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(service_id, type, name) DO UPDATE SET
                    data = excluded.data, checksum = excluded.checksum, method = excluded.method",
                params![
                    config.service_id.clone().unwrap_or_default(),
                    config.config_type.as_str(),
                    config.name,
                    config.data,
                    config.checksum,
                    method.as_str(),
                ],
            )?;
        }

        tx.commit().context("Failed to save custom configs")?;
        Ok(skipped)
    }

    // ==================== Instances ====================

    pub fn get_instances(&self) -> Result<Vec<Instance>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT hostname, port, server_name, method, status, last_seen FROM instances ORDER BY hostname",
        )?;
        let instances = stmt
            .query_map([], |row| {
                let method: String = row.get(3)?;
                let status: String = row.get(4)?;
                let last_seen: Option<String> = row.get(5)?;
                Ok(Instance {
                    hostname: row.get(0)?,
                    port: row.get(1)?,
                    server_name: row.get(2)?,
                    method: Method::parse(&method).unwrap_or_default(),
                    status: InstanceStatus::parse(&status).unwrap_or_default(),
                    last_seen: parse_timestamp(last_seen.as_deref()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(instances)
    }

    /// Replace the instances owned by `method`. Known instances keep their
    /// health status; new ones start as `loading`.
    pub fn save_instances(&self, instances: &[Instance], method: Method) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let wanted: HashSet<&str> = instances.iter().map(|i| i.hostname.as_str()).collect();
        let owned: Vec<String> = {
            let mut stmt = tx.prepare("SELECT hostname FROM instances WHERE method = ?1")?;
            let rows = stmt
                .query_map(params![method.as_str()], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            rows
        };
        for hostname in owned.iter().filter(|h| !wanted.contains(h.as_str())) {
            debug!(hostname = %hostname, "Pruning instance no longer observed");
            tx.execute("DELETE FROM instances WHERE hostname = ?1", params![hostname])?;
        }

        for instance in instances {
            tx.execute(
                "INSERT INTO instances (hostname, port, server_name, method, status)
                 VALUES (?1, ?2, ?3, ?4, 'loading')
                 ON CONFLICT(hostname) DO UPDATE SET
                    port = excluded.port, server_name = excluded.server_name, method = excluded.method",
                params![instance.hostname, instance.port, instance.server_name, method.as_str()],
            )?;
        }

        tx.commit().context("Failed to save instances")?;
        Ok(())
    }

    /// Record a health observation; `up` also refreshes last-seen
    pub fn update_instance_status(&self, hostname: &str, status: InstanceStatus) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = if status == InstanceStatus::Up {
            conn.execute(
                "UPDATE instances SET status = ?1, last_seen = ?2 WHERE hostname = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), hostname],
            )?
        } else {
            conn.execute(
                "UPDATE instances SET status = ?1 WHERE hostname = ?2",
                params![status.as_str(), hostname],
            )?
        };
        Ok(rows > 0)
    }

    // ==================== Jobs ====================

    pub fn add_job_run(&self, run: &JobRun) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO jobs_runs (job_name, success, start_date, end_date) VALUES (?1, ?2, ?3, ?4)",
            params![
                run.job_name,
                run.success,
                run.start_date.to_rfc3339(),
                run.end_date.map(|d| d.to_rfc3339()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent runs first
    pub fn get_job_runs(&self, job_name: Option<&str>, limit: usize) -> Result<Vec<JobRun>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT job_name, success, start_date, end_date FROM jobs_runs
             WHERE ?1 IS NULL OR job_name = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![job_name, limit as i64], |row| {
                let start: String = row.get(2)?;
                let end: Option<String> = row.get(3)?;
                Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?, start, end))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(job_name, success, start, end)| {
                Some(JobRun {
                    job_name,
                    success,
                    start_date: parse_timestamp(Some(&start))?,
                    end_date: parse_timestamp(end.as_deref()),
                })
            })
            .collect())
    }

    /// Keep the newest `max_runs` rows; returns how many were deleted
    pub fn cleanup_job_runs(&self, max_runs: usize) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM jobs_runs WHERE id NOT IN (SELECT id FROM jobs_runs ORDER BY id DESC LIMIT ?1)",
            params![max_runs as i64],
        )?;
        if deleted > 0 {
            debug!(deleted, max_runs, "Pruned job run history");
        }
        Ok(deleted)
    }

    pub fn upsert_job_cache(&self, record: &JobCacheRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO jobs_cache (job_name, service_id, file_name, data, checksum, last_update)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(job_name, service_id, file_name) DO UPDATE SET
                data = excluded.data, checksum = excluded.checksum, last_update = excluded.last_update",
            params![
                record.job_name,
                record.service_id.clone().unwrap_or_default(),
                record.file_name,
                record.data,
                record.checksum,
                record.last_update.unwrap_or_else(Utc::now).to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_job_cache(&self, job_name: &str) -> Result<Vec<JobCacheRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT job_name, service_id, file_name, data, checksum, last_update FROM jobs_cache
             WHERE job_name = ?1 ORDER BY service_id, file_name",
        )?;
        let records = stmt
            .query_map(params![job_name], |row| {
                let service_id: String = row.get(1)?;
                let last_update: Option<String> = row.get(5)?;
                Ok(JobCacheRecord {
                    job_name: row.get(0)?,
                    service_id: (!service_id.is_empty()).then_some(service_id),
                    file_name: row.get(2)?,
                    data: row.get(3)?,
                    checksum: row.get(4)?,
                    last_update: parse_timestamp(last_update.as_deref()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn delete_job_cache(&self, job_name: &str, service_id: Option<&str>, file_name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM jobs_cache WHERE job_name = ?1 AND service_id = ?2 AND file_name = ?3",
            params![job_name, service_id.unwrap_or_default(), file_name],
        )?;
        Ok(rows > 0)
    }
}

fn write_snapshot(tx: &Transaction<'_>, snapshot: &Snapshot) -> Result<()> {
    tx.execute("DELETE FROM services_settings", [])?;
    tx.execute("DELETE FROM services", [])?;
    tx.execute("DELETE FROM global_values", [])?;

    for global in &snapshot.globals {
        tx.execute(
            "INSERT INTO global_values (setting_id, suffix, value, method) VALUES (?1, ?2, ?3, ?4)",
            params![global.setting_id, global.suffix, global.value, global.method.as_str()],
        )?;
    }
    for service in &snapshot.services {
        tx.execute(
            "INSERT INTO services (id, method, is_draft) VALUES (?1, ?2, ?3)",
            params![service.id, service.method.as_str(), service.is_draft],
        )?;
    }
    for setting in &snapshot.service_settings {
        tx.execute(
            "INSERT INTO services_settings (service_id, setting_id, suffix, value, method)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                setting.service_id,
                setting.setting_id,
                setting.suffix,
                setting.value,
                setting.method.as_str(),
            ],
        )?;
    }
    Ok(())
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}
