//! SQLite-backed job database.
//!
//! [`JobDatabase`] is synchronous because runners are plain threads, while
//! sqlx is async. Each [`SqliteJobDatabase`] owns a current-thread tokio
//! runtime and blocks on it for every call; callers must therefore never be
//! running inside another tokio runtime.
//!
//! ## Tables
//!
//! | table | contents |
//! |---|---|
//! | `job_spec` | one row per persisted job, in insertion order (`rowid`) |
//! | `constraint_spec` | `(job_id, factory_key)`, unique |
//! | `dependency_spec` | `(job_id, depends_on_job_id, is_within_queue)`, unique on the pair |
//! | `job_meta` | key/value pairs; `version` holds the job schema version |
//!
//! Multi-row writes run inside one transaction, so a failed write leaves the
//! database as it was.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, instrument};

use jobmill_jobs::storage::INITIAL_SCHEMA_VERSION;
use jobmill_jobs::{
    CachedJobStorage, ConstraintSpec, DependencySpec, FullSpec, JobDatabase, JobSpec, StorageError,
};

use crate::config::SqliteConfig;

const SCHEMA: [&str; 7] = [
    r#"
    CREATE TABLE IF NOT EXISTS job_spec (
        id TEXT PRIMARY KEY NOT NULL,
        factory_key TEXT NOT NULL,
        queue_key TEXT,
        create_time INTEGER NOT NULL,
        last_run_attempt_time INTEGER NOT NULL,
        next_backoff_interval INTEGER NOT NULL,
        run_attempt INTEGER NOT NULL,
        max_attempts INTEGER,
        max_instances_for_factory INTEGER,
        max_instances_for_queue INTEGER,
        lifespan INTEGER,
        serialized_data BLOB,
        serialized_input_data BLOB,
        is_running INTEGER NOT NULL DEFAULT 0,
        initial_delay INTEGER NOT NULL DEFAULT 0,
        global_priority INTEGER NOT NULL DEFAULT 0,
        queue_priority INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS constraint_spec (
        job_id TEXT NOT NULL,
        factory_key TEXT NOT NULL,
        UNIQUE (job_id, factory_key) ON CONFLICT IGNORE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dependency_spec (
        job_id TEXT NOT NULL,
        depends_on_job_id TEXT NOT NULL,
        is_within_queue INTEGER NOT NULL DEFAULT 0,
        UNIQUE (job_id, depends_on_job_id) ON CONFLICT IGNORE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_meta (
        key TEXT PRIMARY KEY NOT NULL,
        value INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS job_spec_queue_key_index ON job_spec (queue_key)",
    "CREATE INDEX IF NOT EXISTS constraint_spec_job_id_index ON constraint_spec (job_id)",
    "CREATE INDEX IF NOT EXISTS dependency_spec_depends_on_index ON dependency_spec (depends_on_job_id)",
];

const VERSION_KEY: &str = "version";

/// Durable job rows in a SQLite file (or a private in-memory database).
#[derive(Debug, Clone)]
pub struct SqliteJobDatabase {
    pool: SqlitePool,
    runtime: Arc<Runtime>,
}

impl SqliteJobDatabase {
    /// Connects and creates the schema if needed.
    pub fn open(config: &SqliteConfig) -> anyhow::Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build sqlite runtime")?;
        let pool = runtime.block_on(connect(config))?;
        info!(url = %config.url, "job database opened");

        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
        })
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Self::open(&SqliteConfig::in_memory())
    }

    /// Closes every pooled connection. An in-memory database is gone after this.
    pub fn close(&self) {
        self.runtime.block_on(self.pool.close());
    }

    #[instrument(skip(self), err)]
    pub async fn load_all(&self) -> Result<Vec<FullSpec>, StorageError> {
        let job_rows = sqlx::query("SELECT * FROM job_spec ORDER BY rowid ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_jobs", e))?;
        let constraint_rows = sqlx::query("SELECT job_id, factory_key FROM constraint_spec ORDER BY rowid ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_constraints", e))?;
        let dependency_rows = sqlx::query(
            "SELECT job_id, depends_on_job_id, is_within_queue FROM dependency_spec ORDER BY rowid ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_dependencies", e))?;

        let mut constraints: HashMap<String, Vec<ConstraintSpec>> = HashMap::new();
        for row in &constraint_rows {
            let spec = constraint_from_row(row).map_err(|e| corrupt("constraint_spec", e))?;
            constraints.entry(spec.job_id.clone()).or_default().push(spec);
        }
        let mut dependencies: HashMap<String, Vec<DependencySpec>> = HashMap::new();
        for row in &dependency_rows {
            let spec = dependency_from_row(row).map_err(|e| corrupt("dependency_spec", e))?;
            dependencies.entry(spec.job_id.clone()).or_default().push(spec);
        }

        let mut loaded = Vec::with_capacity(job_rows.len());
        for row in &job_rows {
            let job_spec = job_from_row(row).map_err(|e| corrupt("job_spec", e))?;
            loaded.push(FullSpec {
                constraint_specs: constraints.remove(&job_spec.id).unwrap_or_default(),
                dependency_specs: dependencies.remove(&job_spec.id).unwrap_or_default(),
                job_spec,
            });
        }
        debug!(jobs = loaded.len(), "loaded job rows");
        Ok(loaded)
    }

    #[instrument(skip(self, specs), fields(jobs = specs.len()), err)]
    pub async fn insert_all(&self, specs: &[FullSpec]) -> Result<(), StorageError> {
        if specs.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for full in specs {
            insert_job(&mut tx, &full.job_spec).await?;
            for constraint in &full.constraint_specs {
                sqlx::query("INSERT INTO constraint_spec (job_id, factory_key) VALUES (?, ?)")
                    .bind(&constraint.job_id)
                    .bind(&constraint.factory_key)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("insert_constraint", e))?;
            }
            for dependency in &full.dependency_specs {
                sqlx::query(
                    "INSERT INTO dependency_spec (job_id, depends_on_job_id, is_within_queue) VALUES (?, ?, ?)",
                )
                .bind(&dependency.job_id)
                .bind(&dependency.depends_on_job_id)
                .bind(dependency.is_within_queue)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("insert_dependency", e))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self, specs), fields(jobs = specs.len()), err)]
    pub async fn update_all(&self, specs: &[JobSpec]) -> Result<(), StorageError> {
        if specs.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for spec in specs {
            sqlx::query(
                r#"
                UPDATE job_spec SET
                    factory_key = ?,
                    queue_key = ?,
                    create_time = ?,
                    last_run_attempt_time = ?,
                    next_backoff_interval = ?,
                    run_attempt = ?,
                    max_attempts = ?,
                    max_instances_for_factory = ?,
                    max_instances_for_queue = ?,
                    lifespan = ?,
                    serialized_data = ?,
                    serialized_input_data = ?,
                    is_running = ?,
                    initial_delay = ?,
                    global_priority = ?,
                    queue_priority = ?
                WHERE id = ?
                "#,
            )
            .bind(&spec.factory_key)
            .bind(spec.queue_key.as_deref())
            .bind(spec.create_time)
            .bind(spec.last_run_attempt_time)
            .bind(spec.next_backoff_interval)
            .bind(i64::from(spec.run_attempt))
            .bind(spec.max_attempts.map(i64::from))
            .bind(spec.max_instances_for_factory.map(i64::from))
            .bind(spec.max_instances_for_queue.map(i64::from))
            .bind(spec.lifespan)
            .bind(spec.serialized_data.as_deref())
            .bind(spec.serialized_input_data.as_deref())
            .bind(spec.is_running)
            .bind(spec.initial_delay)
            .bind(spec.global_priority)
            .bind(spec.queue_priority)
            .bind(&spec.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_job", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    /// Deletes jobs, their constraints, and every edge touching them.
    #[instrument(skip(self, ids), fields(jobs = ids.len()), err)]
    pub async fn delete_all(&self, ids: &[String]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for id in ids {
            sqlx::query("DELETE FROM job_spec WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_job", e))?;
            sqlx::query("DELETE FROM constraint_spec WHERE job_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_constraints", e))?;
            sqlx::query("DELETE FROM dependency_spec WHERE job_id = ? OR depends_on_job_id = ?")
                .bind(id)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_dependencies", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    pub async fn delete_edges(&self, specs: &[DependencySpec]) -> Result<(), StorageError> {
        if specs.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for spec in specs {
            sqlx::query("DELETE FROM dependency_spec WHERE job_id = ? AND depends_on_job_id = ?")
                .bind(&spec.job_id)
                .bind(&spec.depends_on_job_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_dependency", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    pub async fn mark_running(&self, id: &str, now: i64) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE job_spec SET is_running = 1, last_run_attempt_time = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_job_as_running", e))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn record_retry(
        &self,
        id: &str,
        now: i64,
        run_attempt: u32,
        next_backoff_interval: i64,
        serialized_data: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE job_spec SET
                is_running = 0,
                run_attempt = ?,
                last_run_attempt_time = ?,
                next_backoff_interval = ?,
                serialized_data = ?
            WHERE id = ?
            "#,
        )
        .bind(i64::from(run_attempt))
        .bind(now)
        .bind(next_backoff_interval)
        .bind(serialized_data)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job_after_retry", e))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn reset_running(&self) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE job_spec SET is_running = 0 WHERE is_running != 0")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_all_jobs_to_be_pending", e))?;
        debug!(jobs = result.rows_affected(), "reset running jobs to pending");
        Ok(())
    }

    pub async fn read_version(&self) -> Result<u32, StorageError> {
        let row = sqlx::query("SELECT value FROM job_meta WHERE key = ?")
            .bind(VERSION_KEY)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("schema_version", e))?;

        let Some(row) = row else {
            return Ok(INITIAL_SCHEMA_VERSION);
        };
        let value: i64 = row
            .try_get("value")
            .map_err(|e| corrupt("job_meta", e))?;
        u32::try_from(value)
            .map_err(|_| StorageError::Corrupt(format!("schema version out of range: {value}")))
    }

    pub async fn write_version(&self, version: u32) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO job_meta (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(VERSION_KEY)
        .bind(i64::from(version))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_schema_version", e))?;
        Ok(())
    }
}

impl JobDatabase for SqliteJobDatabase {
    fn load(&self) -> Result<Vec<FullSpec>, StorageError> {
        self.runtime.block_on(self.load_all())
    }

    fn insert_jobs(&self, specs: &[FullSpec]) -> Result<(), StorageError> {
        self.runtime.block_on(self.insert_all(specs))
    }

    fn update_jobs(&self, specs: &[JobSpec]) -> Result<(), StorageError> {
        self.runtime.block_on(self.update_all(specs))
    }

    fn delete_jobs(&self, ids: &[String]) -> Result<(), StorageError> {
        self.runtime.block_on(self.delete_all(ids))
    }

    fn delete_dependency_specs(&self, specs: &[DependencySpec]) -> Result<(), StorageError> {
        self.runtime.block_on(self.delete_edges(specs))
    }

    fn mark_job_as_running(&self, id: &str, now: i64) -> Result<(), StorageError> {
        self.runtime.block_on(self.mark_running(id, now))
    }

    fn update_job_after_retry(
        &self,
        id: &str,
        now: i64,
        run_attempt: u32,
        next_backoff_interval: i64,
        serialized_data: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        self.runtime.block_on(self.record_retry(
            id,
            now,
            run_attempt,
            next_backoff_interval,
            serialized_data,
        ))
    }

    fn update_all_jobs_to_be_pending(&self) -> Result<(), StorageError> {
        self.runtime.block_on(self.reset_running())
    }

    fn schema_version(&self) -> Result<u32, StorageError> {
        self.runtime.block_on(self.read_version())
    }

    fn set_schema_version(&self, version: u32) -> Result<(), StorageError> {
        self.runtime.block_on(self.write_version(version))
    }
}

/// Opens the database and wraps it in the in-memory cache the controller
/// schedules from. The cache is filled by `JobStorage::init`.
pub fn open_job_storage(config: &SqliteConfig) -> anyhow::Result<CachedJobStorage<SqliteJobDatabase>> {
    Ok(CachedJobStorage::new(SqliteJobDatabase::open(config)?))
}

async fn connect(config: &SqliteConfig) -> anyhow::Result<SqlitePool> {
    let mut options = SqliteConnectOptions::from_str(&config.url)
        .with_context(|| format!("invalid sqlite url: {}", config.url))?
        .create_if_missing(true);

    // An in-memory database lives exactly as long as its one connection.
    let pool_options = if config.is_in_memory() {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        options = options.journal_mode(SqliteJournalMode::Wal);
        SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
    };

    let pool = pool_options
        .connect_with(options)
        .await
        .with_context(|| format!("failed to connect to {}", config.url))?;

    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(&pool)
            .await
            .context("failed to create job tables")?;
    }
    Ok(pool)
}

async fn insert_job(tx: &mut Transaction<'_, Sqlite>, spec: &JobSpec) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO job_spec (
            id,
            factory_key,
            queue_key,
            create_time,
            last_run_attempt_time,
            next_backoff_interval,
            run_attempt,
            max_attempts,
            max_instances_for_factory,
            max_instances_for_queue,
            lifespan,
            serialized_data,
            serialized_input_data,
            is_running,
            initial_delay,
            global_priority,
            queue_priority
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&spec.id)
    .bind(&spec.factory_key)
    .bind(spec.queue_key.as_deref())
    .bind(spec.create_time)
    .bind(spec.last_run_attempt_time)
    .bind(spec.next_backoff_interval)
    .bind(i64::from(spec.run_attempt))
    .bind(spec.max_attempts.map(i64::from))
    .bind(spec.max_instances_for_factory.map(i64::from))
    .bind(spec.max_instances_for_queue.map(i64::from))
    .bind(spec.lifespan)
    .bind(spec.serialized_data.as_deref())
    .bind(spec.serialized_input_data.as_deref())
    .bind(spec.is_running)
    .bind(spec.initial_delay)
    .bind(spec.global_priority)
    .bind(spec.queue_priority)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_job", e))?;
    Ok(())
}

fn job_from_row(row: &SqliteRow) -> Result<JobSpec, sqlx::Error> {
    Ok(JobSpec {
        id: row.try_get("id")?,
        factory_key: row.try_get("factory_key")?,
        queue_key: row.try_get("queue_key")?,
        create_time: row.try_get("create_time")?,
        last_run_attempt_time: row.try_get("last_run_attempt_time")?,
        next_backoff_interval: row.try_get("next_backoff_interval")?,
        run_attempt: to_u32(row.try_get("run_attempt")?)?,
        max_attempts: row.try_get::<Option<i64>, _>("max_attempts")?.map(to_u32).transpose()?,
        max_instances_for_factory: row
            .try_get::<Option<i64>, _>("max_instances_for_factory")?
            .map(to_u32)
            .transpose()?,
        max_instances_for_queue: row
            .try_get::<Option<i64>, _>("max_instances_for_queue")?
            .map(to_u32)
            .transpose()?,
        lifespan: row.try_get("lifespan")?,
        serialized_data: row.try_get("serialized_data")?,
        serialized_input_data: row.try_get("serialized_input_data")?,
        is_running: row.try_get("is_running")?,
        is_memory_only: false,
        initial_delay: row.try_get("initial_delay")?,
        global_priority: row.try_get("global_priority")?,
        queue_priority: row.try_get("queue_priority")?,
    })
}

fn constraint_from_row(row: &SqliteRow) -> Result<ConstraintSpec, sqlx::Error> {
    Ok(ConstraintSpec {
        job_id: row.try_get("job_id")?,
        factory_key: row.try_get("factory_key")?,
        is_memory_only: false,
    })
}

fn dependency_from_row(row: &SqliteRow) -> Result<DependencySpec, sqlx::Error> {
    Ok(DependencySpec {
        job_id: row.try_get("job_id")?,
        depends_on_job_id: row.try_get("depends_on_job_id")?,
        is_within_queue: row.try_get("is_within_queue")?,
        is_memory_only: false,
    })
}

fn to_u32(value: i64) -> Result<u32, sqlx::Error> {
    u32::try_from(value).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn corrupt(table: &str, err: sqlx::Error) -> StorageError {
    StorageError::Corrupt(format!("failed to decode {table} row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            StorageError::Database(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StorageError::Database(format!("connection pool closed in {}", operation))
        }
        _ => StorageError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> JobSpec {
        JobSpec {
            id: id.to_string(),
            factory_key: "sync".to_string(),
            queue_key: Some("contacts".to_string()),
            create_time: 10,
            last_run_attempt_time: 0,
            next_backoff_interval: 0,
            run_attempt: 0,
            max_attempts: Some(3),
            max_instances_for_factory: None,
            max_instances_for_queue: Some(1),
            lifespan: Some(60_000),
            serialized_data: Some(b"state".to_vec()),
            serialized_input_data: None,
            is_running: false,
            is_memory_only: false,
            initial_delay: 0,
            global_priority: 1,
            queue_priority: -1,
        }
    }

    fn full(id: &str, depends_on: &[&str]) -> FullSpec {
        let mut full = FullSpec::new(spec(id));
        full.constraint_specs.push(ConstraintSpec {
            job_id: id.to_string(),
            factory_key: "NetworkConstraint".to_string(),
            is_memory_only: false,
        });
        for parent in depends_on {
            full.dependency_specs.push(DependencySpec {
                job_id: id.to_string(),
                depends_on_job_id: parent.to_string(),
                is_within_queue: false,
                is_memory_only: false,
            });
        }
        full
    }

    fn database() -> SqliteJobDatabase {
        SqliteJobDatabase::in_memory().unwrap()
    }

    #[test]
    fn inserted_jobs_load_back_in_insertion_order() {
        let db = database();
        db.insert_jobs(&[full("b", &[]), full("a", &["b"])]).unwrap();

        let loaded = db.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], full("b", &[]));
        assert_eq!(loaded[1], full("a", &["b"]));
    }

    #[test]
    fn nullable_columns_round_trip_as_none() {
        let db = database();
        let mut bare = spec("bare");
        bare.queue_key = None;
        bare.max_attempts = None;
        bare.max_instances_for_queue = None;
        bare.lifespan = None;
        bare.serialized_data = None;
        db.insert_jobs(&[FullSpec::new(bare.clone())]).unwrap();

        assert_eq!(db.load().unwrap()[0].job_spec, bare);
    }

    #[test]
    fn duplicate_constraint_and_dependency_rows_are_ignored() {
        let db = database();
        let mut doubled = full("a", &["z"]);
        doubled.constraint_specs.push(doubled.constraint_specs[0].clone());
        doubled.dependency_specs.push(doubled.dependency_specs[0].clone());
        db.insert_jobs(&[doubled]).unwrap();

        let loaded = db.load().unwrap();
        assert_eq!(loaded[0].constraint_specs.len(), 1);
        assert_eq!(loaded[0].dependency_specs.len(), 1);
    }

    #[test]
    fn update_replaces_every_column_and_ignores_unknown_ids() {
        let db = database();
        db.insert_jobs(&[full("a", &[])]).unwrap();

        let mut changed = spec("a");
        changed.serialized_data = Some(b"migrated".to_vec());
        changed.global_priority = -1;
        changed.max_attempts = None;
        db.update_jobs(&[changed.clone(), spec("ghost")]).unwrap();

        let loaded = db.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].job_spec, changed);
    }

    #[test]
    fn delete_removes_constraints_and_edges_in_both_directions() {
        let db = database();
        db.insert_jobs(&[full("a", &[]), full("b", &["a"]), full("c", &["b"])])
            .unwrap();

        db.delete_jobs(&["b".to_string()]).unwrap();

        let loaded = db.load().unwrap();
        let ids: Vec<_> = loaded.iter().map(|f| f.job_spec.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(loaded.iter().all(|f| f.dependency_specs.is_empty()));
        assert_eq!(loaded[1].constraint_specs.len(), 1);
    }

    #[test]
    fn delete_dependency_specs_removes_only_the_named_edges() {
        let db = database();
        let both = full("c", &["a", "b"]);
        db.insert_jobs(&[full("a", &[]), full("b", &[]), both.clone()])
            .unwrap();

        db.delete_dependency_specs(&both.dependency_specs[..1]).unwrap();

        let remaining = &db.load().unwrap()[2].dependency_specs;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].depends_on_job_id, "b");
    }

    #[test]
    fn running_flag_and_retry_bookkeeping_persist() {
        let db = database();
        db.insert_jobs(&[full("a", &[])]).unwrap();

        db.mark_job_as_running("a", 500).unwrap();
        let running = db.load().unwrap().remove(0).job_spec;
        assert!(running.is_running);
        assert_eq!(running.last_run_attempt_time, 500);

        db.update_job_after_retry("a", 700, 1, 2_000, Some(b"next")).unwrap();
        let retried = db.load().unwrap().remove(0).job_spec;
        assert!(!retried.is_running);
        assert_eq!(retried.run_attempt, 1);
        assert_eq!(retried.last_run_attempt_time, 700);
        assert_eq!(retried.next_backoff_interval, 2_000);
        assert_eq!(retried.serialized_data.as_deref(), Some(&b"next"[..]));
    }

    #[test]
    fn writes_to_missing_jobs_report_not_found() {
        let db = database();
        assert_eq!(
            db.mark_job_as_running("ghost", 1),
            Err(StorageError::NotFound("ghost".to_string()))
        );
        assert_eq!(
            db.update_job_after_retry("ghost", 1, 1, 10, None),
            Err(StorageError::NotFound("ghost".to_string()))
        );
    }

    #[test]
    fn update_all_jobs_to_be_pending_clears_running_flags() {
        let db = database();
        db.insert_jobs(&[full("a", &[]), full("b", &[])]).unwrap();
        db.mark_job_as_running("a", 1).unwrap();
        db.mark_job_as_running("b", 1).unwrap();

        db.update_all_jobs_to_be_pending().unwrap();

        assert!(db.load().unwrap().iter().all(|f| !f.job_spec.is_running));
    }

    #[test]
    fn schema_version_defaults_then_persists() {
        let db = database();
        assert_eq!(db.schema_version().unwrap(), INITIAL_SCHEMA_VERSION);

        db.set_schema_version(4).unwrap();
        db.set_schema_version(5).unwrap();
        assert_eq!(db.schema_version().unwrap(), 5);
    }

    #[test]
    fn out_of_range_counters_are_reported_as_corrupt() {
        let db = database();
        db.insert_jobs(&[full("a", &[])]).unwrap();
        db.runtime
            .block_on(
                sqlx::query("UPDATE job_spec SET run_attempt = -1 WHERE id = 'a'").execute(&db.pool),
            )
            .unwrap();

        assert!(matches!(db.load(), Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn closed_pool_surfaces_a_database_error() {
        let db = database();
        db.close();
        assert!(matches!(db.load(), Err(StorageError::Database(_))));
    }
}
