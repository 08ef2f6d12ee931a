//! Volatile [`JobDatabase`] for tests and development.
//!
//! Outlives the storage built on top of it, so dropping a
//! `CachedJobStorage` and building a fresh one over the same database
//! behaves like a process restart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{INITIAL_SCHEMA_VERSION, JobDatabase};
use crate::error::StorageError;
use crate::spec::{ConstraintSpec, DependencySpec, FullSpec, JobSpec};

/// A write that reached the database, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseOp {
    Insert(Vec<String>),
    Update(Vec<String>),
    Delete(Vec<String>),
    DeleteDependencies(usize),
    MarkRunning(String),
    UpdateAfterRetry(String),
    ResetRunning,
    SetVersion(u32),
}

#[derive(Debug, Default)]
struct Tables {
    jobs: Vec<JobSpec>,
    constraints: Vec<ConstraintSpec>,
    dependencies: Vec<DependencySpec>,
    version: Option<u32>,
    ops: Vec<DatabaseOp>,
}

#[derive(Debug, Default)]
pub struct InMemoryJobDatabase {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
}

impl InMemoryJobDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail until switched back off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn operations(&self) -> Vec<DatabaseOp> {
        self.tables().ops.clone()
    }

    pub fn clear_operations(&self) {
        self.tables().ops.clear();
    }

    pub fn job_specs(&self) -> Vec<JobSpec> {
        self.tables().jobs.clone()
    }

    pub fn dependency_specs(&self) -> Vec<DependencySpec> {
        self.tables().dependencies.clone()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writable(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Database("write rejected".to_string()));
        }
        Ok(self.tables())
    }
}

impl JobDatabase for InMemoryJobDatabase {
    fn load(&self) -> Result<Vec<FullSpec>, StorageError> {
        let tables = self.tables();
        Ok(tables
            .jobs
            .iter()
            .map(|job| FullSpec {
                job_spec: job.clone(),
                constraint_specs: tables
                    .constraints
                    .iter()
                    .filter(|c| c.job_id == job.id)
                    .cloned()
                    .collect(),
                dependency_specs: tables
                    .dependencies
                    .iter()
                    .filter(|d| d.job_id == job.id)
                    .cloned()
                    .collect(),
            })
            .collect())
    }

    fn insert_jobs(&self, specs: &[FullSpec]) -> Result<(), StorageError> {
        let mut tables = self.writable()?;
        for spec in specs {
            tables.jobs.retain(|j| j.id != spec.job_spec.id);
            tables.jobs.push(spec.job_spec.clone());
            tables.constraints.extend(spec.constraint_specs.iter().cloned());
            tables.dependencies.extend(spec.dependency_specs.iter().cloned());
        }
        let ids = specs.iter().map(|s| s.job_spec.id.clone()).collect();
        tables.ops.push(DatabaseOp::Insert(ids));
        Ok(())
    }

    fn update_jobs(&self, specs: &[JobSpec]) -> Result<(), StorageError> {
        let mut tables = self.writable()?;
        for spec in specs {
            if let Some(existing) = tables.jobs.iter_mut().find(|j| j.id == spec.id) {
                *existing = spec.clone();
            }
        }
        let ids = specs.iter().map(|s| s.id.clone()).collect();
        tables.ops.push(DatabaseOp::Update(ids));
        Ok(())
    }

    fn delete_jobs(&self, ids: &[String]) -> Result<(), StorageError> {
        let mut tables = self.writable()?;
        tables.jobs.retain(|j| !ids.contains(&j.id));
        tables.constraints.retain(|c| !ids.contains(&c.job_id));
        tables
            .dependencies
            .retain(|d| !ids.contains(&d.job_id) && !ids.contains(&d.depends_on_job_id));
        tables.ops.push(DatabaseOp::Delete(ids.to_vec()));
        Ok(())
    }

    fn delete_dependency_specs(&self, specs: &[DependencySpec]) -> Result<(), StorageError> {
        let mut tables = self.writable()?;
        tables.dependencies.retain(|d| !specs.contains(d));
        tables.ops.push(DatabaseOp::DeleteDependencies(specs.len()));
        Ok(())
    }

    fn mark_job_as_running(&self, id: &str, now: i64) -> Result<(), StorageError> {
        let mut tables = self.writable()?;
        let job = tables
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        job.is_running = true;
        job.last_run_attempt_time = now;
        tables.ops.push(DatabaseOp::MarkRunning(id.to_string()));
        Ok(())
    }

    fn update_job_after_retry(
        &self,
        id: &str,
        now: i64,
        run_attempt: u32,
        next_backoff_interval: i64,
        serialized_data: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        let mut tables = self.writable()?;
        let job = tables
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        job.is_running = false;
        job.run_attempt = run_attempt;
        job.last_run_attempt_time = now;
        job.next_backoff_interval = next_backoff_interval;
        job.serialized_data = serialized_data.map(<[u8]>::to_vec);
        tables.ops.push(DatabaseOp::UpdateAfterRetry(id.to_string()));
        Ok(())
    }

    fn update_all_jobs_to_be_pending(&self) -> Result<(), StorageError> {
        let mut tables = self.writable()?;
        for job in &mut tables.jobs {
            job.is_running = false;
        }
        tables.ops.push(DatabaseOp::ResetRunning);
        Ok(())
    }

    fn schema_version(&self) -> Result<u32, StorageError> {
        Ok(self.tables().version.unwrap_or(INITIAL_SCHEMA_VERSION))
    }

    fn set_schema_version(&self, version: u32) -> Result<(), StorageError> {
        let mut tables = self.writable()?;
        tables.version = Some(version);
        tables.ops.push(DatabaseOp::SetVersion(version));
        Ok(())
    }
}
