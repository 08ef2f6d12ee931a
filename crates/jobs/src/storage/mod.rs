//! Job storage: the in-memory source of truth for scheduling decisions.
//!
//! [`JobStorage`] is what the controller talks to. The bundled
//! [`CachedJobStorage`] keeps every spec in memory and writes durable changes
//! through to a [`JobDatabase`] before touching its cache, so a failed write
//! leaves the cache exactly as it was.

use std::sync::Arc;

use crate::error::StorageError;
use crate::spec::{ConstraintSpec, DependencySpec, FullSpec, JobSpec};

mod cached;
mod memory;

pub use cached::CachedJobStorage;
pub use memory::{DatabaseOp, InMemoryJobDatabase};

/// Schema version a fresh database starts at.
pub const INITIAL_SCHEMA_VERSION: u32 = 1;

/// Query and mutation surface used by the controller.
pub trait JobStorage: Send + Sync {
    /// Loads persisted state. Must be called once before anything else.
    fn init(&self) -> Result<(), StorageError>;

    fn insert_jobs(&self, specs: Vec<FullSpec>) -> Result<(), StorageError>;

    fn get_job_spec(&self, id: &str) -> Option<JobSpec>;

    fn get_all_job_specs(&self) -> Vec<JobSpec>;

    fn get_all_matching_filter(&self, filter: &dyn Fn(&JobSpec) -> bool) -> Vec<JobSpec>;

    /// Replaces the stored specs with matching ids. Unknown ids are ignored.
    fn update_jobs(&self, specs: &[JobSpec]) -> Result<(), StorageError>;

    /// Rewrites every job through `transformer`, persisting those that changed.
    fn transform_jobs(&self, transformer: &dyn Fn(&JobSpec) -> JobSpec)
    -> Result<(), StorageError>;

    fn delete_job(&self, id: &str) -> Result<(), StorageError> {
        self.delete_jobs(&[id.to_string()])
    }

    /// Removes jobs together with their constraints and every dependency
    /// edge in which they take part.
    fn delete_jobs(&self, ids: &[String]) -> Result<(), StorageError>;

    /// Every stored job, running or not.
    fn get_job_count(&self) -> usize;

    fn get_job_count_for_factory(&self, factory_key: &str) -> usize;

    fn get_job_count_for_factory_and_queue(&self, factory_key: &str, queue_key: &str) -> usize;

    fn get_jobs_in_queue(&self, queue_key: &str) -> Vec<JobSpec>;

    fn are_queues_empty(&self, queue_keys: &[String]) -> bool;

    /// The single best job to run now, if any.
    ///
    /// `constraints_met` is asked about the job's constraint specs and
    /// `runner_predicate` about the job itself; both must agree.
    fn get_next_eligible_job(
        &self,
        now: i64,
        constraints_met: &dyn Fn(&[ConstraintSpec]) -> bool,
        runner_predicate: &dyn Fn(&JobSpec) -> bool,
    ) -> Option<JobSpec>;

    /// How many jobs could start now, ignoring constraints.
    fn get_eligible_job_count(&self, now: i64) -> usize;

    fn get_constraint_specs(&self, job_id: &str) -> Vec<ConstraintSpec>;

    /// Every dependency edge downstream of `job_id`, transitively.
    fn get_dependency_specs_that_depend_on_job(&self, job_id: &str) -> Vec<DependencySpec>;

    fn get_all_dependency_specs(&self) -> Vec<DependencySpec>;

    fn get_all_constraint_specs(&self) -> Vec<ConstraintSpec>;

    fn mark_job_as_running(&self, id: &str, now: i64) -> Result<(), StorageError>;

    fn update_job_after_retry(
        &self,
        id: &str,
        now: i64,
        run_attempt: u32,
        next_backoff_interval: i64,
        serialized_data: Option<Vec<u8>>,
    ) -> Result<(), StorageError>;

    fn update_all_jobs_to_be_pending(&self) -> Result<(), StorageError>;

    fn schema_version(&self) -> Result<u32, StorageError>;

    fn set_schema_version(&self, version: u32) -> Result<(), StorageError>;
}

/// Durable backing store for [`CachedJobStorage`].
///
/// Only ever receives rows that are not memory-only.
pub trait JobDatabase: Send + Sync {
    /// Every persisted job, in insertion order.
    fn load(&self) -> Result<Vec<FullSpec>, StorageError>;

    fn insert_jobs(&self, specs: &[FullSpec]) -> Result<(), StorageError>;

    fn update_jobs(&self, specs: &[JobSpec]) -> Result<(), StorageError>;

    fn delete_jobs(&self, ids: &[String]) -> Result<(), StorageError>;

    fn delete_dependency_specs(&self, specs: &[DependencySpec]) -> Result<(), StorageError>;

    fn mark_job_as_running(&self, id: &str, now: i64) -> Result<(), StorageError>;

    fn update_job_after_retry(
        &self,
        id: &str,
        now: i64,
        run_attempt: u32,
        next_backoff_interval: i64,
        serialized_data: Option<&[u8]>,
    ) -> Result<(), StorageError>;

    fn update_all_jobs_to_be_pending(&self) -> Result<(), StorageError>;

    fn schema_version(&self) -> Result<u32, StorageError>;

    fn set_schema_version(&self, version: u32) -> Result<(), StorageError>;
}

impl<D> JobDatabase for Arc<D>
where
    D: JobDatabase + ?Sized,
{
    fn load(&self) -> Result<Vec<FullSpec>, StorageError> {
        (**self).load()
    }

    fn insert_jobs(&self, specs: &[FullSpec]) -> Result<(), StorageError> {
        (**self).insert_jobs(specs)
    }

    fn update_jobs(&self, specs: &[JobSpec]) -> Result<(), StorageError> {
        (**self).update_jobs(specs)
    }

    fn delete_jobs(&self, ids: &[String]) -> Result<(), StorageError> {
        (**self).delete_jobs(ids)
    }

    fn delete_dependency_specs(&self, specs: &[DependencySpec]) -> Result<(), StorageError> {
        (**self).delete_dependency_specs(specs)
    }

    fn mark_job_as_running(&self, id: &str, now: i64) -> Result<(), StorageError> {
        (**self).mark_job_as_running(id, now)
    }

    fn update_job_after_retry(
        &self,
        id: &str,
        now: i64,
        run_attempt: u32,
        next_backoff_interval: i64,
        serialized_data: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        (**self).update_job_after_retry(id, now, run_attempt, next_backoff_interval, serialized_data)
    }

    fn update_all_jobs_to_be_pending(&self) -> Result<(), StorageError> {
        (**self).update_all_jobs_to_be_pending()
    }

    fn schema_version(&self) -> Result<u32, StorageError> {
        (**self).schema_version()
    }

    fn set_schema_version(&self, version: u32) -> Result<(), StorageError> {
        (**self).set_schema_version(version)
    }
}
