//! Persisted records: job, constraint, and dependency specs.

use serde::{Deserialize, Serialize};

/// The durable form of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: String,
    pub factory_key: String,
    pub queue_key: Option<String>,
    pub create_time: i64,
    pub last_run_attempt_time: i64,
    pub next_backoff_interval: i64,
    pub run_attempt: u32,
    pub max_attempts: Option<u32>,
    pub max_instances_for_factory: Option<u32>,
    pub max_instances_for_queue: Option<u32>,
    pub lifespan: Option<i64>,
    pub serialized_data: Option<Vec<u8>>,
    pub serialized_input_data: Option<Vec<u8>>,
    pub is_running: bool,
    pub is_memory_only: bool,
    pub initial_delay: i64,
    pub global_priority: i32,
    pub queue_priority: i32,
}

impl JobSpec {
    /// Whether the job's backoff and initial delay have both elapsed.
    ///
    /// A last attempt stamped in the future means the clock moved backwards;
    /// such jobs are treated as due rather than stranded.
    pub fn is_due(&self, now: i64) -> bool {
        if now < self.create_time.saturating_add(self.initial_delay) {
            return false;
        }
        if self.last_run_attempt_time > now {
            return true;
        }
        now >= self
            .last_run_attempt_time
            .saturating_add(self.next_backoff_interval)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub job_id: String,
    pub factory_key: String,
    pub is_memory_only: bool,
}

/// `job_id` may not run until `depends_on_job_id` has left storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencySpec {
    pub job_id: String,
    pub depends_on_job_id: String,
    pub is_within_queue: bool,
    pub is_memory_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullSpec {
    pub job_spec: JobSpec,
    pub constraint_specs: Vec<ConstraintSpec>,
    pub dependency_specs: Vec<DependencySpec>,
}

impl FullSpec {
    pub fn new(job_spec: JobSpec) -> Self {
        Self {
            job_spec,
            constraint_specs: Vec::new(),
            dependency_specs: Vec::new(),
        }
    }

    /// The parts of this spec that belong in the durable database.
    pub fn persistent_part(&self) -> Option<FullSpec> {
        if self.job_spec.is_memory_only {
            return None;
        }
        Some(FullSpec {
            job_spec: self.job_spec.clone(),
            constraint_specs: self
                .constraint_specs
                .iter()
                .filter(|c| !c.is_memory_only)
                .cloned()
                .collect(),
            dependency_specs: self
                .dependency_specs
                .iter()
                .filter(|d| !d.is_memory_only)
                .cloned()
                .collect(),
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn job_spec(id: &str, factory_key: &str) -> JobSpec {
        JobSpec {
            id: id.to_string(),
            factory_key: factory_key.to_string(),
            queue_key: None,
            create_time: 1,
            last_run_attempt_time: 0,
            next_backoff_interval: 0,
            run_attempt: 0,
            max_attempts: Some(1),
            max_instances_for_factory: None,
            max_instances_for_queue: None,
            lifespan: None,
            serialized_data: None,
            serialized_input_data: None,
            is_running: false,
            is_memory_only: false,
            initial_delay: 0,
            global_priority: 0,
            queue_priority: 0,
        }
    }

    pub fn queued(id: &str, queue: &str, create_time: i64) -> JobSpec {
        JobSpec {
            queue_key: Some(queue.to_string()),
            create_time,
            ..job_spec(id, "f1")
        }
    }

    pub fn dependency(job_id: &str, depends_on: &str) -> DependencySpec {
        DependencySpec {
            job_id: job_id.to_string(),
            depends_on_job_id: depends_on.to_string(),
            is_within_queue: false,
            is_memory_only: false,
        }
    }

    pub fn constraint(job_id: &str, key: &str) -> ConstraintSpec {
        ConstraintSpec {
            job_id: job_id.to_string(),
            factory_key: key.to_string(),
            is_memory_only: false,
        }
    }
}
