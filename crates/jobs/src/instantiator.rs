//! Turns persisted specs back into live jobs and constraints.

use std::sync::Arc;

use tracing::warn;

use crate::constraint::Constraint;
use crate::error::JobError;
use crate::job::{Job, Parameters};
use crate::registry::{FactoryInput, Registry};
use crate::spec::{ConstraintSpec, JobSpec};

#[derive(Debug, Clone)]
pub struct JobInstantiator {
    registry: Arc<Registry>,
    constraints: ConstraintInstantiator,
}

impl JobInstantiator {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            constraints: ConstraintInstantiator::new(registry.clone()),
            registry,
        }
    }

    pub fn instantiate(&self, spec: &JobSpec, constraints: &[ConstraintSpec]) -> Result<Job, JobError> {
        let factory = self
            .registry
            .job_factory(&spec.factory_key)
            .ok_or_else(|| JobError::UnknownFactory(spec.factory_key.clone()))?;
        let resolved = self
            .constraints
            .instantiate_all(constraints.iter().map(|c| c.factory_key.as_str()));
        let input = FactoryInput {
            serialized_data: spec.serialized_data.as_deref(),
            input_data: spec.serialized_input_data.as_deref(),
            constraints: &resolved,
        };
        let kind = factory.create(&input).map_err(|e| JobError::Instantiation {
            factory_key: spec.factory_key.clone(),
            message: format!("{e:#}"),
        })?;

        Ok(Job::restore(
            parameters_from_spec(spec, constraints),
            kind,
            spec.run_attempt,
            spec.last_run_attempt_time,
            spec.next_backoff_interval,
        ))
    }
}

/// Reconstructs the submission parameters recorded in `spec`.
pub fn parameters_from_spec(spec: &JobSpec, constraints: &[ConstraintSpec]) -> Parameters {
    Parameters {
        id: spec.id.clone(),
        create_time: spec.create_time,
        lifespan: spec.lifespan,
        max_attempts: spec.max_attempts,
        max_instances_for_factory: spec.max_instances_for_factory,
        max_instances_for_queue: spec.max_instances_for_queue,
        queue: spec.queue_key.clone(),
        constraint_keys: constraints.iter().map(|c| c.factory_key.clone()).collect(),
        initial_delay: spec.initial_delay,
        global_priority: spec.global_priority,
        queue_priority: spec.queue_priority,
        input_data: spec.serialized_input_data.clone(),
        memory_only: spec.is_memory_only,
    }
}

#[derive(Debug, Clone)]
pub struct ConstraintInstantiator {
    registry: Arc<Registry>,
}

impl ConstraintInstantiator {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn instantiate(&self, factory_key: &str) -> Result<Box<dyn Constraint>, JobError> {
        self.registry
            .constraint_factory(factory_key)
            .map(|factory| factory.create())
            .ok_or_else(|| JobError::UnknownConstraint(factory_key.to_string()))
    }

    /// Known constraints for `keys`; unknown keys are logged and skipped.
    pub fn instantiate_all<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Vec<Box<dyn Constraint>> {
        keys.into_iter()
            .filter_map(|key| match self.instantiate(key) {
                Ok(constraint) => Some(constraint),
                Err(e) => {
                    warn!(error = %e, "skipping constraint");
                    None
                }
            })
            .collect()
    }

    /// True when every constraint is met. An unknown key is never met.
    pub fn all_met(&self, specs: &[ConstraintSpec]) -> bool {
        specs.iter().all(|spec| match self.instantiate(&spec.factory_key) {
            Ok(constraint) => constraint.is_met(),
            Err(e) => {
                warn!(job_id = %spec.job_id, error = %e, "treating unknown constraint as unmet");
                false
            }
        })
    }
}
