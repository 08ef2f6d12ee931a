//! Factory lookup tables, built once at startup and shared read-only.

use std::collections::HashMap;
use std::fmt;

use crate::constraint::Constraint;
use crate::job::JobKind;

/// Everything a factory gets to rebuild a job.
pub struct FactoryInput<'a> {
    /// Bytes the job produced from `JobKind::serialize`.
    pub serialized_data: Option<&'a [u8]>,
    /// Output handed down by an upstream job.
    pub input_data: Option<&'a [u8]>,
    pub constraints: &'a [Box<dyn Constraint>],
}

/// Rebuilds a job's behaviour from its persisted state.
pub trait JobFactory: Send + Sync {
    fn create(&self, input: &FactoryInput<'_>) -> anyhow::Result<Box<dyn JobKind>>;
}

impl<F> JobFactory for F
where
    F: Fn(&FactoryInput<'_>) -> anyhow::Result<Box<dyn JobKind>> + Send + Sync,
{
    fn create(&self, input: &FactoryInput<'_>) -> anyhow::Result<Box<dyn JobKind>> {
        self(input)
    }
}

pub trait ConstraintFactory: Send + Sync {
    fn create(&self) -> Box<dyn Constraint>;
}

impl<F> ConstraintFactory for F
where
    F: Fn() -> Box<dyn Constraint> + Send + Sync,
{
    fn create(&self) -> Box<dyn Constraint> {
        self()
    }
}

/// Job and constraint factories keyed by factory key.
#[derive(Default)]
pub struct Registry {
    jobs: HashMap<String, Box<dyn JobFactory>>,
    constraints: HashMap<String, Box<dyn ConstraintFactory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later registrations under the same key replace earlier ones.
    pub fn register_job<F>(&mut self, factory_key: impl Into<String>, factory: F)
    where
        F: Fn(&FactoryInput<'_>) -> anyhow::Result<Box<dyn JobKind>> + Send + Sync + 'static,
    {
        self.register_job_factory(factory_key, factory);
    }

    pub fn register_job_factory(&mut self, factory_key: impl Into<String>, factory: impl JobFactory + 'static) {
        self.jobs.insert(factory_key.into(), Box::new(factory));
    }

    pub fn register_constraint<F>(&mut self, factory_key: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Constraint> + Send + Sync + 'static,
    {
        self.register_constraint_factory(factory_key, factory);
    }

    pub fn register_constraint_factory(
        &mut self,
        factory_key: impl Into<String>,
        factory: impl ConstraintFactory + 'static,
    ) {
        self.constraints.insert(factory_key.into(), Box::new(factory));
    }

    pub fn job_factory(&self, factory_key: &str) -> Option<&dyn JobFactory> {
        self.jobs.get(factory_key).map(|f| f.as_ref())
    }

    pub fn constraint_factory(&self, factory_key: &str) -> Option<&dyn ConstraintFactory> {
        self.constraints.get(factory_key).map(|f| f.as_ref())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut jobs: Vec<&String> = self.jobs.keys().collect();
        let mut constraints: Vec<&String> = self.constraints.keys().collect();
        jobs.sort();
        constraints.sort();
        f.debug_struct("Registry")
            .field("jobs", &jobs)
            .field("constraints", &constraints)
            .finish()
    }
}
