//! Durable background jobs: persistence, dependencies, constraints, retries,
//! and a demand-scaled pool of runner threads.

pub mod clock;
pub mod config;
pub mod constraint;
pub mod controller;
pub mod error;
pub mod instantiator;
pub mod job;
pub mod manager;
pub mod migrator;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod spec;
pub mod storage;
pub mod tracker;

pub use config::JobManagerConfig;
pub use controller::EmptyQueueListenerId;
pub use error::{JobError, MigrationError, StorageError};
pub use job::{
    BackoffStrategy, Job, JobContext, JobKind, JobResult, MIGRATION_QUEUE_KEY, PRIORITY_DEFAULT,
    PRIORITY_HIGH, PRIORITY_LOW, Parameters, RetryPolicy,
};
pub use manager::{Chain, JobManager, JobManagerBuilder};
pub use registry::{FactoryInput, Registry};
pub use runner::JobPredicate;
pub use spec::{ConstraintSpec, DependencySpec, FullSpec, JobSpec};
pub use storage::{CachedJobStorage, JobDatabase, JobStorage};
pub use tracker::{JobState, JobUpdate, Subscription};
