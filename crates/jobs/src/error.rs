//! Error types shared by the job subsystem.

use thiserror::Error;

/// Failures raised by job storage and its durable database.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

/// Invalid migration chains, detected when the migrator is built.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MigrationError {
    #[error("job migrations are not contiguous: expected end version {expected}, found {found}")]
    NonContiguous { expected: u32, found: u32 },

    #[error("job migrations end at version {found}, but the current version is {expected}")]
    WrongEndVersion { expected: u32, found: u32 },
}

/// Errors surfaced by the controller and the job manager facade.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("no job factory registered for key: {0}")]
    UnknownFactory(String),

    #[error("no constraint factory registered for key: {0}")]
    UnknownConstraint(String),

    #[error("failed to instantiate job {factory_key}: {message}")]
    Instantiation { factory_key: String, message: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("backoff interval must be positive, got {0}ms")]
    InvalidBackoff(i64),

    #[error("job manager is shut down")]
    Shutdown,
}
