//! Infrastructure layer: durable job storage and its configuration.

pub mod config;
pub mod sqlite;

pub use config::SqliteConfig;
pub use sqlite::{SqliteJobDatabase, open_job_storage};

#[cfg(test)]
mod integration_tests;
