//! Versioned rewrites of persisted job data.
//!
//! Each migration moves stored jobs from `end_version - 1` to `end_version`.
//! The chain must cover every version between the initial schema version and
//! the current one without gaps.

use std::fmt;

use tracing::{info, warn};

use crate::error::{MigrationError, StorageError};
use crate::spec::JobSpec;
use crate::storage::{INITIAL_SCHEMA_VERSION, JobStorage};

/// The parts of a stored job a migration may rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobData {
    pub factory_key: String,
    pub queue_key: Option<String>,
    pub data: Option<Vec<u8>>,
}

impl JobData {
    fn from_spec(spec: &JobSpec) -> Self {
        Self {
            factory_key: spec.factory_key.clone(),
            queue_key: spec.queue_key.clone(),
            data: spec.serialized_data.clone(),
        }
    }
}

pub trait JobMigration: Send + Sync {
    fn end_version(&self) -> u32;

    fn migrate(&self, data: JobData) -> JobData;
}

pub struct JobMigrator {
    start_version: u32,
    end_version: u32,
    migrations: Vec<Box<dyn JobMigration>>,
}

impl JobMigrator {
    /// Validates that `migrations` step one version at a time from
    /// `start_version` up to `end_version`.
    pub fn new(
        start_version: u32,
        end_version: u32,
        migrations: Vec<Box<dyn JobMigration>>,
    ) -> Result<Self, MigrationError> {
        let mut expected = start_version;
        for migration in &migrations {
            expected += 1;
            if migration.end_version() != expected {
                return Err(MigrationError::NonContiguous {
                    expected,
                    found: migration.end_version(),
                });
            }
        }
        if expected != end_version {
            return Err(MigrationError::WrongEndVersion {
                expected: end_version,
                found: expected,
            });
        }

        Ok(Self {
            start_version,
            end_version,
            migrations,
        })
    }

    /// A migrator with nothing to do beyond stamping `version`.
    pub fn without_migrations(version: u32) -> Self {
        Self {
            start_version: version,
            end_version: version,
            migrations: Vec::new(),
        }
    }

    pub fn end_version(&self) -> u32 {
        self.end_version
    }

    /// Brings stored jobs up to the current version and returns it.
    pub fn migrate(&self, storage: &dyn JobStorage) -> Result<u32, StorageError> {
        let stored = storage.schema_version()?;
        if stored > self.end_version {
            warn!(
                stored,
                current = self.end_version,
                "stored job data is newer than this build; leaving it untouched"
            );
            return Ok(stored);
        }

        for migration in self.migrations.iter().filter(|m| m.end_version() > stored) {
            let version = migration.end_version();
            info!(from = version - 1, to = version, "migrating jobs");
            storage.transform_jobs(&|spec: &JobSpec| {
                let migrated = migration.migrate(JobData::from_spec(spec));
                JobSpec {
                    factory_key: migrated.factory_key,
                    queue_key: migrated.queue_key,
                    serialized_data: migrated.data,
                    ..spec.clone()
                }
            })?;
            storage.set_schema_version(version)?;
        }

        if storage.schema_version()? < self.end_version {
            storage.set_schema_version(self.end_version)?;
        }
        Ok(self.end_version)
    }
}

impl Default for JobMigrator {
    fn default() -> Self {
        Self::without_migrations(INITIAL_SCHEMA_VERSION)
    }
}

impl fmt::Debug for JobMigrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobMigrator")
            .field("start_version", &self.start_version)
            .field("end_version", &self.end_version)
            .field("migrations", &self.migrations.len())
            .finish()
    }
}
