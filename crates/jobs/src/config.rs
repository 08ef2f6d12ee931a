//! Job manager configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::job::RetryPolicy;
use crate::runner::JobPredicate;
use crate::storage::INITIAL_SCHEMA_VERSION;
use crate::tracker::JobTracker;

/// Runner pool sizing, timeouts, and defaults applied to every job.
#[derive(Clone)]
pub struct JobManagerConfig {
    /// Runners kept alive for the life of the manager.
    pub min_runners: usize,
    /// Upper bound for general-purpose runners, elastic ones included.
    pub max_runners: usize,
    /// How long a runner waits for work before re-checking.
    pub pull_timeout: Duration,
    /// Idle time after which an elastic runner exits.
    pub idle_runner_timeout: Duration,
    pub tracker_capacity: usize,
    pub default_retry_policy: RetryPolicy,
    /// Version the stored job data is migrated to at startup.
    pub current_version: u32,
    /// One dedicated runner per predicate, outside the general pool.
    pub reserved_runners: Vec<Arc<dyn JobPredicate>>,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            min_runners: 2,
            max_runners: 8,
            pull_timeout: Duration::from_secs(1),
            idle_runner_timeout: Duration::from_secs(30),
            tracker_capacity: JobTracker::DEFAULT_CAPACITY,
            default_retry_policy: RetryPolicy::default(),
            current_version: INITIAL_SCHEMA_VERSION,
            reserved_runners: Vec::new(),
        }
    }
}

impl JobManagerConfig {
    /// Defaults overridden by `JOBMILL_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary source.
    /// Unparseable values keep the default and log a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str, default: u64| -> u64 {
            match lookup(key) {
                None => default,
                Some(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
                    tracing::warn!(key, value = %raw, default, "ignoring invalid setting");
                    default
                }),
            }
        };
        let millis = |d: Duration| d.as_millis() as u64;

        Self {
            min_runners: number("JOBMILL_MIN_RUNNERS", defaults.min_runners as u64) as usize,
            max_runners: number("JOBMILL_MAX_RUNNERS", defaults.max_runners as u64) as usize,
            pull_timeout: Duration::from_millis(number(
                "JOBMILL_PULL_TIMEOUT_MS",
                millis(defaults.pull_timeout),
            )),
            idle_runner_timeout: Duration::from_millis(number(
                "JOBMILL_IDLE_RUNNER_TIMEOUT_MS",
                millis(defaults.idle_runner_timeout),
            )),
            tracker_capacity: number("JOBMILL_TRACKER_CAPACITY", defaults.tracker_capacity as u64)
                as usize,
            ..defaults
        }
        .normalized()
    }

    /// At least one runner, and a maximum no smaller than the minimum.
    pub fn normalized(mut self) -> Self {
        self.min_runners = self.min_runners.max(1);
        self.max_runners = self.max_runners.max(self.min_runners);
        self.tracker_capacity = self.tracker_capacity.max(1);
        self
    }

    pub fn with_min_runners(mut self, min: usize) -> Self {
        self.min_runners = min;
        self
    }

    pub fn with_max_runners(mut self, max: usize) -> Self {
        self.max_runners = max;
        self
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    pub fn with_idle_runner_timeout(mut self, timeout: Duration) -> Self {
        self.idle_runner_timeout = timeout;
        self
    }

    pub fn with_tracker_capacity(mut self, capacity: usize) -> Self {
        self.tracker_capacity = capacity;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = policy;
        self
    }

    pub fn with_current_version(mut self, version: u32) -> Self {
        self.current_version = version;
        self
    }

    pub fn with_reserved_runner(mut self, predicate: impl JobPredicate + 'static) -> Self {
        self.reserved_runners.push(Arc::new(predicate));
        self
    }
}

impl fmt::Debug for JobManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobManagerConfig")
            .field("min_runners", &self.min_runners)
            .field("max_runners", &self.max_runners)
            .field("pull_timeout", &self.pull_timeout)
            .field("idle_runner_timeout", &self.idle_runner_timeout)
            .field("tracker_capacity", &self.tracker_capacity)
            .field("default_retry_policy", &self.default_retry_policy)
            .field("current_version", &self.current_version)
            .field("reserved_runners", &self.reserved_runners.len())
            .finish()
    }
}
