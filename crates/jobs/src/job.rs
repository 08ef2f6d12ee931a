//! Job authoring contract: parameters, run results, backoff, and the runtime job.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::duration_millis;

pub const PRIORITY_LOW: i32 = -1;
pub const PRIORITY_DEFAULT: i32 = 0;
pub const PRIORITY_HIGH: i32 = 1;

/// Queue reserved for data migrations; its head pre-empts every other job.
pub const MIGRATION_QUEUE_KEY: &str = "MIGRATION";

/// Scheduling parameters attached to a job at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    pub id: String,
    pub create_time: i64,
    /// Milliseconds after `create_time` when the job expires. `None` never expires.
    pub lifespan: Option<i64>,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub max_instances_for_factory: Option<u32>,
    pub max_instances_for_queue: Option<u32>,
    pub queue: Option<String>,
    pub constraint_keys: Vec<String>,
    pub initial_delay: i64,
    pub global_priority: i32,
    pub queue_priority: i32,
    pub input_data: Option<Vec<u8>>,
    pub memory_only: bool,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            create_time: Utc::now().timestamp_millis(),
            lifespan: None,
            max_attempts: Some(1),
            max_instances_for_factory: None,
            max_instances_for_queue: None,
            queue: None,
            constraint_keys: Vec::new(),
            initial_delay: 0,
            global_priority: PRIORITY_DEFAULT,
            queue_priority: PRIORITY_DEFAULT,
            input_data: None,
            memory_only: false,
        }
    }
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_unlimited_attempts(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    pub fn with_lifespan(mut self, lifespan: Duration) -> Self {
        self.lifespan = Some(duration_millis(lifespan));
        self
    }

    pub fn with_max_instances_for_factory(mut self, max: u32) -> Self {
        self.max_instances_for_factory = Some(max);
        self
    }

    pub fn with_max_instances_for_queue(mut self, max: u32) -> Self {
        self.max_instances_for_queue = Some(max);
        self
    }

    pub fn with_constraint(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !self.constraint_keys.contains(&key) {
            self.constraint_keys.push(key);
        }
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = duration_millis(delay);
        self
    }

    pub fn with_global_priority(mut self, priority: i32) -> Self {
        self.global_priority = priority;
        self
    }

    pub fn with_queue_priority(mut self, priority: i32) -> Self {
        self.queue_priority = priority;
        self
    }

    pub fn with_input_data(mut self, data: Vec<u8>) -> Self {
        self.input_data = Some(data);
        self
    }

    pub fn memory_only(mut self, memory_only: bool) -> Self {
        self.memory_only = memory_only;
        self
    }

    /// Whether the job has outlived its lifespan at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        match self.lifespan {
            Some(lifespan) => self.create_time.saturating_add(lifespan) <= now,
            None => false,
        }
    }
}

/// Outcome of a single run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Finished. Output, if any, becomes the input of every downstream job.
    Success(Option<Vec<u8>>),
    /// Try again later. `None` uses the configured retry policy.
    Retry(Option<Duration>),
    Failure,
}

impl JobResult {
    pub fn success() -> Self {
        Self::Success(None)
    }

    pub fn success_with_output(output: Vec<u8>) -> Self {
        Self::Success(Some(output))
    }

    pub fn retry() -> Self {
        Self::Retry(None)
    }

    pub fn retry_after(backoff: Duration) -> Self {
        Self::Retry(Some(backoff))
    }

    pub fn failure() -> Self {
        Self::Failure
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    #[default]
    Exponential,
    Linear,
}

/// Backoff used when a job asks to retry without naming an interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) applied around the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        }
    }

    /// Delay before the given retry (1-indexed). Never shorter than 1ms.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread keyed on the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let spread = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (spread - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis(((delay_ms + jitter).max(1.0)) as u64)
    }
}

/// Run-time view of a job handed to [`JobKind`] callbacks.
#[derive(Debug)]
pub struct JobContext {
    parameters: Parameters,
    run_attempt: u32,
    last_run_attempt_time: i64,
    next_backoff_interval: i64,
    canceled: AtomicBool,
}

impl JobContext {
    pub fn id(&self) -> &str {
        &self.parameters.id
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Zero on the first run.
    pub fn run_attempt(&self) -> u32 {
        self.run_attempt
    }

    pub fn last_run_attempt_time(&self) -> i64 {
        self.last_run_attempt_time
    }

    pub fn next_backoff_interval(&self) -> i64 {
        self.next_backoff_interval
    }

    /// Output of the upstream job, when one finished with data.
    pub fn input_data(&self) -> Option<&[u8]> {
        self.parameters.input_data.as_deref()
    }

    /// Long-running jobs should poll this and bail out early.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

/// Behaviour of a concrete job type.
///
/// Implementations are rebuilt from `serialize()` output by the factory
/// registered under `factory_key()`, so any state needed across restarts
/// must round-trip through those bytes.
pub trait JobKind: Send + Sync {
    fn factory_key(&self) -> &str;

    fn serialize(&self) -> Option<Vec<u8>> {
        None
    }

    /// Called once, after the job has been durably accepted.
    fn on_submit(&self, _ctx: &JobContext) {}

    fn run(&self, ctx: &JobContext) -> JobResult;

    fn on_retry(&self, _ctx: &JobContext) {}

    /// Called once when the job (or an upstream job) permanently fails.
    fn on_failure(&self, _ctx: &JobContext) {}
}

/// A job instance: parameters plus the behaviour that runs it.
pub struct Job {
    context: JobContext,
    kind: Box<dyn JobKind>,
}

impl Job {
    pub fn new(parameters: Parameters, kind: impl JobKind + 'static) -> Self {
        Self::from_boxed(parameters, Box::new(kind))
    }

    pub fn from_boxed(parameters: Parameters, kind: Box<dyn JobKind>) -> Self {
        Self::restore(parameters, kind, 0, 0, 0)
    }

    pub(crate) fn restore(
        parameters: Parameters,
        kind: Box<dyn JobKind>,
        run_attempt: u32,
        last_run_attempt_time: i64,
        next_backoff_interval: i64,
    ) -> Self {
        Self {
            context: JobContext {
                parameters,
                run_attempt,
                last_run_attempt_time,
                next_backoff_interval,
                canceled: AtomicBool::new(false),
            },
            kind,
        }
    }

    /// Stamps the submission time; attempts restart from zero.
    pub(crate) fn mark_submitted(&mut self, now: i64) {
        self.context.parameters.create_time = now;
        self.context.run_attempt = 0;
        self.context.last_run_attempt_time = 0;
        self.context.next_backoff_interval = 0;
    }

    pub fn id(&self) -> &str {
        self.context.id()
    }

    pub fn factory_key(&self) -> &str {
        self.kind.factory_key()
    }

    pub fn parameters(&self) -> &Parameters {
        &self.context.parameters
    }

    pub fn context(&self) -> &JobContext {
        &self.context
    }

    pub fn run_attempt(&self) -> u32 {
        self.context.run_attempt
    }

    pub fn cancel(&self) {
        self.context.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.context.is_canceled()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.context.parameters.is_expired(now)
    }

    pub fn serialize(&self) -> Option<Vec<u8>> {
        self.kind.serialize()
    }

    pub fn run(&self) -> JobResult {
        self.kind.run(&self.context)
    }

    pub fn on_submit(&self) {
        self.kind.on_submit(&self.context)
    }

    pub fn on_retry(&self) {
        self.kind.on_retry(&self.context)
    }

    pub fn on_failure(&self) {
        self.kind.on_failure(&self.context)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id())
            .field("factory_key", &self.factory_key())
            .field("queue", &self.parameters().queue)
            .field("run_attempt", &self.run_attempt())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Noop;

    impl JobKind for Noop {
        fn factory_key(&self) -> &str {
            "Noop"
        }

        fn run(&self, _ctx: &JobContext) -> JobResult {
            JobResult::success()
        }
    }

    #[test]
    fn default_parameters_run_once_and_never_expire() {
        let params = Parameters::new();
        assert_eq!(params.max_attempts, Some(1));
        assert!(!params.is_expired(i64::MAX));
        assert_eq!(params.global_priority, PRIORITY_DEFAULT);
        assert!(!params.id.is_empty());
    }

    #[test]
    fn lifespan_expires_at_boundary() {
        let mut params = Parameters::new().with_lifespan(Duration::from_millis(100));
        params.create_time = 1_000;
        assert!(!params.is_expired(1_099));
        assert!(params.is_expired(1_100));
    }

    #[test]
    fn constraint_keys_are_deduplicated() {
        let params = Parameters::new()
            .with_constraint("Network")
            .with_constraint("Network")
            .with_constraint("Battery");
        assert_eq!(params.constraint_keys, vec!["Network", "Battery"]);
    }

    #[test]
    fn cancel_is_visible_through_context() {
        let job = Job::new(Parameters::new(), Noop);
        assert!(!job.context().is_canceled());
        job.cancel();
        assert!(job.context().is_canceled());
    }

    #[test]
    fn mark_submitted_resets_attempts() {
        let mut job = Job::restore(Parameters::new(), Box::new(Noop), 4, 50, 10);
        job.mark_submitted(77);
        assert_eq!(job.run_attempt(), 0);
        assert_eq!(job.parameters().create_time, 77);
    }

    #[test]
    fn fixed_policy_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(250));
    }

    #[test]
    fn linear_policy_grows_then_caps() {
        let policy = RetryPolicy::linear(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(350));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            .. ProptestConfig::default()
        })]

        #[test]
        fn backoff_is_positive_and_bounded(attempt in 0u32..200, base in 1u64..5_000, cap in 1u64..120_000) {
            let policy = RetryPolicy::exponential(Duration::from_millis(base), Duration::from_millis(cap.max(base)));
            let delay = policy.delay_for_attempt(attempt);
            prop_assert!(delay >= Duration::from_millis(1));
            let ceiling = (cap.max(base) as f64 * 1.1).ceil() as u64 + 1;
            prop_assert!(delay <= Duration::from_millis(ceiling));
        }
    }
}
