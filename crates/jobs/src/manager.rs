//! The public entry point: build a manager, start its runners, add jobs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::JobManagerConfig;
use crate::constraint::{ConstraintNotifier, ConstraintObserver};
use crate::controller::{EmptyQueueListenerId, JobController};
use crate::error::JobError;
use crate::job::Job;
use crate::migrator::JobMigrator;
use crate::registry::Registry;
use crate::scheduler::{CompositeScheduler, InAppScheduler, Scheduler};
use crate::spec::JobSpec;
use crate::storage::JobStorage;
use crate::tracker::{JobState, JobTracker, JobUpdate, Subscription};

/// Wakes the controller whenever an observer reports a favourable change.
struct WakeOnConstraint {
    controller: Weak<JobController>,
}

impl ConstraintNotifier for WakeOnConstraint {
    fn on_constraint_met(&self, reason: &str) {
        debug!(reason, "constraint met; re-checking eligibility");
        if let Some(controller) = self.controller.upgrade() {
            controller.wake_up();
        }
    }
}

pub struct JobManagerBuilder {
    storage: Arc<dyn JobStorage>,
    registry: Arc<Registry>,
    config: JobManagerConfig,
    migrator: Option<JobMigrator>,
    observers: Vec<Box<dyn ConstraintObserver>>,
    platform_scheduler: Option<Box<dyn Scheduler>>,
    clock: Arc<dyn Clock>,
}

impl JobManagerBuilder {
    pub fn config(mut self, config: JobManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to stamping `config.current_version` with no migrations.
    pub fn migrator(mut self, migrator: JobMigrator) -> Self {
        self.migrator = Some(migrator);
        self
    }

    pub fn observer(mut self, observer: impl ConstraintObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    /// Forwarded every wake-up request alongside the in-app timer.
    pub fn platform_scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.platform_scheduler = Some(Box::new(scheduler));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Loads storage, recovers jobs left running by a crash, migrates them,
    /// and registers the observers. Runners start with
    /// [`JobManager::begin_job_loop`].
    pub fn build(self) -> Result<Arc<JobManager>, JobError> {
        let config = self.config.normalized();
        let migrator = self
            .migrator
            .unwrap_or_else(|| JobMigrator::without_migrations(config.current_version));
        self.storage.init()?;

        let tracker = Arc::new(JobTracker::new(config.tracker_capacity));
        let (storage, registry, clock, platform) =
            (self.storage, self.registry, self.clock, self.platform_scheduler);
        let controller = Arc::new_cyclic(|weak: &Weak<JobController>| {
            let weak = weak.clone();
            let timer = InAppScheduler::new(move || {
                if let Some(controller) = weak.upgrade() {
                    controller.wake_up();
                }
            });
            let mut scheduler = CompositeScheduler::new(vec![Box::new(timer)]);
            if let Some(platform) = platform {
                scheduler.push(platform);
            }
            JobController::new(
                storage,
                registry,
                tracker,
                Box::new(scheduler),
                migrator,
                clock,
                config,
            )
        });
        controller.init()?;

        let notifier: Arc<dyn ConstraintNotifier> = Arc::new(WakeOnConstraint {
            controller: Arc::downgrade(&controller),
        });
        for observer in &self.observers {
            observer.register(notifier.clone());
        }
        info!(observers = self.observers.len(), "job manager ready");

        Ok(Arc::new(JobManager {
            controller,
            loop_started: AtomicBool::new(false),
        }))
    }
}

pub struct JobManager {
    controller: Arc<JobController>,
    loop_started: AtomicBool,
}

impl JobManager {
    pub fn builder(storage: Arc<dyn JobStorage>, registry: Arc<Registry>) -> JobManagerBuilder {
        JobManagerBuilder {
            storage,
            registry,
            config: JobManagerConfig::default(),
            migrator: None,
            observers: Vec::new(),
            platform_scheduler: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Starts the runner pool. Later calls do nothing and return 0.
    pub fn begin_job_loop(&self) -> usize {
        if self.loop_started.swap(true, Ordering::SeqCst) {
            return 0;
        }
        self.controller.start_job_runners()
    }

    pub fn add(&self, job: Job) -> Result<(), JobError> {
        self.add_all(vec![job])
    }

    /// Adds jobs that may run in parallel.
    pub fn add_all(&self, jobs: Vec<Job>) -> Result<(), JobError> {
        self.controller.submit_new_job_chain(vec![jobs])?;
        self.scale_up();
        Ok(())
    }

    /// Adds `job` behind already-submitted jobs, and behind everything in
    /// `depends_on_queue` if given.
    pub fn add_with_dependencies(
        &self,
        job: Job,
        depends_on: Vec<String>,
        depends_on_queue: Option<String>,
    ) -> Result<(), JobError> {
        self.controller
            .submit_job_with_existing_dependencies(job, depends_on, depends_on_queue)?;
        self.scale_up();
        Ok(())
    }

    pub fn start_chain(&self, jobs: Vec<Job>) -> Chain<'_> {
        Chain {
            manager: self,
            stages: vec![jobs],
        }
    }

    /// Submits `job` and blocks until it finishes or `timeout` passes.
    /// Returns the terminal state, or `None` on timeout.
    pub fn run_synchronously(&self, job: Job, timeout: Duration) -> Result<Option<JobState>, JobError> {
        let subscription = self.controller.tracker().subscribe_to_job(job.id());
        self.add(job)?;
        Ok(subscription.wait_for_completion(timeout).map(|update| update.state))
    }

    pub fn cancel(&self, id: &str) -> Result<(), JobError> {
        self.controller.cancel_job(id)
    }

    pub fn cancel_all_in_queue(&self, queue_key: &str) -> Result<(), JobError> {
        self.controller.cancel_all_in_queue(queue_key)
    }

    /// Rewrites every stored job that is not running.
    pub fn update(&self, updater: impl Fn(&JobSpec) -> JobSpec) -> Result<(), JobError> {
        self.controller.update(&updater)
    }

    pub fn find(&self, predicate: impl Fn(&JobSpec) -> bool) -> Vec<JobSpec> {
        self.controller.find_jobs(&predicate)
    }

    pub fn are_queues_empty(&self, queue_keys: &[String]) -> bool {
        self.controller.are_queues_empty(queue_keys)
    }

    pub fn is_queue_empty(&self, queue_key: &str) -> bool {
        self.are_queues_empty(&[queue_key.to_string()])
    }

    pub fn debug_info(&self) -> String {
        self.controller.debug_info()
    }

    pub fn subscribe(&self, filter: impl Fn(&JobUpdate) -> bool + Send + Sync + 'static) -> Subscription {
        self.controller.tracker().subscribe(filter)
    }

    pub fn first_matching_state(&self, filter: impl Fn(&JobUpdate) -> bool) -> Option<JobState> {
        self.controller.tracker().first_matching_state(filter)
    }

    /// `listener` runs on the thread that finished the last stored job.
    pub fn add_on_empty_queue_listener(
        &self,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> EmptyQueueListenerId {
        self.controller.add_on_empty_queue_listener(listener)
    }

    pub fn remove_on_empty_queue_listener(&self, id: EmptyQueueListenerId) -> bool {
        self.controller.remove_on_empty_queue_listener(id)
    }

    pub fn tracker(&self) -> &JobTracker {
        self.controller.tracker()
    }

    pub fn runner_count(&self) -> usize {
        self.controller.runner_count()
    }

    pub fn wake_up(&self) {
        self.controller.wake_up();
    }

    /// Stops accepting work, waits for runners to finish their current
    /// jobs, and stops the timer thread.
    pub fn shutdown(&self) {
        self.controller.shutdown();
    }

    fn scale_up(&self) {
        if self.loop_started.load(Ordering::SeqCst) {
            let controller = &self.controller;
            controller.maybe_scale_up_runners(|| controller.eligible_job_count());
        }
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.controller.shutdown();
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("controller", &self.controller)
            .field("loop_started", &self.loop_started.load(Ordering::SeqCst))
            .finish()
    }
}

/// Stages of jobs; each stage waits for every job in the one before it.
pub struct Chain<'a> {
    manager: &'a JobManager,
    stages: Vec<Vec<Job>>,
}

impl Chain<'_> {
    pub fn then(mut self, jobs: Vec<Job>) -> Self {
        self.stages.push(jobs);
        self
    }

    pub fn enqueue(self) -> Result<(), JobError> {
        self.manager.controller.submit_new_job_chain(self.stages)?;
        self.manager.scale_up();
        Ok(())
    }

    /// Enqueues the chain and waits for every job in it to reach a terminal
    /// state. `Some(Failure)` if any job failed, `Some(Success)` if any
    /// succeeded, `Some(Ignored)` if all were ignored, `None` on timeout.
    pub fn enqueue_and_block_until_completion(self, timeout: Duration) -> Result<Option<JobState>, JobError> {
        let ids: HashSet<String> = self
            .stages
            .iter()
            .flatten()
            .map(|job| job.id().to_string())
            .collect();
        let watched = ids.clone();
        let subscription = self
            .manager
            .subscribe(move |update| watched.contains(&update.job_id));
        self.enqueue()?;

        let deadline = Instant::now() + timeout;
        let mut outcomes: Vec<JobState> = Vec::new();
        let mut finished: HashSet<String> = HashSet::new();
        while finished.len() < ids.len() {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(None);
            };
            match subscription.recv_timeout(remaining) {
                Ok(update) if update.state.is_complete() => {
                    if finished.insert(update.job_id) {
                        outcomes.push(update.state);
                    }
                }
                Ok(_) => {}
                Err(_) => return Ok(None),
            }
        }
        debug!(jobs = ids.len(), "chain completed");

        let state = if outcomes.contains(&JobState::Failure) {
            JobState::Failure
        } else if outcomes.contains(&JobState::Success) {
            JobState::Success
        } else {
            JobState::Ignored
        };
        Ok(Some(state))
    }
}
