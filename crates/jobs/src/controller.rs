//! The job controller: submission, claiming, completion, and the runner pool.
//!
//! Every storage mutation that affects eligibility happens while holding the
//! controller lock, so "pick the next eligible job and mark it running" is a
//! single step and no two runners are ever handed the same job. Runners block
//! on `work_available` between pulls and are woken whenever the set of
//! eligible jobs may have changed.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, duration_millis};
use crate::config::JobManagerConfig;
use crate::error::JobError;
use crate::instantiator::{ConstraintInstantiator, JobInstantiator};
use crate::job::Job;
use crate::migrator::JobMigrator;
use crate::registry::Registry;
use crate::runner::{AnyJob, JobPredicate, JobRunner, RunnerKind};
use crate::scheduler::Scheduler;
use crate::spec::{ConstraintSpec, DependencySpec, FullSpec, JobSpec};
use crate::storage::JobStorage;
use crate::tracker::{JobState, JobTracker, JobUpdate};

/// A job that later jobs will depend on.
#[derive(Debug, Clone)]
struct Upstream {
    id: String,
    queue: Option<String>,
    memory_only: bool,
}

impl Upstream {
    fn of_job(job: &Job) -> Self {
        Self {
            id: job.id().to_string(),
            queue: job.parameters().queue.clone(),
            memory_only: job.parameters().memory_only,
        }
    }

    fn of_spec(spec: &JobSpec) -> Self {
        Self {
            id: spec.id.clone(),
            queue: spec.queue_key.clone(),
            memory_only: spec.is_memory_only,
        }
    }
}

/// Jobs accepted earlier in the same submission, for instance caps.
#[derive(Debug, Default)]
struct Admitted {
    by_factory: HashMap<String, usize>,
    by_queue: HashMap<(String, String), usize>,
}

impl Admitted {
    fn record(&mut self, job: &Job) {
        *self.by_factory.entry(job.factory_key().to_string()).or_default() += 1;
        if let Some(queue) = &job.parameters().queue {
            *self
                .by_queue
                .entry((job.factory_key().to_string(), queue.clone()))
                .or_default() += 1;
        }
    }
}

/// Returned by [`JobController::add_on_empty_queue_listener`]; hand it back
/// to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmptyQueueListenerId(u64);

type EmptyQueueListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct EmptyQueueListeners {
    next_id: u64,
    listeners: Vec<(EmptyQueueListenerId, EmptyQueueListener)>,
}

#[derive(Default)]
struct ControllerState {
    running: HashMap<String, Arc<Job>>,
    runners: HashMap<u64, RunnerKind>,
    handles: Vec<JoinHandle<()>>,
    next_runner_id: u64,
    shutting_down: bool,
    /// Set when a completion removed the last stored job.
    drained: bool,
}

impl ControllerState {
    fn pool_size(&self) -> usize {
        self.runners
            .values()
            .filter(|kind| **kind != RunnerKind::Reserved)
            .count()
    }

    fn register_runner(&mut self, kind: RunnerKind) -> u64 {
        self.next_runner_id += 1;
        self.runners.insert(self.next_runner_id, kind);
        self.next_runner_id
    }
}

pub struct JobController {
    storage: Arc<dyn JobStorage>,
    instantiator: JobInstantiator,
    constraints: ConstraintInstantiator,
    tracker: Arc<JobTracker>,
    scheduler: Box<dyn Scheduler>,
    migrator: JobMigrator,
    clock: Arc<dyn Clock>,
    config: JobManagerConfig,
    state: Mutex<ControllerState>,
    work_available: Condvar,
    empty_queue_listeners: Mutex<EmptyQueueListeners>,
}

impl JobController {
    pub(crate) fn new(
        storage: Arc<dyn JobStorage>,
        registry: Arc<Registry>,
        tracker: Arc<JobTracker>,
        scheduler: Box<dyn Scheduler>,
        migrator: JobMigrator,
        clock: Arc<dyn Clock>,
        config: JobManagerConfig,
    ) -> Self {
        Self {
            storage,
            instantiator: JobInstantiator::new(registry.clone()),
            constraints: ConstraintInstantiator::new(registry),
            tracker,
            scheduler,
            migrator,
            clock,
            config,
            state: Mutex::new(ControllerState::default()),
            work_available: Condvar::new(),
            empty_queue_listeners: Mutex::new(EmptyQueueListeners::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Crash recovery, then migration. Returns the schema version in effect.
    pub fn init(&self) -> Result<u32, JobError> {
        let _state = self.lock();
        self.storage.update_all_jobs_to_be_pending()?;
        let version = self.migrator.migrate(self.storage.as_ref())?;
        info!(version, jobs = self.storage.get_all_job_specs().len(), "job controller initialised");
        Ok(version)
    }

    /// Ask waiting runners to look for work again.
    pub fn wake_up(&self) {
        let _state = self.lock();
        self.work_available.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    fn listeners(&self) -> MutexGuard<'_, EmptyQueueListeners> {
        self.empty_queue_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Called every time a completion leaves storage without any jobs.
    pub fn add_on_empty_queue_listener(
        &self,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> EmptyQueueListenerId {
        let mut listeners = self.listeners();
        listeners.next_id += 1;
        let id = EmptyQueueListenerId(listeners.next_id);
        listeners.listeners.push((id, Arc::new(listener)));
        id
    }

    pub fn remove_on_empty_queue_listener(&self, id: EmptyQueueListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.listeners.len();
        listeners.listeners.retain(|(existing, _)| *existing != id);
        listeners.listeners.len() != before
    }

    fn note_if_drained(&self, state: &mut ControllerState) {
        if self.storage.get_job_count() == 0 {
            state.drained = true;
        }
    }

    /// Fires the empty-queue listeners once per drain. Must be called without
    /// the controller lock held.
    fn notify_if_drained(&self) {
        if !std::mem::take(&mut self.lock().drained) {
            return;
        }
        let listeners: Vec<EmptyQueueListener> = self
            .listeners()
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        debug!(listeners = listeners.len(), "job storage drained");
        for listener in listeners {
            listener();
        }
    }

    /// Inserts `chain` stage by stage; each stage depends on every job that
    /// survived the nearest earlier stage.
    pub fn submit_new_job_chain(&self, chain: Vec<Vec<Job>>) -> Result<(), JobError> {
        let now = self.now();
        let mut accepted: Vec<Vec<Job>> = Vec::new();
        {
            let state = self.lock();
            if state.shutting_down {
                return Err(JobError::Shutdown);
            }

            let mut admitted = Admitted::default();
            let mut upstream: Vec<Upstream> = Vec::new();
            let mut specs = Vec::new();
            for stage in chain {
                let mut kept = Vec::new();
                for mut job in stage {
                    if self.exceeds_instance_limit(&job, &admitted) {
                        self.ignore(&job);
                        continue;
                    }
                    job.mark_submitted(now);
                    admitted.record(&job);
                    kept.push(job);
                }
                if kept.is_empty() {
                    continue;
                }
                specs.extend(kept.iter().map(|job| build_full_spec(job, &upstream)));
                upstream = kept.iter().map(Upstream::of_job).collect();
                accepted.push(kept);
            }
            if specs.is_empty() {
                return Ok(());
            }

            self.storage.insert_jobs(specs)?;
            for job in accepted.iter().flatten() {
                self.tracker.on_state_change(job, JobState::Pending);
                debug!(job_id = %job.id(), factory_key = %job.factory_key(), "job submitted");
            }
            info!(
                stages = accepted.len(),
                jobs = accepted.iter().map(Vec::len).sum::<usize>(),
                "job chain submitted"
            );
            self.work_available.notify_all();
        }

        if let Some(first) = accepted.first() {
            for job in first {
                self.schedule(initial_delay(job), &job.parameters().constraint_keys);
            }
        }
        for job in accepted.iter().flatten() {
            job.on_submit();
        }
        Ok(())
    }

    /// Submits `job` behind jobs that are already stored, and behind every
    /// job currently in `depends_on_queue` when one is given.
    ///
    /// A dependency that is gone from storage without having succeeded (or
    /// been ignored) fails the new job straight away.
    pub fn submit_job_with_existing_dependencies(
        &self,
        mut job: Job,
        depends_on: Vec<String>,
        depends_on_queue: Option<String>,
    ) -> Result<(), JobError> {
        let now = self.now();
        {
            let state = self.lock();
            if state.shutting_down {
                return Err(JobError::Shutdown);
            }
            if self.exceeds_instance_limit(&job, &Admitted::default()) {
                self.ignore(&job);
                return Ok(());
            }

            let mut upstream = Vec::new();
            let mut failed_dependency = None;
            for id in &depends_on {
                match self.storage.get_job_spec(id) {
                    Some(spec) => upstream.push(Upstream::of_spec(&spec)),
                    None => match self.tracker.state_of(id) {
                        Some(JobState::Success | JobState::Ignored) => {}
                        _ => {
                            failed_dependency = Some(id.clone());
                            break;
                        }
                    },
                }
            }

            job.mark_submitted(now);
            if let Some(dependency) = failed_dependency {
                warn!(job_id = %job.id(), dependency = %dependency, "dependency already failed; failing job");
                self.tracker.on_state_change(&job, JobState::Failure);
                drop(state);
                job.on_failure();
                return Ok(());
            }

            if let Some(queue) = &depends_on_queue {
                for spec in self.storage.get_jobs_in_queue(queue) {
                    if spec.id != job.id() && !upstream.iter().any(|u| u.id == spec.id) {
                        upstream.push(Upstream::of_spec(&spec));
                    }
                }
            }

            self.storage.insert_jobs(vec![build_full_spec(&job, &upstream)])?;
            self.tracker.on_state_change(&job, JobState::Pending);
            info!(
                job_id = %job.id(),
                factory_key = %job.factory_key(),
                dependencies = upstream.len(),
                "job submitted"
            );
            self.work_available.notify_all();
        }

        self.schedule(initial_delay(&job), &job.parameters().constraint_keys);
        job.on_submit();
        Ok(())
    }

    fn exceeds_instance_limit(&self, job: &Job, admitted: &Admitted) -> bool {
        let params = job.parameters();
        let factory = job.factory_key();
        if let Some(max) = params.max_instances_for_factory {
            let count = self.storage.get_job_count_for_factory(factory)
                + admitted.by_factory.get(factory).copied().unwrap_or(0);
            if count >= max as usize {
                return true;
            }
        }
        if let (Some(max), Some(queue)) = (params.max_instances_for_queue, params.queue.as_deref()) {
            let count = self.storage.get_job_count_for_factory_and_queue(factory, queue)
                + admitted
                    .by_queue
                    .get(&(factory.to_string(), queue.to_string()))
                    .copied()
                    .unwrap_or(0);
            if count >= max as usize {
                return true;
            }
        }
        false
    }

    fn ignore(&self, job: &Job) {
        info!(job_id = %job.id(), factory_key = %job.factory_key(), "instance limit reached; job ignored");
        self.tracker.on_state_change(job, JobState::Ignored);
    }

    fn schedule(&self, delay: Duration, constraint_keys: &[String]) {
        let constraints = self
            .constraints
            .instantiate_all(constraint_keys.iter().map(String::as_str));
        self.scheduler.schedule(delay, &constraints);
    }

    /// Waits up to `timeout` for a job `predicate` accepts, marks it running,
    /// and hands it out. `None` on timeout or shutdown.
    pub fn pull_next_eligible_job_for_execution(
        &self,
        predicate: &dyn JobPredicate,
        runner_id: u64,
        timeout: Duration,
    ) -> Option<Arc<Job>> {
        let job = self.wait_for_job(predicate, runner_id, timeout);
        self.notify_if_drained();
        job
    }

    fn wait_for_job(
        &self,
        predicate: &dyn JobPredicate,
        runner_id: u64,
        timeout: Duration,
    ) -> Option<Arc<Job>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.shutting_down {
                return None;
            }
            if let Some(job) = self.claim_next(&mut state, predicate, runner_id) {
                return Some(job);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if remaining.is_zero() {
                return None;
            }
            state = self
                .work_available
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn claim_next(
        &self,
        state: &mut ControllerState,
        predicate: &dyn JobPredicate,
        runner_id: u64,
    ) -> Option<Arc<Job>> {
        loop {
            let now = self.now();
            let spec = self.storage.get_next_eligible_job(
                now,
                &|constraints: &[ConstraintSpec]| self.constraints.all_met(constraints),
                &|spec: &JobSpec| predicate.should_run(spec),
            )?;
            let constraints = self.storage.get_constraint_specs(&spec.id);
            let job = match self.instantiator.instantiate(&spec, &constraints) {
                Ok(job) => Arc::new(job),
                Err(e) => {
                    error!(
                        job_id = %spec.id,
                        factory_key = %spec.factory_key,
                        error = %e,
                        "cannot instantiate job; discarding it and its dependents"
                    );
                    if let Err(e) = self.discard(state, &spec) {
                        error!(job_id = %spec.id, error = %e, "failed to discard job");
                        return None;
                    }
                    continue;
                }
            };

            if let Err(e) = self.storage.mark_job_as_running(&spec.id, now) {
                error!(job_id = %spec.id, error = %e, "failed to mark job running");
                return None;
            }
            state.running.insert(spec.id.clone(), job.clone());
            self.tracker.on_state_change(&job, JobState::Running);
            debug!(
                job_id = %spec.id,
                runner_id,
                run_attempt = spec.run_attempt,
                "job claimed"
            );
            return Some(job);
        }
    }

    /// Unique ids of every job downstream of `job_id`, nearest first.
    fn dependent_ids(&self, job_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for dependency in self.storage.get_dependency_specs_that_depend_on_job(job_id) {
            if !ids.contains(&dependency.job_id) {
                ids.push(dependency.job_id);
            }
        }
        ids
    }

    /// Drops a job that cannot be rebuilt, along with its dependents.
    fn discard(&self, state: &mut ControllerState, spec: &JobSpec) -> Result<(), JobError> {
        let mut doomed = vec![spec.clone()];
        doomed.extend(
            self.dependent_ids(&spec.id)
                .iter()
                .filter_map(|id| self.storage.get_job_spec(id)),
        );
        let ids: Vec<String> = doomed.iter().map(|s| s.id.clone()).collect();
        self.storage.delete_jobs(&ids)?;
        for spec in &doomed {
            self.tracker.publish(JobUpdate::for_spec(spec, JobState::Failure));
        }
        self.note_if_drained(state);
        self.work_available.notify_all();
        Ok(())
    }

    /// Records a successful run. Output replaces the input data of every job
    /// downstream of this one.
    pub fn on_success(&self, job: &Job, output: Option<Vec<u8>>) -> Result<(), JobError> {
        let result = {
            let mut state = self.lock();
            self.succeed_locked(&mut state, job, output)
        };
        self.notify_if_drained();
        result
    }

    fn succeed_locked(
        &self,
        state: &mut ControllerState,
        job: &Job,
        output: Option<Vec<u8>>,
    ) -> Result<(), JobError> {
        state.running.remove(job.id());
        if self.storage.get_job_spec(job.id()).is_none() {
            warn!(job_id = %job.id(), "completed job is already gone");
            return Ok(());
        }

        if let Some(output) = output {
            let updated: Vec<JobSpec> = self
                .dependent_ids(job.id())
                .iter()
                .filter_map(|id| self.storage.get_job_spec(id))
                .map(|spec| JobSpec {
                    serialized_input_data: Some(output.clone()),
                    ..spec
                })
                .collect();
            if !updated.is_empty() {
                self.storage.update_jobs(&updated)?;
            }
        }

        self.storage.delete_job(job.id())?;
        self.tracker.on_state_change(job, JobState::Success);
        info!(job_id = %job.id(), factory_key = %job.factory_key(), "job succeeded");
        self.note_if_drained(state);
        self.work_available.notify_all();
        Ok(())
    }

    /// Fails `job` and every job downstream of it in one deletion. Returns
    /// the dependents so the caller can run their failure callbacks.
    pub fn on_failure(&self, job: &Job) -> Result<Vec<Arc<Job>>, JobError> {
        let dependents = {
            let mut state = self.lock();
            self.fail_locked(&mut state, job)
        };
        self.notify_if_drained();
        dependents
    }

    fn fail_locked(&self, state: &mut ControllerState, job: &Job) -> Result<Vec<Arc<Job>>, JobError> {
        state.running.remove(job.id());
        if self.storage.get_job_spec(job.id()).is_none() {
            warn!(job_id = %job.id(), "failed job is already gone");
            return Ok(Vec::new());
        }

        let mut ids = vec![job.id().to_string()];
        let mut dependents = Vec::new();
        let mut unbuildable = Vec::new();
        for id in self.dependent_ids(job.id()) {
            let Some(spec) = self.storage.get_job_spec(&id) else {
                warn!(job_id = %id, "dependent vanished during failure cascade");
                continue;
            };
            match self
                .instantiator
                .instantiate(&spec, &self.storage.get_constraint_specs(&id))
            {
                Ok(dependent) => dependents.push(Arc::new(dependent)),
                Err(e) => {
                    warn!(job_id = %id, error = %e, "cannot instantiate dependent");
                    unbuildable.push(spec);
                }
            }
            ids.push(id);
        }

        self.storage.delete_jobs(&ids)?;
        self.tracker.on_state_change(job, JobState::Failure);
        for dependent in &dependents {
            self.tracker.on_state_change(dependent, JobState::Failure);
        }
        for spec in &unbuildable {
            self.tracker.publish(JobUpdate::for_spec(spec, JobState::Failure));
        }
        info!(
            job_id = %job.id(),
            factory_key = %job.factory_key(),
            dependents = ids.len() - 1,
            "job failed"
        );
        self.note_if_drained(state);
        self.work_available.notify_all();
        Ok(dependents)
    }

    /// Puts `job` back to pending with one more attempt on record and asks
    /// the scheduler to wake up once `backoff` has passed.
    pub fn on_retry(&self, job: &Job, backoff: Duration) -> Result<(), JobError> {
        let backoff_ms = duration_millis(backoff);
        if backoff_ms <= 0 {
            return Err(JobError::InvalidBackoff(backoff_ms));
        }
        {
            let mut state = self.lock();
            state.running.remove(job.id());
            if self.storage.get_job_spec(job.id()).is_none() {
                warn!(job_id = %job.id(), "retried job is already gone");
                return Ok(());
            }
            let run_attempt = job.run_attempt() + 1;
            self.storage.update_job_after_retry(
                job.id(),
                self.now(),
                run_attempt,
                backoff_ms,
                job.serialize(),
            )?;
            self.tracker.on_state_change(job, JobState::Pending);
            info!(job_id = %job.id(), run_attempt, backoff_ms, "job will retry");
            self.work_available.notify_all();
        }
        self.schedule(backoff, &job.parameters().constraint_keys);
        Ok(())
    }

    /// Cancels a job. A running job is only flagged; the runner fails it
    /// when its run returns. Unknown ids are ignored.
    pub fn cancel_job(&self, id: &str) -> Result<(), JobError> {
        let cancelled = self.cancel_locked(id);
        self.notify_if_drained();
        let Some((job, dependents)) = cancelled? else {
            return Ok(());
        };

        job.on_failure();
        for dependent in dependents {
            dependent.on_failure();
        }
        Ok(())
    }

    /// The cancelled job and its failed dependents, when an idle job was
    /// failed here.
    fn cancel_locked(&self, id: &str) -> Result<Option<(Job, Vec<Arc<Job>>)>, JobError> {
        let mut state = self.lock();
        if let Some(running) = state.running.get(id) {
            running.cancel();
            info!(job_id = %id, "running job flagged for cancellation");
            return Ok(None);
        }
        let Some(spec) = self.storage.get_job_spec(id) else {
            warn!(job_id = %id, "cancel requested for unknown job");
            return Ok(None);
        };
        let job = match self
            .instantiator
            .instantiate(&spec, &self.storage.get_constraint_specs(id))
        {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %id, error = %e, "cancelled job cannot be instantiated; discarding");
                self.discard(&mut state, &spec)?;
                return Ok(None);
            }
        };
        job.cancel();
        info!(job_id = %id, "job cancelled");
        let dependents = self.fail_locked(&mut state, &job)?;
        Ok(Some((job, dependents)))
    }

    pub fn cancel_all_in_queue(&self, queue_key: &str) -> Result<(), JobError> {
        let ids = {
            let state = self.lock();
            let mut ids: Vec<String> = state
                .running
                .values()
                .filter(|job| job.parameters().queue.as_deref() == Some(queue_key))
                .map(|job| job.id().to_string())
                .collect();
            for spec in self.storage.get_jobs_in_queue(queue_key) {
                if !ids.contains(&spec.id) {
                    ids.push(spec.id);
                }
            }
            ids
        };
        for id in ids {
            self.cancel_job(&id)?;
        }
        Ok(())
    }

    /// Rewrites every stored job that is not currently running.
    pub fn update(&self, updater: &dyn Fn(&JobSpec) -> JobSpec) -> Result<(), JobError> {
        let state = self.lock();
        self.storage.transform_jobs(&|spec: &JobSpec| {
            if spec.is_running || state.running.contains_key(&spec.id) {
                spec.clone()
            } else {
                updater(spec)
            }
        })?;
        self.work_available.notify_all();
        Ok(())
    }

    pub fn find_jobs(&self, predicate: &dyn Fn(&JobSpec) -> bool) -> Vec<JobSpec> {
        self.storage.get_all_matching_filter(predicate)
    }

    /// Jobs that could start right now, ignoring constraints.
    pub fn eligible_job_count(&self) -> usize {
        self.storage.get_eligible_job_count(self.now())
    }

    pub fn are_queues_empty(&self, queue_keys: &[String]) -> bool {
        self.storage.are_queues_empty(queue_keys)
    }

    /// A JSON dump of everything in storage plus the running set.
    pub fn debug_info(&self) -> String {
        let running: Vec<String> = {
            let state = self.lock();
            state.running.keys().cloned().collect()
        };
        let jobs = self.storage.get_all_job_specs();
        let constraints = self.storage.get_all_constraint_specs();
        let dependencies: Vec<DependencySpec> = self.storage.get_all_dependency_specs();
        serde_json::to_string_pretty(&json!({
            "jobs": jobs,
            "constraints": constraints,
            "dependencies": dependencies,
            "running": running,
        }))
        .unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }

    /// Starts the reserved runners plus a general pool sized between
    /// `min_runners` and `max_runners` by the current backlog. Returns the
    /// number of general runners started.
    pub fn start_job_runners(self: &Arc<Self>) -> usize {
        for predicate in self.config.reserved_runners.clone() {
            let id = self.lock().register_runner(RunnerKind::Reserved);
            self.spawn_runner(id, RunnerKind::Reserved, predicate);
        }
        let eligible = self.eligible_job_count();
        let target = eligible
            .min(self.config.max_runners)
            .max(self.config.min_runners);
        let started = self.grow_pool(target);
        info!(started, eligible, "job runners started");
        started
    }

    /// Tops the pool up towards `min(demand(), max_runners)`.
    pub fn maybe_scale_up_runners(self: &Arc<Self>, demand: impl FnOnce() -> usize) -> usize {
        let target = demand().min(self.config.max_runners);
        let started = self.grow_pool(target);
        if started > 0 {
            debug!(started, target, "scaled up job runners");
        }
        started
    }

    fn grow_pool(self: &Arc<Self>, target: usize) -> usize {
        let planned: Vec<(u64, RunnerKind)> = {
            let mut state = self.lock();
            if state.shutting_down {
                return 0;
            }
            let mut planned = Vec::new();
            let mut size = state.pool_size();
            while size < target {
                let kind = if size < self.config.min_runners {
                    RunnerKind::Core
                } else {
                    RunnerKind::Elastic
                };
                planned.push((state.register_runner(kind), kind));
                size += 1;
            }
            planned
        };

        planned
            .into_iter()
            .filter(|(id, kind)| self.spawn_runner(*id, *kind, Arc::new(AnyJob)))
            .count()
    }

    fn spawn_runner(self: &Arc<Self>, id: u64, kind: RunnerKind, predicate: Arc<dyn JobPredicate>) -> bool {
        let runner = JobRunner::new(id, kind, self.clone(), predicate);
        let spawned = thread::Builder::new()
            .name(format!("jobmill-runner-{id}"))
            .spawn(move || runner.run());

        let mut state = self.lock();
        match spawned {
            Ok(handle) => {
                state.handles.retain(|h| !h.is_finished());
                state.handles.push(handle);
                debug!(runner_id = id, ?kind, "runner spawned");
                true
            }
            Err(e) => {
                state.runners.remove(&id);
                error!(runner_id = id, error = %e, "failed to spawn runner thread");
                false
            }
        }
    }

    pub fn on_runner_terminated(&self, runner_id: u64) {
        if self.lock().runners.remove(&runner_id).is_some() {
            debug!(runner_id, "runner terminated");
        }
    }

    /// Live general-purpose runners; reserved runners are not counted.
    pub fn runner_count(&self) -> usize {
        self.lock().pool_size()
    }

    /// Stops runners once their current job returns, then the scheduler.
    pub fn shutdown(&self) {
        let handles = {
            let mut state = self.lock();
            state.shutting_down = true;
            self.work_available.notify_all();
            std::mem::take(&mut state.handles)
        };
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        self.scheduler.shutdown();
        info!("job controller stopped");
    }
}

impl std::fmt::Debug for JobController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("JobController")
            .field("running", &state.running.len())
            .field("runners", &state.runners.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

fn initial_delay(job: &Job) -> Duration {
    Duration::from_millis(job.parameters().initial_delay.max(0) as u64)
}

fn build_full_spec(job: &Job, upstream: &[Upstream]) -> FullSpec {
    let params = job.parameters();
    let job_spec = JobSpec {
        id: params.id.clone(),
        factory_key: job.factory_key().to_string(),
        queue_key: params.queue.clone(),
        create_time: params.create_time,
        last_run_attempt_time: 0,
        next_backoff_interval: 0,
        run_attempt: 0,
        max_attempts: params.max_attempts,
        max_instances_for_factory: params.max_instances_for_factory,
        max_instances_for_queue: params.max_instances_for_queue,
        lifespan: params.lifespan,
        serialized_data: job.serialize(),
        serialized_input_data: params.input_data.clone(),
        is_running: false,
        is_memory_only: params.memory_only,
        initial_delay: params.initial_delay,
        global_priority: params.global_priority,
        queue_priority: params.queue_priority,
    };
    let constraint_specs = params
        .constraint_keys
        .iter()
        .map(|key| ConstraintSpec {
            job_id: params.id.clone(),
            factory_key: key.clone(),
            is_memory_only: params.memory_only,
        })
        .collect();
    let dependency_specs = upstream
        .iter()
        .map(|dependency| DependencySpec {
            job_id: params.id.clone(),
            depends_on_job_id: dependency.id.clone(),
            is_within_queue: params.queue.is_some() && params.queue == dependency.queue,
            is_memory_only: params.memory_only || dependency.memory_only,
        })
        .collect();

    FullSpec {
        job_spec,
        constraint_specs,
        dependency_specs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::{JobContext, JobKind, JobResult, Parameters};
    use crate::scheduler::CompositeScheduler;
    use crate::storage::{CachedJobStorage, DatabaseOp, InMemoryJobDatabase};
    use proptest::prelude::*;

    struct Noop(&'static str);

    impl JobKind for Noop {
        fn factory_key(&self) -> &str {
            self.0
        }

        fn run(&self, _ctx: &JobContext) -> JobResult {
            JobResult::success()
        }
    }

    struct Fixture {
        controller: Arc<JobController>,
        database: Arc<InMemoryJobDatabase>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let database = Arc::new(InMemoryJobDatabase::new());
        let storage = Arc::new(CachedJobStorage::new(database.clone()));
        storage.init().unwrap();
        let mut registry = Registry::new();
        for key in ["a", "b"] {
            registry.register_job(key, move |_| Ok(Box::new(Noop(key)) as Box<dyn JobKind>));
        }
        let clock = Arc::new(ManualClock::new(1_000));
        let controller = Arc::new(JobController::new(
            storage,
            Arc::new(registry),
            Arc::new(JobTracker::default()),
            Box::new(CompositeScheduler::default()),
            JobMigrator::default(),
            clock.clone(),
            JobManagerConfig::default(),
        ));
        controller.init().unwrap();
        database.clear_operations();
        Fixture {
            controller,
            database,
            clock,
        }
    }

    fn job(id: &str, factory: &'static str) -> Job {
        Job::new(Parameters::new().with_id(id), Noop(factory))
    }

    fn pull(controller: &JobController) -> Option<String> {
        controller
            .pull_next_eligible_job_for_execution(&AnyJob, 0, Duration::ZERO)
            .map(|job| job.id().to_string())
    }

    #[test]
    fn chain_stages_depend_on_the_previous_stage() {
        let f = fixture();
        f.controller
            .submit_new_job_chain(vec![
                vec![job("1", "a"), job("2", "a")],
                vec![job("3", "b")],
            ])
            .unwrap();

        let mut edges: Vec<(String, String)> = f
            .controller
            .storage
            .get_all_dependency_specs()
            .into_iter()
            .map(|d| (d.job_id, d.depends_on_job_id))
            .collect();
        edges.sort();
        assert_eq!(
            edges,
            vec![("3".into(), "1".into()), ("3".into(), "2".into())]
        );
        assert_eq!(f.database.operations().len(), 1);
        assert_eq!(f.controller.tracker().state_of("3"), Some(JobState::Pending));
    }

    #[test]
    fn capped_jobs_are_ignored_and_chain_mates_survive() {
        let f = fixture();
        f.controller.submit_new_job_chain(vec![vec![job("x", "a")]]).unwrap();
        f.database.clear_operations();

        let capped = Job::new(
            Parameters::new().with_id("capped").with_max_instances_for_factory(1),
            Noop("a"),
        );
        f.controller
            .submit_new_job_chain(vec![vec![capped], vec![job("next", "b")]])
            .unwrap();

        assert_eq!(f.controller.tracker().state_of("capped"), Some(JobState::Ignored));
        assert!(f.controller.storage.get_job_spec("capped").is_none());
        assert!(f.controller.storage.get_job_spec("next").is_some());
        assert!(f.controller.storage.get_all_dependency_specs().is_empty());
        assert_eq!(
            f.database.operations(),
            vec![DatabaseOp::Insert(vec!["next".to_string()])]
        );
    }

    #[test]
    fn caps_count_jobs_admitted_in_the_same_submission() {
        let f = fixture();
        let capped = |id: &str| {
            Job::new(
                Parameters::new().with_id(id).with_max_instances_for_factory(1),
                Noop("a"),
            )
        };
        f.controller
            .submit_new_job_chain(vec![vec![capped("1"), capped("2")]])
            .unwrap();
        assert_eq!(f.controller.tracker().state_of("1"), Some(JobState::Pending));
        assert_eq!(f.controller.tracker().state_of("2"), Some(JobState::Ignored));
    }

    #[test]
    fn claimed_job_is_never_handed_out_twice() {
        let f = fixture();
        f.controller.submit_new_job_chain(vec![vec![job("1", "a")]]).unwrap();
        assert_eq!(pull(&f.controller).as_deref(), Some("1"));
        assert_eq!(pull(&f.controller), None);
        assert_eq!(f.controller.tracker().state_of("1"), Some(JobState::Running));
    }

    #[test]
    fn concurrent_pulls_claim_each_job_once() {
        let f = fixture();
        let ids: Vec<String> = (0..24).map(|i| format!("job-{i}")).collect();
        f.controller
            .submit_new_job_chain(vec![ids.iter().map(|id| job(id, "a")).collect()])
            .unwrap();

        let claimed: Vec<String> = thread::scope(|scope| {
            let pullers: Vec<_> = (0..6u64)
                .map(|runner_id| {
                    let controller = &f.controller;
                    scope.spawn(move || {
                        let mut mine = Vec::new();
                        while let Some(job) = controller.pull_next_eligible_job_for_execution(
                            &AnyJob,
                            runner_id,
                            Duration::from_millis(20),
                        ) {
                            mine.push(job.id().to_string());
                        }
                        mine
                    })
                })
                .collect();
            pullers
                .into_iter()
                .flat_map(|puller| puller.join().unwrap())
                .collect()
        });

        let mut unique = claimed.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(claimed.len(), ids.len());
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn terminated_runner_is_counted_out_once() {
        let f = fixture();
        let (first, _second) = {
            let mut state = f.controller.lock();
            (
                state.register_runner(RunnerKind::Elastic),
                state.register_runner(RunnerKind::Core),
            )
        };
        assert_eq!(f.controller.runner_count(), 2);

        f.controller.on_runner_terminated(first);
        assert_eq!(f.controller.runner_count(), 1);
        f.controller.on_runner_terminated(first);
        f.controller.on_runner_terminated(404);
        assert_eq!(f.controller.runner_count(), 1);
    }

    #[test]
    fn empty_queue_listeners_fire_when_the_last_job_leaves() {
        let f = fixture();
        let drains = Arc::new(Mutex::new(0usize));
        let counter = drains.clone();
        let listener = f
            .controller
            .add_on_empty_queue_listener(move || *counter.lock().unwrap() += 1);
        f.controller
            .submit_new_job_chain(vec![vec![job("A", "a")], vec![job("B", "b")]])
            .unwrap();

        let a = f
            .controller
            .pull_next_eligible_job_for_execution(&AnyJob, 0, Duration::ZERO)
            .unwrap();
        f.controller.on_success(&a, None).unwrap();
        assert_eq!(*drains.lock().unwrap(), 0);

        let b = f
            .controller
            .pull_next_eligible_job_for_execution(&AnyJob, 0, Duration::ZERO)
            .unwrap();
        f.controller.on_success(&b, None).unwrap();
        assert_eq!(*drains.lock().unwrap(), 1);

        // Nothing left to drain.
        f.controller.on_success(&b, None).unwrap();
        assert_eq!(*drains.lock().unwrap(), 1);

        assert!(f.controller.remove_on_empty_queue_listener(listener));
        assert!(!f.controller.remove_on_empty_queue_listener(listener));
        f.controller.submit_new_job_chain(vec![vec![job("C", "a")]]).unwrap();
        f.controller.cancel_job("C").unwrap();
        assert_eq!(*drains.lock().unwrap(), 1);
    }

    #[test]
    fn failure_cascade_that_empties_storage_notifies() {
        let f = fixture();
        let drains = Arc::new(Mutex::new(0usize));
        let counter = drains.clone();
        f.controller
            .add_on_empty_queue_listener(move || *counter.lock().unwrap() += 1);
        f.controller
            .submit_new_job_chain(vec![vec![job("A", "a")], vec![job("B", "b")]])
            .unwrap();

        let a = f
            .controller
            .pull_next_eligible_job_for_execution(&AnyJob, 0, Duration::ZERO)
            .unwrap();
        f.controller.on_failure(&a).unwrap();
        assert_eq!(*drains.lock().unwrap(), 1);
    }

    #[test]
    fn pull_times_out_without_work() {
        let f = fixture();
        let started = Instant::now();
        let pulled = f
            .controller
            .pull_next_eligible_job_for_execution(&AnyJob, 0, Duration::from_millis(30));
        assert!(pulled.is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn failure_cascades_in_one_delete() {
        let f = fixture();
        f.controller
            .submit_new_job_chain(vec![vec![job("A", "a")], vec![job("B", "b")], vec![job("C", "b")]])
            .unwrap();
        f.database.clear_operations();

        let a = f
            .controller
            .pull_next_eligible_job_for_execution(&AnyJob, 0, Duration::ZERO)
            .unwrap();
        let dependents = f.controller.on_failure(&a).unwrap();

        let ids: Vec<&str> = dependents.iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec!["B", "C"]);
        assert_eq!(
            f.database.operations(),
            vec![
                DatabaseOp::MarkRunning("A".to_string()),
                DatabaseOp::Delete(vec!["A".to_string(), "B".to_string(), "C".to_string()]),
            ]
        );
        for id in ["A", "B", "C"] {
            assert_eq!(f.controller.tracker().state_of(id), Some(JobState::Failure));
        }
        assert!(f.controller.on_failure(&a).unwrap().is_empty());
    }

    #[test]
    fn success_passes_output_to_every_dependent() {
        let f = fixture();
        f.controller
            .submit_new_job_chain(vec![vec![job("A", "a")], vec![job("B", "b")], vec![job("C", "b")]])
            .unwrap();
        let a = f
            .controller
            .pull_next_eligible_job_for_execution(&AnyJob, 0, Duration::ZERO)
            .unwrap();
        f.controller.on_success(&a, Some(vec![7])).unwrap();

        let storage = &f.controller.storage;
        assert!(storage.get_job_spec("A").is_none());
        assert_eq!(storage.get_job_spec("B").unwrap().serialized_input_data, Some(vec![7]));
        assert_eq!(storage.get_job_spec("C").unwrap().serialized_input_data, Some(vec![7]));
        assert_eq!(f.controller.tracker().state_of("A"), Some(JobState::Success));
        assert_eq!(pull(&f.controller).as_deref(), Some("B"));

        // A second report for the same job changes nothing.
        f.controller.on_success(&a, None).unwrap();
    }

    #[test]
    fn retry_backs_off_before_the_next_pull() {
        let f = fixture();
        f.controller.submit_new_job_chain(vec![vec![job("1", "a")]]).unwrap();
        let first = f
            .controller
            .pull_next_eligible_job_for_execution(&AnyJob, 0, Duration::ZERO)
            .unwrap();

        assert_eq!(
            f.controller.on_retry(&first, Duration::ZERO).unwrap_err(),
            JobError::InvalidBackoff(0)
        );
        f.controller.on_retry(&first, Duration::from_millis(500)).unwrap();
        assert_eq!(f.controller.tracker().state_of("1"), Some(JobState::Pending));
        assert_eq!(pull(&f.controller), None);

        f.clock.advance(Duration::from_millis(500));
        let second = f
            .controller
            .pull_next_eligible_job_for_execution(&AnyJob, 0, Duration::ZERO)
            .unwrap();
        assert_eq!(second.run_attempt(), 1);
    }

    #[test]
    fn depending_on_a_failed_job_fails_immediately() {
        let f = fixture();
        f.controller.tracker().publish(JobUpdate {
            job_id: "gone".to_string(),
            factory_key: "a".to_string(),
            queue_key: None,
            state: JobState::Failure,
        });
        f.controller
            .submit_job_with_existing_dependencies(job("late", "b"), vec!["gone".to_string()], None)
            .unwrap();

        assert_eq!(f.controller.tracker().state_of("late"), Some(JobState::Failure));
        assert!(f.controller.storage.get_job_spec("late").is_none());
        assert!(f.database.operations().is_empty());
    }

    #[test]
    fn existing_dependencies_and_queue_members_become_edges() {
        let f = fixture();
        let queued = Job::new(Parameters::new().with_id("q1").with_queue("sync"), Noop("a"));
        f.controller
            .submit_new_job_chain(vec![vec![job("root", "a"), queued]])
            .unwrap();
        f.controller
            .submit_job_with_existing_dependencies(
                job("after", "b"),
                vec!["root".to_string()],
                Some("sync".to_string()),
            )
            .unwrap();

        let mut upstream: Vec<String> = f
            .controller
            .storage
            .get_all_dependency_specs()
            .into_iter()
            .filter(|d| d.job_id == "after")
            .map(|d| d.depends_on_job_id)
            .collect();
        upstream.sort();
        assert_eq!(upstream, vec!["q1", "root"]);
    }

    #[test]
    fn cancel_flags_running_jobs_and_fails_idle_ones() {
        let f = fixture();
        f.controller
            .submit_new_job_chain(vec![vec![job("run", "a"), job("idle", "b")]])
            .unwrap();
        let running = f
            .controller
            .pull_next_eligible_job_for_execution(&|spec: &JobSpec| spec.id == "run", 0, Duration::ZERO)
            .unwrap();

        f.controller.cancel_job("run").unwrap();
        assert!(running.is_canceled());
        assert!(f.controller.storage.get_job_spec("run").is_some());

        f.controller.cancel_job("idle").unwrap();
        assert!(f.controller.storage.get_job_spec("idle").is_none());
        assert_eq!(f.controller.tracker().state_of("idle"), Some(JobState::Failure));

        f.controller.cancel_job("missing").unwrap();
    }

    #[test]
    fn unknown_factory_is_discarded_with_dependents() {
        let f = fixture();
        f.controller
            .submit_new_job_chain(vec![vec![job("orphan", "a")], vec![job("child", "b")]])
            .unwrap();
        f.controller
            .update(&|spec: &JobSpec| JobSpec {
                factory_key: if spec.id == "orphan" {
                    "retired".to_string()
                } else {
                    spec.factory_key.clone()
                },
                ..spec.clone()
            })
            .unwrap();

        assert_eq!(pull(&f.controller), None);
        assert!(f.controller.find_jobs(&|_| true).is_empty());
        assert_eq!(f.controller.tracker().state_of("child"), Some(JobState::Failure));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]

        #[test]
        fn each_stage_depends_on_exactly_the_previous_stage(
            sizes in prop::collection::vec(1usize..4, 1..5)
        ) {
            let f = fixture();
            let stages: Vec<Vec<String>> = sizes
                .iter()
                .enumerate()
                .map(|(s, n)| (0..*n).map(|j| format!("{s}-{j}")).collect())
                .collect();
            let chain: Vec<Vec<Job>> = stages
                .iter()
                .map(|ids| ids.iter().map(|id| job(id, "a")).collect())
                .collect();
            f.controller.submit_new_job_chain(chain).unwrap();

            let mut edges: Vec<(String, String)> = f
                .controller
                .storage
                .get_all_dependency_specs()
                .into_iter()
                .map(|d| (d.job_id, d.depends_on_job_id))
                .collect();
            edges.sort();
            let mut expected: Vec<(String, String)> = stages
                .windows(2)
                .flat_map(|pair| {
                    pair[1]
                        .iter()
                        .flat_map(|dependent| pair[0].iter().map(move |dep| (dependent.clone(), dep.clone())))
                        .collect::<Vec<_>>()
                })
                .collect();
            expected.sort();
            prop_assert_eq!(edges, expected);
        }
    }

    #[test]
    fn debug_info_lists_jobs() {
        let f = fixture();
        f.controller.submit_new_job_chain(vec![vec![job("1", "a")]]).unwrap();
        let info: serde_json::Value = serde_json::from_str(&f.controller.debug_info()).unwrap();
        assert_eq!(info["jobs"][0]["id"], "1");
        assert_eq!(info["running"].as_array().map(Vec::len), Some(0));
    }
}
