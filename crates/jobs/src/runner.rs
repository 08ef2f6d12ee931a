//! Runner threads: pull an eligible job, run it, report the outcome.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::controller::JobController;
use crate::job::{Job, JobResult};
use crate::spec::JobSpec;

/// Restricts which jobs a runner may pick up.
pub trait JobPredicate: Send + Sync {
    fn should_run(&self, spec: &JobSpec) -> bool;
}

impl<F> JobPredicate for F
where
    F: Fn(&JobSpec) -> bool + Send + Sync,
{
    fn should_run(&self, spec: &JobSpec) -> bool {
        self(spec)
    }
}

/// Accepts every job.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyJob;

impl JobPredicate for AnyJob {
    fn should_run(&self, _spec: &JobSpec) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    /// Lives until shutdown.
    Core,
    /// Exits after sitting idle for the configured timeout.
    Elastic,
    /// Dedicated to one predicate, outside the general pool.
    Reserved,
}

pub(crate) struct JobRunner {
    id: u64,
    kind: RunnerKind,
    controller: Arc<JobController>,
    predicate: Arc<dyn JobPredicate>,
}

impl JobRunner {
    pub(crate) fn new(
        id: u64,
        kind: RunnerKind,
        controller: Arc<JobController>,
        predicate: Arc<dyn JobPredicate>,
    ) -> Self {
        Self {
            id,
            kind,
            controller,
            predicate,
        }
    }

    pub(crate) fn run(self) {
        let pull_timeout = self.controller.config().pull_timeout;
        let idle_timeout = self.controller.config().idle_runner_timeout;
        let mut idle_since = Instant::now();
        debug!(runner_id = self.id, kind = ?self.kind, "runner started");

        loop {
            if self.controller.is_shutting_down() {
                break;
            }
            match self
                .controller
                .pull_next_eligible_job_for_execution(self.predicate.as_ref(), self.id, pull_timeout)
            {
                Some(job) => {
                    self.execute(&job);
                    idle_since = Instant::now();
                }
                None => {
                    if self.kind == RunnerKind::Elastic && idle_since.elapsed() >= idle_timeout {
                        debug!(runner_id = self.id, "elastic runner idle; exiting");
                        break;
                    }
                }
            }
        }

        self.controller.on_runner_terminated(self.id);
        debug!(runner_id = self.id, "runner stopped");
    }

    fn execute(&self, job: &Arc<Job>) {
        let now = self.controller.now();
        let result = if job.is_expired(now) {
            warn!(job_id = %job.id(), "job outlived its lifespan; failing");
            JobResult::Failure
        } else {
            let started = Instant::now();
            let result = match panic::catch_unwind(AssertUnwindSafe(|| job.run())) {
                Ok(result) => result,
                Err(_) => {
                    error!(job_id = %job.id(), factory = %job.factory_key(), "job panicked");
                    JobResult::Failure
                }
            };
            debug!(
                job_id = %job.id(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "job run finished"
            );
            result
        };

        let result = self.settle(job, result);
        match result {
            JobResult::Success(output) => {
                if let Err(e) = self.controller.on_success(job, output) {
                    error!(job_id = %job.id(), error = %e, "failed to record success");
                }
            }
            JobResult::Retry(hint) => {
                let backoff = hint
                    .filter(|d| !d.is_zero())
                    .unwrap_or_else(|| {
                        self.controller
                            .config()
                            .default_retry_policy
                            .delay_for_attempt(job.run_attempt() + 1)
                    })
                    .max(Duration::from_millis(1));
                match self.controller.on_retry(job, backoff) {
                    Ok(()) => job.on_retry(),
                    Err(e) => error!(job_id = %job.id(), error = %e, "failed to record retry"),
                }
            }
            JobResult::Failure => match self.controller.on_failure(job) {
                Ok(dependents) => {
                    job.on_failure();
                    for dependent in dependents {
                        dependent.on_failure();
                    }
                }
                Err(e) => error!(job_id = %job.id(), error = %e, "failed to record failure"),
            },
        }
    }

    /// Canceled jobs and exhausted retries fail.
    fn settle(&self, job: &Job, result: JobResult) -> JobResult {
        if job.is_canceled() {
            info!(job_id = %job.id(), "job was canceled while running");
            return JobResult::Failure;
        }
        match result {
            JobResult::Retry(_)
                if job
                    .parameters()
                    .max_attempts
                    .is_some_and(|max| job.run_attempt() + 1 >= max) =>
            {
                info!(job_id = %job.id(), attempts = job.run_attempt() + 1, "out of attempts");
                JobResult::Failure
            }
            other => other,
        }
    }
}
