use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use jobmill_jobs::{
    FactoryInput, Job, JobContext, JobKind, JobManager, JobManagerConfig, JobResult, Parameters,
    Registry, RetryPolicy,
};
use jobmill_infra::{SqliteConfig, open_job_storage};

const FETCH: &str = "fetch_greeting";
const DELIVER: &str = "deliver_greeting";

/// Produces a greeting for the next stage. Fails its first attempt to show
/// retries.
struct FetchGreeting {
    name: String,
}

impl JobKind for FetchGreeting {
    fn factory_key(&self) -> &str {
        FETCH
    }

    fn serialize(&self) -> Option<Vec<u8>> {
        Some(self.name.as_bytes().to_vec())
    }

    fn run(&self, ctx: &JobContext) -> JobResult {
        if ctx.run_attempt() == 0 {
            tracing::info!(job_id = %ctx.id(), "greeting service unavailable; retrying");
            return JobResult::retry();
        }
        JobResult::success_with_output(format!("hello, {}", self.name).into_bytes())
    }
}

struct DeliverGreeting;

impl JobKind for DeliverGreeting {
    fn factory_key(&self) -> &str {
        DELIVER
    }

    fn run(&self, ctx: &JobContext) -> JobResult {
        match ctx.input_data().map(String::from_utf8_lossy) {
            Some(greeting) => {
                tracing::info!(job_id = %ctx.id(), %greeting, "greeting delivered");
                JobResult::success()
            }
            None => JobResult::failure(),
        }
    }
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register_job(FETCH, |input: &FactoryInput<'_>| {
        let name = String::from_utf8(input.serialized_data.unwrap_or_default().to_vec())?;
        Ok(Box::new(FetchGreeting { name }) as Box<dyn JobKind>)
    });
    registry.register_job(DELIVER, |_: &FactoryInput<'_>| {
        Ok(Box::new(DeliverGreeting) as Box<dyn JobKind>)
    });
    registry
}

fn main() -> anyhow::Result<()> {
    jobmill_observability::init();

    let db_config = SqliteConfig::from_env()?;
    let storage = open_job_storage(&db_config)?;
    let config =
        JobManagerConfig::from_env().with_retry_policy(RetryPolicy::fixed(Duration::from_millis(200)));

    let manager = JobManager::builder(Arc::new(storage), Arc::new(registry()))
        .config(config)
        .build()
        .context("failed to start job manager")?;
    let runners = manager.begin_job_loop();
    tracing::info!(runners, db = %db_config.url, "job loop started");

    let fetch = |name: &str| {
        Job::new(
            Parameters::new().with_max_attempts(3),
            FetchGreeting {
                name: name.to_string(),
            },
        )
    };
    let deliver = || Job::new(Parameters::new().with_queue("delivery"), DeliverGreeting);

    let state = manager
        .start_chain(vec![fetch("world")])
        .then(vec![deliver()])
        .enqueue_and_block_until_completion(Duration::from_secs(30))?;
    tracing::info!(?state, "chain finished");

    tracing::debug!(snapshot = %manager.debug_info(), "job manager state");
    manager.shutdown();
    Ok(())
}
