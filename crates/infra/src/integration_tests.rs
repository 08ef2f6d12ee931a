//! End-to-end tests for the job manager over SQLite.
//!
//! Tests: manager → cached storage → SQLite file → restart → runners
//!
//! Verifies:
//! - Pending jobs and their serialized state survive a restart
//! - Completed chains leave no rows behind
//! - Jobs interrupted mid-run are run again after a restart

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use jobmill_jobs::{
        FactoryInput, Job, JobContext, JobDatabase, JobKind, JobManager, JobManagerConfig, JobResult,
        JobState, Parameters, Registry,
    };

    use crate::{SqliteConfig, SqliteJobDatabase, open_job_storage};

    const WAIT: Duration = Duration::from_secs(5);
    const KEY: &str = "note";

    /// Records the note it carries when it runs.
    struct Note {
        text: String,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl JobKind for Note {
        fn factory_key(&self) -> &str {
            KEY
        }

        fn serialize(&self) -> Option<Vec<u8>> {
            Some(self.text.as_bytes().to_vec())
        }

        fn run(&self, _ctx: &JobContext) -> JobResult {
            self.seen.lock().unwrap().push(self.text.clone());
            JobResult::success()
        }
    }

    struct TempDb {
        dir: PathBuf,
    }

    impl TempDb {
        fn new() -> Self {
            let dir = std::env::temp_dir().join(format!("jobmill-infra-{}", uuid::Uuid::now_v7()));
            std::fs::create_dir_all(&dir).unwrap();
            Self { dir }
        }

        fn config(&self) -> SqliteConfig {
            SqliteConfig::at_path(self.dir.join("jobs.db"))
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.dir).ok();
        }
    }

    fn manager(db: &TempDb, seen: &Arc<Mutex<Vec<String>>>) -> Arc<JobManager> {
        jobmill_observability::init_for_tests();

        let mut registry = Registry::new();
        let seen = seen.clone();
        registry.register_job(KEY, move |input: &FactoryInput<'_>| {
            let text = String::from_utf8(input.serialized_data.unwrap_or_default().to_vec())?;
            Ok(Box::new(Note {
                text,
                seen: seen.clone(),
            }) as Box<dyn JobKind>)
        });

        let storage = Arc::new(open_job_storage(&db.config()).unwrap());
        let config = JobManagerConfig::default()
            .with_min_runners(1)
            .with_max_runners(2)
            .with_pull_timeout(Duration::from_millis(50));
        JobManager::builder(storage, Arc::new(registry))
            .config(config)
            .build()
            .unwrap()
    }

    fn note(id: &str, text: &str, seen: &Arc<Mutex<Vec<String>>>) -> Job {
        Job::new(
            Parameters::new().with_id(id),
            Note {
                text: text.to_string(),
                seen: seen.clone(),
            },
        )
    }

    #[test]
    fn pending_jobs_survive_a_restart_with_their_state() {
        let db = TempDb::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        {
            let manager = manager(&db, &seen);
            manager
                .start_chain(vec![note("first", "hello", &seen)])
                .then(vec![note("second", "world", &seen)])
                .enqueue()
                .unwrap();
            assert_eq!(manager.find(|_| true).len(), 2);
            manager.shutdown();
        }
        assert!(seen.lock().unwrap().is_empty());

        let manager = manager(&db, &seen);
        let pending = manager.find(|spec| spec.id == "second");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].serialized_data.as_deref(), Some(&b"world"[..]));

        let done = manager.subscribe(|update| update.job_id == "second");
        manager.begin_job_loop();
        let update = done.wait_for_completion(WAIT).expect("second job never finished");

        assert_eq!(update.state, JobState::Success);
        assert_eq!(*seen.lock().unwrap(), vec!["hello", "world"]);
        manager.shutdown();
    }

    #[test]
    fn completed_chain_leaves_no_rows_behind() {
        let db = TempDb::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let manager = manager(&db, &seen);
        manager.begin_job_loop();

        let state = manager
            .start_chain(vec![note("a", "one", &seen), note("b", "two", &seen)])
            .then(vec![note("c", "three", &seen)])
            .enqueue_and_block_until_completion(WAIT)
            .unwrap();
        manager.shutdown();

        assert_eq!(state, Some(JobState::Success));
        assert_eq!(seen.lock().unwrap().last().map(String::as_str), Some("three"));
        let reopened = SqliteJobDatabase::open(&db.config()).unwrap();
        assert!(reopened.load().unwrap().is_empty());
    }

    #[test]
    fn job_interrupted_mid_run_runs_again_after_restart() {
        let db = TempDb::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        {
            let manager = manager(&db, &seen);
            manager.add(note("crashed", "again", &seen)).unwrap();
            manager.shutdown();
        }
        let raw = SqliteJobDatabase::open(&db.config()).unwrap();
        raw.mark_job_as_running("crashed", 1).unwrap();
        raw.close();

        let manager = manager(&db, &seen);
        let state = manager
            .find(|spec| spec.id == "crashed")
            .first()
            .map(|spec| spec.is_running);
        assert_eq!(state, Some(false));

        let done = manager.subscribe(|update| update.job_id == "crashed");
        manager.begin_job_loop();
        assert_eq!(
            done.wait_for_completion(WAIT).map(|update| update.state),
            Some(JobState::Success)
        );
        assert_eq!(*seen.lock().unwrap(), vec!["again"]);
    }
}
