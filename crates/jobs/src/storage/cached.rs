//! Write-through, fully cached [`JobStorage`].

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use super::{JobDatabase, JobStorage};
use crate::error::StorageError;
use crate::job::MIGRATION_QUEUE_KEY;
use crate::spec::{ConstraintSpec, DependencySpec, FullSpec, JobSpec};

#[derive(Debug, Clone)]
struct Entry {
    spec: JobSpec,
    /// Insertion order, the final tie-break.
    seq: u64,
}

/// Order within a single queue.
fn queue_order(a: &Entry, b: &Entry) -> Ordering {
    b.spec
        .global_priority
        .cmp(&a.spec.global_priority)
        .then(b.spec.queue_priority.cmp(&a.spec.queue_priority))
        .then(a.spec.create_time.cmp(&b.spec.create_time))
        .then(a.seq.cmp(&b.seq))
}

/// Order across queue heads and unqueued jobs. Queue priority is local to a
/// queue and plays no part here.
fn global_order(a: &Entry, b: &Entry) -> Ordering {
    b.spec
        .global_priority
        .cmp(&a.spec.global_priority)
        .then(a.spec.create_time.cmp(&b.spec.create_time))
        .then(a.seq.cmp(&b.seq))
}

/// A same-queue edge whose dependent sorts ahead of its dependency can never
/// be satisfied: the dependency never becomes the queue head.
fn deadlocks(dependent: &Entry, dependency: &Entry) -> bool {
    dependent.spec.queue_key.is_some()
        && dependent.spec.queue_key == dependency.spec.queue_key
        && queue_order(dependent, dependency) == Ordering::Less
}

enum Candidates<'a> {
    /// The migration queue is non-empty; only its head may run.
    Migration(&'a Entry),
    Regular(Vec<&'a Entry>),
}

#[derive(Debug, Default)]
struct Cache {
    jobs: HashMap<String, Entry>,
    constraints: HashMap<String, Vec<ConstraintSpec>>,
    /// Edges keyed by the waiting job.
    dependencies: HashMap<String, Vec<DependencySpec>>,
    /// The same edges keyed by the job being waited on.
    dependents: HashMap<String, Vec<DependencySpec>>,
    next_seq: u64,
}

impl Cache {
    fn insert(&mut self, entry: Entry, constraints: Vec<ConstraintSpec>, deps: Vec<DependencySpec>) {
        let id = entry.spec.id.clone();
        self.next_seq = self.next_seq.max(entry.seq + 1);
        self.jobs.insert(id.clone(), entry);
        if !constraints.is_empty() {
            self.constraints.entry(id).or_default().extend(constraints);
        }
        for dep in deps {
            self.dependents
                .entry(dep.depends_on_job_id.clone())
                .or_default()
                .push(dep.clone());
            self.dependencies
                .entry(dep.job_id.clone())
                .or_default()
                .push(dep);
        }
    }

    fn remove_dependency(&mut self, dep: &DependencySpec) {
        if let Some(edges) = self.dependencies.get_mut(&dep.job_id) {
            edges.retain(|d| d != dep);
            if edges.is_empty() {
                self.dependencies.remove(&dep.job_id);
            }
        }
        if let Some(edges) = self.dependents.get_mut(&dep.depends_on_job_id) {
            edges.retain(|d| d != dep);
            if edges.is_empty() {
                self.dependents.remove(&dep.depends_on_job_id);
            }
        }
    }

    fn remove(&mut self, id: &str) {
        self.jobs.remove(id);
        self.constraints.remove(id);
        let edges: Vec<DependencySpec> = self
            .dependencies
            .get(id)
            .into_iter()
            .chain(self.dependents.get(id))
            .flatten()
            .cloned()
            .collect();
        for edge in &edges {
            self.remove_dependency(edge);
        }
    }

    fn constraints_of(&self, id: &str) -> &[ConstraintSpec] {
        self.constraints.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn has_pending_dependencies(&self, id: &str) -> bool {
        self.dependencies
            .get(id)
            .is_some_and(|edges| edges.iter().any(|e| self.jobs.contains_key(&e.depends_on_job_id)))
    }

    /// Runnable ignoring constraints and runner predicates.
    fn is_ready(&self, entry: &Entry, now: i64) -> bool {
        !entry.spec.is_running && entry.spec.is_due(now) && !self.has_pending_dependencies(&entry.spec.id)
    }

    fn candidates(&self) -> Candidates<'_> {
        let mut busy_queues: HashSet<&str> = HashSet::new();
        let mut heads: HashMap<&str, &Entry> = HashMap::new();
        let mut unqueued = Vec::new();

        for entry in self.jobs.values() {
            let Some(queue) = entry.spec.queue_key.as_deref() else {
                unqueued.push(entry);
                continue;
            };
            if entry.spec.is_running {
                busy_queues.insert(queue);
            }
            heads
                .entry(queue)
                .and_modify(|head| {
                    if queue_order(entry, *head) == Ordering::Less {
                        *head = entry;
                    }
                })
                .or_insert(entry);
        }

        if let Some(head) = heads.get(MIGRATION_QUEUE_KEY).copied() {
            return Candidates::Migration(head);
        }

        let mut candidates: Vec<&Entry> = heads
            .into_iter()
            .filter(|(queue, _)| !busy_queues.contains(queue))
            .map(|(_, head)| head)
            .collect();
        candidates.extend(unqueued);
        Candidates::Regular(candidates)
    }

    fn sorted_specs<'a>(&self, entries: impl Iterator<Item = &'a Entry>) -> Vec<JobSpec> {
        let mut entries: Vec<&Entry> = entries.collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.spec.clone()).collect()
    }
}

/// Keeps every spec in memory and mirrors durable changes to `D`.
///
/// Every mutation writes to the database first; the cache only changes once
/// the write succeeded. Memory-only rows never reach the database.
#[derive(Debug)]
pub struct CachedJobStorage<D: JobDatabase> {
    database: D,
    cache: RwLock<Cache>,
}

impl<D: JobDatabase> CachedJobStorage<D> {
    pub fn new(database: D) -> Self {
        Self {
            database,
            cache: RwLock::new(Cache::default()),
        }
    }

    pub fn database(&self) -> &D {
        &self.database
    }

    fn read(&self) -> RwLockReadGuard<'_, Cache> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Cache> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops edges that could never resolve, persisting the removal.
    fn remove_deadlocked_dependencies(&self, cache: &mut Cache) -> Result<(), StorageError> {
        let doomed: Vec<DependencySpec> = cache
            .dependencies
            .values()
            .flatten()
            .filter(|edge| {
                match (cache.jobs.get(&edge.job_id), cache.jobs.get(&edge.depends_on_job_id)) {
                    (Some(dependent), Some(dependency)) => deadlocks(dependent, dependency),
                    _ => false,
                }
            })
            .cloned()
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }

        let persisted: Vec<DependencySpec> =
            doomed.iter().filter(|d| !d.is_memory_only).cloned().collect();
        if !persisted.is_empty() {
            self.database.delete_dependency_specs(&persisted)?;
        }
        for edge in &doomed {
            warn!(
                job_id = %edge.job_id,
                depends_on = %edge.depends_on_job_id,
                "dropping dependency that can never resolve within its queue"
            );
            cache.remove_dependency(edge);
        }
        Ok(())
    }

    fn with_entry<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Entry) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut cache = self.write();
        let entry = cache
            .jobs
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        f(entry)
    }
}

impl<D: JobDatabase> JobStorage for CachedJobStorage<D> {
    fn init(&self) -> Result<(), StorageError> {
        let loaded = self.database.load()?;
        let mut cache = self.write();
        *cache = Cache::default();
        for (seq, full) in loaded.into_iter().enumerate() {
            let entry = Entry {
                spec: full.job_spec,
                seq: seq as u64,
            };
            cache.insert(entry, full.constraint_specs, full.dependency_specs);
        }
        self.remove_deadlocked_dependencies(&mut cache)?;
        info!(jobs = cache.jobs.len(), "job storage loaded");
        Ok(())
    }

    fn insert_jobs(&self, specs: Vec<FullSpec>) -> Result<(), StorageError> {
        if specs.is_empty() {
            return Ok(());
        }
        let mut cache = self.write();

        let base_seq = cache.next_seq;
        let mut staged: Vec<(Entry, Vec<ConstraintSpec>, Vec<DependencySpec>)> = specs
            .into_iter()
            .enumerate()
            .map(|(i, full)| {
                let entry = Entry {
                    spec: full.job_spec,
                    seq: base_seq + i as u64,
                };
                (entry, full.constraint_specs, full.dependency_specs)
            })
            .collect();

        let batch: HashMap<String, Entry> = staged
            .iter()
            .map(|(entry, _, _)| (entry.spec.id.clone(), entry.clone()))
            .collect();
        for (entry, _, deps) in staged.iter_mut() {
            let entry = &*entry;
            deps.retain(|dep| {
                let dependency = batch
                    .get(&dep.depends_on_job_id)
                    .or_else(|| cache.jobs.get(&dep.depends_on_job_id));
                match dependency {
                    Some(dependency) if deadlocks(entry, dependency) => {
                        warn!(
                            job_id = %dep.job_id,
                            depends_on = %dep.depends_on_job_id,
                            "dropping dependency that can never resolve within its queue"
                        );
                        false
                    }
                    _ => true,
                }
            });
        }

        let persisted: Vec<FullSpec> = staged
            .iter()
            .filter_map(|(entry, constraints, deps)| {
                FullSpec {
                    job_spec: entry.spec.clone(),
                    constraint_specs: constraints.clone(),
                    dependency_specs: deps.clone(),
                }
                .persistent_part()
            })
            .collect();
        if !persisted.is_empty() {
            self.database.insert_jobs(&persisted)?;
        }

        for (entry, constraints, deps) in staged {
            debug!(job_id = %entry.spec.id, factory = %entry.spec.factory_key, "job stored");
            cache.insert(entry, constraints, deps);
        }
        Ok(())
    }

    fn get_job_spec(&self, id: &str) -> Option<JobSpec> {
        self.read().jobs.get(id).map(|e| e.spec.clone())
    }

    fn get_all_job_specs(&self) -> Vec<JobSpec> {
        let cache = self.read();
        cache.sorted_specs(cache.jobs.values())
    }

    fn get_all_matching_filter(&self, filter: &dyn Fn(&JobSpec) -> bool) -> Vec<JobSpec> {
        let cache = self.read();
        cache.sorted_specs(cache.jobs.values().filter(|e| filter(&e.spec)))
    }

    fn update_jobs(&self, specs: &[JobSpec]) -> Result<(), StorageError> {
        let mut cache = self.write();
        let known: Vec<&JobSpec> = specs.iter().filter(|s| cache.jobs.contains_key(&s.id)).collect();
        let persisted: Vec<JobSpec> = known
            .iter()
            .filter(|s| cache.jobs.get(&s.id).is_some_and(|e| !e.spec.is_memory_only))
            .map(|s| (*s).clone())
            .collect();
        if !persisted.is_empty() {
            self.database.update_jobs(&persisted)?;
        }
        for spec in known {
            if let Some(entry) = cache.jobs.get_mut(&spec.id) {
                entry.spec = spec.clone();
            }
        }
        Ok(())
    }

    fn transform_jobs(
        &self,
        transformer: &dyn Fn(&JobSpec) -> JobSpec,
    ) -> Result<(), StorageError> {
        let changed: Vec<JobSpec> = {
            let cache = self.read();
            let mut entries: Vec<&Entry> = cache.jobs.values().collect();
            entries.sort_by_key(|e| e.seq);
            entries
                .into_iter()
                .filter_map(|e| {
                    let updated = transformer(&e.spec);
                    (updated != e.spec).then_some(updated)
                })
                .collect()
        };
        self.update_jobs(&changed)
    }

    fn delete_jobs(&self, ids: &[String]) -> Result<(), StorageError> {
        let mut cache = self.write();
        let persisted: Vec<String> = ids
            .iter()
            .filter(|id| cache.jobs.get(*id).is_some_and(|e| !e.spec.is_memory_only))
            .cloned()
            .collect();
        if !persisted.is_empty() {
            self.database.delete_jobs(&persisted)?;
        }
        for id in ids {
            cache.remove(id);
        }
        Ok(())
    }

    fn get_job_count(&self) -> usize {
        self.read().jobs.len()
    }

    fn get_job_count_for_factory(&self, factory_key: &str) -> usize {
        self.read()
            .jobs
            .values()
            .filter(|e| e.spec.factory_key == factory_key)
            .count()
    }

    fn get_job_count_for_factory_and_queue(&self, factory_key: &str, queue_key: &str) -> usize {
        self.read()
            .jobs
            .values()
            .filter(|e| {
                e.spec.factory_key == factory_key && e.spec.queue_key.as_deref() == Some(queue_key)
            })
            .count()
    }

    fn get_jobs_in_queue(&self, queue_key: &str) -> Vec<JobSpec> {
        let cache = self.read();
        cache.sorted_specs(
            cache
                .jobs
                .values()
                .filter(|e| e.spec.queue_key.as_deref() == Some(queue_key)),
        )
    }

    fn are_queues_empty(&self, queue_keys: &[String]) -> bool {
        let cache = self.read();
        !cache.jobs.values().any(|e| {
            e.spec
                .queue_key
                .as_ref()
                .is_some_and(|q| queue_keys.contains(q))
        })
    }

    fn get_next_eligible_job(
        &self,
        now: i64,
        constraints_met: &dyn Fn(&[ConstraintSpec]) -> bool,
        runner_predicate: &dyn Fn(&JobSpec) -> bool,
    ) -> Option<JobSpec> {
        let cache = self.read();
        let runnable = |entry: &Entry| {
            constraints_met(cache.constraints_of(&entry.spec.id)) && runner_predicate(&entry.spec)
        };

        match cache.candidates() {
            Candidates::Migration(head) => (cache.is_ready(head, now) && runnable(head))
                .then(|| head.spec.clone()),
            Candidates::Regular(mut candidates) => {
                candidates.retain(|e| cache.is_ready(e, now));
                candidates.sort_by(|a, b| global_order(a, b));
                candidates
                    .into_iter()
                    .find(|e| runnable(*e))
                    .map(|e| e.spec.clone())
            }
        }
    }

    fn get_eligible_job_count(&self, now: i64) -> usize {
        let cache = self.read();
        match cache.candidates() {
            Candidates::Migration(head) => usize::from(cache.is_ready(head, now)),
            Candidates::Regular(candidates) => {
                candidates.iter().filter(|e| cache.is_ready(e, now)).count()
            }
        }
    }

    fn get_constraint_specs(&self, job_id: &str) -> Vec<ConstraintSpec> {
        self.read().constraints_of(job_id).to_vec()
    }

    fn get_dependency_specs_that_depend_on_job(&self, job_id: &str) -> Vec<DependencySpec> {
        let cache = self.read();
        let mut found = Vec::new();
        let mut seen: HashSet<String> = HashSet::from([job_id.to_string()]);
        let mut frontier: VecDeque<String> = VecDeque::from([job_id.to_string()]);

        while let Some(id) = frontier.pop_front() {
            for edge in cache.dependents.get(&id).into_iter().flatten() {
                found.push(edge.clone());
                if seen.insert(edge.job_id.clone()) {
                    frontier.push_back(edge.job_id.clone());
                }
            }
        }
        found
    }

    fn get_all_dependency_specs(&self) -> Vec<DependencySpec> {
        self.read().dependencies.values().flatten().cloned().collect()
    }

    fn get_all_constraint_specs(&self) -> Vec<ConstraintSpec> {
        self.read().constraints.values().flatten().cloned().collect()
    }

    fn mark_job_as_running(&self, id: &str, now: i64) -> Result<(), StorageError> {
        self.with_entry(id, |entry| {
            if !entry.spec.is_memory_only {
                self.database.mark_job_as_running(id, now)?;
            }
            entry.spec.is_running = true;
            entry.spec.last_run_attempt_time = now;
            Ok(())
        })
    }

    fn update_job_after_retry(
        &self,
        id: &str,
        now: i64,
        run_attempt: u32,
        next_backoff_interval: i64,
        serialized_data: Option<Vec<u8>>,
    ) -> Result<(), StorageError> {
        self.with_entry(id, |entry| {
            if !entry.spec.is_memory_only {
                self.database.update_job_after_retry(
                    id,
                    now,
                    run_attempt,
                    next_backoff_interval,
                    serialized_data.as_deref(),
                )?;
            }
            entry.spec.is_running = false;
            entry.spec.run_attempt = run_attempt;
            entry.spec.last_run_attempt_time = now;
            entry.spec.next_backoff_interval = next_backoff_interval;
            entry.spec.serialized_data = serialized_data;
            Ok(())
        })
    }

    fn update_all_jobs_to_be_pending(&self) -> Result<(), StorageError> {
        let mut cache = self.write();
        self.database.update_all_jobs_to_be_pending()?;
        for entry in cache.jobs.values_mut() {
            entry.spec.is_running = false;
        }
        Ok(())
    }

    fn schema_version(&self) -> Result<u32, StorageError> {
        self.database.schema_version()
    }

    fn set_schema_version(&self, version: u32) -> Result<(), StorageError> {
        self.database.set_schema_version(version)
    }
}
