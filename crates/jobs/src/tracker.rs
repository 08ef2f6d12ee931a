//! Bounded record of job lifecycle states, with filtered subscriptions.
//!
//! Terminal states are sticky: once a job is recorded as SUCCESS, FAILURE or
//! IGNORED, later updates for it are dropped. The oldest records are evicted
//! once the tracker exceeds its capacity.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::job::Job;
use crate::spec::JobSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Success,
    Failure,
    /// Rejected at submission and never stored.
    Ignored,
}

impl JobState {
    pub fn is_complete(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failure | JobState::Ignored)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub job_id: String,
    pub factory_key: String,
    pub queue_key: Option<String>,
    pub state: JobState,
}

impl JobUpdate {
    pub fn for_job(job: &Job, state: JobState) -> Self {
        Self {
            job_id: job.id().to_string(),
            factory_key: job.factory_key().to_string(),
            queue_key: job.parameters().queue.clone(),
            state,
        }
    }

    pub fn for_spec(spec: &JobSpec, state: JobState) -> Self {
        Self {
            job_id: spec.id.clone(),
            factory_key: spec.factory_key.clone(),
            queue_key: spec.queue_key.clone(),
            state,
        }
    }
}

/// Receiving end of a tracker subscription.
#[derive(Debug)]
pub struct Subscription {
    receiver: Receiver<JobUpdate>,
}

impl Subscription {
    /// Block until the next update is available.
    pub fn recv(&self) -> Result<JobUpdate, RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<JobUpdate, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<JobUpdate, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Waits for the first terminal update, giving up after `timeout`.
    pub fn wait_for_completion(&self, timeout: Duration) -> Option<JobUpdate> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            match self.receiver.recv_timeout(remaining) {
                Ok(update) if update.state.is_complete() => return Some(update),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }
}

type Filter = Box<dyn Fn(&JobUpdate) -> bool + Send + Sync>;

struct Subscriber {
    filter: Filter,
    sender: Sender<JobUpdate>,
}

#[derive(Default)]
struct TrackerState {
    latest: HashMap<String, JobUpdate>,
    order: VecDeque<String>,
    subscribers: Vec<Subscriber>,
}

pub struct JobTracker {
    capacity: usize,
    state: Mutex<TrackerState>,
}

impl JobTracker {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(TrackerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_state_change(&self, job: &Job, state: JobState) -> bool {
        self.publish(JobUpdate::for_job(job, state))
    }

    /// Records and fans out `update`. Returns false when the job was already
    /// in a terminal state.
    pub fn publish(&self, update: JobUpdate) -> bool {
        let mut state = self.state();
        if let Some(previous) = state.latest.get(&update.job_id) {
            if previous.state.is_complete() {
                debug!(
                    job_id = %update.job_id,
                    current = ?previous.state,
                    ignored = ?update.state,
                    "dropping update for completed job"
                );
                return false;
            }
        } else {
            state.order.push_back(update.job_id.clone());
        }
        state.latest.insert(update.job_id.clone(), update.clone());

        while state.order.len() > self.capacity {
            if let Some(evicted) = state.order.pop_front() {
                state.latest.remove(&evicted);
            }
        }

        // Drop any dead subscribers while publishing.
        state
            .subscribers
            .retain(|s| !(s.filter)(&update) || s.sender.send(update.clone()).is_ok());
        true
    }

    pub fn state_of(&self, job_id: &str) -> Option<JobState> {
        self.state().latest.get(job_id).map(|u| u.state)
    }

    /// State of the first recorded job matching `filter`, oldest first.
    pub fn first_matching_state(&self, filter: impl Fn(&JobUpdate) -> bool) -> Option<JobState> {
        let state = self.state();
        state
            .order
            .iter()
            .filter_map(|id| state.latest.get(id))
            .find(|update| filter(update))
            .map(|update| update.state)
    }

    pub fn subscribe(&self, filter: impl Fn(&JobUpdate) -> bool + Send + Sync + 'static) -> Subscription {
        let (sender, receiver) = mpsc::channel();
        self.state().subscribers.push(Subscriber {
            filter: Box::new(filter),
            sender,
        });
        Subscription { receiver }
    }

    /// Subscribes to one job, replaying its current state if one is recorded.
    pub fn subscribe_to_job(&self, job_id: &str) -> Subscription {
        let (sender, receiver) = mpsc::channel();
        let mut state = self.state();
        if let Some(current) = state.latest.get(job_id) {
            let _ = sender.send(current.clone());
        }
        let wanted = job_id.to_string();
        state.subscribers.push(Subscriber {
            filter: Box::new(move |update| update.job_id == wanted),
            sender,
        });
        Subscription { receiver }
    }

    pub fn len(&self) -> usize {
        self.state().latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for JobTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("JobTracker")
            .field("capacity", &self.capacity)
            .field("tracked", &state.latest.len())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}
