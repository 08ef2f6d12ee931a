//! Deferred wake-ups for jobs that cannot run yet.
//!
//! The controller calls [`Scheduler::schedule`] whenever a job becomes
//! runnable after a delay. The in-app scheduler wakes the controller on a
//! timer thread; platform schedulers forward the request to an external
//! mechanism along with the constraints' platform hints.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::constraint::{Constraint, PlatformHint};

pub trait Scheduler: Send + Sync {
    /// Request a wake-up no earlier than `delay` from now.
    fn schedule(&self, delay: Duration, constraints: &[Box<dyn Constraint>]);

    /// Stop any background activity.
    fn shutdown(&self) {}
}

#[derive(Default)]
struct TimerState {
    deadlines: BinaryHeap<Reverse<Instant>>,
    shutdown: bool,
}

struct Timer {
    state: Mutex<TimerState>,
    changed: Condvar,
}

impl Timer {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wakes the controller from a dedicated timer thread.
///
/// Wake-ups are always delivered from the timer thread, never from inside
/// `schedule`, so callers may hold their own locks while scheduling.
pub struct InAppScheduler {
    timer: Arc<Timer>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl InAppScheduler {
    pub fn new(wake: impl Fn() + Send + 'static) -> Self {
        let timer = Arc::new(Timer {
            state: Mutex::new(TimerState::default()),
            changed: Condvar::new(),
        });
        let thread_timer = timer.clone();
        let thread = thread::Builder::new()
            .name("jobmill-scheduler".to_string())
            .spawn(move || timer_loop(&thread_timer, wake));

        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "failed to spawn scheduler thread; delayed jobs rely on other wake-ups");
                None
            }
        };

        Self {
            timer,
            thread: Mutex::new(thread),
        }
    }

    pub fn pending_wakeups(&self) -> usize {
        self.timer.lock().deadlines.len()
    }
}

fn timer_loop(timer: &Timer, wake: impl Fn()) {
    let mut state = timer.lock();
    loop {
        if state.shutdown {
            break;
        }
        let now = Instant::now();
        match state.deadlines.peek().copied() {
            None => {
                state = timer.changed.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
            Some(Reverse(at)) if at <= now => {
                state.deadlines.pop();
                drop(state);
                wake();
                state = timer.lock();
            }
            Some(Reverse(at)) => {
                state = timer
                    .changed
                    .wait_timeout(state, at - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }
    }
    debug!("scheduler thread stopped");
}

impl Scheduler for InAppScheduler {
    fn schedule(&self, delay: Duration, _constraints: &[Box<dyn Constraint>]) {
        let mut state = self.timer.lock();
        if state.shutdown {
            return;
        }
        let Some(at) = Instant::now().checked_add(delay) else {
            return;
        };
        state.deadlines.push(Reverse(at));
        self.timer.changed.notify_all();
        debug!(delay_ms = delay.as_millis() as u64, "wake-up scheduled");
    }

    fn shutdown(&self) {
        {
            let mut state = self.timer.lock();
            state.shutdown = true;
            state.deadlines.clear();
            self.timer.changed.notify_all();
        }
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for InAppScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Fans every request out to each inner scheduler.
#[derive(Default)]
pub struct CompositeScheduler {
    schedulers: Vec<Box<dyn Scheduler>>,
}

impl CompositeScheduler {
    pub fn new(schedulers: Vec<Box<dyn Scheduler>>) -> Self {
        Self { schedulers }
    }

    pub fn push(&mut self, scheduler: Box<dyn Scheduler>) {
        self.schedulers.push(scheduler);
    }
}

impl Scheduler for CompositeScheduler {
    fn schedule(&self, delay: Duration, constraints: &[Box<dyn Constraint>]) {
        for scheduler in &self.schedulers {
            scheduler.schedule(delay, constraints);
        }
    }

    fn shutdown(&self) {
        for scheduler in &self.schedulers {
            scheduler.shutdown();
        }
    }
}

/// An external wake-up mechanism, e.g. an OS job service.
pub trait PlatformWakeUp: Send + Sync {
    fn request_wake_up(&self, delay: Duration, hints: &[PlatformHint]);
}

/// Adapts a [`PlatformWakeUp`] to the [`Scheduler`] seam.
pub struct PlatformScheduler {
    platform: Box<dyn PlatformWakeUp>,
}

impl PlatformScheduler {
    pub fn new(platform: impl PlatformWakeUp + 'static) -> Self {
        Self {
            platform: Box::new(platform),
        }
    }
}

impl Scheduler for PlatformScheduler {
    fn schedule(&self, delay: Duration, constraints: &[Box<dyn Constraint>]) {
        let mut hints: Vec<PlatformHint> = Vec::new();
        for hint in constraints.iter().filter_map(|c| c.platform_hint()) {
            if !hints.contains(&hint) {
                hints.push(hint);
            }
        }
        self.platform.request_wake_up(delay, &hints);
    }
}
