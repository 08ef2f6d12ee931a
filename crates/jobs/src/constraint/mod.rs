//! Runtime preconditions for jobs, and the observers that announce when
//! they may have become satisfied.

use std::sync::{Arc, Mutex, PoisonError};

mod battery;
mod network;
mod setting;

pub use battery::{BatteryMonitor, BatteryNotLowConstraint, BatteryNotLowObserver};
pub use network::{ConnectivityMonitor, ConnectivityState, NetworkConstraint, NetworkConstraintObserver};
pub use setting::{SettingConstraint, SettingConstraintObserver, SettingsStore};

/// Requirements an external wake-up mechanism can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformHint {
    RequiresNetwork,
    RequiresBatteryNotLow,
}

/// A precondition evaluated right before a job is handed to a runner.
pub trait Constraint: Send + Sync {
    fn factory_key(&self) -> &str;

    fn is_met(&self) -> bool;

    fn platform_hint(&self) -> Option<PlatformHint> {
        None
    }
}

/// Receives "something may have changed" signals from observers.
pub trait ConstraintNotifier: Send + Sync {
    fn on_constraint_met(&self, reason: &str);
}

/// Watches one external condition and pokes the notifier when it turns
/// favourable.
pub trait ConstraintObserver: Send + Sync {
    fn register(&self, notifier: Arc<dyn ConstraintNotifier>);
}

type Listener = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks fired when a monitored condition becomes satisfied.
#[derive(Default)]
pub(crate) struct Listeners {
    callbacks: Mutex<Vec<Listener>>,
}

impl Listeners {
    pub(crate) fn add(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Invokes every callback outside the lock.
    pub(crate) fn notify(&self, reason: &str) {
        let callbacks: Vec<Listener> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(reason);
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .callbacks
            .lock()
            .map(|c| c.len())
            .unwrap_or_default();
        f.debug_struct("Listeners").field("count", &count).finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Collects every reason it is notified with.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub reasons: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        pub fn reasons(&self) -> Vec<String> {
            self.reasons.lock().unwrap().clone()
        }
    }

    impl ConstraintNotifier for RecordingNotifier {
        fn on_constraint_met(&self, reason: &str) {
            self.reasons.lock().unwrap().push(reason.to_string());
        }
    }
}
