//! Connectivity tracking and the network constraint built on it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Constraint, ConstraintNotifier, ConstraintObserver, Listeners, PlatformHint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Online,
    Offline,
}

/// Shared view of whether the process can reach the network.
///
/// Whatever owns the real connectivity signal flips this; constraints read it.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    online: AtomicBool,
    on_online: Listeners,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        Self {
            online: AtomicBool::new(initial == ConnectivityState::Online),
            on_online: Listeners::default(),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        if self.is_online() {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self) {
        if !self.online.swap(true, Ordering::SeqCst) {
            info!("connectivity restored");
            self.on_online.notify(NetworkConstraint::KEY);
        }
    }

    pub fn set_offline(&self) {
        if self.online.swap(false, Ordering::SeqCst) {
            info!("connectivity lost");
        }
    }

    /// Called on every offline to online transition.
    pub fn on_online(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.on_online.add(move |_| callback());
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::Online)
    }
}

/// Met while the monitor reports the process online.
#[derive(Debug, Clone)]
pub struct NetworkConstraint {
    monitor: Arc<ConnectivityMonitor>,
}

impl NetworkConstraint {
    pub const KEY: &'static str = "NetworkConstraint";

    pub fn new(monitor: Arc<ConnectivityMonitor>) -> Self {
        Self { monitor }
    }
}

impl Constraint for NetworkConstraint {
    fn factory_key(&self) -> &str {
        Self::KEY
    }

    fn is_met(&self) -> bool {
        self.monitor.is_online()
    }

    fn platform_hint(&self) -> Option<PlatformHint> {
        Some(PlatformHint::RequiresNetwork)
    }
}

#[derive(Debug, Clone)]
pub struct NetworkConstraintObserver {
    monitor: Arc<ConnectivityMonitor>,
}

impl NetworkConstraintObserver {
    pub fn new(monitor: Arc<ConnectivityMonitor>) -> Self {
        Self { monitor }
    }
}

impl ConstraintObserver for NetworkConstraintObserver {
    fn register(&self, notifier: Arc<dyn ConstraintNotifier>) {
        self.monitor
            .on_online(move || notifier.on_constraint_met(NetworkConstraint::KEY));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::testing::RecordingNotifier;

    #[test]
    fn constraint_follows_connectivity() {
        let monitor = Arc::new(ConnectivityMonitor::new(ConnectivityState::Offline));
        let constraint = NetworkConstraint::new(monitor.clone());
        assert!(!constraint.is_met());
        monitor.set_online();
        assert!(constraint.is_met());
        assert_eq!(constraint.platform_hint(), Some(PlatformHint::RequiresNetwork));
    }

    #[test]
    fn observer_fires_only_on_transition_to_online() {
        let monitor = Arc::new(ConnectivityMonitor::new(ConnectivityState::Offline));
        let notifier = Arc::new(RecordingNotifier::default());
        NetworkConstraintObserver::new(monitor.clone()).register(notifier.clone());

        monitor.set_online();
        monitor.set_online();
        monitor.set_offline();
        monitor.set_online();

        assert_eq!(notifier.reasons(), vec![NetworkConstraint::KEY, NetworkConstraint::KEY]);
    }
}
