//! Battery level tracking and the battery-not-low constraint.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use super::{Constraint, ConstraintNotifier, ConstraintObserver, Listeners, PlatformHint};

/// Battery state fed by the host. Charging never counts as low.
#[derive(Debug)]
pub struct BatteryMonitor {
    level: AtomicU8,
    charging: AtomicBool,
    low_threshold: u8,
    on_recovered: Listeners,
}

impl BatteryMonitor {
    pub const DEFAULT_LOW_THRESHOLD: u8 = 15;

    pub fn new(level: u8, charging: bool) -> Self {
        Self {
            level: AtomicU8::new(level.min(100)),
            charging: AtomicBool::new(charging),
            low_threshold: Self::DEFAULT_LOW_THRESHOLD,
            on_recovered: Listeners::default(),
        }
    }

    pub fn with_low_threshold(mut self, threshold: u8) -> Self {
        self.low_threshold = threshold;
        self
    }

    pub fn level(&self) -> u8 {
        self.level.load(Ordering::SeqCst)
    }

    pub fn is_low(&self) -> bool {
        !self.charging.load(Ordering::SeqCst) && self.level() <= self.low_threshold
    }

    pub fn set_level(&self, level: u8) {
        self.update(|| self.level.store(level.min(100), Ordering::SeqCst));
    }

    pub fn set_charging(&self, charging: bool) {
        self.update(|| self.charging.store(charging, Ordering::SeqCst));
    }

    /// Called whenever the battery stops being low.
    pub fn on_recovered(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.on_recovered.add(move |_| callback());
    }

    fn update(&self, change: impl FnOnce()) {
        let was_low = self.is_low();
        change();
        if was_low && !self.is_low() {
            self.on_recovered.notify(BatteryNotLowConstraint::KEY);
        }
    }
}

impl Default for BatteryMonitor {
    fn default() -> Self {
        Self::new(100, false)
    }
}

#[derive(Debug, Clone)]
pub struct BatteryNotLowConstraint {
    monitor: Arc<BatteryMonitor>,
}

impl BatteryNotLowConstraint {
    pub const KEY: &'static str = "BatteryNotLowConstraint";

    pub fn new(monitor: Arc<BatteryMonitor>) -> Self {
        Self { monitor }
    }
}

impl Constraint for BatteryNotLowConstraint {
    fn factory_key(&self) -> &str {
        Self::KEY
    }

    fn is_met(&self) -> bool {
        !self.monitor.is_low()
    }

    fn platform_hint(&self) -> Option<PlatformHint> {
        Some(PlatformHint::RequiresBatteryNotLow)
    }
}

#[derive(Debug, Clone)]
pub struct BatteryNotLowObserver {
    monitor: Arc<BatteryMonitor>,
}

impl BatteryNotLowObserver {
    pub fn new(monitor: Arc<BatteryMonitor>) -> Self {
        Self { monitor }
    }
}

impl ConstraintObserver for BatteryNotLowObserver {
    fn register(&self, notifier: Arc<dyn ConstraintNotifier>) {
        self.monitor
            .on_recovered(move || notifier.on_constraint_met(BatteryNotLowConstraint::KEY));
    }
}
