//! Boolean settings that gate jobs.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use super::{Constraint, ConstraintNotifier, ConstraintObserver, Listeners};

/// In-process feature toggles. Unknown settings read as disabled.
#[derive(Debug, Default)]
pub struct SettingsStore {
    values: RwLock<HashMap<String, bool>>,
    on_enabled: Listeners,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(false)
    }

    pub fn set(&self, name: &str, enabled: bool) {
        let previous = self
            .values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), enabled)
            .unwrap_or(false);
        debug!(setting = name, enabled, "setting changed");
        if enabled && !previous {
            self.on_enabled.notify(name);
        }
    }

    /// Called with the setting name whenever one flips to enabled.
    pub fn on_enabled(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.on_enabled.add(callback);
    }
}

/// Met while the named setting is enabled.
#[derive(Debug, Clone)]
pub struct SettingConstraint {
    key: String,
    setting: String,
    store: Arc<SettingsStore>,
}

impl SettingConstraint {
    pub fn new(key: impl Into<String>, setting: impl Into<String>, store: Arc<SettingsStore>) -> Self {
        Self {
            key: key.into(),
            setting: setting.into(),
            store,
        }
    }
}

impl Constraint for SettingConstraint {
    fn factory_key(&self) -> &str {
        &self.key
    }

    fn is_met(&self) -> bool {
        self.store.is_enabled(&self.setting)
    }
}

#[derive(Debug, Clone)]
pub struct SettingConstraintObserver {
    store: Arc<SettingsStore>,
}

impl SettingConstraintObserver {
    pub fn new(store: Arc<SettingsStore>) -> Self {
        Self { store }
    }
}

impl ConstraintObserver for SettingConstraintObserver {
    fn register(&self, notifier: Arc<dyn ConstraintNotifier>) {
        self.store
            .on_enabled(move |setting| notifier.on_constraint_met(&format!("setting:{setting}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::testing::RecordingNotifier;

    #[test]
    fn unknown_settings_are_disabled() {
        let store = Arc::new(SettingsStore::new());
        let constraint = SettingConstraint::new("BackupEnabled", "backup", store.clone());
        assert!(!constraint.is_met());
        store.set("backup", true);
        assert!(constraint.is_met());
        assert_eq!(constraint.factory_key(), "BackupEnabled");
    }

    #[test]
    fn observer_reports_enabled_setting() {
        let store = Arc::new(SettingsStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        SettingConstraintObserver::new(store.clone()).register(notifier.clone());

        store.set("backup", false);
        store.set("backup", true);
        store.set("backup", true);

        assert_eq!(notifier.reasons(), vec!["setting:backup"]);
    }
}
