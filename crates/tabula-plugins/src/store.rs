//! Keyed plugin state store
//!
//! Registry entries, lifecycle state and failed loads live behind one
//! lock, so a reader never sees a plugin in one table but not the others.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use crate::lifecycle::LifecycleState;
use crate::loader::LoadedPlugin;
use crate::permissions::Permission;

/// Registry entry for a loaded plugin
#[derive(Debug, Clone)]
pub struct PluginEntry {
    pub handle: LoadedPlugin,
    pub state: LifecycleState,
    /// Permissions passed to the last successful activation; cleared on deactivate
    pub active_permissions: BTreeSet<Permission>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    entries: HashMap<String, PluginEntry>,
    /// Plugins that failed to load; never present in `entries`
    failed: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct PluginStore {
    tables: RwLock<Tables>,
}

impl PluginStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly loaded plugin in `Loaded` state
    pub fn insert(&self, handle: LoadedPlugin) {
        let name = handle.name().to_string();
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.failed.remove(&name);
        tables.entries.insert(
            name,
            PluginEntry {
                handle,
                state: LifecycleState::Loaded,
                active_permissions: BTreeSet::new(),
                last_error: None,
                updated_at: Utc::now(),
            },
        );
    }

    /// Remove a plugin from every table
    pub fn remove(&self, name: &str) -> Option<PluginEntry> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.failed.remove(name);
        tables.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<PluginEntry> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .contains_key(name)
    }

    /// Current state; `Error` for failed loads, `Unloaded` when unknown
    pub fn state(&self, name: &str) -> LifecycleState {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        match tables.entries.get(name) {
            Some(entry) => entry.state,
            None if tables.failed.contains_key(name) => LifecycleState::Error,
            None => LifecycleState::Unloaded,
        }
    }

    /// Apply `f` to the entry under the write lock
    pub fn update<R>(&self, name: &str, f: impl FnOnce(&mut PluginEntry) -> R) -> Option<R> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.entries.get_mut(name).map(|entry| {
            let result = f(entry);
            entry.updated_at = Utc::now();
            result
        })
    }

    /// Set the state of a registered plugin; returns false when not registered
    pub fn set_state(&self, name: &str, state: LifecycleState) -> bool {
        self.update(name, |entry| {
            entry.state = state;
            if !state.is_active() {
                entry.active_permissions.clear();
            }
        })
        .is_some()
    }

    /// Move a registered plugin to `Error`, recording the cause
    pub fn mark_error(&self, name: &str, error: impl Into<String>) {
        let error = error.into();
        self.update(name, |entry| {
            entry.state = LifecycleState::Error;
            entry.active_permissions.clear();
            entry.last_error = Some(error);
        });
    }

    /// Record a plugin that never made it into the registry
    pub fn record_failure(&self, name: &str, error: impl Into<String>) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if !tables.entries.contains_key(name) {
            tables.failed.insert(name.to_string(), error.into());
        }
    }

    pub fn failures(&self) -> BTreeMap<String, String> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .failed
            .clone()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = tables.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Plugins currently in `Running`
    pub fn entries(&self) -> Vec<PluginEntry> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<PluginEntry> = tables.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.handle.name().cmp(b.handle.name()));
        entries
    }
}
