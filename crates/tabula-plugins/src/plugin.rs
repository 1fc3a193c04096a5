//! Core plugin trait and types

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::config::ConfigSchema;
use crate::events::EventEmitter;
use crate::permissions::Permission;

/// Key/value plugin configuration and call parameters
pub type ConfigMap = serde_json::Map<String, Value>;

/// Context handed to a plugin in [`Plugin::initialize`]
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub name: String,
    /// Event handle scoped to this plugin
    pub events: EventEmitter,
    /// Stored config with schema defaults applied
    pub config: ConfigMap,
}

/// Tabular data a plugin processes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataContext {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Index of this slice when the table was split for parallel work
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<usize>,
}

impl DataContext {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows,
            partition: None,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Split rows into at most `count` contiguous, non-empty slices
    pub fn partitions(&self, count: usize) -> Vec<DataContext> {
        if self.rows.is_empty() || count == 0 {
            return vec![DataContext {
                partition: Some(0),
                ..self.clone()
            }];
        }

        let size = self.rows.len().div_ceil(count);
        self.rows
            .chunks(size)
            .enumerate()
            .map(|(index, chunk)| DataContext {
                columns: self.columns.clone(),
                rows: chunk.to_vec(),
                partition: Some(index),
            })
            .collect()
    }

    /// Column values by header name
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let index = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().filter_map(|row| row.get(index)).collect())
    }
}

/// State captured by `save_state` for a reload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSnapshot {
    pub plugin: String,
    pub version: String,
    pub config: ConfigMap,
    /// Plugin-private state returned by [`Plugin::save_state`]
    pub state: Value,
    pub saved_at: DateTime<Utc>,
}

/// Capability surface every plugin exposes to the runtime
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique name for this plugin
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn description(&self) -> &str;

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::default()
    }

    /// `Err(reason)` rejects the call before `process_data` runs
    fn validate_parameters(&self, params: &ConfigMap) -> std::result::Result<(), String> {
        self.config_schema().validate(params)
    }

    /// Processing entry point
    async fn process_data(&self, context: &DataContext, params: &ConfigMap) -> Result<Value>;

    fn required_permissions(&self) -> BTreeSet<Permission>;

    fn optional_permissions(&self) -> BTreeSet<Permission> {
        BTreeSet::new()
    }

    /// Dependency spec strings, e.g. `stats>=1.0` or `charts ; optional`
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn initialize(&self, _context: PluginContext) -> Result<()> {
        Ok(())
    }

    async fn activate(&self, _granted: &BTreeSet<Permission>) -> Result<()> {
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        Ok(())
    }

    /// Release everything the plugin holds; called on unload
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn save_state(&self) -> Result<Value> {
        Ok(Value::Null)
    }

    fn restore_state(&self, _state: &Value) -> Result<()> {
        Ok(())
    }
}
