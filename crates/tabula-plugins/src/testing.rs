//! Configurable in-memory plugin for unit tests

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::ConfigSchema;
use crate::permissions::Permission;
use crate::plugin::{ConfigMap, DataContext, Plugin, PluginContext};

#[derive(Clone, Default)]
pub(crate) struct TestPlugin {
    pub name: String,
    pub version: String,
    pub dependencies: Vec<String>,
    pub required: BTreeSet<Permission>,
    pub optional: BTreeSet<Permission>,
    pub schema: ConfigSchema,
    pub fail_activate: bool,
    pub fail_process: bool,
    pub fail_restore: bool,
    pub delay: Option<Duration>,
    pub calls: Arc<Mutex<Vec<String>>>,
    pub state: Arc<Mutex<Value>>,
}

impl TestPlugin {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            ..Default::default()
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn depends_on(mut self, spec: &str) -> Self {
        self.dependencies.push(spec.to_string());
        self
    }

    pub fn requires(mut self, permission: Permission) -> Self {
        self.required.insert(permission);
        self
    }

    pub fn optionally(mut self, permission: Permission) -> Self {
        self.optional.insert(permission);
        self
    }

    pub fn schema(mut self, schema: ConfigSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn failing_activate(mut self) -> Self {
        self.fail_activate = true;
        self
    }

    pub fn failing_process(mut self) -> Self {
        self.fail_process = true;
        self
    }

    pub fn failing_restore(mut self) -> Self {
        self.fail_restore = true;
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().expect("calls").push(call.to_string());
    }

    /// Factory producing instances that share the call log but start with fresh state
    pub fn factory(self) -> impl Fn() -> Arc<dyn Plugin> + Send + Sync + 'static {
        move || {
            let mut instance = self.clone();
            instance.state = Arc::new(Mutex::new(Value::Null));
            Arc::new(instance) as Arc<dyn Plugin>
        }
    }
}

#[async_trait]
impl Plugin for TestPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn description(&self) -> &str {
        "test plugin"
    }

    fn config_schema(&self) -> ConfigSchema {
        self.schema.clone()
    }

    async fn process_data(&self, context: &DataContext, params: &ConfigMap) -> Result<Value> {
        self.record("process_data");
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_process {
            bail!("processing exploded");
        }
        Ok(json!({
            "rows": context.row_count(),
            "partition": context.partition,
            "params": params,
        }))
    }

    fn required_permissions(&self) -> BTreeSet<Permission> {
        self.required.clone()
    }

    fn optional_permissions(&self) -> BTreeSet<Permission> {
        self.optional.clone()
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    async fn initialize(&self, _context: PluginContext) -> Result<()> {
        self.record("initialize");
        Ok(())
    }

    async fn activate(&self, _granted: &BTreeSet<Permission>) -> Result<()> {
        self.record("activate");
        if self.fail_activate {
            bail!("activation hook failed");
        }
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.record("deactivate");
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.record("cleanup");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.record("start");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.record("stop");
        Ok(())
    }

    fn save_state(&self) -> Result<Value> {
        Ok(self.state.lock().expect("state").clone())
    }

    fn restore_state(&self, state: &Value) -> Result<()> {
        if self.fail_restore {
            bail!("restore failed");
        }
        *self.state.lock().expect("state") = state.clone();
        Ok(())
    }
}
