//! Shared fixtures for the integration tests

#![allow(dead_code)]

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabula_core::RuntimeConfig;
use tabula_plugins::config::ConfigSchema;
use tabula_plugins::loader::StaticSource;
use tabula_plugins::permissions::PermissionRequest;
use tabula_plugins::{
    ConfigMap, DataContext, Event, Permission, PermissionApprover, Plugin, PluginContext,
    PluginSystem,
};
use tempfile::TempDir;

/// Description of a stub plugin; every instance built from it starts fresh
#[derive(Clone, Default)]
pub struct Stub {
    pub name: String,
    pub version: String,
    pub dependencies: Vec<String>,
    pub required: BTreeSet<Permission>,
    pub optional: BTreeSet<Permission>,
    pub schema: ConfigSchema,
    pub fail_process: bool,
    pub fail_restore: bool,
    pub delay: Option<Duration>,
}

impl Stub {
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

    pub fn factory(self) -> impl Fn() -> Arc<dyn Plugin> + Send + Sync + 'static {
        move || {
            Arc::new(StubInstance {
                spec: self.clone(),
                processed: AtomicU64::new(0),
            }) as Arc<dyn Plugin>
        }
    }
}

/// Counts processed batches; the count is its saved state
pub struct StubInstance {
    spec: Stub,
    processed: AtomicU64,
}

#[async_trait]
impl Plugin for StubInstance {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn version(&self) -> &str {
        &self.spec.version
    }

    fn description(&self) -> &str {
        "integration stub"
    }

    fn config_schema(&self) -> ConfigSchema {
        self.spec.schema.clone()
    }

    async fn process_data(&self, context: &DataContext, params: &ConfigMap) -> Result<Value> {
        if let Some(delay) = self.spec.delay {
            tokio::time::sleep(delay).await;
        }
        if self.spec.fail_process {
            bail!("stub refused the data");
        }
        let processed = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({
            "plugin": self.spec.name,
            "rows": context.row_count(),
            "partition": context.partition,
            "params": params,
            "processed": processed,
        }))
    }

    fn required_permissions(&self) -> BTreeSet<Permission> {
        self.spec.required.clone()
    }

    fn optional_permissions(&self) -> BTreeSet<Permission> {
        self.spec.optional.clone()
    }

    fn dependencies(&self) -> Vec<String> {
        self.spec.dependencies.clone()
    }

    async fn initialize(&self, context: PluginContext) -> Result<()> {
        context.events.emit("stub.initialized", json!({ "config": context.config }));
        Ok(())
    }

    fn save_state(&self) -> Result<Value> {
        Ok(json!({ "processed": self.processed.load(Ordering::SeqCst) }))
    }

    fn restore_state(&self, state: &Value) -> Result<()> {
        if self.spec.fail_restore {
            bail!("stub state is incompatible");
        }
        let processed = state["processed"].as_u64().unwrap_or(0);
        self.processed.store(processed, Ordering::SeqCst);
        Ok(())
    }
}

/// Approver whose answer can be flipped between requests
#[derive(Default)]
pub struct Switch {
    allow: AtomicBool,
    prompts: AtomicUsize,
}

impl Switch {
    pub fn set(&self, allow: bool) {
        self.allow.store(allow, Ordering::SeqCst);
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionApprover for Switch {
    async fn approve(&self, _request: &PermissionRequest) -> bool {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.allow.load(Ordering::SeqCst)
    }
}

pub fn source(stubs: Vec<Stub>) -> StaticSource {
    stubs
        .into_iter()
        .fold(StaticSource::new(), |source, stub| source.with_plugin(stub.factory()))
}

pub fn system(temp: &TempDir, stubs: Vec<Stub>, approver: Arc<dyn PermissionApprover>) -> PluginSystem {
    PluginSystem::builder()
        .config(RuntimeConfig::with_plugin_dir(temp.path()))
        .source(Arc::new(source(stubs)))
        .approver(approver)
        .build()
        .expect("plugin system")
}

pub fn table(rows: usize) -> DataContext {
    DataContext::new(
        vec!["id".into(), "value".into()],
        (0..rows).map(|i| vec![json!(i), json!(i * 10)]).collect(),
    )
}

pub fn params(value: Value) -> ConfigMap {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

/// Collects every event of the given types
pub fn record(system: &PluginSystem, types: &[&str]) -> Arc<Mutex<Vec<Event>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    for event_type in types {
        let log = log.clone();
        system.event_bus().subscribe(event_type, 0, move |event| {
            log.lock().expect("log").push(event.clone());
            Ok(())
        });
    }
    log
}

pub fn types(log: &Arc<Mutex<Vec<Event>>>) -> Vec<String> {
    log.lock()
        .expect("log")
        .iter()
        .map(|e| e.event_type.clone())
        .collect()
}
