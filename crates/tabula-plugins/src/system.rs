//! PluginSystem orchestrator
//!
//! Composes the loader, resolver, store, permission manager, config store,
//! worker pools and workflows behind one API. Every lifecycle transition
//! publishes an event on the shared [`EventBus`].
//!
//! Calls are expected from a single logical caller context. Nothing here
//! serializes a sequence such as `activate` followed by `start` for the same
//! plugin; callers that drive one plugin from several tasks must order those
//! calls themselves.
//!
//! Lifecycle operations return `Ok(false)` when the transition was refused
//! (missing permission, unmet dependency, failing hook) and `Err` when the
//! request itself is invalid (unknown plugin, illegal transition) or
//! persistence fails.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tabula_core::RuntimeConfig;
use tabula_core::security::{AesGcmCipher, Encryption, PlainJson};
use tracing::{debug, error, info, warn};

use crate::config::PluginConfigStore;
use crate::dependencies::{DependencyReport, DependencyResolver};
use crate::events::{Event, EventBus, EventEmitter, names};
use crate::lifecycle::{LifecycleState, Transition};
use crate::loader::{DirectorySource, FactoryTable, LoadedPlugin, PluginLoader, PluginSource};
use crate::permissions::{DenyAll, Permission, PermissionApprover, PermissionManager};
use crate::plugin::{ConfigMap, DataContext, Plugin, PluginContext, PluginSnapshot};
use crate::security::{DependencySecurity, TrustPolicy};
use crate::store::{PluginEntry, PluginStore};
use crate::worker::{BatchOutcome, CancelReport, WorkUnit, WorkerPool};
use crate::workflow::{self, NodeRunner, WorkflowManager, WorkflowRun};
use crate::{PluginError, PluginResult};

/// Read-only view of a registered plugin
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub state: LifecycleState,
    pub required_permissions: BTreeSet<Permission>,
    pub optional_permissions: BTreeSet<Permission>,
    pub granted_permissions: BTreeSet<Permission>,
    pub dependencies: Vec<String>,
    pub last_error: Option<String>,
    pub loaded_at: DateTime<Utc>,
}

/// Outcome of [`PluginSystem::load_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    /// Loaded plugins, in load order
    pub loaded: Vec<String>,
    /// Plugins that could not be loaded, with the reason
    pub failed: BTreeMap<String, String>,
    pub cycles: Vec<Vec<String>>,
}

/// Composition root for [`PluginSystem`]
#[derive(Default)]
pub struct PluginSystemBuilder {
    config: Option<RuntimeConfig>,
    source: Option<Arc<dyn PluginSource>>,
    factories: FactoryTable,
    security: Option<Arc<dyn DependencySecurity>>,
    approver: Option<Arc<dyn PermissionApprover>>,
    codec: Option<Arc<dyn Encryption>>,
    events: Option<Arc<EventBus>>,
}

impl PluginSystemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime configuration (defaults when not set)
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Plugin source; defaults to a directory source over `plugins.plugin_dir`
    pub fn source(mut self, source: Arc<dyn PluginSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Factories used by the default directory source
    pub fn factories(mut self, factories: FactoryTable) -> Self {
        self.factories = factories;
        self
    }

    /// Whitelist and signature checks; defaults to the `[security]` section
    pub fn security(mut self, security: Arc<dyn DependencySecurity>) -> Self {
        self.security = Some(security);
        self
    }

    /// Interactive approval; defaults to denying every request
    pub fn approver(mut self, approver: Arc<dyn PermissionApprover>) -> Self {
        self.approver = Some(approver);
        self
    }

    /// At-rest codec for permissions, configs and workflows.
    ///
    /// Defaults to AES-GCM with the configured key file when
    /// `encrypt_at_rest` is set, plain JSON otherwise.
    pub fn codec(mut self, codec: Arc<dyn Encryption>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> PluginResult<PluginSystem> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let codec: Arc<dyn Encryption> = match self.codec {
            Some(codec) => codec,
            None if config.plugins.encrypt_at_rest => Arc::new(AesGcmCipher::load_or_generate(
                &config.plugins.resolved_key_file(),
            )?),
            None => Arc::new(PlainJson),
        };
        let security: Arc<dyn DependencySecurity> = match self.security {
            Some(security) => security,
            None => Arc::new(TrustPolicy::from_config(&config.security)?),
        };
        let source: Arc<dyn PluginSource> = match self.source {
            Some(source) => source,
            None => Arc::new(
                DirectorySource::new(config.plugins.plugin_dir.clone(), self.factories)
                    .with_max_manifest_bytes(config.plugins.max_manifest_bytes),
            ),
        };
        let approver: Arc<dyn PermissionApprover> = match self.approver {
            Some(approver) => approver,
            None => Arc::new(DenyAll),
        };
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(EventBus::with_queue_capacity(config.events.queue_capacity)));

        let permissions =
            PermissionManager::open(config.plugins.resolved_permission_file(), codec.clone())?;
        let configs = PluginConfigStore::new(config.plugins.resolved_config_dir(), codec.clone());
        let workflows = WorkflowManager::open(config.plugins.resolved_workflow_dir(), codec)?;

        info!(
            plugin_dir = %config.plugins.plugin_dir.display(),
            encrypted = config.plugins.encrypt_at_rest,
            max_workers = config.workers.max_workers,
            "Plugin system ready"
        );

        Ok(PluginSystem {
            loader: PluginLoader::new(source, security),
            approver,
            resolver: RwLock::new(DependencyResolver::new()),
            store: PluginStore::new(),
            workers: Mutex::new(HashMap::new()),
            workflow_pool: WorkerPool::from_config(&config.workers),
            permissions,
            configs,
            workflows,
            events,
            config,
        })
    }
}

pub struct PluginSystem {
    config: RuntimeConfig,
    events: Arc<EventBus>,
    loader: PluginLoader,
    approver: Arc<dyn PermissionApprover>,
    permissions: PermissionManager,
    resolver: RwLock<DependencyResolver>,
    store: PluginStore,
    configs: PluginConfigStore,
    workflows: WorkflowManager,
    /// One pool per plugin, created on first parallel run
    workers: Mutex<HashMap<String, Arc<WorkerPool>>>,
    workflow_pool: WorkerPool,
}

impl PluginSystem {
    pub fn builder() -> PluginSystemBuilder {
        PluginSystemBuilder::new()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn permissions(&self) -> &PermissionManager {
        &self.permissions
    }

    pub fn workflows(&self) -> &WorkflowManager {
        &self.workflows
    }

    fn publish(&self, event_type: &str, payload: Value) {
        self.events.publish(Event::new(event_type, payload));
    }

    fn entry(&self, name: &str) -> PluginResult<PluginEntry> {
        self.store
            .get(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    /// Record a failing hook: move to `Error` and publish `plugin.error`
    fn fail(&self, name: &str, action: &str, cause: anyhow::Error) {
        let reason = format!("{cause:#}");
        error!(plugin = %name, action, error = %reason, "Plugin hook failed");
        self.store.mark_error(name, reason.clone());
        self.publish(
            names::PLUGIN_ERROR,
            json!({ "plugin": name, "action": action, "error": reason }),
        );
    }

    /// Record a refused operation without leaving the current state
    fn refuse(&self, name: &str, transition: Transition, cause: PluginError) {
        let reason = cause.to_string();
        self.store.update(name, |entry| entry.last_error = Some(reason.clone()));
        self.publish(
            names::PLUGIN_ERROR,
            json!({
                "plugin": name,
                "action": transition.as_str(),
                "code": cause.code(),
                "error": reason,
            }),
        );
    }

    /// Stored config with the plugin's schema defaults applied
    fn effective_config(&self, name: &str, plugin: &dyn Plugin) -> PluginResult<ConfigMap> {
        Ok(plugin
            .config_schema()
            .with_defaults(&self.configs.get_config(name)?))
    }

    /// Plugin identifiers the source can offer
    pub fn scan(&self) -> PluginResult<Vec<String>> {
        self.loader.scan()
    }

    /// Load and initialize `name`; a no-op when it is already registered
    pub async fn load(&self, name: &str) -> PluginResult<()> {
        if self.store.contains(name) {
            debug!(plugin = %name, "Plugin already registered");
            return Ok(());
        }

        let handle = match self.loader.load(name, false) {
            Ok(handle) => handle,
            Err(e) => {
                error!(plugin = %name, error = %e, "Plugin failed to load");
                self.store.record_failure(name, e.to_string());
                self.publish(
                    names::PLUGIN_ERROR,
                    json!({ "plugin": name, "action": "load", "error": e.to_string() }),
                );
                return Err(e);
            }
        };
        self.install(handle).await
    }

    /// Register `handle` (replacing any previous entry) and run `initialize`
    async fn install(&self, handle: LoadedPlugin) -> PluginResult<()> {
        let name = handle.name().to_string();
        let instance = handle.instance.clone();
        let version = handle.version.clone();
        let context = PluginContext {
            name: name.clone(),
            events: EventEmitter::new(self.events.clone(), name.clone()),
            config: self.effective_config(&name, instance.as_ref())?,
        };

        self.resolver
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(&name, version.clone(), handle.dependencies.clone());
        self.store.insert(handle);

        if let Err(e) = instance.initialize(context).await {
            let reason = format!("initialize failed: {e:#}");
            self.fail(&name, Transition::Load.as_str(), e);
            return Err(PluginError::load(&name, reason));
        }

        info!(plugin = %name, version = %version, "Plugin loaded");
        self.publish(
            names::PLUGIN_LOADED,
            json!({ "plugin": name, "version": version.to_string() }),
        );
        Ok(())
    }

    /// Stop, deactivate and clean up an instance. Hook failures are logged.
    async fn teardown(&self, name: &str, entry: &PluginEntry) {
        let pool = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if let Some(pool) = pool {
            pool.cancel().await;
        }

        let instance = &entry.handle.instance;
        if entry.state == LifecycleState::Running {
            if let Err(e) = instance.stop().await {
                warn!(plugin = %name, error = %format!("{e:#}"), "Stop hook failed during teardown");
            }
        }
        if entry.state.is_active() {
            if let Err(e) = instance.deactivate().await {
                warn!(plugin = %name, error = %format!("{e:#}"), "Deactivate hook failed during teardown");
            }
        }
        if let Err(e) = instance.cleanup().await {
            warn!(plugin = %name, error = %format!("{e:#}"), "Cleanup hook failed");
        }
    }

    /// Walk `name` down to `Unloaded` and remove it from every table.
    ///
    /// A running plugin is stopped and an active one deactivated first, each
    /// publishing its own event. Returns `false` when nothing was registered
    /// under that name.
    pub async fn unload(&self, name: &str) -> PluginResult<bool> {
        let Some(entry) = self.store.get(name) else {
            self.store.remove(name);
            self.loader.unload(name);
            return Ok(false);
        };

        if entry.state == LifecycleState::Running {
            self.stop(name).await?;
        }
        if self.store.state(name).is_active() {
            self.deactivate(name).await?;
        }
        let entry = self.entry(name)?;
        entry.state.advance(name, Transition::Unload)?;

        self.teardown(name, &entry).await;
        self.loader.unload(name);
        let dependents = {
            let mut resolver = self.resolver.write().unwrap_or_else(PoisonError::into_inner);
            let dependents = resolver.dependents_of(name);
            resolver.remove(name);
            dependents
        };
        self.store.remove(name);

        if dependents.is_empty() {
            info!(plugin = %name, from = %entry.state, "Plugin unloaded");
        } else {
            warn!(plugin = %name, dependents = ?dependents, "Plugin unloaded while others still depend on it");
        }
        self.publish(
            names::PLUGIN_UNLOADED,
            json!({ "plugin": name, "dependents": dependents }),
        );
        Ok(true)
    }

    /// Capture config and plugin state for a later [`restore`](Self::restore)
    pub fn snapshot(&self, name: &str) -> PluginResult<PluginSnapshot> {
        let entry = self.entry(name)?;
        let state = entry.handle.instance.save_state().unwrap_or_else(|e| {
            warn!(plugin = %name, error = %format!("{e:#}"), "save_state failed, snapshot carries no state");
            Value::Null
        });
        Ok(PluginSnapshot {
            plugin: name.to_string(),
            version: entry.handle.version.to_string(),
            config: self.configs.get_config(name)?,
            state,
            saved_at: Utc::now(),
        })
    }

    /// Apply a snapshot to the current instance.
    ///
    /// Returns `false` when the plugin rejects its state; the snapshot's
    /// config is then discarded along with the stored config.
    pub fn restore(&self, name: &str, snapshot: &PluginSnapshot) -> PluginResult<bool> {
        let entry = self.entry(name)?;
        match entry.handle.instance.restore_state(&snapshot.state) {
            Ok(()) => {
                self.configs.save_config(name, snapshot.config.clone())?;
                debug!(plugin = %name, "Plugin state restored");
                Ok(true)
            }
            Err(e) => {
                warn!(plugin = %name, error = %format!("{e:#}"), "State restore failed, continuing without previous configuration");
                self.configs.remove_config(name)?;
                Ok(false)
            }
        }
    }

    /// Snapshot, replace the instance, then restore.
    ///
    /// The new module is resolved before the old instance is torn down, so a
    /// failed reload leaves the current plugin registered and untouched. A
    /// plugin that was active is activated again after a successful restore.
    pub async fn reload(&self, name: &str) -> PluginResult<LifecycleState> {
        let previous = self.entry(name)?;
        let snapshot = self.snapshot(name)?;

        let handle = self.loader.load(name, true)?;
        self.teardown(name, &previous).await;
        self.install(handle).await?;

        let restored = self.restore(name, &snapshot)?;
        if restored && previous.state.is_active() {
            self.activate(name).await?;
        }

        let state = self.store.state(name);
        let version = self
            .store
            .get(name)
            .map(|e| e.handle.version.to_string())
            .unwrap_or_default();
        info!(plugin = %name, restored, state = %state, "Plugin reloaded");
        self.publish(
            names::PLUGIN_RELOADED,
            json!({ "plugin": name, "version": version, "restored": restored, "state": state }),
        );
        Ok(state)
    }

    /// Check `name`'s declared dependencies against the registered plugins
    pub fn check_dependencies(&self, name: &str) -> PluginResult<DependencyReport> {
        if !self.store.contains(name) {
            return Err(PluginError::NotFound(name.to_string()));
        }
        let report = self
            .resolver
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .check_registered(name);

        self.publish(names::DEPENDENCY_CHECKED, serde_json::to_value(&report)?);
        for conflict in &report.conflicts {
            warn!(
                plugin = %name,
                dependency = %conflict.dependency,
                required = %conflict.required,
                found = %conflict.found,
                "Dependency version conflict"
            );
            self.publish(
                names::DEPENDENCY_CONFLICT,
                json!({
                    "plugin": name,
                    "dependency": conflict.dependency,
                    "required": conflict.required,
                    "found": conflict.found,
                    "optional": conflict.optional,
                }),
            );
        }
        Ok(report)
    }

    /// Move `name` to `Active`.
    ///
    /// Unmet required dependencies refuse activation. Each missing required
    /// permission is put to the approver; a single denial refuses activation.
    /// Refusals leave the state unchanged. A failing `activate` hook moves the
    /// plugin to `Error`.
    pub async fn activate(&self, name: &str) -> PluginResult<bool> {
        let entry = self.entry(name)?;
        if entry.state.is_active() {
            return Ok(true);
        }
        entry.state.advance(name, Transition::Activate)?;

        let report = self.check_dependencies(name)?;
        if !report.is_satisfied() {
            warn!(
                plugin = %name,
                missing = ?report.missing_required,
                conflicts = report.conflicts.len(),
                "Activation refused: dependencies not satisfied"
            );
            return Ok(false);
        }

        let instance = entry.handle.instance.clone();
        let required = instance.required_permissions();
        for permission in self.permissions.missing(name, &required) {
            if !self.request_permission(name, permission).await? {
                warn!(plugin = %name, permission = %permission, "Activation refused: permission not granted");
                break;
            }
        }
        let missing = self.permissions.missing(name, &required);
        if !missing.is_empty() {
            self.refuse(
                name,
                Transition::Activate,
                PluginError::Permission {
                    plugin: name.to_string(),
                    missing: missing.into_iter().collect(),
                },
            );
            return Ok(false);
        }

        let granted = self.permissions.granted(name);
        if let Err(e) = instance.activate(&granted).await {
            self.fail(name, Transition::Activate.as_str(), e);
            return Ok(false);
        }

        self.store.update(name, |entry| {
            entry.state = LifecycleState::Active;
            entry.active_permissions = granted.clone();
            entry.last_error = None;
        });
        info!(plugin = %name, permissions = granted.len(), "Plugin activated");
        self.publish(
            names::PLUGIN_ACTIVATED,
            json!({ "plugin": name, "permissions": granted }),
        );
        Ok(true)
    }

    /// Move `name` from `Active` (or `Running`, stopping it first) to `Inactive`
    pub async fn deactivate(&self, name: &str) -> PluginResult<bool> {
        let entry = self.entry(name)?;
        if entry.state == LifecycleState::Running && !self.stop(name).await? {
            return Ok(false);
        }
        self.store
            .state(name)
            .advance(name, Transition::Deactivate)?;

        if let Err(e) = entry.handle.instance.deactivate().await {
            self.fail(name, Transition::Deactivate.as_str(), e);
            return Ok(false);
        }

        self.store.set_state(name, LifecycleState::Inactive);
        info!(plugin = %name, "Plugin deactivated");
        self.publish(names::PLUGIN_DEACTIVATED, json!({ "plugin": name }));
        Ok(true)
    }

    /// Move `name` from `Active` to `Running`
    pub async fn start(&self, name: &str) -> PluginResult<bool> {
        let entry = self.entry(name)?;
        if entry.state == LifecycleState::Running {
            return Ok(true);
        }
        entry.state.advance(name, Transition::Start)?;

        if let Err(e) = entry.handle.instance.start().await {
            self.fail(name, Transition::Start.as_str(), e);
            return Ok(false);
        }

        self.store.set_state(name, LifecycleState::Running);
        info!(plugin = %name, "Plugin started");
        self.publish(names::PLUGIN_STARTED, json!({ "plugin": name }));
        Ok(true)
    }

    /// Move `name` from `Running` back to `Active`, cancelling in-flight
    /// processing first. Idempotent when already `Active`.
    pub async fn stop(&self, name: &str) -> PluginResult<bool> {
        let entry = self.entry(name)?;
        entry.state.advance(name, Transition::Stop)?;
        if entry.state == LifecycleState::Active {
            return Ok(true);
        }

        let cancelled = self.cancel_processing(name).await?;
        if let Err(e) = entry.handle.instance.stop().await {
            self.fail(name, Transition::Stop.as_str(), e);
            return Ok(false);
        }

        self.store.set_state(name, LifecycleState::Active);
        info!(plugin = %name, forced_reset = cancelled.forced_reset, "Plugin stopped");
        self.publish(
            names::PLUGIN_STOPPED,
            json!({ "plugin": name, "cancelled": cancelled }),
        );
        Ok(true)
    }

    /// Resolve the instance and merged parameters for a processing call.
    ///
    /// Call-supplied parameters win over the stored config.
    fn prepare(&self, name: &str, params: ConfigMap) -> PluginResult<(Arc<dyn Plugin>, ConfigMap)> {
        let entry = self.entry(name)?;
        if !entry.state.is_active() {
            return Err(PluginError::InvalidTransition {
                plugin: name.to_string(),
                state: entry.state,
                action: "process data",
            });
        }

        let instance = entry.handle.instance.clone();
        let mut merged = self.effective_config(name, instance.as_ref())?;
        merged.extend(params);
        instance
            .validate_parameters(&merged)
            .map_err(|reason| PluginError::config(name, reason))?;
        Ok((instance, merged))
    }

    /// Run `name` over `data`
    pub async fn process_data(
        &self,
        name: &str,
        data: &DataContext,
        params: ConfigMap,
    ) -> PluginResult<Value> {
        let (instance, params) = self.prepare(name, params)?;

        let result = match instance.process_data(data, &params).await {
            Ok(result) => result,
            Err(e) => {
                let reason = format!("{e:#}");
                error!(plugin = %name, error = %reason, "Plugin processing failed");
                self.publish(
                    names::PLUGIN_ERROR,
                    json!({ "plugin": name, "action": "process_data", "error": reason }),
                );
                return Err(PluginError::Runtime {
                    plugin: name.to_string(),
                    reason,
                });
            }
        };

        debug!(plugin = %name, rows = data.row_count(), "Data processed");
        self.publish(
            names::DATA_PROCESSED,
            json!({
                "plugin": name,
                "rows": data.row_count(),
                "params": params,
                "result": result,
            }),
        );
        Ok(result)
    }

    fn pool_for(&self, name: &str) -> Arc<WorkerPool> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(WorkerPool::from_config(&self.config.workers)))
            .clone()
    }

    /// Split `data` into `partitions` slices and process them on `name`'s
    /// worker pool. Outcomes are in partition order.
    ///
    /// Fails with [`PluginError::Cancelled`] when the batch was cancelled
    /// through [`cancel_processing`](Self::cancel_processing) or `stop`.
    pub async fn process_data_parallel(
        &self,
        name: &str,
        data: &DataContext,
        partitions: usize,
        params: ConfigMap,
    ) -> PluginResult<BatchOutcome> {
        let (instance, params) = self.prepare(name, params)?;
        let params = Arc::new(params);

        let units: Vec<WorkUnit> = data
            .partitions(partitions)
            .into_iter()
            .map(|slice| {
                let instance = instance.clone();
                let params = params.clone();
                Box::pin(async move { instance.process_data(&slice, &params).await }) as WorkUnit
            })
            .collect();
        let total = units.len();

        let batch = self.pool_for(name).run(units).await;
        if batch.cancelled {
            info!(plugin = %name, completed = batch.completed(), total, "Parallel processing cancelled");
            return Err(PluginError::Cancelled(name.to_string()));
        }

        debug!(plugin = %name, partitions = total, completed = batch.completed(), "Parallel processing finished");
        self.publish(
            names::DATA_PROCESSED,
            json!({
                "plugin": name,
                "rows": data.row_count(),
                "partitions": total,
                "completed": batch.completed(),
                "params": *params,
            }),
        );
        Ok(batch)
    }

    /// Cooperatively cancel `name`'s in-flight parallel work.
    ///
    /// Best-effort: work blocked outside an `.await` keeps running until it
    /// returns, even after a forced reset.
    pub async fn cancel_processing(&self, name: &str) -> PluginResult<CancelReport> {
        if !self.store.contains(name) {
            return Err(PluginError::NotFound(name.to_string()));
        }
        let pool = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        match pool {
            Some(pool) => Ok(pool.cancel().await),
            None => Ok(CancelReport::default()),
        }
    }

    /// `Unloaded` when unknown; `Error` when the last load attempt failed
    pub fn get_plugin_state(&self, name: &str) -> LifecycleState {
        self.store.state(name)
    }

    /// Merge `updates` into the stored config after schema validation
    pub fn set_plugin_config(&self, name: &str, updates: ConfigMap) -> PluginResult<ConfigMap> {
        let entry = self.entry(name)?;
        let schema = entry.handle.instance.config_schema();

        let mut candidate = self.configs.get_config(name)?;
        candidate.extend(updates.clone());
        schema
            .validate(&schema.with_defaults(&candidate))
            .map_err(|reason| PluginError::config(name, reason))?;

        let stored = self.configs.update_config(name, updates)?;
        self.publish(
            names::PLUGIN_CONFIG_CHANGED,
            json!({ "plugin": name, "config": stored }),
        );
        Ok(stored)
    }

    /// Effective config: schema defaults under the stored values
    pub fn get_plugin_config(&self, name: &str) -> PluginResult<ConfigMap> {
        match self.store.get(name) {
            Some(entry) => self.effective_config(name, entry.handle.instance.as_ref()),
            None => self.configs.get_config(name),
        }
    }

    /// Ask the approver for `permission` unless already granted.
    ///
    /// Refused without prompting when the plugin declares it neither
    /// required nor optional.
    pub async fn request_permission(&self, name: &str, permission: Permission) -> PluginResult<bool> {
        let entry = self.entry(name)?;
        let instance = &entry.handle.instance;
        let declared = instance.required_permissions().contains(&permission)
            || instance.optional_permissions().contains(&permission);

        let already = self.permissions.has_permission(name, permission);
        let granted = self
            .permissions
            .request(name, permission, declared, self.approver.as_ref())
            .await?;
        if granted && !already {
            self.publish(
                names::PERMISSION_GRANTED,
                json!({ "plugin": name, "permission": permission }),
            );
        }
        Ok(granted)
    }

    /// Grant without prompting (host-side decision)
    pub fn grant_permission(&self, name: &str, permission: Permission) -> PluginResult<bool> {
        let added = self.permissions.grant(name, permission)?;
        if added {
            self.publish(
                names::PERMISSION_GRANTED,
                json!({ "plugin": name, "permission": permission }),
            );
        }
        Ok(added)
    }

    /// Revoke a grant. An active plugin losing a required permission is
    /// deactivated.
    pub async fn revoke_permission(&self, name: &str, permission: Permission) -> PluginResult<bool> {
        let removed = self.permissions.revoke(name, permission)?;
        if removed {
            self.publish(
                names::PERMISSION_REVOKED,
                json!({ "plugin": name, "permission": permission }),
            );
        }

        if let Some(entry) = self.store.get(name) {
            if entry.state.is_active()
                && entry.handle.instance.required_permissions().contains(&permission)
            {
                warn!(plugin = %name, permission = %permission, "Required permission revoked, deactivating");
                self.deactivate(name).await?;
            }
        }
        Ok(removed)
    }

    pub fn granted_permissions(&self, name: &str) -> BTreeSet<Permission> {
        self.permissions.granted(name)
    }

    /// Required permissions not yet granted
    pub fn missing_permissions(&self, name: &str) -> PluginResult<BTreeSet<Permission>> {
        let entry = self.entry(name)?;
        Ok(self
            .permissions
            .missing(name, &entry.handle.instance.required_permissions()))
    }

    /// Scan, order by dependencies and load everything.
    ///
    /// Individual failures are recorded and skipped. Plugins on a required
    /// dependency cycle are marked `Error` and published as
    /// `dependency.cycle`, as is every plugin that requires a cycle member
    /// directly or transitively; the rest still load.
    pub async fn load_all(&self) -> PluginResult<LoadSummary> {
        let ids = self.scan()?;
        let mut summary = LoadSummary::default();
        let mut graph = DependencyResolver::new();
        let mut candidates = Vec::with_capacity(ids.len());

        // Resolve through the loader so the graph sees the same dependencies
        // (manifest or code-declared) the registry will.
        for id in &ids {
            match self.loader.load(id, false) {
                Ok(handle) => {
                    graph.register(id, handle.version.clone(), handle.dependencies.clone());
                    candidates.push(id.clone());
                }
                Err(e) => {
                    warn!(plugin = %id, error = %e, "Skipping plugin that failed to resolve");
                    self.store.record_failure(id, e.to_string());
                    self.publish(
                        names::PLUGIN_ERROR,
                        json!({ "plugin": id, "action": "load", "error": e.to_string() }),
                    );
                    summary.failed.insert(id.clone(), e.to_string());
                }
            }
        }

        let plan = graph.plan_load(&candidates);
        for cycle in &plan.cycles {
            let reason = PluginError::CircularDependency {
                cycle: cycle.clone(),
            }
            .to_string();
            self.publish(names::DEPENDENCY_CYCLE, json!({ "cycle": cycle }));
            for name in cycle {
                if self.store.contains(name) {
                    self.store.mark_error(name, reason.clone());
                } else {
                    self.store.record_failure(name, reason.clone());
                }
                summary.failed.insert(name.clone(), reason.clone());
            }
        }
        for (name, &index) in &plan.downstream {
            let reason = PluginError::CircularDependency {
                cycle: plan.cycles[index].clone(),
            }
            .to_string();
            if self.store.contains(name) {
                self.store.mark_error(name, reason.clone());
            } else {
                self.store.record_failure(name, reason.clone());
            }
            summary.failed.insert(name.clone(), reason);
        }
        for name in plan.blocked() {
            if !self.store.contains(&name) {
                self.loader.unload(&name);
            }
        }

        for name in plan.order {
            if summary.failed.contains_key(&name) {
                continue;
            }
            match self.load(&name).await {
                Ok(()) => summary.loaded.push(name),
                Err(e) => {
                    summary.failed.insert(name, e.to_string());
                }
            }
        }
        summary.cycles = plan.cycles;

        info!(
            loaded = summary.loaded.len(),
            failed = summary.failed.len(),
            cycles = summary.cycles.len(),
            "Batch load finished"
        );
        Ok(summary)
    }

    /// Dependency-first order over `names`
    pub fn load_order(&self, names: &[String]) -> PluginResult<Vec<String>> {
        self.resolver
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .load_order(names)
    }

    pub fn get_plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.store.get(name).map(|e| e.handle.instance)
    }

    pub fn get_plugin_info(&self, name: &str) -> Option<PluginInfo> {
        self.store.get(name).map(|e| self.info(e))
    }

    /// Every registered plugin, sorted by name
    pub fn get_all_plugins(&self) -> Vec<PluginInfo> {
        self.store
            .entries()
            .into_iter()
            .map(|e| self.info(e))
            .collect()
    }

    fn info(&self, entry: PluginEntry) -> PluginInfo {
        let instance = &entry.handle.instance;
        let name = entry.handle.name().to_string();
        PluginInfo {
            version: entry.handle.version.to_string(),
            description: instance.description().to_string(),
            state: entry.state,
            required_permissions: instance.required_permissions(),
            optional_permissions: instance.optional_permissions(),
            granted_permissions: self.permissions.granted(&name),
            dependencies: entry.handle.dependencies.iter().map(|d| d.to_string()).collect(),
            last_error: entry.last_error.clone(),
            loaded_at: entry.handle.loaded_at,
            name,
        }
    }

    /// Plugins that failed to load and never entered the registry, with the reason
    pub fn failed_plugins(&self) -> BTreeMap<String, String> {
        self.store.failures()
    }

    /// `Active` or `Running`
    pub fn is_plugin_active(&self, name: &str) -> bool {
        self.store.state(name).is_active()
    }

    pub fn is_plugin_running(&self, name: &str) -> bool {
        self.store.state(name) == LifecycleState::Running
    }

    /// Run a stored workflow and publish `workflow.completed`
    pub async fn execute_workflow(&self, id: &str, input: DataContext) -> PluginResult<WorkflowRun> {
        let definition = self
            .workflows
            .get(id)
            .ok_or_else(|| PluginError::workflow(id, "does not exist"))?;

        let run = workflow::execute(&definition, self, &self.workflow_pool, input).await?;
        let statuses: BTreeMap<&str, _> = run
            .results
            .iter()
            .map(|(node, result)| (node.as_str(), result.status))
            .collect();
        self.publish(
            names::WORKFLOW_COMPLETED,
            json!({ "workflow": id, "status": run.status(), "nodes": statuses }),
        );
        Ok(run)
    }

    /// Cancel in-flight parallel workflow nodes
    pub async fn cancel_workflows(&self) -> CancelReport {
        self.workflow_pool.cancel().await
    }

    /// Unload every plugin, dependents before their dependencies
    pub async fn shutdown(&self) {
        let names = self.store.names();
        let mut order = self.load_order(&names).unwrap_or(names);
        order.reverse();

        self.workflow_pool.cancel().await;
        for name in order {
            if let Err(e) = self.unload(&name).await {
                error!(plugin = %name, error = %e, "Unload failed during shutdown");
            }
        }
        info!("Plugin system shut down");
    }
}

#[async_trait]
impl NodeRunner for PluginSystem {
    async fn run_node(&self, plugin: &str, data: &DataContext, params: &ConfigMap) -> PluginResult<Value> {
        self.process_data(plugin, data, params.clone()).await
    }

    fn bind_node(&self, plugin: &str, data: DataContext, params: ConfigMap) -> PluginResult<WorkUnit> {
        let (instance, params) = self.prepare(plugin, params)?;
        let events = self.events.clone();
        let name = plugin.to_string();
        Ok(Box::pin(async move {
            let result = instance.process_data(&data, &params).await?;
            events.publish(Event::new(
                names::DATA_PROCESSED,
                json!({
                    "plugin": name,
                    "rows": data.row_count(),
                    "params": params,
                    "result": result,
                }),
            ));
            Ok(result)
        }))
    }
}
