//! Workflows: chains of plugin invocations
//!
//! A workflow is a set of nodes, each naming a plugin and its parameters.
//! Three kinds are supported:
//! - `sequential` follows `next_nodes[0]` from the entry node, feeding each
//!   output into the next node
//! - `parallel` runs every node on the same input on the worker pool
//! - `conditional` evaluates the entry node's condition against the input and
//!   runs `next_nodes[0]` when it holds, `next_nodes[1]` otherwise
//!
//! Definitions persist one file per workflow: `<id>.json` in plain form or
//! `<id>.bin` through the at-rest cipher.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tabula_core::security::Encryption;
use tracing::{debug, info, warn};

use crate::plugin::{ConfigMap, DataContext};
use crate::worker::{UnitOutcome, WorkUnit, WorkerPool};
use crate::{PluginError, PluginResult};

/// Parameter carrying the previous node's output when it is not a table
pub const UPSTREAM_PARAM: &str = "upstream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Sequential,
    Parallel,
    Conditional,
}

/// JSON-pointer equality test against the workflow input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub pointer: String,
    pub equals: Value,
}

impl Condition {
    pub fn new(pointer: impl Into<String>, equals: Value) -> Self {
        Self {
            pointer: pointer.into(),
            equals,
        }
    }

    pub fn evaluate(&self, data: &Value) -> bool {
        data.pointer(&self.pointer) == Some(&self.equals)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    pub name: String,
    pub plugin_name: String,
    #[serde(default)]
    pub parameters: ConfigMap,
    #[serde(default)]
    pub next_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, plugin_name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            plugin_name: plugin_name.into(),
            parameters: ConfigMap::new(),
            next_nodes: Vec::new(),
            condition: None,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next_nodes.push(next.into());
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: WorkflowKind,
    #[serde(default)]
    pub nodes: BTreeMap<String, WorkflowNode>,
    #[serde(default)]
    pub entry_node: Option<String>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: WorkflowKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            kind,
            nodes: BTreeMap::new(),
            entry_node: None,
        }
    }

    /// Add a node; the first node added becomes the entry
    pub fn with_node(mut self, node: WorkflowNode) -> Self {
        self.add_node(node);
        self
    }

    pub fn add_node(&mut self, node: WorkflowNode) {
        if self.entry_node.is_none() {
            self.entry_node = Some(node.id.clone());
        }
        self.nodes.insert(node.id.clone(), node);
    }

    /// Check that the entry and every edge point at existing nodes
    pub fn validate(&self) -> PluginResult<()> {
        if let Some(entry) = &self.entry_node {
            if !self.nodes.contains_key(entry) {
                return Err(PluginError::workflow(
                    &self.id,
                    format!("entry node '{entry}' does not exist"),
                ));
            }
        }
        for node in self.nodes.values() {
            if let Some(missing) = node.next_nodes.iter().find(|n| !self.nodes.contains_key(*n)) {
                return Err(PluginError::workflow(
                    &self.id,
                    format!("node '{}' points at unknown node '{missing}'", node.id),
                ));
            }
        }
        Ok(())
    }

    fn node(&self, id: &str) -> PluginResult<&WorkflowNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| PluginError::workflow(&self.id, format!("unknown node '{id}'")))
    }

    /// Decode a stored definition; `nodes` may be a list or a map keyed by id
    fn from_value(mut value: Value) -> PluginResult<Self> {
        let keyed = match value.get_mut("nodes") {
            Some(Value::Array(list)) => Some(
                list.drain(..)
                    .filter_map(|node| {
                        let id = node.get("id")?.as_str()?.to_string();
                        Some((id, node))
                    })
                    .collect::<serde_json::Map<String, Value>>(),
            ),
            _ => None,
        };
        if let Some(nodes) = keyed {
            value["nodes"] = Value::Object(nodes);
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeResult {
    pub node_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl NodeResult {
    fn pending(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: ExecutionStatus::Pending,
            result: None,
            error: None,
            elapsed_ms: 0,
        }
    }

    fn complete(&mut self, result: Value, elapsed_ms: u64) {
        self.status = ExecutionStatus::Completed;
        self.result = Some(result);
        self.elapsed_ms = elapsed_ms;
    }

    fn fail(&mut self, error: String, elapsed_ms: u64) {
        self.status = ExecutionStatus::Failed;
        self.error = Some(error);
        self.elapsed_ms = elapsed_ms;
    }
}

/// Outcome of one workflow execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowRun {
    pub workflow_id: String,
    pub started_at: DateTime<Utc>,
    pub results: BTreeMap<String, NodeResult>,
    /// Final value: last node for sequential, all nodes for parallel, the chosen branch for conditional
    pub output: Option<Value>,
}

impl WorkflowRun {
    fn new(workflow: &Workflow) -> Self {
        Self {
            workflow_id: workflow.id.clone(),
            started_at: Utc::now(),
            results: workflow
                .nodes
                .keys()
                .map(|id| (id.clone(), NodeResult::pending(id)))
                .collect(),
            output: None,
        }
    }

    /// Overall status: failed if any node failed, cancelled if any was cancelled
    pub fn status(&self) -> ExecutionStatus {
        let statuses: BTreeSet<ExecutionStatus> =
            self.results.values().map(|r| r.status).collect();
        if statuses.contains(&ExecutionStatus::Failed) {
            ExecutionStatus::Failed
        } else if statuses.contains(&ExecutionStatus::Cancelled) {
            ExecutionStatus::Cancelled
        } else {
            ExecutionStatus::Completed
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status() == ExecutionStatus::Completed
    }

    fn entry(&mut self, node_id: &str) -> &mut NodeResult {
        self.results
            .entry(node_id.to_string())
            .or_insert_with(|| NodeResult::pending(node_id))
    }

    fn cancel_pending(&mut self) {
        for result in self.results.values_mut() {
            if result.status == ExecutionStatus::Pending {
                result.status = ExecutionStatus::Cancelled;
            }
        }
    }
}

/// Executes single plugin invocations on behalf of a workflow
#[async_trait]
pub trait NodeRunner: Send + Sync {
    async fn run_node(&self, plugin: &str, data: &DataContext, params: &ConfigMap) -> PluginResult<Value>;

    /// Check preconditions now and return the invocation as a detached unit
    fn bind_node(&self, plugin: &str, data: DataContext, params: ConfigMap) -> PluginResult<WorkUnit>;
}

/// Run `workflow` on `input`
pub async fn execute(
    workflow: &Workflow,
    runner: &dyn NodeRunner,
    pool: &WorkerPool,
    input: DataContext,
) -> PluginResult<WorkflowRun> {
    workflow.validate()?;
    let run = match workflow.kind {
        WorkflowKind::Sequential => run_sequential(workflow, runner, input).await?,
        WorkflowKind::Parallel => run_parallel(workflow, runner, pool, input).await,
        WorkflowKind::Conditional => run_conditional(workflow, runner, input).await?,
    };
    info!(
        workflow = %workflow.id,
        status = ?run.status(),
        nodes = run.results.len(),
        "Workflow finished"
    );
    Ok(run)
}

async fn run_sequential(
    workflow: &Workflow,
    runner: &dyn NodeRunner,
    input: DataContext,
) -> PluginResult<WorkflowRun> {
    let mut run = WorkflowRun::new(workflow);
    let mut visited = BTreeSet::new();
    let mut current = workflow.entry_node.clone();
    let mut data = input;
    let mut upstream: Option<Value> = None;

    while let Some(node_id) = current {
        if !visited.insert(node_id.clone()) {
            return Err(PluginError::workflow(
                &workflow.id,
                format!("sequential chain revisits node '{node_id}'"),
            ));
        }
        let node = workflow.node(&node_id)?;
        let mut params = node.parameters.clone();
        if let Some(previous) = upstream.take() {
            params.insert(UPSTREAM_PARAM.to_string(), previous);
        }

        run.entry(&node_id).status = ExecutionStatus::Running;
        let started = Instant::now();
        match runner.run_node(&node.plugin_name, &data, &params).await {
            Ok(output) => {
                run.entry(&node_id).complete(output.clone(), elapsed_ms(started));
                match serde_json::from_value::<DataContext>(output.clone()) {
                    Ok(table) => data = table,
                    Err(_) => upstream = Some(output.clone()),
                }
                run.output = Some(output);
            }
            Err(e) => {
                warn!(workflow = %workflow.id, node = %node_id, error = %e, "Workflow node failed");
                run.entry(&node_id).fail(e.to_string(), elapsed_ms(started));
                run.output = None;
                run.cancel_pending();
                return Ok(run);
            }
        }
        current = node.next_nodes.first().cloned();
    }

    Ok(run)
}

async fn run_parallel(
    workflow: &Workflow,
    runner: &dyn NodeRunner,
    pool: &WorkerPool,
    input: DataContext,
) -> WorkflowRun {
    let mut run = WorkflowRun::new(workflow);
    let timings = Arc::new(Mutex::new(BTreeMap::<String, u64>::new()));
    let mut scheduled = Vec::new();
    let mut units = Vec::new();

    for (node_id, node) in &workflow.nodes {
        match runner.bind_node(&node.plugin_name, input.clone(), node.parameters.clone()) {
            Ok(unit) => {
                let timings = timings.clone();
                let id = node_id.clone();
                units.push(Box::pin(async move {
                    let started = Instant::now();
                    let result = unit.await;
                    timings
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(id, elapsed_ms(started));
                    result
                }) as WorkUnit);
                run.entry(node_id).status = ExecutionStatus::Running;
                scheduled.push(node_id.clone());
            }
            Err(e) => {
                warn!(workflow = %workflow.id, node = %node_id, error = %e, "Workflow node not scheduled");
                run.entry(node_id).fail(e.to_string(), 0);
            }
        }
    }

    let batch = pool.run(units).await;
    let timings = timings.lock().unwrap_or_else(PoisonError::into_inner).clone();
    let mut outputs = serde_json::Map::new();

    for (node_id, outcome) in scheduled.iter().zip(batch.outcomes) {
        let elapsed = timings.get(node_id).copied().unwrap_or(0);
        let result = run.entry(node_id);
        match outcome {
            UnitOutcome::Completed(value) => {
                outputs.insert(node_id.clone(), value.clone());
                result.complete(value, elapsed);
            }
            UnitOutcome::Failed(error) => result.fail(error, elapsed),
            UnitOutcome::Discarded | UnitOutcome::Aborted => {
                result.status = ExecutionStatus::Cancelled;
                result.elapsed_ms = elapsed;
            }
        }
    }

    run.output = Some(Value::Object(outputs));
    run
}

async fn run_conditional(
    workflow: &Workflow,
    runner: &dyn NodeRunner,
    input: DataContext,
) -> PluginResult<WorkflowRun> {
    let mut run = WorkflowRun::new(workflow);
    let Some(entry_id) = &workflow.entry_node else {
        return Ok(run);
    };
    let entry = workflow.node(entry_id)?;

    let holds = match &entry.condition {
        Some(condition) => condition.evaluate(&serde_json::to_value(&input)?),
        None => true,
    };
    let branch = entry.next_nodes.get(if holds { 0 } else { 1 }).cloned();
    debug!(workflow = %workflow.id, holds, branch = ?branch, "Condition evaluated");
    run.entry(entry_id)
        .complete(json!({ "condition": holds, "branch": branch }), 0);

    let Some(branch_id) = branch else {
        run.output = Some(serde_json::to_value(&input)?);
        return Ok(run);
    };
    let node = workflow.node(&branch_id)?;

    run.entry(&branch_id).status = ExecutionStatus::Running;
    let started = Instant::now();
    match runner.run_node(&node.plugin_name, &input, &node.parameters).await {
        Ok(output) => {
            run.entry(&branch_id).complete(output.clone(), elapsed_ms(started));
            run.output = Some(output);
        }
        Err(e) => {
            warn!(workflow = %workflow.id, node = %branch_id, error = %e, "Workflow branch failed");
            run.entry(&branch_id).fail(e.to_string(), elapsed_ms(started));
        }
    }
    Ok(run)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Workflow definitions stored under one directory
pub struct WorkflowManager {
    dir: PathBuf,
    codec: Arc<dyn Encryption>,
    workflows: RwLock<BTreeMap<String, Workflow>>,
}

impl WorkflowManager {
    /// Open `dir`, creating it if needed, and load every readable definition.
    ///
    /// Files that fail to decode are logged and skipped.
    pub fn open(dir: impl Into<PathBuf>, codec: Arc<dyn Encryption>) -> PluginResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut workflows = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if ext != "json" && ext != "bin" {
                continue;
            }
            match Self::read_file(&path, codec.as_ref()) {
                Ok(workflow) => {
                    workflows.insert(workflow.id.clone(), workflow);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable workflow");
                }
            }
        }
        info!(dir = %dir.display(), count = workflows.len(), "Loaded workflows");

        Ok(Self {
            dir,
            codec,
            workflows: RwLock::new(workflows),
        })
    }

    fn read_file(path: &Path, codec: &dyn Encryption) -> PluginResult<Workflow> {
        let bytes = fs::read(path)?;
        let value = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_slice(&bytes)?
        } else {
            codec.decrypt(&bytes)?
        };
        Workflow::from_value(value)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PluginResult<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(PluginError::workflow(id, "invalid workflow identifier"));
        }
        Ok(self.dir.join(format!("{id}.{}", self.codec.extension())))
    }

    pub fn get(&self, id: &str) -> Option<Workflow> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Workflow> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Register an empty workflow under the next free `workflow_<n>` id
    pub fn create(&self, name: &str, description: &str, kind: WorkflowKind) -> Workflow {
        let mut workflows = self.workflows.write().unwrap_or_else(PoisonError::into_inner);
        let mut n = workflows.len() + 1;
        while workflows.contains_key(&format!("workflow_{n}")) {
            n += 1;
        }

        let mut workflow = Workflow::new(format!("workflow_{n}"), name, kind);
        workflow.description = description.to_string();
        workflows.insert(workflow.id.clone(), workflow.clone());
        workflow
    }

    pub fn add_node(&self, workflow_id: &str, node: WorkflowNode) -> PluginResult<()> {
        self.workflows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(workflow_id)
            .ok_or_else(|| PluginError::workflow(workflow_id, "does not exist"))?
            .add_node(node);
        Ok(())
    }

    /// Validate, persist and register `workflow`
    pub fn save(&self, workflow: &Workflow) -> PluginResult<()> {
        workflow.validate()?;
        let path = self.path_for(&workflow.id)?;
        let bytes = self.codec.encrypt(&serde_json::to_value(workflow)?)?;
        fs::write(path, bytes)?;
        self.workflows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(workflow.id.clone(), workflow.clone());
        info!(workflow = %workflow.id, "Workflow saved");
        Ok(())
    }

    /// Persist a registered workflow by id
    pub fn persist(&self, id: &str) -> PluginResult<()> {
        let workflow = self
            .get(id)
            .ok_or_else(|| PluginError::workflow(id, "does not exist"))?;
        self.save(&workflow)
    }

    /// Forget `id` and delete its file; returns whether it existed
    pub fn remove(&self, id: &str) -> PluginResult<bool> {
        self.path_for(id)?;
        let existed = self
            .workflows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();
        for ext in ["json", "bin"] {
            let path = self.dir.join(format!("{id}.{ext}"));
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(existed)
    }
}
