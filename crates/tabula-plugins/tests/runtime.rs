//! Dependency ordering, event delivery, data processing and workflows

mod common;

use common::{Stub, params, record, source, system, table, types};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabula_core::RuntimeConfig;
use tabula_plugins::dependencies::DependencyResolver;
use tabula_plugins::events::names;
use tabula_plugins::loader::{FactoryTable, MANIFEST_FILE, PluginManifest};
use tabula_plugins::permissions::DenyAll;
use tabula_plugins::version::parse_version;
use tabula_plugins::worker::UnitOutcome;
use tabula_plugins::workflow::{
    Condition, ExecutionStatus, UPSTREAM_PARAM, WorkflowKind, WorkflowNode,
};
use tabula_plugins::{LifecycleState, PluginError, PluginSystem};
use tempfile::TempDir;

fn names_of(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_dependency_chain_loads_in_order() {
    let temp = TempDir::new().expect("temp");
    let system = system(
        &temp,
        vec![
            Stub::new("C").depends_on("B>=1.0"),
            Stub::new("B").depends_on("A"),
            Stub::new("A"),
        ],
        Arc::new(DenyAll),
    );
    let log = record(&system, &[names::PLUGIN_LOADED]);

    let summary = system.load_all().await.expect("load all");

    assert_eq!(summary.loaded, names_of(&["A", "B", "C"]));
    assert!(summary.failed.is_empty());
    assert_eq!(
        system.load_order(&names_of(&["C", "B", "A"])).expect("order"),
        names_of(&["A", "B", "C"])
    );
    let loaded: Vec<String> = log
        .lock()
        .expect("log")
        .iter()
        .map(|e| e.payload["plugin"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(loaded, names_of(&["A", "B", "C"]));
}

#[tokio::test]
async fn test_cycle_is_reported_and_blocks_its_members() {
    let temp = TempDir::new().expect("temp");
    let system = system(
        &temp,
        vec![
            Stub::new("A").depends_on("B"),
            Stub::new("B").depends_on("A"),
            Stub::new("solo"),
        ],
        Arc::new(DenyAll),
    );
    let log = record(&system, &[names::DEPENDENCY_CYCLE]);

    let summary = system.load_all().await.expect("load all");

    assert_eq!(summary.loaded, names_of(&["solo"]));
    assert_eq!(summary.cycles.len(), 1);
    assert!(summary.failed.contains_key("A"));
    assert!(summary.failed.contains_key("B"));
    assert_eq!(system.get_plugin_state("A"), LifecycleState::Error);
    assert_eq!(system.get_plugin_state("B"), LifecycleState::Error);
    assert_eq!(system.get_plugin_state("solo"), LifecycleState::Loaded);
    assert_eq!(types(&log), vec![names::DEPENDENCY_CYCLE]);

    let mut resolver = DependencyResolver::new();
    let v1 = parse_version("1.0.0").expect("version");
    resolver.register("A", v1.clone(), vec!["B".parse().expect("spec")]);
    resolver.register("B", v1, vec!["A".parse().expect("spec")]);
    let err = resolver
        .load_order(&names_of(&["A", "B"]))
        .expect_err("cycle");
    assert_eq!(err.code(), "E504");
    assert!(matches!(err, PluginError::CircularDependency { .. }));
}

#[tokio::test]
async fn test_cycle_blocks_plugins_that_require_it() {
    let temp = TempDir::new().expect("temp");
    let system = system(
        &temp,
        vec![
            Stub::new("X").depends_on("Y"),
            Stub::new("Y").depends_on("X"),
            Stub::new("Z").depends_on("X"),
            Stub::new("free"),
        ],
        Arc::new(DenyAll),
    );

    let summary = system.load_all().await.expect("load all");

    assert_eq!(summary.loaded, names_of(&["free"]));
    assert_eq!(system.get_plugin_state("Z"), LifecycleState::Error);
    assert!(system.get_plugin("Z").is_none());
    let reason = &summary.failed["Z"];
    assert!(reason.contains("Circular dependency"), "{reason}");
    assert_eq!(system.failed_plugins().get("Z"), Some(reason));
    assert_eq!(system.failed_plugins().len(), 3);
}

#[tokio::test]
async fn test_code_declared_dependencies_order_batch_load() {
    let temp = TempDir::new().expect("temp");
    let dependent = Stub::new("a").depends_on("b");
    let mut manifest = PluginManifest::for_plugin(dependent.clone().factory()().as_ref());
    manifest.dependencies.clear();
    let source = source(vec![Stub::new("b")]).with_manifest(manifest, dependent.factory());
    let system = PluginSystem::builder()
        .config(RuntimeConfig::with_plugin_dir(temp.path()))
        .source(Arc::new(source))
        .build()
        .expect("plugin system");

    let summary = system.load_all().await.expect("load all");

    assert_eq!(summary.loaded, names_of(&["b", "a"]));
    assert_eq!(
        system.get_plugin_info("a").expect("a").dependencies,
        names_of(&["b"])
    );
}

#[tokio::test]
async fn test_version_conflict_blocks_activation() {
    let temp = TempDir::new().expect("temp");
    let system = system(
        &temp,
        vec![Stub::new("A"), Stub::new("B").depends_on("A>=2.0")],
        Arc::new(DenyAll),
    );
    let log = record(&system, &[names::DEPENDENCY_CONFLICT]);
    system.load_all().await.expect("load all");

    assert!(!system.activate("B").await.expect("activate"));
    assert_eq!(system.get_plugin_state("B"), LifecycleState::Loaded);

    let report = system.check_dependencies("B").expect("report");
    assert!(!report.is_satisfied());
    assert_eq!(report.conflicts[0].dependency, "A");
    assert_eq!(report.conflicts[0].found, "1.0.0");

    let events = log.lock().expect("log");
    assert!(!events.is_empty());
    assert_eq!(events[0].payload["dependency"], json!("A"));
}

#[tokio::test]
async fn test_missing_required_dependency_blocks_activation() {
    let temp = TempDir::new().expect("temp");
    let system = system(
        &temp,
        vec![Stub::new("base"), Stub::new("app").depends_on("base")],
        Arc::new(DenyAll),
    );
    system.load("app").await.expect("load");

    assert!(!system.activate("app").await.expect("activate"));
    system.load("base").await.expect("load base");
    assert!(system.activate("app").await.expect("activate"));
}

#[tokio::test]
async fn test_load_all_from_plugin_directory() {
    let temp = TempDir::new().expect("temp");
    let alpha = Stub::new("alpha");
    let beta = Stub::new("beta").version("2.1.0").depends_on("alpha");

    for stub in [&alpha, &beta] {
        let instance = stub.clone().factory()();
        let manifest = PluginManifest::for_plugin(instance.as_ref());
        let dir = temp.path().join(&stub.name);
        std::fs::create_dir_all(&dir).expect("plugin dir");
        std::fs::write(
            dir.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest).expect("manifest"),
        )
        .expect("write manifest");
    }
    let broken = temp.path().join("broken");
    std::fs::create_dir_all(&broken).expect("broken dir");
    std::fs::write(broken.join(MANIFEST_FILE), "{ not json").expect("write");

    let system = PluginSystem::builder()
        .config(RuntimeConfig::with_plugin_dir(temp.path()))
        .factories(
            FactoryTable::new()
                .register("alpha", alpha.factory())
                .register("beta", beta.factory()),
        )
        .build()
        .expect("system");

    let summary = system.load_all().await.expect("load all");

    assert_eq!(summary.loaded, names_of(&["alpha", "beta"]));
    assert!(summary.failed.contains_key("broken"));
    assert_eq!(system.get_plugin_state("broken"), LifecycleState::Error);
    let info = system.get_plugin_info("beta").expect("beta");
    assert_eq!(info.version, "2.1.0");
    assert_eq!(info.dependencies, vec!["alpha".to_string()]);
}

#[tokio::test]
async fn test_subscribers_run_in_priority_order() {
    let temp = TempDir::new().expect("temp");
    let system = system(&temp, vec![Stub::new("p")], Arc::new(DenyAll));
    let order = Arc::new(Mutex::new(Vec::new()));
    for priority in [10, -5, 0] {
        let order = order.clone();
        system
            .event_bus()
            .subscribe(names::PLUGIN_LOADED, priority, move |_| {
                order.lock().expect("order").push(priority);
                Ok(())
            });
    }
    system.event_bus().subscribe(names::PLUGIN_LOADED, 5, |_| {
        anyhow::bail!("handler failure stays local")
    });

    system.load("p").await.expect("load");

    assert_eq!(*order.lock().expect("order"), vec![-5, 0, 10]);
}

#[tokio::test]
async fn test_events_without_subscribers_are_still_recorded() {
    let temp = TempDir::new().expect("temp");
    let system = system(&temp, vec![Stub::new("p")], Arc::new(DenyAll));
    system.load("p").await.expect("load");

    let event = system
        .event_bus()
        .last_event("stub.initialized")
        .expect("emitted during initialize");
    assert_eq!(event.source, "p");
    assert_eq!(
        system
            .event_bus()
            .last_event(names::PLUGIN_LOADED)
            .expect("loaded")
            .payload["plugin"],
        json!("p")
    );
}

#[tokio::test]
async fn test_process_data_merges_params_over_config() {
    let temp = TempDir::new().expect("temp");
    let system = system(&temp, vec![Stub::new("p")], Arc::new(DenyAll));
    let log = record(&system, &[names::DATA_PROCESSED]);
    system.load("p").await.expect("load");
    system
        .set_plugin_config("p", params(json!({ "mode": "stored", "depth": 2 })))
        .expect("config");
    system.activate("p").await.expect("activate");

    let out = system
        .process_data("p", &table(3), params(json!({ "mode": "call" })))
        .await
        .expect("process");

    assert_eq!(out["rows"], json!(3));
    assert_eq!(out["params"], json!({ "mode": "call", "depth": 2 }));
    let events = log.lock().expect("log");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["rows"], json!(3));
}

#[tokio::test]
async fn test_process_failure_is_runtime_error() {
    let temp = TempDir::new().expect("temp");
    let system = system(&temp, vec![Stub::new("p").failing_process()], Arc::new(DenyAll));
    let log = record(&system, &[names::PLUGIN_ERROR]);
    system.load("p").await.expect("load");
    system.activate("p").await.expect("activate");

    let err = system
        .process_data("p", &table(1), Default::default())
        .await
        .expect_err("plugin fails");

    assert_eq!(err.code(), "E508");
    assert!(err.to_string().contains("stub refused the data"));
    assert_eq!(types(&log), vec![names::PLUGIN_ERROR]);
    // A processing failure does not change the lifecycle state
    assert_eq!(system.get_plugin_state("p"), LifecycleState::Active);
}

#[tokio::test]
async fn test_parallel_partitions_keep_order() {
    let temp = TempDir::new().expect("temp");
    let system = system(&temp, vec![Stub::new("p")], Arc::new(DenyAll));
    system.load("p").await.expect("load");
    system.activate("p").await.expect("activate");

    let batch = system
        .process_data_parallel("p", &table(10), 3, Default::default())
        .await
        .expect("parallel");

    assert!(!batch.cancelled);
    assert_eq!(batch.completed(), 3);
    let partitions: Vec<(u64, u64)> = batch
        .outcomes
        .iter()
        .map(|o| match o {
            UnitOutcome::Completed(v) => (
                v["partition"].as_u64().unwrap_or(u64::MAX),
                v["rows"].as_u64().unwrap_or(0),
            ),
            other => panic!("unexpected outcome {other:?}"),
        })
        .collect();
    assert_eq!(partitions, vec![(0, 4), (1, 4), (2, 2)]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_forces_reset_after_grace() {
    let temp = TempDir::new().expect("temp");
    let system = Arc::new(system(
        &temp,
        vec![Stub::new("slow").slow(Duration::from_secs(60))],
        Arc::new(DenyAll),
    ));
    system.load("slow").await.expect("load");
    system.activate("slow").await.expect("activate");

    let worker = system.clone();
    let batch = tokio::spawn(async move {
        worker
            .process_data_parallel("slow", &table(4), 2, Default::default())
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = system.cancel_processing("slow").await.expect("cancel");
    assert!(report.forced_reset);
    assert_eq!(report.outstanding, 2);

    let result = batch.await.expect("join");
    assert!(matches!(result, Err(PluginError::Cancelled(_))));

    // The pool accepts new work after the reset
    let fresh = system
        .cancel_processing("slow")
        .await
        .expect("cancel idle pool");
    assert!(!fresh.forced_reset);
}

#[tokio::test]
async fn test_sequential_workflow_through_system() {
    let temp = TempDir::new().expect("temp");
    let system = system(
        &temp,
        vec![Stub::new("extract"), Stub::new("report")],
        Arc::new(DenyAll),
    );
    let log = record(&system, &[names::WORKFLOW_COMPLETED]);
    for name in ["extract", "report"] {
        system.load(name).await.expect("load");
        system.activate(name).await.expect("activate");
    }

    let workflow = system
        .workflows()
        .create("nightly", "extract then report", WorkflowKind::Sequential);
    system
        .workflows()
        .add_node(
            &workflow.id,
            WorkflowNode::new("first", "extract")
                .param("limit", json!(5))
                .then("second"),
        )
        .expect("node");
    system
        .workflows()
        .add_node(&workflow.id, WorkflowNode::new("second", "report"))
        .expect("node");
    system.workflows().persist(&workflow.id).expect("persist");

    let run = system
        .execute_workflow(&workflow.id, table(2))
        .await
        .expect("run");

    assert!(run.succeeded());
    assert_eq!(run.results["first"].status, ExecutionStatus::Completed);
    let output = run.output.as_ref().expect("output");
    assert_eq!(output["plugin"], json!("report"));
    assert_eq!(output["params"][UPSTREAM_PARAM]["plugin"], json!("extract"));

    let events = log.lock().expect("log");
    assert_eq!(events[0].payload["workflow"], json!(workflow.id));
    assert_eq!(events[0].payload["status"], json!("completed"));
}

#[tokio::test]
async fn test_parallel_workflow_records_inactive_node_failure() {
    let temp = TempDir::new().expect("temp");
    let system = system(
        &temp,
        vec![Stub::new("left"), Stub::new("right")],
        Arc::new(DenyAll),
    );
    system.load("left").await.expect("load");
    system.activate("left").await.expect("activate");
    system.load("right").await.expect("load");

    let workflow = system
        .workflows()
        .create("fan-out", "", WorkflowKind::Parallel);
    system
        .workflows()
        .add_node(&workflow.id, WorkflowNode::new("l", "left"))
        .expect("node");
    system
        .workflows()
        .add_node(&workflow.id, WorkflowNode::new("r", "right"))
        .expect("node");

    let run = system
        .execute_workflow(&workflow.id, table(2))
        .await
        .expect("run");

    assert_eq!(run.results["l"].status, ExecutionStatus::Completed);
    assert_eq!(run.results["r"].status, ExecutionStatus::Failed);
    assert_eq!(run.status(), ExecutionStatus::Failed);
    let output = run.output.as_ref().expect("output");
    assert_eq!(output["l"]["plugin"], json!("left"));
    assert!(output.get("r").is_none());
}

#[tokio::test]
async fn test_conditional_workflow_takes_matching_branch() {
    let temp = TempDir::new().expect("temp");
    let system = system(
        &temp,
        vec![Stub::new("gate"), Stub::new("wide"), Stub::new("narrow")],
        Arc::new(DenyAll),
    );
    for name in ["gate", "wide", "narrow"] {
        system.load(name).await.expect("load");
        system.activate(name).await.expect("activate");
    }

    let workflow = system
        .workflows()
        .create("route", "", WorkflowKind::Conditional);
    for node in [
        WorkflowNode::new("gate", "gate")
            .then("wide")
            .then("narrow")
            .when(Condition::new("/columns/0", json!("id"))),
        WorkflowNode::new("wide", "wide"),
        WorkflowNode::new("narrow", "narrow"),
    ] {
        system
            .workflows()
            .add_node(&workflow.id, node)
            .expect("node");
    }

    let run = system
        .execute_workflow(&workflow.id, table(1))
        .await
        .expect("run");

    assert!(run.succeeded());
    assert_eq!(run.output.as_ref().expect("output")["plugin"], json!("wide"));
    assert_eq!(run.results["narrow"].status, ExecutionStatus::Pending);
}

#[tokio::test]
async fn test_unknown_workflow_is_an_error() {
    let temp = TempDir::new().expect("temp");
    let system = system(&temp, vec![], Arc::new(DenyAll));
    let err = system
        .execute_workflow("workflow_404", table(1))
        .await
        .expect_err("missing");
    assert_eq!(err.code(), "E511");
}
