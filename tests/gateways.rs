//! Parallel and exclusive gateway routing.

mod common;

use bpmn_engine::{
    Activity, ActivityState, BpmnError, ElementIntent, EngineEvent, InstanceState, MemoryExporter,
    TaskMatcher,
};
use common::{engine, vars, CallLog};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

const PARALLEL: &str = include_str!("models/parallel_join.bpmn");
const EXCLUSIVE: &str = include_str!("models/exclusive_gateway.bpmn");
const NO_DEFAULT: &str = include_str!("models/exclusive_no_default.bpmn");
const EARLY_END: &str = include_str!("models/parallel_early_end.bpmn");

#[test]
fn test_parallel_join_waits_for_every_branch() {
    let mut engine = engine();
    let exporter = Arc::new(MemoryExporter::new());
    engine.add_exporter(exporter.clone());
    let definition = engine.load_from_str(PARALLEL).unwrap();
    let calls = CallLog::default();
    for id in ["left", "after"] {
        let log = calls.clone();
        engine.register_task_handler(TaskMatcher::Id(id.into()), move |job| {
            log.push(job.element_id());
            job.complete();
        });
    }

    let key = engine
        .create_and_run(definition.process_key, vars(json!({})))
        .unwrap()
        .key();

    let instance = engine.find_instance(key).unwrap();
    assert_eq!(instance.state(), InstanceState::Active);
    assert_eq!(calls.entries(), vec!["left"]);
    let join = definition.process.find_element("join").unwrap();
    let gateways: Vec<_> = instance
        .activities()
        .iter()
        .filter_map(|a| match a {
            Activity::Gateway(g) if g.element == join => Some(g.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(gateways.len(), 1);
    assert_eq!(gateways[0].inbound_completed, vec!["left-done".to_string()]);

    let log = calls.clone();
    engine.register_task_handler(TaskMatcher::Id("right".into()), move |job| {
        log.push(job.element_id());
        job.complete();
    });
    let instance = engine.run_or_continue_instance(key).unwrap();

    assert_eq!(instance.state(), InstanceState::Completed);
    assert_eq!(calls.entries(), vec!["left", "right", "after"]);
    let join_completions = exporter
        .element_trail(key)
        .into_iter()
        .filter(|(id, intent)| id == "join" && *intent == ElementIntent::Completed)
        .count();
    assert_eq!(join_completions, 1);
    // One gateway activity per element, reused by both arrivals.
    let join_activities = instance
        .activities()
        .iter()
        .filter(|a| matches!(a, Activity::Gateway(g) if g.element == join))
        .count();
    assert_eq!(join_activities, 1);
}

#[test]
fn test_parallel_fork_activates_all_branches_in_one_run() {
    let mut engine = engine();
    let definition = engine.load_from_str(PARALLEL).unwrap();
    for id in ["left", "right", "after"] {
        engine.register_task_handler(TaskMatcher::Id(id.into()), |job| job.complete());
    }

    let instance = engine
        .create_and_run(definition.process_key, vars(json!({})))
        .unwrap();

    assert_eq!(instance.state(), InstanceState::Completed);
    assert_eq!(instance.jobs().count(), 3);
}

#[test]
fn test_branches_queued_after_early_end_still_run() {
    let mut engine = engine();
    let exporter = Arc::new(MemoryExporter::new());
    engine.add_exporter(exporter.clone());
    let definition = engine.load_from_str(EARLY_END).unwrap();
    let calls = CallLog::default();
    let log = calls.clone();
    engine.register_task_handler(TaskMatcher::Id("slow".into()), move |job| {
        log.push(job.element_id());
        job.complete();
    });

    let instance = engine
        .create_and_run(definition.process_key, vars(json!({})))
        .unwrap();

    assert_eq!(instance.state(), InstanceState::Completed);
    assert_eq!(calls.entries(), vec!["slow"]);
    assert_eq!(instance.jobs().count(), 1);
    assert!(instance.jobs().all(|j| j.state == ActivityState::Completed));
    let key = instance.key();
    let completed_ends: Vec<String> = exporter
        .element_trail(key)
        .into_iter()
        .filter(|(id, intent)| id.ends_with("end") && *intent == ElementIntent::Completed)
        .map(|(id, _)| id)
        .collect();
    assert_eq!(completed_ends, vec!["quick-end", "slow-end"]);
    let ended = exporter
        .events()
        .iter()
        .filter(|e| matches!(e, EngineEvent::InstanceEnded { instance_key, .. } if *instance_key == key))
        .count();
    assert_eq!(ended, 1);
}

fn route(price: i64) -> Vec<String> {
    let mut engine = engine();
    let definition = engine.load_from_str(EXCLUSIVE).unwrap();
    let calls = CallLog::default();
    for id in ["premium", "standard", "budget"] {
        let log = calls.clone();
        engine.register_task_handler(TaskMatcher::Id(id.into()), move |job| {
            log.push(job.element_id());
            job.complete();
        });
    }
    let state = engine
        .create_and_run(definition.process_key, vars(json!({ "price": price })))
        .unwrap()
        .state();
    assert_eq!(state, InstanceState::Completed);
    calls.entries()
}

#[test]
fn test_exclusive_gateway_takes_first_true_condition() {
    // Both conditions hold for 150; declaration order decides.
    assert_eq!(route(150), vec!["premium"]);
    assert_eq!(route(70), vec!["standard"]);
}

#[test]
fn test_exclusive_gateway_falls_back_to_default_flow() {
    assert_eq!(route(10), vec!["budget"]);
}

#[test]
fn test_exclusive_gateway_without_match_stalls() {
    let mut engine = engine();
    let exporter = Arc::new(MemoryExporter::new());
    engine.add_exporter(exporter.clone());
    let definition = engine.load_from_str(NO_DEFAULT).unwrap();

    let instance = engine
        .create_and_run(definition.process_key, vars(json!({"amount": 500})))
        .unwrap();

    assert_eq!(instance.state(), InstanceState::Active);
    let taken: Vec<String> = exporter
        .element_trail(instance.key())
        .into_iter()
        .filter(|(_, intent)| *intent == ElementIntent::SequenceFlowTaken)
        .map(|(id, _)| id)
        .collect();
    assert_eq!(taken, vec!["to-route"]);
}

#[test]
fn test_exclusive_gateway_condition_error_fails_instance() {
    let mut engine = engine();
    let definition = engine.load_from_str(NO_DEFAULT).unwrap();
    let key = engine
        .create_instance(definition.process_key, vars(json!({})))
        .unwrap()
        .key();

    let err = engine.run_or_continue_instance(key).unwrap_err();

    assert!(err.is_expression());
    match err {
        BpmnError::Expression { element_id, .. } => assert_eq!(element_id, "is-big"),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(engine.find_instance(key).unwrap().state(), InstanceState::Failed);
}
