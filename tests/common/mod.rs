//! Shared helpers for the integration tests.
#![allow(dead_code)]

use bpmn_engine::{BpmnEngine, BpmnEngineBuilder, ManualClock, SequenceKeys, Variables};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// Install a test log writer once; `RUST_LOG=bpmn_engine=debug` shows the interpreter trace.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn builder() -> BpmnEngineBuilder {
    BpmnEngine::builder()
        .name("test-engine")
        .key_generator(SequenceKeys::default())
}

pub fn engine() -> BpmnEngine {
    init_tracing();
    builder().build().expect("engine")
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start_time()))
}

/// Build a variable map from a JSON object literal.
pub fn vars(value: Value) -> Variables {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => Variables::new(),
    }
}

/// Thread-safe call log shared with task handlers.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}
