//! Lifecycle notifications for audit and monitoring collaborators.

use crate::instance::InstanceState;
use crate::model::ElementType;
use crate::Key;
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElementIntent {
    Activated,
    Completed,
    SequenceFlowTaken,
}

/// One engine lifecycle event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    ProcessLoaded {
        process_key: Key,
        bpmn_process_id: String,
        version: i32,
        resource_name: String,
        checksum: String,
    },
    InstanceCreated {
        process_key: Key,
        instance_key: Key,
        bpmn_process_id: String,
        version: i32,
    },
    InstanceEnded {
        process_key: Key,
        instance_key: Key,
        bpmn_process_id: String,
        version: i32,
        state: InstanceState,
    },
    Element {
        process_key: Key,
        instance_key: Key,
        element_id: String,
        element_name: String,
        /// `None` for sequence flows.
        element_type: Option<ElementType>,
        intent: ElementIntent,
    },
}

/// Receives every [`EngineEvent`] synchronously from inside the engine.
pub trait EventExporter: Send + Sync {
    fn export(&self, event: &EngineEvent);
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemoryExporter {
    events: RwLock<Vec<EngineEvent>>,
}

impl MemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `(element_id, intent)` pairs of element events for one instance.
    pub fn element_trail(&self, instance_key: Key) -> Vec<(String, ElementIntent)> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|event| match event {
                EngineEvent::Element {
                    instance_key: k,
                    element_id,
                    intent,
                    ..
                } if *k == instance_key => Some((element_id.clone(), *intent)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventExporter for MemoryExporter {
    fn export(&self, event: &EngineEvent) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Logs every event through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingExporter;

impl EventExporter for TracingExporter {
    fn export(&self, event: &EngineEvent) {
        match event {
            EngineEvent::ProcessLoaded {
                process_key,
                bpmn_process_id,
                version,
                ..
            } => tracing::info!(process_key, %bpmn_process_id, version, "process loaded"),
            EngineEvent::InstanceCreated {
                instance_key,
                bpmn_process_id,
                ..
            } => tracing::info!(instance_key, %bpmn_process_id, "instance created"),
            EngineEvent::InstanceEnded {
                instance_key,
                state,
                ..
            } => tracing::info!(instance_key, ?state, "instance ended"),
            EngineEvent::Element {
                instance_key,
                element_id,
                intent,
                ..
            } => tracing::info!(instance_key, %element_id, ?intent, "element event"),
        }
    }
}
