//! Parsed BPMN process graph.
//!
//! A [`Process`] keeps every supported element in one table in document order.
//! Runtime activities refer to elements by [`ElementIdx`], which stays stable
//! across re-parses of identical source.

mod parser;

pub use parser::parse_definitions;

use crate::Key;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─── Scalar aliases ───────────────────────────────────────────

/// Index into [`Process::elements`].
pub type ElementIdx = usize;

// ─── Element kinds ────────────────────────────────────────────

/// The subset of BPMN element types the engine executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    StartEvent,
    EndEvent,
    ServiceTask,
    UserTask,
    ParallelGateway,
    ExclusiveGateway,
    EventBasedGateway,
    IntermediateCatchEvent,
    IntermediateThrowEvent,
}

impl ElementType {
    /// Map an XML local name to an element type.
    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        Some(match tag {
            b"startEvent" => Self::StartEvent,
            b"endEvent" => Self::EndEvent,
            b"serviceTask" => Self::ServiceTask,
            b"userTask" => Self::UserTask,
            b"parallelGateway" => Self::ParallelGateway,
            b"exclusiveGateway" => Self::ExclusiveGateway,
            b"eventBasedGateway" => Self::EventBasedGateway,
            b"intermediateCatchEvent" => Self::IntermediateCatchEvent,
            b"intermediateThrowEvent" => Self::IntermediateThrowEvent,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::StartEvent => "START_EVENT",
            Self::EndEvent => "END_EVENT",
            Self::ServiceTask => "SERVICE_TASK",
            Self::UserTask => "USER_TASK",
            Self::ParallelGateway => "PARALLEL_GATEWAY",
            Self::ExclusiveGateway => "EXCLUSIVE_GATEWAY",
            Self::EventBasedGateway => "EVENT_BASED_GATEWAY",
            Self::IntermediateCatchEvent => "INTERMEDIATE_CATCH_EVENT",
            Self::IntermediateThrowEvent => "INTERMEDIATE_THROW_EVENT",
        };
        f.write_str(name)
    }
}

// ─── Element payloads ─────────────────────────────────────────

/// One `input` or `output` entry of an `ioMapping` extension.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub source: String,
    pub target: String,
}

/// The populated sub-definition of a catch or throw event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventDefinition {
    Message { message_ref: Option<String> },
    Timer { duration: Option<String> },
    Link { name: String },
}

/// A process element with the capabilities shared by every kind.
///
/// Task-only fields (`task_type`, `assignee`, `candidate_groups`) stay empty
/// for other kinds; mappings are also honoured on catch and throw events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    pub name: String,
    pub kind: ElementType,
    pub incoming: Vec<String>,
    pub outgoing: Vec<String>,
    pub task_type: Option<String>,
    pub inputs: Vec<Mapping>,
    pub outputs: Vec<Mapping>,
    pub assignee: Option<String>,
    pub candidate_groups: Vec<String>,
    pub event_definition: Option<EventDefinition>,
}

impl Element {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ElementType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            task_type: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            assignee: None,
            candidate_groups: Vec::new(),
            event_definition: None,
        }
    }

    /// Link name of a link catch/throw event.
    pub fn link_name(&self) -> Option<&str> {
        match &self.event_definition {
            Some(EventDefinition::Link { name }) => Some(name.as_str()),
            _ => None,
        }
    }
}

/// A directed edge between two elements.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub name: String,
    pub source_ref: String,
    pub target_ref: String,
    /// Raw `conditionExpression` bodies, already HTML-unescaped.
    pub conditions: Vec<String>,
}

impl SequenceFlow {
    /// True only for exactly one non-blank condition expression.
    pub fn has_condition(&self) -> bool {
        self.conditions.len() == 1 && !self.conditions[0].trim().is_empty()
    }

    pub fn condition(&self) -> Option<&str> {
        if self.has_condition() {
            Some(self.conditions[0].trim())
        } else {
            None
        }
    }
}

// ─── Process ──────────────────────────────────────────────────

/// The parsed `process` of a BPMN `definitions` document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub id: String,
    pub name: String,
    pub elements: Vec<Element>,
    pub sequence_flows: Vec<SequenceFlow>,
    /// Declared messages, id → name.
    pub messages: BTreeMap<String, String>,
}

impl Process {
    pub fn element(&self, idx: ElementIdx) -> &Element {
        &self.elements[idx]
    }

    pub fn elements_of(&self, kind: ElementType) -> impl Iterator<Item = (ElementIdx, &Element)> {
        self.elements
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.kind == kind)
    }

    pub fn start_events(&self) -> impl Iterator<Item = (ElementIdx, &Element)> {
        self.elements_of(ElementType::StartEvent)
    }

    pub fn end_events(&self) -> impl Iterator<Item = (ElementIdx, &Element)> {
        self.elements_of(ElementType::EndEvent)
    }

    pub fn service_tasks(&self) -> impl Iterator<Item = (ElementIdx, &Element)> {
        self.elements_of(ElementType::ServiceTask)
    }

    pub fn user_tasks(&self) -> impl Iterator<Item = (ElementIdx, &Element)> {
        self.elements_of(ElementType::UserTask)
    }

    pub fn parallel_gateways(&self) -> impl Iterator<Item = (ElementIdx, &Element)> {
        self.elements_of(ElementType::ParallelGateway)
    }

    pub fn exclusive_gateways(&self) -> impl Iterator<Item = (ElementIdx, &Element)> {
        self.elements_of(ElementType::ExclusiveGateway)
    }

    pub fn event_based_gateways(&self) -> impl Iterator<Item = (ElementIdx, &Element)> {
        self.elements_of(ElementType::EventBasedGateway)
    }

    pub fn catch_events(&self) -> impl Iterator<Item = (ElementIdx, &Element)> {
        self.elements_of(ElementType::IntermediateCatchEvent)
    }

    pub fn throw_events(&self) -> impl Iterator<Item = (ElementIdx, &Element)> {
        self.elements_of(ElementType::IntermediateThrowEvent)
    }

    /// Every element carrying `id`. Duplicate ids yield more than one entry.
    pub fn find_elements_by_id(&self, id: &str) -> Vec<ElementIdx> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, e)| e.id == id)
            .map(|(idx, _)| idx)
            .collect()
    }

    /// First element carrying `id`.
    pub fn find_element(&self, id: &str) -> Option<ElementIdx> {
        self.elements.iter().position(|e| e.id == id)
    }

    pub fn find_flow(&self, id: &str) -> Option<&SequenceFlow> {
        self.sequence_flows.iter().find(|f| f.id == id)
    }

    /// Flows for the given ids, in the order of `ids`. Unknown ids are skipped.
    pub fn find_flows<'a>(&'a self, ids: &'a [String]) -> impl Iterator<Item = &'a SequenceFlow> {
        ids.iter().filter_map(|id| self.find_flow(id))
    }

    /// First sequence flow from `source_id` to `target_id` in document order.
    pub fn find_sequence_flow(&self, source_id: &str, target_id: &str) -> Option<&SequenceFlow> {
        self.sequence_flows
            .iter()
            .find(|f| f.source_ref == source_id && f.target_ref == target_id)
    }

    /// The link catch event whose link name equals `name`.
    pub fn find_link_catch(&self, name: &str) -> Option<ElementIdx> {
        self.catch_events()
            .find(|(_, e)| e.link_name() == Some(name))
            .map(|(idx, _)| idx)
    }

    /// Correlation name for a message catch event: the referenced message's
    /// name, else the element's own name.
    pub fn message_name(&self, element: &Element) -> String {
        if let Some(EventDefinition::Message {
            message_ref: Some(message_ref),
        }) = &element.event_definition
        {
            if let Some(name) = self.messages.get(message_ref) {
                return name.clone();
            }
        }
        element.name.clone()
    }
}

// ─── Definition ───────────────────────────────────────────────

/// A loaded, versioned process definition.
#[derive(Clone, Debug)]
pub struct ProcessDefinition {
    pub process_key: Key,
    pub bpmn_process_id: String,
    pub version: i32,
    /// SHA-256 of the raw source, lowercase hex.
    pub checksum: String,
    pub source: String,
    /// File name the source was loaded from; empty for in-memory sources.
    pub resource_name: String,
    pub loaded_at: DateTime<Utc>,
    pub process: Process,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(id: &str, source: &str, target: &str, conditions: &[&str]) -> SequenceFlow {
        SequenceFlow {
            id: id.into(),
            name: String::new(),
            source_ref: source.into(),
            target_ref: target.into(),
            conditions: conditions.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn sample() -> Process {
        let mut process = Process {
            id: "p".into(),
            ..Default::default()
        };
        process
            .elements
            .push(Element::new("start", "Start", ElementType::StartEvent));
        process
            .elements
            .push(Element::new("task", "Task", ElementType::ServiceTask));
        process
            .elements
            .push(Element::new("task", "Duplicate", ElementType::UserTask));
        let mut catch = Element::new("catch", "Catch", ElementType::IntermediateCatchEvent);
        catch.event_definition = Some(EventDefinition::Link {
            name: "jump".into(),
        });
        process.elements.push(catch);
        process.sequence_flows.push(flow("f1", "start", "task", &[]));
        process.sequence_flows.push(flow("f2", "start", "task", &[]));
        process
    }

    #[test]
    fn test_find_elements_returns_all_duplicates() {
        let process = sample();
        assert_eq!(process.find_elements_by_id("task"), vec![1, 2]);
        assert_eq!(process.find_element("task"), Some(1));
        assert!(process.find_elements_by_id("missing").is_empty());
    }

    #[test]
    fn test_find_sequence_flow_is_first_match() {
        let process = sample();
        let found = process.find_sequence_flow("start", "task").map(|f| f.id.as_str());
        assert_eq!(found, Some("f1"));
    }

    #[test]
    fn test_has_condition_requires_exactly_one_non_blank() {
        assert!(!flow("a", "x", "y", &[]).has_condition());
        assert!(!flow("a", "x", "y", &["   "]).has_condition());
        assert!(!flow("a", "x", "y", &["=a", "=b"]).has_condition());
        let single = flow("a", "x", "y", &[" = a > 1 "]);
        assert!(single.has_condition());
        assert_eq!(single.condition(), Some("= a > 1"));
    }

    #[test]
    fn test_typed_views_and_link_lookup() {
        let process = sample();
        assert_eq!(process.start_events().count(), 1);
        assert_eq!(process.service_tasks().count(), 1);
        assert_eq!(process.user_tasks().count(), 1);
        assert_eq!(process.find_link_catch("jump"), Some(3));
        assert_eq!(process.find_link_catch("other"), None);
    }

    #[test]
    fn test_message_name_prefers_declared_message() {
        let mut process = sample();
        process.messages.insert("m1".into(), "order-paid".into());
        let mut catch = Element::new("c", "Wait", ElementType::IntermediateCatchEvent);
        catch.event_definition = Some(EventDefinition::Message {
            message_ref: Some("m1".into()),
        });
        assert_eq!(process.message_name(&catch), "order-paid");
        catch.event_definition = Some(EventDefinition::Message { message_ref: None });
        assert_eq!(process.message_name(&catch), "Wait");
    }
}
