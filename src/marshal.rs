//! Snapshot and restore of the complete engine state.
//!
//! The snapshot is a versioned JSON document. Definition sources are stored
//! DEFLATE-compressed and base64-encoded and are re-parsed on restore.
//! Activities refer to their element by id and to their origin by activity
//! key; restore resolves both back to arena indices.

use crate::activity::{
    Activity, ActivityIdx, ActivityState, ElementActivity, EventBasedGatewayActivity,
    GatewayActivity, Job, MessageSubscription, Timer, TimerState,
};
use crate::engine::{source_checksum, BpmnEngine, BpmnEngineBuilder};
use crate::error::BpmnError;
use crate::instance::{CaughtEvent, InstanceState, ProcessInstance};
use crate::model::{parse_definitions, ElementIdx, Process, ProcessDefinition};
use crate::variables::Variables;
use crate::Key;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

pub const SNAPSHOT_VERSION: u32 = 1;

// =============================================================================
// SNAPSHOT DOCUMENT
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct EngineSnapshot {
    version: u32,
    name: String,
    definitions: Vec<DefinitionSnapshot>,
    instances: Vec<InstanceSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DefinitionSnapshot {
    process_key: Key,
    bpmn_process_id: String,
    version: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    resource_name: String,
    checksum: String,
    loaded_at: DateTime<Utc>,
    /// DEFLATE + base64.
    source: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct InstanceSnapshot {
    instance_key: Key,
    process_key: Key,
    created_at: DateTime<Utc>,
    state: InstanceState,
    variables: Variables,
    #[serde(default)]
    caught_events: Vec<CaughtEvent>,
    #[serde(default)]
    activities: Vec<ActivitySnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ActivitySnapshot {
    Element {
        key: Key,
        state: ActivityState,
        element_id: String,
        origin_key: Option<Key>,
    },
    Gateway {
        key: Key,
        state: ActivityState,
        element_id: String,
        origin_key: Option<Key>,
        parallel: bool,
        inbound_completed: Vec<String>,
    },
    EventBasedGateway {
        key: Key,
        state: ActivityState,
        element_id: String,
        origin_key: Option<Key>,
        outbound_completed: Option<String>,
    },
    Job {
        key: Key,
        state: ActivityState,
        element_id: String,
        origin_key: Option<Key>,
        created_at: DateTime<Utc>,
        failure: Option<String>,
    },
    Timer {
        key: Key,
        state: TimerState,
        element_id: String,
        origin_key: Option<Key>,
        created_at: DateTime<Utc>,
        due_at: DateTime<Utc>,
        duration_ms: i64,
    },
    Subscription {
        key: Key,
        state: ActivityState,
        element_id: String,
        origin_key: Option<Key>,
        name: String,
        created_at: DateTime<Utc>,
    },
}

impl ActivitySnapshot {
    fn key(&self) -> Key {
        match self {
            Self::Element { key, .. }
            | Self::Gateway { key, .. }
            | Self::EventBasedGateway { key, .. }
            | Self::Job { key, .. }
            | Self::Timer { key, .. }
            | Self::Subscription { key, .. } => *key,
        }
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

impl BpmnEngine {
    /// Serialize every definition, instance and activity.
    pub fn snapshot(&self) -> Result<Vec<u8>, BpmnError> {
        let level = self.compression.level();
        let definitions = self
            .definitions
            .iter()
            .map(|d| -> Result<DefinitionSnapshot, BpmnError> {
                Ok(DefinitionSnapshot {
                    process_key: d.process_key,
                    bpmn_process_id: d.bpmn_process_id.clone(),
                    version: d.version,
                    resource_name: d.resource_name.clone(),
                    checksum: d.checksum.clone(),
                    loaded_at: d.loaded_at,
                    source: compress_and_encode(&d.source, level)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let instances = self.instances.iter().map(snapshot_instance).collect();
        let snapshot = EngineSnapshot {
            version: SNAPSHOT_VERSION,
            name: self.name.clone(),
            definitions,
            instances,
        };
        let bytes = serde_json::to_vec(&snapshot).map_err(|e| BpmnError::Snapshot(e.to_string()))?;
        tracing::debug!(
            definitions = snapshot.definitions.len(),
            instances = snapshot.instances.len(),
            bytes = bytes.len(),
            "engine snapshot written"
        );
        Ok(bytes)
    }

    /// Restore into an engine with default collaborators.
    pub fn restore(bytes: &[u8]) -> Result<Self, BpmnError> {
        Self::restore_with(Self::builder(), bytes)
    }

    /// Restore into an engine assembled by `builder`. The engine name comes
    /// from the snapshot; keys, clock and exporters from the builder. Task
    /// handlers are registered on the returned engine.
    pub fn restore_with(builder: BpmnEngineBuilder, bytes: &[u8]) -> Result<Self, BpmnError> {
        let snapshot: EngineSnapshot = serde_json::from_slice(bytes)
            .map_err(|e| BpmnError::Restore(format!("malformed snapshot: {e}")))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(BpmnError::Restore(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let mut engine = builder.build()?;
        engine.name = snapshot.name;

        for stored in snapshot.definitions {
            engine.keys.advance_past(stored.process_key);
            engine.definitions.push(Arc::new(restore_definition(stored)?));
        }

        for stored in snapshot.instances {
            engine.keys.advance_past(stored.instance_key);
            for activity in &stored.activities {
                engine.keys.advance_past(activity.key());
            }
            let instance = restore_instance(&engine.definitions, stored)?;
            engine.instances.push(instance);
        }

        tracing::info!(
            name = %engine.name,
            definitions = engine.definitions.len(),
            instances = engine.instances.len(),
            "engine restored"
        );
        Ok(engine)
    }
}

fn snapshot_instance(instance: &ProcessInstance) -> InstanceSnapshot {
    let process = &instance.definition.process;
    let origin_key = |origin: Option<ActivityIdx>| {
        origin
            .and_then(|idx| instance.activities.get(idx))
            .map(Activity::key)
    };
    let element_id = |idx: ElementIdx| process.element(idx).id.clone();

    let activities = instance
        .activities
        .iter()
        .map(|activity| match activity {
            Activity::Element(a) => ActivitySnapshot::Element {
                key: a.key,
                state: a.state,
                element_id: element_id(a.element),
                origin_key: origin_key(a.origin),
            },
            Activity::Gateway(g) => ActivitySnapshot::Gateway {
                key: g.key,
                state: g.state,
                element_id: element_id(g.element),
                origin_key: origin_key(g.origin),
                parallel: g.parallel,
                inbound_completed: g.inbound_completed.clone(),
            },
            Activity::EventBasedGateway(g) => ActivitySnapshot::EventBasedGateway {
                key: g.key,
                state: g.state,
                element_id: element_id(g.element),
                origin_key: origin_key(g.origin),
                outbound_completed: g.outbound_completed.clone(),
            },
            Activity::Job(j) => ActivitySnapshot::Job {
                key: j.key,
                state: j.state,
                element_id: j.element_id.clone(),
                origin_key: origin_key(j.origin),
                created_at: j.created_at,
                failure: j.failure.clone(),
            },
            Activity::Timer(t) => ActivitySnapshot::Timer {
                key: t.key,
                state: t.state,
                element_id: t.element_id.clone(),
                origin_key: origin_key(t.origin),
                created_at: t.created_at,
                due_at: t.due_at,
                duration_ms: t.duration.num_milliseconds(),
            },
            Activity::Subscription(s) => ActivitySnapshot::Subscription {
                key: s.key,
                state: s.state,
                element_id: s.element_id.clone(),
                origin_key: origin_key(s.origin),
                name: s.name.clone(),
                created_at: s.created_at,
            },
        })
        .collect();

    InstanceSnapshot {
        instance_key: instance.instance_key,
        process_key: instance.process_key(),
        created_at: instance.created_at,
        state: instance.state,
        variables: instance.variables().clone(),
        caught_events: instance.caught_events.clone(),
        activities,
    }
}

// =============================================================================
// RESTORE
// =============================================================================

fn restore_definition(stored: DefinitionSnapshot) -> Result<ProcessDefinition, BpmnError> {
    let source = decode_and_decompress(&stored.source)?;
    let checksum = source_checksum(source.as_bytes());
    if checksum != stored.checksum {
        return Err(BpmnError::Restore(format!(
            "checksum mismatch for process key={}: expected {}, got {}",
            stored.process_key, stored.checksum, checksum
        )));
    }
    let process = parse_definitions(&source)?;
    Ok(ProcessDefinition {
        process_key: stored.process_key,
        bpmn_process_id: stored.bpmn_process_id,
        version: stored.version,
        checksum,
        source,
        resource_name: stored.resource_name,
        loaded_at: stored.loaded_at,
        process,
    })
}

fn restore_instance(
    definitions: &[Arc<ProcessDefinition>],
    stored: InstanceSnapshot,
) -> Result<ProcessInstance, BpmnError> {
    let definition = definitions
        .iter()
        .find(|d| d.process_key == stored.process_key)
        .cloned()
        .ok_or_else(|| {
            BpmnError::Restore(format!(
                "instance key={} refers to unknown process key={}",
                stored.instance_key, stored.process_key
            ))
        })?;

    // Activity keys resolve to their position in the restored arena.
    let positions: HashMap<Key, ActivityIdx> = stored
        .activities
        .iter()
        .enumerate()
        .map(|(idx, a)| (a.key(), idx))
        .collect();

    let linker = Linker {
        process: &definition.process,
        positions: &positions,
        instance_key: stored.instance_key,
        process_key: stored.process_key,
    };
    let activities = stored
        .activities
        .into_iter()
        .map(|a| linker.relink(a))
        .collect::<Result<Vec<_>, BpmnError>>()?;

    let mut instance = ProcessInstance::new(
        stored.instance_key,
        definition,
        stored.variables,
        stored.created_at,
    );
    instance.state = stored.state;
    instance.caught_events = stored.caught_events;
    instance.activities = activities;
    Ok(instance)
}

/// Resolves stored element ids and origin keys back to indices.
struct Linker<'a> {
    process: &'a Process,
    positions: &'a HashMap<Key, ActivityIdx>,
    instance_key: Key,
    process_key: Key,
}

impl Linker<'_> {
    fn element(&self, element_id: &str) -> Result<ElementIdx, BpmnError> {
        self.process.find_element(element_id).ok_or_else(|| {
            BpmnError::Restore(format!(
                "instance key={} refers to unknown element id='{element_id}'",
                self.instance_key
            ))
        })
    }

    fn origin(&self, origin_key: Option<Key>) -> Result<Option<ActivityIdx>, BpmnError> {
        origin_key
            .map(|key| {
                self.positions.get(&key).copied().ok_or_else(|| {
                    BpmnError::Restore(format!(
                        "instance key={} refers to unknown origin activity key={key}",
                        self.instance_key
                    ))
                })
            })
            .transpose()
    }

    fn relink(&self, stored: ActivitySnapshot) -> Result<Activity, BpmnError> {
        Ok(match stored {
            ActivitySnapshot::Element {
                key,
                state,
                element_id,
                origin_key,
            } => Activity::Element(ElementActivity {
                key,
                state,
                element: self.element(&element_id)?,
                origin: self.origin(origin_key)?,
            }),
            ActivitySnapshot::Gateway {
                key,
                state,
                element_id,
                origin_key,
                parallel,
                inbound_completed,
            } => Activity::Gateway(GatewayActivity {
                key,
                state,
                element: self.element(&element_id)?,
                origin: self.origin(origin_key)?,
                parallel,
                inbound_completed,
            }),
            ActivitySnapshot::EventBasedGateway {
                key,
                state,
                element_id,
                origin_key,
                outbound_completed,
            } => Activity::EventBasedGateway(EventBasedGatewayActivity {
                key,
                state,
                element: self.element(&element_id)?,
                origin: self.origin(origin_key)?,
                outbound_completed,
            }),
            ActivitySnapshot::Job {
                key,
                state,
                element_id,
                origin_key,
                created_at,
                failure,
            } => Activity::Job(Job {
                key,
                instance_key: self.instance_key,
                element: self.element(&element_id)?,
                element_id,
                state,
                created_at,
                origin: self.origin(origin_key)?,
                failure,
            }),
            ActivitySnapshot::Timer {
                key,
                state,
                element_id,
                origin_key,
                created_at,
                due_at,
                duration_ms,
            } => Activity::Timer(Timer {
                key,
                instance_key: self.instance_key,
                process_key: self.process_key,
                element: self.element(&element_id)?,
                element_id,
                state,
                created_at,
                due_at,
                duration: Duration::milliseconds(duration_ms),
                origin: self.origin(origin_key)?,
            }),
            ActivitySnapshot::Subscription {
                key,
                state,
                element_id,
                origin_key,
                name,
                created_at,
            } => Activity::Subscription(MessageSubscription {
                key,
                instance_key: self.instance_key,
                process_key: self.process_key,
                element: self.element(&element_id)?,
                element_id,
                name,
                state,
                created_at,
                origin: self.origin(origin_key)?,
            }),
        })
    }
}

// =============================================================================
// SOURCE ENCODING
// =============================================================================

fn compress_and_encode(source: &str, level: Compression) -> Result<String, BpmnError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), level);
    encoder
        .write_all(source.as_bytes())
        .map_err(|e| BpmnError::Snapshot(format!("compressing definition source: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| BpmnError::Snapshot(format!("compressing definition source: {e}")))?;
    Ok(STANDARD.encode(compressed))
}

fn decode_and_decompress(data: &str) -> Result<String, BpmnError> {
    let compressed = STANDARD
        .decode(data)
        .map_err(|e| BpmnError::Restore(format!("definition source is not valid base64: {e}")))?;
    let mut source = String::new();
    DeflateDecoder::new(compressed.as_slice())
        .read_to_string(&mut source)
        .map_err(|e| BpmnError::Restore(format!("definition source does not inflate: {e}")))?;
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SequenceKeys;

    const WAITING: &str = r#"<definitions><process id="wait">
        <startEvent id="start"/>
        <serviceTask id="work"/>
        <endEvent id="end"/>
        <sequenceFlow id="f1" sourceRef="start" targetRef="work"/>
        <sequenceFlow id="f2" sourceRef="work" targetRef="end"/>
    </process></definitions>"#;

    fn engine() -> BpmnEngine {
        BpmnEngine::builder()
            .name("snap")
            .key_generator(SequenceKeys::default())
            .build()
            .unwrap()
    }

    fn builder() -> BpmnEngineBuilder {
        BpmnEngine::builder().key_generator(SequenceKeys::default())
    }

    #[test]
    fn test_source_encoding_round_trips() {
        for level in [Compression::fast(), Compression::best()] {
            let encoded = compress_and_encode(WAITING, level).unwrap();
            assert_eq!(decode_and_decompress(&encoded).unwrap(), WAITING);
        }
    }

    #[test]
    fn test_restore_relinks_open_job() {
        let mut engine = engine();
        let definition = engine.load_from_str(WAITING).unwrap();
        let key = engine.create_and_run(definition.process_key, Variables::new()).unwrap().key();

        let restored = BpmnEngine::restore_with(builder(), &engine.snapshot().unwrap()).unwrap();
        assert_eq!(restored.name(), "snap");
        let instance = restored.find_instance(key).unwrap();
        assert_eq!(instance.state(), InstanceState::Active);
        let job = instance.jobs().next().unwrap();
        assert_eq!(job.element_id, "work");
        assert_eq!(job.state, ActivityState::Active);
        let origin = job.origin.unwrap();
        assert_eq!(
            instance.definition().process.element(instance.activities()[origin].element()).id,
            "start"
        );
    }

    #[test]
    fn test_restored_keys_stay_unique() {
        let mut engine = engine();
        let definition = engine.load_from_str(WAITING).unwrap();
        engine.create_and_run(definition.process_key, Variables::new()).unwrap();

        let mut restored = BpmnEngine::restore_with(builder(), &engine.snapshot().unwrap()).unwrap();
        let used: Vec<Key> = restored
            .instances()
            .iter()
            .flat_map(|i| std::iter::once(i.key()).chain(i.activities().iter().map(Activity::key)))
            .collect();
        let fresh = restored
            .create_instance(definition.process_key, Variables::new())
            .unwrap()
            .key();
        assert!(used.iter().all(|k| *k < fresh));
    }

    #[test]
    fn test_checksum_mismatch_is_rejected() {
        let mut engine = engine();
        engine.load_from_str(WAITING).unwrap();
        let mut doc: serde_json::Value = serde_json::from_slice(&engine.snapshot().unwrap()).unwrap();
        doc["definitions"][0]["checksum"] = "00".into();
        let err = BpmnEngine::restore_with(builder(), &serde_json::to_vec(&doc).unwrap()).unwrap_err();
        assert!(matches!(err, BpmnError::Restore(msg) if msg.contains("checksum mismatch")));
    }

    #[test]
    fn test_unknown_process_key_is_rejected() {
        let mut engine = engine();
        let definition = engine.load_from_str(WAITING).unwrap();
        engine.create_instance(definition.process_key, Variables::new()).unwrap();
        let mut doc: serde_json::Value = serde_json::from_slice(&engine.snapshot().unwrap()).unwrap();
        doc["definitions"] = serde_json::json!([]);
        let err = BpmnEngine::restore_with(builder(), &serde_json::to_vec(&doc).unwrap()).unwrap_err();
        assert!(matches!(err, BpmnError::Restore(msg) if msg.contains("unknown process key")));
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let doc = serde_json::json!({"version": 99, "name": "x", "definitions": [], "instances": []});
        let err = BpmnEngine::restore_with(builder(), &serde_json::to_vec(&doc).unwrap()).unwrap_err();
        assert!(matches!(err, BpmnError::Restore(msg) if msg.contains("version 99")));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            BpmnEngine::restore_with(builder(), b"not json"),
            Err(BpmnError::Restore(_))
        ));
    }
}
