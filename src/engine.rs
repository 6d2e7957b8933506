//! The engine facade: definition registry, instance store and public operations.

use crate::activity::{Job, MessageSubscription, Timer};
use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, SnapshotCompression};
use crate::error::BpmnError;
use crate::exporter::{EngineEvent, EventExporter};
use crate::handler::{ActivatedJob, TaskHandlerRegistry, TaskMatcher};
use crate::instance::{CaughtEvent, ProcessInstance};
use crate::interpreter::Interpreter;
use crate::keys::{KeyGenerator, SnowflakeKeys};
use crate::model::{parse_definitions, ProcessDefinition};
use crate::variables::Variables;
use crate::Key;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

/// SHA-256 of a definition source, lowercase hex.
pub(crate) fn source_checksum(source: &[u8]) -> String {
    hex::encode(Sha256::digest(source))
}

// ─── Builder ──────────────────────────────────────────────────

/// Assembles a [`BpmnEngine`] with explicit collaborators.
#[derive(Default)]
pub struct BpmnEngineBuilder {
    name: Option<String>,
    machine_id: Option<u16>,
    keys: Option<Box<dyn KeyGenerator>>,
    clock: Option<Arc<dyn Clock>>,
    exporters: Vec<Arc<dyn EventExporter>>,
    compression: SnapshotCompression,
}

impl BpmnEngineBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Machine id for the default snowflake key generator.
    pub fn machine_id(mut self, machine_id: u16) -> Self {
        self.machine_id = Some(machine_id);
        self
    }

    pub fn key_generator(mut self, keys: impl KeyGenerator + 'static) -> Self {
        self.keys = Some(Box::new(keys));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn exporter(mut self, exporter: Arc<dyn EventExporter>) -> Self {
        self.exporters.push(exporter);
        self
    }

    pub fn snapshot_compression(mut self, compression: SnapshotCompression) -> Self {
        self.compression = compression;
        self
    }

    pub fn build(self) -> Result<BpmnEngine, BpmnError> {
        let keys: Box<dyn KeyGenerator> = match self.keys {
            Some(keys) => keys,
            None => Box::new(match self.machine_id {
                Some(id) => SnowflakeKeys::new(id)?,
                None => SnowflakeKeys::from_environment()?,
            }),
        };
        Ok(BpmnEngine {
            name: self
                .name
                .unwrap_or_else(|| EngineConfig::default().name),
            definitions: Vec::new(),
            instances: Vec::new(),
            keys,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            handlers: TaskHandlerRegistry::default(),
            exporters: self.exporters,
            compression: self.compression,
        })
    }
}

// ─── Engine ───────────────────────────────────────────────────

/// An in-process BPMN engine.
///
/// Instances only advance inside [`run_or_continue_instance`] (or the
/// `create_and_run*` shortcuts). Timers and messages are pulled: a host
/// publishes events or lets time pass, then calls run again.
///
/// [`run_or_continue_instance`]: BpmnEngine::run_or_continue_instance
pub struct BpmnEngine {
    pub(crate) name: String,
    pub(crate) definitions: Vec<Arc<ProcessDefinition>>,
    pub(crate) instances: Vec<ProcessInstance>,
    pub(crate) keys: Box<dyn KeyGenerator>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) handlers: TaskHandlerRegistry,
    pub(crate) exporters: Vec<Arc<dyn EventExporter>>,
    pub(crate) compression: SnapshotCompression,
}

impl BpmnEngine {
    pub fn builder() -> BpmnEngineBuilder {
        BpmnEngineBuilder::default()
    }

    /// Engine with snowflake keys seeded from the environment and the system clock.
    pub fn new(name: impl Into<String>) -> Result<Self, BpmnError> {
        Self::builder().name(name).build()
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, BpmnError> {
        let mut builder = Self::builder()
            .name(config.name.clone())
            .snapshot_compression(config.snapshot_compression);
        if let Some(id) = config.machine_id {
            builder = builder.machine_id(id);
        }
        builder.build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ── Definitions ──

    pub fn load_from_str(&mut self, source: &str) -> Result<Arc<ProcessDefinition>, BpmnError> {
        self.load(source, "")
    }

    pub fn load_from_bytes(&mut self, source: &[u8]) -> Result<Arc<ProcessDefinition>, BpmnError> {
        let source = std::str::from_utf8(source)
            .map_err(|e| BpmnError::Parse(format!("source is not valid UTF-8: {e}")))?;
        self.load(source, "")
    }

    pub fn load_from_file(
        &mut self,
        path: impl AsRef<Path>,
    ) -> Result<Arc<ProcessDefinition>, BpmnError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        self.load(&source, &path.display().to_string())
    }

    /// Register a definition. Identical content for a known process id returns
    /// the existing definition; changed content becomes the next version.
    fn load(
        &mut self,
        source: &str,
        resource_name: &str,
    ) -> Result<Arc<ProcessDefinition>, BpmnError> {
        let process = parse_definitions(source)?;
        let checksum = source_checksum(source.as_bytes());

        if let Some(existing) = self
            .definitions
            .iter()
            .find(|d| d.bpmn_process_id == process.id && d.checksum == checksum)
        {
            tracing::debug!(
                process_key = existing.process_key,
                bpmn_process_id = %existing.bpmn_process_id,
                "identical definition already loaded"
            );
            return Ok(Arc::clone(existing));
        }

        let version = self
            .definitions
            .iter()
            .filter(|d| d.bpmn_process_id == process.id)
            .map(|d| d.version)
            .max()
            .unwrap_or(0)
            + 1;
        let definition = Arc::new(ProcessDefinition {
            process_key: self.keys.next_key()?,
            bpmn_process_id: process.id.clone(),
            version,
            checksum,
            source: source.to_string(),
            resource_name: resource_name.to_string(),
            loaded_at: self.clock.now(),
            process,
        });
        self.definitions.push(Arc::clone(&definition));

        tracing::info!(
            process_key = definition.process_key,
            bpmn_process_id = %definition.bpmn_process_id,
            version,
            "process definition loaded"
        );
        self.export(&EngineEvent::ProcessLoaded {
            process_key: definition.process_key,
            bpmn_process_id: definition.bpmn_process_id.clone(),
            version,
            resource_name: definition.resource_name.clone(),
            checksum: definition.checksum.clone(),
        });
        Ok(definition)
    }

    pub fn definitions(&self) -> &[Arc<ProcessDefinition>] {
        &self.definitions
    }

    /// All versions of a process id, ascending.
    pub fn find_processes(&self, bpmn_process_id: &str) -> Vec<Arc<ProcessDefinition>> {
        let mut found: Vec<_> = self
            .definitions
            .iter()
            .filter(|d| d.bpmn_process_id == bpmn_process_id)
            .cloned()
            .collect();
        found.sort_by_key(|d| d.version);
        found
    }

    pub fn find_process(&self, process_key: Key) -> Option<&Arc<ProcessDefinition>> {
        self.definitions.iter().find(|d| d.process_key == process_key)
    }

    // ── Instances ──

    pub fn create_instance(
        &mut self,
        process_key: Key,
        variables: Variables,
    ) -> Result<&ProcessInstance, BpmnError> {
        let definition = self
            .find_process(process_key)
            .cloned()
            .ok_or(BpmnError::ProcessNotFound(process_key))?;
        let instance_key = self.keys.next_key()?;
        let instance =
            ProcessInstance::new(instance_key, definition, variables, self.clock.now());

        tracing::info!(
            instance_key,
            process_key,
            bpmn_process_id = %instance.bpmn_process_id(),
            "instance created"
        );
        self.export(&EngineEvent::InstanceCreated {
            process_key,
            instance_key,
            bpmn_process_id: instance.bpmn_process_id().to_string(),
            version: instance.version(),
        });
        self.instances.push(instance);
        let idx = self.instances.len() - 1;
        Ok(&self.instances[idx])
    }

    /// Create an instance of the highest loaded version of `bpmn_process_id`.
    pub fn create_instance_by_id(
        &mut self,
        bpmn_process_id: &str,
        variables: Variables,
    ) -> Result<&ProcessInstance, BpmnError> {
        let process_key = self.latest_version(bpmn_process_id)?;
        self.create_instance(process_key, variables)
    }

    pub fn create_and_run(
        &mut self,
        process_key: Key,
        variables: Variables,
    ) -> Result<&ProcessInstance, BpmnError> {
        let key = self.create_instance(process_key, variables)?.key();
        self.run_or_continue_instance(key)
    }

    pub fn create_and_run_by_id(
        &mut self,
        bpmn_process_id: &str,
        variables: Variables,
    ) -> Result<&ProcessInstance, BpmnError> {
        let process_key = self.latest_version(bpmn_process_id)?;
        self.create_and_run(process_key, variables)
    }

    /// Drive an instance forward. Returns immediately for terminal instances.
    ///
    /// On an engine or expression error the instance is left `Failed` and the
    /// error is returned.
    pub fn run_or_continue_instance(
        &mut self,
        instance_key: Key,
    ) -> Result<&ProcessInstance, BpmnError> {
        let idx = self.instance_index(instance_key)?;
        let mut interpreter = Interpreter {
            keys: self.keys.as_mut(),
            clock: self.clock.as_ref(),
            handlers: &mut self.handlers,
            exporters: &self.exporters,
        };
        interpreter.run(&mut self.instances[idx])?;
        Ok(&self.instances[idx])
    }

    /// Record a named event against an instance. The instance only reacts on
    /// its next run.
    pub fn publish_event(
        &mut self,
        instance_key: Key,
        name: impl Into<String>,
        variables: Variables,
    ) -> Result<(), BpmnError> {
        let idx = self.instance_index(instance_key)?;
        let name = name.into();
        tracing::debug!(instance_key, event = %name, "event published");
        let caught_at = self.clock.now();
        self.instances[idx].record_event(CaughtEvent {
            name,
            caught_at,
            variables,
            consumed: false,
        });
        Ok(())
    }

    pub fn instances(&self) -> &[ProcessInstance] {
        &self.instances
    }

    pub fn find_instance(&self, instance_key: Key) -> Option<&ProcessInstance> {
        self.instances.iter().find(|i| i.key() == instance_key)
    }

    // ── Handlers and exporters ──

    pub fn register_task_handler<F>(&mut self, matcher: TaskMatcher, handler: F)
    where
        F: FnMut(&mut ActivatedJob<'_>) + Send + 'static,
    {
        self.handlers.register(matcher, Box::new(handler));
    }

    pub fn add_exporter(&mut self, exporter: Arc<dyn EventExporter>) {
        self.exporters.push(exporter);
    }

    // ── Engine-wide views ──

    pub fn message_subscriptions(&self) -> Vec<&MessageSubscription> {
        self.instances.iter().flat_map(|i| i.subscriptions()).collect()
    }

    pub fn timers_scheduled(&self) -> Vec<&Timer> {
        self.instances.iter().flat_map(|i| i.timers()).collect()
    }

    pub fn jobs(&self) -> Vec<&Job> {
        self.instances.iter().flat_map(|i| i.jobs()).collect()
    }

    // ── Internals ──

    fn latest_version(&self, bpmn_process_id: &str) -> Result<Key, BpmnError> {
        self.definitions
            .iter()
            .filter(|d| d.bpmn_process_id == bpmn_process_id)
            .max_by_key(|d| d.version)
            .map(|d| d.process_key)
            .ok_or_else(|| BpmnError::ProcessIdNotFound(bpmn_process_id.to_string()))
    }

    fn instance_index(&self, instance_key: Key) -> Result<usize, BpmnError> {
        self.instances
            .iter()
            .position(|i| i.key() == instance_key)
            .ok_or(BpmnError::InstanceNotFound(instance_key))
    }

    fn export(&self, event: &EngineEvent) {
        for exporter in &self.exporters {
            exporter.export(event);
        }
    }
}

impl std::fmt::Debug for BpmnEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BpmnEngine")
            .field("name", &self.name)
            .field("definitions", &self.definitions.len())
            .field("instances", &self.instances.len())
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SequenceKeys;

    const V1: &str = r#"<definitions><process id="p">
        <startEvent id="start"/><endEvent id="end"/>
        <sequenceFlow id="f" sourceRef="start" targetRef="end"/>
    </process></definitions>"#;

    const V2: &str = r#"<definitions><process id="p" name="second">
        <startEvent id="start"/><endEvent id="end"/>
        <sequenceFlow id="f" sourceRef="start" targetRef="end"/>
    </process></definitions>"#;

    fn engine() -> BpmnEngine {
        BpmnEngine::builder()
            .name("test")
            .key_generator(SequenceKeys::default())
            .build()
            .unwrap()
    }

    #[test]
    fn test_identical_source_reuses_definition() {
        let mut engine = engine();
        let first = engine.load_from_str(V1).unwrap();
        let again = engine.load_from_str(V1).unwrap();
        assert_eq!(first.process_key, again.process_key);
        assert_eq!(again.version, 1);
        assert_eq!(engine.definitions().len(), 1);
    }

    #[test]
    fn test_changed_source_increments_version() {
        let mut engine = engine();
        let first = engine.load_from_str(V1).unwrap();
        let second = engine.load_from_str(V2).unwrap();
        assert_ne!(first.process_key, second.process_key);
        assert_eq!(second.version, 2);
        let versions: Vec<i32> = engine.find_processes("p").iter().map(|d| d.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn test_create_by_id_uses_latest_version() {
        let mut engine = engine();
        engine.load_from_str(V1).unwrap();
        let second = engine.load_from_str(V2).unwrap();
        let instance = engine.create_instance_by_id("p", Variables::new()).unwrap();
        assert_eq!(instance.process_key(), second.process_key);
    }

    #[test]
    fn test_unknown_keys_are_errors() {
        let mut engine = engine();
        assert!(matches!(
            engine.create_instance(99, Variables::new()),
            Err(BpmnError::ProcessNotFound(99))
        ));
        assert!(matches!(
            engine.create_instance_by_id("nope", Variables::new()),
            Err(BpmnError::ProcessIdNotFound(_))
        ));
        assert!(matches!(
            engine.run_or_continue_instance(5),
            Err(BpmnError::InstanceNotFound(5))
        ));
        assert!(matches!(
            engine.publish_event(5, "go", Variables::new()),
            Err(BpmnError::InstanceNotFound(5))
        ));
    }

    #[test]
    fn test_load_from_bytes_rejects_invalid_utf8() {
        let mut engine = engine();
        let err = engine.load_from_bytes(&[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, BpmnError::Parse(_)));
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            source_checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
