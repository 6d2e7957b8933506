//! BPMN Engine - embeddable process execution
//!
//! Loads BPMN 2.0 process definitions and drives process instances through a
//! resumable command-queue interpreter. Everything runs synchronously inside
//! the caller's thread: tasks are executed by registered handlers, timers and
//! messages are pulled on the next run.
//!
//! ## Supported elements
//!
//! - Start and end events
//! - Service and user tasks with input/output mappings
//! - Parallel, exclusive and event-based gateways
//! - Intermediate message, timer and link events
//!
//! ## Example
//!
//! ```no_run
//! use bpmn_engine::{BpmnEngine, TaskMatcher, Variables};
//!
//! # fn main() -> Result<(), bpmn_engine::BpmnError> {
//! let mut engine = BpmnEngine::new("orders")?;
//! let definition = engine.load_from_file("order.bpmn")?;
//! engine.register_task_handler(TaskMatcher::Type("ship".into()), |job| {
//!     job.set_variable("shipped", true);
//!     job.complete();
//! });
//! let instance = engine.create_and_run(definition.process_key, Variables::new())?;
//! println!("{:?}", instance.state());
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence
//!
//! [`BpmnEngine::snapshot`] serializes the complete engine state into an
//! opaque byte blob; [`BpmnEngine::restore`] rebuilds an engine from it.

pub mod activity;
pub mod clock;
pub(crate) mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod exporter;
pub mod expression;
pub mod handler;
pub mod instance;
pub(crate) mod interpreter;
pub mod keys;
pub mod marshal;
pub mod model;
pub mod timer;
pub mod variables;

/// Unique identifier for definitions, instances and activities.
pub type Key = i64;

pub use activity::{Activity, ActivityState, Job, MessageSubscription, Timer, TimerState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, SnapshotCompression};
pub use engine::{BpmnEngine, BpmnEngineBuilder};
pub use error::{BpmnError, ExpressionError};
pub use exporter::{ElementIntent, EngineEvent, EventExporter, MemoryExporter, TracingExporter};
pub use handler::{ActivatedJob, JobOutcome, TaskMatcher};
pub use instance::{CaughtEvent, InstanceState, ProcessInstance};
pub use keys::{KeyGenerator, SequenceKeys, SnowflakeKeys};
pub use model::{ElementType, ProcessDefinition};
pub use variables::Variables;
