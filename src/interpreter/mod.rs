//! The command-queue interpreter that drives one instance forward.
//!
//! A run drains a FIFO of [`Command`]s until it is empty. Commands queued for
//! sibling branches still run after an end event completes the instance; only
//! an error stops the run early. Element handlers never block: waiting is
//! expressed by leaving a job, timer or subscription open, to be re-examined
//! by a later run.

mod events;
mod jobs;

use crate::activity::{
    Activity, ActivityIdx, ActivityState, ElementActivity, EventBasedGatewayActivity,
    GatewayActivity,
};
use crate::clock::Clock;
use crate::command::Command;
use crate::error::BpmnError;
use crate::expression::evaluate_condition;
use crate::exporter::{ElementIntent, EngineEvent, EventExporter};
use crate::handler::TaskHandlerRegistry;
use crate::instance::{InstanceState, ProcessInstance};
use crate::keys::KeyGenerator;
use crate::model::{Element, ElementIdx, ElementType, EventDefinition, Process, SequenceFlow};
use std::collections::VecDeque;
use std::sync::Arc;

/// Borrowed engine services for the duration of one run.
pub(crate) struct Interpreter<'e> {
    pub keys: &'e mut dyn KeyGenerator,
    pub clock: &'e dyn Clock,
    pub handlers: &'e mut TaskHandlerRegistry,
    pub exporters: &'e [Arc<dyn EventExporter>],
}

/// Result of handling one element: the activity that now represents it and
/// whether flow continues along its outgoing sequence flows.
struct Step {
    activity: ActivityIdx,
    continue_flow: bool,
    extra: Vec<Command>,
}

impl Step {
    fn new(activity: ActivityIdx, continue_flow: bool) -> Self {
        Self {
            activity,
            continue_flow,
            extra: Vec::new(),
        }
    }
}

impl Interpreter<'_> {
    /// Drive `instance` until the queue drains or an error fails it.
    pub fn run(&mut self, instance: &mut ProcessInstance) -> Result<(), BpmnError> {
        let definition = Arc::clone(&instance.definition);
        let process = &definition.process;
        let mut queue = VecDeque::new();

        match instance.state {
            InstanceState::Ready => {
                for (element, _) in process.start_events() {
                    queue.push_back(Command::Activity {
                        element,
                        origin: None,
                        via_flow: None,
                    });
                }
                instance.state = InstanceState::Active;
            }
            InstanceState::Active => {
                for activity in instance.continuations() {
                    queue.push_back(Command::ContinueActivity {
                        activity,
                        origin: instance.activities[activity].origin(),
                    });
                }
            }
            InstanceState::Completed | InstanceState::Failed => return Ok(()),
        }

        while let Some(command) = queue.pop_front() {
            tracing::debug!(
                instance_key = instance.instance_key,
                command = command.name(),
                queued = queue.len(),
                "dispatch"
            );

            let next = match command {
                Command::FlowTransition { source, flow_ids } => {
                    self.take_flows(instance, process, source, &flow_ids)
                }
                Command::Activity {
                    element,
                    origin,
                    via_flow,
                } => {
                    self.export_element(instance, process.element(element), ElementIntent::Activated);
                    self.handle_element(instance, process, element, origin, via_flow.as_deref())
                }
                Command::ContinueActivity { activity, origin } => {
                    let element = instance.activities[activity].element();
                    self.handle_element(instance, process, element, origin, None)
                }
                Command::Error {
                    error,
                    element_id,
                    element_name,
                } => {
                    instance.state = InstanceState::Failed;
                    tracing::error!(
                        instance_key = instance.instance_key,
                        %element_id,
                        %element_name,
                        error = %error,
                        "instance failed"
                    );
                    self.export_instance_end(instance);
                    return Err(error);
                }
                Command::CheckGatewayRaceDone { gateway } => {
                    self.check_gateway_race_done(instance, gateway);
                    Vec::new()
                }
            };

            for command in next {
                if command.is_error() {
                    queue.push_front(command);
                } else {
                    queue.push_back(command);
                }
            }
        }

        if instance.state.is_terminal() {
            self.export_instance_end(instance);
        }
        Ok(())
    }

    // ── Flow transitions ──

    fn take_flows(
        &mut self,
        instance: &mut ProcessInstance,
        process: &Process,
        source: ActivityIdx,
        flow_ids: &[String],
    ) -> Vec<Command> {
        let source_element = process.element(instance.activities[source].element());
        let flows: Vec<&SequenceFlow> = process.find_flows(flow_ids).collect();

        let selected = if source_element.kind == ElementType::ExclusiveGateway {
            match select_exclusive(&flows, instance) {
                Ok(selected) => selected,
                Err(error) => return vec![error_command(error, source_element)],
            }
        } else {
            flows
        };

        if selected.is_empty() && !flow_ids.is_empty() {
            tracing::warn!(
                instance_key = instance.instance_key,
                element_id = %source_element.id,
                "no outgoing flow selected, branch stalls"
            );
        }

        let mut next = Vec::with_capacity(selected.len());
        for flow in selected {
            self.export(EngineEvent::Element {
                process_key: instance.process_key(),
                instance_key: instance.instance_key,
                element_id: flow.id.clone(),
                element_name: flow.name.clone(),
                element_type: None,
                intent: ElementIntent::SequenceFlowTaken,
            });
            match process.find_element(&flow.target_ref) {
                Some(target) => next.push(Command::Activity {
                    element: target,
                    origin: Some(source),
                    via_flow: Some(flow.id.clone()),
                }),
                None => next.push(error_command(
                    BpmnError::ElementNotFound(flow.target_ref.clone()),
                    source_element,
                )),
            }
        }
        next
    }

    // ── Element dispatch ──

    fn handle_element(
        &mut self,
        instance: &mut ProcessInstance,
        process: &Process,
        element_idx: ElementIdx,
        origin: Option<ActivityIdx>,
        via_flow: Option<&str>,
    ) -> Vec<Command> {
        let element = process.element(element_idx);
        let step = match element.kind {
            ElementType::StartEvent | ElementType::ExclusiveGateway => {
                self.pass_through(instance, element_idx, origin)
            }
            ElementType::EndEvent => self.end_event(instance, element_idx, origin),
            ElementType::ServiceTask | ElementType::UserTask => {
                self.handle_job(instance, element_idx, origin)
            }
            ElementType::ParallelGateway => {
                self.parallel_gateway(instance, process, element_idx, origin, via_flow)
            }
            ElementType::EventBasedGateway => self.event_based_gateway(instance, element_idx, origin),
            ElementType::IntermediateCatchEvent => self.catch_event(instance, element_idx, origin),
            ElementType::IntermediateThrowEvent => self.throw_event(instance, element_idx, origin),
        };

        let step = match step {
            Ok(step) => step,
            Err(error) => return vec![error_command(error, element)],
        };

        let mut next = step.extra;
        if step.continue_flow {
            self.export_element(instance, element, ElementIntent::Completed);
            if !element.outgoing.is_empty() {
                next.push(Command::FlowTransition {
                    source: step.activity,
                    flow_ids: element.outgoing.clone(),
                });
            }
        }
        next
    }

    fn pass_through(
        &mut self,
        instance: &mut ProcessInstance,
        element: ElementIdx,
        origin: Option<ActivityIdx>,
    ) -> Result<Step, BpmnError> {
        let activity = self.element_activity(instance, element, origin, ActivityState::Completed)?;
        Ok(Step::new(activity, true))
    }

    fn end_event(
        &mut self,
        instance: &mut ProcessInstance,
        element: ElementIdx,
        origin: Option<ActivityIdx>,
    ) -> Result<Step, BpmnError> {
        let activity = self.element_activity(instance, element, origin, ActivityState::Completed)?;
        let definition = Arc::clone(&instance.definition);
        self.export_element(instance, definition.process.element(element), ElementIntent::Completed);
        if instance.state == InstanceState::Completed {
            return Ok(Step::new(activity, false));
        }
        if instance.has_pending_events() {
            tracing::debug!(
                instance_key = instance.instance_key,
                "end event reached with pending events, instance stays active"
            );
        } else {
            instance.state = InstanceState::Completed;
            tracing::info!(instance_key = instance.instance_key, "instance completed");
        }
        Ok(Step::new(activity, false))
    }

    fn parallel_gateway(
        &mut self,
        instance: &mut ProcessInstance,
        process: &Process,
        element_idx: ElementIdx,
        origin: Option<ActivityIdx>,
        via_flow: Option<&str>,
    ) -> Result<Step, BpmnError> {
        let element = process.element(element_idx);
        let activity = match instance.find_active_gateway(element_idx) {
            Some(existing) => existing,
            None => {
                let key = self.keys.next_key()?;
                instance.push_activity(Activity::Gateway(GatewayActivity {
                    key,
                    state: ActivityState::Active,
                    element: element_idx,
                    origin,
                    parallel: true,
                    inbound_completed: Vec::new(),
                }))
            }
        };

        let arrived = via_flow.map(str::to_string).or_else(|| {
            let source = origin.map(|o| process.element(instance.activities[o].element()))?;
            process
                .find_sequence_flow(&source.id, &element.id)
                .map(|f| f.id.clone())
        });

        let Some(gateway) = instance.activities[activity].as_gateway_mut() else {
            return Ok(Step::new(activity, false));
        };
        if let Some(flow_id) = arrived {
            gateway.record_inbound(&flow_id);
        }
        let fire = gateway.parallel && gateway.inbound_complete(&element.incoming);
        if fire {
            instance.activities[activity].advance(ActivityState::Completed);
        }
        Ok(Step::new(activity, fire))
    }

    fn event_based_gateway(
        &mut self,
        instance: &mut ProcessInstance,
        element: ElementIdx,
        origin: Option<ActivityIdx>,
    ) -> Result<Step, BpmnError> {
        let key = self.keys.next_key()?;
        let activity = instance.push_activity(Activity::EventBasedGateway(EventBasedGatewayActivity {
            key,
            state: ActivityState::Completed,
            element,
            origin,
            outbound_completed: None,
        }));
        Ok(Step::new(activity, true))
    }

    fn catch_event(
        &mut self,
        instance: &mut ProcessInstance,
        element_idx: ElementIdx,
        origin: Option<ActivityIdx>,
    ) -> Result<Step, BpmnError> {
        let definition = Arc::clone(&instance.definition);
        let element = definition.process.element(element_idx);
        let mut step = match &element.event_definition {
            Some(EventDefinition::Message { .. }) => {
                self.message_catch(instance, &definition.process, element_idx, origin)?
            }
            Some(EventDefinition::Timer { duration }) => {
                self.timer_catch(instance, element_idx, duration.as_deref(), origin)?
            }
            Some(EventDefinition::Link { .. }) => self.link_catch(instance, element_idx, origin)?,
            None => {
                tracing::warn!(
                    element_id = %element.id,
                    "intermediate catch event without supported event definition"
                );
                let activity =
                    self.element_activity(instance, element_idx, origin, ActivityState::Active)?;
                Step::new(activity, false)
            }
        };

        let race_origin = instance.activities[step.activity].origin();
        if instance.is_event_based_gateway(race_origin) {
            if let Some(gateway) = race_origin {
                step.extra.push(Command::CheckGatewayRaceDone { gateway });
            }
        }
        Ok(step)
    }

    fn throw_event(
        &mut self,
        instance: &mut ProcessInstance,
        element_idx: ElementIdx,
        origin: Option<ActivityIdx>,
    ) -> Result<Step, BpmnError> {
        let definition = Arc::clone(&instance.definition);
        let element = definition.process.element(element_idx);
        match element.link_name() {
            Some(link) => self.link_throw(instance, &definition.process, element_idx, link, origin),
            None => {
                tracing::warn!(
                    element_id = %element.id,
                    "only link intermediate throw events are supported"
                );
                let activity =
                    self.element_activity(instance, element_idx, origin, ActivityState::Active)?;
                Ok(Step::new(activity, false))
            }
        }
    }

    // ── Helpers ──

    fn element_activity(
        &mut self,
        instance: &mut ProcessInstance,
        element: ElementIdx,
        origin: Option<ActivityIdx>,
        state: ActivityState,
    ) -> Result<ActivityIdx, BpmnError> {
        let key = self.keys.next_key()?;
        Ok(instance.push_activity(Activity::Element(ElementActivity {
            key,
            state,
            element,
            origin,
        })))
    }

    fn export(&self, event: EngineEvent) {
        for exporter in self.exporters {
            exporter.export(&event);
        }
    }

    fn export_element(&self, instance: &ProcessInstance, element: &Element, intent: ElementIntent) {
        if self.exporters.is_empty() {
            return;
        }
        self.export(EngineEvent::Element {
            process_key: instance.process_key(),
            instance_key: instance.instance_key,
            element_id: element.id.clone(),
            element_name: element.name.clone(),
            element_type: Some(element.kind),
            intent,
        });
    }

    fn export_instance_end(&self, instance: &ProcessInstance) {
        self.export(EngineEvent::InstanceEnded {
            process_key: instance.process_key(),
            instance_key: instance.instance_key,
            bpmn_process_id: instance.bpmn_process_id().to_string(),
            version: instance.version(),
            state: instance.state,
        });
    }
}

/// First conditional flow that evaluates to true, else the first flow
/// without condition. Empty when neither exists.
fn select_exclusive<'p>(
    flows: &[&'p SequenceFlow],
    instance: &ProcessInstance,
) -> Result<Vec<&'p SequenceFlow>, BpmnError> {
    for flow in flows {
        if let Some(condition) = flow.condition() {
            let taken = evaluate_condition(condition, instance.variables())
                .map_err(|e| BpmnError::expression(&flow.id, &flow.name, e))?;
            if taken {
                return Ok(vec![*flow]);
            }
        }
    }
    Ok(flows
        .iter()
        .find(|f| !f.has_condition())
        .map(|f| vec![*f])
        .unwrap_or_default())
}

fn error_command(error: BpmnError, element: &Element) -> Command {
    let (element_id, element_name) = match &error {
        BpmnError::Expression {
            element_id,
            element_name,
            ..
        } => (element_id.clone(), element_name.clone()),
        _ => (element.id.clone(), element.name.clone()),
    };
    Command::Error {
        error,
        element_id,
        element_name,
    }
}
