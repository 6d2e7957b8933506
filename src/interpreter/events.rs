//! Intermediate catch and throw events, and event-based gateway races.

use super::{Interpreter, Step};
use crate::activity::{
    Activity, ActivityIdx, ActivityState, MessageSubscription, Timer, TimerState,
};
use crate::command::Command;
use crate::error::BpmnError;
use crate::expression::{apply_mappings, propagate_outputs};
use crate::exporter::ElementIntent;
use crate::instance::ProcessInstance;
use crate::model::{Element, ElementIdx, Process};
use crate::timer::{due_at, is_due, parse_duration};
use crate::variables::VariableScope;

impl Interpreter<'_> {
    // ── Message ──

    /// Wait for an unconsumed caught event matching the subscription name.
    pub(super) fn message_catch(
        &mut self,
        instance: &mut ProcessInstance,
        process: &Process,
        element_idx: ElementIdx,
        origin: Option<ActivityIdx>,
    ) -> Result<Step, BpmnError> {
        let element = process.element(element_idx);
        let activity = match instance.find_open_subscription(&element.id) {
            Some(existing) => existing,
            None => {
                let key = self.keys.next_key()?;
                instance.push_activity(Activity::Subscription(MessageSubscription {
                    key,
                    instance_key: instance.instance_key,
                    process_key: instance.process_key(),
                    element_id: element.id.clone(),
                    element: element_idx,
                    name: process.message_name(element),
                    state: ActivityState::Active,
                    created_at: self.clock.now(),
                    origin,
                }))
            }
        };

        let race = instance.activities[activity].origin();
        if instance.race_lost(race, &element.id) {
            instance.activities[activity].advance(ActivityState::Withdrawn);
            return Ok(Step::new(activity, false));
        }

        let Some(name) = instance.activities[activity]
            .as_subscription()
            .map(|s| s.name.clone())
        else {
            return Ok(Step::new(activity, false));
        };
        let Some(event) = instance.find_unconsumed_event(&name) else {
            return Ok(Step::new(activity, false));
        };

        let caught = &mut instance.caught_events[event];
        caught.consumed = true;
        let payload = caught.variables.clone();
        for (name, value) in payload {
            instance.variables.set(name, value);
        }
        if let Err(e) = apply_mappings(&mut instance.variables, &element.outputs) {
            instance.activities[activity].advance(ActivityState::Failed);
            return Err(BpmnError::expression(&element.id, &element.name, e));
        }

        instance.activities[activity].advance(ActivityState::Completed);
        instance.win_race(race, &element.id);
        tracing::debug!(
            instance_key = instance.instance_key,
            element_id = %element.id,
            message = %name,
            "message caught"
        );
        Ok(Step::new(activity, true))
    }

    // ── Timer ──

    /// Schedule a timer on first arrival and fire it once the clock passes
    /// its due date.
    pub(super) fn timer_catch(
        &mut self,
        instance: &mut ProcessInstance,
        element_idx: ElementIdx,
        duration: Option<&str>,
        origin: Option<ActivityIdx>,
    ) -> Result<Step, BpmnError> {
        let definition = std::sync::Arc::clone(&instance.definition);
        let element = definition.process.element(element_idx);

        let activity = match instance.find_created_timer(&element.id) {
            Some(existing) => existing,
            None => self.schedule_timer(instance, element, element_idx, duration, origin)?,
        };

        let race = instance.activities[activity].origin();
        if instance.race_lost(race, &element.id) {
            instance.activities[activity].set_timer_state(TimerState::Cancelled);
            return Ok(Step::new(activity, false));
        }

        let due = instance.activities[activity].as_timer().map(|t| t.due_at);
        match due {
            Some(due) if is_due(self.clock.now(), due) => {
                instance.activities[activity].set_timer_state(TimerState::Triggered);
                instance.win_race(race, &element.id);
                tracing::debug!(
                    instance_key = instance.instance_key,
                    element_id = %element.id,
                    "timer triggered"
                );
                Ok(Step::new(activity, true))
            }
            _ => Ok(Step::new(activity, false)),
        }
    }

    fn schedule_timer(
        &mut self,
        instance: &mut ProcessInstance,
        element: &Element,
        element_idx: ElementIdx,
        duration: Option<&str>,
        origin: Option<ActivityIdx>,
    ) -> Result<ActivityIdx, BpmnError> {
        let text = duration.map(str::trim).unwrap_or_default();
        if text.is_empty() {
            return Err(BpmnError::InvalidTimer {
                element_id: element.id.clone(),
                duration: String::new(),
                reason: "missing timeDuration".into(),
            });
        }
        let parsed = parse_duration(text).map_err(|reason| BpmnError::InvalidTimer {
            element_id: element.id.clone(),
            duration: text.to_string(),
            reason,
        })?;

        let key = self.keys.next_key()?;
        let now = self.clock.now();
        Ok(instance.push_activity(Activity::Timer(Timer {
            key,
            instance_key: instance.instance_key,
            process_key: instance.process_key(),
            element_id: element.id.clone(),
            element: element_idx,
            state: TimerState::Created,
            created_at: now,
            due_at: due_at(now, parsed),
            duration: parsed,
            origin,
        })))
    }

    // ── Link ──

    pub(super) fn link_catch(
        &mut self,
        instance: &mut ProcessInstance,
        element_idx: ElementIdx,
        origin: Option<ActivityIdx>,
    ) -> Result<Step, BpmnError> {
        let definition = std::sync::Arc::clone(&instance.definition);
        let element = definition.process.element(element_idx);
        let activity = self.element_activity(instance, element_idx, origin, ActivityState::Completed)?;
        propagate_element_outputs(instance, element)?;
        Ok(Step::new(activity, true))
    }

    /// Jump to the catch event sharing this throw event's link name.
    pub(super) fn link_throw(
        &mut self,
        instance: &mut ProcessInstance,
        process: &Process,
        element_idx: ElementIdx,
        link: &str,
        origin: Option<ActivityIdx>,
    ) -> Result<Step, BpmnError> {
        let element = process.element(element_idx);
        let missing = || BpmnError::MissingLink {
            element_id: element.id.clone(),
            link: link.to_string(),
        };
        if link.trim().is_empty() {
            return Err(missing());
        }
        let catch = process.find_link_catch(link).ok_or_else(missing)?;

        let activity = self.element_activity(instance, element_idx, origin, ActivityState::Completed)?;
        propagate_element_outputs(instance, element)?;
        self.export_element(instance, element, ElementIntent::Completed);

        let mut step = Step::new(activity, false);
        step.extra.push(Command::Activity {
            element: catch,
            origin: Some(activity),
            via_flow: None,
        });
        Ok(step)
    }

    // ── Event-based gateway ──

    /// Withdraw every still-waiting branch of a gateway whose race is won.
    pub(super) fn check_gateway_race_done(
        &mut self,
        instance: &mut ProcessInstance,
        gateway: ActivityIdx,
    ) {
        let winner = instance
            .activities
            .get(gateway)
            .and_then(Activity::as_event_based_gateway)
            .and_then(|g| g.outbound_completed.clone());
        let Some(winner) = winner else {
            return;
        };

        let instance_key = instance.instance_key;
        for activity in instance
            .activities
            .iter_mut()
            .filter(|a| a.origin() == Some(gateway))
        {
            let closed = match activity {
                Activity::Subscription(_) => activity.advance(ActivityState::Withdrawn),
                Activity::Timer(_) => activity.set_timer_state(TimerState::Cancelled),
                _ => false,
            };
            if closed {
                tracing::debug!(
                    instance_key,
                    key = activity.key(),
                    kind = activity.kind_name(),
                    %winner,
                    "losing branch withdrawn"
                );
            }
        }
    }
}

/// Write an event's output mappings (or all variables without mappings)
/// back to the instance.
fn propagate_element_outputs(
    instance: &mut ProcessInstance,
    element: &Element,
) -> Result<(), BpmnError> {
    let mut scope = VariableScope::child_of(instance.variables.variables_mut());
    propagate_outputs(&mut scope, &element.outputs)
        .map_err(|e| BpmnError::expression(&element.id, &element.name, e))
}
