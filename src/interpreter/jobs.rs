//! Service and user task execution.

use super::{Interpreter, Step};
use crate::activity::{Activity, ActivityIdx, ActivityState, Job};
use crate::error::{BpmnError, ExpressionError};
use crate::expression::{apply_mappings, propagate_outputs};
use crate::handler::{ActivatedJob, JobContext, JobOutcome};
use crate::instance::{InstanceState, ProcessInstance};
use crate::model::ElementIdx;
use crate::variables::VariableScope;
use std::sync::Arc;

impl Interpreter<'_> {
    /// Open (or reuse) the job for a task element and hand it to the matching
    /// handler. The task only continues once the handler completes it.
    pub(super) fn handle_job(
        &mut self,
        instance: &mut ProcessInstance,
        element_idx: ElementIdx,
        origin: Option<ActivityIdx>,
    ) -> Result<Step, BpmnError> {
        let definition = Arc::clone(&instance.definition);
        let element = definition.process.element(element_idx);

        let activity = match instance.find_open_job(&element.id) {
            Some(existing) => existing,
            None => {
                let key = self.keys.next_key()?;
                instance.push_activity(Activity::Job(Job {
                    key,
                    instance_key: instance.instance_key,
                    element_id: element.id.clone(),
                    element: element_idx,
                    state: ActivityState::Active,
                    created_at: self.clock.now(),
                    origin,
                    failure: None,
                }))
            }
        };

        let Some(handler) = self.handlers.find_mut(element) else {
            tracing::debug!(
                instance_key = instance.instance_key,
                element_id = %element.id,
                "no task handler registered, job stays active"
            );
            return Ok(Step::new(activity, false));
        };

        let Some(job) = instance.activities[activity].as_job() else {
            return Ok(Step::new(activity, false));
        };
        let context = JobContext {
            key: job.key,
            instance_key: instance.instance_key,
            process_key: definition.process_key,
            bpmn_process_id: definition.bpmn_process_id.clone(),
            process_version: definition.version,
            element_id: element.id.clone(),
            element_name: element.name.clone(),
            task_type: element.task_type.clone(),
            created_at: job.created_at,
        };

        let (outcome, mapped): (Option<JobOutcome>, Result<(), ExpressionError>) = {
            let mut scope = VariableScope::child_of(instance.variables.variables_mut());
            match apply_mappings(&mut scope, &element.inputs) {
                Err(e) => (None, Err(e)),
                Ok(()) => {
                    let mut activated = ActivatedJob::new(context, scope);
                    handler(&mut activated);
                    let (mut scope, outcome) = activated.into_parts();
                    let mapped = match outcome {
                        Some(JobOutcome::Completed) => {
                            propagate_outputs(&mut scope, &element.outputs)
                        }
                        _ => Ok(()),
                    };
                    (outcome, mapped)
                }
            }
        };

        if let Err(e) = mapped {
            fail_job(instance, activity, e.to_string());
            instance.state = InstanceState::Failed;
            return Err(BpmnError::expression(&element.id, &element.name, e));
        }

        match outcome {
            Some(JobOutcome::Completed) => {
                instance.activities[activity].advance(ActivityState::Completed);
                Ok(Step::new(activity, true))
            }
            Some(JobOutcome::Failed(reason)) => {
                tracing::warn!(
                    instance_key = instance.instance_key,
                    element_id = %element.id,
                    %reason,
                    "job failed"
                );
                fail_job(instance, activity, reason);
                Ok(Step::new(activity, false))
            }
            None => Ok(Step::new(activity, false)),
        }
    }
}

fn fail_job(instance: &mut ProcessInstance, activity: ActivityIdx, reason: String) {
    let slot = &mut instance.activities[activity];
    slot.advance(ActivityState::Failed);
    if let Activity::Job(job) = slot {
        job.failure = Some(reason);
    }
}
