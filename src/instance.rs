//! Process instances and their activity arenas.

use crate::activity::{
    Activity, ActivityIdx, ActivityState, Job, MessageSubscription, Timer, TimerState,
};
use crate::model::{ElementIdx, ProcessDefinition};
use crate::variables::{VariableScope, Variables};
use crate::Key;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Ready,
    Active,
    Completed,
    Failed,
}

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A named external signal recorded against an instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaughtEvent {
    pub name: String,
    pub caught_at: DateTime<Utc>,
    pub variables: Variables,
    pub consumed: bool,
}

#[derive(Clone, Debug)]
pub struct ProcessInstance {
    pub(crate) instance_key: Key,
    pub(crate) definition: Arc<ProcessDefinition>,
    pub(crate) variables: VariableScope<'static>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) state: InstanceState,
    pub(crate) caught_events: Vec<CaughtEvent>,
    pub(crate) activities: Vec<Activity>,
}

impl ProcessInstance {
    pub(crate) fn new(
        instance_key: Key,
        definition: Arc<ProcessDefinition>,
        variables: Variables,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_key,
            definition,
            variables: VariableScope::new(variables),
            created_at,
            state: InstanceState::Ready,
            caught_events: Vec::new(),
            activities: Vec::new(),
        }
    }

    // ── Identity ──

    pub fn key(&self) -> Key {
        self.instance_key
    }

    pub fn definition(&self) -> &Arc<ProcessDefinition> {
        &self.definition
    }

    pub fn process_key(&self) -> Key {
        self.definition.process_key
    }

    pub fn bpmn_process_id(&self) -> &str {
        &self.definition.bpmn_process_id
    }

    pub fn version(&self) -> i32 {
        self.definition.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    // ── Variables ──

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> &Variables {
        self.variables.variables()
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.variables.set(name, value.into());
    }

    // ── Events ──

    pub fn caught_events(&self) -> &[CaughtEvent] {
        &self.caught_events
    }

    pub(crate) fn record_event(&mut self, event: CaughtEvent) {
        self.caught_events.push(event);
    }

    /// First unconsumed caught event named `name`.
    pub(crate) fn find_unconsumed_event(&self, name: &str) -> Option<usize> {
        self.caught_events
            .iter()
            .position(|e| !e.consumed && e.name == name)
    }

    // ── Activities ──

    pub fn activities(&self) -> &[Activity] {
        &self.activities
    }

    pub(crate) fn push_activity(&mut self, activity: Activity) -> ActivityIdx {
        self.activities.push(activity);
        self.activities.len() - 1
    }

    pub fn find_activity_by_key(&self, key: Key) -> Option<ActivityIdx> {
        self.activities.iter().position(|a| a.key() == key)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.activities.iter().filter_map(Activity::as_job)
    }

    pub fn timers(&self) -> impl Iterator<Item = &Timer> {
        self.activities.iter().filter_map(Activity::as_timer)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &MessageSubscription> {
        self.activities.iter().filter_map(Activity::as_subscription)
    }

    /// Job for `element_id` that has not reached a terminal state.
    pub(crate) fn find_open_job(&self, element_id: &str) -> Option<ActivityIdx> {
        self.activities.iter().position(|a| {
            matches!(a, Activity::Job(j) if j.element_id == element_id && !j.state.is_terminal())
        })
    }

    /// Subscription for `element_id` still in `Ready` or `Active`.
    pub(crate) fn find_open_subscription(&self, element_id: &str) -> Option<ActivityIdx> {
        self.activities.iter().position(|a| {
            matches!(a, Activity::Subscription(s) if s.element_id == element_id && !s.state.is_terminal())
        })
    }

    pub(crate) fn find_created_timer(&self, element_id: &str) -> Option<ActivityIdx> {
        self.activities.iter().position(|a| {
            matches!(a, Activity::Timer(t) if t.element_id == element_id && t.state == TimerState::Created)
        })
    }

    /// The still-active parallel gateway activity for `element`.
    pub(crate) fn find_active_gateway(&self, element: ElementIdx) -> Option<ActivityIdx> {
        self.activities.iter().position(|a| {
            matches!(a, Activity::Gateway(g) if g.element == element && g.state == ActivityState::Active)
        })
    }

    /// Activities a resumed run re-examines, in seeding order: active jobs,
    /// active subscriptions, created timers.
    pub(crate) fn continuations(&self) -> Vec<ActivityIdx> {
        let jobs = self
            .activities
            .iter()
            .enumerate()
            .filter(|(_, a)| matches!(a, Activity::Job(j) if j.state == ActivityState::Active));
        let subscriptions = self.activities.iter().enumerate().filter(|(_, a)| {
            matches!(a, Activity::Subscription(s) if s.state == ActivityState::Active)
        });
        let timers = self
            .activities
            .iter()
            .enumerate()
            .filter(|(_, a)| matches!(a, Activity::Timer(t) if t.state == TimerState::Created));
        jobs.chain(subscriptions)
            .chain(timers)
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Whether a subscription is still waiting or a timer has not fired.
    pub(crate) fn has_pending_events(&self) -> bool {
        self.activities.iter().any(|a| match a {
            Activity::Subscription(s) => {
                matches!(s.state, ActivityState::Ready | ActivityState::Active)
            }
            Activity::Timer(t) => t.state == TimerState::Created,
            _ => false,
        })
    }

    /// True when `origin` is an event-based gateway whose race was already
    /// won by a branch other than `element_id`.
    pub(crate) fn race_lost(&self, origin: Option<ActivityIdx>, element_id: &str) -> bool {
        origin
            .and_then(|idx| self.activities.get(idx))
            .and_then(Activity::as_event_based_gateway)
            .and_then(|g| g.outbound_completed.as_deref())
            .is_some_and(|winner| winner != element_id)
    }

    /// Record `element_id` as the winning branch of an event-based gateway.
    pub(crate) fn win_race(&mut self, origin: Option<ActivityIdx>, element_id: &str) {
        if let Some(Activity::EventBasedGateway(g)) = origin.and_then(|idx| self.activities.get_mut(idx)) {
            if g.outbound_completed.is_none() {
                g.outbound_completed = Some(element_id.to_string());
            }
        }
    }

    pub(crate) fn is_event_based_gateway(&self, idx: Option<ActivityIdx>) -> bool {
        idx.and_then(|i| self.activities.get(i))
            .is_some_and(|a| matches!(a, Activity::EventBasedGateway(_)))
    }
}
