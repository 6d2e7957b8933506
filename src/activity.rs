//! Runtime activities: the stateful occurrences of process elements.
//!
//! Every activity lives in its instance's arena and is addressed by
//! [`ActivityIdx`]. The element reference is an index into the definition's
//! element table; `origin` points at the activity that spawned this one.

use crate::model::ElementIdx;
use crate::Key;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ─── Scalar aliases ───────────────────────────────────────────

/// Index into an instance's activity arena.
pub type ActivityIdx = usize;

// ─── States ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityState {
    Ready,
    Active,
    Completed,
    Failed,
    Withdrawn,
}

impl ActivityState {
    fn rank(self) -> u8 {
        match self {
            Self::Ready => 0,
            Self::Active => 1,
            Self::Completed | Self::Failed | Self::Withdrawn => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Forward-only transition check.
    pub fn can_advance_to(self, next: Self) -> bool {
        next.rank() > self.rank()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerState {
    Created,
    Triggered,
    Cancelled,
}

impl TimerState {
    pub fn as_activity_state(self) -> ActivityState {
        match self {
            Self::Created => ActivityState::Active,
            Self::Triggered => ActivityState::Completed,
            Self::Cancelled => ActivityState::Withdrawn,
        }
    }
}

// ─── Variants ─────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct ElementActivity {
    pub key: Key,
    pub state: ActivityState,
    pub element: ElementIdx,
    pub origin: Option<ActivityIdx>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GatewayActivity {
    pub key: Key,
    pub state: ActivityState,
    pub element: ElementIdx,
    pub origin: Option<ActivityIdx>,
    pub parallel: bool,
    /// Inbound flow ids seen so far. Append-only, no duplicates.
    pub inbound_completed: Vec<String>,
}

impl GatewayActivity {
    /// Record an arriving flow. Returns false for a duplicate arrival.
    pub fn record_inbound(&mut self, flow_id: &str) -> bool {
        if self.inbound_completed.iter().any(|f| f == flow_id) {
            return false;
        }
        self.inbound_completed.push(flow_id.to_string());
        true
    }

    /// True once every declared incoming flow has arrived.
    pub fn inbound_complete(&self, declared: &[String]) -> bool {
        declared
            .iter()
            .all(|id| self.inbound_completed.iter().any(|f| f == id))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EventBasedGatewayActivity {
    pub key: Key,
    pub state: ActivityState,
    pub element: ElementIdx,
    pub origin: Option<ActivityIdx>,
    /// Element id of the branch that won the race.
    pub outbound_completed: Option<String>,
}

/// Runtime occurrence of a service or user task.
#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    pub key: Key,
    pub instance_key: Key,
    pub element_id: String,
    pub element: ElementIdx,
    pub state: ActivityState,
    pub created_at: DateTime<Utc>,
    pub origin: Option<ActivityIdx>,
    /// Reason passed to the last `fail` call.
    pub failure: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Timer {
    pub key: Key,
    pub instance_key: Key,
    pub process_key: Key,
    pub element_id: String,
    pub element: ElementIdx,
    pub state: TimerState,
    pub created_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub duration: Duration,
    pub origin: Option<ActivityIdx>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MessageSubscription {
    pub key: Key,
    pub instance_key: Key,
    pub process_key: Key,
    pub element_id: String,
    pub element: ElementIdx,
    pub name: String,
    pub state: ActivityState,
    pub created_at: DateTime<Utc>,
    pub origin: Option<ActivityIdx>,
}

/// Closed set of runtime activity kinds.
#[derive(Clone, Debug, PartialEq)]
pub enum Activity {
    Element(ElementActivity),
    Gateway(GatewayActivity),
    EventBasedGateway(EventBasedGatewayActivity),
    Job(Job),
    Timer(Timer),
    Subscription(MessageSubscription),
}

impl Activity {
    pub fn key(&self) -> Key {
        match self {
            Activity::Element(a) => a.key,
            Activity::Gateway(a) => a.key,
            Activity::EventBasedGateway(a) => a.key,
            Activity::Job(a) => a.key,
            Activity::Timer(a) => a.key,
            Activity::Subscription(a) => a.key,
        }
    }

    pub fn element(&self) -> ElementIdx {
        match self {
            Activity::Element(a) => a.element,
            Activity::Gateway(a) => a.element,
            Activity::EventBasedGateway(a) => a.element,
            Activity::Job(a) => a.element,
            Activity::Timer(a) => a.element,
            Activity::Subscription(a) => a.element,
        }
    }

    pub fn origin(&self) -> Option<ActivityIdx> {
        match self {
            Activity::Element(a) => a.origin,
            Activity::Gateway(a) => a.origin,
            Activity::EventBasedGateway(a) => a.origin,
            Activity::Job(a) => a.origin,
            Activity::Timer(a) => a.origin,
            Activity::Subscription(a) => a.origin,
        }
    }

    /// Lifecycle state; timers map onto the shared state set.
    pub fn state(&self) -> ActivityState {
        match self {
            Activity::Element(a) => a.state,
            Activity::Gateway(a) => a.state,
            Activity::EventBasedGateway(a) => a.state,
            Activity::Job(a) => a.state,
            Activity::Timer(a) => a.state.as_activity_state(),
            Activity::Subscription(a) => a.state,
        }
    }

    /// Move to `next` if that is a forward transition. Timers use
    /// [`Activity::set_timer_state`] instead.
    pub fn advance(&mut self, next: ActivityState) -> bool {
        let slot = match self {
            Activity::Element(a) => &mut a.state,
            Activity::Gateway(a) => &mut a.state,
            Activity::EventBasedGateway(a) => &mut a.state,
            Activity::Job(a) => &mut a.state,
            Activity::Subscription(a) => &mut a.state,
            Activity::Timer(_) => return false,
        };
        if slot.can_advance_to(next) {
            *slot = next;
            true
        } else {
            false
        }
    }

    /// Move a timer out of `Created`. Any other transition is refused.
    pub fn set_timer_state(&mut self, next: TimerState) -> bool {
        match self {
            Activity::Timer(t) if t.state == TimerState::Created && next != TimerState::Created => {
                t.state = next;
                true
            }
            _ => false,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Activity::Element(_) => "element",
            Activity::Gateway(_) => "gateway",
            Activity::EventBasedGateway(_) => "event-based-gateway",
            Activity::Job(_) => "job",
            Activity::Timer(_) => "timer",
            Activity::Subscription(_) => "message-subscription",
        }
    }

    pub fn as_job(&self) -> Option<&Job> {
        match self {
            Activity::Job(j) => Some(j),
            _ => None,
        }
    }

    pub fn as_timer(&self) -> Option<&Timer> {
        match self {
            Activity::Timer(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_subscription(&self) -> Option<&MessageSubscription> {
        match self {
            Activity::Subscription(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_gateway_mut(&mut self) -> Option<&mut GatewayActivity> {
        match self {
            Activity::Gateway(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_event_based_gateway(&self) -> Option<&EventBasedGatewayActivity> {
        match self {
            Activity::EventBasedGateway(g) => Some(g),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> GatewayActivity {
        GatewayActivity {
            key: 1,
            state: ActivityState::Active,
            element: 0,
            origin: None,
            parallel: true,
            inbound_completed: Vec::new(),
        }
    }

    #[test]
    fn test_state_transitions_are_forward_only() {
        let mut activity = Activity::Gateway(gateway());
        assert!(!activity.advance(ActivityState::Ready));
        assert!(activity.advance(ActivityState::Completed));
        assert!(!activity.advance(ActivityState::Active));
        assert!(!activity.advance(ActivityState::Failed));
        assert_eq!(activity.state(), ActivityState::Completed);
    }

    #[test]
    fn test_gateway_inbound_set_dedupes() {
        let mut gw = gateway();
        let declared = vec!["a".to_string(), "b".to_string()];
        assert!(gw.record_inbound("a"));
        assert!(!gw.record_inbound("a"));
        assert!(!gw.inbound_complete(&declared));
        assert!(gw.record_inbound("b"));
        assert!(gw.inbound_complete(&declared));
        assert_eq!(gw.inbound_completed, declared);
    }

    #[test]
    fn test_timer_state_leaves_created_once() {
        let now = Utc::now();
        let mut timer = Activity::Timer(Timer {
            key: 5,
            instance_key: 1,
            process_key: 2,
            element_id: "t".into(),
            element: 3,
            state: TimerState::Created,
            created_at: now,
            due_at: now,
            duration: Duration::zero(),
            origin: Some(0),
        });
        assert_eq!(timer.state(), ActivityState::Active);
        assert!(!timer.advance(ActivityState::Completed));
        assert!(timer.set_timer_state(TimerState::Cancelled));
        assert!(!timer.set_timer_state(TimerState::Triggered));
        assert_eq!(timer.state(), ActivityState::Withdrawn);
        assert_eq!(timer.origin(), Some(0));
        assert_eq!(timer.kind_name(), "timer");
    }
}
