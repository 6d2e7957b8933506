//! Commands processed by the interpreter loop.

use crate::activity::ActivityIdx;
use crate::error::BpmnError;
use crate::model::ElementIdx;

#[derive(Debug)]
pub(crate) enum Command {
    /// Follow the outgoing flows of a completed activity. Exclusive gateways
    /// narrow `flow_ids` to a single flow at dispatch time.
    FlowTransition {
        source: ActivityIdx,
        flow_ids: Vec<String>,
    },
    /// Reach an element, optionally through the flow `via_flow`.
    Activity {
        element: ElementIdx,
        origin: Option<ActivityIdx>,
        via_flow: Option<String>,
    },
    /// Re-examine an open job, timer or subscription.
    ContinueActivity {
        activity: ActivityIdx,
        origin: Option<ActivityIdx>,
    },
    Error {
        error: BpmnError,
        element_id: String,
        element_name: String,
    },
    /// Withdraw the losing branches of a resolved event-based gateway.
    CheckGatewayRaceDone { gateway: ActivityIdx },
}

impl Command {
    pub(crate) fn is_error(&self) -> bool {
        matches!(self, Command::Error { .. })
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::FlowTransition { .. } => "flow-transition",
            Command::Activity { .. } => "activity",
            Command::ContinueActivity { .. } => "continue-activity",
            Command::Error { .. } => "error",
            Command::CheckGatewayRaceDone { .. } => "check-gateway-race-done",
        }
    }
}
