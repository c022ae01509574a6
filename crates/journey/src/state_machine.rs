use serde::{Deserialize, Serialize};

use engage_core::{EngageError, EngageResult};

use crate::types::InstanceState;

/// Coarse phase of an instance, without node or deadline payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    NotEntered,
    Active,
    Waiting,
    Completed,
    Cancelled,
}

impl From<&InstanceState> for InstancePhase {
    fn from(state: &InstanceState) -> Self {
        match state {
            InstanceState::NotEntered => InstancePhase::NotEntered,
            InstanceState::Active { .. } => InstancePhase::Active,
            InstanceState::Waiting { .. } => InstancePhase::Waiting,
            InstanceState::Completed => InstancePhase::Completed,
            InstanceState::Cancelled { .. } => InstancePhase::Cancelled,
        }
    }
}

/// Describes a single valid state transition for a journey instance.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: InstancePhase,
    pub to: InstancePhase,
    pub trigger: &'static str,
}

/// Guards journey-instance lifecycle by enforcing a finite set of valid
/// state transitions. `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone)]
pub struct JourneyStateMachine {
    transitions: Vec<StateTransition>,
}

impl JourneyStateMachine {
    pub fn new() -> Self {
        use InstancePhase::*;
        let table = [
            (NotEntered, Active, "segment_entered"),
            (NotEntered, Cancelled, "cancelled_before_start"),
            // Active ->
            (Active, Active, "node_completed"),
            (Active, Waiting, "delay_started"),
            (Active, Completed, "exit_reached"),
            (Active, Cancelled, "cancelled"),
            // Waiting ->
            (Waiting, Active, "wait_resolved"),
            (Waiting, Completed, "wait_timed_out"),
            (Waiting, Cancelled, "cancelled_while_waiting"),
        ];
        Self {
            transitions: table
                .into_iter()
                .map(|(from, to, trigger)| StateTransition { from, to, trigger })
                .collect(),
        }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: InstancePhase, to: InstancePhase) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Checks a concrete state change against the table.
    pub fn ensure(&self, from: &InstanceState, to: &InstanceState) -> EngageResult<()> {
        let (from_phase, to_phase) = (InstancePhase::from(from), InstancePhase::from(to));
        if self.can_transition(from_phase, to_phase) {
            Ok(())
        } else {
            Err(EngageError::InvariantViolation(format!(
                "invalid instance transition from {:?} to {:?}",
                from_phase, to_phase
            )))
        }
    }
}

impl Default for JourneyStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
