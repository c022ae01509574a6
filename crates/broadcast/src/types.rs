use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use engage_journey::ChannelType;
use engage_segmentation::SegmentNode;

/// Broadcast lifecycle. Transitions only move forward:
/// `Draft → InProgress → Completed | Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStatus {
    Draft,
    InProgress,
    Completed,
    Cancelled,
}

impl BroadcastStatus {
    pub fn can_transition_to(self, next: BroadcastStatus) -> bool {
        matches!(
            (self, next),
            (BroadcastStatus::Draft, BroadcastStatus::InProgress)
                | (BroadcastStatus::InProgress, BroadcastStatus::Completed)
                | (BroadcastStatus::InProgress, BroadcastStatus::Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BroadcastStatus::Completed | BroadcastStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplateDefinition {
    pub channel: ChannelType,
    /// Defaults to the synthesized resource name.
    #[serde(default)]
    pub template_id: Option<String>,
}

/// Create-or-update request; the broadcast id is derived from
/// `(workspace_id, name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertBroadcast {
    pub workspace_id: Uuid,
    pub name: String,
    /// `None` targets every user of the workspace.
    #[serde(default)]
    pub segment_definition: Option<SegmentNode>,
    pub message_template: MessageTemplateDefinition,
    #[serde(default)]
    pub subscription_group_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub status: BroadcastStatus,
    pub segment_definition: Option<SegmentNode>,
    pub message_template: MessageTemplateDefinition,
    pub subscription_group_id: Option<Uuid>,
    /// Synthesized segment and journey, both named `Broadcast - {id}`.
    pub segment_id: Uuid,
    pub journey_id: Uuid,
    pub triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Broadcast {
    pub fn resource_name(id: Uuid) -> String {
        format!("Broadcast - {}", id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TriggerOutcome {
    /// This call started the broadcast; `audience` users entered its journey.
    Triggered { audience: usize },
    /// This call finished the audience entry of a broadcast whose earlier
    /// trigger failed part-way; `audience` counts every user entered.
    Resumed { audience: usize },
    /// The broadcast had already been started. Not an error.
    AlreadyTriggered,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_only_moves_forward() {
        use BroadcastStatus::*;
        assert!(Draft.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Cancelled));
        assert!(!InProgress.can_transition_to(Draft));
        assert!(!InProgress.can_transition_to(InProgress));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(InProgress));
        assert!(Completed.is_terminal() && Cancelled.is_terminal());
    }
}
