use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Index of a node in a journey's node arena.
pub type NodeId = usize;

/// A journey definition: a graph of nodes entered on segment entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journey {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub status: JourneyStatus,
    pub definition: JourneyDefinition,
    #[serde(default)]
    pub re_entry: ReEntryPolicy,
    /// Whether a user may run the journey again after a finished run.
    #[serde(default = "default_can_run_multiple")]
    pub can_run_multiple: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u32,
}

fn default_can_run_multiple() -> bool {
    true
}

/// Lifecycle status of a journey definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyStatus {
    Draft,
    Published,
    Paused,
    Archived,
}

/// What a repeated entry does while the user's instance is still live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReEntryPolicy {
    /// Fold the entry into the live instance.
    #[default]
    Coalesce,
    /// Cancel the live instance and start a fresh run.
    Restart,
}

/// Node arena; children are referenced by index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JourneyDefinition {
    pub nodes: Vec<JourneyNode>,
}

impl JourneyDefinition {
    pub fn new(nodes: Vec<JourneyNode>) -> Self {
        Self { nodes }
    }

    pub fn node(&self, id: NodeId) -> Option<&JourneyNode> {
        self.nodes.get(id)
    }

    /// Index of the first entry node.
    pub fn entry(&self) -> Option<(NodeId, &JourneyNode)> {
        self.nodes
            .iter()
            .enumerate()
            .find(|(_, node)| matches!(node, JourneyNode::Entry { .. }))
    }

    pub fn entry_segment(&self) -> Option<Uuid> {
        match self.entry() {
            Some((_, JourneyNode::Entry { segment_id, .. })) => Some(*segment_id),
            _ => None,
        }
    }

    /// Every segment referenced by entry, delay or split nodes.
    pub fn referenced_segments(&self) -> BTreeSet<Uuid> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                JourneyNode::Entry { segment_id, .. }
                | JourneyNode::SegmentSplit { segment_id, .. }
                | JourneyNode::Delay {
                    variant: DelayVariant::UntilSegmentEnter { segment_id, .. },
                    ..
                } => Some(*segment_id),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum JourneyNode {
    Entry {
        segment_id: Uuid,
        child: NodeId,
    },
    Message {
        channel: ChannelType,
        template_id: String,
        child: NodeId,
    },
    Delay {
        variant: DelayVariant,
        child: NodeId,
    },
    SegmentSplit {
        segment_id: Uuid,
        true_child: NodeId,
        false_child: NodeId,
    },
    Exit,
}

impl JourneyNode {
    pub fn children(&self) -> Vec<NodeId> {
        match self {
            JourneyNode::Entry { child, .. } | JourneyNode::Message { child, .. } => vec![*child],
            JourneyNode::Delay { variant, child } => match variant {
                DelayVariant::UntilSegmentEnter {
                    on_timeout: TimeoutAction::Continue { child: timeout_child },
                    ..
                } => vec![*child, *timeout_child],
                _ => vec![*child],
            },
            JourneyNode::SegmentSplit {
                true_child,
                false_child,
                ..
            } => vec![*true_child, *false_child],
            JourneyNode::Exit => Vec::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JourneyNode::Entry { .. } => "entry",
            JourneyNode::Message { .. } => "message",
            JourneyNode::Delay { .. } => "delay",
            JourneyNode::SegmentSplit { .. } => "segment_split",
            JourneyNode::Exit => "exit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DelayVariant {
    Duration {
        millis: u64,
    },
    /// Waits for the user to enter `segment_id`; `child` is the segment
    /// branch, `on_timeout` decides what happens when the timeout wins.
    UntilSegmentEnter {
        segment_id: Uuid,
        #[serde(default)]
        timeout_millis: Option<u64>,
        #[serde(default)]
        on_timeout: TimeoutAction,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TimeoutAction {
    #[default]
    Exit,
    Continue {
        child: NodeId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Email,
    Sms,
    MobilePush,
    Webhook,
}

/// Run state of a journey instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum InstanceState {
    NotEntered,
    Active {
        node: NodeId,
    },
    Waiting {
        node: NodeId,
        deadline: Option<DateTime<Utc>>,
    },
    Completed,
    Cancelled {
        reason: String,
    },
}

impl InstanceState {
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Completed | InstanceState::Cancelled { .. })
    }
}

/// Latest membership signal seen for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSignal {
    pub in_segment: bool,
    pub version: i64,
}

/// Durable state of one `(journey, user)` run, checkpointed to the host
/// after every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyInstance {
    pub id: Uuid,
    pub journey_id: Uuid,
    pub workspace_id: Uuid,
    pub user_id: String,
    /// Incremented on every new run for the same user.
    pub generation: u32,
    pub state: InstanceState,
    /// Dedupe keys of messages already accepted by the transport.
    pub sent_message_ids: BTreeSet<String>,
    pub segments: BTreeMap<Uuid, SegmentSignal>,
    /// Signal version already seen when the current segment wait began.
    #[serde(default)]
    pub wait_baseline: Option<i64>,
    pub entered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<StepRecord>,
}

impl JourneyInstance {
    /// Records a signal unless it is older than one already seen.
    pub fn observe(&mut self, segment_id: Uuid, signal: SegmentSignal) -> bool {
        match self.segments.get(&segment_id) {
            Some(seen) if seen.version >= signal.version => false,
            _ => {
                self.segments.insert(segment_id, signal);
                true
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub node: NodeId,
    pub kind: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Aggregate statistics for a journey.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyStats {
    pub journey_id: Uuid,
    pub total_entered: u64,
    pub active: u64,
    pub waiting: u64,
    pub completed: u64,
    pub cancelled: u64,
}
