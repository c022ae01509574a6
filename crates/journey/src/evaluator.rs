use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use engage_core::ids::digest_hex;
use engage_core::{EngageError, EngageResult};
use engage_segmentation::predicates::check_window;

use crate::types::{
    ChannelType, DelayVariant, JourneyDefinition, JourneyInstance, JourneyNode, NodeId,
    TimeoutAction,
};

/// Result of evaluating a single journey node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepResult {
    Transition {
        next: NodeId,
    },
    Send {
        node: NodeId,
        channel: ChannelType,
        template_id: String,
        next: NodeId,
    },
    Wait {
        node: NodeId,
        deadline: Option<DateTime<Utc>>,
    },
    Complete,
}

/// Decides what an instance does at a node. Pure: current membership comes
/// in through `membership`, sends and checkpoints are left to the engine.
#[derive(Debug, Clone, Default)]
pub struct JourneyEvaluator;

impl JourneyEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate_step(
        &self,
        definition: &JourneyDefinition,
        node_id: NodeId,
        now: DateTime<Utc>,
        membership: &dyn Fn(Uuid) -> EngageResult<bool>,
    ) -> EngageResult<StepResult> {
        let node = node_at(definition, node_id)?;
        debug!(node = node_id, kind = node.kind(), "Evaluating journey node");

        Ok(match node {
            JourneyNode::Entry { child, .. } => StepResult::Transition { next: *child },
            JourneyNode::Message {
                channel,
                template_id,
                child,
            } => StepResult::Send {
                node: node_id,
                channel: *channel,
                template_id: template_id.clone(),
                next: *child,
            },
            JourneyNode::Delay {
                variant: DelayVariant::Duration { millis },
                ..
            } => StepResult::Wait {
                node: node_id,
                deadline: Some(deadline_after(now, *millis)?),
            },
            JourneyNode::Delay {
                variant:
                    DelayVariant::UntilSegmentEnter {
                        segment_id,
                        timeout_millis,
                        ..
                    },
                child,
            } => {
                if membership(*segment_id)? {
                    StepResult::Transition { next: *child }
                } else {
                    StepResult::Wait {
                        node: node_id,
                        deadline: timeout_millis
                            .map(|t| deadline_after(now, t))
                            .transpose()?,
                    }
                }
            }
            JourneyNode::SegmentSplit {
                segment_id,
                true_child,
                false_child,
            } => StepResult::Transition {
                next: if membership(*segment_id)? {
                    *true_child
                } else {
                    *false_child
                },
            },
            JourneyNode::Exit => StepResult::Complete,
        })
    }

    /// Resolves a waiting instance, or `None` if it should keep waiting.
    ///
    /// A segment-enter wait takes the segment branch when a membership
    /// signal newer than the wait's baseline and not later than the deadline
    /// has been observed. Outcomes depend on signal versions rather than on
    /// arrival order, so the segment and timeout branches exclude each other.
    pub fn resolve_wait(
        &self,
        definition: &JourneyDefinition,
        node_id: NodeId,
        deadline: Option<DateTime<Utc>>,
        instance: &JourneyInstance,
        now: DateTime<Utc>,
    ) -> EngageResult<Option<StepResult>> {
        let expired = deadline.is_some_and(|d| d <= now);
        match node_at(definition, node_id)? {
            JourneyNode::Delay {
                variant: DelayVariant::Duration { .. },
                child,
            } => Ok(expired.then_some(StepResult::Transition { next: *child })),
            JourneyNode::Delay {
                variant:
                    DelayVariant::UntilSegmentEnter {
                        segment_id,
                        on_timeout,
                        ..
                    },
                child,
            } => {
                let baseline = instance.wait_baseline.unwrap_or(i64::MIN);
                let entered = instance.segments.get(segment_id).is_some_and(|signal| {
                    signal.in_segment
                        && signal.version > baseline
                        && deadline.map_or(true, |d| signal.version <= d.timestamp_millis())
                });
                if entered {
                    return Ok(Some(StepResult::Transition { next: *child }));
                }
                if !expired {
                    return Ok(None);
                }
                Ok(Some(match on_timeout {
                    TimeoutAction::Exit => StepResult::Complete,
                    TimeoutAction::Continue { child } => StepResult::Transition { next: *child },
                }))
            }
            other => Err(EngageError::InvariantViolation(format!(
                "node {} ({}) cannot wait",
                node_id,
                other.kind()
            ))),
        }
    }
}

/// Dedupe key of the message sent at `node` by this run of the instance.
pub fn message_id(instance: &JourneyInstance, node: NodeId) -> String {
    digest_hex(&[
        &instance.id.to_string(),
        &node.to_string(),
        &instance.generation.to_string(),
    ])
}

fn node_at(definition: &JourneyDefinition, node_id: NodeId) -> EngageResult<&JourneyNode> {
    definition
        .node(node_id)
        .ok_or_else(|| EngageError::InvariantViolation(format!("missing node {}", node_id)))
}

fn deadline_after(now: DateTime<Utc>, millis: u64) -> EngageResult<DateTime<Utc>> {
    check_window(millis)?;
    i64::try_from(millis)
        .ok()
        .and_then(Duration::try_milliseconds)
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| {
            EngageError::InvalidDefinition(format!(
                "delay of {} ms reaches outside the supported time range",
                millis
            ))
        })
}
