//! Publish-time validation of journey graphs.

use engage_core::{EngageError, EngageResult};
use engage_segmentation::predicates::check_window;

use crate::types::{DelayVariant, JourneyDefinition, JourneyNode, NodeId};

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Rejects graphs that could strand an instance: the journey must have one
/// entry, every reference must resolve, the reachable graph must be acyclic
/// and every reachable node must reach an exit.
pub fn validate(definition: &JourneyDefinition) -> EngageResult<()> {
    let nodes = &definition.nodes;
    let entries: Vec<NodeId> = nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| matches!(n, JourneyNode::Entry { .. }))
        .map(|(i, _)| i)
        .collect();
    let entry = match entries.as_slice() {
        [entry] => *entry,
        [] => return Err(invalid("journey has no entry node".into())),
        _ => {
            return Err(invalid(format!(
                "journey has {} entry nodes, expected one",
                entries.len()
            )))
        }
    };

    for (id, node) in nodes.iter().enumerate() {
        for child in node.children() {
            if child >= nodes.len() {
                return Err(invalid(format!(
                    "node {} ({}) references missing node {}",
                    id,
                    node.kind(),
                    child
                )));
            }
            if child == entry {
                return Err(invalid(format!("node {} points back to the entry node", id)));
            }
        }
        if let JourneyNode::Delay { variant, .. } = node {
            let millis = match variant {
                DelayVariant::Duration { millis } => Some(*millis),
                DelayVariant::UntilSegmentEnter { timeout_millis, .. } => *timeout_millis,
            };
            if let Some(millis) = millis {
                check_window(millis)
                    .map_err(|e| invalid(format!("delay node {}: {}", id, e)))?;
            }
        }
    }

    // Depth-first walk from the entry; a back edge means a cycle.
    let mut marks = vec![Mark::Unvisited; nodes.len()];
    let mut stack: Vec<(NodeId, usize)> = vec![(entry, 0)];
    marks[entry] = Mark::InProgress;
    while let Some((id, next_child)) = stack.pop() {
        let children = nodes[id].children();
        if next_child < children.len() {
            stack.push((id, next_child + 1));
            let child = children[next_child];
            match marks[child] {
                Mark::InProgress => {
                    return Err(invalid(format!("cycle through node {}", child)));
                }
                Mark::Unvisited => {
                    marks[child] = Mark::InProgress;
                    stack.push((child, 0));
                }
                Mark::Done => {}
            }
        } else {
            marks[id] = Mark::Done;
        }
    }

    // A node reaches an exit if it is one or any child does.
    let mut reaches_exit: Vec<bool> = nodes
        .iter()
        .map(|n| matches!(n, JourneyNode::Exit))
        .collect();
    let mut changed = true;
    while changed {
        changed = false;
        for (id, node) in nodes.iter().enumerate() {
            if !reaches_exit[id] && node.children().iter().any(|&c| reaches_exit[c]) {
                reaches_exit[id] = true;
                changed = true;
            }
        }
    }
    for (id, mark) in marks.iter().enumerate() {
        if *mark == Mark::Done && !reaches_exit[id] {
            return Err(invalid(format!(
                "node {} ({}) never reaches an exit",
                id,
                nodes[id].kind()
            )));
        }
    }
    Ok(())
}

fn invalid(message: String) -> EngageError {
    EngageError::InvariantViolation(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelType, TimeoutAction};
    use uuid::Uuid;

    fn message(child: NodeId) -> JourneyNode {
        JourneyNode::Message {
            channel: ChannelType::Email,
            template_id: "welcome".into(),
            child,
        }
    }

    fn entry(child: NodeId) -> JourneyNode {
        JourneyNode::Entry {
            segment_id: Uuid::nil(),
            child,
        }
    }

    #[test]
    fn test_accepts_branching_dag() {
        let definition = JourneyDefinition::new(vec![
            entry(1),
            JourneyNode::SegmentSplit {
                segment_id: Uuid::nil(),
                true_child: 2,
                false_child: 3,
            },
            message(3),
            JourneyNode::Delay {
                variant: DelayVariant::UntilSegmentEnter {
                    segment_id: Uuid::nil(),
                    timeout_millis: Some(1_000),
                    on_timeout: TimeoutAction::Continue { child: 4 },
                },
                child: 4,
            },
            JourneyNode::Exit,
        ]);
        validate(&definition).unwrap();
    }

    #[test]
    fn test_rejects_dangling_reference() {
        let definition = JourneyDefinition::new(vec![entry(1), message(7), JourneyNode::Exit]);
        let err = validate(&definition).unwrap_err();
        assert!(matches!(err, EngageError::InvariantViolation(_)));
    }

    #[test]
    fn test_rejects_cycle() {
        let definition = JourneyDefinition::new(vec![
            entry(1),
            message(2),
            JourneyNode::SegmentSplit {
                segment_id: Uuid::nil(),
                true_child: 1,
                false_child: 3,
            },
            JourneyNode::Exit,
        ]);
        assert!(validate(&definition).unwrap_err().to_string().contains("cycle"));
    }

    #[test]
    fn test_rejects_missing_or_duplicate_entry() {
        assert!(validate(&JourneyDefinition::new(vec![JourneyNode::Exit])).is_err());
        let two = JourneyDefinition::new(vec![entry(2), entry(2), JourneyNode::Exit]);
        assert!(validate(&two).is_err());
    }

    #[test]
    fn test_rejects_zero_delay() {
        let definition = JourneyDefinition::new(vec![
            entry(1),
            JourneyNode::Delay {
                variant: DelayVariant::Duration { millis: 0 },
                child: 2,
            },
            JourneyNode::Exit,
        ]);
        assert!(validate(&definition).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_delays() {
        let delay = |variant: DelayVariant| {
            JourneyDefinition::new(vec![
                entry(1),
                JourneyNode::Delay { variant, child: 2 },
                JourneyNode::Exit,
            ])
        };
        assert!(validate(&delay(DelayVariant::Duration { millis: u64::MAX })).is_err());
        assert!(validate(&delay(DelayVariant::UntilSegmentEnter {
            segment_id: Uuid::new_v4(),
            timeout_millis: Some(u64::MAX),
            on_timeout: TimeoutAction::Exit,
        }))
        .is_err());
        assert!(validate(&delay(DelayVariant::Duration {
            millis: 30 * 24 * 60 * 60 * 1_000,
        }))
        .is_ok());
    }
}
