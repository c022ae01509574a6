//! Segment definition tree: a closed sum type over trait conditions, event
//! occurrences, subscription state and boolean combinators.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use engage_core::{EngageError, EngageResult};

use crate::path::parse_path;
use crate::predicates::{check_window, CountOperator, SegmentOperator};

/// Track event that records subscribe/unsubscribe actions.
pub const SUBSCRIPTION_CHANGE_EVENT: &str = "subscription_change";

/// Nesting limit enforced by `validate()` and during evaluation.
pub const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SegmentNode {
    Trait {
        path: String,
        operator: SegmentOperator,
    },
    Performed {
        event_name: String,
        /// `None` looks at the whole (bounded) history.
        #[serde(default)]
        within_millis: Option<u64>,
        #[serde(default)]
        operator: CountOperator,
        #[serde(default)]
        properties: Vec<PropertyFilter>,
    },
    SubscriptionGroup {
        group_id: Uuid,
        #[serde(default)]
        kind: SubscriptionGroupKind,
    },
    /// Matches every user of the workspace.
    Broadcast,
    And {
        children: Vec<SegmentNode>,
    },
    Or {
        children: Vec<SegmentNode>,
    },
    Not {
        child: Box<SegmentNode>,
    },
}

/// A condition on a property of a performed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyFilter {
    pub path: String,
    pub operator: SegmentOperator,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionGroupKind {
    /// Members must have explicitly subscribed.
    OptIn,
    /// Everyone is a member unless they unsubscribed.
    #[default]
    OptOut,
}

impl SegmentNode {
    pub fn and(children: Vec<SegmentNode>) -> Self {
        SegmentNode::And { children }
    }

    pub fn or(children: Vec<SegmentNode>) -> Self {
        SegmentNode::Or { children }
    }

    pub fn negate(child: SegmentNode) -> Self {
        SegmentNode::Not {
            child: Box::new(child),
        }
    }

    pub fn trait_equals(path: impl Into<String>, value: serde_json::Value) -> Self {
        SegmentNode::Trait {
            path: path.into(),
            operator: SegmentOperator::Equals { value },
        }
    }

    /// Checks the tree for structural errors before it is stored.
    pub fn validate(&self) -> EngageResult<()> {
        self.validate_at(1)
    }

    fn validate_at(&self, depth: usize) -> EngageResult<()> {
        if depth > MAX_DEPTH {
            return Err(EngageError::InvalidDefinition(format!(
                "segment definition nested deeper than {}",
                MAX_DEPTH
            )));
        }
        match self {
            SegmentNode::Trait { path, operator } => {
                parse_path(path).map_err(EngageError::InvalidDefinition)?;
                validate_operator(operator)
            }
            SegmentNode::Performed {
                event_name,
                within_millis,
                properties,
                ..
            } => {
                if event_name.trim().is_empty() {
                    return Err(EngageError::InvalidDefinition(
                        "performed condition without event name".into(),
                    ));
                }
                if let Some(ms) = within_millis {
                    check_window(*ms).map_err(|e| {
                        EngageError::InvalidDefinition(format!("performed '{}': {}", event_name, e))
                    })?;
                }
                for filter in properties {
                    parse_path(&filter.path).map_err(EngageError::InvalidDefinition)?;
                    validate_operator(&filter.operator)?;
                }
                Ok(())
            }
            SegmentNode::SubscriptionGroup { .. } | SegmentNode::Broadcast => Ok(()),
            SegmentNode::And { children } | SegmentNode::Or { children } => children
                .iter()
                .try_for_each(|child| child.validate_at(depth + 1)),
            SegmentNode::Not { child } => child.validate_at(depth + 1),
        }
    }

    /// Whether membership can change as time passes without new events, so
    /// already-assigned users have to be re-evaluated every window.
    pub fn is_time_dependent(&self) -> bool {
        match self {
            SegmentNode::Trait { operator, .. } => operator.is_time_dependent(),
            SegmentNode::Performed {
                within_millis,
                properties,
                ..
            } => {
                within_millis.is_some()
                    || properties.iter().any(|f| f.operator.is_time_dependent())
            }
            SegmentNode::SubscriptionGroup { .. } | SegmentNode::Broadcast => false,
            SegmentNode::And { children } | SegmentNode::Or { children } => {
                children.iter().any(SegmentNode::is_time_dependent)
            }
            SegmentNode::Not { child } => child.is_time_dependent(),
        }
    }
}

fn validate_operator(operator: &SegmentOperator) -> EngageResult<()> {
    operator.window_millis().map_or(Ok(()), check_window)
}
