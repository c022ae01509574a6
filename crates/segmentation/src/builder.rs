//! Segment builder: fluent API for constructing segment definitions.

use serde_json::Value;
use uuid::Uuid;

use crate::definition::{PropertyFilter, SegmentNode, SubscriptionGroupKind};
use crate::predicates::{CountOperator, SegmentOperator};

pub struct SegmentBuilder {
    conditions: Vec<SegmentNode>,
    any: bool,
}

impl SegmentBuilder {
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
            any: false,
        }
    }

    /// Match when any condition holds instead of all of them.
    pub fn with_or(mut self) -> Self {
        self.any = true;
        self
    }

    pub fn trait_equals(self, path: impl Into<String>, value: Value) -> Self {
        self.trait_matches(path, SegmentOperator::Equals { value })
    }

    pub fn trait_exists(self, path: impl Into<String>) -> Self {
        self.trait_matches(path, SegmentOperator::Exists)
    }

    pub fn trait_matches(mut self, path: impl Into<String>, operator: SegmentOperator) -> Self {
        self.conditions.push(SegmentNode::Trait {
            path: path.into(),
            operator,
        });
        self
    }

    pub fn performed(
        mut self,
        event_name: impl Into<String>,
        min_count: u64,
        within_millis: Option<u64>,
    ) -> Self {
        self.conditions.push(SegmentNode::Performed {
            event_name: event_name.into(),
            within_millis,
            operator: CountOperator::AtLeast(min_count),
            properties: Vec::new(),
        });
        self
    }

    pub fn performed_where(
        mut self,
        event_name: impl Into<String>,
        within_millis: Option<u64>,
        properties: Vec<PropertyFilter>,
    ) -> Self {
        self.conditions.push(SegmentNode::Performed {
            event_name: event_name.into(),
            within_millis,
            operator: CountOperator::default(),
            properties,
        });
        self
    }

    pub fn did_not_perform(mut self, event_name: impl Into<String>, within_millis: Option<u64>) -> Self {
        self.conditions.push(SegmentNode::Performed {
            event_name: event_name.into(),
            within_millis,
            operator: CountOperator::Exactly(0),
            properties: Vec::new(),
        });
        self
    }

    pub fn subscribed_to(mut self, group_id: Uuid, kind: SubscriptionGroupKind) -> Self {
        self.conditions
            .push(SegmentNode::SubscriptionGroup { group_id, kind });
        self
    }

    pub fn node(mut self, node: SegmentNode) -> Self {
        self.conditions.push(node);
        self
    }

    pub fn not(mut self, node: SegmentNode) -> Self {
        self.conditions.push(SegmentNode::negate(node));
        self
    }

    /// A single condition is returned unwrapped.
    pub fn build(mut self) -> SegmentNode {
        if self.conditions.len() == 1 {
            if let Some(only) = self.conditions.pop() {
                return only;
            }
        }
        if self.any {
            SegmentNode::or(self.conditions)
        } else {
            SegmentNode::and(self.conditions)
        }
    }
}

impl Default for SegmentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builds_and_by_default() {
        let node = SegmentBuilder::new()
            .trait_equals("plan", json!("paid"))
            .performed("Purchase", 2, Some(86_400_000))
            .did_not_perform("Churn", None)
            .build();
        let SegmentNode::And { children } = node else {
            panic!("expected and");
        };
        assert_eq!(children.len(), 3);
        assert!(matches!(
            children[2],
            SegmentNode::Performed { operator: CountOperator::Exactly(0), .. }
        ));
    }

    #[test]
    fn test_single_condition_is_unwrapped() {
        let node = SegmentBuilder::new().with_or().trait_exists("email").build();
        assert!(matches!(node, SegmentNode::Trait { .. }));
        let empty = SegmentBuilder::new().with_or().build();
        assert_eq!(empty, SegmentNode::or(vec![]));
    }
}
