//! Recursive-descent evaluation of segment definitions against one user's
//! facts. Evaluation is pure: `now` is the window's `to`, never the clock.

use chrono::{DateTime, Utc};
use tracing::warn;

use engage_core::{EngageError, EngageResult};

use crate::definition::{SegmentNode, SubscriptionGroupKind, MAX_DEPTH};
use crate::facts::{compile_filters, UserFacts};
use crate::path::parse_path;
use crate::predicates::{self, check_window, HasBeenComparator, SegmentOperator};

/// Evaluates membership. A malformed definition yields `false` for this user
/// and logs a diagnostic instead of failing the caller.
pub fn evaluate_segment(node: &SegmentNode, facts: &UserFacts, now: DateTime<Utc>) -> bool {
    match try_evaluate_segment(node, facts, now) {
        Ok(member) => member,
        Err(e) => {
            warn!(user_id = %facts.user_id(), error = %e, "Segment evaluation failed");
            false
        }
    }
}

pub fn try_evaluate_segment(
    node: &SegmentNode,
    facts: &UserFacts,
    now: DateTime<Utc>,
) -> EngageResult<bool> {
    eval_node(node, facts, now, 1)
}

fn eval_node(
    node: &SegmentNode,
    facts: &UserFacts,
    now: DateTime<Utc>,
    depth: usize,
) -> EngageResult<bool> {
    if depth > MAX_DEPTH {
        return Err(EngageError::InvalidDefinition(format!(
            "segment definition nested deeper than {}",
            MAX_DEPTH
        )));
    }
    match node {
        SegmentNode::Trait { path, operator } => {
            let path = parse_path(path).map_err(EngageError::InvalidDefinition)?;
            match operator {
                SegmentOperator::HasBeen {
                    comparator,
                    value,
                    window_millis,
                } => {
                    let Some(since) = facts.trait_held_since(&path, value) else {
                        return Ok(false);
                    };
                    let threshold = window_start(now, *window_millis)?;
                    Ok(match comparator {
                        HasBeenComparator::Gte => since <= threshold,
                        HasBeenComparator::Lt => since > threshold,
                    })
                }
                other => Ok(predicates::matches(other, facts.trait_value(&path), now)),
            }
        }
        SegmentNode::Performed {
            event_name,
            within_millis,
            operator,
            properties,
        } => {
            let from = match within_millis {
                Some(ms) => Some(window_start(now, *ms)?),
                None => None,
            };
            let filters = compile_filters(properties).map_err(EngageError::InvalidDefinition)?;
            let count = facts.performed_count(event_name, from, now, &filters);
            Ok(operator.matches(count))
        }
        SegmentNode::SubscriptionGroup { group_id, kind } => {
            let state = facts.subscription_state(*group_id);
            Ok(match kind {
                SubscriptionGroupKind::OptIn => state == Some(true),
                SubscriptionGroupKind::OptOut => state != Some(false),
            })
        }
        SegmentNode::Broadcast => Ok(true),
        SegmentNode::And { children } => {
            for child in children {
                if !eval_node(child, facts, now, depth + 1)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        SegmentNode::Or { children } => {
            for child in children {
                if eval_node(child, facts, now, depth + 1)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        SegmentNode::Not { child } => Ok(!eval_node(child, facts, now, depth + 1)?),
    }
}

/// Start of the window ending at `now`. Out-of-range windows are data
/// errors for this definition.
pub(crate) fn window_start(now: DateTime<Utc>, millis: u64) -> EngageResult<DateTime<Utc>> {
    check_window(millis)?;
    predicates::window_start(now, millis).ok_or_else(|| {
        EngageError::InvalidDefinition(format!(
            "time window of {} ms reaches outside the supported time range",
            millis
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::PropertyFilter;
    use crate::predicates::CountOperator;
    use chrono::TimeZone;
    use engage_core::types::{Event, EventType};
    use serde_json::{json, Value};
    use uuid::Uuid;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn identify(ms: i64, traits: Value) -> Event {
        Event {
            workspace_id: Uuid::nil(),
            user_id: Some("u1".into()),
            anonymous_id: None,
            message_id: format!("id-{}", ms),
            event_type: EventType::Identify,
            event: None,
            timestamp: at(ms),
            properties: json!({ "traits": traits }),
        }
    }

    fn track(name: &str, ms: i64, properties: Value) -> Event {
        Event {
            event_type: EventType::Track,
            event: Some(name.to_string()),
            message_id: format!("tr-{}-{}", name, ms),
            properties,
            ..identify(ms, json!({}))
        }
    }

    #[test]
    fn test_plan_upgrade_scenario() {
        let facts = UserFacts::from_events(
            "u1",
            vec![identify(0, json!({"plan": "free"})), identify(100, json!({"plan": "paid"}))],
        );
        let segment = SegmentNode::trait_equals("plan", json!("paid"));
        assert!(evaluate_segment(&segment, &facts, at(150)));
    }

    #[test]
    fn test_combinator_identities() {
        let facts = UserFacts::from_events("u1", vec![]);
        assert!(evaluate_segment(&SegmentNode::and(vec![]), &facts, at(0)));
        assert!(!evaluate_segment(&SegmentNode::or(vec![]), &facts, at(0)));
        assert!(!evaluate_segment(
            &SegmentNode::negate(SegmentNode::and(vec![])),
            &facts,
            at(0)
        ));
    }

    #[test]
    fn test_short_circuit_skips_malformed_sibling() {
        let facts = UserFacts::from_events("u1", vec![identify(0, json!({"plan": "free"}))]);
        let malformed = SegmentNode::trait_equals("a..b", json!(1));
        let or = SegmentNode::or(vec![SegmentNode::trait_equals("plan", json!("free")), malformed.clone()]);
        assert!(try_evaluate_segment(&or, &facts, at(10)).unwrap());

        let and = SegmentNode::and(vec![SegmentNode::trait_equals("plan", json!("free")), malformed]);
        assert!(try_evaluate_segment(&and, &facts, at(10)).is_err());
        assert!(!evaluate_segment(&and, &facts, at(10)));
    }

    #[test]
    fn test_performed_window_is_anchored_to_now() {
        let facts = UserFacts::from_events(
            "u1",
            vec![
                track("Purchase", 1_000, json!({"sku": "A"})),
                track("Purchase", 5_000, json!({"sku": "B"})),
            ],
        );
        let recent = SegmentNode::Performed {
            event_name: "Purchase".into(),
            within_millis: Some(2_000),
            operator: CountOperator::default(),
            properties: vec![],
        };
        assert!(evaluate_segment(&recent, &facts, at(6_000)));
        assert!(!evaluate_segment(&recent, &facts, at(8_000)));

        let sku_a_twice = SegmentNode::Performed {
            event_name: "Purchase".into(),
            within_millis: None,
            operator: CountOperator::AtLeast(2),
            properties: vec![PropertyFilter {
                path: "sku".into(),
                operator: SegmentOperator::Equals { value: json!("A") },
            }],
        };
        assert!(!evaluate_segment(&sku_a_twice, &facts, at(6_000)));
    }

    #[test]
    fn test_has_been() {
        let facts = UserFacts::from_events(
            "u1",
            vec![identify(0, json!({"status": "trial"})), identify(500, json!({"email": "a@b.c"}))],
        );
        let has_been = |comparator| SegmentNode::Trait {
            path: "status".into(),
            operator: SegmentOperator::HasBeen {
                comparator,
                value: json!("trial"),
                window_millis: 1_000,
            },
        };
        assert!(!evaluate_segment(&has_been(HasBeenComparator::Gte), &facts, at(900)));
        assert!(evaluate_segment(&has_been(HasBeenComparator::Lt), &facts, at(900)));
        assert!(evaluate_segment(&has_been(HasBeenComparator::Gte), &facts, at(1_000)));
    }

    #[test]
    fn test_oversized_windows_fail_closed() {
        let facts = UserFacts::from_events("u1", vec![track("Purchase", 10, json!({}))]);
        let forever = SegmentNode::Performed {
            event_name: "Purchase".into(),
            within_millis: Some(u64::MAX),
            operator: CountOperator::default(),
            properties: vec![],
        };
        assert!(forever.validate().is_err());
        assert!(matches!(
            try_evaluate_segment(&forever, &facts, at(100)),
            Err(EngageError::InvalidDefinition(_))
        ));
        assert!(!evaluate_segment(&forever, &facts, at(100)));

        let held = SegmentNode::Trait {
            path: "status".into(),
            operator: SegmentOperator::HasBeen {
                comparator: HasBeenComparator::Lt,
                value: json!("trial"),
                window_millis: 1 << 63,
            },
        };
        let trial = UserFacts::from_events("u1", vec![identify(0, json!({"status": "trial"}))]);
        assert!(!evaluate_segment(&held, &trial, at(100)));

        // The longest allowed window may reach back before the epoch.
        let early = SegmentNode::Performed {
            event_name: "Purchase".into(),
            within_millis: Some(predicates::MAX_WINDOW_MILLIS),
            operator: CountOperator::default(),
            properties: vec![],
        };
        assert!(early.validate().is_ok());
        assert!(evaluate_segment(&early, &facts, at(100)));
    }

    #[test]
    fn test_subscription_groups() {
        let group = Uuid::new_v4();
        let opt_in = SegmentNode::SubscriptionGroup {
            group_id: group,
            kind: SubscriptionGroupKind::OptIn,
        };
        let opt_out = SegmentNode::SubscriptionGroup {
            group_id: group,
            kind: SubscriptionGroupKind::OptOut,
        };
        let silent = UserFacts::from_events("u1", vec![identify(0, json!({}))]);
        assert!(!evaluate_segment(&opt_in, &silent, at(10)));
        assert!(evaluate_segment(&opt_out, &silent, at(10)));

        let unsubscribed = UserFacts::from_events(
            "u1",
            vec![track(
                crate::definition::SUBSCRIPTION_CHANGE_EVENT,
                5,
                json!({"subscription_group_id": group.to_string(), "action": "unsubscribe"}),
            )],
        );
        assert!(!evaluate_segment(&opt_out, &unsubscribed, at(10)));
    }
}
