//! User properties: scalar values derived from a user's traits and events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use engage_core::{EngageError, EngageResult};

use crate::evaluator::window_start;
use crate::facts::UserFacts;
use crate::path::{parse_path, resolve};
use crate::predicates::check_window;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum UserPropertyDefinition {
    Trait {
        path: String,
    },
    Id,
    AnonymousId,
    PerformedCount {
        event_name: String,
        #[serde(default)]
        within_millis: Option<u64>,
    },
    /// A property of the most recent matching event.
    LastPerformed {
        event_name: String,
        path: String,
    },
}

impl UserPropertyDefinition {
    pub fn validate(&self) -> EngageResult<()> {
        match self {
            UserPropertyDefinition::Trait { path } => {
                parse_path(path).map_err(EngageError::InvalidDefinition)?;
            }
            UserPropertyDefinition::Id | UserPropertyDefinition::AnonymousId => {}
            UserPropertyDefinition::PerformedCount {
                event_name,
                within_millis,
            } => {
                require_event_name(event_name)?;
                if let Some(ms) = within_millis {
                    check_window(*ms)?;
                }
            }
            UserPropertyDefinition::LastPerformed { event_name, path } => {
                require_event_name(event_name)?;
                parse_path(path).map_err(EngageError::InvalidDefinition)?;
            }
        }
        Ok(())
    }

    pub fn is_time_dependent(&self) -> bool {
        matches!(
            self,
            UserPropertyDefinition::PerformedCount {
                within_millis: Some(_),
                ..
            }
        )
    }

    /// The property's value for this user. `Ok(None)` means no value, which
    /// produces no assignment.
    pub fn evaluate(&self, facts: &UserFacts, now: DateTime<Utc>) -> EngageResult<Option<Value>> {
        let value = match self {
            UserPropertyDefinition::Trait { path } => {
                let path = parse_path(path).map_err(EngageError::InvalidDefinition)?;
                resolve(facts.traits(), &path).cloned()
            }
            UserPropertyDefinition::Id => Some(Value::String(facts.user_id().to_string())),
            UserPropertyDefinition::AnonymousId => {
                facts.anonymous_id().map(|id| Value::String(id.to_string()))
            }
            UserPropertyDefinition::PerformedCount {
                event_name,
                within_millis,
            } => {
                let from = match within_millis {
                    Some(ms) => Some(window_start(now, *ms)?),
                    None => None,
                };
                Some(Value::from(facts.performed_count(event_name, from, now, &[])))
            }
            UserPropertyDefinition::LastPerformed { event_name, path } => {
                let path = parse_path(path).map_err(EngageError::InvalidDefinition)?;
                facts
                    .last_performed(event_name, now)
                    .and_then(|event| resolve(&event.properties, &path).cloned())
            }
        };
        Ok(value.filter(|v| !v.is_null()))
    }
}

fn require_event_name(event_name: &str) -> EngageResult<()> {
    if event_name.trim().is_empty() {
        return Err(EngageError::InvalidDefinition(
            "user property without event name".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use engage_core::types::{Event, EventType};
    use serde_json::json;
    use uuid::Uuid;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn facts() -> UserFacts {
        let base = Event {
            workspace_id: Uuid::nil(),
            user_id: Some("u1".into()),
            anonymous_id: Some("anon-9".into()),
            message_id: "m0".into(),
            event_type: EventType::Identify,
            event: None,
            timestamp: at(0),
            properties: json!({"traits": {"email": "a@example.com"}}),
        };
        let order = |id: &str, ms: i64, total: i64| Event {
            message_id: id.into(),
            event_type: EventType::Track,
            event: Some("Order".into()),
            timestamp: at(ms),
            properties: json!({"total": total}),
            ..base.clone()
        };
        UserFacts::from_events("u1", vec![base.clone(), order("m1", 10, 30), order("m2", 20, 45)])
    }

    #[test]
    fn test_user_property_values() {
        let facts = facts();
        let now = at(100);
        let email = UserPropertyDefinition::Trait { path: "email".into() };
        assert_eq!(email.evaluate(&facts, now).unwrap(), Some(json!("a@example.com")));
        assert_eq!(
            UserPropertyDefinition::Id.evaluate(&facts, now).unwrap(),
            Some(json!("u1"))
        );
        assert_eq!(
            UserPropertyDefinition::AnonymousId.evaluate(&facts, now).unwrap(),
            Some(json!("anon-9"))
        );

        let count = UserPropertyDefinition::PerformedCount {
            event_name: "Order".into(),
            within_millis: Some(85),
        };
        assert_eq!(count.evaluate(&facts, now).unwrap(), Some(json!(1)));

        let last_total = UserPropertyDefinition::LastPerformed {
            event_name: "Order".into(),
            path: "total".into(),
        };
        assert_eq!(last_total.evaluate(&facts, now).unwrap(), Some(json!(45)));
    }

    #[test]
    fn test_absent_value_produces_nothing() {
        let missing = UserPropertyDefinition::Trait { path: "phone".into() };
        assert_eq!(missing.evaluate(&facts(), at(100)).unwrap(), None);
        let bad = UserPropertyDefinition::LastPerformed {
            event_name: "".into(),
            path: "x".into(),
        };
        assert!(bad.validate().is_err());
    }
}
