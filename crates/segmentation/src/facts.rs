//! Per-user facts visible to the evaluator: the merged trait snapshot and
//! the user's event occurrences, both bounded by the window's `to`.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use engage_core::types::{Event, EventType};

use crate::definition::{PropertyFilter, SUBSCRIPTION_CHANGE_EVENT};
use crate::path::{parse_path, resolve, PathSegment};
use crate::predicates::{self, values_equal, TraitValue};

#[derive(Debug, Clone)]
pub struct UserFacts {
    user_id: String,
    anonymous_id: Option<String>,
    traits: Value,
    /// Identify payloads in timestamp order, for trait history queries.
    identifies: Vec<(DateTime<Utc>, Map<String, Value>)>,
    /// Non-identify events in timestamp order.
    events: Vec<Event>,
}

impl UserFacts {
    /// Builds facts from one user's events. Events are sorted by
    /// `(timestamp, message_id)` so that later identify traits win.
    pub fn from_events(user_id: impl Into<String>, mut events: Vec<Event>) -> Self {
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });

        let mut traits = Value::Object(Map::new());
        let mut identifies = Vec::new();
        let mut anonymous_id = None;
        let mut others = Vec::new();

        for event in events {
            if let Some(anon) = event.anonymous_id.as_deref().filter(|a| !a.is_empty()) {
                anonymous_id = Some(anon.to_string());
            }
            if event.event_type == EventType::Identify {
                if let Some(payload) = event.traits() {
                    deep_merge(&mut traits, &Value::Object(payload.clone()));
                    identifies.push((event.timestamp, payload.clone()));
                }
            } else {
                others.push(event);
            }
        }

        Self {
            user_id: user_id.into(),
            anonymous_id,
            traits,
            identifies,
            events: others,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn anonymous_id(&self) -> Option<&str> {
        self.anonymous_id.as_deref()
    }

    pub fn traits(&self) -> &Value {
        &self.traits
    }

    pub fn has_history(&self) -> bool {
        !self.identifies.is_empty() || !self.events.is_empty()
    }

    pub fn trait_value(&self, path: &[PathSegment]) -> TraitValue<'_> {
        resolve(&self.traits, path).into()
    }

    /// Start of the current uninterrupted stretch during which the trait at
    /// `path` has equalled `expected`. `None` if it does not equal it now.
    pub fn trait_held_since(&self, path: &[PathSegment], expected: &Value) -> Option<DateTime<Utc>> {
        let mut snapshot = Value::Object(Map::new());
        let mut since = None;
        for (timestamp, payload) in &self.identifies {
            deep_merge(&mut snapshot, &Value::Object(payload.clone()));
            let holds = resolve(&snapshot, path).map_or(false, |v| values_equal(v, expected));
            since = match (holds, since) {
                (true, None) => Some(*timestamp),
                (true, started) => started,
                (false, _) => None,
            };
        }
        since
    }

    /// Events named `event_name` with `timestamp` in `[from, now]` whose
    /// properties satisfy every filter.
    pub fn performed_count(
        &self,
        event_name: &str,
        from: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        filters: &[(Vec<PathSegment>, &PropertyFilter)],
    ) -> u64 {
        self.performed(event_name, from, now, filters).count() as u64
    }

    pub fn last_performed(&self, event_name: &str, now: DateTime<Utc>) -> Option<&Event> {
        self.events
            .iter()
            .rev()
            .find(|event| event.name() == Some(event_name) && event.timestamp <= now)
    }

    fn performed<'a>(
        &'a self,
        event_name: &'a str,
        from: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        filters: &'a [(Vec<PathSegment>, &'a PropertyFilter)],
    ) -> impl Iterator<Item = &'a Event> + 'a {
        self.events.iter().filter(move |event| {
            event.name() == Some(event_name)
                && event.timestamp <= now
                && from.map_or(true, |f| event.timestamp >= f)
                && filters.iter().all(|(path, filter)| {
                    let actual = resolve(&event.properties, path).into();
                    predicates::matches(&filter.operator, actual, now)
                })
        })
    }

    /// Latest subscribe/unsubscribe action for the group: `Some(true)` if
    /// the user is subscribed, `Some(false)` if unsubscribed.
    pub fn subscription_state(&self, group_id: Uuid) -> Option<bool> {
        let group = group_id.to_string();
        self.events
            .iter()
            .rev()
            .filter(|e| e.name() == Some(SUBSCRIPTION_CHANGE_EVENT))
            .find(|e| {
                e.properties
                    .get("subscription_group_id")
                    .and_then(Value::as_str)
                    == Some(group.as_str())
            })
            .and_then(|e| match e.properties.get("action").and_then(Value::as_str) {
                Some("subscribe") => Some(true),
                Some("unsubscribe") => Some(false),
                _ => None,
            })
    }
}

/// Parses each filter's path once per evaluation.
pub fn compile_filters(
    filters: &[PropertyFilter],
) -> Result<Vec<(Vec<PathSegment>, &PropertyFilter)>, String> {
    filters
        .iter()
        .map(|f| parse_path(&f.path).map(|path| (path, f)))
        .collect()
}

/// Recursively merges objects; any other value replaces the target.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value)
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn event(kind: EventType, name: Option<&str>, ms: i64, properties: Value) -> Event {
        Event {
            workspace_id: Uuid::nil(),
            user_id: Some("u1".into()),
            anonymous_id: None,
            message_id: format!("m-{}", ms),
            event_type: kind,
            event: name.map(str::to_string),
            timestamp: at(ms),
            properties,
        }
    }

    fn identify(ms: i64, traits: Value) -> Event {
        event(EventType::Identify, None, ms, json!({ "traits": traits }))
    }

    #[test]
    fn test_traits_deep_merge_later_wins() {
        let facts = UserFacts::from_events(
            "u1",
            vec![
                identify(100, json!({"plan": "paid", "address": {"zip": "10001"}})),
                identify(0, json!({"plan": "free", "address": {"city": "NYC"}})),
            ],
        );
        assert_eq!(
            facts.traits(),
            &json!({"plan": "paid", "address": {"city": "NYC", "zip": "10001"}})
        );
    }

    #[test]
    fn test_trait_held_since_resets_on_change() {
        let facts = UserFacts::from_events(
            "u1",
            vec![
                identify(0, json!({"status": "trial"})),
                identify(50, json!({"status": "active"})),
                identify(100, json!({"status": "trial"})),
                identify(200, json!({"name": "x"})),
            ],
        );
        let path = parse_path("status").unwrap();
        assert_eq!(facts.trait_held_since(&path, &json!("trial")), Some(at(100)));
        assert_eq!(facts.trait_held_since(&path, &json!("active")), None);
    }

    #[test]
    fn test_performed_count_with_window_and_filters() {
        let facts = UserFacts::from_events(
            "u1",
            vec![
                event(EventType::Track, Some("Purchase"), 10, json!({"amount": 5})),
                event(EventType::Track, Some("Purchase"), 20, json!({"amount": 50})),
                event(EventType::Track, Some("Purchase"), 30, json!({"amount": 70})),
                event(EventType::Track, Some("Login"), 40, json!({})),
            ],
        );
        assert_eq!(facts.performed_count("Purchase", None, at(100), &[]), 3);
        assert_eq!(facts.performed_count("Purchase", Some(at(20)), at(100), &[]), 2);

        let filters = vec![PropertyFilter {
            path: "amount".into(),
            operator: predicates::SegmentOperator::GreaterThanOrEqual { value: 50.0 },
        }];
        let compiled = compile_filters(&filters).unwrap();
        assert_eq!(facts.performed_count("Purchase", None, at(100), &compiled), 2);
        assert_eq!(
            facts.last_performed("Purchase", at(100)).map(|e| e.timestamp),
            Some(at(30))
        );
    }

    #[test]
    fn test_subscription_state_uses_latest_action() {
        let group = Uuid::new_v4();
        let change = |ms, action: &str| {
            event(
                EventType::Track,
                Some(SUBSCRIPTION_CHANGE_EVENT),
                ms,
                json!({"subscription_group_id": group.to_string(), "action": action}),
            )
        };
        let facts = UserFacts::from_events("u1", vec![change(0, "subscribe"), change(10, "unsubscribe")]);
        assert_eq!(facts.subscription_state(group), Some(false));
        assert_eq!(facts.subscription_state(Uuid::new_v4()), None);
    }
}
