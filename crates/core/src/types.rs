use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Kind of an incoming user event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Identify,
    Track,
    Page,
    Screen,
    Group,
    Alias,
}

/// A single user event. Immutable once stored; `message_id` is the
/// idempotency key within a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub workspace_id: Uuid,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub anonymous_id: Option<String>,
    pub message_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Event name for track/page/screen events.
    #[serde(default)]
    pub event: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: Value,
}

impl Event {
    /// The key a user is tracked under: `user_id`, falling back to
    /// `anonymous_id`.
    pub fn user_key(&self) -> Option<&str> {
        self.user_id
            .as_deref()
            .filter(|key| !key.is_empty())
            .or_else(|| self.anonymous_id.as_deref().filter(|key| !key.is_empty()))
    }

    /// Traits carried by an identify event, either under `properties.traits`
    /// or directly in `properties`.
    pub fn traits(&self) -> Option<&Map<String, Value>> {
        if self.event_type != EventType::Identify {
            return None;
        }
        let properties = self.properties.as_object()?;
        match properties.get("traits").and_then(Value::as_object) {
            Some(traits) => Some(traits),
            None => Some(properties),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.event.as_deref()
    }
}

/// Result of persisting a batch of events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertSummary {
    pub inserted_count: usize,
    pub duplicate_count: usize,
    /// Events without any user key.
    pub rejected_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComputedPropertyType {
    Segment,
    UserProperty,
}

/// One processed window `[last_processed_from, last_processed_to)` of a
/// computed property. `last_processed_from` is `None` for the first window
/// of a definition version (full rebuild).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputedPropertyPeriod {
    pub workspace_id: Uuid,
    pub computed_property_id: Uuid,
    pub property_type: ComputedPropertyType,
    /// Millis of the definition's last update; a new version restarts the
    /// window sequence.
    pub version: i64,
    pub last_processed_from: Option<DateTime<Utc>>,
    pub last_processed_to: DateTime<Utc>,
}

/// Materialized value of a computed property for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum AssignmentValue {
    Segment(bool),
    UserProperty(Value),
}

impl AssignmentValue {
    pub fn in_segment(&self) -> bool {
        matches!(self, AssignmentValue::Segment(true))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub workspace_id: Uuid,
    pub user_id: String,
    pub computed_property_id: Uuid,
    pub value: AssignmentValue,
    /// The `to` boundary of the window that produced this value.
    pub assigned_at: DateTime<Utc>,
    /// The `to` boundary of the window in which the value last changed.
    /// Matches the `segment_version` of the delta that reported the change.
    pub changed_at: DateTime<Utc>,
}

/// Segment membership delta emitted by the incremental evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentUpdate {
    pub workspace_id: Uuid,
    pub user_id: String,
    pub segment_id: Uuid,
    pub currently_in_segment: bool,
    /// Window `to` in millis; later updates carry larger versions.
    pub segment_version: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identify(properties: Value) -> Event {
        Event {
            workspace_id: Uuid::nil(),
            user_id: None,
            anonymous_id: Some("anon-1".to_string()),
            message_id: "m-1".to_string(),
            event_type: EventType::Identify,
            event: None,
            timestamp: Utc::now(),
            properties,
        }
    }

    #[test]
    fn test_user_key_falls_back_to_anonymous_id() {
        let mut event = identify(json!({}));
        assert_eq!(event.user_key(), Some("anon-1"));
        event.user_id = Some("u-1".to_string());
        assert_eq!(event.user_key(), Some("u-1"));
        event.user_id = Some(String::new());
        event.anonymous_id = None;
        assert_eq!(event.user_key(), None);
    }

    #[test]
    fn test_traits_nested_or_flat() {
        let nested = identify(json!({"traits": {"plan": "paid"}}));
        assert_eq!(nested.traits().unwrap()["plan"], json!("paid"));

        let flat = identify(json!({"plan": "free"}));
        assert_eq!(flat.traits().unwrap()["plan"], json!("free"));

        let mut track = identify(json!({"plan": "free"}));
        track.event_type = EventType::Track;
        assert!(track.traits().is_none());
    }

    #[test]
    fn test_event_wire_format() {
        let event: Event = serde_json::from_value(json!({
            "workspace_id": Uuid::nil(),
            "user_id": "u1",
            "message_id": "abc",
            "type": "Track",
            "event": "Purchase",
            "timestamp": "2024-01-01T00:00:00Z",
        }))
        .unwrap();
        assert_eq!(event.event_type, EventType::Track);
        assert_eq!(event.name(), Some("Purchase"));
        assert!(event.properties.is_null());
    }
}
