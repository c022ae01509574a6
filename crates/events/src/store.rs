use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use engage_core::types::{Event, InsertSummary};
use engage_core::EngageResult;

/// Append-only event persistence. Implementations must be idempotent on
/// `(workspace_id, message_id)`: replays are dropped, never an error.
pub trait EventStore: Send + Sync {
    fn insert_batch(&self, workspace_id: Uuid, events: Vec<Event>) -> EngageResult<InsertSummary>;

    /// Events with `from <= timestamp < to`. `from = None` reads from the
    /// beginning of the workspace's history.
    fn events_in_window(
        &self,
        workspace_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: DateTime<Utc>,
    ) -> EngageResult<Vec<Event>>;

    /// All events of one user with `timestamp < until`, oldest first.
    fn user_events(
        &self,
        workspace_id: Uuid,
        user_id: &str,
        until: DateTime<Utc>,
    ) -> EngageResult<Vec<Event>>;

    /// Every user key that has at least one event, sorted.
    fn users(&self, workspace_id: Uuid) -> EngageResult<Vec<String>>;
}

#[derive(Default)]
struct WorkspaceLog {
    message_ids: HashSet<String>,
    events: Vec<Event>,
    by_user: HashMap<String, Vec<usize>>,
}

/// DashMap-backed event store, one append log per workspace.
#[derive(Default)]
pub struct InMemoryEventStore {
    workspaces: DashMap<Uuid, WorkspaceLog>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            workspaces: DashMap::new(),
        }
    }

    pub fn len(&self, workspace_id: &Uuid) -> usize {
        self.workspaces
            .get(workspace_id)
            .map(|log| log.events.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, workspace_id: &Uuid) -> bool {
        self.len(workspace_id) == 0
    }
}

impl EventStore for InMemoryEventStore {
    fn insert_batch(&self, workspace_id: Uuid, events: Vec<Event>) -> EngageResult<InsertSummary> {
        let mut summary = InsertSummary::default();
        let mut log = self.workspaces.entry(workspace_id).or_default();

        for mut event in events {
            let Some(user_key) = event.user_key().map(str::to_string) else {
                warn!(
                    workspace_id = %workspace_id,
                    message_id = %event.message_id,
                    "Rejecting event without user_id or anonymous_id"
                );
                summary.rejected_count += 1;
                continue;
            };
            if !log.message_ids.insert(event.message_id.clone()) {
                summary.duplicate_count += 1;
                continue;
            }
            event.workspace_id = workspace_id;
            let index = log.events.len();
            log.events.push(event);
            log.by_user.entry(user_key).or_default().push(index);
            summary.inserted_count += 1;
        }

        metrics::counter!("events.inserted").increment(summary.inserted_count as u64);
        metrics::counter!("events.duplicates").increment(summary.duplicate_count as u64);
        debug!(
            workspace_id = %workspace_id,
            inserted = summary.inserted_count,
            duplicates = summary.duplicate_count,
            rejected = summary.rejected_count,
            "Inserted event batch"
        );
        Ok(summary)
    }

    fn events_in_window(
        &self,
        workspace_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: DateTime<Utc>,
    ) -> EngageResult<Vec<Event>> {
        let Some(log) = self.workspaces.get(&workspace_id) else {
            return Ok(Vec::new());
        };
        let mut events: Vec<Event> = log
            .events
            .iter()
            .filter(|e| e.timestamp < to && from.map_or(true, |f| e.timestamp >= f))
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        Ok(events)
    }

    fn user_events(
        &self,
        workspace_id: Uuid,
        user_id: &str,
        until: DateTime<Utc>,
    ) -> EngageResult<Vec<Event>> {
        let Some(log) = self.workspaces.get(&workspace_id) else {
            return Ok(Vec::new());
        };
        let Some(indices) = log.by_user.get(user_id) else {
            return Ok(Vec::new());
        };
        let mut events: Vec<Event> = indices
            .iter()
            .map(|&i| &log.events[i])
            .filter(|e| e.timestamp < until)
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        Ok(events)
    }

    fn users(&self, workspace_id: Uuid) -> EngageResult<Vec<String>> {
        let Some(log) = self.workspaces.get(&workspace_id) else {
            return Ok(Vec::new());
        };
        let users: BTreeSet<String> = log.by_user.keys().cloned().collect();
        Ok(users.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use engage_core::types::EventType;
    use serde_json::json;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn track(user: &str, message_id: &str, ms: i64) -> Event {
        Event {
            workspace_id: Uuid::nil(),
            user_id: Some(user.to_string()),
            anonymous_id: None,
            message_id: message_id.to_string(),
            event_type: EventType::Track,
            event: Some("Purchase".to_string()),
            timestamp: at(ms),
            properties: json!({}),
        }
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let store = InMemoryEventStore::new();
        let ws = Uuid::new_v4();
        let batch = vec![track("u1", "m1", 0), track("u1", "m2", 10), track("u2", "m1", 20)];

        let first = store.insert_batch(ws, batch.clone()).unwrap();
        assert_eq!(first.inserted_count, 2);
        assert_eq!(first.duplicate_count, 1);

        let replay = store.insert_batch(ws, batch).unwrap();
        assert_eq!(replay.inserted_count, 0);
        assert_eq!(replay.duplicate_count, 3);
        assert_eq!(store.len(&ws), 2);
    }

    #[test]
    fn test_message_ids_scoped_per_workspace() {
        let store = InMemoryEventStore::new();
        let ws1 = Uuid::new_v4();
        let ws2 = Uuid::new_v4();
        store.insert_batch(ws1, vec![track("u1", "m1", 0)]).unwrap();
        let summary = store.insert_batch(ws2, vec![track("u1", "m1", 0)]).unwrap();
        assert_eq!(summary.inserted_count, 1);
        assert_eq!(store.events_in_window(ws2, None, at(1)).unwrap()[0].workspace_id, ws2);
    }

    #[test]
    fn test_event_without_user_is_rejected() {
        let store = InMemoryEventStore::new();
        let ws = Uuid::new_v4();
        let mut orphan = track("u1", "m1", 0);
        orphan.user_id = None;
        let summary = store
            .insert_batch(ws, vec![orphan, track("u2", "m2", 5)])
            .unwrap();
        assert_eq!(summary.rejected_count, 1);
        assert_eq!(summary.inserted_count, 1);
        assert_eq!(store.users(ws).unwrap(), vec!["u2".to_string()]);
    }

    #[test]
    fn test_window_is_half_open() {
        let store = InMemoryEventStore::new();
        let ws = Uuid::new_v4();
        store
            .insert_batch(
                ws,
                vec![track("u1", "a", 0), track("u1", "b", 100), track("u2", "c", 150)],
            )
            .unwrap();

        let all = store.events_in_window(ws, None, at(150)).unwrap();
        assert_eq!(all.len(), 2);

        let tail = store.events_in_window(ws, Some(at(100)), at(151)).unwrap();
        let ids: Vec<&str> = tail.iter().map(|e| e.message_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_user_events_sorted_and_bounded() {
        let store = InMemoryEventStore::new();
        let ws = Uuid::new_v4();
        store
            .insert_batch(
                ws,
                vec![track("u1", "late", 300), track("u1", "early", 10), track("u2", "x", 20)],
            )
            .unwrap();

        let events = store.user_events(ws, "u1", at(1_000)).unwrap();
        assert_eq!(events[0].message_id, "early");
        assert_eq!(events[1].message_id, "late");
        assert_eq!(store.user_events(ws, "u1", at(300)).unwrap().len(), 1);
        assert!(store.user_events(ws, "nobody", at(1_000)).unwrap().is_empty());
    }
}
