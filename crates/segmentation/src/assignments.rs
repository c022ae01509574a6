//! Assignment store: current value of each computed property per user,
//! last-write-wins by the producing window's `to`.

use std::collections::BTreeMap;

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use engage_core::types::{Assignment, AssignmentValue};
use engage_core::EngageResult;

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The value changed. `previous` is `None` for a first assignment.
    Written { previous: Option<AssignmentValue> },
    /// Same value; only `assigned_at` moved forward, `changed_at` is kept.
    Unchanged,
    /// Produced by an older window than the stored value; discarded.
    Stale,
}

impl WriteOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, WriteOutcome::Written { .. })
    }
}

pub trait AssignmentStore: Send + Sync {
    fn get(
        &self,
        workspace_id: Uuid,
        user_id: &str,
        computed_property_id: Uuid,
    ) -> EngageResult<Option<Assignment>>;

    fn write(&self, assignment: Assignment) -> EngageResult<WriteOutcome>;

    /// Users holding any assignment for the property, sorted.
    fn users_with_assignments(
        &self,
        workspace_id: Uuid,
        computed_property_id: Uuid,
    ) -> EngageResult<Vec<String>>;

    fn list_for_user(&self, workspace_id: Uuid, user_id: &str) -> EngageResult<Vec<Assignment>>;

    fn delete_property(&self, workspace_id: Uuid, computed_property_id: Uuid) -> EngageResult<usize>;
}

#[derive(Default)]
pub struct InMemoryAssignmentStore {
    assignments: DashMap<(Uuid, Uuid), BTreeMap<String, Assignment>>,
}

impl InMemoryAssignmentStore {
    pub fn new() -> Self {
        Self {
            assignments: DashMap::new(),
        }
    }

    /// Users currently in the segment, sorted.
    pub fn members(&self, workspace_id: Uuid, segment_id: Uuid) -> Vec<String> {
        self.assignments
            .get(&(workspace_id, segment_id))
            .map(|users| {
                users
                    .values()
                    .filter(|a| a.value.in_segment())
                    .map(|a| a.user_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl AssignmentStore for InMemoryAssignmentStore {
    fn get(
        &self,
        workspace_id: Uuid,
        user_id: &str,
        computed_property_id: Uuid,
    ) -> EngageResult<Option<Assignment>> {
        Ok(self
            .assignments
            .get(&(workspace_id, computed_property_id))
            .and_then(|users| users.get(user_id).cloned()))
    }

    fn write(&self, assignment: Assignment) -> EngageResult<WriteOutcome> {
        let mut users = self
            .assignments
            .entry((assignment.workspace_id, assignment.computed_property_id))
            .or_default();

        let outcome = match users.get_mut(&assignment.user_id) {
            Some(existing) if assignment.assigned_at < existing.assigned_at => {
                debug!(
                    user_id = %assignment.user_id,
                    computed_property_id = %assignment.computed_property_id,
                    "Discarding stale assignment"
                );
                WriteOutcome::Stale
            }
            Some(existing) if existing.value == assignment.value => {
                existing.assigned_at = assignment.assigned_at;
                WriteOutcome::Unchanged
            }
            Some(existing) => {
                let previous = std::mem::replace(existing, assignment);
                WriteOutcome::Written {
                    previous: Some(previous.value),
                }
            }
            None => {
                users.insert(assignment.user_id.clone(), assignment);
                WriteOutcome::Written { previous: None }
            }
        };
        Ok(outcome)
    }

    fn users_with_assignments(
        &self,
        workspace_id: Uuid,
        computed_property_id: Uuid,
    ) -> EngageResult<Vec<String>> {
        Ok(self
            .assignments
            .get(&(workspace_id, computed_property_id))
            .map(|users| users.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn list_for_user(&self, workspace_id: Uuid, user_id: &str) -> EngageResult<Vec<Assignment>> {
        let mut found: Vec<Assignment> = self
            .assignments
            .iter()
            .filter(|entry| entry.key().0 == workspace_id)
            .filter_map(|entry| entry.value().get(user_id).cloned())
            .collect();
        found.sort_by_key(|a| a.computed_property_id);
        Ok(found)
    }

    fn delete_property(&self, workspace_id: Uuid, computed_property_id: Uuid) -> EngageResult<usize> {
        Ok(self
            .assignments
            .remove(&(workspace_id, computed_property_id))
            .map(|(_, users)| users.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn member(ws: Uuid, cp: Uuid, user: &str, value: bool, ms: i64) -> Assignment {
        Assignment {
            workspace_id: ws,
            user_id: user.to_string(),
            computed_property_id: cp,
            value: AssignmentValue::Segment(value),
            assigned_at: at(ms),
            changed_at: at(ms),
        }
    }

    #[test]
    fn test_last_write_wins_by_window_to() {
        let store = InMemoryAssignmentStore::new();
        let (ws, cp) = (Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(
            store.write(member(ws, cp, "u1", true, 200)).unwrap(),
            WriteOutcome::Written { previous: None }
        );
        assert_eq!(store.write(member(ws, cp, "u1", false, 100)).unwrap(), WriteOutcome::Stale);
        assert!(store.get(ws, "u1", cp).unwrap().unwrap().value.in_segment());

        assert_eq!(store.write(member(ws, cp, "u1", true, 300)).unwrap(), WriteOutcome::Unchanged);
        let current = store.get(ws, "u1", cp).unwrap().unwrap();
        assert_eq!(current.assigned_at, at(300));
        assert_eq!(current.changed_at, at(200));

        assert_eq!(
            store.write(member(ws, cp, "u1", false, 400)).unwrap(),
            WriteOutcome::Written {
                previous: Some(AssignmentValue::Segment(true))
            }
        );
    }

    #[test]
    fn test_replay_is_a_no_op() {
        let store = InMemoryAssignmentStore::new();
        let (ws, cp) = (Uuid::new_v4(), Uuid::new_v4());
        store.write(member(ws, cp, "u1", true, 100)).unwrap();
        assert!(!store.write(member(ws, cp, "u1", true, 100)).unwrap().changed());
    }

    #[test]
    fn test_listing_and_deletion() {
        let store = InMemoryAssignmentStore::new();
        let ws = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.write(member(ws, a, "u2", true, 1)).unwrap();
        store.write(member(ws, a, "u1", false, 1)).unwrap();
        store.write(member(ws, b, "u1", true, 1)).unwrap();

        assert_eq!(store.users_with_assignments(ws, a).unwrap(), vec!["u1", "u2"]);
        assert_eq!(store.members(ws, a), vec!["u2".to_string()]);
        assert_eq!(store.list_for_user(ws, "u1").unwrap().len(), 2);
        assert_eq!(store.delete_property(ws, a).unwrap(), 2);
        assert_eq!(store.list_for_user(ws, "u1").unwrap().len(), 1);
    }
}
