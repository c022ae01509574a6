//! Computed-property period tracker: the last processed window per
//! `(workspace, computed property, definition version)`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use engage_core::types::ComputedPropertyPeriod;
use engage_core::{EngageError, EngageResult};

pub trait PeriodStore: Send + Sync {
    /// Most recent period recorded for this definition version.
    fn latest(
        &self,
        workspace_id: Uuid,
        computed_property_id: Uuid,
        version: i64,
    ) -> EngageResult<Option<ComputedPropertyPeriod>>;

    /// Records a processed window. The window must start exactly where the
    /// previous one of the same version ended (or be the first, with no
    /// `from`); anything else is an overlap or gap and is refused.
    fn advance(&self, period: ComputedPropertyPeriod) -> EngageResult<()>;

    /// Latest period of every computed property in the workspace.
    fn get_periods(&self, workspace_id: Uuid) -> EngageResult<Vec<ComputedPropertyPeriod>>;

    /// Full window history of one property, oldest first.
    fn history(
        &self,
        workspace_id: Uuid,
        computed_property_id: Uuid,
    ) -> EngageResult<Vec<ComputedPropertyPeriod>>;

    /// Users whose evaluation failed in the last processed window and must be
    /// re-evaluated in the next one.
    fn pending_users(
        &self,
        workspace_id: Uuid,
        computed_property_id: Uuid,
    ) -> EngageResult<BTreeSet<String>>;

    /// Replaces the pending set. Written before the period that skipped
    /// these users advances.
    fn set_pending_users(
        &self,
        workspace_id: Uuid,
        computed_property_id: Uuid,
        users: BTreeSet<String>,
    ) -> EngageResult<()>;

    /// Deletes every period and pending user of the property, forcing a full
    /// rebuild.
    fn reset(&self, workspace_id: Uuid, computed_property_id: Uuid) -> EngageResult<usize>;

    /// Drops periods that ended more than `retention` before the latest one
    /// of the same property. The latest is always kept.
    fn prune(&self, retention: chrono::Duration) -> EngageResult<usize>;
}

#[derive(Default)]
pub struct InMemoryPeriodStore {
    periods: DashMap<(Uuid, Uuid), Vec<ComputedPropertyPeriod>>,
    pending: DashMap<(Uuid, Uuid), BTreeSet<String>>,
}

impl InMemoryPeriodStore {
    pub fn new() -> Self {
        Self {
            periods: DashMap::new(),
            pending: DashMap::new(),
        }
    }
}

fn latest_of(periods: &[ComputedPropertyPeriod]) -> Option<&ComputedPropertyPeriod> {
    periods.iter().max_by_key(|p| (p.last_processed_to, p.version))
}

impl PeriodStore for InMemoryPeriodStore {
    fn latest(
        &self,
        workspace_id: Uuid,
        computed_property_id: Uuid,
        version: i64,
    ) -> EngageResult<Option<ComputedPropertyPeriod>> {
        Ok(self
            .periods
            .get(&(workspace_id, computed_property_id))
            .and_then(|periods| {
                periods
                    .iter()
                    .filter(|p| p.version == version)
                    .max_by_key(|p| p.last_processed_to)
                    .cloned()
            }))
    }

    fn advance(&self, period: ComputedPropertyPeriod) -> EngageResult<()> {
        let mut periods = self
            .periods
            .entry((period.workspace_id, period.computed_property_id))
            .or_default();
        let previous_to: Option<DateTime<Utc>> = periods
            .iter()
            .filter(|p| p.version == period.version)
            .map(|p| p.last_processed_to)
            .max();

        let contiguous = match (previous_to, period.last_processed_from) {
            (None, None) => true,
            (Some(prev), Some(from)) => from == prev,
            _ => false,
        };
        if !contiguous || period.last_processed_from.map_or(false, |f| f >= period.last_processed_to) {
            return Err(EngageError::InvariantViolation(format!(
                "period [{:?}, {}) for computed property {} does not continue from {:?}",
                period.last_processed_from,
                period.last_processed_to,
                period.computed_property_id,
                previous_to
            )));
        }

        debug!(
            workspace_id = %period.workspace_id,
            computed_property_id = %period.computed_property_id,
            to = %period.last_processed_to,
            "Period advanced"
        );
        periods.push(period);
        Ok(())
    }

    fn get_periods(&self, workspace_id: Uuid) -> EngageResult<Vec<ComputedPropertyPeriod>> {
        let mut latest: BTreeMap<Uuid, ComputedPropertyPeriod> = BTreeMap::new();
        for entry in self.periods.iter().filter(|e| e.key().0 == workspace_id) {
            if let Some(period) = latest_of(entry.value()) {
                latest.insert(entry.key().1, period.clone());
            }
        }
        Ok(latest.into_values().collect())
    }

    fn history(
        &self,
        workspace_id: Uuid,
        computed_property_id: Uuid,
    ) -> EngageResult<Vec<ComputedPropertyPeriod>> {
        let mut history = self
            .periods
            .get(&(workspace_id, computed_property_id))
            .map(|periods| periods.clone())
            .unwrap_or_default();
        history.sort_by_key(|p| (p.version, p.last_processed_to));
        Ok(history)
    }

    fn pending_users(
        &self,
        workspace_id: Uuid,
        computed_property_id: Uuid,
    ) -> EngageResult<BTreeSet<String>> {
        Ok(self
            .pending
            .get(&(workspace_id, computed_property_id))
            .map(|users| users.clone())
            .unwrap_or_default())
    }

    fn set_pending_users(
        &self,
        workspace_id: Uuid,
        computed_property_id: Uuid,
        users: BTreeSet<String>,
    ) -> EngageResult<()> {
        if users.is_empty() {
            self.pending.remove(&(workspace_id, computed_property_id));
        } else {
            self.pending.insert((workspace_id, computed_property_id), users);
        }
        Ok(())
    }

    fn reset(&self, workspace_id: Uuid, computed_property_id: Uuid) -> EngageResult<usize> {
        self.pending.remove(&(workspace_id, computed_property_id));
        Ok(self
            .periods
            .remove(&(workspace_id, computed_property_id))
            .map(|(_, periods)| periods.len())
            .unwrap_or(0))
    }

    fn prune(&self, retention: chrono::Duration) -> EngageResult<usize> {
        let mut pruned = 0;
        for mut entry in self.periods.iter_mut() {
            let Some(latest) = latest_of(entry.value()).cloned() else {
                continue;
            };
            let Some(cutoff) = latest.last_processed_to.checked_sub_signed(retention) else {
                continue;
            };
            let before = entry.len();
            entry.retain(|p| p == &latest || p.last_processed_to >= cutoff);
            pruned += before - entry.len();
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use engage_core::types::ComputedPropertyType;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn period(ws: Uuid, cp: Uuid, version: i64, from: Option<i64>, to: i64) -> ComputedPropertyPeriod {
        ComputedPropertyPeriod {
            workspace_id: ws,
            computed_property_id: cp,
            property_type: ComputedPropertyType::Segment,
            version,
            last_processed_from: from.map(at),
            last_processed_to: at(to),
        }
    }

    #[test]
    fn test_advance_requires_contiguous_windows() {
        let store = InMemoryPeriodStore::new();
        let (ws, cp) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(store.advance(period(ws, cp, 1, Some(0), 100)).is_err());
        store.advance(period(ws, cp, 1, None, 100)).unwrap();
        store.advance(period(ws, cp, 1, Some(100), 200)).unwrap();

        let overlap = store.advance(period(ws, cp, 1, Some(150), 300)).unwrap_err();
        assert!(matches!(overlap, EngageError::InvariantViolation(_)));
        assert!(store.advance(period(ws, cp, 1, Some(250), 300)).is_err());
        assert!(store.advance(period(ws, cp, 1, Some(200), 200)).is_err());

        assert_eq!(store.latest(ws, cp, 1).unwrap().unwrap().last_processed_to, at(200));
    }

    #[test]
    fn test_new_version_starts_from_scratch() {
        let store = InMemoryPeriodStore::new();
        let (ws, cp) = (Uuid::new_v4(), Uuid::new_v4());
        store.advance(period(ws, cp, 1, None, 100)).unwrap();
        assert!(store.latest(ws, cp, 2).unwrap().is_none());
        store.advance(period(ws, cp, 2, None, 150)).unwrap();

        let periods = store.get_periods(ws).unwrap();
        assert_eq!(periods.len(), 1);
        assert_eq!(periods[0].version, 2);
    }

    #[test]
    fn test_prune_keeps_latest() {
        let store = InMemoryPeriodStore::new();
        let (ws, cp) = (Uuid::new_v4(), Uuid::new_v4());
        store.advance(period(ws, cp, 1, None, 100)).unwrap();
        store.advance(period(ws, cp, 1, Some(100), 200)).unwrap();
        store.advance(period(ws, cp, 1, Some(200), 10_000)).unwrap();

        let pruned = store.prune(chrono::Duration::milliseconds(1_000)).unwrap();
        assert_eq!(pruned, 2);
        assert_eq!(store.history(ws, cp).unwrap().len(), 1);
        store.advance(period(ws, cp, 1, Some(10_000), 10_500)).unwrap();
    }

    #[test]
    fn test_reset_forces_rebuild() {
        let store = InMemoryPeriodStore::new();
        let (ws, cp) = (Uuid::new_v4(), Uuid::new_v4());
        store.advance(period(ws, cp, 1, None, 100)).unwrap();
        store
            .set_pending_users(ws, cp, BTreeSet::from(["u2".to_string()]))
            .unwrap();
        assert_eq!(store.reset(ws, cp).unwrap(), 1);
        assert!(store.latest(ws, cp, 1).unwrap().is_none());
        assert!(store.pending_users(ws, cp).unwrap().is_empty());
        store.advance(period(ws, cp, 1, None, 300)).unwrap();
    }
}
