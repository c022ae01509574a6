//! Incremental computed-properties evaluation over contiguous windows.
//!
//! Each cycle evaluates the window `[last_processed_to, now - jitter_guard)`
//! for every computed property of a workspace. Only users with events in the
//! window (plus previously failed users and, for time-dependent definitions,
//! every user already assigned) are re-evaluated. Assignments are written
//! before the period advances, so a crash in between replays the window and
//! the replay is absorbed by last-write-wins.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use engage_core::config::ComputedPropertiesConfig;
use engage_core::event_bus::{make_event, EventSink, LifecycleKind};
use engage_core::types::{
    Assignment, AssignmentValue, ComputedPropertyPeriod, EventType, SegmentUpdate,
};
use engage_core::EngageResult;
use engage_events::EventStore;

use crate::assignments::{AssignmentStore, WriteOutcome};
use crate::engine::{ComputedProperty, SegmentationEngine};
use crate::evaluator::evaluate_segment;
use crate::facts::UserFacts;
use crate::periods::PeriodStore;
use crate::predicates::MAX_WINDOW_MILLIS;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationOutcome {
    /// Properties whose period advanced this cycle.
    pub updated_computed_property_ids: Vec<Uuid>,
    /// Users with at least one changed assignment.
    pub affected_users: BTreeSet<String>,
    /// Membership flips, in evaluation order.
    pub segment_updates: Vec<SegmentUpdate>,
    pub failed_users: usize,
}

pub struct IncrementalEvaluator {
    config: ComputedPropertiesConfig,
    registry: Arc<SegmentationEngine>,
    events: Arc<dyn EventStore>,
    periods: Arc<dyn PeriodStore>,
    assignments: Arc<dyn AssignmentStore>,
    sink: Arc<dyn EventSink>,
}

impl IncrementalEvaluator {
    pub fn new(
        config: ComputedPropertiesConfig,
        registry: Arc<SegmentationEngine>,
        events: Arc<dyn EventStore>,
        periods: Arc<dyn PeriodStore>,
        assignments: Arc<dyn AssignmentStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            registry,
            events,
            periods,
            assignments,
            sink,
        }
    }

    pub fn registry(&self) -> &Arc<SegmentationEngine> {
        &self.registry
    }

    pub fn assignments(&self) -> &Arc<dyn AssignmentStore> {
        &self.assignments
    }

    pub fn periods(&self) -> &Arc<dyn PeriodStore> {
        &self.periods
    }

    /// Runs one cycle for the workspace with the window ending at
    /// `now - jitter_guard`.
    pub fn evaluate(&self, workspace_id: Uuid, now: DateTime<Utc>) -> EngageResult<EvaluationOutcome> {
        self.evaluate_until(workspace_id, now - self.config.jitter_guard())
    }

    /// Runs one cycle with an explicit window end.
    pub fn evaluate_until(
        &self,
        workspace_id: Uuid,
        to: DateTime<Utc>,
    ) -> EngageResult<EvaluationOutcome> {
        let mut outcome = EvaluationOutcome::default();
        for property in self.registry.computed_properties(workspace_id) {
            match self.evaluate_property(workspace_id, &property, to, &mut outcome) {
                Ok(true) => outcome.updated_computed_property_ids.push(property.id()),
                Ok(false) => {}
                Err(e) => warn!(
                    workspace_id = %workspace_id,
                    computed_property_id = %property.id(),
                    error = %e,
                    "Computed property evaluation failed, retrying next cycle"
                ),
            }
        }

        let retention =
            chrono::Duration::milliseconds(self.config.period_retention_ms.min(MAX_WINDOW_MILLIS) as i64);
        let pruned = self.periods.prune(retention)?;
        if pruned > 0 {
            debug!(pruned, "Pruned computed property periods");
        }
        Ok(outcome)
    }

    /// Returns whether the period advanced.
    fn evaluate_property(
        &self,
        workspace_id: Uuid,
        property: &ComputedProperty,
        to: DateTime<Utc>,
        outcome: &mut EvaluationOutcome,
    ) -> EngageResult<bool> {
        let id = property.id();
        let version = property.version();
        let from = self
            .periods
            .latest(workspace_id, id, version)?
            .map(|p| p.last_processed_to);
        if from.map_or(false, |f| to <= f) {
            return Ok(false);
        }

        let candidates = self.candidates(workspace_id, property, from, to)?;
        let mut failed = BTreeSet::new();
        for user_id in &candidates {
            match self.evaluate_user(workspace_id, property, user_id, to, outcome) {
                Ok(()) => {}
                Err(e) => {
                    warn!(
                        workspace_id = %workspace_id,
                        computed_property_id = %id,
                        user_id = %user_id,
                        error = %e,
                        "User evaluation failed"
                    );
                    metrics::counter!("computed_properties.user_failures").increment(1);
                    failed.insert(user_id.clone());
                }
            }
        }
        outcome.failed_users += failed.len();
        self.periods.set_pending_users(workspace_id, id, failed)?;

        self.periods.advance(ComputedPropertyPeriod {
            workspace_id,
            computed_property_id: id,
            property_type: property.property_type(),
            version,
            last_processed_from: from,
            last_processed_to: to,
        })?;
        info!(
            workspace_id = %workspace_id,
            computed_property_id = %id,
            name = %property.name(),
            users = candidates.len(),
            to = %to,
            "Period advanced"
        );
        self.sink.emit(make_event(
            LifecycleKind::PeriodAdvanced,
            workspace_id,
            id,
            None,
            Some(format!("{}", to.timestamp_millis())),
        ));
        Ok(true)
    }

    fn candidates(
        &self,
        workspace_id: Uuid,
        property: &ComputedProperty,
        from: Option<DateTime<Utc>>,
        to: DateTime<Utc>,
    ) -> EngageResult<BTreeSet<String>> {
        let Some(from) = from else {
            return Ok(self.events.users(workspace_id)?.into_iter().collect());
        };
        let mut users: BTreeSet<String> = self
            .events
            .events_in_window(workspace_id, Some(from), to)?
            .iter()
            .filter_map(|e| e.user_key().map(str::to_string))
            .collect();
        users.extend(self.periods.pending_users(workspace_id, property.id())?);
        if property.is_time_dependent() {
            users.extend(
                self.assignments
                    .users_with_assignments(workspace_id, property.id())?,
            );
        }
        Ok(users)
    }

    fn evaluate_user(
        &self,
        workspace_id: Uuid,
        property: &ComputedProperty,
        user_id: &str,
        to: DateTime<Utc>,
        outcome: &mut EvaluationOutcome,
    ) -> EngageResult<()> {
        let lookback = chrono::Duration::milliseconds(self.config.max_lookback_ms.min(MAX_WINDOW_MILLIS) as i64);
        let lookback_start = to.checked_sub_signed(lookback);
        let events: Vec<_> = self
            .events
            .user_events(workspace_id, user_id, to)?
            .into_iter()
            .filter(|e| {
                e.event_type == EventType::Identify
                    || lookback_start.map_or(true, |start| e.timestamp >= start)
            })
            .collect();
        let facts = UserFacts::from_events(user_id, events);
        if !facts.has_history() {
            return Ok(());
        }

        let value = match property {
            ComputedProperty::Segment(segment) => {
                AssignmentValue::Segment(evaluate_segment(&segment.definition, &facts, to))
            }
            ComputedProperty::UserProperty(user_property) => {
                match user_property.definition.evaluate(&facts, to) {
                    Ok(Some(value)) => AssignmentValue::UserProperty(value),
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        warn!(
                            user_id = %user_id,
                            user_property_id = %user_property.id,
                            error = %e,
                            "User property evaluation failed"
                        );
                        return Ok(());
                    }
                }
            }
        };

        let in_segment = value.in_segment();
        let written = self.assignments.write(Assignment {
            workspace_id,
            user_id: user_id.to_string(),
            computed_property_id: property.id(),
            value,
            assigned_at: to,
            changed_at: to,
        })?;
        let WriteOutcome::Written { previous } = written else {
            return Ok(());
        };
        metrics::counter!("computed_properties.assignments_written").increment(1);
        outcome.affected_users.insert(user_id.to_string());

        if let ComputedProperty::Segment(segment) = property {
            let was_in_segment = previous.as_ref().map_or(false, AssignmentValue::in_segment);
            if was_in_segment != in_segment {
                debug!(
                    user_id = %user_id,
                    segment_id = %segment.id,
                    in_segment,
                    "Segment membership changed"
                );
                let kind = if in_segment {
                    LifecycleKind::SegmentEntered
                } else {
                    LifecycleKind::SegmentExited
                };
                self.sink.emit(make_event(
                    kind,
                    workspace_id,
                    segment.id,
                    Some(user_id.to_string()),
                    None,
                ));
                outcome.segment_updates.push(SegmentUpdate {
                    workspace_id,
                    user_id: user_id.to_string(),
                    segment_id: segment.id,
                    currently_in_segment: in_segment,
                    segment_version: to.timestamp_millis(),
                });
            }
        }
        Ok(())
    }

    /// Deletes a computed property with its periods and assignments.
    pub fn delete_computed_property(&self, workspace_id: Uuid, id: Uuid) -> EngageResult<bool> {
        let removed = self.registry.delete_segment(workspace_id, &id).is_some()
            | self.registry.delete_user_property(workspace_id, &id).is_some();
        let periods = self.periods.reset(workspace_id, id)?;
        let assignments = self.assignments.delete_property(workspace_id, id)?;
        info!(
            workspace_id = %workspace_id,
            computed_property_id = %id,
            periods,
            assignments,
            "Computed property deleted"
        );
        Ok(removed)
    }

    /// Forgets every processed window of the property; the next cycle
    /// re-evaluates its whole history.
    pub fn backfill(&self, workspace_id: Uuid, id: Uuid) -> EngageResult<()> {
        let periods = self.periods.reset(workspace_id, id)?;
        info!(workspace_id = %workspace_id, computed_property_id = %id, periods, "Backfill requested");
        Ok(())
    }
}
