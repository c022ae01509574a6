//! Polling scheduler: one Tokio task per workspace running evaluation
//! cycles on a jittered period, forwarding membership deltas downstream.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use engage_core::config::ComputedPropertiesConfig;
use engage_core::types::SegmentUpdate;
use engage_core::EngageResult;

use crate::incremental::{EvaluationOutcome, IncrementalEvaluator};

pub struct ComputePropertiesScheduler {
    config: ComputedPropertiesConfig,
    evaluator: Arc<IncrementalEvaluator>,
    updates: mpsc::Sender<SegmentUpdate>,
    wakers: DashMap<Uuid, Arc<Notify>>,
}

impl ComputePropertiesScheduler {
    pub fn new(
        config: ComputedPropertiesConfig,
        evaluator: Arc<IncrementalEvaluator>,
        updates: mpsc::Sender<SegmentUpdate>,
    ) -> Self {
        Self {
            config,
            evaluator,
            updates,
            wakers: DashMap::new(),
        }
    }

    /// Requests an early cycle for the workspace, e.g. after ingestion.
    pub fn wake(&self, workspace_id: Uuid) {
        self.waker(workspace_id).notify_one();
    }

    fn waker(&self, workspace_id: Uuid) -> Arc<Notify> {
        self.wakers
            .entry(workspace_id)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Runs one cycle now and forwards its segment updates.
    pub async fn run_once(&self, workspace_id: Uuid) -> EngageResult<EvaluationOutcome> {
        let outcome = self.evaluator.evaluate(workspace_id, Utc::now())?;
        for update in &outcome.segment_updates {
            if self.updates.send(update.clone()).await.is_err() {
                debug!(workspace_id = %workspace_id, "Segment update receiver closed");
                break;
            }
        }
        Ok(outcome)
    }

    fn next_delay(&self) -> Duration {
        let jitter = if self.config.polling_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.polling_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.config.base_polling_period_ms + jitter)
    }

    /// Spawns the polling loop for one workspace. The loop stops when
    /// `shutdown` turns true or its sender is dropped.
    pub fn spawn_workspace(
        self: &Arc<Self>,
        workspace_id: Uuid,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        let waker = self.waker(workspace_id);
        tokio::spawn(async move {
            info!(workspace_id = %workspace_id, "Computed properties scheduler started");
            loop {
                match scheduler.run_once(workspace_id).await {
                    Ok(outcome) => debug!(
                        workspace_id = %workspace_id,
                        updated = outcome.updated_computed_property_ids.len(),
                        segment_updates = outcome.segment_updates.len(),
                        "Evaluation cycle finished"
                    ),
                    Err(e) => {
                        metrics::counter!("computed_properties.cycle_errors").increment(1);
                        error!(workspace_id = %workspace_id, error = %e, "Evaluation cycle failed");
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(scheduler.next_delay()) => {}
                    _ = waker.notified() => {
                        debug!(workspace_id = %workspace_id, "Woken early");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(workspace_id = %workspace_id, "Computed properties scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignments::InMemoryAssignmentStore;
    use crate::definition::SegmentNode;
    use crate::engine::SegmentationEngine;
    use crate::periods::InMemoryPeriodStore;
    use engage_core::event_bus::noop_sink;
    use engage_core::types::{Event, EventType};
    use engage_events::{EventStore, InMemoryEventStore};
    use serde_json::json;

    fn setup(
        base_polling_period_ms: u64,
    ) -> (
        Arc<ComputePropertiesScheduler>,
        Arc<InMemoryEventStore>,
        mpsc::Receiver<SegmentUpdate>,
        Uuid,
        Uuid,
    ) {
        let config = ComputedPropertiesConfig {
            base_polling_period_ms,
            polling_jitter_ms: 0,
            jitter_guard_coefficient: 0.0,
            ..ComputedPropertiesConfig::default()
        };
        let events = Arc::new(InMemoryEventStore::new());
        let registry = Arc::new(SegmentationEngine::new());
        let ws = Uuid::new_v4();
        let segment = registry
            .upsert_segment_by_name(ws, "Everyone", SegmentNode::Broadcast, Utc::now())
            .unwrap();
        let evaluator = Arc::new(IncrementalEvaluator::new(
            config.clone(),
            registry,
            events.clone(),
            Arc::new(InMemoryPeriodStore::new()),
            Arc::new(InMemoryAssignmentStore::new()),
            noop_sink(),
        ));
        let (tx, rx) = mpsc::channel(16);
        let scheduler = Arc::new(ComputePropertiesScheduler::new(config, evaluator, tx));
        (scheduler, events, rx, ws, segment.id)
    }

    fn login(user: &str, timestamp: chrono::DateTime<Utc>) -> Event {
        Event {
            workspace_id: Uuid::nil(),
            user_id: Some(user.to_string()),
            anonymous_id: None,
            message_id: format!("login-{}", user),
            event_type: EventType::Track,
            event: Some("Login".into()),
            timestamp,
            properties: json!({}),
        }
    }

    #[tokio::test]
    async fn test_run_once_forwards_updates() {
        let (scheduler, events, mut rx, ws, segment_id) = setup(60_000);
        events
            .insert_batch(ws, vec![login("u1", Utc::now() - chrono::Duration::seconds(1))])
            .unwrap();

        let outcome = scheduler.run_once(ws).await.unwrap();
        assert_eq!(outcome.segment_updates.len(), 1);
        let update = rx.recv().await.unwrap();
        assert_eq!(update.segment_id, segment_id);
        assert!(update.currently_in_segment);
    }

    #[tokio::test]
    async fn test_wake_triggers_early_cycle() {
        let (scheduler, events, mut rx, ws, _) = setup(3_600_000);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = scheduler.spawn_workspace(ws, shutdown_rx);

        // First cycle runs immediately on an empty workspace; give it a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        events.insert_batch(ws, vec![login("u2", Utc::now())]).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.wake(ws);

        let update = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("woken cycle should run before the hour-long period")
            .unwrap();
        assert_eq!(update.user_id, "u2");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
