//! Broadcast coordinator: turns a broadcast into a synthesized segment and
//! single-message journey, then enters every matching user exactly once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use engage_core::config::BroadcastConfig;
use engage_core::event_bus::{make_event, noop_sink, EventSink, LifecycleKind};
use engage_core::ids::deterministic_id;
use engage_core::{EngageError, EngageResult};
use engage_events::EventStore;
use engage_journey::{
    broadcast_instance_key, DurableHost, EnterOutcome, Journey, JourneyDefinition, JourneyEngine,
    JourneyNode, JourneyStatus, ReEntryPolicy, Semaphore, StartOutcome,
};
use engage_segmentation::{evaluate_segment, SegmentNode, SegmentationEngine, UserFacts};

use crate::types::{Broadcast, BroadcastStatus, TriggerOutcome, UpsertBroadcast};

/// Where a broadcast's orchestration instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Phase {
    /// Entering the audience. Resumed until every user is in.
    Audience,
    /// Audience entered, waiting for the journey instances to finish.
    Sending,
    Completed,
    Cancelled,
}

/// State kept on the durable host under the broadcast's instance key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Checkpoint {
    broadcast_id: Uuid,
    phase: Phase,
    /// Users entered so far.
    #[serde(default)]
    audience: usize,
}

impl Checkpoint {
    fn new(broadcast_id: Uuid, phase: Phase, audience: usize) -> Self {
        Self {
            broadcast_id,
            phase,
            audience,
        }
    }

    fn to_value(&self) -> EngageResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

pub struct BroadcastCoordinator {
    config: BroadcastConfig,
    broadcasts: DashMap<Uuid, Broadcast>,
    /// Serializes audience entry per broadcast.
    runs: DashMap<Uuid, Arc<Mutex<()>>>,
    segments: Arc<SegmentationEngine>,
    events: Arc<dyn EventStore>,
    journeys: Arc<JourneyEngine>,
    host: Arc<dyn DurableHost>,
    semaphore: Arc<Semaphore>,
    event_sink: Arc<dyn EventSink>,
}

impl BroadcastCoordinator {
    pub fn new(
        config: BroadcastConfig,
        segments: Arc<SegmentationEngine>,
        events: Arc<dyn EventStore>,
        journeys: Arc<JourneyEngine>,
        host: Arc<dyn DurableHost>,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_users)),
            config,
            broadcasts: DashMap::new(),
            runs: DashMap::new(),
            segments,
            events,
            journeys,
            host,
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Creates or updates a draft broadcast and its synthesized segment and
    /// journey. Once triggered, a broadcast's definition is frozen and the
    /// stored broadcast is returned unchanged.
    pub fn upsert(&self, request: UpsertBroadcast, now: DateTime<Utc>) -> EngageResult<Broadcast> {
        let workspace_id = request.workspace_id;
        let id = deterministic_id(&[&workspace_id.to_string(), &request.name]);
        let existing = self.get(workspace_id, &id);
        if let Some(existing) = &existing {
            if existing.status != BroadcastStatus::Draft {
                warn!(
                    workspace_id = %workspace_id,
                    broadcast_id = %id,
                    status = ?existing.status,
                    "Broadcast already triggered, definition left unchanged"
                );
                return Ok(existing.clone());
            }
        }

        let resource_name = Broadcast::resource_name(id);
        let mut audience = request
            .segment_definition
            .clone()
            .unwrap_or(SegmentNode::Broadcast);
        if let Some(group_id) = request.subscription_group_id {
            audience = SegmentNode::and(vec![
                audience,
                SegmentNode::SubscriptionGroup {
                    group_id,
                    kind: Default::default(),
                },
            ]);
        }
        let segment = self
            .segments
            .upsert_segment_by_name(workspace_id, &resource_name, audience, now)?;

        let journey_id = deterministic_id(&[&workspace_id.to_string(), "journey", &resource_name]);
        let template_id = request
            .message_template
            .template_id
            .clone()
            .unwrap_or_else(|| resource_name.clone());
        self.journeys.create_journey(Journey {
            id: journey_id,
            workspace_id,
            name: resource_name,
            status: JourneyStatus::Draft,
            definition: JourneyDefinition::new(vec![
                JourneyNode::Entry {
                    segment_id: segment.id,
                    child: 1,
                },
                JourneyNode::Message {
                    channel: request.message_template.channel,
                    template_id,
                    child: 2,
                },
                JourneyNode::Exit,
            ]),
            re_entry: ReEntryPolicy::Coalesce,
            can_run_multiple: false,
            created_at: now,
            updated_at: now,
            version: 0,
        })?;

        let broadcast = Broadcast {
            id,
            workspace_id,
            name: request.name,
            status: BroadcastStatus::Draft,
            segment_definition: request.segment_definition,
            message_template: request.message_template,
            subscription_group_id: request.subscription_group_id,
            segment_id: segment.id,
            journey_id,
            triggered_at: None,
            created_at: existing.map_or(now, |b| b.created_at),
            updated_at: now,
        };
        info!(workspace_id = %workspace_id, broadcast_id = %id, name = %broadcast.name, "Broadcast saved");
        self.broadcasts.insert(id, broadcast.clone());
        Ok(broadcast)
    }

    pub fn get(&self, workspace_id: Uuid, id: &Uuid) -> Option<Broadcast> {
        self.broadcasts
            .get(id)
            .filter(|b| b.workspace_id == workspace_id)
            .map(|b| b.clone())
    }

    pub fn list(&self, workspace_id: Uuid) -> Vec<Broadcast> {
        let mut broadcasts: Vec<Broadcast> = self
            .broadcasts
            .iter()
            .filter(|b| b.workspace_id == workspace_id)
            .map(|b| b.value().clone())
            .collect();
        broadcasts.sort_by(|a, b| a.name.cmp(&b.name));
        broadcasts
    }

    /// Starts the broadcast, or resumes one whose audience entry did not
    /// finish. The orchestration instance is started once; a caller that
    /// finds the broadcast already past its audience phase, or another
    /// caller mid-way through it, gets `AlreadyTriggered`.
    ///
    /// If any user fails to enter, the error is returned and the broadcast
    /// stays in its audience phase; it is neither completed nor forgotten,
    /// and the next `trigger` or `reconcile_all` enters the rest.
    pub async fn trigger(
        &self,
        workspace_id: Uuid,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> EngageResult<TriggerOutcome> {
        let broadcast = self
            .get(workspace_id, id)
            .ok_or_else(|| EngageError::NotFound(format!("broadcast {}", id)))?;
        let lock = self.lock_for(id);
        let Ok(_guard) = lock.try_lock() else {
            debug!(broadcast_id = %id, "Broadcast audience entry already running");
            return Ok(TriggerOutcome::AlreadyTriggered);
        };

        let key = broadcast_instance_key(workspace_id, *id);
        let phase = self.checkpoint(&key)?.map(|c| c.phase);
        let resumed = match self.get(workspace_id, id).map(|b| b.status) {
            Some(BroadcastStatus::Draft) => {
                let started = self
                    .host
                    .start_instance(&key, Checkpoint::new(*id, Phase::Audience, 0).to_value()?)?;
                if started == StartOutcome::AlreadyRunning {
                    warn!(broadcast_id = %id, "Adopting running orchestration instance of draft broadcast");
                }
                if !self.mark_in_progress(id, now) {
                    return Ok(TriggerOutcome::AlreadyTriggered);
                }
                info!(workspace_id = %workspace_id, broadcast_id = %id, "Broadcast triggered");
                metrics::counter!("broadcast.triggered").increment(1);
                self.emit(LifecycleKind::BroadcastInProgress, &broadcast, None);
                false
            }
            Some(BroadcastStatus::InProgress) if phase == Some(Phase::Audience) => {
                info!(workspace_id = %workspace_id, broadcast_id = %id, "Resuming broadcast audience entry");
                true
            }
            status => {
                debug!(broadcast_id = %id, status = ?status, "Broadcast already triggered");
                return Ok(TriggerOutcome::AlreadyTriggered);
            }
        };

        match self.journeys.get_journey(&broadcast.journey_id) {
            Some(journey) if journey.status == JourneyStatus::Published => {}
            _ => self.journeys.publish(&broadcast.journey_id, now)?,
        }
        let entered_before = self.checkpoint(&key)?.map_or(0, |c| c.audience);
        let audience = self
            .enter_audience(&broadcast, &key, entered_before, now)
            .await?;
        let outcome = if resumed {
            TriggerOutcome::Resumed { audience }
        } else {
            TriggerOutcome::Triggered { audience }
        };
        if !self.is_in_progress(id) {
            info!(broadcast_id = %id, audience, "Broadcast stopped during audience entry");
            return Ok(outcome);
        }

        self.host
            .record(&key, Checkpoint::new(*id, Phase::Sending, audience).to_value()?)?;
        info!(broadcast_id = %id, audience, "Broadcast audience entered");

        self.reconcile(workspace_id, id, now).await?;
        Ok(outcome)
    }

    /// Evaluates the synthesized segment for every known user in batches and
    /// enters matches into the broadcast journey, checkpointing the running
    /// total after each batch. Returns the total entered, starting from
    /// `entered_before`. Stops early if the broadcast is no longer in
    /// progress.
    async fn enter_audience(
        &self,
        broadcast: &Broadcast,
        key: &str,
        entered_before: usize,
        now: DateTime<Utc>,
    ) -> EngageResult<usize> {
        let definition = self
            .segments
            .get_segment(broadcast.workspace_id, &broadcast.segment_id)
            .ok_or_else(|| EngageError::NotFound(format!("segment {}", broadcast.segment_id)))?
            .definition;
        let definition = Arc::new(definition);
        let users = self.events.users(broadcast.workspace_id)?;

        let mut entered = entered_before;
        let mut failed = 0;
        for batch in users.chunks(self.config.batch_size.max(1)) {
            if !self.is_in_progress(&broadcast.id) {
                debug!(broadcast_id = %broadcast.id, "Broadcast no longer in progress, entry stopped");
                return Ok(entered);
            }
            let mut tasks = JoinSet::new();
            for user_id in batch {
                let permit = self.semaphore.acquire_owned().await;
                let events = self.events.clone();
                let journeys = self.journeys.clone();
                let definition = definition.clone();
                let user_id = user_id.clone();
                let (workspace_id, journey_id) = (broadcast.workspace_id, broadcast.journey_id);
                tasks.spawn(async move {
                    let _permit = permit;
                    enter_user(events, journeys, definition, workspace_id, journey_id, user_id, now)
                        .await
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(true)) => entered += 1,
                    Ok(Ok(false)) => {}
                    Ok(Err(err)) => {
                        failed += 1;
                        warn!(broadcast_id = %broadcast.id, error = %err, "Broadcast entry failed for user");
                    }
                    Err(err) => {
                        failed += 1;
                        warn!(broadcast_id = %broadcast.id, error = %err, "Broadcast task panicked");
                    }
                }
            }
            self.host.record(
                key,
                Checkpoint::new(broadcast.id, Phase::Audience, entered).to_value()?,
            )?;
            debug!(broadcast_id = %broadcast.id, batch = batch.len(), "Broadcast batch processed");
        }

        if failed > 0 {
            metrics::counter!("broadcast.entry_failures").increment(failed as u64);
            return Err(EngageError::Transient(format!(
                "{} of {} users could not be entered into broadcast {}",
                failed,
                users.len(),
                broadcast.id
            )));
        }
        Ok(entered)
    }

    /// Marks an in-progress broadcast `Completed` once its audience has been
    /// entered and none of its journey instances is live, and stops further
    /// entries. Returns the status.
    pub async fn reconcile(
        &self,
        workspace_id: Uuid,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> EngageResult<BroadcastStatus> {
        let broadcast = self
            .get(workspace_id, id)
            .ok_or_else(|| EngageError::NotFound(format!("broadcast {}", id)))?;
        if broadcast.status != BroadcastStatus::InProgress {
            return Ok(broadcast.status);
        }
        let key = broadcast_instance_key(workspace_id, *id);
        let Some(checkpoint) = self.checkpoint(&key)? else {
            return Ok(BroadcastStatus::InProgress);
        };
        if checkpoint.phase != Phase::Sending {
            return Ok(BroadcastStatus::InProgress);
        }
        if !self.journeys.live_instances(&broadcast.journey_id)?.is_empty() {
            return Ok(BroadcastStatus::InProgress);
        }
        if !self.advance(id, BroadcastStatus::Completed, now) {
            return Ok(self.get(workspace_id, id).map_or(broadcast.status, |b| b.status));
        }

        self.journeys.pause(&broadcast.journey_id, now)?;
        self.host.finish(
            &key,
            Checkpoint::new(*id, Phase::Completed, checkpoint.audience).to_value()?,
        )?;
        info!(workspace_id = %workspace_id, broadcast_id = %id, "Broadcast completed");
        self.emit(LifecycleKind::BroadcastCompleted, &broadcast, None);
        Ok(BroadcastStatus::Completed)
    }

    /// Resumes unfinished audience entry and reconciles every in-progress
    /// broadcast. Returns how many completed.
    pub async fn reconcile_all(&self, now: DateTime<Utc>) -> usize {
        let in_progress: Vec<(Uuid, Uuid)> = self
            .broadcasts
            .iter()
            .filter(|b| b.status == BroadcastStatus::InProgress)
            .map(|b| (b.workspace_id, b.id))
            .collect();
        let mut completed = 0;
        for (workspace_id, id) in in_progress {
            let key = broadcast_instance_key(workspace_id, id);
            let settled = match self.checkpoint(&key) {
                Ok(Some(checkpoint)) if checkpoint.phase == Phase::Audience => self
                    .trigger(workspace_id, &id, now)
                    .await
                    .map(|_| self.get(workspace_id, &id).map(|b| b.status)),
                Ok(_) => self.reconcile(workspace_id, &id, now).await.map(Some),
                Err(err) => Err(err),
            };
            match settled {
                Ok(Some(BroadcastStatus::Completed)) => completed += 1,
                Ok(_) => {}
                Err(err) => warn!(broadcast_id = %id, error = %err, "Broadcast reconcile failed"),
            }
        }
        completed
    }

    /// Cancels an in-progress broadcast and every live instance of its
    /// journey. Returns `false` if the broadcast was not in progress.
    pub async fn abort(&self, workspace_id: Uuid, id: &Uuid, now: DateTime<Utc>) -> EngageResult<bool> {
        let broadcast = self
            .get(workspace_id, id)
            .ok_or_else(|| EngageError::NotFound(format!("broadcast {}", id)))?;
        if !self.advance(id, BroadcastStatus::Cancelled, now) {
            return Ok(false);
        }
        // An audience pass in flight stops at its next batch.
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let key = broadcast_instance_key(workspace_id, *id);
        let audience = self.checkpoint(&key)?.map_or(0, |c| c.audience);
        let cancelled = self.journeys.archive(&broadcast.journey_id, now).await?;
        self.host
            .finish(&key, Checkpoint::new(*id, Phase::Cancelled, audience).to_value()?)?;
        info!(workspace_id = %workspace_id, broadcast_id = %id, cancelled, "Broadcast aborted");
        self.emit(
            LifecycleKind::BroadcastCancelled,
            &broadcast,
            Some(format!("{} instances cancelled", cancelled)),
        );
        Ok(true)
    }

    /// Moves a draft to `InProgress` and stamps the trigger time.
    fn mark_in_progress(&self, id: &Uuid, now: DateTime<Utc>) -> bool {
        match self.broadcasts.get_mut(id) {
            Some(mut broadcast) if broadcast.status == BroadcastStatus::Draft => {
                broadcast.status = BroadcastStatus::InProgress;
                broadcast.triggered_at = Some(now);
                broadcast.updated_at = now;
                true
            }
            _ => false,
        }
    }

    fn is_in_progress(&self, id: &Uuid) -> bool {
        self.broadcasts
            .get(id)
            .is_some_and(|b| b.status == BroadcastStatus::InProgress)
    }

    fn checkpoint(&self, key: &str) -> EngageResult<Option<Checkpoint>> {
        match self.host.query(key)? {
            Some(record) => Ok(Some(serde_json::from_value(record.state)?)),
            None => Ok(None),
        }
    }

    fn lock_for(&self, id: &Uuid) -> Arc<Mutex<()>> {
        self.runs
            .entry(*id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Applies a forward status change; `false` if it is not allowed from
    /// the current status.
    fn advance(&self, id: &Uuid, next: BroadcastStatus, now: DateTime<Utc>) -> bool {
        match self.broadcasts.get_mut(id) {
            Some(mut broadcast) if broadcast.status.can_transition_to(next) => {
                broadcast.status = next;
                broadcast.updated_at = now;
                true
            }
            _ => false,
        }
    }

    fn emit(&self, kind: LifecycleKind, broadcast: &Broadcast, detail: Option<String>) {
        self.event_sink.emit(make_event(
            kind,
            broadcast.workspace_id,
            broadcast.id,
            None,
            detail,
        ));
    }
}

/// Enters one user if they match the audience. Returns whether a new
/// instance started.
async fn enter_user(
    events: Arc<dyn EventStore>,
    journeys: Arc<JourneyEngine>,
    definition: Arc<SegmentNode>,
    workspace_id: Uuid,
    journey_id: Uuid,
    user_id: String,
    now: DateTime<Utc>,
) -> EngageResult<bool> {
    let history = events.user_events(workspace_id, &user_id, now)?;
    let facts = UserFacts::from_events(user_id.clone(), history);
    if !evaluate_segment(&definition, &facts, now) {
        return Ok(false);
    }
    let outcome = journeys
        .enter(&journey_id, &user_id, now.timestamp_millis(), now)
        .await?;
    Ok(matches!(outcome, EnterOutcome::Entered { .. }))
}
