use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use engage_core::config::JourneyConfig;
use engage_core::event_bus::{make_event, noop_sink, EventSink, LifecycleKind};
use engage_core::ids::deterministic_id;
use engage_core::types::SegmentUpdate;
use engage_core::{EngageError, EngageResult};
use engage_segmentation::AssignmentStore;

use crate::channel::{ChannelTransport, MessageRequest, SendOutcome};
use crate::durable::{journey_instance_key, DurableHost, StartOutcome};
use crate::evaluator::{message_id, JourneyEvaluator, StepResult};
use crate::semaphore::Semaphore;
use crate::state_machine::JourneyStateMachine;
use crate::types::{
    ChannelType, DelayVariant, InstanceState, Journey, JourneyInstance, JourneyNode,
    JourneyStats, JourneyStatus, NodeId, ReEntryPolicy, SegmentSignal, StepRecord,
};
use crate::validation::validate;

/// What an entry attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum EnterOutcome {
    Entered { instance_id: Uuid },
    /// Folded into the user's live instance.
    Coalesced,
    /// The live instance was cancelled and a new run started.
    Restarted { instance_id: Uuid },
    /// Stale entry signal, or the journey does not allow another run.
    Ignored,
    /// The journey is not published.
    NotRunnable,
}

/// External events delivered to a live instance through the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
enum InstanceSignal {
    Segment {
        segment_id: Uuid,
        signal: SegmentSignal,
    },
}

/// Runs one durable instance per `(journey, user)` on the host, checkpointing
/// after every transition so a restarted engine resumes where the last
/// record left off.
pub struct JourneyEngine {
    journeys: Arc<DashMap<Uuid, Journey>>,
    host: Arc<dyn DurableHost>,
    transport: Arc<dyn ChannelTransport>,
    assignments: Arc<dyn AssignmentStore>,
    semaphore: Arc<Semaphore>,
    config: JourneyConfig,
    evaluator: JourneyEvaluator,
    state_machine: JourneyStateMachine,
    locks: DashMap<String, Arc<Mutex<()>>>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for JourneyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JourneyEngine")
            .field("journeys", &self.journeys.len())
            .field("max_concurrent_sends", &self.semaphore.max())
            .finish()
    }
}

impl JourneyEngine {
    pub fn new(
        config: JourneyConfig,
        host: Arc<dyn DurableHost>,
        transport: Arc<dyn ChannelTransport>,
        assignments: Arc<dyn AssignmentStore>,
    ) -> Self {
        Self {
            journeys: Arc::new(DashMap::new()),
            host,
            transport,
            assignments,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_sends)),
            config,
            evaluator: JourneyEvaluator::new(),
            state_machine: JourneyStateMachine::new(),
            locks: DashMap::new(),
            event_sink: noop_sink(),
        }
    }

    /// Attach an event sink for lifecycle notifications.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn semaphore(&self) -> &Arc<Semaphore> {
        &self.semaphore
    }

    // ── Journey definitions ─────────────────────────────────────────────

    /// Stores (or replaces) a journey. Published journeys are validated
    /// first.
    pub fn create_journey(&self, journey: Journey) -> EngageResult<Uuid> {
        if journey.status == JourneyStatus::Published {
            validate(&journey.definition)?;
        }
        let id = journey.id;
        info!(journey_id = %id, name = %journey.name, status = ?journey.status, "Storing journey");
        self.journeys.insert(id, journey);
        Ok(id)
    }

    pub fn publish(&self, id: &Uuid, now: DateTime<Utc>) -> EngageResult<()> {
        let mut journey = self
            .journeys
            .get_mut(id)
            .ok_or_else(|| EngageError::NotFound(format!("journey {}", id)))?;
        if journey.status == JourneyStatus::Archived {
            return Err(EngageError::InvariantViolation(format!(
                "journey {} is archived",
                id
            )));
        }
        validate(&journey.definition)?;
        journey.status = JourneyStatus::Published;
        journey.version += 1;
        journey.updated_at = now;
        info!(journey_id = %id, version = journey.version, "Journey published");
        Ok(())
    }

    /// Stops new entries; live instances keep running.
    pub fn pause(&self, id: &Uuid, now: DateTime<Utc>) -> EngageResult<()> {
        let mut journey = self
            .journeys
            .get_mut(id)
            .ok_or_else(|| EngageError::NotFound(format!("journey {}", id)))?;
        if journey.status != JourneyStatus::Published {
            return Err(EngageError::InvariantViolation(format!(
                "journey {} is not published",
                id
            )));
        }
        journey.status = JourneyStatus::Paused;
        journey.updated_at = now;
        info!(journey_id = %id, "Journey paused");
        Ok(())
    }

    /// Un-publishes the journey and cancels every live instance. Returns the
    /// number of instances cancelled.
    pub async fn archive(&self, id: &Uuid, now: DateTime<Utc>) -> EngageResult<usize> {
        {
            let mut journey = self
                .journeys
                .get_mut(id)
                .ok_or_else(|| EngageError::NotFound(format!("journey {}", id)))?;
            journey.status = JourneyStatus::Archived;
            journey.updated_at = now;
        }
        let mut cancelled = 0;
        for instance in self.live_instances(id)? {
            if self
                .cancel(id, &instance.user_id, "journey archived", now)
                .await?
            {
                cancelled += 1;
            }
        }
        info!(journey_id = %id, cancelled, "Journey archived");
        Ok(cancelled)
    }

    pub fn get_journey(&self, id: &Uuid) -> Option<Journey> {
        self.journeys.get(id).map(|r| r.clone())
    }

    pub fn list_journeys(&self, workspace_id: Uuid) -> Vec<Journey> {
        let mut journeys: Vec<Journey> = self
            .journeys
            .iter()
            .filter(|r| r.workspace_id == workspace_id)
            .map(|r| r.value().clone())
            .collect();
        journeys.sort_by(|a, b| a.name.cmp(&b.name));
        journeys
    }

    // ── Instances ───────────────────────────────────────────────────────

    /// Routes a membership delta: entry-segment flips to true start
    /// instances, every other referenced segment is signalled to the user's
    /// live instances. A failure in one journey does not stop the others.
    pub async fn on_segment_update(
        &self,
        update: &SegmentUpdate,
        now: DateTime<Utc>,
    ) -> Vec<(Uuid, EnterOutcome)> {
        let journeys: Vec<Journey> = self
            .journeys
            .iter()
            .filter(|j| {
                j.workspace_id == update.workspace_id
                    && j.definition.referenced_segments().contains(&update.segment_id)
            })
            .map(|j| j.value().clone())
            .collect();

        let mut outcomes = Vec::new();
        for journey in journeys {
            match self.deliver_update(&journey, update, now).await {
                Ok(Some(outcome)) => outcomes.push((journey.id, outcome)),
                Ok(None) => {}
                Err(err) => warn!(
                    journey_id = %journey.id,
                    user_id = %update.user_id,
                    error = %err,
                    "Failed to apply segment update"
                ),
            }
        }
        outcomes
    }

    async fn deliver_update(
        &self,
        journey: &Journey,
        update: &SegmentUpdate,
        now: DateTime<Utc>,
    ) -> EngageResult<Option<EnterOutcome>> {
        let mut outcome = None;
        if update.currently_in_segment
            && journey.definition.entry_segment() == Some(update.segment_id)
        {
            let entered = self
                .enter(&journey.id, &update.user_id, update.segment_version, now)
                .await?;
            outcome = Some(entered);
            if matches!(
                entered,
                EnterOutcome::Entered { .. } | EnterOutcome::Restarted { .. }
            ) {
                return Ok(outcome);
            }
        }

        let key = journey_instance_key(journey.id, &update.user_id);
        let signal = SegmentSignal {
            in_segment: update.currently_in_segment,
            version: update.segment_version,
        };
        if self.signal_live(&key, update.segment_id, signal)? {
            self.drive(&key, now).await?;
        }
        Ok(outcome)
    }

    fn signal_live(&self, key: &str, segment_id: Uuid, signal: SegmentSignal) -> EngageResult<bool> {
        match self.host.query(key)? {
            Some(record) if record.running => {
                let event = serde_json::to_value(InstanceSignal::Segment { segment_id, signal })?;
                self.host.signal(key, event)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Starts a run of the journey for the user. `version` orders entry
    /// signals; one not newer than the last seen is ignored.
    pub async fn enter(
        &self,
        journey_id: &Uuid,
        user_id: &str,
        version: i64,
        now: DateTime<Utc>,
    ) -> EngageResult<EnterOutcome> {
        let journey = self
            .get_journey(journey_id)
            .ok_or_else(|| EngageError::NotFound(format!("journey {}", journey_id)))?;
        if journey.status != JourneyStatus::Published {
            debug!(journey_id = %journey_id, user_id = %user_id, "Journey not published, entry skipped");
            return Ok(EnterOutcome::NotRunnable);
        }
        let (entry_node, entry_segment, first) = match journey.definition.entry() {
            Some((node, JourneyNode::Entry { segment_id, child })) => (node, *segment_id, *child),
            _ => {
                return Err(EngageError::InvariantViolation(format!(
                    "journey {} has no entry node",
                    journey_id
                )))
            }
        };

        let key = journey_instance_key(journey.id, user_id);
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let mut restarted = false;
        let generation = match self.load(&key)? {
            Some((previous, true)) => match journey.re_entry {
                ReEntryPolicy::Coalesce => {
                    debug!(journey_id = %journey_id, user_id = %user_id, "Entry coalesced into live instance");
                    return Ok(EnterOutcome::Coalesced);
                }
                ReEntryPolicy::Restart => {
                    if is_stale(&previous, entry_segment, version) {
                        return Ok(EnterOutcome::Coalesced);
                    }
                    let generation = previous.generation + 1;
                    let mut previous = previous;
                    self.transition(
                        &key,
                        &journey,
                        &mut previous,
                        InstanceState::Cancelled {
                            reason: "restarted by re-entry".into(),
                        },
                        now,
                    )?;
                    restarted = true;
                    generation
                }
            },
            Some((previous, false)) => {
                if is_stale(&previous, entry_segment, version) || !journey.can_run_multiple {
                    debug!(journey_id = %journey_id, user_id = %user_id, "Entry ignored for finished instance");
                    return Ok(EnterOutcome::Ignored);
                }
                previous.generation + 1
            }
            None => 1,
        };

        let instance_id = deterministic_id(&[
            &journey.id.to_string(),
            user_id,
            &generation.to_string(),
        ]);
        let mut instance = JourneyInstance {
            id: instance_id,
            journey_id: journey.id,
            workspace_id: journey.workspace_id,
            user_id: user_id.to_string(),
            generation,
            state: InstanceState::NotEntered,
            sent_message_ids: BTreeSet::new(),
            segments: BTreeMap::from([(
                entry_segment,
                SegmentSignal {
                    in_segment: true,
                    version,
                },
            )]),
            wait_baseline: None,
            entered_at: now,
            updated_at: now,
            history: Vec::new(),
        };
        let active = InstanceState::Active { node: first };
        self.state_machine.ensure(&instance.state, &active)?;
        instance.state = active;
        instance.history.push(StepRecord {
            node: entry_node,
            kind: "entry".into(),
            at: now,
            detail: None,
        });

        if self.host.start_instance(&key, serde_json::to_value(&instance)?)?
            == StartOutcome::AlreadyRunning
        {
            return Ok(EnterOutcome::Coalesced);
        }
        info!(
            instance_id = %instance_id,
            journey_id = %journey.id,
            user_id = %user_id,
            generation,
            "User entered journey"
        );
        metrics::counter!("journey.instances_entered").increment(1);
        self.emit(LifecycleKind::JourneyEntered, &journey, user_id, None);

        self.drive_locked(&key, now).await?;
        Ok(if restarted {
            EnterOutcome::Restarted { instance_id }
        } else {
            EnterOutcome::Entered { instance_id }
        })
    }

    /// Advances an instance as far as it can go at `now`.
    pub async fn drive(&self, key: &str, now: DateTime<Utc>) -> EngageResult<Option<InstanceState>> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        self.drive_locked(key, now).await
    }

    async fn drive_locked(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> EngageResult<Option<InstanceState>> {
        let Some((mut instance, running)) = self.load(key)? else {
            return Ok(None);
        };
        if !running {
            return Ok(Some(instance.state));
        }
        let journey = self
            .get_journey(&instance.journey_id)
            .ok_or_else(|| EngageError::NotFound(format!("journey {}", instance.journey_id)))?;

        let signals = self.host.take_signals(key)?;
        if !signals.is_empty() {
            for raw in signals {
                match serde_json::from_value::<InstanceSignal>(raw) {
                    Ok(InstanceSignal::Segment { segment_id, signal }) => {
                        if !instance.observe(segment_id, signal) {
                            debug!(instance_key = %key, segment_id = %segment_id, "Ignoring stale segment signal");
                        }
                    }
                    Err(err) => warn!(instance_key = %key, error = %err, "Dropping malformed signal"),
                }
            }
            instance.updated_at = now;
            self.host.record(key, serde_json::to_value(&instance)?)?;
        }

        // Journeys are acyclic, so a run visits each node at most once.
        for _ in 0..=journey.definition.nodes.len() {
            let next = match instance.state.clone() {
                InstanceState::Active { node } => match self.plan(&journey, &instance, node, now) {
                    Ok(StepResult::Send {
                        node,
                        channel,
                        template_id,
                        next,
                    }) => {
                        self.deliver(&journey, &mut instance, node, channel, template_id, next)
                            .await
                    }
                    Ok(step) => self.next_state(&journey, &mut instance, step),
                    // Retrying cannot fix the node, so the run ends here.
                    Err(EngageError::InvalidDefinition(reason)) => InstanceState::Cancelled {
                        reason: format!("invalid node {}: {}", node, reason),
                    },
                    Err(err) => return Err(err),
                },
                InstanceState::Waiting { node, deadline } => {
                    match self
                        .evaluator
                        .resolve_wait(&journey.definition, node, deadline, &instance, now)?
                    {
                        Some(step) => self.next_state(&journey, &mut instance, step),
                        None => break,
                    }
                }
                _ => break,
            };
            self.transition(key, &journey, &mut instance, next, now)?;
        }
        Ok(Some(instance.state))
    }

    fn plan(
        &self,
        journey: &Journey,
        instance: &JourneyInstance,
        node: NodeId,
        now: DateTime<Utc>,
    ) -> EngageResult<StepResult> {
        let membership = |segment_id: Uuid| -> EngageResult<bool> {
            Ok(self
                .assignments
                .get(instance.workspace_id, &instance.user_id, segment_id)?
                .is_some_and(|a| a.value.in_segment()))
        };
        self.evaluator
            .evaluate_step(&journey.definition, node, now, &membership)
    }

    fn next_state(
        &self,
        journey: &Journey,
        instance: &mut JourneyInstance,
        step: StepResult,
    ) -> InstanceState {
        match step {
            StepResult::Transition { next } | StepResult::Send { next, .. } => {
                InstanceState::Active { node: next }
            }
            StepResult::Wait { node, deadline } => {
                instance.wait_baseline = match journey.definition.node(node) {
                    Some(JourneyNode::Delay {
                        variant: DelayVariant::UntilSegmentEnter { segment_id, .. },
                        ..
                    }) => instance.segments.get(segment_id).map(|s| s.version),
                    _ => None,
                };
                InstanceState::Waiting { node, deadline }
            }
            StepResult::Complete => InstanceState::Completed,
        }
    }

    /// Sends the node's message once per run. The dedupe key is fixed for the
    /// run, so a resend after a lost acknowledgement or a restart from an
    /// older checkpoint is absorbed by the transport.
    async fn deliver(
        &self,
        journey: &Journey,
        instance: &mut JourneyInstance,
        node: NodeId,
        channel: ChannelType,
        template_id: String,
        next: NodeId,
    ) -> InstanceState {
        let message_id = message_id(instance, node);
        if instance.sent_message_ids.contains(&message_id) {
            debug!(message_id = %message_id, "Message already sent");
            return InstanceState::Active { node: next };
        }
        let request = MessageRequest {
            workspace_id: instance.workspace_id,
            journey_id: journey.id,
            user_id: instance.user_id.clone(),
            channel,
            template_id,
            dedupe_key: message_id.clone(),
        };

        let result = {
            let _permit = self.semaphore.acquire().await;
            self.send_with_retry(&request).await
        };
        match result {
            Ok(SendOutcome::Accepted) => {
                instance.sent_message_ids.insert(message_id.clone());
                metrics::counter!("journey.messages_sent").increment(1);
                self.emit(
                    LifecycleKind::MessageSent,
                    journey,
                    &instance.user_id,
                    Some(message_id),
                );
                InstanceState::Active { node: next }
            }
            Ok(SendOutcome::Rejected(reason)) => {
                warn!(
                    journey_id = %journey.id,
                    user_id = %instance.user_id,
                    reason = %reason,
                    "Message rejected by transport"
                );
                InstanceState::Cancelled {
                    reason: format!("message rejected: {}", reason),
                }
            }
            Err(err) => InstanceState::Cancelled {
                reason: format!("send failed: {}", err),
            },
        }
    }

    async fn send_with_retry(&self, request: &MessageRequest) -> EngageResult<SendOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transport.send(request).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_transient() && attempt < self.config.send_max_attempts => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        dedupe_key = %request.dedupe_key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Send failed, retrying"
                    );
                    metrics::counter!("journey.send_retries").increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(
                        journey_id = %request.journey_id,
                        user_id = %request.user_id,
                        attempts = attempt,
                        error = %err,
                        "Giving up on message send"
                    );
                    return Err(err);
                }
            }
        }
    }

    /// Applies a checked state change and checkpoints it. Terminal states
    /// finish the instance on the host.
    fn transition(
        &self,
        key: &str,
        journey: &Journey,
        instance: &mut JourneyInstance,
        next: InstanceState,
        now: DateTime<Utc>,
    ) -> EngageResult<()> {
        self.state_machine.ensure(&instance.state, &next)?;
        if let InstanceState::Active { node } | InstanceState::Waiting { node, .. } = instance.state {
            instance.history.push(StepRecord {
                node,
                kind: journey
                    .definition
                    .node(node)
                    .map_or("unknown", JourneyNode::kind)
                    .to_string(),
                at: now,
                detail: match &next {
                    InstanceState::Cancelled { reason } => Some(reason.clone()),
                    _ => None,
                },
            });
        }
        instance.state = next;
        instance.updated_at = now;
        let state = serde_json::to_value(&*instance)?;

        match &instance.state {
            InstanceState::Completed => {
                self.host.finish(key, state)?;
                info!(journey_id = %journey.id, user_id = %instance.user_id, "Journey completed");
                self.emit(LifecycleKind::JourneyCompleted, journey, &instance.user_id, None);
            }
            InstanceState::Cancelled { reason } => {
                self.host.finish(key, state)?;
                info!(journey_id = %journey.id, user_id = %instance.user_id, reason = %reason, "Journey instance cancelled");
                metrics::counter!("journey.instances_cancelled").increment(1);
                self.emit(
                    LifecycleKind::JourneyCancelled,
                    journey,
                    &instance.user_id,
                    Some(reason.clone()),
                );
            }
            _ => {
                self.host.record(key, state)?;
                self.emit(LifecycleKind::JourneyStepCompleted, journey, &instance.user_id, None);
            }
        }
        Ok(())
    }

    /// Enters entry-segment members that have no instance, e.g. because
    /// their membership delta was lost before reaching `on_segment_update`.
    /// Only members whose membership changed while the journey was published
    /// qualify, so the result matches what live delivery would have entered.
    /// Returns how many users were entered.
    pub async fn reconcile_entries(&self, now: DateTime<Utc>) -> EngageResult<usize> {
        // A published journey's `updated_at` is when the publication began.
        let journeys: Vec<Journey> = self
            .journeys
            .iter()
            .filter(|j| j.status == JourneyStatus::Published)
            .map(|j| j.value().clone())
            .collect();

        let mut entered = 0;
        for journey in journeys {
            let Some(segment_id) = journey.definition.entry_segment() else {
                continue;
            };
            for user_id in self
                .assignments
                .users_with_assignments(journey.workspace_id, segment_id)?
            {
                let Some(assignment) =
                    self.assignments
                        .get(journey.workspace_id, &user_id, segment_id)?
                else {
                    continue;
                };
                if !assignment.value.in_segment() || assignment.changed_at < journey.updated_at {
                    continue;
                }
                if self
                    .host
                    .query(&journey_instance_key(journey.id, &user_id))?
                    .is_some()
                {
                    continue;
                }
                let version = assignment.changed_at.timestamp_millis();
                match self.enter(&journey.id, &user_id, version, now).await {
                    Ok(EnterOutcome::Entered { .. }) => {
                        debug!(journey_id = %journey.id, user_id = %user_id, "Recovered missed journey entry");
                        entered += 1;
                    }
                    Ok(_) => {}
                    Err(err) => warn!(
                        journey_id = %journey.id,
                        user_id = %user_id,
                        error = %err,
                        "Failed to recover journey entry"
                    ),
                }
            }
        }
        if entered > 0 {
            info!(entered, "Recovered missed journey entries");
            metrics::counter!("journey.entries_recovered").increment(entered as u64);
        }
        Ok(entered)
    }

    /// Resumes waiting instances whose deadline has passed and instances
    /// checkpointed mid-run (`Active`), e.g. after a crash or a failed drive.
    /// Instances another task is driving are skipped. Returns how many were
    /// resumed.
    pub async fn tick(&self, now: DateTime<Utc>) -> EngageResult<usize> {
        let due: Vec<String> = self
            .host
            .list("journey-")?
            .into_iter()
            .filter(|record| record.running)
            .filter_map(|record| {
                let instance: JourneyInstance = serde_json::from_value(record.state).ok()?;
                match instance.state {
                    InstanceState::Active { .. } => Some(record.key),
                    InstanceState::Waiting {
                        deadline: Some(deadline),
                        ..
                    } if deadline <= now => Some(record.key),
                    _ => None,
                }
            })
            .collect();
        let mut resumed = 0;
        for key in &due {
            let lock = self.lock_for(key);
            let Ok(_guard) = lock.try_lock() else {
                debug!(instance_key = %key, "Instance busy, skipping");
                continue;
            };
            resumed += 1;
            if let Err(err) = self.drive_locked(key, now).await {
                warn!(instance_key = %key, error = %err, "Failed to resume instance");
            }
        }
        Ok(resumed)
    }

    /// Cancels the user's live instance. Returns `false` when there is none;
    /// finished instances are left as they are.
    pub async fn cancel(
        &self,
        journey_id: &Uuid,
        user_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> EngageResult<bool> {
        let key = journey_instance_key(*journey_id, user_id);
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;
        let Some((mut instance, running)) = self.load(&key)? else {
            return Ok(false);
        };
        if !running || instance.state.is_terminal() {
            return Ok(false);
        }
        let journey = self
            .get_journey(journey_id)
            .ok_or_else(|| EngageError::NotFound(format!("journey {}", journey_id)))?;
        self.transition(
            &key,
            &journey,
            &mut instance,
            InstanceState::Cancelled {
                reason: reason.to_string(),
            },
            now,
        )?;
        Ok(true)
    }

    /// Latest run of the journey for the user.
    pub fn instance(&self, journey_id: &Uuid, user_id: &str) -> EngageResult<Option<JourneyInstance>> {
        Ok(self
            .load(&journey_instance_key(*journey_id, user_id))?
            .map(|(instance, _)| instance))
    }

    pub fn live_instances(&self, journey_id: &Uuid) -> EngageResult<Vec<JourneyInstance>> {
        Ok(self
            .instances(journey_id)?
            .into_iter()
            .filter(|(_, running)| *running)
            .map(|(instance, _)| instance)
            .collect())
    }

    /// State counts over each user's latest run; `total_entered` counts
    /// every run.
    pub fn get_stats(&self, journey_id: &Uuid) -> EngageResult<JourneyStats> {
        let mut stats = JourneyStats {
            journey_id: *journey_id,
            ..Default::default()
        };
        for record in self.host.list(&journey_instance_key(*journey_id, ""))? {
            stats.total_entered += u64::from(record.runs);
            let instance: JourneyInstance = serde_json::from_value(record.state)?;
            match instance.state {
                InstanceState::Active { .. } => stats.active += 1,
                InstanceState::Waiting { .. } => stats.waiting += 1,
                InstanceState::Completed => stats.completed += 1,
                InstanceState::Cancelled { .. } => stats.cancelled += 1,
                InstanceState::NotEntered => {}
            }
        }
        Ok(stats)
    }

    fn instances(&self, journey_id: &Uuid) -> EngageResult<Vec<(JourneyInstance, bool)>> {
        self.host
            .list(&journey_instance_key(*journey_id, ""))?
            .into_iter()
            .map(|record| Ok((serde_json::from_value(record.state)?, record.running)))
            .collect()
    }

    fn load(&self, key: &str) -> EngageResult<Option<(JourneyInstance, bool)>> {
        match self.host.query(key)? {
            Some(record) => Ok(Some((serde_json::from_value(record.state)?, record.running))),
            None => Ok(None),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn emit(&self, kind: LifecycleKind, journey: &Journey, user_id: &str, detail: Option<String>) {
        self.event_sink.emit(make_event(
            kind,
            journey.workspace_id,
            journey.id,
            Some(user_id.to_string()),
            detail,
        ));
    }
}

fn is_stale(instance: &JourneyInstance, entry_segment: Uuid, version: i64) -> bool {
    instance
        .segments
        .get(&entry_segment)
        .is_some_and(|seen| seen.version >= version)
}
