//! Lifecycle notifications: trait for surfacing state changes to operators.
//!
//! Components accept an `Arc<dyn EventSink>` and emit a [`LifecycleEvent`]
//! whenever a period advances, a journey instance changes state or a
//! broadcast moves through its lifecycle. Exhausted retries reach operators
//! through this channel rather than as errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    PeriodAdvanced,
    SegmentEntered,
    SegmentExited,
    JourneyEntered,
    JourneyStepCompleted,
    JourneyCompleted,
    JourneyCancelled,
    MessageSent,
    BroadcastInProgress,
    BroadcastCompleted,
    BroadcastCancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event_id: Uuid,
    pub kind: LifecycleKind,
    pub workspace_id: Uuid,
    /// Id of the computed property, journey or broadcast concerned.
    pub subject_id: Uuid,
    pub user_id: Option<String>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Trait for emitting lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// No-op sink for components that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: LifecycleEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_kind(&self, kind: LifecycleKind) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: LifecycleEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for creating a `LifecycleEvent`.
pub fn make_event(
    kind: LifecycleKind,
    workspace_id: Uuid,
    subject_id: Uuid,
    user_id: Option<String>,
    detail: Option<String>,
) -> LifecycleEvent {
    LifecycleEvent {
        event_id: Uuid::new_v4(),
        kind,
        workspace_id,
        subject_id,
        user_id,
        detail,
        timestamp: Utc::now(),
    }
}

/// Convenience: a sink that drops everything.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
