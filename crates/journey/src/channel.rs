//! Channel transport contract used by message nodes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use engage_core::{EngageError, EngageResult};

use crate::types::ChannelType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRequest {
    pub workspace_id: Uuid,
    pub journey_id: Uuid,
    pub user_id: String,
    pub channel: ChannelType,
    pub template_id: String,
    /// Repeated sends with the same key deliver once.
    pub dedupe_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum SendOutcome {
    Accepted,
    Rejected(String),
}

/// Delivers a message. Transient failures are returned as
/// `EngageError::Transient` and retried by the caller; `Rejected` is final.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn send(&self, request: &MessageRequest) -> EngageResult<SendOutcome>;
}

#[derive(Default)]
struct Recorder {
    delivered: BTreeMap<String, MessageRequest>,
    attempts: u64,
    fail_next: u32,
    lose_acks: u32,
    reject: Option<String>,
}

/// In-memory transport that dedupes by key and records deliveries.
///
/// Failure injection: `fail_next(n)` fails the next `n` calls before
/// delivery; `lose_acks(n)` delivers but reports a transient failure, as a
/// timed-out acknowledgement would.
#[derive(Default)]
pub struct RecordingTransport {
    inner: Mutex<Recorder>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, calls: u32) {
        self.inner.lock().fail_next = calls;
    }

    pub fn lose_acks(&self, calls: u32) {
        self.inner.lock().lose_acks = calls;
    }

    pub fn reject_all(&self, reason: impl Into<String>) {
        self.inner.lock().reject = Some(reason.into());
    }

    pub fn delivered(&self) -> Vec<MessageRequest> {
        self.inner.lock().delivered.values().cloned().collect()
    }

    pub fn delivered_count(&self) -> usize {
        self.inner.lock().delivered.len()
    }

    /// Calls made, including failed and duplicate ones.
    pub fn attempts(&self) -> u64 {
        self.inner.lock().attempts
    }
}

#[async_trait]
impl ChannelTransport for RecordingTransport {
    async fn send(&self, request: &MessageRequest) -> EngageResult<SendOutcome> {
        let mut inner = self.inner.lock();
        inner.attempts += 1;
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(EngageError::Transient("transport unavailable".into()));
        }
        if let Some(reason) = &inner.reject {
            return Ok(SendOutcome::Rejected(reason.clone()));
        }
        if inner.delivered.contains_key(&request.dedupe_key) {
            debug!(dedupe_key = %request.dedupe_key, "Duplicate send suppressed");
        } else {
            inner
                .delivered
                .insert(request.dedupe_key.clone(), request.clone());
        }
        if inner.lose_acks > 0 {
            inner.lose_acks -= 1;
            return Err(EngageError::Transient("acknowledgement timed out".into()));
        }
        Ok(SendOutcome::Accepted)
    }
}
