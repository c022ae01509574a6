//! Durable execution host: a write-ahead record of instance state that
//! survives restarts, keyed by instance key.
//!
//! Programs (journey instances, broadcasts) checkpoint their serialized
//! state after every transition and are resumed from the last record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use engage_core::{EngageError, EngageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub key: String,
    pub state: Value,
    pub running: bool,
    /// Number of times the key has been started.
    pub runs: u32,
    pub updated_at: DateTime<Utc>,
}

pub fn journey_instance_key(journey_id: Uuid, user_id: &str) -> String {
    format!("journey-{}-{}", journey_id, user_id)
}

pub fn broadcast_instance_key(workspace_id: Uuid, broadcast_id: Uuid) -> String {
    format!("broadcast-{}-{}", workspace_id, broadcast_id)
}

pub trait DurableHost: Send + Sync {
    /// Starts a program under `key`. A key whose previous run finished
    /// starts a new run; a running key is left untouched.
    fn start_instance(&self, key: &str, state: Value) -> EngageResult<StartOutcome>;

    /// Checkpoints the state of a running instance.
    fn record(&self, key: &str, state: Value) -> EngageResult<()>;

    /// Queues an external event for the instance.
    fn signal(&self, key: &str, event: Value) -> EngageResult<()>;

    /// Drains queued signals in arrival order.
    fn take_signals(&self, key: &str) -> EngageResult<Vec<Value>>;

    fn query(&self, key: &str) -> EngageResult<Option<InstanceRecord>>;

    /// Records the final state and marks the instance as no longer running.
    fn finish(&self, key: &str, state: Value) -> EngageResult<()>;

    /// Records whose key starts with `prefix`, sorted by key.
    fn list(&self, prefix: &str) -> EngageResult<Vec<InstanceRecord>>;
}

#[derive(Default)]
struct HostState {
    records: BTreeMap<String, InstanceRecord>,
    signals: BTreeMap<String, Vec<Value>>,
}

/// In-process host. Start, record and finish are linearized under one lock,
/// so concurrent starts of the same key yield exactly one `Started`.
#[derive(Default)]
pub struct InMemoryHost {
    state: Mutex<HostState>,
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrites a record as-is. Used to simulate a restart from an older
    /// checkpoint.
    pub fn restore(&self, record: InstanceRecord) {
        self.state.lock().records.insert(record.key.clone(), record);
    }
}

impl DurableHost for InMemoryHost {
    fn start_instance(&self, key: &str, state: Value) -> EngageResult<StartOutcome> {
        let mut host = self.state.lock();
        let now = Utc::now();
        match host.records.get_mut(key) {
            Some(record) if record.running => {
                debug!(instance_key = %key, "Instance already running");
                Ok(StartOutcome::AlreadyRunning)
            }
            Some(record) => {
                record.state = state;
                record.running = true;
                record.runs += 1;
                record.updated_at = now;
                host.signals.remove(key);
                Ok(StartOutcome::Started)
            }
            None => {
                host.records.insert(
                    key.to_string(),
                    InstanceRecord {
                        key: key.to_string(),
                        state,
                        running: true,
                        runs: 1,
                        updated_at: now,
                    },
                );
                Ok(StartOutcome::Started)
            }
        }
    }

    fn record(&self, key: &str, state: Value) -> EngageResult<()> {
        let mut host = self.state.lock();
        let record = host
            .records
            .get_mut(key)
            .ok_or_else(|| EngageError::NotFound(format!("instance {}", key)))?;
        if !record.running {
            return Err(EngageError::InvariantViolation(format!(
                "instance {} is not running",
                key
            )));
        }
        record.state = state;
        record.updated_at = Utc::now();
        Ok(())
    }

    fn signal(&self, key: &str, event: Value) -> EngageResult<()> {
        let mut host = self.state.lock();
        match host.records.get(key) {
            Some(record) if record.running => {
                host.signals.entry(key.to_string()).or_default().push(event);
                Ok(())
            }
            Some(_) => {
                debug!(instance_key = %key, "Dropping signal for finished instance");
                Ok(())
            }
            None => Err(EngageError::NotFound(format!("instance {}", key))),
        }
    }

    fn take_signals(&self, key: &str) -> EngageResult<Vec<Value>> {
        Ok(self.state.lock().signals.remove(key).unwrap_or_default())
    }

    fn query(&self, key: &str) -> EngageResult<Option<InstanceRecord>> {
        Ok(self.state.lock().records.get(key).cloned())
    }

    fn finish(&self, key: &str, state: Value) -> EngageResult<()> {
        let mut host = self.state.lock();
        let record = host
            .records
            .get_mut(key)
            .ok_or_else(|| EngageError::NotFound(format!("instance {}", key)))?;
        record.state = state;
        record.running = false;
        record.updated_at = Utc::now();
        host.signals.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> EngageResult<Vec<InstanceRecord>> {
        Ok(self
            .state
            .lock()
            .records
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, record)| record.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_start_is_exclusive_while_running() {
        let host = InMemoryHost::new();
        assert_eq!(
            host.start_instance("k", json!({"n": 1})).unwrap(),
            StartOutcome::Started
        );
        assert_eq!(
            host.start_instance("k", json!({"n": 2})).unwrap(),
            StartOutcome::AlreadyRunning
        );
        assert_eq!(host.query("k").unwrap().unwrap().state, json!({"n": 1}));

        host.finish("k", json!({"done": true})).unwrap();
        assert_eq!(
            host.start_instance("k", json!({"n": 3})).unwrap(),
            StartOutcome::Started
        );
        assert_eq!(host.query("k").unwrap().unwrap().runs, 2);
    }

    #[test]
    fn test_signals_drain_in_order_and_drop_after_finish() {
        let host = InMemoryHost::new();
        host.start_instance("k", Value::Null).unwrap();
        host.signal("k", json!(1)).unwrap();
        host.signal("k", json!(2)).unwrap();
        assert_eq!(host.take_signals("k").unwrap(), vec![json!(1), json!(2)]);
        assert!(host.take_signals("k").unwrap().is_empty());

        host.finish("k", Value::Null).unwrap();
        host.signal("k", json!(3)).unwrap();
        assert!(host.take_signals("k").unwrap().is_empty());
        assert!(host.signal("missing", json!(1)).is_err());
    }

    #[test]
    fn test_record_requires_running_instance() {
        let host = InMemoryHost::new();
        assert!(host.record("k", Value::Null).is_err());
        host.start_instance("k", Value::Null).unwrap();
        host.finish("k", Value::Null).unwrap();
        assert!(matches!(
            host.record("k", Value::Null),
            Err(EngageError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_list_by_prefix() {
        let host = InMemoryHost::new();
        let journey = Uuid::new_v4();
        host.start_instance(&journey_instance_key(journey, "a"), Value::Null)
            .unwrap();
        host.start_instance(&journey_instance_key(journey, "b"), Value::Null)
            .unwrap();
        host.start_instance(
            &broadcast_instance_key(Uuid::new_v4(), Uuid::new_v4()),
            Value::Null,
        )
        .unwrap();
        let listed = host.list(&format!("journey-{}-", journey)).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(host.len(), 3);
    }
}
