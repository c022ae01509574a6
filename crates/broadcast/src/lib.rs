//! Broadcasts: one-off mass sends composed from a synthesized segment,
//! a single-message journey and a template, triggered idempotently.

pub mod coordinator;
pub mod types;

pub use coordinator::BroadcastCoordinator;
pub use types::{
    Broadcast, BroadcastStatus, MessageTemplateDefinition, TriggerOutcome, UpsertBroadcast,
};
