//! Event store gateway: append-only, idempotent persistence of user events.

pub mod store;

pub use store::{EventStore, InMemoryEventStore};
