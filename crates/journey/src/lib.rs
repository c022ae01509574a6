//! Journey orchestration: per-user durable journey instances entered on
//! segment membership, with message sends, delays, segment waits and splits.

pub mod channel;
pub mod durable;
pub mod engine;
pub mod evaluator;
pub mod semaphore;
pub mod state_machine;
pub mod types;
pub mod validation;

pub use channel::{ChannelTransport, MessageRequest, RecordingTransport, SendOutcome};
pub use durable::{
    broadcast_instance_key, journey_instance_key, DurableHost, InMemoryHost, InstanceRecord,
    StartOutcome,
};
pub use engine::{EnterOutcome, JourneyEngine};
pub use evaluator::{JourneyEvaluator, StepResult};
pub use semaphore::Semaphore;
pub use state_machine::JourneyStateMachine;
pub use types::{
    ChannelType, DelayVariant, InstanceState, Journey, JourneyDefinition, JourneyInstance,
    JourneyNode, JourneyStats, JourneyStatus, ReEntryPolicy, TimeoutAction,
};
pub use validation::validate;
