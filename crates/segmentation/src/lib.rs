//! Segmentation: segment definitions and their evaluator, user properties,
//! period tracking and incremental computed-property evaluation.

pub mod assignments;
pub mod builder;
pub mod computed;
pub mod definition;
pub mod engine;
pub mod evaluator;
pub mod facts;
pub mod incremental;
pub mod path;
pub mod periods;
pub mod predicates;
pub mod scheduler;

pub use assignments::{AssignmentStore, InMemoryAssignmentStore, WriteOutcome};
pub use builder::SegmentBuilder;
pub use computed::UserPropertyDefinition;
pub use definition::{PropertyFilter, SegmentNode, SubscriptionGroupKind};
pub use engine::{ComputedProperty, Segment, SegmentationEngine, UserProperty};
pub use evaluator::{evaluate_segment, try_evaluate_segment};
pub use facts::UserFacts;
pub use incremental::{EvaluationOutcome, IncrementalEvaluator};
pub use periods::{InMemoryPeriodStore, PeriodStore};
pub use predicates::{CountOperator, HasBeenComparator, SegmentOperator};
pub use scheduler::ComputePropertiesScheduler;
