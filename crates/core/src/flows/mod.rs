pub mod engine;
pub mod status;

pub use engine::{StepPin, TargetState, TransitionOutcome, TransitionPlanner};
pub use status::{approvers_at, current_cycle, derive_status};
