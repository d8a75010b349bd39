pub mod approvals;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;

pub use approvals::{InMemoryRoleDirectory, RoleDirectory};
pub use domain::flow::{
    ApprovalFlow, FlowFilter, FlowId, FlowPatch, FlowStep, FlowValidationError, NewApprovalFlow,
    TargetType,
};
pub use domain::history::{ApprovalAction, HistoryEntry, HistoryEntryId};
pub use domain::target::{ApprovalStatus, DerivedStatus, StatusProjection, TargetRef};
pub use errors::{ApplicationError, ApprovalError, ErrorKind};
pub use flows::{StepPin, TargetState, TransitionOutcome, TransitionPlanner};
