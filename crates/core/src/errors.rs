use serde::Serialize;
use thiserror::Error;

use crate::domain::flow::{FlowId, FlowValidationError, TargetType};
use crate::domain::history::ApprovalAction;
use crate::domain::target::ApprovalStatus;

/// Caller-facing classification of approval failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    InvalidState,
    StaleStep,
    AlreadyActed,
    Unauthorized,
    Conflict,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::InvalidState => "invalid_state",
            Self::StaleStep => "stale_step",
            Self::AlreadyActed => "already_acted",
            Self::Unauthorized => "unauthorized",
            Self::Conflict => "conflict",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error(transparent)]
    InvalidFlow(#[from] FlowValidationError),
    #[error("flow `{flow_id}` targets {flow_target_type} records, not {target_type}")]
    TargetTypeMismatch { flow_id: FlowId, flow_target_type: TargetType, target_type: TargetType },
    #[error("approval flow `{0}` was not found")]
    FlowNotFound(FlowId),
    #[error("approval flow `{flow_id}` has no version {version}")]
    FlowVersionNotFound { flow_id: FlowId, version: u32 },
    #[error("target `{0}` was not found")]
    TargetNotFound(String),
    #[error("cannot {action} target `{target}` while it is {status}")]
    InvalidTransition { target: String, status: ApprovalStatus, action: ApprovalAction },
    #[error("approval flow `{0}` is inactive and cannot be attached")]
    FlowInactive(FlowId),
    #[error("target `{target}` is already pending under flow `{flow_id}`")]
    PendingUnderFlow { target: String, flow_id: FlowId },
    #[error("approval flow `{flow_id}` has {pending} pending target(s); its target type cannot change")]
    FlowInUse { flow_id: FlowId, pending: i64 },
    #[error("target `{target}` projection disagrees with its approval history")]
    ProjectionDrift { target: String },
    #[error("step {submitted} is no longer current; target is at step {current}")]
    StaleStep { submitted: u32, current: u32 },
    #[error("actor `{actor_id}` already approved step {step}")]
    AlreadyActed { actor_id: String, step: u32 },
    #[error("actor `{actor_id}` does not hold role `{role_id}` required at step {step}")]
    NotAuthorized { actor_id: String, role_id: String, step: u32 },
    #[error("role lookup failed for actor `{actor_id}`: {reason}")]
    RoleLookup { actor_id: String, reason: String },
    #[error("concurrent update on target `{target}` could not be resolved; retry the action")]
    Conflict { target: String },
}

impl ApprovalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidFlow(_) | Self::TargetTypeMismatch { .. } => ErrorKind::Validation,
            Self::FlowNotFound(_) | Self::FlowVersionNotFound { .. } | Self::TargetNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::InvalidTransition { .. }
            | Self::FlowInactive(_)
            | Self::PendingUnderFlow { .. }
            | Self::FlowInUse { .. }
            | Self::ProjectionDrift { .. } => ErrorKind::InvalidState,
            Self::StaleStep { .. } => ErrorKind::StaleStep,
            Self::AlreadyActed { .. } => ErrorKind::AlreadyActed,
            Self::NotAuthorized { .. } | Self::RoleLookup { .. } => ErrorKind::Unauthorized,
            Self::Conflict { .. } => ErrorKind::Conflict,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Approval(error) => Some(error.kind()),
            Self::Persistence(_) | Self::Configuration(_) => None,
        }
    }

    /// Stable label used in structured output and logs.
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Approval(error) => error.kind().as_str(),
            Self::Persistence(_) => "persistence",
            Self::Configuration(_) => "configuration",
        }
    }
}

impl From<FlowValidationError> for ApplicationError {
    fn from(value: FlowValidationError) -> Self {
        Self::Approval(ApprovalError::InvalidFlow(value))
    }
}
