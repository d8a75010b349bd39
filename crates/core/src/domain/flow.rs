use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub String);

impl FlowId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of business record a flow can be attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Quotation,
    PurchaseOrder,
}

impl TargetType {
    pub const ALL: [TargetType; 2] = [TargetType::Quotation, TargetType::PurchaseOrder];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quotation => "quotation",
            Self::PurchaseOrder => "purchase_order",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown target type `{0}` (expected quotation|purchase_order)")]
pub struct UnknownTargetType(pub String);

impl FromStr for TargetType {
    type Err = UnknownTargetType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "quotation" => Ok(Self::Quotation),
            "purchase_order" => Ok(Self::PurchaseOrder),
            other => Err(UnknownTargetType(other.to_owned())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStep {
    pub step_number: u32,
    pub approver_role_id: String,
    pub required_approval_count: u32,
}

impl FlowStep {
    pub fn new(step_number: u32, approver_role_id: impl Into<String>, required: u32) -> Self {
        Self {
            step_number,
            approver_role_id: approver_role_id.into(),
            required_approval_count: required,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalFlow {
    pub id: FlowId,
    pub name: String,
    pub description: Option<String>,
    pub target_type: TargetType,
    pub steps: Vec<FlowStep>,
    pub is_active: bool,
    /// Bumped every time `steps` change; pending targets stay pinned to the
    /// version they were requested under.
    pub version: u32,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewApprovalFlow {
    pub name: String,
    pub description: Option<String>,
    pub target_type: TargetType,
    pub steps: Vec<FlowStep>,
    pub created_by: String,
}

/// Partial update of a flow. `description: Some(None)` clears it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub target_type: Option<TargetType>,
    pub steps: Option<Vec<FlowStep>>,
    pub is_active: Option<bool>,
}

impl FlowPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.target_type.is_none()
            && self.steps.is_none()
            && self.is_active.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlowFilter {
    pub target_type: Option<TargetType>,
    pub active_only: bool,
    pub name_contains: Option<String>,
}

impl FlowFilter {
    pub fn matches(&self, flow: &ApprovalFlow) -> bool {
        if let Some(target_type) = self.target_type {
            if flow.target_type != target_type {
                return false;
            }
        }

        if self.active_only && !flow.is_active {
            return false;
        }

        match self.name_contains.as_deref().map(str::trim) {
            Some(needle) if !needle.is_empty() => {
                flow.name.to_lowercase().contains(&needle.to_lowercase())
            }
            _ => true,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowValidationError {
    #[error("flow name must not be blank")]
    BlankName,
    #[error("flow must define at least one step")]
    NoSteps,
    #[error("steps must be numbered contiguously from 1: expected step {expected}, found {found}")]
    NonContiguousSteps { expected: u32, found: u32 },
    #[error("step {step_number} must require at least one approval")]
    ZeroRequiredCount { step_number: u32 },
    #[error("step {step_number} must name an approver role")]
    BlankApproverRole { step_number: u32 },
}

pub fn validate_name(name: &str) -> Result<String, FlowValidationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(FlowValidationError::BlankName);
    }
    Ok(trimmed.to_owned())
}

/// Sorts steps by number and checks they form `1..=n` with sane roles and counts.
pub fn normalize_steps(mut steps: Vec<FlowStep>) -> Result<Vec<FlowStep>, FlowValidationError> {
    if steps.is_empty() {
        return Err(FlowValidationError::NoSteps);
    }

    steps.sort_by_key(|step| step.step_number);

    for (index, step) in steps.iter_mut().enumerate() {
        let expected = index as u32 + 1;
        if step.step_number != expected {
            return Err(FlowValidationError::NonContiguousSteps {
                expected,
                found: step.step_number,
            });
        }
        if step.required_approval_count < 1 {
            return Err(FlowValidationError::ZeroRequiredCount { step_number: step.step_number });
        }

        let role = step.approver_role_id.trim();
        if role.is_empty() {
            return Err(FlowValidationError::BlankApproverRole { step_number: step.step_number });
        }
        step.approver_role_id = role.to_owned();
    }

    Ok(steps)
}

/// Looks up a step in a normalized step list.
pub fn step_at(steps: &[FlowStep], step_number: u32) -> Option<&FlowStep> {
    let index = usize::try_from(step_number).ok()?.checked_sub(1)?;
    steps.get(index)
}
