use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::flow::{FlowId, TargetType};

/// Weak reference to a business record owned by another store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    pub target_type: TargetType,
    pub target_id: String,
}

impl TargetRef {
    pub fn new(target_type: TargetType, target_id: impl Into<String>) -> Self {
        Self { target_type, target_id: target_id.into() }
    }

    pub fn quotation(target_id: impl Into<String>) -> Self {
        Self::new(TargetType::Quotation, target_id)
    }

    pub fn purchase_order(target_id: impl Into<String>) -> Self {
        Self::new(TargetType::PurchaseOrder, target_id)
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.target_type, self.target_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Draft,
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown approval status `{0}`")]
pub struct UnknownApprovalStatus(pub String);

impl FromStr for ApprovalStatus {
    type Err = UnknownApprovalStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "draft" => Ok(Self::Draft),
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(UnknownApprovalStatus(other.to_owned())),
        }
    }
}

/// Status and current step as computed from the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedStatus {
    pub status: ApprovalStatus,
    pub current_step: Option<u32>,
}

impl DerivedStatus {
    pub const DRAFT: Self = Self { status: ApprovalStatus::Draft, current_step: None };
    pub const APPROVED: Self = Self { status: ApprovalStatus::Approved, current_step: None };
    pub const REJECTED: Self = Self { status: ApprovalStatus::Rejected, current_step: None };

    pub fn pending(step: u32) -> Self {
        Self { status: ApprovalStatus::Pending, current_step: Some(step) }
    }
}

/// Cached approval fields stored on the target record itself.
///
/// `revision` is the compare-and-set token: every accepted action writes
/// `revision + 1` and only succeeds if the stored revision is unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusProjection {
    pub flow_id: Option<FlowId>,
    pub flow_version: Option<u32>,
    pub status: ApprovalStatus,
    pub current_step: Option<u32>,
    pub revision: i64,
}

impl StatusProjection {
    pub fn draft() -> Self {
        Self {
            flow_id: None,
            flow_version: None,
            status: ApprovalStatus::Draft,
            current_step: None,
            revision: 0,
        }
    }

    pub fn derived(&self) -> DerivedStatus {
        DerivedStatus { status: self.status, current_step: self.current_step }
    }
}
