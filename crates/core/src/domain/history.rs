use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::flow::{FlowId, TargetType};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryEntryId(pub String);

impl HistoryEntryId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Request,
    Approve,
    Reject,
}

impl ApprovalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

impl fmt::Display for ApprovalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown approval action `{0}`")]
pub struct UnknownApprovalAction(pub String);

impl FromStr for ApprovalAction {
    type Err = UnknownApprovalAction;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "request" => Ok(Self::Request),
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            other => Err(UnknownApprovalAction(other.to_owned())),
        }
    }
}

/// Immutable ledger fact. Once appended it is never updated or deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: HistoryEntryId,
    pub flow_id: FlowId,
    pub flow_version: u32,
    pub target_type: TargetType,
    pub target_id: String,
    pub step: u32,
    pub action: ApprovalAction,
    pub comment: Option<String>,
    pub actor_id: String,
    pub created_at: DateTime<Utc>,
}
