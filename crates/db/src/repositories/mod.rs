use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::Row;
use thiserror::Error;

use signoff_core::domain::flow::{ApprovalFlow, FlowFilter, FlowId, FlowStep};
use signoff_core::domain::history::HistoryEntry;
use signoff_core::domain::target::TargetRef;
use signoff_core::errors::ApplicationError;

pub mod flow;
pub mod history;
pub mod target;

pub use flow::SqlFlowRepository;
pub use history::SqlHistoryRepository;
pub use target::{adapter_for, PurchaseOrderTarget, QuotationTarget, TargetAdapter, WriteOutcome};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

impl RepositoryError {
    /// SQLite refused the statement because another connection holds the write
    /// lock or committed after this transaction's snapshot.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Database(error) if is_contention(error))
    }
}

/// Matches BUSY and LOCKED, including extended codes such as BUSY_SNAPSHOT.
pub(crate) fn is_contention(error: &sqlx::Error) -> bool {
    let sqlx::Error::Database(database) = error else {
        return false;
    };
    let primary = database.code().and_then(|code| code.parse::<i32>().ok()).map(|code| code & 0xff);
    matches!(primary, Some(SQLITE_BUSY | SQLITE_LOCKED))
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Persistence(value.to_string())
    }
}

#[async_trait]
pub trait FlowRepository: Send + Sync {
    async fn find_by_id(&self, id: &FlowId) -> Result<Option<ApprovalFlow>, RepositoryError>;
    async fn find_steps(
        &self,
        id: &FlowId,
        version: u32,
    ) -> Result<Option<Vec<FlowStep>>, RepositoryError>;
    async fn list(&self, filter: &FlowFilter) -> Result<Vec<ApprovalFlow>, RepositoryError>;
    async fn insert(&self, flow: &ApprovalFlow) -> Result<(), RepositoryError>;
}

/// Read side of the append-only ledger. Entries are only written by the
/// approval engine, in the same transaction as the projection update.
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    async fn list_for(&self, target: &TargetRef) -> Result<Vec<HistoryEntry>, RepositoryError>;
    async fn list_for_flow(
        &self,
        flow_id: &FlowId,
        target: &TargetRef,
    ) -> Result<Vec<HistoryEntry>, RepositoryError>;
}

/// Current time at the precision timestamps are stored with, so values handed
/// back to callers compare equal to what is read back later.
pub(crate) fn storage_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width UTC timestamps so lexical order in SQLite matches time order.
pub(crate) fn encode_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("invalid timestamp `{raw}`: {error}")))
}

pub(crate) fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(|error| RepositoryError::Decode(error.to_string()))
}

pub(crate) fn to_u32(value: i64, field: &str) -> Result<u32, RepositoryError> {
    u32::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("{field} out of range: {value}")))
}
