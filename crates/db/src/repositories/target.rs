use async_trait::async_trait;
use sqlx::SqliteConnection;

use signoff_core::domain::flow::{FlowId, TargetType};
use signoff_core::domain::target::{ApprovalStatus, StatusProjection, TargetRef};

use super::{column, encode_timestamp, storage_now, to_u32, RepositoryError};
use crate::DbPool;

/// Result of a compare-and-set write on a target's cached approval fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// Another writer moved the revision first; nothing was written.
    Conflict,
}

/// Reads and writes the approval projection that lives on a business record.
///
/// All methods run on a caller-supplied connection so they can share the
/// transaction that appends to the ledger.
#[async_trait]
pub trait TargetAdapter: Send + Sync {
    fn target_type(&self) -> TargetType;

    async fn read_status(
        &self,
        conn: &mut SqliteConnection,
        target_id: &str,
    ) -> Result<Option<StatusProjection>, RepositoryError>;

    async fn write_status(
        &self,
        conn: &mut SqliteConnection,
        target_id: &str,
        expected_revision: i64,
        next: &StatusProjection,
    ) -> Result<WriteOutcome, RepositoryError>;

    async fn count_pending_for_flow(
        &self,
        conn: &mut SqliteConnection,
        flow_id: &FlowId,
    ) -> Result<i64, RepositoryError>;

    /// Creates a draft record. Returns false if the id already exists.
    async fn insert_draft(
        &self,
        conn: &mut SqliteConnection,
        target_id: &str,
        title: &str,
    ) -> Result<bool, RepositoryError>;
}

/// SQL for one record table. Both tables share the same approval columns.
pub struct TargetQueries {
    select: &'static str,
    update: &'static str,
    count_pending: &'static str,
    insert_draft: &'static str,
}

pub trait TargetTable: Send + Sync {
    const TARGET_TYPE: TargetType;
    const QUERIES: TargetQueries;
}

pub struct QuotationTarget;

impl TargetTable for QuotationTarget {
    const TARGET_TYPE: TargetType = TargetType::Quotation;
    const QUERIES: TargetQueries = TargetQueries {
        select: "SELECT approval_flow_id, approval_flow_version, approval_status, \
                 current_approval_step, approval_revision FROM quotation WHERE id = ?1",
        update: "UPDATE quotation SET approval_flow_id = ?1, approval_flow_version = ?2, \
                 approval_status = ?3, current_approval_step = ?4, approval_revision = ?5 \
                 WHERE id = ?6 AND approval_revision = ?7",
        count_pending: "SELECT COUNT(1) FROM quotation \
                        WHERE approval_flow_id = ?1 AND approval_status = 'pending'",
        insert_draft: "INSERT INTO quotation (id, title, created_at) VALUES (?1, ?2, ?3) \
                       ON CONFLICT(id) DO NOTHING",
    };
}

pub struct PurchaseOrderTarget;

impl TargetTable for PurchaseOrderTarget {
    const TARGET_TYPE: TargetType = TargetType::PurchaseOrder;
    const QUERIES: TargetQueries = TargetQueries {
        select: "SELECT approval_flow_id, approval_flow_version, approval_status, \
                 current_approval_step, approval_revision FROM purchase_order WHERE id = ?1",
        update: "UPDATE purchase_order SET approval_flow_id = ?1, approval_flow_version = ?2, \
                 approval_status = ?3, current_approval_step = ?4, approval_revision = ?5 \
                 WHERE id = ?6 AND approval_revision = ?7",
        count_pending: "SELECT COUNT(1) FROM purchase_order \
                        WHERE approval_flow_id = ?1 AND approval_status = 'pending'",
        insert_draft: "INSERT INTO purchase_order (id, title, created_at) VALUES (?1, ?2, ?3) \
                       ON CONFLICT(id) DO NOTHING",
    };
}

static QUOTATION: QuotationTarget = QuotationTarget;
static PURCHASE_ORDER: PurchaseOrderTarget = PurchaseOrderTarget;

pub fn adapter_for(target_type: TargetType) -> &'static dyn TargetAdapter {
    match target_type {
        TargetType::Quotation => &QUOTATION,
        TargetType::PurchaseOrder => &PURCHASE_ORDER,
    }
}

#[async_trait]
impl<T> TargetAdapter for T
where
    T: TargetTable,
{
    fn target_type(&self) -> TargetType {
        T::TARGET_TYPE
    }

    async fn read_status(
        &self,
        conn: &mut SqliteConnection,
        target_id: &str,
    ) -> Result<Option<StatusProjection>, RepositoryError> {
        let Some(row) =
            sqlx::query(T::QUERIES.select).bind(target_id).fetch_optional(&mut *conn).await?
        else {
            return Ok(None);
        };

        let flow_id: Option<String> = column(&row, "approval_flow_id")?;
        let flow_version: Option<i64> = column(&row, "approval_flow_version")?;
        let status: String = column(&row, "approval_status")?;
        let current_step: Option<i64> = column(&row, "current_approval_step")?;

        Ok(Some(StatusProjection {
            flow_id: flow_id.map(FlowId),
            flow_version: flow_version
                .map(|value| to_u32(value, "approval_flow_version"))
                .transpose()?,
            status: status
                .parse::<ApprovalStatus>()
                .map_err(|error| RepositoryError::Decode(error.to_string()))?,
            current_step: current_step
                .map(|value| to_u32(value, "current_approval_step"))
                .transpose()?,
            revision: column(&row, "approval_revision")?,
        }))
    }

    async fn write_status(
        &self,
        conn: &mut SqliteConnection,
        target_id: &str,
        expected_revision: i64,
        next: &StatusProjection,
    ) -> Result<WriteOutcome, RepositoryError> {
        let result = sqlx::query(T::QUERIES.update)
            .bind(next.flow_id.as_ref().map(FlowId::as_str))
            .bind(next.flow_version.map(i64::from))
            .bind(next.status.as_str())
            .bind(next.current_step.map(i64::from))
            .bind(next.revision)
            .bind(target_id)
            .bind(expected_revision)
            .execute(&mut *conn)
            .await?;

        Ok(if result.rows_affected() == 1 { WriteOutcome::Applied } else { WriteOutcome::Conflict })
    }

    async fn count_pending_for_flow(
        &self,
        conn: &mut SqliteConnection,
        flow_id: &FlowId,
    ) -> Result<i64, RepositoryError> {
        let count: i64 = sqlx::query_scalar(T::QUERIES.count_pending)
            .bind(flow_id.as_str())
            .fetch_one(&mut *conn)
            .await?;
        Ok(count)
    }

    async fn insert_draft(
        &self,
        conn: &mut SqliteConnection,
        target_id: &str,
        title: &str,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(T::QUERIES.insert_draft)
            .bind(target_id)
            .bind(title)
            .bind(encode_timestamp(&storage_now()))
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// Creates a draft quotation or purchase order so it can enter a flow.
pub async fn register_draft(
    pool: &DbPool,
    target: &TargetRef,
    title: &str,
) -> Result<bool, RepositoryError> {
    let mut conn = pool.acquire().await?;
    adapter_for(target.target_type).insert_draft(&mut conn, &target.target_id, title).await
}
