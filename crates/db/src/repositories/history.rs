use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::SqliteConnection;

use signoff_core::domain::flow::{FlowId, TargetType};
use signoff_core::domain::history::{ApprovalAction, HistoryEntry, HistoryEntryId};
use signoff_core::domain::target::TargetRef;

use super::{
    column, decode_timestamp, encode_timestamp, to_u32, HistoryRepository, RepositoryError,
};
use crate::DbPool;

const HISTORY_FOR_TARGET: &str = "SELECT id, flow_id, flow_version, target_type, target_id, step, \
     action, comment, actor_id, created_at FROM approval_history \
     WHERE target_type = ?1 AND target_id = ?2 ORDER BY created_at ASC, sequence ASC";

const HISTORY_FOR_FLOW_AND_TARGET: &str = "SELECT id, flow_id, flow_version, target_type, \
     target_id, step, action, comment, actor_id, created_at FROM approval_history \
     WHERE flow_id = ?1 AND target_type = ?2 AND target_id = ?3 \
     ORDER BY created_at ASC, sequence ASC";

pub struct SqlHistoryRepository {
    pool: DbPool,
}

impl SqlHistoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryRepository for SqlHistoryRepository {
    async fn list_for(&self, target: &TargetRef) -> Result<Vec<HistoryEntry>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        fetch_for_target(&mut conn, target).await
    }

    async fn list_for_flow(
        &self,
        flow_id: &FlowId,
        target: &TargetRef,
    ) -> Result<Vec<HistoryEntry>, RepositoryError> {
        let rows = sqlx::query(HISTORY_FOR_FLOW_AND_TARGET)
            .bind(flow_id.as_str())
            .bind(target.target_type.as_str())
            .bind(&target.target_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(entry_from_row).collect()
    }
}

pub(crate) async fn append_entry(
    conn: &mut SqliteConnection,
    entry: &HistoryEntry,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO approval_history (id, flow_id, flow_version, target_type, target_id, step, \
         action, comment, actor_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )
    .bind(&entry.id.0)
    .bind(entry.flow_id.as_str())
    .bind(i64::from(entry.flow_version))
    .bind(entry.target_type.as_str())
    .bind(&entry.target_id)
    .bind(i64::from(entry.step))
    .bind(entry.action.as_str())
    .bind(entry.comment.as_deref())
    .bind(&entry.actor_id)
    .bind(encode_timestamp(&entry.created_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Full ledger for a target in append order.
pub(crate) async fn fetch_for_target(
    conn: &mut SqliteConnection,
    target: &TargetRef,
) -> Result<Vec<HistoryEntry>, RepositoryError> {
    let rows = sqlx::query(HISTORY_FOR_TARGET)
        .bind(target.target_type.as_str())
        .bind(&target.target_id)
        .fetch_all(&mut *conn)
        .await?;

    rows.iter().map(entry_from_row).collect()
}

fn entry_from_row(row: &SqliteRow) -> Result<HistoryEntry, RepositoryError> {
    let target_type: String = column(row, "target_type")?;
    let action: String = column(row, "action")?;
    let created_at: String = column(row, "created_at")?;

    Ok(HistoryEntry {
        id: HistoryEntryId(column(row, "id")?),
        flow_id: FlowId(column(row, "flow_id")?),
        flow_version: to_u32(column(row, "flow_version")?, "flow_version")?,
        target_type: target_type
            .parse::<TargetType>()
            .map_err(|error| RepositoryError::Decode(error.to_string()))?,
        target_id: column(row, "target_id")?,
        step: to_u32(column(row, "step")?, "step")?,
        action: action
            .parse::<ApprovalAction>()
            .map_err(|error| RepositoryError::Decode(error.to_string()))?,
        comment: column(row, "comment")?,
        actor_id: column(row, "actor_id")?,
        created_at: decode_timestamp(&created_at)?,
    })
}
