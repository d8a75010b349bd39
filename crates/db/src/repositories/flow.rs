use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::SqliteConnection;

use signoff_core::domain::flow::{ApprovalFlow, FlowFilter, FlowId, FlowStep, TargetType};

use super::{column, decode_timestamp, encode_timestamp, to_u32, FlowRepository, RepositoryError};
use crate::DbPool;

const SELECT_FLOW: &str = "SELECT id, name, description, target_type, version, steps_json, \
     is_active, created_by, created_at, updated_at FROM approval_flow WHERE id = ?1";

const LIST_FLOWS: &str = "SELECT id, name, description, target_type, version, steps_json, \
     is_active, created_by, created_at, updated_at FROM approval_flow \
     WHERE (?1 IS NULL OR target_type = ?1) AND (?2 = 0 OR is_active = 1) \
     ORDER BY created_at DESC, id ASC";

pub struct SqlFlowRepository {
    pool: DbPool,
}

impl SqlFlowRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FlowRepository for SqlFlowRepository {
    async fn find_by_id(&self, id: &FlowId) -> Result<Option<ApprovalFlow>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        fetch_flow(&mut conn, id).await
    }

    async fn find_steps(
        &self,
        id: &FlowId,
        version: u32,
    ) -> Result<Option<Vec<FlowStep>>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        fetch_steps(&mut conn, id, version).await
    }

    async fn list(&self, filter: &FlowFilter) -> Result<Vec<ApprovalFlow>, RepositoryError> {
        let rows = sqlx::query(LIST_FLOWS)
            .bind(filter.target_type.map(|target_type| target_type.as_str()))
            .bind(filter.active_only)
            .fetch_all(&self.pool)
            .await?;

        let mut flows = Vec::with_capacity(rows.len());
        for row in rows {
            let flow = flow_from_row(&row)?;
            if filter.matches(&flow) {
                flows.push(flow);
            }
        }
        Ok(flows)
    }

    async fn insert(&self, flow: &ApprovalFlow) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        insert_flow(&mut tx, flow).await?;
        tx.commit().await?;
        Ok(())
    }
}

pub(crate) async fn fetch_flow(
    conn: &mut SqliteConnection,
    id: &FlowId,
) -> Result<Option<ApprovalFlow>, RepositoryError> {
    let row = sqlx::query(SELECT_FLOW).bind(id.as_str()).fetch_optional(&mut *conn).await?;
    row.as_ref().map(flow_from_row).transpose()
}

/// Steps of a specific flow version, as pinned by pending targets.
pub(crate) async fn fetch_steps(
    conn: &mut SqliteConnection,
    id: &FlowId,
    version: u32,
) -> Result<Option<Vec<FlowStep>>, RepositoryError> {
    let raw: Option<String> = sqlx::query_scalar(
        "SELECT steps_json FROM approval_flow_version WHERE flow_id = ?1 AND version = ?2",
    )
    .bind(id.as_str())
    .bind(i64::from(version))
    .fetch_optional(&mut *conn)
    .await?;

    raw.as_deref().map(decode_steps).transpose()
}

/// Inserts the flow and its first step snapshot.
pub(crate) async fn insert_flow(
    conn: &mut SqliteConnection,
    flow: &ApprovalFlow,
) -> Result<(), RepositoryError> {
    let steps_json = encode_steps(&flow.steps)?;

    sqlx::query(
        "INSERT INTO approval_flow (id, name, description, target_type, version, steps_json, \
         is_active, created_by, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )
    .bind(flow.id.as_str())
    .bind(&flow.name)
    .bind(flow.description.as_deref())
    .bind(flow.target_type.as_str())
    .bind(i64::from(flow.version))
    .bind(&steps_json)
    .bind(flow.is_active)
    .bind(&flow.created_by)
    .bind(encode_timestamp(&flow.created_at))
    .bind(encode_timestamp(&flow.updated_at))
    .execute(&mut *conn)
    .await?;

    insert_version(conn, flow, &steps_json).await
}

/// Persists an edited flow. When `new_version` is set the current steps are
/// also snapshotted under `flow.version`.
pub(crate) async fn save_flow(
    conn: &mut SqliteConnection,
    flow: &ApprovalFlow,
    new_version: bool,
) -> Result<(), RepositoryError> {
    let steps_json = encode_steps(&flow.steps)?;

    sqlx::query(
        "UPDATE approval_flow SET name = ?1, description = ?2, target_type = ?3, version = ?4, \
         steps_json = ?5, is_active = ?6, updated_at = ?7 WHERE id = ?8",
    )
    .bind(&flow.name)
    .bind(flow.description.as_deref())
    .bind(flow.target_type.as_str())
    .bind(i64::from(flow.version))
    .bind(&steps_json)
    .bind(flow.is_active)
    .bind(encode_timestamp(&flow.updated_at))
    .bind(flow.id.as_str())
    .execute(&mut *conn)
    .await?;

    if new_version {
        insert_version(conn, flow, &steps_json).await?;
    }
    Ok(())
}

async fn insert_version(
    conn: &mut SqliteConnection,
    flow: &ApprovalFlow,
    steps_json: &str,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO approval_flow_version (flow_id, version, steps_json, created_at) \
         VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(flow.id.as_str())
    .bind(i64::from(flow.version))
    .bind(steps_json)
    .bind(encode_timestamp(&flow.updated_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn flow_from_row(row: &SqliteRow) -> Result<ApprovalFlow, RepositoryError> {
    let target_type: String = column(row, "target_type")?;
    let steps_json: String = column(row, "steps_json")?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;

    Ok(ApprovalFlow {
        id: FlowId(column(row, "id")?),
        name: column(row, "name")?,
        description: column(row, "description")?,
        target_type: target_type
            .parse::<TargetType>()
            .map_err(|error| RepositoryError::Decode(error.to_string()))?,
        steps: decode_steps(&steps_json)?,
        is_active: column(row, "is_active")?,
        version: to_u32(column(row, "version")?, "version")?,
        created_by: column(row, "created_by")?,
        created_at: decode_timestamp(&created_at)?,
        updated_at: decode_timestamp(&updated_at)?,
    })
}

fn encode_steps(steps: &[FlowStep]) -> Result<String, RepositoryError> {
    serde_json::to_string(steps).map_err(|error| RepositoryError::Decode(error.to_string()))
}

fn decode_steps(raw: &str) -> Result<Vec<FlowStep>, RepositoryError> {
    serde_json::from_str(raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid steps_json: {error}")))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{fetch_steps, save_flow, SqlFlowRepository};
    use crate::repositories::FlowRepository;
    use crate::{connect_with_settings, migrations, DbPool};
    use signoff_core::domain::flow::{ApprovalFlow, FlowFilter, FlowId, FlowStep, TargetType};

    async fn setup() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn flow(id: &str, name: &str, target_type: TargetType, minutes: i64) -> ApprovalFlow {
        let created = Utc.with_ymd_and_hms(2026, 4, 1, 10, 0, 0).single().expect("valid time")
            + Duration::minutes(minutes);
        ApprovalFlow {
            id: FlowId(id.to_owned()),
            name: name.to_owned(),
            description: Some("two step".to_owned()),
            target_type,
            steps: vec![FlowStep::new(1, "sales_manager", 1), FlowStep::new(2, "finance", 2)],
            is_active: true,
            version: 1,
            created_by: "admin".to_owned(),
            created_at: created,
            updated_at: created,
        }
    }

    #[tokio::test]
    async fn insert_and_find_round_trips_steps_and_timestamps() {
        let pool = setup().await;
        let repo = SqlFlowRepository::new(pool.clone());
        let original = flow("flow-1", "Standard", TargetType::Quotation, 0);

        repo.insert(&original).await.expect("insert");
        let loaded = repo.find_by_id(&original.id).await.expect("find").expect("present");

        assert_eq!(loaded, original);
        let pinned = repo.find_steps(&original.id, 1).await.expect("steps").expect("version 1");
        assert_eq!(pinned, original.steps);
        assert!(repo.find_steps(&original.id, 2).await.expect("steps").is_none());
        assert!(repo.find_by_id(&FlowId("missing".to_owned())).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn list_filters_by_type_activity_and_name() {
        let pool = setup().await;
        let repo = SqlFlowRepository::new(pool.clone());
        repo.insert(&flow("flow-q1", "Quote Standard", TargetType::Quotation, 0)).await.expect("q1");
        repo.insert(&flow("flow-q2", "Quote Director", TargetType::Quotation, 1)).await.expect("q2");
        repo.insert(&flow("flow-p1", "PO Standard", TargetType::PurchaseOrder, 2)).await.expect("p1");

        let mut inactive = flow("flow-q1", "Quote Standard", TargetType::Quotation, 0);
        inactive.is_active = false;
        let mut conn = pool.acquire().await.expect("conn");
        save_flow(&mut conn, &inactive, false).await.expect("deactivate");
        drop(conn);

        let all = repo.list(&FlowFilter::default()).await.expect("list");
        let ids = all.iter().map(|flow| flow.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["flow-p1", "flow-q2", "flow-q1"]);

        let quotations = repo
            .list(&FlowFilter { target_type: Some(TargetType::Quotation), ..FlowFilter::default() })
            .await
            .expect("list quotations");
        assert_eq!(quotations.len(), 2);

        let active_quotes = repo
            .list(&FlowFilter {
                target_type: Some(TargetType::Quotation),
                active_only: true,
                name_contains: None,
            })
            .await
            .expect("list active");
        assert_eq!(active_quotes.len(), 1);
        assert_eq!(active_quotes[0].id.as_str(), "flow-q2");

        let searched = repo
            .list(&FlowFilter { name_contains: Some("standard".to_owned()), ..FlowFilter::default() })
            .await
            .expect("search");
        assert_eq!(searched.len(), 2);
    }

    #[tokio::test]
    async fn new_version_snapshot_keeps_previous_steps() {
        let pool = setup().await;
        let repo = SqlFlowRepository::new(pool.clone());
        let mut edited = flow("flow-1", "Standard", TargetType::Quotation, 0);
        repo.insert(&edited).await.expect("insert");

        edited.steps = vec![FlowStep::new(1, "director", 1)];
        edited.version = 2;
        let mut conn = pool.acquire().await.expect("conn");
        save_flow(&mut conn, &edited, true).await.expect("save");

        let v1 = fetch_steps(&mut conn, &edited.id, 1).await.expect("v1").expect("present");
        let v2 = fetch_steps(&mut conn, &edited.id, 2).await.expect("v2").expect("present");
        assert_eq!(v1.len(), 2);
        assert_eq!(v2, vec![FlowStep::new(1, "director", 1)]);
    }
}
