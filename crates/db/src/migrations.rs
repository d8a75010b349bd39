use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Known migration versions split by whether the database has applied them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationStatus {
    pub applied: Vec<i64>,
    pub pending: Vec<i64>,
}

impl MigrationStatus {
    pub fn is_current(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Reads the migration bookkeeping table without applying anything.
pub async fn status(pool: &DbPool) -> Result<MigrationStatus, sqlx::Error> {
    let (tracked,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '_sqlx_migrations'",
    )
    .fetch_one(pool)
    .await?;

    let recorded: Vec<i64> = if tracked == 0 {
        Vec::new()
    } else {
        sqlx::query_scalar("SELECT version FROM _sqlx_migrations WHERE success = 1")
            .fetch_all(pool)
            .await?
    };

    let mut status = MigrationStatus::default();
    for migration in MIGRATOR.iter().filter(|migration| !migration.migration_type.is_down_migration())
    {
        if recorded.contains(&migration.version) {
            status.applied.push(migration.version);
        } else {
            status.pending.push(migration.version);
        }
    }
    Ok(status)
}
