use sqlx::Executor;

use signoff_core::domain::flow::TargetType;

use crate::connection::DbPool;
use crate::repositories::RepositoryError;

/// Demo flows covering both target types, including a step that needs two
/// distinct approvers.
const SEED_FLOWS: &[SeedFlowContract] = &[
    SeedFlowContract {
        flow_id: "flow-quotation-standard",
        target_type: TargetType::Quotation,
        step_roles: &["sales_manager", "finance"],
        description: "Quotation: sales manager, then finance",
    },
    SeedFlowContract {
        flow_id: "flow-quotation-large-deal",
        target_type: TargetType::Quotation,
        step_roles: &["sales_manager", "director"],
        description: "Quotation: sales manager, then two directors",
    },
    SeedFlowContract {
        flow_id: "flow-po-standard",
        target_type: TargetType::PurchaseOrder,
        step_roles: &["procurement", "finance"],
        description: "Purchase order: procurement, then finance",
    },
];

const SEED_TARGETS: &[(TargetType, &str)] = &[
    (TargetType::Quotation, "Q-2026-0001"),
    (TargetType::Quotation, "Q-2026-0002"),
    (TargetType::PurchaseOrder, "PO-2026-0001"),
];

pub struct DemoSeedDataset;

impl DemoSeedDataset {
    pub const SQL: &str = include_str!("../../../config/fixtures/demo_seed.sql");

    /// Loads demo flows and draft records. Existing rows are left untouched.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;
        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        let flows_seeded = SEED_FLOWS
            .iter()
            .map(|flow| FlowSeedInfo {
                flow_id: flow.flow_id,
                target_type: flow.target_type,
                description: flow.description,
            })
            .collect::<Vec<_>>();
        let targets_seeded = SEED_TARGETS.iter().map(|(_, id)| *id).collect::<Vec<_>>();

        Ok(SeedResult { flows_seeded, targets_seeded })
    }

    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        for flow in SEED_FLOWS {
            let flow_ok: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM approval_flow WHERE id = ?1 AND target_type = ?2)",
            )
            .bind(flow.flow_id)
            .bind(flow.target_type.as_str())
            .fetch_one(pool)
            .await?;
            checks.push((flow.flow_id, flow_ok == 1));

            let roles: Vec<String> = sqlx::query_scalar(
                "SELECT json_extract(step.value, '$.approver_role_id') \
                 FROM approval_flow_version AS version, json_each(version.steps_json) AS step \
                 WHERE version.flow_id = ?1 AND version.version = 1 \
                 ORDER BY json_extract(step.value, '$.step_number')",
            )
            .bind(flow.flow_id)
            .fetch_all(pool)
            .await?;
            let roles_ok = roles.len() == flow.step_roles.len()
                && roles.iter().zip(flow.step_roles).all(|(actual, expected)| actual == expected);
            checks.push((flow.version_label(), roles_ok));
        }

        for (target_type, target_id) in SEED_TARGETS {
            let table = match target_type {
                TargetType::Quotation => "quotation",
                TargetType::PurchaseOrder => "purchase_order",
            };
            let exists: i64 =
                sqlx::query_scalar(&format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1)"))
                    .bind(*target_id)
                    .fetch_one(pool)
                    .await?;
            checks.push((*target_id, exists == 1));
        }

        let all_present = checks.iter().all(|(_, present)| *present);
        Ok(VerificationResult { all_present, checks })
    }
}

#[derive(Debug, Clone, Copy)]
struct SeedFlowContract {
    flow_id: &'static str,
    target_type: TargetType,
    step_roles: &'static [&'static str],
    description: &'static str,
}

impl SeedFlowContract {
    fn version_label(&self) -> &'static str {
        match self.flow_id {
            "flow-quotation-standard" => "flow-quotation-standard-v1-steps",
            "flow-quotation-large-deal" => "flow-quotation-large-deal-v1-steps",
            _ => "flow-po-standard-v1-steps",
        }
    }
}

#[derive(Debug)]
pub struct SeedResult {
    pub flows_seeded: Vec<FlowSeedInfo>,
    pub targets_seeded: Vec<&'static str>,
}

#[derive(Debug)]
pub struct FlowSeedInfo {
    pub flow_id: &'static str,
    pub target_type: TargetType,
    pub description: &'static str,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
