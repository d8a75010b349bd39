use clap::Args;
use serde::Serialize;
use signoff_core::approvals::InMemoryRoleDirectory;
use signoff_core::config::AppConfig;
use signoff_core::domain::flow::{FlowId, TargetType};
use signoff_core::domain::target::{DerivedStatus, StatusProjection, TargetRef};
use signoff_core::flows::TransitionOutcome;
use signoff_db::{register_draft, ApprovalEngine, DbPool};

use crate::commands::{application_failure, with_database, CommandResult, Failure};

#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    #[arg(long = "type", help = "Record type: quotation or purchase_order")]
    pub target_type: TargetType,
    #[arg(long = "id", help = "Record identifier")]
    pub target_id: String,
}

impl TargetArgs {
    fn target(&self) -> TargetRef {
        TargetRef::new(self.target_type, self.target_id.trim())
    }
}

#[derive(Debug, Clone, Args)]
pub struct DraftArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    #[arg(long, default_value = "untitled")]
    pub title: String,
}

#[derive(Debug, Clone, Args)]
pub struct RequestArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    #[arg(long = "flow", help = "Approval flow id to attach")]
    pub flow_id: String,
    #[arg(long = "by", help = "Actor submitting the record")]
    pub requested_by: String,
    #[arg(long)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct ApproveArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    #[arg(long = "actor")]
    pub actor_id: String,
    #[arg(long, help = "Step the approval is meant for; refused if no longer current")]
    pub step: Option<u32>,
    #[arg(long)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct RejectArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    #[arg(long = "actor")]
    pub actor_id: String,
    #[arg(long)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct StatusArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    #[arg(long = "flow", help = "Derive status under this flow from the ledger")]
    pub flow_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusView {
    target: TargetRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    projection: Option<StatusProjection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    derived: Option<DerivedStatus>,
}

pub fn draft(args: DraftArgs) -> CommandResult {
    let target = args.target.target();
    let result = with_database(|_config, pool| async move {
        register_draft(&pool, &target, args.title.trim())
            .await
            .map_err(|error| application_failure(error.into()))
            .map(|created| (target, created))
    });

    match result {
        Ok((target, true)) => CommandResult::success("draft", format!("created draft {target}")),
        Ok((target, false)) => CommandResult::failure(
            "draft",
            "conflict",
            format!("{target} already exists"),
            16,
        ),
        Err(failure) => CommandResult::from_failure("draft", failure),
    }
}

pub fn request(args: RequestArgs) -> CommandResult {
    let target = args.target.target();
    let flow_id = FlowId(args.flow_id.trim().to_owned());
    let result = with_engine(|engine| async move {
        engine
            .request_approval(&target, &flow_id, &args.requested_by, args.comment.as_deref())
            .await
            .map_err(application_failure)
    });
    transition_result("request", result)
}

pub fn approve(args: ApproveArgs) -> CommandResult {
    let target = args.target.target();
    let result = with_engine(|engine| async move {
        let comment = args.comment.as_deref();
        let outcome = match args.step {
            Some(step) => engine.approve_at_step(&target, &args.actor_id, step, comment).await,
            None => engine.approve(&target, &args.actor_id, comment).await,
        };
        outcome.map_err(application_failure)
    });
    transition_result("approve", result)
}

pub fn reject(args: RejectArgs) -> CommandResult {
    let target = args.target.target();
    let result = with_engine(|engine| async move {
        engine
            .reject(&target, &args.actor_id, args.comment.as_deref())
            .await
            .map_err(application_failure)
    });
    transition_result("reject", result)
}

pub fn history(args: TargetArgs) -> CommandResult {
    let target = args.target();
    let result = with_engine(|engine| async move {
        engine.get_history(&target).await.map_err(application_failure)
    });

    match result {
        Ok(entries) => CommandResult::success_with_data(
            "history",
            format!("{} ledger entries for {}", entries.len(), args.target()),
            &entries,
        ),
        Err(failure) => CommandResult::from_failure("history", failure),
    }
}

pub fn status(args: StatusArgs) -> CommandResult {
    let target = args.target.target();
    let flow_id = args.flow_id.as_deref().map(|id| FlowId(id.trim().to_owned()));
    let result = with_engine(|engine| async move {
        let view = match flow_id {
            Some(flow_id) => StatusView {
                derived: Some(
                    engine.get_current_status(&flow_id, &target).await.map_err(application_failure)?,
                ),
                projection: None,
                target,
            },
            None => StatusView {
                projection: Some(engine.get_projection(&target).await.map_err(application_failure)?),
                derived: None,
                target,
            },
        };
        Ok::<_, Failure>(view)
    });

    match result {
        Ok(view) => {
            let status = view
                .derived
                .or_else(|| view.projection.as_ref().map(StatusProjection::derived))
                .unwrap_or(DerivedStatus::DRAFT);
            CommandResult::success_with_data("status", describe(&view.target, status), &view)
        }
        Err(failure) => CommandResult::from_failure("status", failure),
    }
}

pub fn reconcile(args: TargetArgs) -> CommandResult {
    let target = args.target();
    let result = with_engine(|engine| async move {
        engine.reconcile(&target).await.map_err(application_failure)
    });

    match result {
        Ok(report) if report.consistent => CommandResult::success_with_data(
            "reconcile",
            format!("{} projection matches ledger", report.target),
            &report,
        ),
        Ok(report) => CommandResult::failure(
            "reconcile",
            "invalid_state",
            format!(
                "{} projection says {} but ledger says {}",
                report.target, report.cached.status, report.recomputed.status
            ),
            12,
        ),
        Err(failure) => CommandResult::from_failure("reconcile", failure),
    }
}

fn with_engine<T, F, Fut>(task: F) -> Result<T, Failure>
where
    F: FnOnce(ApprovalEngine<InMemoryRoleDirectory>) -> Fut,
    Fut: std::future::Future<Output = Result<T, Failure>>,
{
    with_database(|config: AppConfig, pool: DbPool| {
        let roles = InMemoryRoleDirectory::from_members(&config.roles.members);
        task(ApprovalEngine::new(pool, roles, config.engine))
    })
}

fn transition_result(command: &str, result: Result<TransitionOutcome, Failure>) -> CommandResult {
    match result {
        Ok(outcome) => {
            let target = TargetRef::new(outcome.entry.target_type, outcome.entry.target_id.clone());
            CommandResult::success_with_data(command, describe(&target, outcome.to.derived()), &outcome)
        }
        Err(failure) => CommandResult::from_failure(command, failure),
    }
}

fn describe(target: &TargetRef, status: DerivedStatus) -> String {
    match status.current_step {
        Some(step) => format!("{target} is {} at step {step}", status.status),
        None => format!("{target} is {}", status.status),
    }
}
