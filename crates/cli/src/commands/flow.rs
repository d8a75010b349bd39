use anyhow::{bail, Context};
use clap::Args;
use signoff_core::domain::flow::{FlowFilter, FlowId, FlowPatch, FlowStep, NewApprovalFlow, TargetType};
use signoff_db::FlowStore;

use crate::commands::{application_failure, with_database, CommandResult, Failure};

#[derive(Debug, Clone, Args)]
pub struct CreateArgs {
    #[arg(long)]
    pub name: String,
    #[arg(long = "target-type")]
    pub target_type: TargetType,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long = "step", required = true, help = "Approver role, optionally `role:count`; in order")]
    pub steps: Vec<String>,
    #[arg(long = "by", default_value = "cli")]
    pub created_by: String,
}

#[derive(Debug, Clone, Args)]
pub struct UpdateArgs {
    #[arg(long = "flow")]
    pub flow_id: String,
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long, conflicts_with = "clear_description")]
    pub description: Option<String>,
    #[arg(long)]
    pub clear_description: bool,
    #[arg(long = "target-type")]
    pub target_type: Option<TargetType>,
    #[arg(long = "step", help = "Replaces all steps; creates a new flow version")]
    pub steps: Vec<String>,
    #[arg(long, conflicts_with = "deactivate")]
    pub activate: bool,
    #[arg(long)]
    pub deactivate: bool,
}

#[derive(Debug, Clone, Default, Args)]
pub struct ListArgs {
    #[arg(long = "target-type")]
    pub target_type: Option<TargetType>,
    #[arg(long)]
    pub active_only: bool,
    #[arg(long, help = "Case-insensitive name search")]
    pub search: Option<String>,
}

pub fn create(args: CreateArgs) -> CommandResult {
    let steps = match parse_step_specs(&args.steps) {
        Ok(steps) => steps,
        Err(error) => return CommandResult::failure("flow.create", "validation", format!("{error:#}"), 10),
    };
    let input = NewApprovalFlow {
        name: args.name,
        description: args.description,
        target_type: args.target_type,
        steps,
        created_by: args.created_by,
    };

    let result = with_store(|store| async move {
        store.create_flow(input).await.map_err(application_failure)
    });
    match result {
        Ok(flow) => CommandResult::success_with_data(
            "flow.create",
            format!("created flow {} (version {})", flow.id, flow.version),
            &flow,
        ),
        Err(failure) => CommandResult::from_failure("flow.create", failure),
    }
}

pub fn update(args: UpdateArgs) -> CommandResult {
    let patch = match build_patch(&args) {
        Ok(patch) => patch,
        Err(error) => return CommandResult::failure("flow.update", "validation", format!("{error:#}"), 10),
    };
    let flow_id = FlowId(args.flow_id.trim().to_owned());

    let result = with_store(|store| async move {
        store.update_flow(&flow_id, patch).await.map_err(application_failure)
    });
    match result {
        Ok(flow) => CommandResult::success_with_data(
            "flow.update",
            format!("updated flow {} (version {})", flow.id, flow.version),
            &flow,
        ),
        Err(failure) => CommandResult::from_failure("flow.update", failure),
    }
}

pub fn deactivate(flow_id: &str) -> CommandResult {
    let flow_id = FlowId(flow_id.trim().to_owned());
    let result = with_store(|store| async move {
        store.deactivate_flow(&flow_id).await.map_err(application_failure)
    });
    match result {
        Ok(flow) => CommandResult::success_with_data(
            "flow.deactivate",
            format!("deactivated flow {}", flow.id),
            &flow,
        ),
        Err(failure) => CommandResult::from_failure("flow.deactivate", failure),
    }
}

pub fn show(flow_id: &str) -> CommandResult {
    let flow_id = FlowId(flow_id.trim().to_owned());
    let result =
        with_store(|store| async move { store.get_flow(&flow_id).await.map_err(application_failure) });
    match result {
        Ok(flow) => CommandResult::success_with_data(
            "flow.show",
            format!("{} [{}] version {}", flow.name, flow.target_type, flow.version),
            &flow,
        ),
        Err(failure) => CommandResult::from_failure("flow.show", failure),
    }
}

pub fn list(args: ListArgs) -> CommandResult {
    let filter = FlowFilter {
        target_type: args.target_type,
        active_only: args.active_only,
        name_contains: args.search,
    };
    let result = with_store(|store| async move {
        store.list_flows(&filter).await.map_err(application_failure)
    });
    match result {
        Ok(flows) => {
            CommandResult::success_with_data("flow.list", format!("{} flow(s)", flows.len()), &flows)
        }
        Err(failure) => CommandResult::from_failure("flow.list", failure),
    }
}

fn with_store<T, F, Fut>(task: F) -> Result<T, Failure>
where
    F: FnOnce(FlowStore) -> Fut,
    Fut: std::future::Future<Output = Result<T, Failure>>,
{
    with_database(|_config, pool| task(FlowStore::new(pool)))
}

/// Parses `role` or `role:count` specs into steps numbered by position.
pub fn parse_step_specs(specs: &[String]) -> anyhow::Result<Vec<FlowStep>> {
    let mut steps = Vec::with_capacity(specs.len());
    for (index, spec) in specs.iter().enumerate() {
        let step_number = u32::try_from(index + 1).context("too many steps")?;
        let (role, count) = match spec.split_once(':') {
            Some((role, count)) => {
                let count = count
                    .trim()
                    .parse::<u32>()
                    .with_context(|| format!("invalid approval count in step `{spec}`"))?;
                (role, count)
            }
            None => (spec.as_str(), 1),
        };

        if role.trim().is_empty() {
            bail!("step {step_number} (`{spec}`) does not name a role");
        }
        steps.push(FlowStep::new(step_number, role.trim(), count));
    }
    Ok(steps)
}

fn build_patch(args: &UpdateArgs) -> anyhow::Result<FlowPatch> {
    let steps = if args.steps.is_empty() { None } else { Some(parse_step_specs(&args.steps)?) };
    let description = if args.clear_description {
        Some(None)
    } else {
        args.description.clone().map(Some)
    };
    let is_active = match (args.activate, args.deactivate) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    };

    let patch = FlowPatch {
        name: args.name.clone(),
        description,
        target_type: args.target_type,
        steps,
        is_active,
    };
    if patch.is_empty() {
        bail!("nothing to update; pass at least one field");
    }
    Ok(patch)
}
