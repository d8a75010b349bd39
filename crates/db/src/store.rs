use signoff_core::domain::flow::{
    normalize_steps, validate_name, ApprovalFlow, FlowFilter, FlowId, FlowPatch, NewApprovalFlow,
};
use signoff_core::errors::{ApplicationError, ApprovalError};

use crate::repositories::flow::{fetch_flow, save_flow};
use crate::repositories::{
    adapter_for, storage_now, FlowRepository, RepositoryError, SqlFlowRepository,
};
use crate::DbPool;

/// Administrative operations on approval flow definitions.
pub struct FlowStore {
    pool: DbPool,
    flows: SqlFlowRepository,
}

impl FlowStore {
    pub fn new(pool: DbPool) -> Self {
        Self { flows: SqlFlowRepository::new(pool.clone()), pool }
    }

    pub async fn create_flow(&self, input: NewApprovalFlow) -> Result<ApprovalFlow, ApplicationError> {
        let name = validate_name(&input.name)?;
        let steps = normalize_steps(input.steps)?;
        let now = storage_now();

        let flow = ApprovalFlow {
            id: FlowId::generate(),
            name,
            description: clean_description(input.description),
            target_type: input.target_type,
            steps,
            is_active: true,
            version: 1,
            created_by: input.created_by.trim().to_owned(),
            created_at: now,
            updated_at: now,
        };
        self.flows.insert(&flow).await?;

        tracing::info!(
            event_name = "flow.created",
            flow_id = %flow.id,
            target_type = %flow.target_type,
            step_count = flow.steps.len(),
            "approval flow created"
        );
        Ok(flow)
    }

    /// Applies a partial edit. Step changes create a new flow version; targets
    /// already pending stay on the version they were requested under.
    pub async fn update_flow(
        &self,
        id: &FlowId,
        patch: FlowPatch,
    ) -> Result<ApprovalFlow, ApplicationError> {
        let contended = |error: RepositoryError| flow_write_error(id, error);
        let mut tx = self.pool.begin().await.map_err(|error| contended(error.into()))?;
        let mut flow = fetch_flow(&mut tx, id)
            .await
            .map_err(contended)?
            .ok_or_else(|| ApprovalError::FlowNotFound(id.clone()))?;

        if let Some(name) = patch.name {
            flow.name = validate_name(&name)?;
        }
        if let Some(description) = patch.description {
            flow.description = clean_description(description);
        }
        if let Some(target_type) = patch.target_type.filter(|next| *next != flow.target_type) {
            let pending = adapter_for(flow.target_type)
                .count_pending_for_flow(&mut tx, &flow.id)
                .await
                .map_err(contended)?;
            if pending > 0 {
                return Err(ApprovalError::FlowInUse { flow_id: flow.id.clone(), pending }.into());
            }
            flow.target_type = target_type;
        }

        let mut new_version = false;
        if let Some(steps) = patch.steps {
            let steps = normalize_steps(steps)?;
            if steps != flow.steps {
                flow.steps = steps;
                flow.version += 1;
                new_version = true;
            }
        }
        if let Some(is_active) = patch.is_active {
            flow.is_active = is_active;
        }

        flow.updated_at = storage_now();
        save_flow(&mut tx, &flow, new_version).await.map_err(contended)?;
        tx.commit().await.map_err(|error| contended(error.into()))?;

        tracing::info!(
            event_name = "flow.updated",
            flow_id = %flow.id,
            version = flow.version,
            new_version,
            is_active = flow.is_active,
            "approval flow updated"
        );
        Ok(flow)
    }

    /// Flows are never deleted; history keeps referencing them.
    pub async fn deactivate_flow(&self, id: &FlowId) -> Result<ApprovalFlow, ApplicationError> {
        self.update_flow(id, FlowPatch { is_active: Some(false), ..FlowPatch::default() }).await
    }

    pub async fn get_flow(&self, id: &FlowId) -> Result<ApprovalFlow, ApplicationError> {
        self.flows
            .find_by_id(id)
            .await?
            .ok_or_else(|| ApprovalError::FlowNotFound(id.clone()).into())
    }

    pub async fn list_flows(
        &self,
        filter: &FlowFilter,
    ) -> Result<Vec<ApprovalFlow>, ApplicationError> {
        Ok(self.flows.list(filter).await?)
    }
}

/// A write that lost to a concurrent transaction is a conflict the caller may
/// retry, not a storage failure.
fn flow_write_error(id: &FlowId, error: RepositoryError) -> ApplicationError {
    if error.is_contention() {
        tracing::warn!(
            event_name = "flow.update.conflict",
            flow_id = %id,
            error = %error,
            "flow update lost a concurrent write"
        );
        ApprovalError::Conflict { target: format!("flow {id}") }.into()
    } else {
        error.into()
    }
}

fn clean_description(description: Option<String>) -> Option<String> {
    description.map(|value| value.trim().to_owned()).filter(|value| !value.is_empty())
}
