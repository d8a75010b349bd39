use std::future::Future;

use serde::Serialize;
use sqlx::SqliteConnection;

use signoff_core::approvals::RoleDirectory;
use signoff_core::config::EngineConfig;
use signoff_core::domain::flow::{FlowId, FlowStep};
use signoff_core::domain::history::{ApprovalAction, HistoryEntry};
use signoff_core::domain::target::{DerivedStatus, StatusProjection, TargetRef};
use signoff_core::errors::{ApplicationError, ApprovalError};
use signoff_core::flows::{
    current_cycle, derive_status, StepPin, TargetState, TransitionOutcome, TransitionPlanner,
};

use crate::repositories::flow::{fetch_flow, fetch_steps};
use crate::repositories::history::{append_entry, fetch_for_target};
use crate::repositories::{
    adapter_for, storage_now, FlowRepository, HistoryRepository, RepositoryError,
    SqlFlowRepository, SqlHistoryRepository, TargetAdapter, WriteOutcome,
};
use crate::DbPool;

/// Cached projection next to the status recomputed from the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub target: TargetRef,
    pub flow_id: Option<FlowId>,
    pub cached: DerivedStatus,
    pub recomputed: DerivedStatus,
    pub consistent: bool,
}

/// Processes request, approve and reject actions.
///
/// Each attempt runs in one transaction: read the projection, plan against the
/// ledger, append the entry, then write the projection with a compare-and-set
/// on its revision. A lost race rolls everything back and retries up to
/// `EngineConfig::max_conflict_retries` times.
pub struct ApprovalEngine<R> {
    pool: DbPool,
    flows: SqlFlowRepository,
    history: SqlHistoryRepository,
    planner: TransitionPlanner<R>,
    policy: EngineConfig,
}

#[derive(Debug)]
enum AttemptError {
    Conflict { observed_step: Option<u32> },
    Failed(ApplicationError),
}

impl AttemptError {
    fn at_step(self, step: u32) -> Self {
        match self {
            Self::Conflict { observed_step: None } => Self::Conflict { observed_step: Some(step) },
            other => other,
        }
    }
}

impl From<RepositoryError> for AttemptError {
    fn from(value: RepositoryError) -> Self {
        if value.is_contention() {
            Self::Conflict { observed_step: None }
        } else {
            Self::Failed(value.into())
        }
    }
}

impl From<sqlx::Error> for AttemptError {
    fn from(value: sqlx::Error) -> Self {
        RepositoryError::from(value).into()
    }
}

impl From<ApprovalError> for AttemptError {
    fn from(value: ApprovalError) -> Self {
        Self::Failed(value.into())
    }
}

impl<R> ApprovalEngine<R>
where
    R: RoleDirectory,
{
    pub fn new(pool: DbPool, roles: R, policy: EngineConfig) -> Self {
        Self {
            flows: SqlFlowRepository::new(pool.clone()),
            history: SqlHistoryRepository::new(pool.clone()),
            planner: TransitionPlanner::new(roles),
            policy,
            pool,
        }
    }

    pub async fn request_approval(
        &self,
        target: &TargetRef,
        flow_id: &FlowId,
        requested_by: &str,
        comment: Option<&str>,
    ) -> Result<TransitionOutcome, ApplicationError> {
        self.with_conflict_retry(target, ApprovalAction::Request, |_| {
            self.attempt_request(target, flow_id, requested_by, comment)
        })
        .await
    }

    /// Approves the target's current step.
    pub async fn approve(
        &self,
        target: &TargetRef,
        actor_id: &str,
        comment: Option<&str>,
    ) -> Result<TransitionOutcome, ApplicationError> {
        self.with_conflict_retry(target, ApprovalAction::Approve, |observed| {
            let pin = observed.map(StepPin::Observed).unwrap_or(StepPin::Current);
            self.attempt_decision(target, actor_id, comment, ApprovalAction::Approve, pin)
        })
        .await
    }

    /// Approves `step`, failing with a stale-step error if the target has moved on.
    pub async fn approve_at_step(
        &self,
        target: &TargetRef,
        actor_id: &str,
        step: u32,
        comment: Option<&str>,
    ) -> Result<TransitionOutcome, ApplicationError> {
        self.with_conflict_retry(target, ApprovalAction::Approve, |observed| {
            let pin = observed.map(StepPin::Observed).unwrap_or(StepPin::Expected(step));
            self.attempt_decision(target, actor_id, comment, ApprovalAction::Approve, pin)
        })
        .await
    }

    pub async fn reject(
        &self,
        target: &TargetRef,
        actor_id: &str,
        comment: Option<&str>,
    ) -> Result<TransitionOutcome, ApplicationError> {
        self.with_conflict_retry(target, ApprovalAction::Reject, |_| {
            self.attempt_decision(target, actor_id, comment, ApprovalAction::Reject, StepPin::Current)
        })
        .await
    }

    /// Full ledger for the target, oldest first.
    pub async fn get_history(&self, target: &TargetRef) -> Result<Vec<HistoryEntry>, ApplicationError> {
        self.get_projection(target).await?;
        Ok(self.history.list_for(target).await?)
    }

    /// Status of `target` under `flow_id`, derived purely from that flow's
    /// entries in the ledger.
    pub async fn get_current_status(
        &self,
        flow_id: &FlowId,
        target: &TargetRef,
    ) -> Result<DerivedStatus, ApplicationError> {
        self.get_projection(target).await?;
        if self.flows.find_by_id(flow_id).await?.is_none() {
            return Err(ApprovalError::FlowNotFound(flow_id.clone()).into());
        }

        let history = self.history.list_for_flow(flow_id, target).await?;
        self.derive_from_ledger(&history).await
    }

    /// Cached approval fields as stored on the record.
    pub async fn get_projection(
        &self,
        target: &TargetRef,
    ) -> Result<StatusProjection, ApplicationError> {
        let mut conn = self.pool.acquire().await.map_err(RepositoryError::from)?;
        Ok(adapter_for(target.target_type)
            .read_status(&mut conn, &target.target_id)
            .await?
            .ok_or_else(|| ApprovalError::TargetNotFound(target.to_string()))?)
    }

    /// Compares the cached projection with a fresh derivation from the ledger.
    pub async fn reconcile(&self, target: &TargetRef) -> Result<ReconcileReport, ApplicationError> {
        let projection = self.get_projection(target).await?;
        let history = self.history.list_for(target).await?;
        let recomputed = self.derive_from_ledger(&history).await?;
        let cached = projection.derived();
        let consistent = cached == recomputed;

        if !consistent {
            tracing::warn!(
                event_name = "approval.projection.drift",
                target_type = %target.target_type,
                target_id = %target.target_id,
                cached_status = %cached.status,
                recomputed_status = %recomputed.status,
                "cached approval status disagrees with ledger"
            );
        }

        Ok(ReconcileReport { target: target.clone(), flow_id: projection.flow_id, cached, recomputed, consistent })
    }

    async fn derive_from_ledger(
        &self,
        history: &[HistoryEntry],
    ) -> Result<DerivedStatus, ApplicationError> {
        let Some(request) = current_cycle(history).and_then(<[_]>::first) else {
            return Ok(DerivedStatus::DRAFT);
        };

        let steps = self
            .flows
            .find_steps(&request.flow_id, request.flow_version)
            .await?
            .ok_or_else(|| ApprovalError::FlowVersionNotFound {
                flow_id: request.flow_id.clone(),
                version: request.flow_version,
            })?;
        Ok(derive_status(&steps, history))
    }

    async fn with_conflict_retry<F, Fut>(
        &self,
        target: &TargetRef,
        action: ApprovalAction,
        mut attempt: F,
    ) -> Result<TransitionOutcome, ApplicationError>
    where
        F: FnMut(Option<u32>) -> Fut,
        Fut: Future<Output = Result<TransitionOutcome, AttemptError>>,
    {
        let mut observed_step = None;
        let mut retries = 0u32;

        loop {
            match attempt(observed_step).await {
                Ok(outcome) => {
                    log_accepted(&outcome, retries);
                    return Ok(outcome);
                }
                Err(AttemptError::Failed(error)) => {
                    tracing::info!(
                        event_name = "approval.action.refused",
                        target_type = %target.target_type,
                        target_id = %target.target_id,
                        action = action.as_str(),
                        error_class = error.error_class(),
                        error = %error,
                        "approval action refused"
                    );
                    return Err(error);
                }
                Err(AttemptError::Conflict { observed_step: step }) => {
                    if retries >= self.policy.max_conflict_retries {
                        tracing::warn!(
                            event_name = "approval.action.conflict_exhausted",
                            target_type = %target.target_type,
                            target_id = %target.target_id,
                            action = action.as_str(),
                            retries,
                            "giving up after repeated concurrent updates"
                        );
                        return Err(ApprovalError::Conflict { target: target.to_string() }.into());
                    }

                    retries += 1;
                    observed_step = observed_step.or(step);
                    tracing::debug!(
                        event_name = "approval.action.conflict_retry",
                        target_type = %target.target_type,
                        target_id = %target.target_id,
                        action = action.as_str(),
                        retry = retries,
                        "concurrent update detected, retrying"
                    );
                    tokio::time::sleep(self.policy.backoff(retries)).await;
                }
            }
        }
    }

    async fn attempt_request(
        &self,
        target: &TargetRef,
        flow_id: &FlowId,
        requested_by: &str,
        comment: Option<&str>,
    ) -> Result<TransitionOutcome, AttemptError> {
        let adapter = adapter_for(target.target_type);
        let mut tx = self.pool.begin().await?;

        let projection = load_projection(&mut tx, adapter, target).await?;
        let flow = fetch_flow(&mut tx, flow_id)
            .await?
            .ok_or_else(|| ApprovalError::FlowNotFound(flow_id.clone()))?;

        let now = storage_now();
        let outcome =
            self.planner.plan_request(&flow, target, &projection, requested_by, comment, now)?;
        persist(&mut tx, adapter, target, &outcome).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn attempt_decision(
        &self,
        target: &TargetRef,
        actor_id: &str,
        comment: Option<&str>,
        action: ApprovalAction,
        pin: StepPin,
    ) -> Result<TransitionOutcome, AttemptError> {
        let adapter = adapter_for(target.target_type);
        let mut tx = self.pool.begin().await?;

        let projection = load_projection(&mut tx, adapter, target).await?;
        let steps = pinned_steps(&mut tx, &projection).await?;
        let history = fetch_for_target(&mut tx, target).await?;
        let state = TargetState { target, projection: &projection, steps: &steps, history: &history };

        let now = storage_now();
        let outcome = match action {
            ApprovalAction::Reject => self.planner.plan_reject(state, actor_id, comment, now),
            _ => self.planner.plan_approve(state, actor_id, comment, pin, now),
        }?;

        persist(&mut tx, adapter, target, &outcome)
            .await
            .map_err(|error| error.at_step(outcome.entry.step))?;
        tx.commit().await.map_err(|error| AttemptError::from(error).at_step(outcome.entry.step))?;
        Ok(outcome)
    }
}

async fn load_projection(
    conn: &mut SqliteConnection,
    adapter: &dyn TargetAdapter,
    target: &TargetRef,
) -> Result<StatusProjection, AttemptError> {
    Ok(adapter
        .read_status(conn, &target.target_id)
        .await?
        .ok_or_else(|| ApprovalError::TargetNotFound(target.to_string()))?)
}

/// Steps of the flow version the target was requested under. Non-pending
/// targets have none; the planner rejects them before steps matter.
async fn pinned_steps(
    conn: &mut SqliteConnection,
    projection: &StatusProjection,
) -> Result<Vec<FlowStep>, AttemptError> {
    let (Some(flow_id), Some(version)) = (&projection.flow_id, projection.flow_version) else {
        return Ok(Vec::new());
    };

    Ok(fetch_steps(conn, flow_id, version)
        .await?
        .ok_or_else(|| ApprovalError::FlowVersionNotFound { flow_id: flow_id.clone(), version })?)
}

/// Appends the entry and swaps the projection. A lost compare-and-set leaves
/// the caller's transaction to roll back on drop.
async fn persist(
    conn: &mut SqliteConnection,
    adapter: &dyn TargetAdapter,
    target: &TargetRef,
    outcome: &TransitionOutcome,
) -> Result<(), AttemptError> {
    append_entry(conn, &outcome.entry).await?;

    match adapter.write_status(conn, &target.target_id, outcome.from.revision, &outcome.to).await? {
        WriteOutcome::Applied => Ok(()),
        WriteOutcome::Conflict => Err(AttemptError::Conflict { observed_step: None }),
    }
}

fn log_accepted(outcome: &TransitionOutcome, retries: u32) {
    let entry = &outcome.entry;
    let event_name = match (entry.action, outcome.advanced) {
        (ApprovalAction::Request, _) => "approval.request.accepted",
        (ApprovalAction::Approve, true) => "approval.approve.advanced",
        (ApprovalAction::Approve, false) => "approval.approve.recorded",
        (ApprovalAction::Reject, _) => "approval.reject.accepted",
    };

    tracing::info!(
        event_name,
        target_type = %entry.target_type,
        target_id = %entry.target_id,
        flow_id = %entry.flow_id,
        flow_version = entry.flow_version,
        step = entry.step,
        actor_id = %entry.actor_id,
        status = %outcome.to.status,
        retries,
        "approval action accepted"
    );
}
