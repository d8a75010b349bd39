use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::approvals::RoleDirectory;
use crate::domain::flow::{step_at, ApprovalFlow, FlowStep};
use crate::domain::history::{ApprovalAction, HistoryEntry, HistoryEntryId};
use crate::domain::target::{ApprovalStatus, StatusProjection, TargetRef};
use crate::errors::ApprovalError;
use crate::flows::status::{approvers_at, derive_status};

/// Which step an approval is aimed at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepPin {
    /// Whatever step the projection currently points at.
    Current,
    /// Caller asserts the step; anything else is stale.
    Expected(u32),
    /// Step observed by an earlier attempt of the same action. If the target
    /// has since moved past it the approval is still recorded, without advancing.
    Observed(u32),
}

/// Everything the planner needs to know about a target at decision time.
#[derive(Clone, Copy, Debug)]
pub struct TargetState<'a> {
    pub target: &'a TargetRef,
    pub projection: &'a StatusProjection,
    /// Steps of the flow version the projection is pinned to.
    pub steps: &'a [FlowStep],
    /// Full ledger for the target, in order.
    pub history: &'a [HistoryEntry],
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: StatusProjection,
    pub to: StatusProjection,
    pub entry: HistoryEntry,
    /// True when the step moved or the cycle reached a terminal status.
    pub advanced: bool,
}

/// Decides every status transition. Each plan appends the candidate entry to the
/// ledger view and re-derives, so the ledger and the projection cannot disagree.
pub struct TransitionPlanner<R> {
    roles: R,
}

impl<R> TransitionPlanner<R>
where
    R: RoleDirectory,
{
    pub fn new(roles: R) -> Self {
        Self { roles }
    }

    pub fn roles(&self) -> &R {
        &self.roles
    }

    pub fn plan_request(
        &self,
        flow: &ApprovalFlow,
        target: &TargetRef,
        projection: &StatusProjection,
        requested_by: &str,
        comment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, ApprovalError> {
        if flow.target_type != target.target_type {
            return Err(ApprovalError::TargetTypeMismatch {
                flow_id: flow.id.clone(),
                flow_target_type: flow.target_type,
                target_type: target.target_type,
            });
        }

        match projection.status {
            ApprovalStatus::Draft | ApprovalStatus::Rejected => {}
            ApprovalStatus::Pending => {
                return Err(match &projection.flow_id {
                    Some(flow_id) if *flow_id != flow.id => ApprovalError::PendingUnderFlow {
                        target: target.to_string(),
                        flow_id: flow_id.clone(),
                    },
                    _ => invalid_transition(target, projection, ApprovalAction::Request),
                });
            }
            ApprovalStatus::Approved => {
                return Err(invalid_transition(target, projection, ApprovalAction::Request));
            }
        }

        if !flow.is_active {
            return Err(ApprovalError::FlowInactive(flow.id.clone()));
        }

        let entry = HistoryEntry {
            id: HistoryEntryId::generate(),
            flow_id: flow.id.clone(),
            flow_version: flow.version,
            target_type: target.target_type,
            target_id: target.target_id.clone(),
            step: 1,
            action: ApprovalAction::Request,
            comment: clean_comment(comment),
            actor_id: requested_by.trim().to_owned(),
            created_at: now,
        };
        let derived = derive_status(&flow.steps, std::slice::from_ref(&entry));

        let to = StatusProjection {
            flow_id: Some(flow.id.clone()),
            flow_version: Some(flow.version),
            status: derived.status,
            current_step: derived.current_step,
            revision: projection.revision + 1,
        };

        Ok(TransitionOutcome { from: projection.clone(), to, entry, advanced: false })
    }

    pub fn plan_approve(
        &self,
        state: TargetState<'_>,
        actor_id: &str,
        comment: Option<&str>,
        pin: StepPin,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, ApprovalError> {
        let step = match (state.projection.status, pin) {
            (ApprovalStatus::Approved, StepPin::Observed(observed)) => {
                settled_step(&state, observed)?
            }
            _ => {
                let current = pending_step(&state, ApprovalAction::Approve)?;
                match pin {
                    StepPin::Current => current,
                    StepPin::Expected(submitted) if submitted != current => {
                        return Err(ApprovalError::StaleStep { submitted, current });
                    }
                    StepPin::Expected(submitted) => submitted,
                    StepPin::Observed(observed) if observed > current => {
                        return Err(ApprovalError::StaleStep { submitted: observed, current });
                    }
                    StepPin::Observed(observed) => observed,
                }
            }
        };

        let actor_id = actor_id.trim();
        self.authorize(&state, step, actor_id)?;

        if approvers_at(state.history, step).contains(actor_id) {
            return Err(ApprovalError::AlreadyActed { actor_id: actor_id.to_owned(), step });
        }

        let entry = cycle_entry(&state, step, ApprovalAction::Approve, actor_id, comment, now)?;
        Ok(settle(&state, entry))
    }

    pub fn plan_reject(
        &self,
        state: TargetState<'_>,
        actor_id: &str,
        comment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, ApprovalError> {
        let current = pending_step(&state, ApprovalAction::Reject)?;
        let actor_id = actor_id.trim();
        self.authorize(&state, current, actor_id)?;

        let entry = cycle_entry(&state, current, ApprovalAction::Reject, actor_id, comment, now)?;
        Ok(settle(&state, entry))
    }

    fn authorize(
        &self,
        state: &TargetState<'_>,
        step: u32,
        actor_id: &str,
    ) -> Result<(), ApprovalError> {
        let Some(flow_step) = step_at(state.steps, step) else {
            return Err(ApprovalError::ProjectionDrift { target: state.target.to_string() });
        };

        let allowed = self
            .roles
            .has_role(actor_id, &flow_step.approver_role_id)
            .map_err(|reason| ApprovalError::RoleLookup { actor_id: actor_id.to_owned(), reason })?;

        if allowed {
            Ok(())
        } else {
            Err(ApprovalError::NotAuthorized {
                actor_id: actor_id.to_owned(),
                role_id: flow_step.approver_role_id.clone(),
                step,
            })
        }
    }
}

/// Returns the current step of a pending target whose projection still agrees
/// with its ledger.
fn pending_step(state: &TargetState<'_>, action: ApprovalAction) -> Result<u32, ApprovalError> {
    let projection = state.projection;
    if projection.status != ApprovalStatus::Pending {
        return Err(invalid_transition(state.target, projection, action));
    }

    if derive_status(state.steps, state.history) != projection.derived() {
        return Err(ApprovalError::ProjectionDrift { target: state.target.to_string() });
    }

    projection
        .current_step
        .ok_or_else(|| ApprovalError::ProjectionDrift { target: state.target.to_string() })
}

/// Step for an approval that lost its race to the one completing the cycle.
/// The entry is still recorded against the step it was aimed at; the status
/// stays approved.
fn settled_step(state: &TargetState<'_>, observed: u32) -> Result<u32, ApprovalError> {
    if derive_status(state.steps, state.history) != state.projection.derived() {
        return Err(ApprovalError::ProjectionDrift { target: state.target.to_string() });
    }
    if step_at(state.steps, observed).is_none() {
        return Err(invalid_transition(state.target, state.projection, ApprovalAction::Approve));
    }
    Ok(observed)
}

fn cycle_entry(
    state: &TargetState<'_>,
    step: u32,
    action: ApprovalAction,
    actor_id: &str,
    comment: Option<&str>,
    now: DateTime<Utc>,
) -> Result<HistoryEntry, ApprovalError> {
    let projection = state.projection;
    let (Some(flow_id), Some(flow_version)) = (&projection.flow_id, projection.flow_version) else {
        return Err(ApprovalError::ProjectionDrift { target: state.target.to_string() });
    };

    Ok(HistoryEntry {
        id: HistoryEntryId::generate(),
        flow_id: flow_id.clone(),
        flow_version,
        target_type: state.target.target_type,
        target_id: state.target.target_id.clone(),
        step,
        action,
        comment: clean_comment(comment),
        actor_id: actor_id.to_owned(),
        created_at: now,
    })
}

fn settle(state: &TargetState<'_>, entry: HistoryEntry) -> TransitionOutcome {
    let mut ledger = state.history.to_vec();
    ledger.push(entry.clone());
    let derived = derive_status(state.steps, &ledger);

    let from = state.projection.clone();
    let to = StatusProjection {
        flow_id: from.flow_id.clone(),
        flow_version: from.flow_version,
        status: derived.status,
        current_step: derived.current_step,
        revision: from.revision + 1,
    };
    let advanced = to.derived() != from.derived();

    TransitionOutcome { from, to, entry, advanced }
}

fn invalid_transition(
    target: &TargetRef,
    projection: &StatusProjection,
    action: ApprovalAction,
) -> ApprovalError {
    ApprovalError::InvalidTransition { target: target.to_string(), status: projection.status, action }
}

fn clean_comment(comment: Option<&str>) -> Option<String> {
    comment.map(str::trim).filter(|value| !value.is_empty()).map(str::to_owned)
}
