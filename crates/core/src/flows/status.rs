use std::collections::BTreeSet;

use crate::domain::flow::{step_at, FlowStep};
use crate::domain::history::{ApprovalAction, HistoryEntry};
use crate::domain::target::DerivedStatus;

/// Entries from the most recent `request` onward, or `None` if the target was
/// never submitted. `history` must be in ledger order.
pub fn current_cycle(history: &[HistoryEntry]) -> Option<&[HistoryEntry]> {
    let start = history.iter().rposition(|entry| entry.action == ApprovalAction::Request)?;
    Some(&history[start..])
}

/// Recomputes status from the ledger.
///
/// Only the current cycle counts. A rejection anywhere in it is terminal.
/// Otherwise approvals are matched to the running step and a step advances once
/// it has `required_approval_count` distinct approvers; approvals recorded
/// against any other step are kept for audit but never move the counter.
pub fn derive_status(steps: &[FlowStep], history: &[HistoryEntry]) -> DerivedStatus {
    let Some(cycle) = current_cycle(history) else {
        return DerivedStatus::DRAFT;
    };

    if cycle.iter().any(|entry| entry.action == ApprovalAction::Reject) {
        return DerivedStatus::REJECTED;
    }

    let mut current = 1u32;
    let mut approvers = BTreeSet::new();
    for entry in cycle.iter().filter(|entry| entry.action == ApprovalAction::Approve) {
        let Some(step) = step_at(steps, current) else {
            break;
        };
        if entry.step != current {
            continue;
        }

        approvers.insert(entry.actor_id.as_str());
        if approvers.len() as u64 >= u64::from(step.required_approval_count) {
            current += 1;
            approvers.clear();
        }
    }

    if step_at(steps, current).is_none() {
        DerivedStatus::APPROVED
    } else {
        DerivedStatus::pending(current)
    }
}

/// Distinct actors who approved `step` in the current cycle.
pub fn approvers_at(history: &[HistoryEntry], step: u32) -> BTreeSet<&str> {
    current_cycle(history)
        .unwrap_or_default()
        .iter()
        .filter(|entry| entry.action == ApprovalAction::Approve && entry.step == step)
        .map(|entry| entry.actor_id.as_str())
        .collect()
}
