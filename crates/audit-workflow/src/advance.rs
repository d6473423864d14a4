//! Advancement Engine
//!
//! Owns the current-step pointer. `advance` completes a step and scans
//! forward; it never moves the pointer to a lower `seq`. `advance_to` jumps
//! anywhere without touching statuses.

use uuid::Uuid;

use crate::error::{AuditError, NotFound, ValidationErrors};
use crate::progress;
use crate::state::{AuditAggregate, AuditEventKind, StepStatus};

/// Where the pointer ended up after a move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerMove {
    /// Pointer moved to this step
    Moved(Uuid),
    /// No not-done step remains after the completed one
    Closed,
    /// Pointer left where it was
    Unchanged,
}

fn ensure_member(aggregate: &AuditAggregate, step_id: Uuid) -> Result<u32, AuditError> {
    aggregate.step(step_id).map(|s| s.seq).ok_or_else(|| {
        NotFound::StepInAudit {
            audit_id: aggregate.audit_id(),
            step_id,
        }
        .into()
    })
}

/// Lowest-seq not-done step strictly after `seq`
pub fn next_open_after(aggregate: &AuditAggregate, seq: u32) -> Option<Uuid> {
    aggregate
        .steps
        .iter()
        .filter(|s| s.seq > seq && s.status != StepStatus::Done)
        .min_by_key(|s| s.seq)
        .map(|s| s.step_id)
}

fn move_pointer(aggregate: &mut AuditAggregate, to: Option<Uuid>, forced: bool) {
    let from = aggregate.audit.current_step_id;
    if from == to {
        return;
    }
    aggregate.audit.current_step_id = to;
    aggregate.record(AuditEventKind::PointerMoved { from, to, forced });
    if to.is_none() {
        aggregate.record(AuditEventKind::Closed);
    }
}

/// Complete `step_id` (default: the current step) and move forward.
pub(crate) fn advance(
    aggregate: &mut AuditAggregate,
    step_id: Option<Uuid>,
) -> Result<PointerMove, AuditError> {
    let target = match step_id.or(aggregate.audit.current_step_id) {
        Some(id) => id,
        None => {
            return Err(ValidationErrors::single(
                "step_id",
                "audit has no current step; pass the step to complete",
            )
            .into())
        }
    };
    let target_seq = ensure_member(aggregate, target)?;

    progress::set_status(aggregate, target, StepStatus::Done)?;

    let current_seq = match aggregate.current_step() {
        Some(step) => step.seq,
        // Already closed: stays closed
        None => return Ok(PointerMove::Unchanged),
    };
    if target_seq < current_seq {
        return Ok(PointerMove::Unchanged);
    }

    let next = next_open_after(aggregate, target_seq);
    move_pointer(aggregate, next, false);
    Ok(match next {
        Some(id) => PointerMove::Moved(id),
        None => PointerMove::Closed,
    })
}

/// Force the pointer to any step of the audit. Statuses are untouched.
pub(crate) fn advance_to(
    aggregate: &mut AuditAggregate,
    step_id: Uuid,
) -> Result<PointerMove, AuditError> {
    ensure_member(aggregate, step_id)?;
    if aggregate.audit.current_step_id == Some(step_id) {
        return Ok(PointerMove::Unchanged);
    }
    move_pointer(aggregate, Some(step_id), true);
    Ok(PointerMove::Moved(step_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Audit, AuditState, Gate, Step};
    use chrono::Utc;

    fn aggregate(gates: &[Gate]) -> AuditAggregate {
        let now = Utc::now();
        let audit_id = Uuid::new_v4();
        let mut aggregate = AuditAggregate::new(Audit {
            audit_id,
            engagement_id: Uuid::new_v4(),
            client_id: None,
            title: "Treasury audit".to_string(),
            domain: None,
            audit_type: None,
            owner_contact_id: None,
            notes: None,
            path_id: None,
            current_step_id: None,
            percent_complete: 0,
            state: AuditState::Pending,
            version: 1,
            started_at: None,
            created_at: now,
            updated_at: now,
        });
        for (i, gate) in gates.iter().enumerate() {
            aggregate.steps.push(Step {
                step_id: Uuid::new_v4(),
                audit_id,
                seq: i as u32 + 1,
                title: format!("Step {}", i + 1),
                gate: *gate,
                required: true,
                definition_of_done: Vec::new(),
                status: StepStatus::NotStarted,
                notes: None,
                output: None,
                updated_at: now,
                completed_at: None,
            });
        }
        aggregate.audit.current_step_id = aggregate.steps.first().map(|s| s.step_id);
        aggregate
    }

    fn ids(agg: &AuditAggregate) -> Vec<Uuid> {
        agg.steps.iter().map(|s| s.step_id).collect()
    }

    #[test]
    fn test_advance_current_moves_to_next_open() {
        let mut agg = aggregate(&[Gate::Discovery, Gate::Analysis, Gate::Roadmap]);
        let ids = ids(&agg);

        assert_eq!(advance(&mut agg, None).unwrap(), PointerMove::Moved(ids[1]));
        assert_eq!(agg.steps[0].status, StepStatus::Done);
        assert_eq!(agg.audit.current_step_id, Some(ids[1]));
    }

    #[test]
    fn test_advance_skips_done_steps() {
        let mut agg = aggregate(&[Gate::Discovery, Gate::Analysis, Gate::Roadmap]);
        let ids = ids(&agg);
        agg.steps[1].status = StepStatus::Done;

        assert_eq!(advance(&mut agg, None).unwrap(), PointerMove::Moved(ids[2]));
    }

    #[test]
    fn test_advance_last_closes_even_with_earlier_open_steps() {
        let mut agg = aggregate(&[Gate::Discovery, Gate::Analysis, Gate::Roadmap]);
        let ids = ids(&agg);
        advance_to(&mut agg, ids[2]).unwrap();

        assert_eq!(advance(&mut agg, None).unwrap(), PointerMove::Closed);
        assert!(agg.audit.current_step_id.is_none());
        assert!(agg.is_closed());
        assert!(!agg.is_fully_complete());
        assert_eq!(agg.steps[1].status, StepStatus::NotStarted);
        assert!(matches!(
            agg.history.last().map(|e| &e.kind),
            Some(AuditEventKind::Closed)
        ));
    }

    #[test]
    fn test_completing_step_behind_pointer_leaves_pointer() {
        let mut agg = aggregate(&[Gate::Discovery, Gate::Analysis, Gate::Roadmap]);
        let ids = ids(&agg);
        advance_to(&mut agg, ids[2]).unwrap();

        assert_eq!(
            advance(&mut agg, Some(ids[0])).unwrap(),
            PointerMove::Unchanged
        );
        assert_eq!(agg.steps[0].status, StepStatus::Done);
        assert_eq!(agg.audit.current_step_id, Some(ids[2]));
    }

    #[test]
    fn test_advance_on_closed_audit_keeps_it_closed() {
        let mut agg = aggregate(&[Gate::Discovery, Gate::Analysis]);
        let ids = ids(&agg);
        advance_to(&mut agg, ids[1]).unwrap();
        advance(&mut agg, None).unwrap();

        assert_eq!(
            advance(&mut agg, Some(ids[0])).unwrap(),
            PointerMove::Unchanged
        );
        assert!(agg.audit.current_step_id.is_none());
        assert!(agg.is_fully_complete());
    }

    #[test]
    fn test_advance_without_current_requires_step_id() {
        let mut agg = aggregate(&[Gate::Discovery]);
        advance(&mut agg, None).unwrap();

        let err = advance(&mut agg, None).unwrap_err();
        assert!(err.validation().and_then(|v| v.field("step_id")).is_some());
    }

    #[test]
    fn test_foreign_step_is_not_found() {
        let mut agg = aggregate(&[Gate::Discovery]);
        assert!(advance(&mut agg, Some(Uuid::new_v4()))
            .unwrap_err()
            .is_not_found());
        assert!(advance_to(&mut agg, Uuid::new_v4())
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_advance_to_keeps_statuses() {
        let mut agg = aggregate(&[Gate::Discovery, Gate::Analysis, Gate::Roadmap]);
        let ids = ids(&agg);
        advance_to(&mut agg, ids[2]).unwrap();
        advance_to(&mut agg, ids[0]).unwrap();

        assert!(agg.steps.iter().all(|s| s.status == StepStatus::NotStarted));
        assert_eq!(agg.audit.current_step_id, Some(ids[0]));
        assert_eq!(advance_to(&mut agg, ids[0]).unwrap(), PointerMove::Unchanged);
    }
}
