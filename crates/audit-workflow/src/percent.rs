//! Percent Completion
//!
//! `percent = round(100 * done / total)`, or 0 for an empty step set.

use crate::state::{AuditAggregate, Step};

/// Completion percentage for a set of steps (half rounds up)
pub fn percent_complete(steps: &[Step]) -> u8 {
    let total = steps.len();
    if total == 0 {
        return 0;
    }
    let done = steps.iter().filter(|s| s.status.is_done()).count();
    ((200 * done + total) / (2 * total)) as u8
}

/// Recompute percent and state on the aggregate. Returns true if either drifted.
pub fn refresh(aggregate: &mut AuditAggregate) -> bool {
    let percent = percent_complete(&aggregate.steps);
    let state = aggregate.derive_state();
    let changed = aggregate.audit.percent_complete != percent || aggregate.audit.state != state;
    aggregate.audit.percent_complete = percent;
    aggregate.audit.state = state;
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Gate, StepStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn steps_with(statuses: &[StepStatus]) -> Vec<Step> {
        let audit_id = Uuid::new_v4();
        statuses
            .iter()
            .enumerate()
            .map(|(i, status)| Step {
                step_id: Uuid::new_v4(),
                audit_id,
                seq: i as u32 + 1,
                title: format!("Step {}", i + 1),
                gate: Gate::Discovery,
                required: true,
                definition_of_done: Vec::new(),
                status: *status,
                notes: None,
                output: None,
                updated_at: Utc::now(),
                completed_at: None,
            })
            .collect()
    }

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(percent_complete(&[]), 0);
    }

    #[test]
    fn test_quarters() {
        use StepStatus::*;
        assert_eq!(percent_complete(&steps_with(&[Done, NotStarted, NotStarted, NotStarted])), 25);
        assert_eq!(percent_complete(&steps_with(&[Done, InProgress, Done, NotStarted])), 50);
        assert_eq!(percent_complete(&steps_with(&[Done, Done, Done, Done])), 100);
    }

    #[test]
    fn test_rounding() {
        use StepStatus::*;
        // 1/3 = 33.3 -> 33, 2/3 = 66.7 -> 67, 1/8 = 12.5 -> 13
        assert_eq!(percent_complete(&steps_with(&[Done, NotStarted, NotStarted])), 33);
        assert_eq!(percent_complete(&steps_with(&[Done, Done, NotStarted])), 67);
        let mut eight = vec![NotStarted; 8];
        eight[0] = Done;
        assert_eq!(percent_complete(&steps_with(&eight)), 13);
    }

    #[test]
    fn test_in_progress_does_not_count() {
        use StepStatus::*;
        assert_eq!(percent_complete(&steps_with(&[InProgress, InProgress])), 0);
    }
}
