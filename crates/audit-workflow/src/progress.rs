//! Step Progress Tracker
//!
//! Per-step mutable state: status, notes and free-form output. Nothing here
//! moves the current-step pointer; that belongs to `advance`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AuditError, NotFound, ValidationErrors};
use crate::state::{AuditAggregate, AuditEventKind, StepStatus};

/// Requested change to one step. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub status: Option<StepStatus>,
    pub notes: Option<String>,
    pub output: Option<Value>,
}

impl ProgressUpdate {
    pub fn status(status: StepStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Status this update moves a step at `current` to, if any.
    ///
    /// An explicit status wins. Otherwise non-blank notes, or output when
    /// `output_starts_work` is set, start a not-started step.
    pub fn target_status(&self, current: StepStatus, output_starts_work: bool) -> Option<StepStatus> {
        if self.status.is_some() {
            return self.status;
        }
        let has_notes = self.notes.as_deref().is_some_and(|n| !n.trim().is_empty());
        let starts = has_notes || (output_starts_work && self.output.is_some());
        (current == StepStatus::NotStarted && starts).then_some(StepStatus::InProgress)
    }
}

/// Blank notes clear the field
pub(crate) fn stored_notes(notes: &str) -> Option<String> {
    if notes.trim().is_empty() {
        None
    } else {
        Some(notes.to_string())
    }
}

fn step_not_found(aggregate: &AuditAggregate, step_id: Uuid) -> AuditError {
    NotFound::StepInAudit {
        audit_id: aggregate.audit_id(),
        step_id,
    }
    .into()
}

/// Set a step's status, maintaining `completed_at` and history.
/// Returns false when the step already had that status.
pub(crate) fn set_status(
    aggregate: &mut AuditAggregate,
    step_id: Uuid,
    to: StepStatus,
) -> Result<bool, AuditError> {
    let now = Utc::now();
    let audit_id = aggregate.audit_id();
    let from = {
        let step = aggregate
            .step_mut(step_id)
            .ok_or(NotFound::StepInAudit { audit_id, step_id })?;
        let from = step.status;
        if from == to {
            return Ok(false);
        }
        step.status = to;
        step.completed_at = if to.is_done() { Some(now) } else { None };
        step.updated_at = now;
        from
    };
    aggregate.record(AuditEventKind::StatusChanged { step_id, from, to });
    Ok(true)
}

/// Apply a progress update to one step of the aggregate.
pub(crate) fn apply(
    aggregate: &mut AuditAggregate,
    step_id: Uuid,
    update: &ProgressUpdate,
    output_starts_work: bool,
) -> Result<(), AuditError> {
    let current = aggregate
        .step(step_id)
        .map(|s| s.status)
        .ok_or_else(|| step_not_found(aggregate, step_id))?;

    if let Some(requested) = update.status {
        if current.is_done() && !requested.is_done() {
            return Err(ValidationErrors::single(
                "status",
                format!(
                    "cannot move a done step back to {}; reopen it instead",
                    requested
                ),
            )
            .into());
        }
    }

    let target = update.target_status(current, output_starts_work);

    if let Some(step) = aggregate.step_mut(step_id) {
        if let Some(notes) = &update.notes {
            step.notes = stored_notes(notes);
        }
        if let Some(output) = &update.output {
            step.output = Some(output.clone());
        }
        step.updated_at = Utc::now();
    }

    if let Some(to) = target {
        set_status(aggregate, step_id, to)?;
    }
    Ok(())
}

/// Mark a step done without touching the pointer
pub(crate) fn mark_done(aggregate: &mut AuditAggregate, step_id: Uuid) -> Result<bool, AuditError> {
    if aggregate.step(step_id).is_none() {
        return Err(step_not_found(aggregate, step_id));
    }
    set_status(aggregate, step_id, StepStatus::Done)
}

/// Move a done step back to in progress. Other statuses are left as they are.
pub(crate) fn reopen(aggregate: &mut AuditAggregate, step_id: Uuid) -> Result<bool, AuditError> {
    let status = aggregate
        .step(step_id)
        .map(|s| s.status)
        .ok_or_else(|| step_not_found(aggregate, step_id))?;
    if !status.is_done() {
        return Ok(false);
    }
    set_status(aggregate, step_id, StepStatus::InProgress)
}
