//! Two-Phase Optimistic Commands
//!
//! A caller holding a local copy of state (a cached `AuditView`, say) applies
//! a change immediately, then commits it remotely. If the remote call fails
//! the local copy is restored to the snapshot taken before the change.

use std::future::Future;

use uuid::Uuid;

use crate::engine::AuditEngine;
use crate::error::{AuditError, NotFound};
use crate::progress::{stored_notes, ProgressUpdate};
use crate::state::AuditView;

/// A locally applied change awaiting remote confirmation
pub struct Optimistic<'a, S: Clone> {
    state: &'a mut S,
    prior: S,
}

impl<'a, S: Clone> Optimistic<'a, S> {
    /// Snapshot `state`, then apply `change` to it
    pub fn apply(state: &'a mut S, change: impl FnOnce(&mut S)) -> Self {
        let prior = state.clone();
        change(state);
        Self { state, prior }
    }

    /// State as it looks with the change applied
    pub fn state(&self) -> &S {
        self.state
    }

    /// Run the remote half. On failure the local state is rolled back.
    pub async fn commit<T, E, Fut>(self, remote: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        match remote.await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    /// Restore the snapshot without committing
    pub fn rollback(self) {
        *self.state = self.prior;
    }
}

/// Local approximation of a progress update on a cached view
fn preview(view: &mut AuditView, step_id: Uuid, update: &ProgressUpdate, output_starts_work: bool) {
    let Some(step) = view.step_mut(step_id).map(|s| &mut s.step) else {
        return;
    };

    if let Some(status) = update.target_status(step.status, output_starts_work) {
        step.status = status;
    }
    if let Some(notes) = &update.notes {
        step.notes = stored_notes(notes);
    }
    if let Some(output) = &update.output {
        step.output = Some(output.clone());
    }
}

/// Apply a progress update to `view` immediately, then persist it.
///
/// On success `view` is replaced with the committed aggregate; on failure it
/// is restored to what it was before the call.
pub async fn optimistic_save_progress(
    view: &mut AuditView,
    engine: &AuditEngine,
    step_id: Uuid,
    update: ProgressUpdate,
) -> Result<(), AuditError> {
    if view.steps.iter().all(|s| s.step.step_id != step_id) {
        return Err(NotFound::StepInAudit {
            audit_id: view.header.audit_id,
            step_id,
        }
        .into());
    }

    let output_starts_work = engine.config().output_starts_work;
    let pending = Optimistic::apply(view, |v| preview(v, step_id, &update, output_starts_work));
    let committed = pending.commit(engine.save_progress(step_id, update)).await?;
    *view = committed;
    Ok(())
}
