//! Audit Instance Manager
//!
//! Top-level orchestrator. Every mutating operation follows the same shape:
//! load the aggregate, change a private copy, recompute percent and state,
//! then write it back with one version-checked save. A failure at any point
//! leaves the stored aggregate exactly as it was.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::advance;
use crate::config::EngineConfig;
use crate::error::{AuditError, NotFound, StoreError, ValidationErrors};
use crate::ids::{IdAllocator, UuidAllocator};
use crate::percent;
use crate::progress::{self, ProgressUpdate};
use crate::retry::{Attempt, RetryOutcome};
use crate::state::{Audit, AuditAggregate, AuditEventKind, AuditState, AuditView, Step, StepStatus};
use crate::store::{AuditStore, MemoryAuditStore};
use crate::template::{MemoryTemplateStore, Template, TemplateCatalog, TemplateStore};

const TITLE_MIN: usize = 3;
const TITLE_MAX: usize = 200;

/// Input for `create_audit`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateAudit {
    pub title: String,
    pub engagement_id: Uuid,
    #[serde(default)]
    pub client_id: Option<Uuid>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub audit_type: Option<String>,
    #[serde(default)]
    pub owner_contact_id: Option<Uuid>,
    #[serde(default)]
    pub path_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl CreateAudit {
    pub fn new(title: impl Into<String>, engagement_id: Uuid) -> Self {
        Self {
            title: title.into(),
            engagement_id,
            ..Self::default()
        }
    }

    pub fn with_path(mut self, path_id: impl Into<String>) -> Self {
        self.path_id = Some(path_id.into());
        self
    }

    /// All failing fields are reported together
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        let title_len = self.title.trim().chars().count();
        if title_len < TITLE_MIN {
            errors.add(
                "title",
                format!("must be at least {} characters", TITLE_MIN),
            );
        } else if title_len > TITLE_MAX {
            errors.add("title", format!("must be at most {} characters", TITLE_MAX));
        }

        if self.engagement_id.is_nil() {
            errors.add("engagement_id", "is required");
        }

        if let Some(path_id) = &self.path_id {
            if path_id.trim().is_empty() {
                errors.add("path_id", "must not be blank when given");
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Result of `set_path`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SetPathOutcome {
    Seeded { step_count: usize },
    /// Steps already existed; nothing changed
    AlreadySeeded,
}

/// Result of `self_heal_path`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SelfHealOutcome {
    Healed {
        result: SetPathOutcome,
        attempts: usize,
    },
    /// Retries ran out; the audit records `path_id` but has no steps and
    /// needs manual remediation
    Unresolved {
        attempts: usize,
        last_error: Option<String>,
    },
}

/// The audit workflow engine
pub struct AuditEngine {
    templates: Arc<dyn TemplateStore>,
    audits: Arc<dyn AuditStore>,
    ids: Arc<dyn IdAllocator>,
    config: EngineConfig,
}

impl AuditEngine {
    pub fn new(
        templates: Arc<dyn TemplateStore>,
        audits: Arc<dyn AuditStore>,
        ids: Arc<dyn IdAllocator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            templates,
            audits,
            ids,
            config,
        }
    }

    /// Engine over fresh in-memory stores with UUID v7 ids
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(
            Arc::new(MemoryTemplateStore::new()),
            Arc::new(MemoryAuditStore::new()),
            Arc::new(UuidAllocator),
            config,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Catalog sharing this engine's stores and id allocator
    pub fn catalog(&self) -> TemplateCatalog {
        TemplateCatalog::new(
            self.templates.clone(),
            self.audits.clone(),
            self.ids.clone(),
        )
        .with_visibility_policy(self.config.template_poll_policy())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Header and ordered steps from one committed version
    pub async fn get_audit(&self, audit_id: Uuid) -> Result<AuditView, AuditError> {
        Ok(self.load(audit_id).await?.to_view())
    }

    async fn load(&self, audit_id: Uuid) -> Result<AuditAggregate, AuditError> {
        self.audits
            .load(audit_id)
            .await?
            .ok_or_else(|| NotFound::Audit(audit_id).into())
    }

    async fn template(&self, path_id: &str) -> Result<Template, AuditError> {
        self.templates
            .get(path_id)
            .await?
            .ok_or_else(|| NotFound::Template(path_id.to_string()).into())
    }

    async fn resolve_step(&self, step_id: Uuid) -> Result<Uuid, AuditError> {
        self.audits
            .audit_id_for_step(step_id)
            .await?
            .ok_or_else(|| NotFound::Step(step_id).into())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Version-checked save of a loaded aggregate
    async fn commit(&self, aggregate: &mut AuditAggregate) -> Result<AuditView, AuditError> {
        let expected = aggregate.audit.version;
        let version = self
            .audits
            .save(aggregate, Some(expected))
            .await
            .map_err(|e| match e {
                StoreError::VersionMismatch { audit_id, .. } => AuditError::ConcurrentConflict {
                    audit_id,
                    expected_version: expected,
                },
                other => AuditError::Store(other),
            })?;
        aggregate.audit.version = version;
        Ok(aggregate.to_view())
    }

    /// Load, apply `change`, refresh derived fields, save
    async fn mutate<R, F>(&self, audit_id: Uuid, change: F) -> Result<(AuditView, R), AuditError>
    where
        F: FnOnce(&mut AuditAggregate) -> Result<R, AuditError>,
    {
        let mut aggregate = self.load(audit_id).await?;
        let result = change(&mut aggregate)?;
        percent::refresh(&mut aggregate);
        let view = self.commit(&mut aggregate).await?;
        Ok((view, result))
    }

    fn seed(&self, aggregate: &mut AuditAggregate, template: &Template) -> usize {
        let audit_id = aggregate.audit_id();
        let now = Utc::now();

        let mut definitions: Vec<_> = template.steps.iter().collect();
        definitions.sort_by_key(|d| d.seq);

        aggregate.steps = definitions
            .into_iter()
            .map(|def| Step {
                step_id: self.ids.next_id(),
                audit_id,
                seq: def.seq,
                title: def.title.clone(),
                gate: def.gate,
                required: def.required,
                definition_of_done: def.definition_of_done.clone(),
                status: StepStatus::NotStarted,
                notes: None,
                output: None,
                updated_at: now,
                completed_at: None,
            })
            .collect();

        aggregate.audit.path_id = Some(template.path_id.clone());
        aggregate.audit.current_step_id = aggregate.steps.first().map(|s| s.step_id);
        let step_count = aggregate.steps.len();
        aggregate.record(AuditEventKind::Seeded {
            path_id: template.path_id.clone(),
            step_count,
        });
        step_count
    }

    /// Create an audit, seeding steps in the same save when `path_id` is given
    #[instrument(skip_all, fields(path_id = ?request.path_id))]
    pub async fn create_audit(&self, request: CreateAudit) -> Result<AuditView, AuditError> {
        request.validate()?;

        let template = match request.path_id.as_deref() {
            Some(path_id) => Some(self.template(path_id.trim()).await?),
            None => None,
        };

        let now = Utc::now();
        let mut aggregate = AuditAggregate::new(Audit {
            audit_id: self.ids.next_id(),
            engagement_id: request.engagement_id,
            client_id: request.client_id,
            title: request.title.trim().to_string(),
            domain: request.domain,
            audit_type: request.audit_type,
            owner_contact_id: request.owner_contact_id,
            notes: request.notes,
            path_id: None,
            current_step_id: None,
            percent_complete: 0,
            state: AuditState::Pending,
            version: 0,
            started_at: request.started_at,
            created_at: now,
            updated_at: now,
        });

        if let Some(template) = &template {
            self.seed(&mut aggregate, template);
        }
        percent::refresh(&mut aggregate);

        let version = self.audits.save(&aggregate, None).await?;
        aggregate.audit.version = version;

        info!(
            audit_id = %aggregate.audit_id(),
            steps = aggregate.steps.len(),
            state = %aggregate.audit.state,
            "Created audit"
        );
        Ok(aggregate.to_view())
    }

    /// Assign a template and seed steps. A no-op when steps already exist.
    #[instrument(skip_all, fields(%audit_id, %path_id))]
    pub async fn set_path(
        &self,
        audit_id: Uuid,
        path_id: &str,
    ) -> Result<SetPathOutcome, AuditError> {
        if path_id.trim().is_empty() {
            return Err(ValidationErrors::single("path_id", "is required").into());
        }

        let mut aggregate = self.load(audit_id).await?;
        if aggregate.has_steps() {
            debug!("Audit already seeded");
            return Ok(SetPathOutcome::AlreadySeeded);
        }

        let template = self.template(path_id.trim()).await?;
        let step_count = self.seed(&mut aggregate, &template);
        percent::refresh(&mut aggregate);
        self.commit(&mut aggregate).await?;

        info!(step_count, "Seeded audit from template");
        Ok(SetPathOutcome::Seeded { step_count })
    }

    /// `set_path` under the configured self-heal schedule.
    ///
    /// Not-found and validation failures surface immediately. When the
    /// schedule runs out the audit is left recording `path_id` with no steps.
    pub async fn self_heal_path(
        &self,
        audit_id: Uuid,
        path_id: &str,
    ) -> Result<SelfHealOutcome, AuditError> {
        let policy = self.config.self_heal_policy();
        let outcome = policy
            .run(|_| async move {
                match self.set_path(audit_id, path_id).await {
                    Ok(result) => Attempt::Done(result),
                    Err(e) if e.is_retriable() => Attempt::Retry(e),
                    Err(e) => Attempt::Abort(e),
                }
            })
            .await;

        match outcome {
            RetryOutcome::Done { value, attempts } => {
                info!(%audit_id, attempts, "Self-heal seeding succeeded");
                Ok(SelfHealOutcome::Healed {
                    result: value,
                    attempts,
                })
            }
            RetryOutcome::Aborted { error, .. } => Err(error),
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                if let Err(e) = self.record_unseeded_path(audit_id, path_id).await {
                    warn!(%audit_id, error = %e, "Could not record path on unresolved audit");
                }
                warn!(%audit_id, path_id, attempts, "Self-heal seeding unresolved");
                Ok(SelfHealOutcome::Unresolved {
                    attempts,
                    last_error: last_error.map(|e| e.to_string()),
                })
            }
        }
    }

    async fn record_unseeded_path(&self, audit_id: Uuid, path_id: &str) -> Result<(), AuditError> {
        let mut aggregate = self.load(audit_id).await?;
        if aggregate.has_steps() || aggregate.audit.path_id.as_deref() == Some(path_id) {
            return Ok(());
        }
        aggregate.audit.path_id = Some(path_id.to_string());
        aggregate.audit.updated_at = Utc::now();
        self.commit(&mut aggregate).await?;
        Ok(())
    }

    /// Complete a step (default: the current one) and move the pointer forward
    #[instrument(skip_all, fields(%audit_id))]
    pub async fn advance(
        &self,
        audit_id: Uuid,
        step_id: Option<Uuid>,
    ) -> Result<AuditView, AuditError> {
        let (view, moved) = self
            .mutate(audit_id, |aggregate| advance::advance(aggregate, step_id))
            .await?;
        debug!(?moved, percent = view.header.percent_complete, "Advanced audit");
        Ok(view)
    }

    /// Force the pointer to any step of the audit
    #[instrument(skip_all, fields(%audit_id, %step_id))]
    pub async fn advance_to(&self, audit_id: Uuid, step_id: Uuid) -> Result<AuditView, AuditError> {
        let (view, _) = self
            .mutate(audit_id, |aggregate| advance::advance_to(aggregate, step_id))
            .await?;
        Ok(view)
    }

    /// Update a step's status, notes or output. Never moves the pointer.
    pub async fn save_progress(
        &self,
        step_id: Uuid,
        update: ProgressUpdate,
    ) -> Result<AuditView, AuditError> {
        let audit_id = self.resolve_step(step_id).await?;
        let output_starts_work = self.config.output_starts_work;
        let (view, _) = self
            .mutate(audit_id, |aggregate| {
                progress::apply(aggregate, step_id, &update, output_starts_work)
            })
            .await?;
        Ok(view)
    }

    /// Mark a step done without moving the pointer
    pub async fn mark_done(&self, step_id: Uuid) -> Result<AuditView, AuditError> {
        let audit_id = self.resolve_step(step_id).await?;
        let (view, _) = self
            .mutate(audit_id, |aggregate| progress::mark_done(aggregate, step_id))
            .await?;
        Ok(view)
    }

    /// Move a done step back to in progress
    pub async fn reopen(&self, step_id: Uuid) -> Result<AuditView, AuditError> {
        let audit_id = self.resolve_step(step_id).await?;
        let (view, reopened) = self
            .mutate(audit_id, |aggregate| progress::reopen(aggregate, step_id))
            .await?;
        if reopened {
            info!(%audit_id, %step_id, "Reopened step");
        }
        Ok(view)
    }

    /// Recompute percent and state, persisting only on drift
    pub async fn recalc(&self, audit_id: Uuid) -> Result<u8, AuditError> {
        let mut aggregate = self.load(audit_id).await?;
        if percent::refresh(&mut aggregate) {
            warn!(%audit_id, percent = aggregate.audit.percent_complete, "Stored percent had drifted");
            aggregate.audit.updated_at = Utc::now();
            self.commit(&mut aggregate).await?;
        }
        Ok(aggregate.audit.percent_complete)
    }

    /// Delete an audit and all of its steps
    pub async fn delete_audit(&self, audit_id: Uuid) -> Result<(), AuditError> {
        if !self.audits.delete(audit_id).await? {
            return Err(NotFound::Audit(audit_id).into());
        }
        info!(%audit_id, "Deleted audit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ScopedIds;
    use crate::state::Gate;
    use crate::template::StepDefinition;

    fn config() -> EngineConfig {
        EngineConfig {
            self_heal_delays_ms: vec![0, 0, 0],
            template_poll_delays_ms: vec![0],
            output_starts_work: false,
        }
    }

    async fn engine_with_template(gates: &[Gate]) -> AuditEngine {
        let engine = AuditEngine::new(
            Arc::new(MemoryTemplateStore::new()),
            Arc::new(MemoryAuditStore::new()),
            Arc::new(ScopedIds::new(1)),
            config(),
        );
        let steps = gates
            .iter()
            .enumerate()
            .map(|(i, gate)| StepDefinition {
                seq: i as u32 + 1,
                title: format!("Step {}", i + 1),
                gate: *gate,
                required: true,
                definition_of_done: Vec::new(),
            })
            .collect();
        engine
            .catalog()
            .register(Template::draft("tpl", "Standard audit", steps))
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn test_create_reports_all_invalid_fields() {
        let engine = AuditEngine::in_memory(config());
        let err = engine
            .create_audit(CreateAudit::new("  a ", Uuid::nil()))
            .await
            .unwrap_err();
        let errors = err.validation().unwrap();
        assert!(errors.field("title").is_some());
        assert!(errors.field("engagement_id").is_some());
    }

    #[tokio::test]
    async fn test_create_title_bounds() {
        let engine = AuditEngine::in_memory(config());
        let too_long = "x".repeat(201);
        assert!(engine
            .create_audit(CreateAudit::new(too_long, Uuid::new_v4()))
            .await
            .unwrap_err()
            .is_validation());

        let view = engine
            .create_audit(CreateAudit::new("  Cash audit  ", Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(view.header.title, "Cash audit");
    }

    #[tokio::test]
    async fn test_pathless_audit_is_pending() {
        let engine = AuditEngine::in_memory(config());
        let view = engine
            .create_audit(CreateAudit::new("Cash audit", Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(view.header.state, AuditState::Pending);
        assert_eq!(view.header.percent_complete, 0);
        assert!(view.steps.is_empty());
        assert!(!view.is_closed);
    }

    #[tokio::test]
    async fn test_create_with_unknown_template_is_not_found() {
        let engine = AuditEngine::in_memory(config());
        let err = engine
            .create_audit(CreateAudit::new("Cash audit", Uuid::new_v4()).with_path("nope"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_set_path_is_idempotent() {
        let engine = engine_with_template(&[Gate::Discovery, Gate::Analysis]).await;
        let view = engine
            .create_audit(CreateAudit::new("Cash audit", Uuid::new_v4()))
            .await
            .unwrap();
        let id = view.header.audit_id;

        assert_eq!(
            engine.set_path(id, "tpl").await.unwrap(),
            SetPathOutcome::Seeded { step_count: 2 }
        );
        assert_eq!(
            engine.set_path(id, "tpl").await.unwrap(),
            SetPathOutcome::AlreadySeeded
        );

        let view = engine.get_audit(id).await.unwrap();
        assert_eq!(view.steps.len(), 2);
        assert_eq!(view.current().map(|s| s.step.seq), Some(1));
        assert_eq!(view.header.state, AuditState::Discovery);
    }

    #[tokio::test]
    async fn test_empty_template_seeds_nothing() {
        let engine = engine_with_template(&[]).await;
        let view = engine
            .create_audit(CreateAudit::new("Cash audit", Uuid::new_v4()).with_path("tpl"))
            .await
            .unwrap();
        assert!(view.steps.is_empty());
        assert_eq!(view.header.path_id.as_deref(), Some("tpl"));
        assert_eq!(view.header.state, AuditState::Pending);
        assert_eq!(engine.recalc(view.header.audit_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_step_operations_resolve_owner() {
        let engine = engine_with_template(&[Gate::Discovery, Gate::Roadmap]).await;
        let view = engine
            .create_audit(CreateAudit::new("Cash audit", Uuid::new_v4()).with_path("tpl"))
            .await
            .unwrap();
        let second = view.steps[1].step.step_id;

        let view = engine.mark_done(second).await.unwrap();
        assert_eq!(view.header.percent_complete, 50);
        assert_eq!(view.current().map(|s| s.step.seq), Some(1));

        let view = engine.reopen(second).await.unwrap();
        assert_eq!(view.steps[1].step.status, StepStatus::InProgress);
        assert_eq!(view.header.percent_complete, 0);

        assert!(engine.mark_done(Uuid::new_v4()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_aggregate_unchanged() {
        let engine = engine_with_template(&[Gate::Discovery]).await;
        let view = engine
            .create_audit(CreateAudit::new("Cash audit", Uuid::new_v4()).with_path("tpl"))
            .await
            .unwrap();
        let id = view.header.audit_id;
        let step = view.steps[0].step.step_id;
        engine.mark_done(step).await.unwrap();
        let before = engine.get_audit(id).await.unwrap();

        let err = engine
            .save_progress(
                step,
                ProgressUpdate::status(StepStatus::NotStarted).with_notes("undo"),
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(engine.get_audit(id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let engine = engine_with_template(&[Gate::Discovery]).await;
        let view = engine
            .create_audit(CreateAudit::new("Cash audit", Uuid::new_v4()).with_path("tpl"))
            .await
            .unwrap();
        let id = view.header.audit_id;
        let step = view.steps[0].step.step_id;

        engine.delete_audit(id).await.unwrap();
        assert!(engine.get_audit(id).await.unwrap_err().is_not_found());
        assert!(engine.mark_done(step).await.unwrap_err().is_not_found());
        assert!(engine.delete_audit(id).await.unwrap_err().is_not_found());
    }
}
