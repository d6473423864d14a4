//! Template Catalog
//!
//! Reusable, versioned step definitions that audits are seeded from.
//!
//! Lifecycle: Draft → Published. A published template's steps are frozen;
//! to change them, clone into a new draft.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AuditError, NotFound, StoreError, ValidationErrors};
use crate::ids::IdAllocator;
use crate::ingest::TemplatePayload;
use crate::retry::{Attempt, RetryOutcome, RetryPolicy};
use crate::state::{AuditState, Gate};
use crate::store::AuditStore;

/// One ordered step in a template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub seq: u32,
    pub title: String,
    pub gate: Gate,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub definition_of_done: Vec<String>,
}

fn default_required() -> bool {
    true
}

/// A versioned audit template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub path_id: String,
    pub name: String,
    pub version: u32,
    pub published: bool,
    #[serde(default)]
    pub description: Option<String>,
    /// Ordered by `seq`, contiguous from 1
    pub steps: Vec<StepDefinition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

impl Template {
    /// New unpublished draft at version 1
    pub fn draft(
        path_id: impl Into<String>,
        name: impl Into<String>,
        steps: Vec<StepDefinition>,
    ) -> Self {
        let now = Utc::now();
        Self {
            path_id: path_id.into(),
            name: name.into(),
            version: 1,
            published: false,
            description: None,
            steps,
            created_at: now,
            updated_at: now,
            published_at: None,
        }
    }
}

/// Check that seqs are unique and contiguous from 1, and titles present.
pub fn validate_steps(steps: &[StepDefinition]) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::new();
    let mut seen = HashSet::new();

    for (index, step) in steps.iter().enumerate() {
        if step.title.trim().is_empty() {
            errors.add(format!("steps[{}].title", index), "is required");
        }
        if !seen.insert(step.seq) {
            errors.add(
                format!("steps[{}].seq", index),
                format!("duplicate seq {}", step.seq),
            );
        }
    }

    let mut seqs: Vec<u32> = seen.into_iter().collect();
    seqs.sort_unstable();
    if seqs
        .iter()
        .enumerate()
        .any(|(i, seq)| *seq != i as u32 + 1)
    {
        errors.add("steps", "seq values must be contiguous starting at 1");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_template(template: &Template) -> Result<(), ValidationErrors> {
    let mut errors = match validate_steps(&template.steps) {
        Ok(()) => ValidationErrors::new(),
        Err(errors) => errors,
    };
    if template.path_id.trim().is_empty() {
        errors.add("path_id", "is required");
    }
    if template.name.trim().is_empty() {
        errors.add("name", "is required");
    }
    if template.version == 0 {
        errors.add("version", "must be at least 1");
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Persistence trait for templates (the read side is what the engine consumes).
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Template>, StoreError>;
    async fn get(&self, path_id: &str) -> Result<Option<Template>, StoreError>;
    /// Insert or overwrite a draft. Published templates cannot be overwritten.
    async fn put(&self, template: &Template) -> Result<(), StoreError>;
    /// Freeze a template at `version`
    async fn mark_published(
        &self,
        path_id: &str,
        version: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// In-memory TemplateStore for testing and single-process use.
pub struct MemoryTemplateStore {
    inner: RwLock<BTreeMap<String, Template>>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryTemplateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Lock(e.to_string())
}

#[async_trait]
impl TemplateStore for MemoryTemplateStore {
    async fn list(&self) -> Result<Vec<Template>, StoreError> {
        let store = self.inner.read().map_err(lock_err)?;
        Ok(store.values().cloned().collect())
    }

    async fn get(&self, path_id: &str) -> Result<Option<Template>, StoreError> {
        let store = self.inner.read().map_err(lock_err)?;
        Ok(store.get(path_id).cloned())
    }

    async fn put(&self, template: &Template) -> Result<(), StoreError> {
        let mut store = self.inner.write().map_err(lock_err)?;
        if let Some(existing) = store.get(&template.path_id) {
            if existing.published {
                return Err(StoreError::TemplatePublished(template.path_id.clone()));
            }
        }
        store.insert(template.path_id.clone(), template.clone());
        Ok(())
    }

    async fn mark_published(
        &self,
        path_id: &str,
        version: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut store = self.inner.write().map_err(lock_err)?;
        let tpl = store
            .get_mut(path_id)
            .ok_or_else(|| StoreError::TemplateMissing(path_id.to_string()))?;
        if tpl.published {
            return Err(StoreError::TemplatePublished(path_id.to_string()));
        }
        tpl.version = version;
        tpl.published = true;
        tpl.published_at = Some(at);
        tpl.updated_at = at;
        Ok(())
    }
}

/// Result of `publish`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    Published,
    /// Same version was already published; nothing changed
    AlreadyPublished,
}

/// Result of `register_and_await`
#[derive(Debug, Clone, PartialEq)]
pub enum Visibility {
    Visible(Template),
    /// Written, but not readable within the poll schedule
    NotYetVisible { path_id: String, attempts: usize },
}

/// One audit referencing a template
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditUsage {
    pub audit_id: Uuid,
    pub title: String,
    pub state: AuditState,
    pub percent_complete: u8,
    pub step_count: usize,
}

/// Impact summary for a template
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateUsage {
    pub path_id: String,
    pub audits: Vec<AuditUsage>,
    pub total_audits: usize,
    pub open_audits: usize,
    pub closed_audits: usize,
    pub fully_complete_audits: usize,
    pub average_percent: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateLoadError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error in {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid template in {path}: {errors}")]
    Invalid {
        path: String,
        errors: ValidationErrors,
    },

    #[error(transparent)]
    Catalog(#[from] AuditError),
}

/// Catalog operations over a `TemplateStore`
pub struct TemplateCatalog {
    templates: Arc<dyn TemplateStore>,
    audits: Arc<dyn AuditStore>,
    ids: Arc<dyn IdAllocator>,
    visibility_policy: RetryPolicy,
}

impl TemplateCatalog {
    pub fn new(
        templates: Arc<dyn TemplateStore>,
        audits: Arc<dyn AuditStore>,
        ids: Arc<dyn IdAllocator>,
    ) -> Self {
        Self {
            templates,
            audits,
            ids,
            visibility_policy: RetryPolicy::template_visibility(),
        }
    }

    pub fn with_visibility_policy(mut self, policy: RetryPolicy) -> Self {
        self.visibility_policy = policy;
        self
    }

    /// All templates ordered by path id
    pub async fn list(&self) -> Result<Vec<Template>, AuditError> {
        let mut templates = self.templates.list().await?;
        templates.sort_by(|a, b| a.path_id.cmp(&b.path_id));
        Ok(templates)
    }

    pub async fn get(&self, path_id: &str) -> Result<Template, AuditError> {
        self.templates
            .get(path_id)
            .await?
            .ok_or_else(|| NotFound::Template(path_id.to_string()).into())
    }

    /// Store a new or replacement draft
    pub async fn register(&self, template: Template) -> Result<Template, AuditError> {
        validate_template(&template)?;

        if let Some(existing) = self.templates.get(&template.path_id).await? {
            if existing.published {
                return Err(AuditError::TemplateImmutable {
                    path_id: template.path_id,
                });
            }
        }

        let mut draft = template;
        draft.steps.sort_by_key(|s| s.seq);
        draft.published = false;
        draft.published_at = None;
        draft.updated_at = Utc::now();
        self.templates.put(&draft).await?;

        info!(path_id = %draft.path_id, steps = draft.steps.len(), "Registered template draft");
        Ok(draft)
    }

    /// Replace a draft's step definitions
    pub async fn update_steps(
        &self,
        path_id: &str,
        mut steps: Vec<StepDefinition>,
    ) -> Result<Template, AuditError> {
        let mut template = self.get(path_id).await?;
        if template.published {
            return Err(AuditError::TemplateImmutable {
                path_id: path_id.to_string(),
            });
        }
        validate_steps(&steps)?;
        steps.sort_by_key(|s| s.seq);

        template.steps = steps;
        template.updated_at = Utc::now();
        self.templates.put(&template).await?;
        Ok(template)
    }

    /// Freeze a template at `version`. Re-publishing the same version is a no-op.
    pub async fn publish(&self, path_id: &str, version: u32) -> Result<PublishOutcome, AuditError> {
        if version == 0 {
            return Err(ValidationErrors::single("version", "must be at least 1").into());
        }

        let template = self.get(path_id).await?;
        if template.published {
            if template.version == version {
                debug!(path_id, version, "Template already published at this version");
                return Ok(PublishOutcome::AlreadyPublished);
            }
            return Err(AuditError::VersionConflict {
                path_id: path_id.to_string(),
                published: template.version,
                requested: version,
            });
        }

        self.templates
            .mark_published(path_id, version, Utc::now())
            .await?;
        info!(path_id, version, "Published template");
        Ok(PublishOutcome::Published)
    }

    /// Copy a template's steps into a new, unpublished draft. Returns the new path id.
    pub async fn clone_template(&self, path_id: &str) -> Result<String, AuditError> {
        let source = self.get(path_id).await?;
        let new_path_id = self.ids.next_id().to_string();

        let mut copy = Template::draft(
            new_path_id.clone(),
            format!("{} (copy)", source.name),
            source.steps.clone(),
        );
        copy.description = source.description.clone();
        self.templates.put(&copy).await?;

        info!(source = path_id, clone = %new_path_id, "Cloned template");
        Ok(new_path_id)
    }

    /// Audits referencing a template, with aggregate stats
    pub async fn get_usage(&self, path_id: &str) -> Result<TemplateUsage, AuditError> {
        self.get(path_id).await?;
        let aggregates = self.audits.list_by_path(path_id).await?;

        let audits: Vec<AuditUsage> = aggregates
            .iter()
            .map(|a| AuditUsage {
                audit_id: a.audit.audit_id,
                title: a.audit.title.clone(),
                state: a.audit.state,
                percent_complete: a.audit.percent_complete,
                step_count: a.steps.len(),
            })
            .collect();

        let total_audits = aggregates.len();
        let closed_audits = aggregates.iter().filter(|a| a.is_closed()).count();
        let fully_complete_audits = aggregates.iter().filter(|a| a.is_fully_complete()).count();
        let average_percent = if total_audits == 0 {
            0.0
        } else {
            audits.iter().map(|a| a.percent_complete as f64).sum::<f64>() / total_audits as f64
        };

        Ok(TemplateUsage {
            path_id: path_id.to_string(),
            total_audits,
            open_audits: total_audits - closed_audits,
            closed_audits,
            fully_complete_audits,
            average_percent,
            audits,
        })
    }

    /// Register a draft, then poll until it is readable or the schedule runs out.
    ///
    /// A retriable failure from the create call may still have been applied by
    /// the store, so it falls through to the poll instead of failing.
    pub async fn register_and_await(&self, template: Template) -> Result<Visibility, AuditError> {
        let path_id = template.path_id.clone();
        if let Err(e) = self.register(template).await {
            if !e.is_retriable() {
                return Err(e);
            }
            warn!(path_id = %path_id, error = %e, "Template create unconfirmed, polling for it");
        }

        let outcome = self
            .visibility_policy
            .run(|_| {
                let path_id = path_id.clone();
                async move {
                    let found = self.templates.get(&path_id).await;
                    match found {
                        Ok(Some(found)) => Attempt::Done(found),
                        Ok(None) => Attempt::Retry(AuditError::from(NotFound::Template(path_id))),
                        Err(e) => Attempt::Retry(AuditError::from(e)),
                    }
                }
            })
            .await;

        match outcome {
            RetryOutcome::Done { value, .. } => Ok(Visibility::Visible(value)),
            RetryOutcome::Exhausted { attempts, .. } | RetryOutcome::Aborted { attempts, .. } => {
                warn!(path_id = %path_id, attempts, "Template not visible after polling");
                Ok(Visibility::NotYetVisible { path_id, attempts })
            }
        }
    }

    /// True when `template` is already stored, published at the same version
    /// with the same steps
    async fn is_published_as(&self, template: &Template) -> Result<bool, AuditError> {
        let Some(existing) = self.templates.get(&template.path_id).await? else {
            return Ok(false);
        };
        let mut steps = template.steps.clone();
        steps.sort_by_key(|s| s.seq);
        Ok(existing.published && existing.version == template.version && existing.steps == steps)
    }

    /// Load every `*.yaml` / `*.yml` file in `dir` as a template.
    ///
    /// Files that declare `published: true` are published at their version.
    pub async fn load_dir(&self, dir: impl AsRef<Path>) -> Result<usize, TemplateLoadError> {
        let mut loaded = 0;
        for payload in read_template_dir(dir.as_ref())? {
            let publish = payload.published;
            let template = payload.template;
            let (path_id, version) = (template.path_id.clone(), template.version);
            if publish && self.is_published_as(&template).await? {
                debug!(path_id = %path_id, version, "Template already published unchanged");
                loaded += 1;
                continue;
            }
            self.register(template).await?;
            if publish {
                self.publish(&path_id, version).await?;
            }
            loaded += 1;
        }
        Ok(loaded)
    }
}

/// A template read from disk plus whether it should be published
pub struct LoadedTemplate {
    pub template: Template,
    pub published: bool,
}

/// Parse all template files in a directory, sorted by file name.
pub fn read_template_dir(dir: &Path) -> Result<Vec<LoadedTemplate>, TemplateLoadError> {
    let io_err = |source| TemplateLoadError::Io {
        path: dir.display().to_string(),
        source,
    };

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if is_yaml {
            paths.push(path);
        }
    }
    paths.sort();

    let mut loaded = Vec::with_capacity(paths.len());
    for path in paths {
        let shown = path.display().to_string();
        let content = std::fs::read_to_string(&path).map_err(|source| TemplateLoadError::Io {
            path: shown.clone(),
            source,
        })?;
        let payload: TemplatePayload =
            serde_yaml::from_str(&content).map_err(|source| TemplateLoadError::Yaml {
                path: shown.clone(),
                source,
            })?;
        let published = payload.published;
        let template = payload
            .into_template()
            .map_err(|errors| TemplateLoadError::Invalid {
                path: shown.clone(),
                errors,
            })?;
        debug!(path = %shown, path_id = %template.path_id, "Read template file");
        loaded.push(LoadedTemplate {
            template,
            published,
        });
    }
    Ok(loaded)
}
