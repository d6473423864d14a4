//! Error Types
//!
//! Validation failures are field-keyed so callers can highlight the exact
//! input that failed. Not-found is kept distinct from validation so callers
//! can decide whether a missing record is fatal or ignorable.

use std::collections::BTreeMap;
use std::fmt;

use uuid::Uuid;

/// Errors returned by an `AuditStore` or `TemplateStore` backend
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another writer committed a newer version of the aggregate
    #[error("version conflict on audit {audit_id}: expected version {expected:?}")]
    VersionMismatch {
        audit_id: Uuid,
        expected: Option<u64>,
    },

    #[error("audit already exists: {0}")]
    AlreadyExists(Uuid),

    #[error("template is published and cannot be overwritten: {0}")]
    TemplatePublished(String),

    #[error("template missing from store: {0}")]
    TemplateMissing(String),

    #[error("lock poisoned: {0}")]
    Lock(String),

    /// Backend-specific failure (connection, serialization, timeout)
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// What could not be found
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotFound {
    #[error("audit not found: {0}")]
    Audit(Uuid),

    #[error("step {step_id} not found in audit {audit_id}")]
    StepInAudit { audit_id: Uuid, step_id: Uuid },

    #[error("step not found: {0}")]
    Step(Uuid),

    #[error("template not found: {0}")]
    Template(String),
}

/// Field-keyed validation messages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    fields: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a single-field error
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Messages recorded against a field
    pub fn field(&self, field: &str) -> Option<&[String]> {
        self.fields.get(field).map(|m| m.as_slice())
    }

    pub fn fields(&self) -> &BTreeMap<String, Vec<String>> {
        &self.fields
    }

    /// Convert into `Err` when any field failed
    pub fn into_result(self) -> Result<(), AuditError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(AuditError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.fields {
            for message in messages {
                if !first {
                    write!(f, "; ")?;
                }
                write!(f, "{}: {}", field, message)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Main error type for the audit workflow engine
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    #[error(transparent)]
    NotFound(#[from] NotFound),

    #[error("template {path_id} is published; clone it to edit")]
    TemplateImmutable { path_id: String },

    #[error("template {path_id} already published as version {published}, cannot publish {requested}")]
    VersionConflict {
        path_id: String,
        published: u32,
        requested: u32,
    },

    #[error("concurrent modification of audit {audit_id} (expected version {expected_version})")]
    ConcurrentConflict {
        audit_id: Uuid,
        expected_version: u64,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl AuditError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AuditError::NotFound(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, AuditError::Validation(_))
    }

    /// Failures a bounded retry may recover from
    pub fn is_retriable(&self) -> bool {
        match self {
            AuditError::ConcurrentConflict { .. } => true,
            AuditError::Store(StoreError::Backend(_))
            | AuditError::Store(StoreError::Lock(_))
            | AuditError::Store(StoreError::VersionMismatch { .. }) => true,
            _ => false,
        }
    }

    /// Field-keyed messages when this is a validation failure
    pub fn validation(&self) -> Option<&ValidationErrors> {
        match self {
            AuditError::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}

impl From<ValidationErrors> for AuditError {
    fn from(errors: ValidationErrors) -> Self {
        AuditError::Validation(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_field_keyed() {
        let mut errors = ValidationErrors::new();
        errors.add("title", "must be at least 3 characters");
        errors.add("engagement_id", "is required");

        assert_eq!(
            errors.field("title"),
            Some(&["must be at least 3 characters".to_string()][..])
        );
        assert!(errors.field("notes").is_none());
        assert_eq!(
            errors.to_string(),
            "engagement_id: is required; title: must be at least 3 characters"
        );
    }

    #[test]
    fn test_empty_validation_is_ok() {
        assert!(ValidationErrors::new().into_result().is_ok());
    }

    #[test]
    fn test_retriable_classification() {
        let backend = AuditError::Store(StoreError::Backend("timeout".into()));
        assert!(backend.is_retriable());

        let missing = AuditError::NotFound(NotFound::Audit(Uuid::nil()));
        assert!(missing.is_not_found());
        assert!(!missing.is_retriable());

        let invalid = AuditError::Validation(ValidationErrors::single("title", "is required"));
        assert!(!invalid.is_retriable());
        assert!(invalid.validation().is_some());
    }
}
