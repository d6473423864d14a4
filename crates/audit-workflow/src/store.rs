//! Audit Persistence
//!
//! The engine treats `(Audit, Step[])` as one aggregate. Every mutating
//! operation loads it, changes a private copy, and writes it back with a
//! single `save` guarded by the version it loaded. Backends must make `save`
//! and `delete` atomic and return snapshots from one committed version.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::AuditAggregate;

/// Persistence trait for audit aggregates.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Load a consistent snapshot of the aggregate
    async fn load(&self, audit_id: Uuid) -> Result<Option<AuditAggregate>, StoreError>;

    /// Atomically write the whole aggregate.
    ///
    /// `expected_version = None` inserts a new aggregate and fails with
    /// `AlreadyExists` if one is present. `Some(v)` replaces the stored
    /// aggregate only if it is still at version `v`. Returns the new version.
    async fn save(
        &self,
        aggregate: &AuditAggregate,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Remove the aggregate and all of its steps. Returns false if absent.
    async fn delete(&self, audit_id: Uuid) -> Result<bool, StoreError>;

    /// Resolve the audit owning a step
    async fn audit_id_for_step(&self, step_id: Uuid) -> Result<Option<Uuid>, StoreError>;

    /// All aggregates seeded from (or assigned to) a template
    async fn list_by_path(&self, path_id: &str) -> Result<Vec<AuditAggregate>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    audits: HashMap<Uuid, AuditAggregate>,
    step_owner: HashMap<Uuid, Uuid>,
}

/// In-memory AuditStore for testing and single-process use.
pub struct MemoryAuditStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryInner::default()),
        }
    }

    /// Number of stored audits
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.audits.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Lock(e.to_string())
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn load(&self, audit_id: Uuid) -> Result<Option<AuditAggregate>, StoreError> {
        let inner = self.inner.read().map_err(lock_err)?;
        Ok(inner.audits.get(&audit_id).cloned())
    }

    async fn save(
        &self,
        aggregate: &AuditAggregate,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let audit_id = aggregate.audit_id();
        let mut inner = self.inner.write().map_err(lock_err)?;

        let new_version = match (inner.audits.get(&audit_id), expected_version) {
            (None, None) => 1,
            (Some(_), None) => return Err(StoreError::AlreadyExists(audit_id)),
            (Some(existing), Some(v)) if existing.audit.version == v => v + 1,
            (_, expected) => {
                return Err(StoreError::VersionMismatch {
                    audit_id,
                    expected,
                })
            }
        };

        if let Some(previous) = inner.audits.remove(&audit_id) {
            for step in &previous.steps {
                inner.step_owner.remove(&step.step_id);
            }
        }

        let mut stored = aggregate.clone();
        stored.audit.version = new_version;
        for step in &stored.steps {
            inner.step_owner.insert(step.step_id, audit_id);
        }
        inner.audits.insert(audit_id, stored);

        Ok(new_version)
    }

    async fn delete(&self, audit_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().map_err(lock_err)?;
        match inner.audits.remove(&audit_id) {
            Some(removed) => {
                for step in &removed.steps {
                    inner.step_owner.remove(&step.step_id);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn audit_id_for_step(&self, step_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        let inner = self.inner.read().map_err(lock_err)?;
        Ok(inner.step_owner.get(&step_id).copied())
    }

    async fn list_by_path(&self, path_id: &str) -> Result<Vec<AuditAggregate>, StoreError> {
        let inner = self.inner.read().map_err(lock_err)?;
        let mut audits: Vec<_> = inner
            .audits
            .values()
            .filter(|a| a.audit.path_id.as_deref() == Some(path_id))
            .cloned()
            .collect();
        audits.sort_by_key(|a| a.audit.created_at);
        Ok(audits)
    }
}
