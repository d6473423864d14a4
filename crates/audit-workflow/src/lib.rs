//! Audit Workflow Engine
//!
//! Runs structured audit engagements from reusable templates: seeds ordered
//! steps from a template, tracks per-step progress, moves a single "current
//! step" pointer forward, and keeps percent-complete and the audit's gate
//! state in sync after every change.
//!
//! ```text
//! TemplateCatalog ──seed──▶ AuditEngine ──load/save──▶ AuditStore
//!                              │
//!               progress · advance · percent
//! ```
//!
//! Persistence is behind the `TemplateStore` and `AuditStore` traits; the
//! in-memory implementations are used by tests and the `auditctl` driver.

pub mod advance;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod ids;
pub mod ingest;
pub mod percent;
pub mod progress;
pub mod retry;
pub mod state;
pub mod store;
pub mod template;

pub use command::{optimistic_save_progress, Optimistic};
pub use config::{ConfigError, EngineConfig};
pub use engine::{AuditEngine, CreateAudit, SelfHealOutcome, SetPathOutcome};
pub use error::{AuditError, NotFound, StoreError, ValidationErrors};
pub use ids::{IdAllocator, ScopedIds, UuidAllocator};
pub use percent::percent_complete;
pub use progress::ProgressUpdate;
pub use retry::{Attempt, RetryOutcome, RetryPolicy};
pub use state::{
    Audit, AuditAggregate, AuditEvent, AuditEventKind, AuditState, AuditView, Gate, Step,
    StepStatus, StepView,
};
pub use store::{AuditStore, MemoryAuditStore};
pub use template::{
    MemoryTemplateStore, PublishOutcome, StepDefinition, Template, TemplateCatalog,
    TemplateLoadError, TemplateStore, TemplateUsage, Visibility,
};
