//! Audit State Types
//!
//! The `(Audit, Step[])` aggregate, its fixed vocabularies, and the read view
//! handed back to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Workflow phase associated with a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Discovery,
    Analysis,
    Playback,
    Roadmap,
}

impl Gate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Analysis => "analysis",
            Self::Playback => "playback",
            Self::Roadmap => "roadmap",
        }
    }
}

impl std::fmt::Display for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Gate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discovery" => Ok(Self::Discovery),
            "analysis" => Ok(Self::Analysis),
            "playback" => Ok(Self::Playback),
            "roadmap" => Ok(Self::Roadmap),
            _ => Err(format!("Unknown gate: {}", s)),
        }
    }
}

/// Per-step progress status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    NotStarted,
    InProgress,
    Done,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Done => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "not_started" | "not-started" | "todo" => Ok(Self::NotStarted),
            "in_progress" | "in-progress" | "started" => Ok(Self::InProgress),
            "done" | "complete" | "completed" => Ok(Self::Done),
            _ => Err(format!("Unknown step status: {}", s)),
        }
    }
}

/// Overall audit phase, derived from the current step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditState {
    Discovery,
    Analysis,
    Playback,
    Roadmap,
    /// No current step remains and at least one step exists
    Closed,
    /// The audit has no steps yet
    Pending,
}

impl AuditState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Analysis => "analysis",
            Self::Playback => "playback",
            Self::Roadmap => "roadmap",
            Self::Closed => "closed",
            Self::Pending => "pending",
        }
    }
}

impl From<Gate> for AuditState {
    fn from(gate: Gate) -> Self {
        match gate {
            Gate::Discovery => Self::Discovery,
            Gate::Analysis => Self::Analysis,
            Gate::Playback => Self::Playback,
            Gate::Roadmap => Self::Roadmap,
        }
    }
}

impl std::fmt::Display for AuditState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit header record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Audit {
    pub audit_id: Uuid,
    pub engagement_id: Uuid,
    #[serde(default)]
    pub client_id: Option<Uuid>,
    pub title: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub audit_type: Option<String>,
    #[serde(default)]
    pub owner_contact_id: Option<Uuid>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Template this audit was seeded from; `None` while pathless
    pub path_id: Option<String>,
    pub current_step_id: Option<Uuid>,
    pub percent_complete: u8,
    pub state: AuditState,
    /// Optimistic concurrency counter; bumped by the store on every save
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One step instance, seeded from a template step definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: Uuid,
    pub audit_id: Uuid,
    pub seq: u32,
    pub title: String,
    pub gate: Gate,
    pub required: bool,
    #[serde(default)]
    pub definition_of_done: Vec<String>,
    pub status: StepStatus,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Entry in the aggregate's append-only history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: AuditEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum AuditEventKind {
    Created,
    Seeded {
        path_id: String,
        step_count: usize,
    },
    StatusChanged {
        step_id: Uuid,
        from: StepStatus,
        to: StepStatus,
    },
    PointerMoved {
        from: Option<Uuid>,
        to: Option<Uuid>,
        /// True when moved by `advance_to` rather than by completion
        forced: bool,
    },
    Closed,
}

/// The `(Audit, Step[])` aggregate persisted and loaded as one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditAggregate {
    pub audit: Audit,
    /// Ordered by `seq`
    pub steps: Vec<Step>,
    #[serde(default)]
    pub history: Vec<AuditEvent>,
}

impl AuditAggregate {
    /// Create a pathless aggregate with no steps
    pub fn new(audit: Audit) -> Self {
        let mut aggregate = Self {
            audit,
            steps: Vec::new(),
            history: Vec::new(),
        };
        aggregate.record(AuditEventKind::Created);
        aggregate
    }

    pub fn audit_id(&self) -> Uuid {
        self.audit.audit_id
    }

    pub fn has_steps(&self) -> bool {
        !self.steps.is_empty()
    }

    pub fn step(&self, step_id: Uuid) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: Uuid) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.audit.current_step_id.and_then(|id| self.step(id))
    }

    pub fn done_count(&self) -> usize {
        self.steps.iter().filter(|s| s.status.is_done()).count()
    }

    /// No current step remains and at least one step exists
    pub fn is_closed(&self) -> bool {
        self.has_steps() && self.audit.current_step_id.is_none()
    }

    /// Every step is done
    pub fn is_fully_complete(&self) -> bool {
        self.has_steps() && self.steps.iter().all(|s| s.status.is_done())
    }

    /// Audit state as implied by the current pointer
    pub fn derive_state(&self) -> AuditState {
        match self.current_step() {
            Some(step) => step.gate.into(),
            None if self.has_steps() => AuditState::Closed,
            None => AuditState::Pending,
        }
    }

    /// Append a history entry and touch `updated_at`
    pub fn record(&mut self, kind: AuditEventKind) {
        let now = Utc::now();
        self.history.push(AuditEvent { at: now, kind });
        self.audit.updated_at = now;
    }

    /// Read view with `is_current` derived from the pointer
    pub fn to_view(&self) -> AuditView {
        let current = self.audit.current_step_id;
        AuditView {
            header: self.audit.clone(),
            steps: self
                .steps
                .iter()
                .map(|step| StepView {
                    is_current: Some(step.step_id) == current,
                    step: step.clone(),
                })
                .collect(),
            is_closed: self.is_closed(),
            is_fully_complete: self.is_fully_complete(),
        }
    }
}

/// Step as returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepView {
    #[serde(flatten)]
    pub step: Step,
    pub is_current: bool,
}

/// Header plus ordered steps, all from one committed version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditView {
    pub header: Audit,
    pub steps: Vec<StepView>,
    pub is_closed: bool,
    pub is_fully_complete: bool,
}

impl AuditView {
    pub fn current(&self) -> Option<&StepView> {
        self.steps.iter().find(|s| s.is_current)
    }

    pub fn step_by_seq(&self, seq: u32) -> Option<&StepView> {
        self.steps.iter().find(|s| s.step.seq == seq)
    }

    pub fn step_by_seq_mut(&mut self, seq: u32) -> Option<&mut StepView> {
        self.steps.iter_mut().find(|s| s.step.seq == seq)
    }

    pub fn step_mut(&mut self, step_id: Uuid) -> Option<&mut StepView> {
        self.steps.iter_mut().find(|s| s.step.step_id == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_audit() -> Audit {
        let now = Utc::now();
        Audit {
            audit_id: Uuid::new_v4(),
            engagement_id: Uuid::new_v4(),
            client_id: None,
            title: "Quarterly controls review".to_string(),
            domain: None,
            audit_type: None,
            owner_contact_id: None,
            notes: None,
            path_id: None,
            current_step_id: None,
            percent_complete: 0,
            state: AuditState::Pending,
            version: 0,
            started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_step(audit_id: Uuid, seq: u32, gate: Gate) -> Step {
        Step {
            step_id: Uuid::new_v4(),
            audit_id,
            seq,
            title: format!("Step {}", seq),
            gate,
            required: true,
            definition_of_done: Vec::new(),
            status: StepStatus::NotStarted,
            notes: None,
            output: None,
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn test_pathless_aggregate_is_pending() {
        let aggregate = AuditAggregate::new(sample_audit());
        assert_eq!(aggregate.derive_state(), AuditState::Pending);
        assert!(!aggregate.is_closed());
        assert!(!aggregate.is_fully_complete());
        assert_eq!(aggregate.history.len(), 1);
    }

    #[test]
    fn test_state_follows_current_gate() {
        let mut aggregate = AuditAggregate::new(sample_audit());
        let id = aggregate.audit_id();
        aggregate.steps.push(sample_step(id, 1, Gate::Discovery));
        aggregate.steps.push(sample_step(id, 2, Gate::Playback));

        aggregate.audit.current_step_id = Some(aggregate.steps[1].step_id);
        assert_eq!(aggregate.derive_state(), AuditState::Playback);

        aggregate.audit.current_step_id = None;
        assert_eq!(aggregate.derive_state(), AuditState::Closed);
        assert!(aggregate.is_closed());
        assert!(!aggregate.is_fully_complete());
    }

    #[test]
    fn test_view_marks_exactly_one_current() {
        let mut aggregate = AuditAggregate::new(sample_audit());
        let id = aggregate.audit_id();
        for seq in 1..=3 {
            aggregate.steps.push(sample_step(id, seq, Gate::Analysis));
        }
        aggregate.audit.current_step_id = Some(aggregate.steps[2].step_id);

        let view = aggregate.to_view();
        assert_eq!(view.steps.iter().filter(|s| s.is_current).count(), 1);
        assert_eq!(view.current().map(|s| s.step.seq), Some(3));
    }

    #[test]
    fn test_vocabulary_strings() {
        assert_eq!(StepStatus::InProgress.as_str(), "in_progress");
        assert_eq!("roadmap".parse::<Gate>(), Ok(Gate::Roadmap));
        assert!("closing".parse::<Gate>().is_err());
        assert_eq!(
            serde_json::to_value(AuditState::Closed).unwrap(),
            serde_json::json!("closed")
        );
    }
}
