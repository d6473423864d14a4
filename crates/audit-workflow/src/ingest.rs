//! Ingestion Boundary
//!
//! External payloads (template files, create requests, progress updates)
//! arrive with inconsistent field names and date formats. They are mapped
//! onto one canonical shape here so nothing past this module sees aliases.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::CreateAudit;
use crate::error::ValidationErrors;
use crate::progress::ProgressUpdate;
use crate::state::{Gate, StepStatus};
use crate::template::{validate_steps, StepDefinition, Template};

/// Template definition as written in YAML/JSON files
#[derive(Debug, Clone, Deserialize)]
pub struct TemplatePayload {
    #[serde(alias = "pathId", alias = "template_id", alias = "templateId")]
    pub path_id: String,
    #[serde(alias = "Name", alias = "title")]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub published: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepDefinitionPayload>,
}

fn default_version() -> u32 {
    1
}

/// One step as written in a template file. `seq` defaults to position.
#[derive(Debug, Clone, Deserialize)]
pub struct StepDefinitionPayload {
    #[serde(default)]
    pub seq: Option<u32>,
    #[serde(alias = "name", alias = "Title")]
    pub title: String,
    #[serde(alias = "phase")]
    pub gate: String,
    #[serde(default)]
    pub required: Option<bool>,
    #[serde(
        default,
        alias = "definitionOfDone",
        alias = "dod",
        deserialize_with = "one_or_many"
    )]
    pub definition_of_done: Vec<String>,
}

impl TemplatePayload {
    /// Canonical draft template. Published state is applied by the caller.
    pub fn into_template(self) -> Result<Template, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let mut steps = Vec::with_capacity(self.steps.len());

        for (index, step) in self.steps.into_iter().enumerate() {
            let gate = match step.gate.parse::<Gate>() {
                Ok(gate) => gate,
                Err(e) => {
                    errors.add(format!("steps[{}].gate", index), e);
                    continue;
                }
            };
            steps.push(StepDefinition {
                seq: step.seq.unwrap_or(index as u32 + 1),
                title: step.title.trim().to_string(),
                gate,
                required: step.required.unwrap_or(true),
                definition_of_done: step.definition_of_done,
            });
        }

        if errors.is_empty() {
            if let Err(step_errors) = validate_steps(&steps) {
                errors = step_errors;
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        steps.sort_by_key(|s| s.seq);
        let mut template = Template::draft(self.path_id.trim(), self.name.trim(), steps);
        template.version = self.version;
        template.description = self.description;
        Ok(template)
    }
}

/// Audit create request as sent by clients
#[derive(Debug, Clone, Deserialize)]
pub struct CreateAuditPayload {
    #[serde(alias = "name", alias = "Name")]
    pub title: String,
    #[serde(default, alias = "engagementId")]
    pub engagement_id: Option<Uuid>,
    #[serde(default, alias = "clientId")]
    pub client_id: Option<Uuid>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default, alias = "auditType", alias = "type")]
    pub audit_type: Option<String>,
    #[serde(default, alias = "ownerContactId")]
    pub owner_contact_id: Option<Uuid>,
    #[serde(
        default,
        alias = "pathId",
        alias = "template_id",
        alias = "templateId"
    )]
    pub path_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(
        default,
        alias = "start_utc",
        alias = "startDate",
        alias = "startUtc",
        deserialize_with = "flexible_datetime"
    )]
    pub start_date: Option<DateTime<Utc>>,
}

impl From<CreateAuditPayload> for CreateAudit {
    fn from(p: CreateAuditPayload) -> Self {
        CreateAudit {
            title: p.title,
            // A missing engagement id becomes nil and fails validation downstream
            engagement_id: p.engagement_id.unwrap_or_else(Uuid::nil),
            client_id: p.client_id,
            domain: p.domain,
            audit_type: p.audit_type,
            owner_contact_id: p.owner_contact_id,
            path_id: p.path_id.filter(|p| !p.trim().is_empty()),
            notes: p.notes,
            started_at: p.start_date,
        }
    }
}

/// Progress update as sent by clients
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepProgressPayload {
    #[serde(default, alias = "Status", alias = "state")]
    pub status: Option<String>,
    #[serde(default, alias = "note", alias = "comment")]
    pub notes: Option<String>,
    #[serde(default, alias = "result")]
    pub output: Option<Value>,
}

impl StepProgressPayload {
    pub fn into_update(self) -> Result<ProgressUpdate, ValidationErrors> {
        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(s) => Some(
                s.parse::<StepStatus>()
                    .map_err(|e| ValidationErrors::single("status", e))?,
            ),
        };
        Ok(ProgressUpdate {
            status,
            notes: self.notes,
            output: self.output.filter(|v| !v.is_null()),
        })
    }
}

fn payload_error(e: serde_json::Error) -> ValidationErrors {
    ValidationErrors::single("payload", e.to_string())
}

pub fn parse_create_audit(value: Value) -> Result<CreateAudit, ValidationErrors> {
    let payload: CreateAuditPayload = serde_json::from_value(value).map_err(payload_error)?;
    Ok(payload.into())
}

pub fn parse_template(value: Value) -> Result<(Template, bool), ValidationErrors> {
    let payload: TemplatePayload = serde_json::from_value(value).map_err(payload_error)?;
    let published = payload.published;
    Ok((payload.into_template()?, published))
}

pub fn parse_progress(value: Value) -> Result<ProgressUpdate, ValidationErrors> {
    let payload: StepProgressPayload = serde_json::from_value(value).map_err(payload_error)?;
    payload.into_update()
}

/// Accept `YYYY-MM-DD` (midnight UTC) or RFC 3339
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, String> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| format!("invalid date '{}': expected YYYY-MM-DD or RFC 3339", s))
}

fn flexible_datetime<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => parse_datetime(s).map(Some).map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}
