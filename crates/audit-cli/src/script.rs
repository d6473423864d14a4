//! Command scripts replayed by `auditctl run`.
//!
//! Audits are referred to by a label chosen at `create` time and steps by
//! their `seq`, so a script never needs to know generated ids.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use audit_workflow::ingest;
use audit_workflow::{AuditEngine, AuditView};

/// Commands are written as single-key maps, `- advance: { audit: main }`
#[derive(Debug, Deserialize)]
pub struct Script {
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub commands: Vec<Command>,
}

impl Script {
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Create {
        label: String,
        payload: Value,
    },
    SetPath {
        audit: String,
        path_id: String,
    },
    SelfHeal {
        audit: String,
        path_id: String,
    },
    Advance {
        audit: String,
        #[serde(default)]
        seq: Option<u32>,
    },
    AdvanceTo {
        audit: String,
        seq: u32,
    },
    Progress {
        audit: String,
        seq: u32,
        update: Value,
    },
    MarkDone {
        audit: String,
        seq: u32,
    },
    Reopen {
        audit: String,
        seq: u32,
    },
    Recalc {
        audit: String,
    },
    Show {
        audit: String,
    },
    Delete {
        audit: String,
    },
    Publish {
        path_id: String,
        version: u32,
    },
    Clone {
        path_id: String,
    },
    Usage {
        path_id: String,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Create { .. } => "create",
            Command::SetPath { .. } => "set_path",
            Command::SelfHeal { .. } => "self_heal",
            Command::Advance { .. } => "advance",
            Command::AdvanceTo { .. } => "advance_to",
            Command::Progress { .. } => "progress",
            Command::MarkDone { .. } => "mark_done",
            Command::Reopen { .. } => "reopen",
            Command::Recalc { .. } => "recalc",
            Command::Show { .. } => "show",
            Command::Delete { .. } => "delete",
            Command::Publish { .. } => "publish",
            Command::Clone { .. } => "clone",
            Command::Usage { .. } => "usage",
        }
    }
}

/// Replays commands against one engine, tracking audit labels
pub struct Runner<'a> {
    engine: &'a AuditEngine,
    labels: HashMap<String, Uuid>,
}

impl<'a> Runner<'a> {
    pub fn new(engine: &'a AuditEngine) -> Self {
        Self {
            engine,
            labels: HashMap::new(),
        }
    }

    fn audit_id(&self, label: &str) -> Result<Uuid> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| anyhow!("unknown audit label '{}'", label))
    }

    async fn step_id(&self, label: &str, seq: u32) -> Result<Uuid> {
        let view = self.engine.get_audit(self.audit_id(label)?).await?;
        view.step_by_seq(seq)
            .map(|s| s.step.step_id)
            .ok_or_else(|| anyhow!("audit '{}' has no step with seq {}", label, seq))
    }

    fn view(view: AuditView) -> Result<Value> {
        Ok(serde_json::to_value(view)?)
    }

    /// Run every command in order, stopping at the first failure
    pub async fn run(&mut self, script: Script) -> Result<Vec<Value>> {
        let mut results = Vec::with_capacity(script.commands.len());
        for (index, command) in script.commands.into_iter().enumerate() {
            let name = command.name();
            let result = self
                .execute(command)
                .await
                .with_context(|| format!("command #{} ({}) failed", index + 1, name))?;
            info!(index = index + 1, command = name, "Command applied");
            results.push(json!({ "command": name, "result": result }));
        }
        Ok(results)
    }

    async fn execute(&mut self, command: Command) -> Result<Value> {
        let engine = self.engine;
        match command {
            Command::Create { label, payload } => {
                if self.labels.contains_key(&label) {
                    bail!("audit label '{}' already used", label);
                }
                let request = ingest::parse_create_audit(payload)?;
                let view = engine.create_audit(request).await?;
                self.labels.insert(label, view.header.audit_id);
                Self::view(view)
            }
            Command::SetPath { audit, path_id } => {
                let outcome = engine.set_path(self.audit_id(&audit)?, &path_id).await?;
                Ok(serde_json::to_value(outcome)?)
            }
            Command::SelfHeal { audit, path_id } => {
                let outcome = engine
                    .self_heal_path(self.audit_id(&audit)?, &path_id)
                    .await?;
                Ok(serde_json::to_value(outcome)?)
            }
            Command::Advance { audit, seq } => {
                let step_id = match seq {
                    Some(seq) => Some(self.step_id(&audit, seq).await?),
                    None => None,
                };
                Self::view(engine.advance(self.audit_id(&audit)?, step_id).await?)
            }
            Command::AdvanceTo { audit, seq } => {
                let step_id = self.step_id(&audit, seq).await?;
                Self::view(engine.advance_to(self.audit_id(&audit)?, step_id).await?)
            }
            Command::Progress { audit, seq, update } => {
                let step_id = self.step_id(&audit, seq).await?;
                let update = ingest::parse_progress(update)?;
                Self::view(engine.save_progress(step_id, update).await?)
            }
            Command::MarkDone { audit, seq } => {
                let step_id = self.step_id(&audit, seq).await?;
                Self::view(engine.mark_done(step_id).await?)
            }
            Command::Reopen { audit, seq } => {
                let step_id = self.step_id(&audit, seq).await?;
                Self::view(engine.reopen(step_id).await?)
            }
            Command::Recalc { audit } => {
                let percent = engine.recalc(self.audit_id(&audit)?).await?;
                Ok(json!({ "percent_complete": percent }))
            }
            Command::Show { audit } => Self::view(engine.get_audit(self.audit_id(&audit)?).await?),
            Command::Delete { audit } => {
                let audit_id = self.audit_id(&audit)?;
                engine.delete_audit(audit_id).await?;
                self.labels.remove(&audit);
                Ok(json!({ "deleted": audit_id }))
            }
            Command::Publish { path_id, version } => {
                let outcome = engine.catalog().publish(&path_id, version).await?;
                Ok(serde_json::to_value(outcome)?)
            }
            Command::Clone { path_id } => {
                let new_path_id = engine.catalog().clone_template(&path_id).await?;
                Ok(json!({ "path_id": new_path_id }))
            }
            Command::Usage { path_id } => {
                let usage = engine.catalog().get_usage(&path_id).await?;
                Ok(serde_json::to_value(usage)?)
            }
        }
    }
}
