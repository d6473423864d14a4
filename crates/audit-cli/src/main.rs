//! auditctl - Audit Workflow Driver
//!
//! Loads YAML templates into an in-memory engine and replays command
//! scripts against it, printing results as JSON.
//!
//! Usage:
//!   auditctl templates --dir config/templates
//!   auditctl run --templates config/templates --script config/scripts/walkthrough.yaml
//!
//! Set `RUST_LOG=audit_workflow=debug` to see retry and seeding detail.

mod script;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use audit_workflow::{AuditEngine, EngineConfig};

use crate::script::{Runner, Script};

#[derive(Parser, Debug)]
#[command(name = "auditctl")]
#[command(about = "Drive the audit workflow engine from YAML templates and scripts")]
struct Args {
    /// Engine config file (YAML). Defaults and AUDIT_* env overrides apply otherwise.
    #[arg(long, short = 'c', global = true, env = "AUDIT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Validate and list the templates in a directory
    Templates {
        #[arg(long, short = 'd', default_value = "config/templates")]
        dir: PathBuf,
    },

    /// Load templates, then replay a command script
    Run {
        #[arg(long, short = 't', default_value = "config/templates")]
        templates: PathBuf,

        #[arg(long, short = 's')]
        script: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_yaml_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("auditctl=info,audit_workflow=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    let engine = AuditEngine::in_memory(config);

    match args.command {
        Cmd::Templates { dir } => {
            let catalog = engine.catalog();
            let count = catalog
                .load_dir(&dir)
                .await
                .with_context(|| format!("loading templates from {}", dir.display()))?;
            info!(count, dir = %dir.display(), "Loaded templates");

            let summary: Vec<_> = catalog
                .list()
                .await?
                .into_iter()
                .map(|t| {
                    json!({
                        "path_id": t.path_id,
                        "name": t.name,
                        "version": t.version,
                        "published": t.published,
                        "steps": t.steps.len(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Cmd::Run { templates, script } => {
            engine
                .catalog()
                .load_dir(&templates)
                .await
                .with_context(|| format!("loading templates from {}", templates.display()))?;

            let content = std::fs::read_to_string(&script)
                .with_context(|| format!("reading script {}", script.display()))?;
            let parsed = Script::from_yaml(&content)
                .with_context(|| format!("parsing script {}", script.display()))?;

            let results = Runner::new(&engine).run(parsed).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }

    Ok(())
}
