//! Engine Configuration
//!
//! Defaults can be overridden from the environment or a YAML file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

const DEFAULT_SELF_HEAL_DELAYS_MS: [u64; 3] = [250, 1_000, 3_000];
const DEFAULT_TEMPLATE_POLL_DELAYS_MS: [u64; 3] = [100, 400, 1_200];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for the audit engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay before each self-heal seeding attempt
    pub self_heal_delays_ms: Vec<u64>,
    /// Delay before each visibility poll after creating a template
    pub template_poll_delays_ms: Vec<u64>,
    /// Writing `output` to a not-started step also starts it
    pub output_starts_work: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            self_heal_delays_ms: std::env::var("AUDIT_SELF_HEAL_DELAYS_MS")
                .ok()
                .and_then(|s| parse_delays(&s))
                .unwrap_or_else(|| DEFAULT_SELF_HEAL_DELAYS_MS.to_vec()),
            template_poll_delays_ms: std::env::var("AUDIT_TEMPLATE_POLL_DELAYS_MS")
                .ok()
                .and_then(|s| parse_delays(&s))
                .unwrap_or_else(|| DEFAULT_TEMPLATE_POLL_DELAYS_MS.to_vec()),
            output_starts_work: std::env::var("AUDIT_OUTPUT_STARTS_WORK")
                .ok()
                .and_then(|s| parse_bool(&s))
                .unwrap_or(false),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Both schedules must allow at least one attempt
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.self_heal_delays_ms.is_empty() {
            return Err(ConfigError::Invalid(
                "self_heal_delays_ms must contain at least one delay".to_string(),
            ));
        }
        if self.template_poll_delays_ms.is_empty() {
            return Err(ConfigError::Invalid(
                "template_poll_delays_ms must contain at least one delay".to_string(),
            ));
        }
        Ok(())
    }

    pub fn self_heal_policy(&self) -> RetryPolicy {
        RetryPolicy::from_millis("self_heal_seed", &self.self_heal_delays_ms)
    }

    pub fn template_poll_policy(&self) -> RetryPolicy {
        RetryPolicy::from_millis("template_visibility", &self.template_poll_delays_ms)
    }
}

/// Parse "250,1000,3000"; `None` for empty or malformed input
fn parse_delays(s: &str) -> Option<Vec<u64>> {
    let delays: Result<Vec<u64>, _> = s
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::parse)
        .collect();
    delays.ok().filter(|d| !d.is_empty())
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_delays() {
        assert_eq!(parse_delays("250, 1000,3000"), Some(vec![250, 1000, 3000]));
        assert_eq!(parse_delays(""), None);
        assert_eq!(parse_delays("10,abc"), None);
    }

    #[test]
    fn test_yaml_overrides_and_defaults() {
        let config = EngineConfig::from_yaml_str(
            "self_heal_delays_ms: [5, 10]\noutput_starts_work: true\n",
        )
        .unwrap();
        assert_eq!(config.self_heal_delays_ms, vec![5, 10]);
        assert!(config.output_starts_work);
        assert!(!config.template_poll_delays_ms.is_empty());

        let policy = config.self_heal_policy();
        assert_eq!(policy.max_attempts(), 2);
        assert_eq!(policy.delays[1], Duration::from_millis(10));
    }

    #[test]
    fn test_empty_schedule_rejected() {
        let result = EngineConfig::from_yaml_str("template_poll_delays_ms: []\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
