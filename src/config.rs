//! Engine configuration
//!
//! Loaded from defaults, a YAML file, or `CONDUCTOR_*` environment variables
//! (a `.env` file is honoured).

use crate::error::{Error, Result};
use crate::scoring::ScoringPolicy;
use crate::tracing_ext::{LogFormat, LoggingConfig};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "CONDUCTOR_";

/// Orchestration engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-agent-call timeout in milliseconds
    pub call_timeout_ms: u64,
    /// Whole-run timeout in milliseconds
    pub run_timeout_ms: u64,
    /// Buffered events per run subscriber before lagging
    pub event_capacity: usize,
    /// Finished runs kept in memory for inspection; older ones are read
    /// back from the repository
    pub retain_finished_runs: usize,
    /// Similarity policy for consensus scoring
    pub scoring: ScoringPolicy,
    /// Logging setup
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 60_000,
            run_timeout_ms: 300_000,
            event_capacity: 256,
            retain_finished_runs: 64,
            scoring: ScoringPolicy::Exact,
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Per-agent-call timeout
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Whole-run timeout
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    /// Set the per-call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the run timeout
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set how many finished runs stay in memory
    pub fn with_retained_runs(mut self, count: usize) -> Self {
        self.retain_finished_runs = count;
        self
    }

    /// Set the scoring policy
    pub fn with_scoring(mut self, scoring: ScoringPolicy) -> Self {
        self.scoring = scoring;
        self
    }

    /// Load configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::config(format!("Failed to read file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from the environment, starting from defaults
    pub fn from_env() -> Result<Self> {
        // Load .env if present
        let _ = dotenv();
        Self::from_vars(std::env::vars())
    }

    /// Apply `CONDUCTOR_*` variables from an iterator over defaults
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let mut config = Self::default();

        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "CALL_TIMEOUT_MS" => config.call_timeout_ms = parse_var(&key, &value)?,
                "RUN_TIMEOUT_MS" => config.run_timeout_ms = parse_var(&key, &value)?,
                "EVENT_CAPACITY" => config.event_capacity = parse_var(&key, &value)?,
                "RETAIN_FINISHED_RUNS" => config.retain_finished_runs = parse_var(&key, &value)?,
                "SCORING" => config.scoring = parse_var(&key, &value)?,
                "LOG" => config.logging.filter = value,
                "LOG_FORMAT" => config.logging.format = parse_var::<LogFormat>(&key, &value)?,
                _ => tracing::debug!(variable = %key, "Ignoring unknown configuration variable"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.call_timeout_ms == 0 {
            return Err(Error::config("call_timeout_ms must be greater than zero"));
        }
        if self.run_timeout_ms == 0 {
            return Err(Error::config("run_timeout_ms must be greater than zero"));
        }
        if self.event_capacity == 0 {
            return Err(Error::config("event_capacity must be greater than zero"));
        }
        Ok(())
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("Invalid value for {}: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.call_timeout(), Duration::from_secs(60));
        assert_eq!(config.run_timeout(), Duration::from_secs(300));
        assert_eq!(config.scoring, ScoringPolicy::Exact);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
call_timeout_ms: 1500
scoring: token_overlap
logging:
  format: json
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.call_timeout(), Duration::from_millis(1500));
        assert_eq!(config.run_timeout_ms, 300_000);
        assert_eq!(config.scoring, ScoringPolicy::TokenOverlap);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.filter, "agent_conductor=info");
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(matches!(
            EngineConfig::from_yaml("run_timeout_ms: 0"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_environment_overrides() {
        let config = EngineConfig::from_vars(vars(&[
            ("CONDUCTOR_CALL_TIMEOUT_MS", "250"),
            ("CONDUCTOR_SCORING", "normalized"),
            ("CONDUCTOR_RETAIN_FINISHED_RUNS", "0"),
            ("CONDUCTOR_LOG", "agent_conductor=trace"),
            ("CONDUCTOR_LOG_FORMAT", "json"),
            ("UNRELATED", "x"),
        ]))
        .unwrap();
        assert_eq!(config.call_timeout_ms, 250);
        assert_eq!(config.scoring, ScoringPolicy::Normalized);
        assert_eq!(config.retain_finished_runs, 0);
        assert_eq!(config.logging.filter, "agent_conductor=trace");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_bad_environment_value() {
        let err = EngineConfig::from_vars(vars(&[("CONDUCTOR_EVENT_CAPACITY", "lots")])).unwrap_err();
        assert!(err.to_string().contains("CONDUCTOR_EVENT_CAPACITY"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.yaml");
        std::fs::write(&path, "event_capacity: 16\n").unwrap();
        assert_eq!(EngineConfig::from_file(&path).unwrap().event_capacity, 16);
    }
}
