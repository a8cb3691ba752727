//! Configuration loading from TOML.
//!
//! Reads `config.toml` (or the path in `YIELDRANK_CONFIG`) and
//! deserializes into strongly-typed structs.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

use crate::types::{RiskTolerance, UserProfile, YieldError};

/// Environment variable overriding the config file path.
pub const CONFIG_PATH_ENV: &str = "YIELDRANK_CONFIG";

/// Default config file path.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub source: SourceConfig,
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub profiles: ProfilesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub pools_url: String,
    pub protocol_url: String,
    pub chart_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// SQLite URL, e.g. `sqlite://yieldrank.db?mode=rwc` or `sqlite::memory:`.
    pub database_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    pub pull_interval_secs: u64,
    pub pull_limit: usize,
    pub top_n: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub poll_interval_ms: u64,
    pub stale_after_secs: u64,
}

/// Fallback profile used when no user-specific profile is known.
#[derive(Debug, Deserialize, Clone)]
pub struct ProfilesConfig {
    pub experience_level: String,
    pub primary_goal: String,
    pub risk_tolerance: String,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        let p = UserProfile::default();
        Self {
            experience_level: p.experience_level,
            primary_goal: p.primary_goal,
            risk_tolerance: p.risk_tolerance.to_string(),
        }
    }
}

impl ProfilesConfig {
    pub fn to_profile(&self) -> Result<UserProfile, YieldError> {
        Ok(UserProfile {
            experience_level: self.experience_level.clone(),
            primary_goal: self.primary_goal.clone(),
            risk_tolerance: self.risk_tolerance.parse::<RiskTolerance>()?,
        })
    }
}

fn default_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Load from `YIELDRANK_CONFIG`, falling back to `config.toml`.
    pub fn load_default() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(&path)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall the pipeline.
    pub fn validate(&self) -> Result<(), YieldError> {
        if self.source.timeout_secs == 0 {
            return Err(YieldError::Config("source.timeout_secs must be > 0".into()));
        }
        if self.worker.concurrency == 0 {
            return Err(YieldError::Config("worker.concurrency must be > 0".into()));
        }
        if self.worker.max_attempts == 0 {
            return Err(YieldError::Config("worker.max_attempts must be > 0".into()));
        }
        if self.ingest.pull_interval_secs == 0 {
            return Err(YieldError::Config("ingest.pull_interval_secs must be > 0".into()));
        }
        self.profiles.to_profile()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [service]
        name = "YIELDRANK-TEST"

        [source]
        pools_url = "https://yields.llama.fi/pools"
        protocol_url = "https://api.llama.fi/protocol"
        chart_url = "https://yields.llama.fi/chart"

        [storage]
        database_url = "sqlite::memory:"

        [ingest]
        pull_interval_secs = 60
        pull_limit = 25
        top_n = 5

        [worker]
        concurrency = 2
        max_attempts = 3
        backoff_base_secs = 5
        backoff_max_secs = 60
        poll_interval_ms = 100
        stale_after_secs = 300
    "#;

    #[test]
    fn test_parse_sample() {
        let cfg = AppConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(cfg.service.name, "YIELDRANK-TEST");
        assert_eq!(cfg.source.timeout_secs, 30);
        assert_eq!(cfg.ingest.pull_limit, 25);
        assert_eq!(cfg.worker.max_attempts, 3);
        let profile = cfg.profiles.to_profile().unwrap();
        assert_eq!(profile.risk_tolerance, RiskTolerance::Low);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let bad = SAMPLE.replace("concurrency = 2", "concurrency = 0");
        assert!(AppConfig::from_toml(&bad).is_err());
    }

    #[test]
    fn test_unknown_tolerance_rejected() {
        let bad = format!(
            "{SAMPLE}\n[profiles]\nexperience_level = \"expert\"\nprimary_goal = \"max\"\nrisk_tolerance = \"reckless\"\n"
        );
        assert!(AppConfig::from_toml(&bad).is_err());
    }

    #[test]
    fn test_load_repo_config() {
        // Requires config.toml in the working directory (true under `cargo test`).
        if let Ok(cfg) = AppConfig::load("config.toml") {
            assert_eq!(cfg.source.timeout_secs, 30);
            assert!(cfg.worker.concurrency > 0);
        }
    }

    #[test]
    fn test_missing_file_errors() {
        assert!(AppConfig::load("/tmp/yieldrank_no_such_config.toml").is_err());
    }
}
