#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::agent::AgentInterval;
use crate::error::{Result, SchedulerError};
use crate::scheduler::{enabled_agent_pattern, ControlLoopConfig};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = ".agent-scheduler/config.toml";

const KEYS: &[&str] = &[
    "database_url",
    "tick_interval_secs",
    "deleted_retention_secs",
    "pending_staleness_secs",
    "default_interval_secs",
    "default_timeout_secs",
    "default_error_interval_secs",
    "enabled_agent_pattern",
    "percent_max_over_normal_duration",
    "runner_workers",
    "max_redeliveries",
    "poll_interval_ms",
];

/// Contents of `.agent-scheduler/config.toml`. Every key is optional and
/// unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub database_url: Option<String>,
    pub tick_interval_secs: u64,
    pub deleted_retention_secs: u64,
    pub pending_staleness_secs: u64,
    pub default_interval_secs: u64,
    pub default_timeout_secs: u64,
    /// Retry spacing after a failure; falls back to `default_interval_secs`.
    pub default_error_interval_secs: Option<u64>,
    /// Regex an agent type (lowercased) must fully match to be scheduled.
    pub enabled_agent_pattern: Option<String>,
    pub percent_max_over_normal_duration: f64,
    pub runner_workers: usize,
    pub max_redeliveries: u32,
    pub poll_interval_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            tick_interval_secs: 15,
            deleted_retention_secs: 3 * 60 * 60,
            pending_staleness_secs: 20 * 60,
            default_interval_secs: 60,
            default_timeout_secs: 30 * 60,
            default_error_interval_secs: None,
            enabled_agent_pattern: None,
            percent_max_over_normal_duration: 1.5,
            runner_workers: 4,
            max_redeliveries: 0,
            poll_interval_ms: 1_000,
        }
    }
}

/// Load settings from `path` (or the project default), then apply
/// `SCHEDULER_*` environment overrides. A missing file yields defaults.
///
/// # Errors
/// Returns `ConfigError` if the file cannot be read or a value does not parse.
pub async fn load_settings(path: Option<PathBuf>) -> Result<SchedulerSettings> {
    let config_path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let from_file = read_settings_file(&config_path).await?;
    let settings = from_file.with_overrides_from(|key| std::env::var(key).ok())?;
    settings.validate()?;
    Ok(settings)
}

async fn read_settings_file(path: &Path) -> Result<SchedulerSettings> {
    if !path.exists() {
        debug!(path = %path.display(), "no scheduler config file; using defaults");
        return Ok(SchedulerSettings::default());
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SchedulerError::ConfigError(format!("Failed to read config: {e}")))?;
    parse_settings_content(&content)
}

/// Parse the TOML config. `${VAR:-default}` references in `database_url`
/// are expanded.
///
/// # Errors
/// Returns `ConfigError` for invalid TOML or values of the wrong type.
pub fn parse_settings_content(content: &str) -> Result<SchedulerSettings> {
    let mut settings: SchedulerSettings = toml::from_str(content)
        .map_err(|e| SchedulerError::ConfigError(format!("Invalid config file: {e}")))?;
    settings.database_url = settings.database_url.as_deref().map(expand_env_vars);
    Ok(settings)
}

impl SchedulerSettings {
    /// Overlay `SCHEDULER_<KEY>` values from `env_lookup`.
    ///
    /// # Errors
    /// Returns `ConfigError` if an override does not parse.
    pub fn with_overrides_from<F>(mut self, env_lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in KEYS {
            let var = format!("SCHEDULER_{}", key.to_ascii_uppercase());
            if let Some(value) = env_lookup(&var).filter(|value| !value.trim().is_empty()) {
                self.apply(key, value.trim())?;
            }
        }
        Ok(self)
    }

    /// # Errors
    /// Returns `ConfigError` when a value is outside its usable range.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_secs == 0 {
            return Err(invalid("tick_interval_secs", "0"));
        }
        if self.runner_workers == 0 {
            return Err(invalid("runner_workers", "0"));
        }
        if !self.percent_max_over_normal_duration.is_finite()
            || self.percent_max_over_normal_duration <= 0.0
        {
            return Err(invalid(
                "percent_max_over_normal_duration",
                &self.percent_max_over_normal_duration.to_string(),
            ));
        }
        self.enabled_agents()?;
        Ok(())
    }

    #[must_use]
    pub const fn control_loop(&self) -> ControlLoopConfig {
        ControlLoopConfig {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            deleted_retention: Duration::from_secs(self.deleted_retention_secs),
            pending_staleness: Duration::from_secs(self.pending_staleness_secs),
        }
    }

    #[must_use]
    pub fn default_interval(&self) -> AgentInterval {
        let interval = AgentInterval::new(
            Duration::from_secs(self.default_interval_secs),
            Duration::from_secs(self.default_timeout_secs),
        );
        match self.default_error_interval_secs {
            Some(secs) => interval.with_error_interval(Duration::from_secs(secs)),
            None => interval,
        }
    }

    /// # Errors
    /// Returns `ConfigError` if `enabled_agent_pattern` is not a valid regex.
    pub fn enabled_agents(&self) -> Result<Option<Regex>> {
        self.enabled_agent_pattern
            .as_deref()
            .map(enabled_agent_pattern)
            .transpose()
    }

    #[must_use]
    pub const fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Database URLs to try, most specific first.
    #[must_use]
    pub fn database_url_candidates(&self) -> Vec<String> {
        let mut candidates = Vec::new();
        push_unique(&mut candidates, non_empty_env_var("DATABASE_URL"));
        push_unique(
            &mut candidates,
            self.database_url
                .as_deref()
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string),
        );
        push_unique(&mut candidates, Some(computed_default_database_url()));
        candidates
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "database_url" => self.database_url = Some(value.to_string()),
            "tick_interval_secs" => self.tick_interval_secs = parse_value(key, value)?,
            "deleted_retention_secs" => self.deleted_retention_secs = parse_value(key, value)?,
            "pending_staleness_secs" => self.pending_staleness_secs = parse_value(key, value)?,
            "default_interval_secs" => self.default_interval_secs = parse_value(key, value)?,
            "default_timeout_secs" => self.default_timeout_secs = parse_value(key, value)?,
            "default_error_interval_secs" => {
                self.default_error_interval_secs = Some(parse_value(key, value)?);
            }
            "enabled_agent_pattern" => self.enabled_agent_pattern = Some(value.to_string()),
            "percent_max_over_normal_duration" => {
                self.percent_max_over_normal_duration = parse_value(key, value)?;
            }
            "runner_workers" => self.runner_workers = parse_value(key, value)?,
            "max_redeliveries" => self.max_redeliveries = parse_value(key, value)?,
            "poll_interval_ms" => self.poll_interval_ms = parse_value(key, value)?,
            other => debug!(key = other, "ignoring unknown config key"),
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> SchedulerError {
    SchedulerError::ConfigError(format!("Invalid value for {key}: {value}"))
}

fn expand_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    while let Some(start) = result.find("${") {
        if let Some(end) = result[start..].find('}') {
            let var_part = &result[start + 2..start + end];
            let (var_name, default) = var_part.split_once(":-").unwrap_or((var_part, ""));
            let value = std::env::var(var_name).unwrap_or_else(|_| default.to_string());
            result.replace_range(start..=(start + end), &value);
        } else {
            break;
        }
    }
    result
}

fn push_unique(target: &mut Vec<String>, value: Option<String>) {
    if let Some(candidate) = value {
        if !target.iter().any(|existing| existing == &candidate) {
            target.push(candidate);
        }
    }
}

fn non_empty_env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn computed_default_database_url() -> String {
    let user = std::env::var("SCHEDULER_DB_USER").unwrap_or_else(|_| "agent_scheduler".to_string());
    let pass =
        std::env::var("SCHEDULER_DB_PASSWORD").unwrap_or_else(|_| "agent_scheduler".to_string());
    let host = std::env::var("SCHEDULER_DB_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("SCHEDULER_DB_PORT").unwrap_or_else(|_| "5432".to_string());
    let db = std::env::var("SCHEDULER_DB_NAME").unwrap_or_else(|_| "agent_scheduler".to_string());
    format!("postgres://{user}:{pass}@{host}:{port}/{db}")
}
