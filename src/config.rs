//! Pipeline Configuration
//!
//! Runtime knobs read from the environment (after `dotenv`), each with a
//! default. A value that is present but unparseable is a configuration error
//! rather than silently falling back.

use crate::error::{PipelineError, Result};
use crate::security::ValidationLevel;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Settings for the OpenAI-compatible completion endpoint.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub default_validation_level: ValidationLevel,
    /// Shared repair budget per run.
    pub max_repair_attempts: u32,
    pub query_timeout: Duration,
    pub max_result_rows: usize,
    pub completion_timeout: Duration,
    pub max_concurrent_completions: usize,
    pub schema_cache_ttl: Duration,
    pub schema_timeout: Duration,
    pub history_timeout: Duration,
    /// Wall-clock budget of a whole run.
    pub run_timeout: Duration,
    /// Overrides the validator policy's ceiling when set.
    pub cost_ceiling: Option<f64>,
    pub max_tables_in_prompt: usize,
    pub max_exemplars: usize,
    pub outlier_sigma: f64,
    pub max_insights: usize,
    pub llm: LlmSettings,
    pub database_url: Option<String>,
    pub history_db_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_validation_level: ValidationLevel::Moderate,
            max_repair_attempts: 3,
            query_timeout: Duration::from_secs(30),
            max_result_rows: 1000,
            completion_timeout: Duration::from_secs(30),
            max_concurrent_completions: 8,
            schema_cache_ttl: Duration::from_secs(300),
            schema_timeout: Duration::from_secs(10),
            history_timeout: Duration::from_secs(5),
            run_timeout: Duration::from_secs(120),
            cost_ceiling: None,
            max_tables_in_prompt: 8,
            max_exemplars: 3,
            outlier_sigma: 2.0,
            max_insights: 3,
            llm: LlmSettings::default(),
            database_url: None,
            history_db_path: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source. Used by `from_env` and by tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Ok(Self {
            default_validation_level: parse_or(
                &get,
                "DEFAULT_VALIDATION_LEVEL",
                defaults.default_validation_level,
            )?,
            max_repair_attempts: parse_or(&get, "MAX_FIX_ATTEMPTS", defaults.max_repair_attempts)?,
            query_timeout: secs_or(&get, "QUERY_TIMEOUT", defaults.query_timeout)?,
            max_result_rows: parse_or(&get, "MAX_RESULT_ROWS", defaults.max_result_rows)?,
            completion_timeout: secs_or(&get, "COMPLETION_TIMEOUT", defaults.completion_timeout)?,
            max_concurrent_completions: parse_or(
                &get,
                "MAX_CONCURRENT_COMPLETIONS",
                defaults.max_concurrent_completions,
            )?,
            schema_cache_ttl: secs_or(&get, "SCHEMA_CACHE_TTL", defaults.schema_cache_ttl)?,
            schema_timeout: defaults.schema_timeout,
            history_timeout: defaults.history_timeout,
            run_timeout: secs_or(&get, "RUN_TIMEOUT", defaults.run_timeout)?,
            cost_ceiling: get("COST_CEILING")
                .map(|v| parse_value::<f64>("COST_CEILING", &v))
                .transpose()?,
            max_tables_in_prompt: defaults.max_tables_in_prompt,
            max_exemplars: defaults.max_exemplars,
            outlier_sigma: defaults.outlier_sigma,
            max_insights: defaults.max_insights,
            llm: LlmSettings {
                api_key: get("OPENAI_API_KEY"),
                model: get("OPENAI_MODEL").unwrap_or(defaults.llm.model),
                base_url: get("OPENAI_BASE_URL").unwrap_or(defaults.llm.base_url),
            },
            database_url: get("DATABASE_URL"),
            history_db_path: get("HISTORY_DB_PATH").map(PathBuf::from),
        })
    }

    pub fn with_max_repair_attempts(mut self, attempts: u32) -> Self {
        self.max_repair_attempts = attempts;
        self
    }

    pub fn with_validation_level(mut self, level: ValidationLevel) -> Self {
        self.default_validation_level = level;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| PipelineError::Config(format!("Invalid value for {}: '{}' ({})", key, raw, e)))
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

/// Upper bound for any timeout or TTL: one week.
const MAX_TIMEOUT_SECS: f64 = 7.0 * 24.0 * 3600.0;

fn secs_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => {
            let secs: f64 = parse_value(key, &raw)?;
            if !secs.is_finite() || secs <= 0.0 || secs > MAX_TIMEOUT_SECS {
                return Err(PipelineError::Config(format!(
                    "{} must be between 0 and {} seconds, got '{}'",
                    key, MAX_TIMEOUT_SECS, raw
                )));
            }
            Duration::try_from_secs_f64(secs)
                .map_err(|e| PipelineError::Config(format!("{} is not a valid duration: {}", key, e)))
        }
        None => Ok(default),
    }
}
