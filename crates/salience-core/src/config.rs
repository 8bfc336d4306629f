//! Engine configuration: defaults, TOML files, `SALIENCE_*` environment
//! overrides.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::background::DEFAULT_BACKGROUND_FALLBACK_TOKENS;
use crate::dedup::DEFAULT_DEDUP_THRESHOLD;
use crate::domain::ConfigError;
use crate::retry::RetryPolicy;

pub const ENV_MAX_TOKENS: &str = "SALIENCE_MAX_TOKENS";
pub const ENV_DEDUP_THRESHOLD: &str = "SALIENCE_DEDUP_THRESHOLD";
pub const ENV_KEEP_RECENT_TURNS: &str = "SALIENCE_KEEP_RECENT_TURNS";
pub const ENV_BACKGROUND_FALLBACK_TOKENS: &str = "SALIENCE_BACKGROUND_FALLBACK_TOKENS";
pub const ENV_RETRY_MAX_ATTEMPTS: &str = "SALIENCE_RETRY_MAX_ATTEMPTS";
pub const ENV_RETRY_TIMEOUT_MS: &str = "SALIENCE_RETRY_TIMEOUT_MS";
pub const ENV_RETRY_BACKOFF_MS: &str = "SALIENCE_RETRY_BACKOFF_MS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Budget shared by the protected core and the salience set.
    pub max_tokens: usize,
    /// Cosine similarity at or above which candidates merge.
    pub dedup_threshold: f64,
    /// Trailing turns of each window kept raw instead of compressed.
    pub keep_recent_turns: usize,
    /// Token cap of the truncated background used when summarization fails.
    pub background_fallback_tokens: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tokens: 5_000,
            dedup_threshold: DEFAULT_DEDUP_THRESHOLD,
            keep_recent_turns: 3,
            background_fallback_tokens: DEFAULT_BACKGROUND_FALLBACK_TOKENS,
            retry: RetryPolicy::default(),
        }
    }
}

fn parse_var<T: FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    let parsed = value.trim().parse::<T>();
    parsed.map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value,
    })
}

impl EngineConfig {
    /// Defaults overridden by the process environment, then validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (keyed by `SALIENCE_*` names), then
    /// validate.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_MAX_TOKENS) {
            self.max_tokens = parse_var(ENV_MAX_TOKENS, v)?;
        }
        if let Some(v) = lookup(ENV_DEDUP_THRESHOLD) {
            self.dedup_threshold = parse_var(ENV_DEDUP_THRESHOLD, v)?;
        }
        if let Some(v) = lookup(ENV_KEEP_RECENT_TURNS) {
            self.keep_recent_turns = parse_var(ENV_KEEP_RECENT_TURNS, v)?;
        }
        if let Some(v) = lookup(ENV_BACKGROUND_FALLBACK_TOKENS) {
            self.background_fallback_tokens = parse_var(ENV_BACKGROUND_FALLBACK_TOKENS, v)?;
        }
        if let Some(v) = lookup(ENV_RETRY_MAX_ATTEMPTS) {
            self.retry.max_attempts = parse_var(ENV_RETRY_MAX_ATTEMPTS, v)?;
        }
        if let Some(v) = lookup(ENV_RETRY_TIMEOUT_MS) {
            self.retry.timeout_ms = parse_var(ENV_RETRY_TIMEOUT_MS, v)?;
        }
        if let Some(v) = lookup(ENV_RETRY_BACKOFF_MS) {
            self.retry.backoff_base_ms = parse_var(ENV_RETRY_BACKOFF_MS, v)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.dedup_threshold > 0.0 && self.dedup_threshold <= 1.0) {
            return Err(ConfigError::InvalidThreshold(self.dedup_threshold));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::ZeroBudget);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(())
    }
}
