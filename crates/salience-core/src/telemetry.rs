//! Tracing subscriber setup for hosts embedding the engine.
//!
//! Directives come from `SALIENCE_LOG`, then `RUST_LOG`, then the default
//! level. The output format comes from `SALIENCE_LOG_FORMAT`
//! (`pretty`, `compact` or `json`).

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::domain::ConfigError;

pub const LOG_ENV: &str = "SALIENCE_LOG";
pub const LOG_FORMAT_ENV: &str = "SALIENCE_LOG_FORMAT";

/// Line format of the installed subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    /// Newline-delimited JSON, one object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::InvalidEnv {
                key: LOG_FORMAT_ENV.to_string(),
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Used when no directives are set, or when they fail to parse.
    pub level: Level,
    pub format: LogFormat,
    pub directives: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::default(),
            directives: None,
        }
    }
}

impl TelemetryConfig {
    pub fn new(level: Level, format: LogFormat) -> Self {
        Self {
            level,
            format,
            directives: None,
        }
    }

    pub fn from_env(level: Level) -> Result<Self, ConfigError> {
        Self::from_lookup(level, |key| std::env::var(key).ok())
    }

    /// Read the log variables through `lookup`. An unknown format is an error.
    pub fn from_lookup<F>(level: Level, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let format = match set(LOG_FORMAT_ENV) {
            Some(raw) => raw.parse()?,
            None => LogFormat::default(),
        };
        Ok(Self {
            level,
            format,
            directives: set(LOG_ENV).or_else(|| set("RUST_LOG")),
        })
    }

    pub fn filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.as_str());
        match &self.directives {
            Some(directives) => EnvFilter::try_new(directives).unwrap_or_else(|_| fallback()),
            None => fallback(),
        }
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let base = fmt::layer().with_target(false);
        match self.format {
            LogFormat::Pretty => base.with_filter(self.filter()).boxed(),
            LogFormat::Compact => base.compact().with_filter(self.filter()).boxed(),
            LogFormat::Json => base.json().with_filter(self.filter()).boxed(),
        }
    }
}

/// Install the global subscriber. Returns `false` when one was already set.
pub fn init_tracing(config: &TelemetryConfig) -> bool {
    tracing_subscriber::registry()
        .with(config.layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" compact ".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_salience_log_wins_over_rust_log() {
        let config = TelemetryConfig::from_lookup(
            Level::WARN,
            lookup(&[
                (LOG_ENV, "salience_core=debug"),
                ("RUST_LOG", "trace"),
                (LOG_FORMAT_ENV, "json"),
            ]),
        )
        .unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.directives.as_deref(), Some("salience_core=debug"));
        assert!(config.filter().to_string().contains("salience_core=debug"));
    }

    #[test]
    fn test_defaults_without_variables() {
        let config = TelemetryConfig::from_lookup(Level::DEBUG, lookup(&[])).unwrap();
        assert_eq!(config, TelemetryConfig::new(Level::DEBUG, LogFormat::Pretty));
        assert_eq!(config.filter().to_string().to_lowercase(), "debug");
    }

    #[test]
    fn test_unknown_format_rejected() {
        let err = TelemetryConfig::from_lookup(Level::INFO, lookup(&[(LOG_FORMAT_ENV, "xml")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_bad_directives_fall_back_to_level() {
        let config = TelemetryConfig {
            directives: Some("salience_core=loud".into()),
            ..TelemetryConfig::new(Level::WARN, LogFormat::Compact)
        };
        assert_eq!(config.filter().to_string().to_lowercase(), "warn");
    }
}
