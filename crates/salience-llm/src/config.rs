//! Connection settings for an OpenAI-compatible API.

use serde::{Deserialize, Serialize};

pub const ENV_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_BASE_URL: &str = "OPENAI_BASE_URL";
pub const ENV_EXTRACTION_MODEL: &str = "SALIENCE_EXTRACTION_MODEL";
pub const ENV_COMPRESSION_MODEL: &str = "SALIENCE_COMPRESSION_MODEL";
pub const ENV_EMBEDDING_MODEL: &str = "SALIENCE_EMBEDDING_MODEL";
pub const ENV_JUDGE_MODEL: &str = "SALIENCE_JUDGE_MODEL";

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    /// Model used for salience extraction
    pub extraction_model: String,
    /// Cheaper model used for background summaries
    pub compression_model: String,
    pub embedding_model: String,
    pub judge_model: String,
    pub request_timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

impl OpenAiConfig {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Build from an arbitrary variable source (keys as in the environment).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let or = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        OpenAiConfig {
            api_key: lookup(ENV_API_KEY).filter(|k| !k.trim().is_empty()),
            base_url: or(ENV_BASE_URL, DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            extraction_model: or(ENV_EXTRACTION_MODEL, "gpt-4o"),
            compression_model: or(ENV_COMPRESSION_MODEL, "gpt-4o-mini"),
            embedding_model: or(ENV_EMBEDDING_MODEL, "text-embedding-3-small"),
            judge_model: or(ENV_JUDGE_MODEL, "gpt-4o"),
            request_timeout_secs: 60,
        }
    }

    /// Config for a specific endpoint, default models.
    pub fn new(base_url: &str, api_key: &str) -> Self {
        OpenAiConfig {
            api_key: Some(api_key.to_string()),
            base_url: base_url.trim_end_matches('/').to_string(),
            ..Self::from_lookup(|_| None)
        }
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        let c = OpenAiConfig::from_lookup(|_| None);
        assert_eq!(c.api_key, None);
        assert_eq!(c.base_url, DEFAULT_BASE_URL);
        assert_eq!(c.extraction_model, "gpt-4o");
        assert_eq!(c.compression_model, "gpt-4o-mini");
        assert_eq!(c.embedding_model, "text-embedding-3-small");
        assert_eq!(c.judge_model, "gpt-4o");
    }

    #[test]
    fn test_lookup_overrides() {
        let c = OpenAiConfig::from_lookup(|k| match k {
            ENV_API_KEY => Some("sk-test".into()),
            ENV_BASE_URL => Some("http://localhost:8080/v1/".into()),
            ENV_JUDGE_MODEL => Some("   ".into()),
            _ => None,
        });
        assert_eq!(c.api_key.as_deref(), Some("sk-test"));
        assert_eq!(c.endpoint("/chat/completions"), "http://localhost:8080/v1/chat/completions");
        assert_eq!(c.judge_model, "gpt-4o");
    }

    #[test]
    fn test_api_key_never_serialized() {
        let c = OpenAiConfig::new("http://x", "sk-secret");
        let json = serde_json::to_string(&c).unwrap();
        assert!(!json.contains("sk-secret"));
    }
}
