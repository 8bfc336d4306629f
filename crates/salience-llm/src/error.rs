//! Error types for the HTTP capability binding.

use salience_core::CapabilityError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    /// `OPENAI_API_KEY` not set
    #[error("no API key configured (set OPENAI_API_KEY)")]
    MissingApiKey,

    /// Transport-level failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// Request exceeded the client timeout
    #[error("request timed out")]
    Timeout,

    /// Non-success status from the API
    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body did not have the expected shape
    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else if err.is_decode() {
            LlmError::Decode(err.to_string())
        } else {
            LlmError::Http(err.to_string())
        }
    }
}

impl From<LlmError> for CapabilityError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::MissingApiKey => CapabilityError::Unavailable(err.to_string()),
            LlmError::Timeout => CapabilityError::Timeout { elapsed_ms: 0 },
            LlmError::Status { status: 429, .. } => CapabilityError::RateLimited(err.to_string()),
            LlmError::Status {
                status: 401 | 403 | 404,
                ..
            } => CapabilityError::Unavailable(err.to_string()),
            LlmError::Status { .. } | LlmError::Http(_) => CapabilityError::Other(err.to_string()),
            LlmError::Decode(_) | LlmError::Json(_) => {
                CapabilityError::MalformedResponse(err.to_string())
            }
        }
    }
}
