//! Error taxonomy for the salience engine.
//!
//! None of these reach the caller of a compression: external failures are
//! absorbed by component fallbacks, validation failures drop the offending
//! quote, and corrupted state forces a reset. They surface through logs and
//! the compression event log instead.

/// Failure of an external capability call (model, embeddings, judge).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapabilityError {
    #[error("capability call timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("capability unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("capability failed: {0}")]
    Other(String),
}

impl CapabilityError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        // Every external failure is worth retrying except a service that
        // reports itself as unconfigured/absent.
        !matches!(self, Self::Unavailable(_))
    }
}

/// A quote returned by extraction that cannot enter the salience set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("quote is empty")]
    EmptyQuote,

    #[error("quote not found verbatim in any turn of the window: {quote}")]
    QuoteNotFound { quote: String },

    #[error("quote cites turn {turn_id} which is not in the window")]
    UnknownTurn { turn_id: u64 },

    #[error("turn {turn_id} arrived after turn {last_turn_id}; ids must increase")]
    OutOfOrderTurn { turn_id: u64, last_turn_id: u64 },
}

/// The salience set's bookkeeping no longer matches its contents.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SalienceError {
    #[error("token accounting mismatch: recorded {recorded}, actual {actual}")]
    TokenAccountingMismatch { recorded: usize, actual: usize },

    #[error("budget invariant violated: {used} tokens used, {max} allowed")]
    BudgetViolated { used: usize, max: usize },

    #[error("duplicate item id in set: {id}")]
    DuplicateId { id: String },
}

/// Invalid engine configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("dedup threshold must be in (0, 1], got {0}")]
    InvalidThreshold(f64),

    #[error("max_tokens must be greater than zero")]
    ZeroBudget,

    #[error("retry.max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
