//! Selective salience compression.
//!
//! At each compression point the engine keeps goal-critical fragments of the
//! conversation verbatim, folds them into a deduplicated, token-bounded
//! salience set, summarizes the rest, and assembles
//! `protected core + salience set + background`. Every external failure
//! degrades to a well-formed context that still carries the protected core.
//!
//! ## Key Components
//!
//! - [`Session`]: per-conversation handle (initialize, ingest, compress, drift)
//! - [`SalienceSetManager`]: single-writer, copy-on-read salience set
//! - [`CompressionOrchestrator`]: the compression state machine
//! - [`capability`]: traits the host binds to real model services

pub mod background;
pub mod budget;
pub mod capability;
pub mod config;
pub mod context;
pub mod dedup;
pub mod domain;
pub mod drift;
pub mod extractor;
pub mod fakes;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod protected_core;
pub mod retry;
pub mod salience_set;
pub mod session;
pub mod telemetry;
pub mod tokens;

pub use background::{BackgroundCompressor, BackgroundOutcome};
pub use budget::{TokenBudget, TokenBudgetEnforcer};
pub use capability::{
    Capabilities, CapabilityResult, DriftJudge, EmbeddingModel, ExtractedQuote, ExtractionModel,
    ExtractionRequest, SummarizationModel, SummaryRequest,
};
pub use config::EngineConfig;
pub use context::CompressedContext;
pub use dedup::{cosine_similarity, DedupDecision, Deduplicator};
pub use domain::{
    CapabilityError, Category, CompressionEvent, CompressionState, ConfigError, ConversationTurn,
    Role, SalienceError, SalienceItem, StateTransition, ValidationError,
};
pub use drift::{BehaviorSample, DriftMeasurement, DriftMeasurer, DriftResult};
pub use extractor::{parse_extraction_response, ExtractionOutcome, SalienceExtractor};
pub use orchestrator::{CompressionOrchestrator, CompressionOutcome, CompressionRequest};
pub use protected_core::ProtectedCore;
pub use retry::RetryPolicy;
pub use salience_set::{MergeReport, SalienceSet, SalienceSetManager};
pub use session::{Session, SessionStats};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
pub use tokens::estimate_tokens;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
