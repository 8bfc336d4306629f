//! External capability seams.
//!
//! The engine treats language-model extraction, summarization, embeddings,
//! and drift judging as opaque, fallible services. Production bindings live
//! outside this crate; [`crate::fakes`] provides deterministic stand-ins.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{CapabilityError, Category, ConversationTurn};

/// Result type for capability calls.
pub type CapabilityResult<T> = std::result::Result<T, CapabilityError>;

/// Request to pull verbatim goal-critical quotes out of a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub window: Vec<ConversationTurn>,
    pub goal: String,
    pub constraints: Vec<String>,
    pub instruction: String,
}

/// One quote as returned by the extraction capability. Untrusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedQuote {
    pub quote: String,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub turn_id: Option<u64>,
    #[serde(default)]
    pub criticality: Option<f64>,
}

impl ExtractedQuote {
    pub fn new(quote: impl Into<String>) -> Self {
        Self {
            quote: quote.into(),
            category: None,
            turn_id: None,
            criticality: None,
        }
    }

    pub fn tagged(quote: impl Into<String>, category: Category) -> Self {
        Self {
            category: Some(category),
            ..Self::new(quote)
        }
    }

    pub fn from_turn(mut self, turn_id: u64) -> Self {
        self.turn_id = Some(turn_id);
        self
    }

    pub fn with_criticality(mut self, criticality: f64) -> Self {
        self.criticality = Some(criticality);
        self
    }
}

/// Request to condense background text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRequest {
    pub text: String,
}

/// Language-model extraction of salient quotes.
#[async_trait]
pub trait ExtractionModel: Send + Sync {
    async fn extract(&self, request: &ExtractionRequest) -> CapabilityResult<Vec<ExtractedQuote>>;
}

/// Language-model background summarization.
#[async_trait]
pub trait SummarizationModel: Send + Sync {
    async fn summarize(&self, request: &SummaryRequest) -> CapabilityResult<String>;
}

/// Text embeddings for semantic deduplication.
///
/// Must return exactly one vector per input text, in order.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    async fn embed(&self, texts: &[String]) -> CapabilityResult<Vec<Vec<f32>>>;
}

/// Judging capability used by drift measurement.
#[async_trait]
pub trait DriftJudge: Send + Sync {
    /// Semantic similarity of `stated` to `original_goal`, 0.0..=1.0.
    async fn goal_coherence(&self, original_goal: &str, stated: &str) -> CapabilityResult<f64>;

    /// Whether `statement` mentions or implies `constraint`.
    async fn constraint_recalled(&self, constraint: &str, statement: &str)
        -> CapabilityResult<bool>;

    /// Behavioural alignment of `response` with the goal, 1..=5.
    async fn behavior_alignment(
        &self,
        goal: &str,
        constraints: &[String],
        response: &str,
        test_context: &str,
    ) -> CapabilityResult<u8>;
}

/// The set of capabilities one engine instance is wired to.
#[derive(Clone)]
pub struct Capabilities {
    pub extractor: Arc<dyn ExtractionModel>,
    pub summarizer: Arc<dyn SummarizationModel>,
    pub embedder: Arc<dyn EmbeddingModel>,
    pub judge: Option<Arc<dyn DriftJudge>>,
}

impl Capabilities {
    pub fn new(
        extractor: Arc<dyn ExtractionModel>,
        summarizer: Arc<dyn SummarizationModel>,
        embedder: Arc<dyn EmbeddingModel>,
    ) -> Self {
        Self {
            extractor,
            summarizer,
            embedder,
            judge: None,
        }
    }

    pub fn with_judge(mut self, judge: Arc<dyn DriftJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Bind every capability to one client implementing all four traits.
    pub fn from_client<C>(client: Arc<C>) -> Self
    where
        C: ExtractionModel + SummarizationModel + EmbeddingModel + DriftJudge + 'static,
    {
        Self {
            extractor: client.clone(),
            summarizer: client.clone(),
            embedder: client.clone(),
            judge: Some(client),
        }
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("judge", &self.judge.is_some())
            .finish_non_exhaustive()
    }
}
