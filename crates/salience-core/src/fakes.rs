//! Deterministic in-memory capabilities (testing only).
//!
//! Each fake counts its calls so tests can assert on retry behaviour and on
//! which stages actually reached a capability.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::capability::{
    CapabilityResult, DriftJudge, EmbeddingModel, ExtractedQuote, ExtractionModel,
    ExtractionRequest, SummarizationModel, SummaryRequest,
};
use crate::domain::{normalize_whitespace, CapabilityError};

/// Dimension of the one-hot vectors handed out for unmapped texts/words.
pub const FAKE_EMBEDDING_DIM: usize = 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn one_hot(index: usize) -> Vec<f32> {
    let mut v = vec![0.0; FAKE_EMBEDDING_DIM];
    v[index % FAKE_EMBEDDING_DIM] = 1.0;
    v
}

/// Assigns a fresh dimension to every distinct key, in first-seen order.
#[derive(Debug, Default)]
struct Allocator {
    slots: Mutex<HashMap<String, usize>>,
}

impl Allocator {
    fn slot(&self, key: &str) -> usize {
        let mut slots = lock(&self.slots);
        let next = slots.len();
        *slots.entry(key.to_string()).or_insert(next)
    }
}

// ---------------------------------------------------------------------------
// Embedders
// ---------------------------------------------------------------------------

/// Embedder with a fixed text → vector table.
///
/// Unmapped texts get a one-hot vector of their own, so distinct unmapped
/// texts are orthogonal and never merge.
#[derive(Debug, Default)]
pub struct FixedEmbedder {
    table: HashMap<String, Vec<f32>>,
    unmapped: Allocator,
    calls: AtomicUsize,
}

impl FixedEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.table.insert(normalize_whitespace(text), vector);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let key = normalize_whitespace(text);
        match self.table.get(&key) {
            Some(v) => v.clone(),
            None => one_hot(self.unmapped.slot(&key)),
        }
    }
}

#[async_trait]
impl EmbeddingModel for FixedEmbedder {
    async fn embed(&self, texts: &[String]) -> CapabilityResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

/// Bag-of-words embedder: each lowercase alphanumeric word gets its own
/// dimension, so cosine similarity is word overlap.
#[derive(Debug, Default)]
pub struct KeywordEmbedder {
    words: Allocator,
}

impl KeywordEmbedder {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EmbeddingModel for KeywordEmbedder {
    async fn embed(&self, texts: &[String]) -> CapabilityResult<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0; FAKE_EMBEDDING_DIM];
                for word in text
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                {
                    let slot = self.words.slot(&word.to_lowercase());
                    v[slot % FAKE_EMBEDDING_DIM] += 1.0;
                }
                v
            })
            .collect())
    }
}

/// Embedder that is always down.
#[derive(Debug, Default)]
pub struct UnavailableEmbedder {
    calls: AtomicUsize,
}

impl UnavailableEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingModel for UnavailableEmbedder {
    async fn embed(&self, _texts: &[String]) -> CapabilityResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CapabilityError::Unavailable("embedding service offline".into()))
    }
}

// ---------------------------------------------------------------------------
// ScriptedExtractor
// ---------------------------------------------------------------------------

/// Extractor that replays a script of responses, one per call.
///
/// When the script runs out it answers with an empty list, or with the
/// configured permanent error.
#[derive(Debug, Default)]
pub struct ScriptedExtractor {
    script: Mutex<VecDeque<CapabilityResult<Vec<ExtractedQuote>>>>,
    exhausted: Option<CapabilityError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ExtractionRequest>>,
}

impl ScriptedExtractor {
    pub fn new(script: Vec<CapabilityResult<Vec<ExtractedQuote>>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub fn always_failing(error: CapabilityError) -> Self {
        Self {
            exhausted: Some(error),
            ..Self::default()
        }
    }

    /// Sleep before every answer (for timeout tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ExtractionRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl ExtractionModel for ScriptedExtractor {
    async fn extract(&self, request: &ExtractionRequest) -> CapabilityResult<Vec<ExtractedQuote>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = lock(&self.script).pop_front();
        match next {
            Some(response) => response,
            None => match &self.exhausted {
                Some(err) => Err(err.clone()),
                None => Ok(Vec::new()),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedSummarizer
// ---------------------------------------------------------------------------

/// Summarizer returning a fixed text, or failing every call.
#[derive(Debug)]
pub struct ScriptedSummarizer {
    reply: CapabilityResult<String>,
    calls: AtomicUsize,
    requests: Mutex<Vec<SummaryRequest>>,
}

impl ScriptedSummarizer {
    pub fn fixed(summary: impl Into<String>) -> Self {
        Self {
            reply: Ok(summary.into()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: CapabilityError) -> Self {
        Self {
            reply: Err(error),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SummaryRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl SummarizationModel for ScriptedSummarizer {
    async fn summarize(&self, request: &SummaryRequest) -> CapabilityResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(request.clone());
        self.reply.clone()
    }
}

// ---------------------------------------------------------------------------
// ScriptedJudge
// ---------------------------------------------------------------------------

/// Drift judge with fixed verdicts.
#[derive(Debug)]
pub struct ScriptedJudge {
    pub coherence: f64,
    pub recalled: bool,
    pub alignment: u8,
    failure: Option<CapabilityError>,
    calls: AtomicUsize,
}

impl Default for ScriptedJudge {
    fn default() -> Self {
        Self {
            coherence: 1.0,
            recalled: true,
            alignment: 5,
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }
}

impl ScriptedJudge {
    pub fn new(coherence: f64, recalled: bool, alignment: u8) -> Self {
        Self {
            coherence,
            recalled,
            alignment,
            ..Self::default()
        }
    }

    pub fn failing(error: CapabilityError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer<T>(&self, value: T) -> CapabilityResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(value),
        }
    }
}

#[async_trait]
impl DriftJudge for ScriptedJudge {
    async fn goal_coherence(&self, _original_goal: &str, _stated: &str) -> CapabilityResult<f64> {
        self.answer(self.coherence)
    }

    async fn constraint_recalled(
        &self,
        _constraint: &str,
        _statement: &str,
    ) -> CapabilityResult<bool> {
        self.answer(self.recalled)
    }

    async fn behavior_alignment(
        &self,
        _goal: &str,
        _constraints: &[String],
        _response: &str,
        _test_context: &str,
    ) -> CapabilityResult<u8> {
        self.answer(self.alignment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_embedder_unmapped_texts_are_orthogonal() {
        let e = FixedEmbedder::new().with("known", vec![1.0, 0.0]);
        let out = e
            .embed(&["known".to_string(), "x".to_string(), "y".to_string(), "x".to_string()])
            .await
            .unwrap();
        assert_eq!(out[0], vec![1.0, 0.0]);
        assert_ne!(out[1], out[2]);
        assert_eq!(out[1], out[3]);
        assert_eq!(e.calls(), 1);
    }

    #[tokio::test]
    async fn test_keyword_embedder_counts_shared_words() {
        let e = KeywordEmbedder::new();
        let out = e
            .embed(&["The budget".to_string(), "budget the".to_string()])
            .await
            .unwrap();
        assert_eq!(out[0], out[1]);
    }

    #[tokio::test]
    async fn test_scripted_extractor_replays_then_falls_back() {
        let x = ScriptedExtractor::new(vec![Err(CapabilityError::RateLimited("slow down".into()))]);
        let req = ExtractionRequest {
            window: Vec::new(),
            goal: String::new(),
            constraints: Vec::new(),
            instruction: String::new(),
        };
        assert!(x.extract(&req).await.is_err());
        assert!(x.extract(&req).await.unwrap().is_empty());
        assert_eq!(x.calls(), 2);
    }
}
