//! Semantic deduplication of salience candidates.
//!
//! Embedding work happens in [`Deduplicator::prepare`], the only suspension
//! point; [`Deduplicator::apply`] is pure and runs against a working copy of
//! the set, so a cancelled merge never leaves partial state behind.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::capability::EmbeddingModel;
use crate::domain::SalienceItem;
use crate::obs;
use crate::retry::RetryPolicy;
use crate::salience_set::SalienceSet;

/// Default cosine similarity at or above which two items are duplicates.
pub const DEFAULT_DEDUP_THRESHOLD: f64 = 0.85;

/// Default number of texts sent per embedding request.
pub const DEFAULT_EMBED_BATCH: usize = 64;

/// What happened to one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum DedupDecision {
    /// No existing item was similar enough.
    Inserted {
        id: String,
        best_similarity: Option<f64>,
    },
    /// Folded into an existing item.
    Merged { into: String, similarity: f64 },
    /// No embedding was available; inserted without comparison.
    InsertedUnconditionally { id: String },
}

impl DedupDecision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Inserted { .. } => "inserted",
            Self::Merged { .. } => "merged",
            Self::InsertedUnconditionally { .. } => "inserted_unconditionally",
        }
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, Self::Merged { .. })
    }
}

/// Candidates with embeddings attached, plus embeddings for existing items
/// that were inserted while the embedding service was down.
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    pub candidates: Vec<SalienceItem>,
    pub backfill: Vec<(String, Vec<f32>)>,
    pub embeddings_available: bool,
}

/// Cosine similarity, accumulated and returned in f64 so the threshold
/// comparison sees no f32 rounding; 0.0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Embedding-similarity deduplicator.
#[derive(Clone)]
pub struct Deduplicator {
    embedder: Arc<dyn EmbeddingModel>,
    threshold: f64,
    batch_size: usize,
    retry: RetryPolicy,
}

impl Deduplicator {
    pub fn new(embedder: Arc<dyn EmbeddingModel>, threshold: f64, retry: RetryPolicy) -> Self {
        Self {
            embedder,
            threshold,
            batch_size: DEFAULT_EMBED_BATCH,
            retry,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Embed all candidates and any unembedded existing items.
    ///
    /// Embedding failure is not an error: the batch comes back with
    /// `embeddings_available == false` and candidates are inserted as-is.
    pub async fn prepare(&self, set: &SalienceSet, candidates: Vec<SalienceItem>) -> PreparedBatch {
        let missing: Vec<&SalienceItem> = set.iter().filter(|i| !i.has_embedding()).collect();
        let mut texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        texts.extend(missing.iter().map(|i| i.text.clone()));

        if texts.is_empty() {
            return PreparedBatch {
                candidates,
                backfill: Vec::new(),
                embeddings_available: true,
            };
        }

        let Some(mut vectors) = self.embed_all(&texts).await else {
            return PreparedBatch {
                candidates,
                backfill: Vec::new(),
                embeddings_available: false,
            };
        };

        let backfill_vectors = vectors.split_off(candidates.len());
        let backfill = missing
            .iter()
            .map(|i| i.id.clone())
            .zip(backfill_vectors)
            .collect();
        let candidates = candidates
            .into_iter()
            .zip(vectors)
            .map(|(c, v)| c.with_embedding(v))
            .collect();

        PreparedBatch {
            candidates,
            backfill,
            embeddings_available: true,
        }
    }

    async fn embed_all(&self, texts: &[String]) -> Option<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            let result = self
                .retry
                .run("embed", || self.embedder.embed(chunk))
                .await;
            match result {
                Ok(vectors) if vectors.len() == chunk.len() => out.extend(vectors),
                Ok(vectors) => {
                    warn!(
                        expected = chunk.len(),
                        got = vectors.len(),
                        "embedding count mismatch; deduplication disabled for this merge"
                    );
                    return None;
                }
                Err(err) => {
                    warn!(error = %err, "embedding service unavailable; inserting candidates unconditionally");
                    return None;
                }
            }
        }
        Some(out)
    }

    /// Deduplicate a prepared batch into `set`, in candidate order.
    ///
    /// Later candidates are compared against earlier ones from the same batch.
    /// A candidate whose normalized text equals an existing item's is merged
    /// even without embeddings.
    pub fn apply(&self, set: &mut SalienceSet, batch: PreparedBatch) -> Vec<DedupDecision> {
        for (id, embedding) in batch.backfill {
            set.set_embedding(&id, embedding);
        }

        let mut decisions = Vec::with_capacity(batch.candidates.len());
        for candidate in batch.candidates {
            let decision = self.apply_one(set, candidate);
            obs::emit_dedup_decision(&decision, self.threshold);
            decisions.push(decision);
        }
        decisions
    }

    fn apply_one(&self, set: &mut SalienceSet, candidate: SalienceItem) -> DedupDecision {
        if let Some(index) = set.position(&candidate.id) {
            let into = set.items()[index].id.clone();
            set.absorb(index, candidate);
            return DedupDecision::Merged {
                into,
                similarity: 1.0,
            };
        }

        if !candidate.has_embedding() {
            let id = candidate.id.clone();
            set.insert(candidate);
            return DedupDecision::InsertedUnconditionally { id };
        }

        let best = self.best_match(set, &candidate.embedding);
        match best {
            Some((index, similarity)) if similarity >= self.threshold => {
                let into = set.items()[index].id.clone();
                set.absorb(index, candidate);
                DedupDecision::Merged { into, similarity }
            }
            _ => {
                let id = candidate.id.clone();
                set.insert(candidate);
                DedupDecision::Inserted {
                    id,
                    best_similarity: best.map(|(_, s)| s),
                }
            }
        }
    }

    /// Most similar embedded item, O(n) in set size.
    fn best_match(&self, set: &SalienceSet, embedding: &[f32]) -> Option<(usize, f64)> {
        set.iter()
            .enumerate()
            .filter(|(_, item)| item.has_embedding())
            .map(|(i, item)| (i, cosine_similarity(embedding, &item.embedding)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

impl std::fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("threshold", &self.threshold)
            .field("batch_size", &self.batch_size)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Category;
    use crate::fakes::{FixedEmbedder, UnavailableEmbedder};

    fn dedup(embedder: Arc<dyn EmbeddingModel>) -> Deduplicator {
        Deduplicator::new(embedder, DEFAULT_DEDUP_THRESHOLD, RetryPolicy::no_retry(1_000))
    }

    fn item(text: &str) -> SalienceItem {
        SalienceItem::new(text, Category::Fact, 1, 0.5)
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_cosine_just_below_threshold_stays_below() {
        // Exact cosine 0.84999999937; as f32 it would round up to 0.85.
        let sim = cosine_similarity(&[1.0, 0.0], &[6493.0, 4024.0]);
        assert!(sim < DEFAULT_DEDUP_THRESHOLD, "{sim}");
        assert!(sim > 0.849_999_99);
    }

    #[tokio::test]
    async fn test_candidate_just_below_threshold_inserts() {
        let embedder = FixedEmbedder::new()
            .with("deploy on Friday", vec![1.0, 0.0])
            .with("deploy before the weekend", vec![6493.0, 4024.0]);
        let d = dedup(Arc::new(embedder));
        let mut set = SalienceSet::new();
        let batch = d
            .prepare(&set, vec![item("deploy on Friday"), item("deploy before the weekend")])
            .await;
        let decisions = d.apply(&mut set, batch);
        assert_eq!(set.len(), 2);
        assert!(!decisions[1].is_merge());
    }

    #[tokio::test]
    async fn test_similar_candidate_merges() {
        let embedder = FixedEmbedder::new()
            .with("Budget is $10K", vec![1.0, 0.0])
            .with("The budget is 10,000 dollars", vec![0.9, 0.435_889_9]);
        let d = dedup(Arc::new(embedder));
        let mut set = SalienceSet::new();

        let batch = d
            .prepare(
                &set,
                vec![item("Budget is $10K"), item("The budget is 10,000 dollars")],
            )
            .await;
        assert!(batch.embeddings_available);
        let decisions = d.apply(&mut set, batch);

        assert_eq!(set.len(), 1);
        assert_eq!(decisions[0].label(), "inserted");
        assert!(decisions[1].is_merge());
        assert_eq!(set.items()[0].text, "The budget is 10,000 dollars");
    }

    #[tokio::test]
    async fn test_dissimilar_candidate_inserts() {
        let embedder = FixedEmbedder::new()
            .with("use Postgres", vec![1.0, 0.0])
            .with("deadline is Friday", vec![0.0, 1.0]);
        let d = dedup(Arc::new(embedder));
        let mut set = SalienceSet::new();
        let batch = d
            .prepare(&set, vec![item("use Postgres"), item("deadline is Friday")])
            .await;
        let decisions = d.apply(&mut set, batch);
        assert_eq!(set.len(), 2);
        assert!(decisions.iter().all(|d| !d.is_merge()));
    }

    #[tokio::test]
    async fn test_unavailable_embedder_fails_open() {
        let d = dedup(Arc::new(UnavailableEmbedder::default()));
        let mut set = SalienceSet::new();
        let batch = d
            .prepare(
                &set,
                vec![item("Budget is $10K"), item("The budget is 10,000 dollars")],
            )
            .await;
        assert!(!batch.embeddings_available);
        let decisions = d.apply(&mut set, batch);
        assert_eq!(set.len(), 2);
        assert!(decisions
            .iter()
            .all(|d| matches!(d, DedupDecision::InsertedUnconditionally { .. })));
    }

    #[tokio::test]
    async fn test_identical_text_merges_without_embeddings() {
        let d = dedup(Arc::new(UnavailableEmbedder::default()));
        let mut set = SalienceSet::new();
        let batch = d
            .prepare(&set, vec![item("ship on Friday"), item("ship  on Friday")])
            .await;
        d.apply(&mut set, batch);
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn test_embeds_in_chunks_and_compares_across_them() {
        let embedder = Arc::new(
            FixedEmbedder::new()
                .with("use Postgres", vec![1.0, 0.0, 0.0])
                .with("deadline is Friday", vec![0.0, 1.0, 0.0])
                .with("budget is $10K", vec![0.0, 0.0, 1.0])
                .with("staging runs on k8s", vec![0.0, 0.7, 0.7])
                .with("we will use Postgres", vec![0.99, 0.05, 0.0]),
        );
        let d = dedup(embedder.clone()).with_batch_size(2);
        let mut set = SalienceSet::new();
        let candidates = [
            "use Postgres",
            "deadline is Friday",
            "budget is $10K",
            "staging runs on k8s",
            "we will use Postgres",
        ]
        .map(item)
        .to_vec();

        let batch = d.prepare(&set, candidates).await;
        assert_eq!(embedder.calls(), 3);
        assert!(batch.candidates.iter().all(|c| c.has_embedding()));

        let decisions = d.apply(&mut set, batch);
        assert_eq!(set.len(), 4);
        assert!(decisions[4].is_merge());
        assert_eq!(set.items()[0].text, "we will use Postgres");
    }

    #[tokio::test]
    async fn test_backfills_missing_embeddings() {
        let mut set = SalienceSet::new();
        set.insert(item("use Postgres"));
        assert!(!set.items()[0].has_embedding());

        let embedder = FixedEmbedder::new()
            .with("use Postgres", vec![1.0, 0.0])
            .with("we will use Postgres", vec![0.99, 0.05]);
        let d = dedup(Arc::new(embedder));
        let batch = d.prepare(&set, vec![item("we will use Postgres")]).await;
        assert_eq!(batch.backfill.len(), 1);
        d.apply(&mut set, batch);

        assert_eq!(set.len(), 1);
        assert!(set.items()[0].has_embedding());
    }
}
