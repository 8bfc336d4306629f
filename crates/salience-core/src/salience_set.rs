//! The cumulative salience set and its single-writer manager.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::budget::{TokenBudget, TokenBudgetEnforcer};
use crate::dedup::{DedupDecision, Deduplicator};
use crate::domain::{Category, SalienceError, SalienceItem};
use crate::metrics::METRICS;
use crate::obs;

/// First line of a rendered non-empty set.
pub const SALIENCE_HEADER: &str = "=== SALIENT INFORMATION (VERBATIM) ===";
pub const SALIENCE_FOOTER: &str = "=== END SALIENT INFORMATION ===";

/// Insertion-ordered, content-unique collection of salience items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SalienceSet {
    items: Vec<SalienceItem>,
    next_seq: u64,
    current_tokens: usize,
}

impl SalienceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in insertion order.
    pub fn items(&self) -> &[SalienceItem] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SalienceItem> {
        self.items.iter()
    }

    /// Look up an item by content id.
    pub fn get(&self, id: &str) -> Option<&SalienceItem> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Index of the item with content id `id`.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|i| i.id == id)
    }

    /// Recorded token usage of all items.
    pub fn total_tokens(&self) -> usize {
        self.current_tokens
    }

    /// Append an item, assigning its insertion ordinal.
    pub fn insert(&mut self, mut item: SalienceItem) {
        item.seq = self.next_seq;
        self.next_seq += 1;
        self.current_tokens += item.tokens;
        self.items.push(item);
    }

    /// Fold `candidate` into the item at `index`.
    pub fn absorb(&mut self, index: usize, candidate: SalienceItem) {
        let Some(item) = self.items.get_mut(index) else {
            return;
        };
        let before = item.tokens;
        item.absorb(candidate);
        self.current_tokens = self.current_tokens - before + item.tokens;
    }

    /// Remove by content id, releasing its tokens.
    pub fn remove(&mut self, id: &str) -> Option<SalienceItem> {
        let index = self.position(id)?;
        let item = self.items.remove(index);
        self.current_tokens -= item.tokens;
        Some(item)
    }

    /// Attach an embedding computed after the item was inserted.
    pub fn set_embedding(&mut self, id: &str, embedding: Vec<f32>) {
        if let Some(item) = self.items.iter_mut().find(|i| i.id == id) {
            item.embedding = embedding;
        }
    }

    /// Check token accounting, id uniqueness, and the budget invariant.
    pub fn verify(&self, max_tokens: usize, reserved_tokens: usize) -> Result<(), SalienceError> {
        let actual: usize = self.items.iter().map(|i| i.tokens).sum();
        if actual != self.current_tokens {
            return Err(SalienceError::TokenAccountingMismatch {
                recorded: self.current_tokens,
                actual,
            });
        }
        for (i, item) in self.items.iter().enumerate() {
            if self.items[..i].iter().any(|other| other.id == item.id) {
                return Err(SalienceError::DuplicateId {
                    id: item.id.clone(),
                });
            }
        }
        // An over-size core forces an empty set; that is compliant.
        let used = actual + reserved_tokens;
        if !self.items.is_empty() && used > max_tokens {
            return Err(SalienceError::BudgetViolated {
                used,
                max: max_tokens,
            });
        }
        Ok(())
    }

    /// Items of one category, in insertion order.
    pub fn by_category(&self, category: Category) -> Vec<&SalienceItem> {
        self.items
            .iter()
            .filter(|i| i.category() == category)
            .collect()
    }

    /// Deterministic rendering grouped by category, insertion order within
    /// each group. Empty string for an empty set.
    pub fn render(&self) -> String {
        if self.items.is_empty() {
            return String::new();
        }
        let mut lines = vec![SALIENCE_HEADER.to_string()];
        for category in Category::ALL {
            let group = self.by_category(category);
            if group.is_empty() {
                continue;
            }
            lines.push(format!("[{}]", category.heading()));
            lines.extend(group.iter().map(|i| format!("- {}", i.text)));
        }
        lines.push(SALIENCE_FOOTER.to_string());
        lines.join("\n")
    }
}

/// Outcome of one `merge` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    /// One per candidate, in candidate order.
    pub decisions: Vec<DedupDecision>,
    /// Items dropped to fit the budget, lowest priority first.
    pub evicted: Vec<SalienceItem>,
    pub embeddings_available: bool,
    /// The merged set failed verification and was replaced by an empty one.
    pub forced_reset: bool,
    /// Budget as committed.
    pub budget: Option<TokenBudget>,
}

impl MergeReport {
    /// Candidates folded into an existing item.
    pub fn merged_count(&self) -> usize {
        self.decisions.iter().filter(|d| d.is_merge()).count()
    }

    /// Candidates added as new items.
    pub fn inserted_count(&self) -> usize {
        self.decisions.len() - self.merged_count()
    }
}

/// Owns one session's salience set.
///
/// Writers (`merge`, `reset`) are serialized; readers get a consistent
/// point-in-time copy. A merge commits all of its candidates or none.
pub struct SalienceSetManager {
    state: RwLock<Arc<SalienceSet>>,
    writer: Mutex<()>,
    dedup: Deduplicator,
    enforcer: TokenBudgetEnforcer,
    reserved_tokens: AtomicUsize,
}

impl SalienceSetManager {
    /// Empty set with `reserved_tokens` held back for the protected core.
    pub fn new(dedup: Deduplicator, enforcer: TokenBudgetEnforcer, reserved_tokens: usize) -> Self {
        Self {
            state: RwLock::new(Arc::new(SalienceSet::new())),
            writer: Mutex::new(()),
            dedup,
            enforcer,
            reserved_tokens: AtomicUsize::new(reserved_tokens),
        }
    }

    /// Total budget shared by the core and the set.
    pub fn max_tokens(&self) -> usize {
        self.enforcer.max_tokens()
    }

    /// Tokens currently held back for the protected core.
    pub fn reserved_tokens(&self) -> usize {
        self.reserved_tokens.load(Ordering::Acquire)
    }

    /// Deduplicate `candidates` into the set, then enforce the budget.
    ///
    /// All or nothing: a merge cancelled before commit leaves the set as it
    /// was. A merged set that fails verification is replaced by an empty one
    /// and reported as `forced_reset`.
    pub async fn merge(&self, candidates: Vec<SalienceItem>) -> MergeReport {
        let _writer = self.writer.lock().await;
        let base = self.state.read().await.clone();
        let reserved = self.reserved_tokens();

        // Suspension point: nothing below this line awaits until commit.
        let batch = self.dedup.prepare(&base, candidates).await;
        let embeddings_available = batch.embeddings_available;

        let mut working = (*base).clone();
        let decisions = self.dedup.apply(&mut working, batch);
        let enforcement = self.enforcer.enforce(&mut working, reserved);
        for item in &enforcement.evicted {
            obs::emit_item_evicted(item);
        }

        let mut report = MergeReport {
            decisions,
            evicted: enforcement.evicted,
            embeddings_available,
            forced_reset: false,
            budget: Some(enforcement.budget),
        };

        if let Err(err) = working.verify(self.enforcer.max_tokens(), reserved) {
            obs::emit_forced_reset(&err);
            METRICS.inc_forced_resets();
            working = SalienceSet::new();
            report.forced_reset = true;
            report.budget = Some(TokenBudget {
                max_tokens: self.enforcer.max_tokens(),
                current_tokens: reserved,
            });
        }

        METRICS.add_items_merged(report.merged_count() as u64);
        METRICS.add_items_evicted(report.evicted.len() as u64);
        debug!(
            inserted = report.inserted_count(),
            merged = report.merged_count(),
            evicted = report.evicted.len(),
            size = working.len(),
            tokens = working.total_tokens(),
            "salience merge committed"
        );

        *self.state.write().await = Arc::new(working);
        report
    }

    /// Point-in-time copy of the set.
    pub async fn snapshot(&self) -> SalienceSet {
        self.state.read().await.as_ref().clone()
    }

    /// Render the current set; see [`SalienceSet::render`].
    pub async fn render(&self) -> String {
        self.state.read().await.render()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.is_empty()
    }

    /// Current usage, counting the core reservation.
    pub async fn budget(&self) -> TokenBudget {
        TokenBudget {
            max_tokens: self.enforcer.max_tokens(),
            current_tokens: self.state.read().await.total_tokens() + self.reserved_tokens(),
        }
    }

    /// Clear the set and reserve `reserved_tokens` for a new protected core.
    /// Waits for any in-flight merge.
    pub async fn reset(&self, reserved_tokens: usize) {
        let _writer = self.writer.lock().await;
        self.reserved_tokens.store(reserved_tokens, Ordering::Release);
        *self.state.write().await = Arc::new(SalienceSet::new());
    }

    /// Change the core reservation and keep the set, evicting whatever no
    /// longer fits. Waits for any in-flight merge. Returns the evicted items.
    pub async fn reserve(&self, reserved_tokens: usize) -> Vec<SalienceItem> {
        let _writer = self.writer.lock().await;
        self.reserved_tokens.store(reserved_tokens, Ordering::Release);

        let mut working = self.state.read().await.as_ref().clone();
        let enforcement = self.enforcer.enforce(&mut working, reserved_tokens);
        if enforcement.evicted.is_empty() {
            return Vec::new();
        }
        for item in &enforcement.evicted {
            obs::emit_item_evicted(item);
        }
        METRICS.add_items_evicted(enforcement.evicted.len() as u64);
        *self.state.write().await = Arc::new(working);
        enforcement.evicted
    }

    /// Re-check the committed set; on corruption, reset it and log.
    /// Returns whether a reset happened.
    pub async fn audit(&self) -> bool {
        let _writer = self.writer.lock().await;
        let reserved = self.reserved_tokens();
        let result = self
            .state
            .read()
            .await
            .verify(self.enforcer.max_tokens(), reserved);
        match result {
            Ok(()) => false,
            Err(err) => {
                warn!(error = %err, "salience set failed audit");
                obs::emit_forced_reset(&err);
                METRICS.inc_forced_resets();
                *self.state.write().await = Arc::new(SalienceSet::new());
                true
            }
        }
    }
}

impl std::fmt::Debug for SalienceSetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SalienceSetManager")
            .field("dedup", &self.dedup)
            .field("enforcer", &self.enforcer)
            .field("reserved_tokens", &self.reserved_tokens())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::fakes::{FixedEmbedder, UnavailableEmbedder};
    use crate::retry::RetryPolicy;

    async fn install(m: &SalienceSetManager, set: SalienceSet) {
        *m.state.write().await = Arc::new(set);
    }

    fn manager(embedder: Arc<dyn crate::capability::EmbeddingModel>, max: usize) -> SalienceSetManager {
        SalienceSetManager::new(
            Deduplicator::new(embedder, 0.85, RetryPolicy::no_retry(1_000)),
            TokenBudgetEnforcer::new(max),
            0,
        )
    }

    #[test]
    fn test_render_groups_by_category_in_insertion_order() {
        let mut set = SalienceSet::new();
        set.insert(SalienceItem::new("fact one", Category::Fact, 1, 0.5));
        set.insert(SalienceItem::new("must not drop tables", Category::Constraint, 2, 1.0));
        set.insert(SalienceItem::new("fact two", Category::Fact, 3, 0.5));
        set.insert(SalienceItem::new("fix login", Category::Goal, 4, 1.0));

        let rendered = set.render();
        let expected = [
            SALIENCE_HEADER,
            "[Goals]",
            "- fix login",
            "[Constraints]",
            "- must not drop tables",
            "[Facts]",
            "- fact one",
            "- fact two",
            SALIENCE_FOOTER,
        ]
        .join("\n");
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_empty_set_renders_empty() {
        assert_eq!(SalienceSet::new().render(), "");
    }

    #[test]
    fn test_verify_detects_accounting_mismatch() {
        let mut set = SalienceSet::new();
        set.insert(SalienceItem::new("abcd", Category::Fact, 1, 0.5));
        set.current_tokens = 99;
        assert!(matches!(
            set.verify(1_000, 0),
            Err(SalienceError::TokenAccountingMismatch { .. })
        ));
    }

    #[test]
    fn test_remove_updates_tokens() {
        let mut set = SalienceSet::new();
        let item = SalienceItem::new("abcdefgh", Category::Fact, 1, 0.5);
        let id = item.id.clone();
        set.insert(item);
        assert_eq!(set.total_tokens(), 2);
        assert!(set.remove(&id).is_some());
        assert_eq!(set.total_tokens(), 0);
        assert!(set.remove(&id).is_none());
    }

    #[tokio::test]
    async fn test_merge_respects_budget() {
        let m = manager(Arc::new(UnavailableEmbedder::default()), 5);
        let report = m
            .merge(vec![
                SalienceItem::new("low priority fact", Category::Fact, 1, 0.1),
                SalienceItem::new("must keep this!!", Category::Constraint, 2, 1.0),
            ])
            .await;
        assert_eq!(report.evicted.len(), 1);
        let snap = m.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.items()[0].text, "must keep this!!");
        assert!(m.budget().await.is_satisfied());
    }

    #[tokio::test]
    async fn test_snapshot_is_independent_copy() {
        let m = manager(Arc::new(FixedEmbedder::new()), 1_000);
        m.merge(vec![SalienceItem::new("a", Category::Fact, 1, 0.5)]).await;
        let snap = m.snapshot().await;
        m.merge(vec![SalienceItem::new("b", Category::Goal, 2, 0.5)]).await;
        assert_eq!(snap.len(), 1);
        assert_eq!(m.len().await, 2);
    }

    #[tokio::test]
    async fn test_reset_clears_and_reserves() {
        let m = manager(Arc::new(FixedEmbedder::new()), 1_000);
        m.merge(vec![SalienceItem::new("a", Category::Fact, 1, 0.5)]).await;
        m.reset(100).await;
        assert!(m.is_empty().await);
        assert_eq!(m.reserved_tokens(), 100);
        assert_eq!(m.budget().await.current_tokens, 100);
    }

    #[tokio::test]
    async fn test_audit_passes_on_clean_state() {
        let m = manager(Arc::new(FixedEmbedder::new()), 1_000);
        m.merge(vec![SalienceItem::new("a", Category::Fact, 1, 0.5)]).await;
        assert!(!m.audit().await);
        assert_eq!(m.len().await, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_audit_resets_corrupted_accounting() {
        let m = manager(Arc::new(FixedEmbedder::new()), 1_000);
        let mut set = SalienceSet::new();
        set.insert(SalienceItem::new("abcd", Category::Fact, 1, 0.5));
        set.current_tokens = 99;
        install(&m, set).await;

        assert!(m.audit().await);
        assert!(m.is_empty().await);
        assert_eq!(m.budget().await.current_tokens, 0);
        assert!(logs_contain("salience set failed audit"));
        assert!(logs_contain("salience.forced_reset"));

        // Clean afterwards.
        assert!(!m.audit().await);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_merge_onto_corrupted_set_forces_reset() {
        let m = manager(Arc::new(UnavailableEmbedder::default()), 1_000);
        let item = SalienceItem::new("use Postgres", Category::Decision, 1, 0.75);
        let mut set = SalienceSet::new();
        set.insert(item.clone());
        set.insert(item);
        assert!(matches!(set.verify(1_000, 0), Err(SalienceError::DuplicateId { .. })));
        install(&m, set).await;

        let report = m
            .merge(vec![SalienceItem::new("deadline is Friday", Category::Fact, 2, 0.5)])
            .await;

        assert!(report.forced_reset);
        assert!(m.is_empty().await);
        assert_eq!(report.budget.map(|b| b.current_tokens), Some(0));
        assert!(logs_contain("salience.forced_reset"));

        // The manager keeps working after recovery.
        let report = m
            .merge(vec![SalienceItem::new("deadline is Friday", Category::Fact, 3, 0.5)])
            .await;
        assert!(!report.forced_reset);
        assert_eq!(m.len().await, 1);
    }

    #[tokio::test]
    async fn test_reserve_keeps_set_and_evicts_overflow() {
        let m = manager(Arc::new(UnavailableEmbedder::default()), 20);
        m.merge(vec![
            SalienceItem::new("low priority fact here", Category::Fact, 1, 0.1),
            SalienceItem::new("must keep this item!", Category::Constraint, 2, 1.0),
        ])
        .await;
        assert_eq!(m.len().await, 2);

        assert!(m.reserve(5).await.is_empty());
        assert_eq!(m.len().await, 2);
        assert_eq!(m.reserved_tokens(), 5);

        let evicted = m.reserve(12).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].text, "low priority fact here");
        let budget = m.budget().await;
        assert!(budget.is_satisfied());
        assert_eq!(budget.current_tokens, 12 + 5);
    }
}
