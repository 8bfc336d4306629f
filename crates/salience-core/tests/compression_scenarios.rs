use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use salience_core::fakes::{FixedEmbedder, ScriptedExtractor, ScriptedSummarizer, UnavailableEmbedder};
use salience_core::{
    Capabilities, CapabilityError, CapabilityResult, Category, CompressionState, ConversationTurn,
    Deduplicator, EngineConfig, ExtractedQuote, ExtractionModel, ExtractionRequest, ProtectedCore,
    RetryPolicy, SalienceItem, SalienceSetManager, Session, TokenBudgetEnforcer,
};
use tracing_test::traced_test;

fn fast_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy::no_retry(1_000),
        ..EngineConfig::default()
    }
}

fn capabilities(extractor: Arc<dyn ExtractionModel>) -> Capabilities {
    Capabilities::new(
        extractor,
        Arc::new(ScriptedSummarizer::fixed("The user and assistant discussed the login flow.")),
        Arc::new(FixedEmbedder::new()),
    )
}

// ---- Login bug ----

#[tokio::test]
async fn login_bug_constraint_survives_verbatim() -> anyhow::Result<()> {
    let extractor = Arc::new(ScriptedExtractor::new(vec![Ok(vec![
        ExtractedQuote::new("We must not change the database schema."),
        ExtractedQuote::tagged("Fix login bug", Category::Goal),
    ])]));
    let session = Session::initialize(
        "Fix login bug",
        ["no schema changes"],
        capabilities(extractor),
        fast_config(),
    )?;

    let turns = [
        ConversationTurn::user(1, "Can you help? Users cannot sign in since Monday."),
        ConversationTurn::assistant(2, "Sure. Where is the session check implemented?"),
        ConversationTurn::user(3, "In auth.rs. We must not change the database schema."),
        ConversationTurn::assistant(4, "Understood, I will keep the schema as is."),
    ];
    for t in turns {
        session.ingest_turn(t).await?;
    }

    let outcome = session.compress(4).await;

    let set = session.get_salience_set().await;
    let item = set
        .iter()
        .find(|i| i.text == "We must not change the database schema.")
        .context("constraint extracted")?;
    assert_eq!(item.category(), Category::Constraint);
    assert_eq!(item.source_turn_id, 3);
    // "Fix login bug" is not literally in any turn.
    assert_eq!(set.len(), 1);
    assert_eq!(outcome.rejected.len(), 1);

    let text = outcome.text();
    assert!(text.contains("We must not change the database schema."));
    assert!(text.starts_with(&session.core().await.render()));
    assert!(text.contains("The user and assistant discussed the login flow."));
    assert!(text.contains("Turn 4 (assistant): Understood, I will keep the schema as is."));
    assert_eq!(outcome.event.final_state, CompressionState::Done);
    assert!(!outcome.event.fallback_used);
    Ok(())
}

// ---- Near-duplicates ----

fn near_duplicates() -> Vec<SalienceItem> {
    vec![
        SalienceItem::new("Budget is $10K", Category::Fact, 1, 0.5),
        SalienceItem::new("The budget is 10,000 dollars", Category::Constraint, 2, 0.9),
    ]
}

fn manager(embedder: Arc<dyn salience_core::EmbeddingModel>) -> SalienceSetManager {
    SalienceSetManager::new(
        Deduplicator::new(embedder, 0.85, RetryPolicy::no_retry(1_000)),
        TokenBudgetEnforcer::new(5_000),
        0,
    )
}

#[tokio::test]
async fn near_duplicates_merge_into_one_item() {
    // cos = 0.9
    let embedder = FixedEmbedder::new()
        .with("Budget is $10K", vec![1.0, 0.0])
        .with("The budget is 10,000 dollars", vec![0.9, 0.435_889_9]);
    let m = manager(Arc::new(embedder));

    let report = m.merge(near_duplicates()).await;

    assert_eq!(m.len().await, 1);
    assert_eq!(report.merged_count(), 1);
    let set = m.snapshot().await;
    let item = &set.items()[0];
    assert_eq!(item.text, "The budget is 10,000 dollars");
    assert!(item.categories.contains(&Category::Fact));
    assert!(item.categories.contains(&Category::Constraint));
    assert_eq!(item.criticality, 0.9);
}

#[tokio::test]
#[traced_test]
async fn embedder_down_inserts_both_candidates() {
    let embedder = Arc::new(UnavailableEmbedder::default());
    let m = manager(embedder.clone());

    let report = m.merge(near_duplicates()).await;

    assert_eq!(m.len().await, 2);
    assert!(!report.embeddings_available);
    assert!(embedder.calls() >= 1);
    assert!(logs_contain("embedding service unavailable"));
}

// ---- Extraction timeouts ----

/// Answers the first call, then hangs forever.
struct HangsAfterFirstCall {
    first: Vec<ExtractedQuote>,
    calls: AtomicUsize,
}

#[async_trait]
impl ExtractionModel for HangsAfterFirstCall {
    async fn extract(&self, _request: &ExtractionRequest) -> CapabilityResult<Vec<ExtractedQuote>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(self.first.clone());
        }
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Err(CapabilityError::Other("unreachable".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn extraction_timing_out_three_times_falls_back() {
    let extractor = Arc::new(HangsAfterFirstCall {
        first: vec![ExtractedQuote::tagged("Budget is $10K", Category::Fact)],
        calls: AtomicUsize::new(0),
    });
    let config = EngineConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            timeout_ms: 50,
            backoff_base_ms: 10,
        },
        ..EngineConfig::default()
    };
    let session = Session::initialize(
        "Fix login bug",
        ["no schema changes"],
        capabilities(extractor.clone()),
        config,
    )
    .unwrap();

    session.ingest_turn(ConversationTurn::user(1, "Budget is $10K")).await.unwrap();
    let first = session.compress(1).await;
    assert!(!first.fallback_used());
    let previous_set = session.get_salience_set().await;
    assert_eq!(previous_set.len(), 1);

    session
        .ingest_turn(ConversationTurn::user(2, "Also, the deadline is Friday."))
        .await
        .unwrap();
    let outcome = session.compress(2).await;

    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1 + 3);
    assert!(outcome.event.fallback_used);
    assert_eq!(outcome.event.final_state, CompressionState::Fallback);
    let core: Arc<ProtectedCore> = session.core().await;
    assert_eq!(
        outcome.text(),
        format!("{}\n\n{}", core.render(), previous_set.render())
    );
    assert_eq!(session.get_salience_set().await, previous_set);
    assert_eq!(session.stats().await.fallback_count, 1);
}
