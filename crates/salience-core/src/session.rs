//! One conversation's compression state: protected core, cumulative
//! salience set, ingested turns, audit log.
//!
//! Sessions share nothing; run as many in parallel as needed. Within a
//! session, compressions and re-initialization are serialized.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::background::BackgroundCompressor;
use crate::budget::{TokenBudget, TokenBudgetEnforcer};
use crate::capability::Capabilities;
use crate::config::EngineConfig;
use crate::context::join_sections;
use crate::dedup::Deduplicator;
use crate::domain::{
    CompressionEvent, ConfigError, ConversationTurn, SalienceItem, ValidationError,
};
use crate::drift::{BehaviorSample, DriftMeasurer, DriftResult};
use crate::extractor::SalienceExtractor;
use crate::obs;
use crate::orchestrator::{CompressionOrchestrator, CompressionOutcome, CompressionRequest};
use crate::protected_core::ProtectedCore;
use crate::salience_set::{SalienceSet, SalienceSetManager};

/// Running totals over a session's compressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub compression_count: u64,
    pub fallback_count: u64,
    /// Sum of `tokens_before - tokens_after`, floored at zero per event.
    pub total_tokens_saved: u64,
    pub created_at: DateTime<Utc>,
}

impl SessionStats {
    fn new() -> Self {
        Self {
            compression_count: 0,
            fallback_count: 0,
            total_tokens_saved: 0,
            created_at: Utc::now(),
        }
    }

    fn record(&mut self, event: &CompressionEvent) {
        self.compression_count += 1;
        if event.fallback_used {
            self.fallback_count += 1;
        }
        self.total_tokens_saved += event.tokens_saved() as u64;
    }
}

/// Highest turn id whose content has been extracted from.
#[derive(Debug, Default)]
struct Cursor {
    last_compressed: u64,
}

/// Handle for one conversation. All methods take `&self`; share it behind
/// an `Arc` to drive it from several tasks.
pub struct Session {
    id: String,
    config: EngineConfig,
    core: RwLock<Arc<ProtectedCore>>,
    manager: SalienceSetManager,
    orchestrator: CompressionOrchestrator,
    drift: DriftMeasurer,
    turns: RwLock<Vec<ConversationTurn>>,
    events: RwLock<Vec<CompressionEvent>>,
    stats: RwLock<SessionStats>,
    last_context: RwLock<Option<String>>,
    cursor: Mutex<Cursor>,
}

impl Session {
    /// Start a session with `goal` and `constraints` as its protected core.
    pub fn initialize<I, S>(
        goal: impl Into<String>,
        constraints: I,
        capabilities: Capabilities,
        config: EngineConfig,
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        config.validate()?;
        let id = Uuid::new_v4().to_string();
        let core = ProtectedCore::new(goal, constraints);
        warn_if_core_exceeds_budget(&core, config.max_tokens);

        let retry = config.retry.clone();
        let manager = SalienceSetManager::new(
            Deduplicator::new(capabilities.embedder, config.dedup_threshold, retry.clone()),
            TokenBudgetEnforcer::new(config.max_tokens),
            core.tokens(),
        );
        let orchestrator = CompressionOrchestrator::new(
            id.clone(),
            SalienceExtractor::new(capabilities.extractor, retry.clone()),
            BackgroundCompressor::new(
                capabilities.summarizer,
                retry.clone(),
                config.background_fallback_tokens,
            ),
        );
        let drift = DriftMeasurer::new(capabilities.judge, retry);

        info!(
            session_id = %id,
            goal = %core.goal(),
            constraints = core.constraints().len(),
            max_tokens = config.max_tokens,
            "session initialized"
        );

        Ok(Self {
            id,
            config,
            core: RwLock::new(Arc::new(core)),
            manager,
            orchestrator,
            drift,
            turns: RwLock::new(Vec::new()),
            events: RwLock::new(Vec::new()),
            stats: RwLock::new(SessionStats::new()),
            last_context: RwLock::new(None),
            cursor: Mutex::new(Cursor::default()),
        })
    }

    /// Random v4 UUID assigned at initialization.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The protected core in effect right now.
    pub async fn core(&self) -> Arc<ProtectedCore> {
        self.core.read().await.clone()
    }

    /// Replace the protected core and start a fresh salience set.
    ///
    /// Waits for any in-flight compression. Turns, events and stats are
    /// kept; the whole retained history becomes the next window so it is
    /// re-extracted under the new goal.
    pub async fn reinitialize<I, S>(&self, goal: impl Into<String>, constraints: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cursor = self.cursor.lock().await;
        let core = ProtectedCore::new(goal, constraints);
        warn_if_core_exceeds_budget(&core, self.config.max_tokens);

        self.manager.reset(core.tokens()).await;
        info!(session_id = %self.id, goal = %core.goal(), "session re-initialized");
        *self.core.write().await = Arc::new(core);
        *self.last_context.write().await = None;
        cursor.last_compressed = 0;
    }

    /// Change the current goal, keeping the salience set and the window.
    ///
    /// The original goal stays in the core and the change is recorded as a
    /// key decision. The larger core is re-reserved out of the budget; the
    /// returned items are the ones evicted to make room.
    pub async fn update_goal(
        &self,
        new_goal: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Vec<SalienceItem> {
        let (new_goal, rationale) = (new_goal.into(), rationale.into());
        self.replace_core("goal updated", |core| core.with_goal(new_goal, rationale))
            .await
    }

    /// Record a key decision in the protected core.
    ///
    /// Same budget handling as [`update_goal`](Self::update_goal).
    pub async fn add_decision(
        &self,
        decision: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Vec<SalienceItem> {
        let (decision, rationale) = (decision.into(), rationale.into());
        self.replace_core("key decision recorded", |core| {
            core.with_decision(decision, rationale)
        })
        .await
    }

    /// Swap in a core derived from the current one, exclusive with
    /// compression and any merge.
    async fn replace_core<F>(&self, what: &str, derive: F) -> Vec<SalienceItem>
    where
        F: FnOnce(&ProtectedCore) -> ProtectedCore,
    {
        let _cursor = self.cursor.lock().await;
        let mut slot = self.core.write().await;
        let current: &ProtectedCore = &slot;
        let core = derive(current);
        warn_if_core_exceeds_budget(&core, self.config.max_tokens);

        let evicted = self.manager.reserve(core.tokens()).await;
        info!(
            session_id = %self.id,
            goal = %core.goal(),
            decisions = core.decisions().len(),
            core_tokens = core.tokens(),
            evicted = evicted.len(),
            "{what}"
        );
        *slot = Arc::new(core);
        evicted
    }

    /// Append a turn. Ids must strictly increase.
    pub async fn ingest_turn(&self, turn: ConversationTurn) -> Result<(), ValidationError> {
        let mut turns = self.turns.write().await;
        if let Some(last) = turns.last() {
            if turn.id <= last.id {
                return Err(ValidationError::OutOfOrderTurn {
                    turn_id: turn.id,
                    last_turn_id: last.id,
                });
            }
        }
        turns.push(turn);
        Ok(())
    }

    /// Every ingested turn, oldest first.
    pub async fn turns(&self) -> Vec<ConversationTurn> {
        self.turns.read().await.clone()
    }

    /// Compress every turn after the last compressed one up to and
    /// including `trigger_turn_id`.
    ///
    /// Never fails. A fallback leaves the window uncompressed so the next
    /// call retries it.
    pub async fn compress(&self, trigger_turn_id: u64) -> CompressionOutcome {
        let mut cursor = self.cursor.lock().await;
        let window: Vec<ConversationTurn> = self
            .turns
            .read()
            .await
            .iter()
            .filter(|t| t.id > cursor.last_compressed && t.id <= trigger_turn_id)
            .cloned()
            .collect();
        let core = self.core().await;

        let request = CompressionRequest {
            trigger_turn_id,
            window: &window,
            keep_recent: self.config.keep_recent_turns,
        };
        let outcome = self
            .orchestrator
            .compress(&core, &self.manager, request)
            .instrument(obs::compression_span(&self.id, trigger_turn_id))
            .await;

        if !outcome.event.fallback_used {
            cursor.last_compressed = cursor.last_compressed.max(trigger_turn_id);
        }
        self.stats.write().await.record(&outcome.event);
        self.events.write().await.push(outcome.event.clone());
        *self.last_context.write().await = Some(outcome.text());
        outcome
    }

    /// Point-in-time copy of the salience set.
    pub async fn get_salience_set(&self) -> SalienceSet {
        self.manager.snapshot().await
    }

    /// Token usage of core plus salience set against `max_tokens`.
    pub async fn budget(&self) -> TokenBudget {
        self.manager.budget().await
    }

    /// Measure drift of the latest compressed context (or of core plus
    /// salience set before the first compression).
    pub async fn measure_drift(&self, behavior: Option<BehaviorSample<'_>>) -> DriftResult {
        let core = self.core().await;
        let context = match self.last_context.read().await.clone() {
            Some(text) => text,
            None => join_sections([core.render(), self.manager.render().await]),
        };
        self.drift.measure(&core, &context, behavior).await
    }

    /// The append-only compression log.
    pub async fn events(&self) -> Vec<CompressionEvent> {
        self.events.read().await.clone()
    }

    /// Running totals since initialization; re-initialization keeps them.
    pub async fn stats(&self) -> SessionStats {
        self.stats.read().await.clone()
    }

    /// Last compressed context, if any compression ran since (re)initialization.
    pub async fn last_context(&self) -> Option<String> {
        self.last_context.read().await.clone()
    }
}

fn warn_if_core_exceeds_budget(core: &ProtectedCore, max_tokens: usize) {
    if core.tokens() > max_tokens {
        warn!(
            core_tokens = core.tokens(),
            max_tokens,
            "protected core alone exceeds the token budget; salience set will stay empty"
        );
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
