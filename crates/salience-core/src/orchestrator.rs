//! Compression state machine.
//!
//! ```text
//! Idle -> Extracting -> DedupingBudgeting -> CompressingBackground -> Assembling -> Done
//!   \________\_______________\____________________> Fallback
//! ```
//!
//! Extraction failure is the only path to `Fallback`: dedup/budgeting fails
//! open and background failure degrades locally. `Failed` is reachable only
//! if even the fallback rendered nothing.

use std::time::Instant;

use chrono::Utc;
use tracing::warn;

use crate::background::BackgroundCompressor;
use crate::context::{join_sections, render_background, render_recent, CompressedContext};
use crate::domain::{
    compression_ratio, render_turns, CompressionEvent, CompressionState, ConversationTurn,
    StateTransition, ValidationError,
};
use crate::extractor::SalienceExtractor;
use crate::metrics::METRICS;
use crate::obs;
use crate::protected_core::ProtectedCore;
use crate::salience_set::{MergeReport, SalienceSetManager};
use crate::tokens::estimate_tokens;

/// Whether the machine may move from `from` to `to`.
pub fn transition_allowed(from: CompressionState, to: CompressionState) -> bool {
    use CompressionState::*;
    matches!(
        (from, to),
        (Idle, Extracting)
            | (Extracting, DedupingBudgeting)
            | (DedupingBudgeting, CompressingBackground)
            | (CompressingBackground, Assembling)
            | (Assembling, Done)
            | (Idle | Extracting | DedupingBudgeting, Fallback)
            | (Assembling | Fallback, Failed)
    )
}

struct StateMachine {
    state: CompressionState,
    transitions: Vec<StateTransition>,
}

impl StateMachine {
    fn new() -> Self {
        Self {
            state: CompressionState::Idle,
            transitions: Vec::new(),
        }
    }

    fn advance(&mut self, to: CompressionState) {
        if !transition_allowed(self.state, to) {
            warn!(from = %self.state, to = %to, "unexpected compression state transition");
        }
        obs::emit_state_transition(self.state, to);
        self.transitions.push(StateTransition {
            from: self.state,
            to,
            at: Utc::now(),
        });
        self.state = to;
    }
}

/// Turns handed to one compression.
#[derive(Debug, Clone, Copy)]
pub struct CompressionRequest<'a> {
    pub trigger_turn_id: u64,
    /// Every turn not yet compressed, oldest first. All of it is extracted from.
    pub window: &'a [ConversationTurn],
    /// Trailing turns of `window` rendered raw and left out of the background.
    pub keep_recent: usize,
}

impl<'a> CompressionRequest<'a> {
    /// `(background turns, recent turns)`.
    pub fn split(&self) -> (&'a [ConversationTurn], &'a [ConversationTurn]) {
        let at = self.window.len().saturating_sub(self.keep_recent);
        self.window.split_at(at)
    }
}

/// Result of one compression call. Always carries a usable context.
#[derive(Debug, Clone)]
pub struct CompressionOutcome {
    pub context: CompressedContext,
    pub event: CompressionEvent,
    pub merge: Option<MergeReport>,
    pub rejected: Vec<ValidationError>,
}

impl CompressionOutcome {
    pub fn text(&self) -> String {
        self.context.render()
    }

    pub fn fallback_used(&self) -> bool {
        self.event.fallback_used
    }
}

/// Drives one session's compressions.
#[derive(Debug, Clone)]
pub struct CompressionOrchestrator {
    session_id: String,
    extractor: SalienceExtractor,
    background: BackgroundCompressor,
}

struct Tally {
    fallback_used: bool,
    background_degraded: bool,
    quotes_accepted: usize,
    quotes_rejected: usize,
}

impl CompressionOrchestrator {
    pub fn new(
        session_id: impl Into<String>,
        extractor: SalienceExtractor,
        background: BackgroundCompressor,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            extractor,
            background,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run the state machine once. Never fails; degradation is reported in
    /// the returned event.
    ///
    /// The caller must serialize calls per session and keep `core` fixed for
    /// the duration of the call.
    pub async fn compress(
        &self,
        core: &ProtectedCore,
        manager: &SalienceSetManager,
        request: CompressionRequest<'_>,
    ) -> CompressionOutcome {
        let started = Instant::now();
        obs::emit_compression_started(
            &self.session_id,
            request.trigger_turn_id,
            request.window.len(),
        );

        let core_text = core.render();
        let prior_salience = manager.render().await;
        let tokens_before = estimate_tokens(&join_sections([
            core_text.as_str(),
            prior_salience.as_str(),
            render_turns(request.window).as_str(),
        ]));
        let (older, recent) = request.split();

        let mut machine = StateMachine::new();
        let mut tally = Tally {
            fallback_used: false,
            background_degraded: false,
            quotes_accepted: 0,
            quotes_rejected: 0,
        };

        machine.advance(CompressionState::Extracting);
        let extraction = self.extractor.extract(request.window, core).await;
        tally.quotes_accepted = extraction.candidates.len();
        tally.quotes_rejected = extraction.rejected.len();

        let (context, merge) = if extraction.failed() {
            machine.advance(CompressionState::Fallback);
            tally.fallback_used = true;
            METRICS.inc_fallbacks();
            (CompressedContext::fallback(core_text, prior_salience), None)
        } else {
            machine.advance(CompressionState::DedupingBudgeting);
            let merge = if extraction.candidates.is_empty() {
                None
            } else {
                Some(manager.merge(extraction.candidates).await)
            };

            machine.advance(CompressionState::CompressingBackground);
            let set = manager.snapshot().await;
            let background = self.background.compress(older, set.items()).await;
            tally.background_degraded = background.degraded;

            machine.advance(CompressionState::Assembling);
            let context = CompressedContext {
                core: core_text,
                salience: set.render(),
                background: render_background(&background.text, background.degraded),
                recent: render_recent(recent),
            };
            (context, merge)
        };

        if context.is_empty() {
            machine.advance(CompressionState::Failed);
        } else if !tally.fallback_used {
            machine.advance(CompressionState::Done);
        }

        let tokens_after = context.tokens();
        let event = CompressionEvent {
            trigger_turn_id: request.trigger_turn_id,
            tokens_before,
            tokens_after,
            ratio: compression_ratio(tokens_before, tokens_after),
            fallback_used: tally.fallback_used,
            background_degraded: tally.background_degraded,
            final_state: machine.state,
            transitions: machine.transitions,
            quotes_accepted: tally.quotes_accepted,
            quotes_rejected: tally.quotes_rejected,
            items_merged: merge.as_ref().map_or(0, MergeReport::merged_count),
            items_evicted: merge.as_ref().map_or(0, |m| m.evicted.len()),
            created_at: Utc::now(),
        };

        METRICS.inc_compressions();
        obs::emit_compression_finished(
            &self.session_id,
            &event,
            started.elapsed().as_millis() as u64,
        );

        CompressionOutcome {
            context,
            event,
            merge,
            rejected: extraction.rejected,
        }
    }
}
