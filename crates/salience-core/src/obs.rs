//! Structured events for the compression lifecycle.
//!
//! Every compression runs inside [`compression_span`] so that dedup,
//! eviction and rejection events carry the session and trigger turn.

use tracing::{debug, info, warn};

use crate::dedup::DedupDecision;
use crate::domain::{CompressionEvent, CompressionState, SalienceError, SalienceItem, ValidationError};

/// Span for one compression. Attach with `tracing::Instrument` so it stays
/// current across the capability awaits.
pub fn compression_span(session_id: &str, trigger_turn_id: u64) -> tracing::Span {
    tracing::info_span!(
        "salience.compression",
        session_id = %session_id,
        trigger_turn_id = trigger_turn_id,
    )
}

pub fn emit_compression_started(session_id: &str, trigger_turn_id: u64, window_turns: usize) {
    info!(
        event = "compression.started",
        session_id = %session_id,
        trigger_turn_id,
        window_turns,
    );
}

pub fn emit_compression_finished(session_id: &str, event: &CompressionEvent, duration_ms: u64) {
    info!(
        event = "compression.finished",
        session_id = %session_id,
        trigger_turn_id = event.trigger_turn_id,
        final_state = %event.final_state,
        tokens_before = event.tokens_before,
        tokens_after = event.tokens_after,
        ratio = event.ratio,
        fallback_used = event.fallback_used,
        background_degraded = event.background_degraded,
        duration_ms,
    );
}

pub fn emit_state_transition(from: CompressionState, to: CompressionState) {
    debug!(event = "compression.transition", from = %from, to = %to);
}

/// One dedup decision. `threshold` is logged so merges can be audited.
pub fn emit_dedup_decision(decision: &DedupDecision, threshold: f64) {
    match decision {
        DedupDecision::Merged { into, similarity } => debug!(
            event = "salience.dedup",
            decision = decision.label(),
            into = %into,
            similarity = *similarity,
            threshold,
        ),
        DedupDecision::Inserted { id, best_similarity } => debug!(
            event = "salience.dedup",
            decision = decision.label(),
            id = %id,
            best_similarity = ?best_similarity,
            threshold,
        ),
        DedupDecision::InsertedUnconditionally { id } => debug!(
            event = "salience.dedup",
            decision = decision.label(),
            id = %id,
            threshold,
        ),
    }
}

pub fn emit_quote_rejected(error: &ValidationError) {
    warn!(event = "salience.quote_rejected", reason = %error);
}

pub fn emit_forced_reset(error: &SalienceError) {
    warn!(event = "salience.forced_reset", error = %error);
}

pub fn emit_item_evicted(item: &SalienceItem) {
    debug!(
        event = "salience.evicted",
        id = %item.id,
        category = %item.category(),
        criticality = item.criticality,
        tokens = item.tokens,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_span_create() {
        let _entered = compression_span("session-1", 7).entered();
        emit_state_transition(CompressionState::Idle, CompressionState::Extracting);
    }
}
