//! Compression state machine states and the append-only audit record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// States of one compression invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionState {
    Idle,
    Extracting,
    DedupingBudgeting,
    CompressingBackground,
    Assembling,
    Done,
    Fallback,
    /// Reachable only if the fallback itself produced nothing.
    Failed,
}

impl CompressionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Fallback | Self::Failed)
    }
}

impl std::fmt::Display for CompressionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Extracting => "extracting",
            Self::DedupingBudgeting => "deduping_budgeting",
            Self::CompressingBackground => "compressing_background",
            Self::Assembling => "assembling",
            Self::Done => "done",
            Self::Fallback => "fallback",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One edge taken through the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: CompressionState,
    pub to: CompressionState,
    pub at: DateTime<Utc>,
}

/// Audit record written once per compression call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionEvent {
    pub trigger_turn_id: u64,
    pub tokens_before: usize,
    pub tokens_after: usize,
    /// `tokens_after / tokens_before`; 1.0 when nothing was compressed.
    pub ratio: f64,
    pub fallback_used: bool,
    /// Background came from truncation, not summarization.
    pub background_degraded: bool,
    pub final_state: CompressionState,
    pub transitions: Vec<StateTransition>,
    pub quotes_accepted: usize,
    pub quotes_rejected: usize,
    pub items_merged: usize,
    pub items_evicted: usize,
    pub created_at: DateTime<Utc>,
}

impl CompressionEvent {
    /// Tokens removed from the context by this compression (never negative).
    pub fn tokens_saved(&self) -> usize {
        self.tokens_before.saturating_sub(self.tokens_after)
    }
}

/// `after / before`, with an empty input treated as no compression.
pub fn compression_ratio(tokens_before: usize, tokens_after: usize) -> f64 {
    if tokens_before == 0 {
        1.0
    } else {
        tokens_after as f64 / tokens_before as f64
    }
}
