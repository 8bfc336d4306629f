//! Background compression: summarize whatever was not kept verbatim.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::capability::{SummarizationModel, SummaryRequest};
use crate::domain::{normalize_whitespace, CapabilityError, ConversationTurn, SalienceItem};
use crate::metrics::METRICS;
use crate::retry::RetryPolicy;
use crate::tokens::truncate_to_tokens;

/// Default cap for the truncated background used when summarization fails.
pub const DEFAULT_BACKGROUND_FALLBACK_TOKENS: usize = 500;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackgroundOutcome {
    pub text: String,
    /// The text is a truncation of the raw background, not a summary.
    pub degraded: bool,
    pub error: Option<CapabilityError>,
}

/// Render `turns` with the spans of `salient` items that cite them removed.
///
/// Turns left empty by the removal are dropped entirely.
pub fn background_text(turns: &[ConversationTurn], salient: &[SalienceItem]) -> String {
    let mut lines = Vec::with_capacity(turns.len());
    for turn in turns {
        let mut content = turn.content.clone();
        for item in salient.iter().filter(|i| i.source_turn_id == turn.id) {
            content = remove_span(&content, &item.text);
        }
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        lines.push(format!("Turn {} ({}): {}", turn.id, turn.role, content));
    }
    lines.join("\n")
}

fn remove_span(content: &str, span: &str) -> String {
    let span = span.trim();
    if span.is_empty() {
        return content.to_string();
    }
    if content.contains(span) {
        return content.replace(span, " ");
    }
    let normalized = normalize_whitespace(content);
    let span = normalize_whitespace(span);
    if normalized.contains(&span) {
        normalized.replace(&span, " ")
    } else {
        content.to_string()
    }
}

/// Wraps the summarization capability with retry and a truncation fallback.
#[derive(Clone)]
pub struct BackgroundCompressor {
    model: Arc<dyn SummarizationModel>,
    retry: RetryPolicy,
    fallback_tokens: usize,
}

impl BackgroundCompressor {
    pub fn new(model: Arc<dyn SummarizationModel>, retry: RetryPolicy, fallback_tokens: usize) -> Self {
        Self {
            model,
            retry,
            fallback_tokens,
        }
    }

    /// Summarize the background of `turns`. Never fails: on capability
    /// failure the raw background is truncated and marked degraded.
    pub async fn compress(&self, turns: &[ConversationTurn], salient: &[SalienceItem]) -> BackgroundOutcome {
        let text = background_text(turns, salient);
        if text.is_empty() {
            return BackgroundOutcome::default();
        }

        let request = SummaryRequest { text };
        let result = self
            .retry
            .run("summarize", || self.model.summarize(&request))
            .await
            .and_then(|summary| {
                let summary = summary.trim().to_string();
                if summary.is_empty() {
                    Err(CapabilityError::MalformedResponse("empty summary".into()))
                } else {
                    Ok(summary)
                }
            });

        match result {
            Ok(summary) => {
                debug!(
                    background_chars = request.text.len(),
                    summary_chars = summary.len(),
                    "background summarized"
                );
                BackgroundOutcome {
                    text: summary,
                    degraded: false,
                    error: None,
                }
            }
            Err(err) => {
                warn!(error = %err, cap_tokens = self.fallback_tokens, "background summarization failed; truncating");
                METRICS.inc_degraded_backgrounds();
                BackgroundOutcome {
                    text: truncate_to_tokens(&request.text, self.fallback_tokens),
                    degraded: true,
                    error: Some(err),
                }
            }
        }
    }
}

impl std::fmt::Debug for BackgroundCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundCompressor")
            .field("retry", &self.retry)
            .field("fallback_tokens", &self.fallback_tokens)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Category;
    use crate::fakes::ScriptedSummarizer;
    use crate::tokens::estimate_tokens;

    fn turns() -> Vec<ConversationTurn> {
        vec![
            ConversationTurn::user(1, "Hi there. We must not change the database schema."),
            ConversationTurn::assistant(2, "Sure, looking at the auth module now."),
            ConversationTurn::user(3, "Budget is $10K"),
        ]
    }

    fn salient() -> Vec<SalienceItem> {
        vec![
            SalienceItem::new("We must not change the database schema.", Category::Constraint, 1, 1.0),
            SalienceItem::new("Budget is $10K", Category::Fact, 3, 0.5),
        ]
    }

    #[test]
    fn test_background_excludes_salient_spans() {
        let text = background_text(&turns(), &salient());
        assert!(text.contains("Turn 1 (user): Hi there."));
        assert!(!text.contains("database schema"));
        assert!(text.contains("Turn 2 (assistant): Sure, looking at the auth module now."));
        assert!(!text.contains("Turn 3"));
    }

    #[test]
    fn test_span_only_removed_from_cited_turn() {
        let turns = vec![
            ConversationTurn::user(1, "Budget is $10K"),
            ConversationTurn::user(2, "Budget is $10K"),
        ];
        let items = vec![SalienceItem::new("Budget is $10K", Category::Fact, 2, 0.5)];
        assert_eq!(background_text(&turns, &items), "Turn 1 (user): Budget is $10K");
    }

    #[tokio::test]
    async fn test_summary_success() {
        let model = Arc::new(ScriptedSummarizer::fixed("  The user greeted the assistant.  "));
        let c = BackgroundCompressor::new(model.clone(), RetryPolicy::no_retry(1_000), 500);
        let out = c.compress(&turns(), &salient()).await;
        assert_eq!(out.text, "The user greeted the assistant.");
        assert!(!out.degraded);
        assert_eq!(model.calls(), 1);
        assert!(!model.requests()[0].text.contains("database schema"));
    }

    #[tokio::test]
    async fn test_failure_truncates_and_marks_degraded() {
        let long = "word ".repeat(400);
        let turns = vec![ConversationTurn::user(1, long)];
        let model = Arc::new(ScriptedSummarizer::failing(CapabilityError::RateLimited("429".into())));
        let c = BackgroundCompressor::new(model, RetryPolicy::no_retry(1_000), 50);
        let out = c.compress(&turns, &[]).await;
        assert!(out.degraded);
        assert!(out.error.is_some());
        assert!(out.text.starts_with("Turn 1 (user): word"));
        assert!(estimate_tokens(&out.text) <= 50);
    }

    #[tokio::test]
    async fn test_empty_background_skips_capability() {
        let model = Arc::new(ScriptedSummarizer::fixed("unused"));
        let c = BackgroundCompressor::new(model.clone(), RetryPolicy::no_retry(1_000), 500);
        let turns = vec![ConversationTurn::user(3, "Budget is $10K")];
        let out = c.compress(&turns, &salient()).await;
        assert_eq!(out, BackgroundOutcome::default());
        assert_eq!(model.calls(), 0);
    }
}
