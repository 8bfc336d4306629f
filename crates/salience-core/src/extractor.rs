//! Salience extraction: ask the model for verbatim goal-critical quotes and
//! keep only the ones that really occur in the window.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::capability::{ExtractedQuote, ExtractionModel, ExtractionRequest};
use crate::domain::{
    contains_normalized, CapabilityError, Category, ConversationTurn, SalienceItem,
    ValidationError,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::protected_core::ProtectedCore;
use crate::retry::RetryPolicy;

/// Instruction sent with every extraction request.
pub const EXTRACTION_INSTRUCTION: &str = "\
You are performing selective salience extraction for context compression.

From the conversation, extract ONLY the information that will directly impact \
the agent's ability to achieve the user's goal.

Include:
- Explicit goals and goal changes
- Hard constraints (must/must not)
- Key decisions with rationales
- Critical facts or requirements
- Important tool outputs that affect future actions

Do NOT include:
- Conversational scaffolding
- Redundant explanations
- Intermediate reasoning steps
- Off-topic tangents

CRITICAL: Quote exactly. Do not summarize or paraphrase. Every quote must be a \
literal substring of a single turn.

Output format (JSON):
{\"salient_items\": [{\"quote\": \"exact quote\", \"category\": \"goal|constraint|decision|fact|other\", \"turn_id\": 3}]}";

/// Result of one extraction call.
#[derive(Debug, Clone, Default)]
pub struct ExtractionOutcome {
    /// Validated candidates, in the order the model returned them.
    pub candidates: Vec<SalienceItem>,
    /// Quotes discarded by validation.
    pub rejected: Vec<ValidationError>,
    /// Set when the capability call failed after retries.
    pub error: Option<CapabilityError>,
}

impl ExtractionOutcome {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Wraps the extraction capability with retry and verbatim validation.
#[derive(Clone)]
pub struct SalienceExtractor {
    model: Arc<dyn ExtractionModel>,
    retry: RetryPolicy,
}

impl SalienceExtractor {
    pub fn new(model: Arc<dyn ExtractionModel>, retry: RetryPolicy) -> Self {
        Self { model, retry }
    }

    /// Extract candidates from `window`. Never returns an error: a failed
    /// call yields an empty outcome with `error` set.
    pub async fn extract(&self, window: &[ConversationTurn], core: &ProtectedCore) -> ExtractionOutcome {
        if window.is_empty() {
            return ExtractionOutcome::default();
        }

        let request = ExtractionRequest {
            window: window.to_vec(),
            goal: core.goal().to_string(),
            constraints: core.constraints().to_vec(),
            instruction: EXTRACTION_INSTRUCTION.to_string(),
        };

        let quotes = match self
            .retry
            .run("extract", || self.model.extract(&request))
            .await
        {
            Ok(quotes) => quotes,
            Err(err) => {
                warn!(error = %err, turns = window.len(), "salience extraction failed");
                return ExtractionOutcome {
                    error: Some(err),
                    ..ExtractionOutcome::default()
                };
            }
        };

        let returned = quotes.len();
        let mut outcome = ExtractionOutcome::default();
        for quote in quotes {
            match validate_quote(quote, window) {
                Ok(item) => outcome.candidates.push(item),
                Err(err) => {
                    obs::emit_quote_rejected(&err);
                    METRICS.inc_quotes_rejected();
                    outcome.rejected.push(err);
                }
            }
        }
        debug!(
            returned,
            accepted = outcome.candidates.len(),
            rejected = outcome.rejected.len(),
            "salience extraction validated"
        );
        outcome
    }
}

impl std::fmt::Debug for SalienceExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SalienceExtractor")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Turn an untrusted quote into a salience item, or reject it.
///
/// The quote must occur (modulo whitespace) in some turn of the window. The
/// cited turn is preferred; otherwise the earliest containing turn is used.
/// The quote text itself is never rewritten beyond trimming.
pub fn validate_quote(
    quote: ExtractedQuote,
    window: &[ConversationTurn],
) -> Result<SalienceItem, ValidationError> {
    let text = quote.quote.trim();
    if text.is_empty() {
        return Err(ValidationError::EmptyQuote);
    }

    let cited = quote
        .turn_id
        .and_then(|id| window.iter().find(|t| t.id == id))
        .filter(|t| contains_normalized(&t.content, text));
    let source = cited.or_else(|| window.iter().find(|t| contains_normalized(&t.content, text)));

    let Some(source) = source else {
        return Err(match quote.turn_id {
            Some(turn_id) if !window.iter().any(|t| t.id == turn_id) => {
                ValidationError::UnknownTurn { turn_id }
            }
            _ => ValidationError::QuoteNotFound {
                quote: text.to_string(),
            },
        });
    };

    let category = quote.category.unwrap_or_else(|| Category::infer(text));
    let criticality = quote
        .criticality
        .filter(|c| c.is_finite())
        .unwrap_or_else(|| category.default_criticality());

    Ok(SalienceItem::new(text, category, source.id, criticality))
}

/// Parse a model's extraction reply.
///
/// Accepts `{"salient_items": [...]}` (or `"items"`) or a bare array, where
/// each element is either a plain quote string or an object with `quote`
/// (or `text`), optional `category`, `turn_id`, `criticality`. Markdown code
/// fences around the JSON are ignored.
pub fn parse_extraction_response(raw: &str) -> Result<Vec<ExtractedQuote>, CapabilityError> {
    let body = strip_code_fence(raw);
    let value: Value = serde_json::from_str(body)
        .map_err(|e| CapabilityError::MalformedResponse(format!("extraction reply is not JSON: {e}")))?;

    let list = match &value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("salient_items").or_else(|| map.get("items")) {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(CapabilityError::MalformedResponse(
                    "extraction reply has no salient_items list".into(),
                ))
            }
        },
        _ => {
            return Err(CapabilityError::MalformedResponse(
                "extraction reply is neither a list nor an object".into(),
            ))
        }
    };

    let mut quotes = Vec::with_capacity(list.len());
    for entry in list {
        match entry {
            Value::String(s) => quotes.push(ExtractedQuote::new(s.clone())),
            Value::Object(obj) => {
                let Some(text) = obj
                    .get("quote")
                    .or_else(|| obj.get("text"))
                    .and_then(Value::as_str)
                else {
                    warn!("extraction entry without quote text skipped");
                    continue;
                };
                quotes.push(ExtractedQuote {
                    quote: text.to_string(),
                    category: obj.get("category").and_then(Value::as_str).map(Category::parse),
                    turn_id: obj
                        .get("turn_id")
                        .or_else(|| obj.get("source_turn_id"))
                        .and_then(Value::as_u64),
                    criticality: obj.get("criticality").and_then(Value::as_f64),
                });
            }
            _ => warn!("extraction entry of unexpected type skipped"),
        }
    }
    Ok(quotes)
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
