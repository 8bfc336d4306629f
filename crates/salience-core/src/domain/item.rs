//! Salience items: verbatim goal-critical fragments of the conversation.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tokens::estimate_tokens;

// Keyword patterns for untagged quotes. Literal patterns; `None` only if the
// regex engine rejects them, in which case inference falls through to `Fact`.
static CONSTRAINT_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(must|must not|mustn't|cannot|can't|required|should not|shouldn't|forbidden|prohibited|never)\b",
    )
    .ok()
});

static DECISION_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(chose|decided|selected|will use|going with|picked|opted)\b").ok()
});

static GOAL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\b(goal|objective|the task is|we need to|aim is)\b").ok());

fn matches(re: &LazyLock<Option<Regex>>, text: &str) -> bool {
    let re: &Option<Regex> = re;
    re.as_ref().is_some_and(|re| re.is_match(text))
}

/// Closed set of salience categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Goal,
    Constraint,
    Decision,
    Fact,
    Other,
}

impl Category {
    /// All categories in render order.
    pub const ALL: [Category; 5] = [
        Category::Goal,
        Category::Constraint,
        Category::Decision,
        Category::Fact,
        Category::Other,
    ];

    /// Retention weight used by budget eviction.
    pub fn weight(self) -> u8 {
        match self {
            Self::Goal | Self::Constraint => 4,
            Self::Decision => 3,
            Self::Fact => 2,
            Self::Other => 1,
        }
    }

    /// Criticality assumed when the extractor supplies none.
    pub fn default_criticality(self) -> f64 {
        match self {
            Self::Goal | Self::Constraint => 1.0,
            Self::Decision => 0.75,
            Self::Fact => 0.5,
            Self::Other => 0.25,
        }
    }

    /// Section heading in the rendered salience block.
    pub fn heading(self) -> &'static str {
        match self {
            Self::Goal => "Goals",
            Self::Constraint => "Constraints",
            Self::Decision => "Decisions",
            Self::Fact => "Facts",
            Self::Other => "Other",
        }
    }

    /// Lenient parse of a model-provided tag. Unknown tags map to `Other`.
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "goal" | "goals" | "objective" => Self::Goal,
            "constraint" | "constraints" | "requirement" | "requirements" => Self::Constraint,
            "decision" | "decisions" => Self::Decision,
            "fact" | "facts" | "tool_output" | "tool output" => Self::Fact,
            _ => Self::Other,
        }
    }

    /// Keyword-based category for untagged quotes.
    pub fn infer(text: &str) -> Self {
        if matches(&CONSTRAINT_RE, text) {
            Self::Constraint
        } else if matches(&DECISION_RE, text) {
            Self::Decision
        } else if matches(&GOAL_RE, text) {
            Self::Goal
        } else {
            Self::Fact
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Goal => write!(f, "goal"),
            Self::Constraint => write!(f, "constraint"),
            Self::Decision => write!(f, "decision"),
            Self::Fact => write!(f, "fact"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// A verbatim fragment judged goal-critical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalienceItem {
    /// Stable identity: digest prefix of the text the item was created with.
    pub id: String,
    pub text: String,
    pub categories: BTreeSet<Category>,
    pub source_turn_id: u64,
    pub criticality: f64,
    /// Empty when the embedding capability was unavailable at insert time.
    pub embedding: Vec<f32>,
    pub tokens: usize,
    /// Insertion ordinal inside the owning set; assigned on insert.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
}

impl SalienceItem {
    pub fn new(
        text: impl Into<String>,
        category: Category,
        source_turn_id: u64,
        criticality: f64,
    ) -> Self {
        let text = text.into();
        Self {
            id: item_id(&text),
            tokens: estimate_tokens(&text),
            categories: BTreeSet::from([category]),
            source_turn_id,
            criticality: criticality.clamp(0.0, 1.0),
            embedding: Vec::new(),
            seq: 0,
            created_at: Utc::now(),
            text,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    /// Highest-weight category; goal wins ties with constraint.
    pub fn category(&self) -> Category {
        self.categories
            .iter()
            .copied()
            .min_by_key(|c| (Reverse(c.weight()), *c))
            .unwrap_or(Category::Other)
    }

    pub fn has_embedding(&self) -> bool {
        !self.embedding.is_empty()
    }

    /// Fold a near-duplicate into this item.
    ///
    /// Keeps the longer verbatim text (with the turn and embedding that belong
    /// to it), unions categories, and takes the higher criticality. Identity
    /// and insertion position are unchanged.
    pub fn absorb(&mut self, other: SalienceItem) {
        if other.text.chars().count() > self.text.chars().count() {
            self.text = other.text;
            self.tokens = other.tokens;
            self.source_turn_id = other.source_turn_id;
            if other.embedding.is_empty() {
                self.embedding.clear();
            } else {
                self.embedding = other.embedding;
            }
        }
        self.categories.extend(other.categories);
        self.criticality = self.criticality.max(other.criticality);
    }
}

/// 12-hex-char digest of the whitespace-normalized text.
pub fn item_id(text: &str) -> String {
    let normalized = crate::domain::normalize_whitespace(text);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..12].to_string()
}
