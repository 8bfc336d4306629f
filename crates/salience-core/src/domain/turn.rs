//! Conversation turns as seen by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// One immutable turn of the conversation. Owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: u64,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(id: u64, role: Role, content: impl Into<String>) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(id: u64, content: impl Into<String>) -> Self {
        Self::new(id, Role::User, content)
    }

    pub fn assistant(id: u64, content: impl Into<String>) -> Self {
        Self::new(id, Role::Assistant, content)
    }

    /// `Turn {id} ({role}): {content}`
    pub fn render(&self) -> String {
        format!("Turn {} ({}): {}", self.id, self.role, self.content)
    }
}

/// Render a window of turns one per line.
pub fn render_turns(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(ConversationTurn::render)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collapse every whitespace run to a single space and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether `needle` occurs in `haystack` once whitespace is normalized.
pub fn contains_normalized(haystack: &str, needle: &str) -> bool {
    let needle = normalize_whitespace(needle);
    !needle.is_empty() && normalize_whitespace(haystack).contains(&needle)
}
