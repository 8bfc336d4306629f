//! The protected core: session goal, hard constraints and key decisions.
//!
//! Never deduplicated, evicted, or compressed. Rendered first in every
//! compressed context, including fallbacks. A core value never changes;
//! goal updates and new decisions produce a new core that the session swaps
//! in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::normalize_whitespace;
use crate::tokens::estimate_tokens;

pub const CORE_HEADER: &str = "=== PROTECTED CORE (AUTHORITATIVE) ===";
pub const CORE_FOOTER: &str = "=== END PROTECTED CORE ===";

/// Rationale recorded for a goal update that gives none.
pub const DEFAULT_GOAL_RATIONALE: &str = "Goal evolution during task execution";

/// A decision the agent committed to, kept with the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDecision {
    pub decision: String,
    pub rationale: String,
    pub recorded_at: DateTime<Utc>,
}

impl KeyDecision {
    pub fn new(decision: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            decision: normalize_whitespace(&decision.into()),
            rationale: normalize_whitespace(&rationale.into()),
            recorded_at: Utc::now(),
        }
    }

    fn render(&self) -> String {
        if self.rationale.is_empty() {
            format!("  - {}", self.decision)
        } else {
            format!("  - {} (Rationale: {})", self.decision, self.rationale)
        }
    }
}

/// Goal/constraint record for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedCore {
    goal: String,
    original_goal: String,
    constraints: Vec<String>,
    #[serde(default)]
    decisions: Vec<KeyDecision>,
    set_at: DateTime<Utc>,
}

impl ProtectedCore {
    /// Build a core. Constraints keep their order; blank entries and exact
    /// duplicates (modulo whitespace) are dropped.
    pub fn new<I, S>(goal: impl Into<String>, constraints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for c in constraints {
            let c = normalize_whitespace(&c.into());
            if !c.is_empty() && !unique.contains(&c) {
                unique.push(c);
            }
        }
        let goal = normalize_whitespace(&goal.into());
        Self {
            original_goal: goal.clone(),
            goal,
            constraints: unique,
            decisions: Vec::new(),
            set_at: Utc::now(),
        }
    }

    /// A copy with `new_goal` as the current goal. The original goal and
    /// constraints carry over; the change is logged as a key decision.
    pub fn with_goal(&self, new_goal: impl Into<String>, rationale: impl Into<String>) -> Self {
        let goal = normalize_whitespace(&new_goal.into());
        let rationale = rationale.into();
        let rationale = if rationale.trim().is_empty() {
            DEFAULT_GOAL_RATIONALE.to_string()
        } else {
            rationale
        };
        let mut next = self.clone();
        next.decisions
            .push(KeyDecision::new(format!("Goal updated to: {goal}"), rationale));
        next.goal = goal;
        next.set_at = Utc::now();
        next
    }

    /// A copy with one more key decision.
    pub fn with_decision(&self, decision: impl Into<String>, rationale: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.decisions.push(KeyDecision::new(decision, rationale));
        next.set_at = Utc::now();
        next
    }

    /// The current goal.
    pub fn goal(&self) -> &str {
        &self.goal
    }

    /// The goal the session was initialized with.
    pub fn original_goal(&self) -> &str {
        &self.original_goal
    }

    pub fn goal_changed(&self) -> bool {
        self.goal != self.original_goal
    }

    pub fn constraints(&self) -> &[String] {
        &self.constraints
    }

    pub fn decisions(&self) -> &[KeyDecision] {
        &self.decisions
    }

    pub fn set_at(&self) -> DateTime<Utc> {
        self.set_at
    }

    /// Fixed-format text block. Pure; timestamps are not rendered.
    pub fn render(&self) -> String {
        let or_unspecified = |s: &str| {
            if s.is_empty() {
                "(unspecified)".to_string()
            } else {
                s.to_string()
            }
        };

        let mut lines = vec![
            CORE_HEADER.to_string(),
            format!("Goal: {}", or_unspecified(&self.goal)),
        ];
        if self.goal_changed() {
            lines.push(format!("Original Goal: {}", or_unspecified(&self.original_goal)));
        }
        lines.push(String::new());
        lines.push("Hard Constraints (MUST FOLLOW):".to_string());
        if self.constraints.is_empty() {
            lines.push("  (none)".to_string());
        }
        lines.extend(self.constraints.iter().map(|c| format!("  - {c}")));
        if !self.decisions.is_empty() {
            lines.push(String::new());
            lines.push("Key Decisions:".to_string());
            lines.extend(self.decisions.iter().map(KeyDecision::render));
        }
        lines.push(CORE_FOOTER.to_string());
        lines.join("\n")
    }

    /// Estimated tokens of [`render`](Self::render); reserved out of the budget.
    pub fn tokens(&self) -> usize {
        estimate_tokens(&self.render())
    }
}

impl Default for ProtectedCore {
    fn default() -> Self {
        Self::new(String::new(), Vec::<String>::new())
    }
}
