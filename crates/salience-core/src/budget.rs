//! Token budget enforcement for the salience set.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::domain::SalienceItem;
use crate::salience_set::SalienceSet;

/// Token budget shared by the protected core and the salience set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub max_tokens: usize,
    /// Salience set tokens plus protected core tokens.
    pub current_tokens: usize,
}

impl TokenBudget {
    /// Tokens still free; zero when over budget.
    pub fn remaining(&self) -> usize {
        self.max_tokens.saturating_sub(self.current_tokens)
    }

    /// Whether usage is within `max_tokens`.
    pub fn is_satisfied(&self) -> bool {
        self.current_tokens <= self.max_tokens
    }
}

/// Result of one enforcement pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Enforcement {
    /// Removed items, in eviction order.
    pub evicted: Vec<SalienceItem>,
    /// Usage after enforcement, reservation included.
    pub budget: TokenBudget,
}

/// Evicts the lowest-priority items until the set fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudgetEnforcer {
    max_tokens: usize,
}

impl TokenBudgetEnforcer {
    /// Enforcer for a budget of `max_tokens`, core included.
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Tokens available to the set once `reserved_tokens` (the protected
    /// core) are taken out.
    pub fn available(&self, reserved_tokens: usize) -> usize {
        self.max_tokens.saturating_sub(reserved_tokens)
    }

    /// Eviction order: lower criticality first, then lower category weight,
    /// then older insertion.
    pub fn eviction_order(a: &SalienceItem, b: &SalienceItem) -> Ordering {
        a.criticality
            .total_cmp(&b.criticality)
            .then_with(|| a.category().weight().cmp(&b.category().weight()))
            .then_with(|| a.seq.cmp(&b.seq))
    }

    /// Bring `set` within budget. A set that already fits is left untouched,
    /// so repeated enforcement is a no-op.
    pub fn enforce(&self, set: &mut SalienceSet, reserved_tokens: usize) -> Enforcement {
        let available = self.available(reserved_tokens);
        let mut evicted = Vec::new();

        if set.total_tokens() > available {
            let mut ranked: Vec<&SalienceItem> = set.iter().collect();
            ranked.sort_by(|a, b| Self::eviction_order(a, b));

            let mut remaining = set.total_tokens();
            let victims: Vec<String> = ranked
                .into_iter()
                .take_while(|item| {
                    if remaining <= available {
                        return false;
                    }
                    remaining -= item.tokens;
                    true
                })
                .map(|item| item.id.clone())
                .collect();

            for id in victims {
                if let Some(item) = set.remove(&id) {
                    evicted.push(item);
                }
            }
        }

        Enforcement {
            evicted,
            budget: TokenBudget {
                max_tokens: self.max_tokens,
                current_tokens: set.total_tokens() + reserved_tokens,
            },
        }
    }
}
