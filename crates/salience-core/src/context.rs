//! Rendered context format.
//!
//! A compressed context is a sequence of delimited sections: the protected
//! core (authoritative), the salient items (verbatim), the background
//! (paraphrased) and, on success paths, the most recent raw turns. Empty
//! sections are omitted; present ones are separated by a blank line.

use serde::{Deserialize, Serialize};

use crate::domain::{render_turns, ConversationTurn};
use crate::tokens::estimate_tokens;

pub const BACKGROUND_HEADER: &str = "=== BACKGROUND SUMMARY (PARAPHRASED) ===";
pub const DEGRADED_BACKGROUND_HEADER: &str = "=== BACKGROUND (TRUNCATED, NOT SUMMARIZED) ===";
pub const BACKGROUND_FOOTER: &str = "=== END BACKGROUND ===";
pub const RECENT_HEADER: &str = "=== RECENT TURNS (VERBATIM) ===";
pub const RECENT_FOOTER: &str = "=== END RECENT TURNS ===";

pub const SECTION_SEPARATOR: &str = "\n\n";

/// Join the non-empty sections in order.
pub fn join_sections<I, S>(sections: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    sections
        .into_iter()
        .filter(|s| !s.as_ref().trim().is_empty())
        .map(|s| s.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(SECTION_SEPARATOR)
}

pub fn render_background(text: &str, degraded: bool) -> String {
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }
    let header = if degraded {
        DEGRADED_BACKGROUND_HEADER
    } else {
        BACKGROUND_HEADER
    };
    format!("{header}\n{text}\n{BACKGROUND_FOOTER}")
}

pub fn render_recent(turns: &[ConversationTurn]) -> String {
    if turns.is_empty() {
        return String::new();
    }
    format!("{RECENT_HEADER}\n{}\n{RECENT_FOOTER}", render_turns(turns))
}

/// The sections of one compression result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedContext {
    pub core: String,
    pub salience: String,
    pub background: String,
    pub recent: String,
}

impl CompressedContext {
    /// Core plus salience only; the shape of every fallback output.
    pub fn fallback(core: String, salience: String) -> Self {
        Self {
            core,
            salience,
            ..Self::default()
        }
    }

    pub fn render(&self) -> String {
        join_sections([&self.core, &self.salience, &self.background, &self.recent])
    }

    pub fn tokens(&self) -> usize {
        estimate_tokens(&self.render())
    }

    pub fn is_empty(&self) -> bool {
        self.render().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_skips_empty_sections() {
        assert_eq!(join_sections(["a", "", "  ", "b"]), "a\n\nb");
        assert_eq!(join_sections(Vec::<String>::new()), "");
    }

    #[test]
    fn test_fallback_is_core_then_salience() {
        let ctx = CompressedContext::fallback("CORE".into(), "SET".into());
        assert_eq!(ctx.render(), "CORE\n\nSET");
        let ctx = CompressedContext::fallback("CORE".into(), String::new());
        assert_eq!(ctx.render(), "CORE");
    }

    #[test]
    fn test_background_marks_degradation() {
        assert!(render_background("summary", false).starts_with(BACKGROUND_HEADER));
        assert!(render_background("raw", true).starts_with(DEGRADED_BACKGROUND_HEADER));
        assert_eq!(render_background("   ", false), "");
    }

    #[test]
    fn test_full_order() {
        let ctx = CompressedContext {
            core: "C".into(),
            salience: "S".into(),
            background: render_background("B", false),
            recent: render_recent(&[ConversationTurn::user(9, "hi")]),
        };
        let out = ctx.render();
        let c = out.find('C').unwrap();
        let s = out.find("\nS\n").unwrap();
        let b = out.find(BACKGROUND_HEADER).unwrap();
        let r = out.find(RECENT_HEADER).unwrap();
        assert!(c < s && s < b && b < r);
        assert!(out.contains("Turn 9 (user): hi"));
    }
}
