//! Token estimation.
//!
//! Model tokenizers are an external concern; the engine budgets with the
//! common ~4 bytes per token approximation so accounting is deterministic.

/// Approximate bytes per model token.
pub const APPROX_BYTES_PER_TOKEN: usize = 4;

/// Estimate token count from text, rounding up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(APPROX_BYTES_PER_TOKEN)
}

/// Truncate `text` to at most `max_tokens` estimated tokens, on a char
/// boundary, appending a marker when anything was cut and the marker fits.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    const MARKER: &str = " ...[truncated]";

    let max_bytes = max_tokens * APPROX_BYTES_PER_TOKEN;
    if text.len() <= max_bytes {
        return text.to_string();
    }
    if max_bytes < MARKER.len() {
        return text[..floor_char_boundary(text, max_bytes)].to_string();
    }
    let cut = floor_char_boundary(text, max_bytes - MARKER.len());
    format!("{}{MARKER}", text[..cut].trim_end())
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_truncate_short_text_untouched() {
        assert_eq!(truncate_to_tokens("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_respects_cap() {
        let text = "word ".repeat(200);
        let out = truncate_to_tokens(&text, 10);
        assert!(estimate_tokens(&out) <= 10);
        assert!(out.ends_with("[truncated]"));
    }

    #[test]
    fn test_truncate_tiny_caps_drop_marker() {
        let text = "a long background paragraph that will not fit";
        for cap in 0..=3 {
            let out = truncate_to_tokens(text, cap);
            assert!(estimate_tokens(&out) <= cap, "cap {cap}: {out:?}");
            assert!(!out.contains("[truncated]"));
        }
        assert_eq!(truncate_to_tokens(text, 0), "");
        assert!(truncate_to_tokens(text, 4).ends_with("[truncated]"));
        assert_eq!(truncate_to_tokens("éé", 0), "");
    }

    #[test]
    fn test_truncate_multibyte_boundary() {
        let text = "é".repeat(100);
        let out = truncate_to_tokens(&text, 8);
        assert!(out.len() <= 32);
        assert!(out.ends_with("[truncated]"));
    }
}
