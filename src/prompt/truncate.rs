//! Token-budget-aware content truncation.
//!
//! Token boundaries don't align with character boundaries, so we bound a
//! binary search by Unicode codepoints rather than bytes: this guarantees
//! every candidate prefix is valid UTF-8 while still converging in
//! `O(log n)` tokenizer calls.

use crate::prelude::*;

/// A safety margin subtracted from every available-token computation, to
/// account for tokenizer drift between our estimate and the provider's.
pub const SAFETY_MARGIN_TOKENS: usize = 10;

/// Something that can count tokens the way a particular model would.
pub trait Tokenizer: Send + Sync {
    /// Count the number of tokens `text` would occupy.
    fn count_tokens(&self, text: &str) -> usize;
}

/// A approximate, dependency-free tokenizer used when no model-specific
/// tokenizer has been configured. It estimates roughly four bytes per token,
/// which is a reasonable approximation for English text across most current
/// model families, while still responding to whitespace structure.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproxTokenizer;

impl Tokenizer for ApproxTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        // Split on whitespace first, since word boundaries are a much
        // better proxy for token boundaries than a flat byte count, then
        // fall back to a byte-based estimate for degenerate inputs (e.g. a
        // single very long "word").
        let word_based: usize = text
            .split_whitespace()
            .map(|word| word.chars().count().div_ceil(4).max(1))
            .sum();
        word_based.max(text.chars().count().div_ceil(4))
    }
}

/// Compute the number of tokens available for the variable `content` slot
/// of a template, given the token count of the envelope (the template
/// rendered with an empty `content`) and the configured `token_limit`.
///
/// Returns `Ok(None)` when `token_limit <= 0`, meaning truncation is
/// disabled entirely ("no limit").
pub fn available_tokens(
    envelope_tokens: usize,
    token_limit: i64,
) -> Result<Option<usize>> {
    if token_limit <= 0 {
        return Ok(None);
    }
    let token_limit = token_limit as usize;
    let needed = envelope_tokens + SAFETY_MARGIN_TOKENS;
    if needed > token_limit {
        return Err(anyhow!(
            "prompt template exceeds token limit: envelope alone needs {needed} tokens, \
             but the limit is {token_limit}"
        ));
    }
    Ok(Some(token_limit - needed))
}

/// Truncate `content` to fit within `budget` tokens, as measured by
/// `tokenizer`.
///
/// If `tokens(content) <= budget`, returns `content` unchanged. Otherwise,
/// binary-searches over a codepoint prefix for the longest prefix whose
/// token count is still `<= budget`.
///
/// Per the open question this resolves: if even a single-codepoint prefix
/// would exceed `budget`, this returns a typed error rather than silently
/// returning an empty string.
pub fn truncate(
    content: &str,
    budget: usize,
    tokenizer: &dyn Tokenizer,
) -> Result<String> {
    if tokenizer.count_tokens(content) <= budget {
        return Ok(content.to_owned());
    }

    let codepoints: Vec<char> = content.chars().collect();
    let mut lo = 0usize;
    let mut hi = codepoints.len();

    // Invariant: tokens(prefix(lo)) <= budget, and we're searching for the
    // largest `mid` for which that still holds.
    if !codepoints.is_empty() {
        let one_codepoint: String = codepoints[..1].iter().collect();
        if tokenizer.count_tokens(&one_codepoint) > budget {
            return Err(anyhow!(
                "budget too small: even a single character exceeds the available {budget} tokens"
            ));
        }
    }

    while lo < hi {
        // Bias the midpoint up so we always make progress even when
        // `hi - lo == 1`.
        let mid = lo + (hi - lo).div_ceil(2);
        let prefix: String = codepoints[..mid].iter().collect();
        if tokenizer.count_tokens(&prefix) <= budget {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }

    let result: String = codepoints[..lo].iter().collect();
    if tokenizer.count_tokens(&result) > budget {
        return Err(anyhow!("truncation failed to converge within budget"));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CharCountTokenizer;
    impl Tokenizer for CharCountTokenizer {
        fn count_tokens(&self, text: &str) -> usize {
            text.chars().count()
        }
    }

    #[test]
    fn test_unchanged_when_within_budget() {
        let result = truncate("hello", 100, &CharCountTokenizer).unwrap();
        assert_eq!(result, "hello");
    }

    #[test]
    fn test_truncates_to_budget() {
        let content = "a".repeat(500);
        let result = truncate(&content, 60, &CharCountTokenizer).unwrap();
        assert_eq!(result.chars().count(), 60);
        assert!(content.starts_with(&result));
    }

    #[test]
    fn test_idempotent() {
        let content = "the quick brown fox ".repeat(50);
        let once = truncate(&content, 60, &CharCountTokenizer).unwrap();
        let twice = truncate(&once, 60, &CharCountTokenizer).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_respects_codepoint_boundaries() {
        // Multi-byte characters must not be split mid-codepoint.
        let content = "\u{1F600}".repeat(100); // emoji, 4 bytes each
        let result = truncate(&content, 10, &CharCountTokenizer).unwrap();
        assert_eq!(result.chars().count(), 10);
        assert!(result.is_char_boundary(result.len()));
    }

    #[test]
    fn test_budget_too_small_errors() {
        struct HugeTokenizer;
        impl Tokenizer for HugeTokenizer {
            fn count_tokens(&self, text: &str) -> usize {
                // Every character costs 1000 tokens.
                text.chars().count() * 1000
            }
        }
        let err = truncate("a", 1, &HugeTokenizer).unwrap_err();
        assert!(err.to_string().contains("budget too small"));
    }

    #[test]
    fn test_available_tokens_disabled_limit() {
        assert_eq!(available_tokens(30, 0).unwrap(), None);
        assert_eq!(available_tokens(30, -5).unwrap(), None);
    }

    #[test]
    fn test_available_tokens_scenario() {
        // From the specification's concrete truncation scenario.
        let available = available_tokens(30, 100).unwrap().unwrap();
        assert_eq!(available, 60);
    }

    #[test]
    fn test_available_tokens_envelope_too_big() {
        assert!(available_tokens(95, 100).is_err());
    }
}
