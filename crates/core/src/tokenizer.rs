//! Tokenizer trait: the abstraction over token counting backends.
//!
//! Counts may be approximate. Callers compare them against a ceiling, so an
//! implementation should rather overestimate than underestimate.

use async_trait::async_trait;

use crate::error::TokenizerError;

/// Bytes per token assumed by the conservative fallback estimate.
pub const FALLBACK_BYTES_PER_TOKEN: f32 = 4.0;

#[async_trait]
pub trait Tokenizer: Send + Sync {
    /// A human-readable name (e.g. "heuristic", "hf:llama3").
    fn name(&self) -> &str;

    /// Count the tokens in `text`.
    fn count(&self, text: &str) -> Result<usize, TokenizerError>;

    /// Asynchronous variant. `padding` is added to the result before the
    /// caller compares it against a budget.
    async fn count_async(&self, text: &str, padding: usize) -> Result<usize, TokenizerError> {
        Ok(self.count(text)? + padding)
    }
}

/// Length-based estimate: 1 token ≈ 4 bytes, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(4)
}

/// A tokenizer that divides the byte length by a fixed ratio.
#[derive(Debug, Clone)]
pub struct HeuristicTokenizer {
    bytes_per_token: f32,
}

impl HeuristicTokenizer {
    pub fn new(bytes_per_token: f32) -> Self {
        let bytes_per_token = if bytes_per_token.is_finite() && bytes_per_token > 0.0 {
            bytes_per_token
        } else {
            FALLBACK_BYTES_PER_TOKEN
        };
        Self { bytes_per_token }
    }
}

impl Default for HeuristicTokenizer {
    fn default() -> Self {
        Self::new(FALLBACK_BYTES_PER_TOKEN)
    }
}

#[async_trait]
impl Tokenizer for HeuristicTokenizer {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn count(&self, text: &str) -> Result<usize, TokenizerError> {
        if text.is_empty() {
            return Ok(0);
        }
        Ok((text.len() as f32 / self.bytes_per_token).ceil() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(HeuristicTokenizer::default().count("").unwrap(), 0);
    }

    #[test]
    fn four_bytes_is_one_token() {
        assert_eq!(estimate_tokens("test"), 1);
        assert_eq!(HeuristicTokenizer::default().count("test").unwrap(), 1);
    }

    #[test]
    fn five_bytes_rounds_up() {
        assert_eq!(estimate_tokens("hello"), 2);
        assert_eq!(HeuristicTokenizer::default().count("hello").unwrap(), 2);
    }

    #[test]
    fn custom_ratio() {
        let tok = HeuristicTokenizer::new(2.0);
        assert_eq!(tok.count("abcdef").unwrap(), 3);
    }

    #[test]
    fn invalid_ratio_falls_back() {
        let tok = HeuristicTokenizer::new(0.0);
        assert_eq!(tok.count(&"a".repeat(100)).unwrap(), 25);
    }

    #[tokio::test]
    async fn async_count_adds_padding() {
        let tok = HeuristicTokenizer::default();
        assert_eq!(tok.count_async("test", 64).await.unwrap(), 65);
    }
}
