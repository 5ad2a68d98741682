//! Character-ratio token estimator

use serde::Serialize;
use testlog_common::{Error, Result};

pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

/// Estimates tokens as `ceil(chars / chars_per_token)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenEstimator {
    chars_per_token: f64,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl TokenEstimator {
    /// Fails on a non-positive or non-finite ratio.
    pub fn new(chars_per_token: f64) -> Result<Self> {
        if !chars_per_token.is_finite() || chars_per_token <= 0.0 {
            return Err(Error::validation(format!(
                "chars_per_token must be a positive number, got {}",
                chars_per_token
            )));
        }
        Ok(Self { chars_per_token })
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    pub fn estimate_tokens(&self, text: &str) -> usize {
        self.estimate_chars(text.chars().count())
    }

    /// Estimate for a text of `chars` characters.
    pub fn estimate_chars(&self, chars: usize) -> usize {
        if chars == 0 {
            return 0;
        }
        (chars as f64 / self.chars_per_token).ceil() as usize
    }

    pub fn estimate_tokens_batch<S: AsRef<str>>(&self, texts: &[S]) -> Vec<usize> {
        texts.iter().map(|t| self.estimate_tokens(t.as_ref())).collect()
    }

    /// Sum of the per-text estimates.
    pub fn estimate_total_tokens<S: AsRef<str>>(&self, texts: &[S]) -> usize {
        texts.iter().map(|t| self.estimate_tokens(t.as_ref())).sum()
    }

    pub fn exceeds_token_limit(&self, text: &str, max_tokens: usize) -> bool {
        self.estimate_tokens(text) > max_tokens
    }

    /// Largest character count that still estimates to at most `tokens`.
    pub fn max_chars_for_tokens(&self, tokens: usize) -> usize {
        (tokens as f64 * self.chars_per_token).floor() as usize
    }

    /// Estimate for the compact JSON serialization of `value`.
    pub fn estimate_json_tokens<T: Serialize + ?Sized>(&self, value: &T) -> Result<usize> {
        let json = serde_json::to_string(value)?;
        Ok(self.estimate_tokens(&json))
    }
}
