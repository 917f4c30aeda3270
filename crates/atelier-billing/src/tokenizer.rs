//! Input-token estimation.
//!
//! Pre-call budgeting needs a fast upper-bound estimate, not provider-exact
//! tokenization; the safety buffer in the billing config absorbs the error.
//! Estimates are cached per input fingerprint since planners re-send the
//! same prompt across repair rounds.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

/// Rough chars-per-token ratio for English-ish text.
const CHARS_PER_TOKEN: u64 = 4;
/// Per-request framing overhead.
const REQUEST_OVERHEAD_TOKENS: u64 = 3;
const MAX_CACHE_ENTRIES: usize = 10_000;

pub struct TokenEstimator {
    cache: Mutex<HashMap<u64, u64>>,
}

impl TokenEstimator {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn fingerprint(model: &str, text: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        model.hash(&mut hasher);
        text.hash(&mut hasher);
        hasher.finish()
    }

    /// Estimate input tokens for a request body.
    pub fn estimate_input_tokens(&self, model: &str, text: &str) -> u64 {
        let fingerprint = Self::fingerprint(model, text);
        if let Ok(cache) = self.cache.lock() {
            if let Some(cached) = cache.get(&fingerprint) {
                return *cached;
            }
        }

        let chars = text.chars().count() as u64;
        let estimate = chars.div_ceil(CHARS_PER_TOKEN) + REQUEST_OVERHEAD_TOKENS;

        if let Ok(mut cache) = self.cache.lock() {
            if cache.len() >= MAX_CACHE_ENTRIES {
                cache.clear();
            }
            cache.insert(fingerprint, estimate);
        }
        estimate
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_scales_with_length() {
        let estimator = TokenEstimator::new();
        let short = estimator.estimate_input_tokens("gpt-4o", "hi");
        let long = estimator.estimate_input_tokens("gpt-4o", &"word ".repeat(100));
        assert!(long > short);
    }

    #[test]
    fn empty_input_is_just_overhead() {
        let estimator = TokenEstimator::new();
        assert_eq!(
            estimator.estimate_input_tokens("gpt-4o", ""),
            REQUEST_OVERHEAD_TOKENS
        );
    }

    #[test]
    fn cached_estimates_are_stable() {
        let estimator = TokenEstimator::new();
        let first = estimator.estimate_input_tokens("gpt-4o", "same text");
        let second = estimator.estimate_input_tokens("gpt-4o", "same text");
        assert_eq!(first, second);
    }
}
