//! Process-wide token counting.
//!
//! Budgets throughout the crate are expressed in tokens, but the exact
//! tokenizer is a deployment choice. A single counter is installed per
//! process: [`init`] swaps in an override, [`teardown`] drops back to the
//! lazily created default ([`ApproxTokenCounter`], ~4 chars per token).

use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

/// Counts tokens in a piece of text.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Character-ratio approximation.
#[derive(Debug, Clone, Copy)]
pub struct ApproxTokenCounter {
    pub chars_per_token: usize,
}

impl Default for ApproxTokenCounter {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl TokenCounter for ApproxTokenCounter {
    fn count(&self, text: &str) -> usize {
        let chars = text.chars().count();
        chars.div_ceil(self.chars_per_token.max(1))
    }
}

static OVERRIDE: Lazy<RwLock<Option<Arc<dyn TokenCounter>>>> = Lazy::new(|| RwLock::new(None));
static DEFAULT: Lazy<Arc<dyn TokenCounter>> =
    Lazy::new(|| Arc::new(ApproxTokenCounter::default()));

/// Install `counter` for the whole process.
pub fn init(counter: Arc<dyn TokenCounter>) {
    let mut slot = OVERRIDE.write().unwrap_or_else(|e| e.into_inner());
    *slot = Some(counter);
}

/// Remove any override installed by [`init`].
pub fn teardown() {
    let mut slot = OVERRIDE.write().unwrap_or_else(|e| e.into_inner());
    *slot = None;
}

/// The active counter.
pub fn counter() -> Arc<dyn TokenCounter> {
    let slot = OVERRIDE.read().unwrap_or_else(|e| e.into_inner());
    match slot.as_ref() {
        Some(c) => c.clone(),
        None => DEFAULT.clone(),
    }
}

pub fn count_tokens(text: &str) -> usize {
    counter().count(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approx_rounds_up() {
        let c = ApproxTokenCounter::default();
        assert_eq!(c.count(""), 0);
        assert_eq!(c.count("abc"), 1);
        assert_eq!(c.count("abcd"), 1);
        assert_eq!(c.count("abcde"), 2);
    }
}
