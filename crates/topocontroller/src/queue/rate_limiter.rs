//! Per-item exponential backoff

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

/// Default delay for the first retry of an item.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default upper bound for any retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Tracks consecutive failures per item and hands out retry delays of
/// `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone)]
pub struct ItemExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: HashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> ItemExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Delay before the next retry of `item`. Counts as one more failure.
    pub fn when(&mut self, item: &K) -> Duration {
        let failures = self.failures.entry(item.clone()).or_insert(0);
        let exponent = *failures;
        *failures = failures.saturating_add(1);

        2u32.checked_pow(exponent)
            .and_then(|multiplier| self.base.checked_mul(multiplier))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Number of retries handed out for `item` since it was last forgotten.
    pub fn num_requeues(&self, item: &K) -> u32 {
        self.failures.get(item).copied().unwrap_or(0)
    }

    /// Clear the failure history of `item`.
    pub fn forget(&mut self, item: &K) {
        self.failures.remove(item);
    }
}

impl<K: Eq + Hash + Clone> Default for ItemExponentialBackoff<K> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let mut limiter = ItemExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(5));
        let key = "ns/a".to_string();

        assert_eq!(limiter.when(&key), Duration::from_millis(10));
        assert_eq!(limiter.when(&key), Duration::from_millis(20));
        assert_eq!(limiter.when(&key), Duration::from_millis(40));
        assert_eq!(limiter.num_requeues(&key), 3);
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut limiter = ItemExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let key = "ns/a".to_string();

        let delays: Vec<_> = (0..40).map(|_| limiter.when(&key)).collect();
        assert_eq!(delays[4], Duration::from_secs(1));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(1)));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_forget_resets_and_items_are_independent() {
        let mut limiter = ItemExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(5));
        let a = "ns/a".to_string();
        let b = "ns/b".to_string();

        limiter.when(&a);
        limiter.when(&a);
        assert_eq!(limiter.when(&b), Duration::from_millis(10));

        limiter.forget(&a);
        assert_eq!(limiter.num_requeues(&a), 0);
        assert_eq!(limiter.when(&a), Duration::from_millis(10));
        assert_eq!(limiter.num_requeues(&b), 1);
    }
}
