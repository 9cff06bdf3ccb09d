use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

/// Process-wide record of idempotency keys already handled.
///
/// Entries expire after `ttl`; once `max_entries` keys are held the least
/// recently inserted one is dropped. Each key remembers its exam so a new run
/// of that exam can start from a clean slate.
#[derive(Debug)]
pub(crate) struct GlobalDedup {
    ttl: Duration,
    seen: Mutex<LruCache<String, SeenKey>>,
}

#[derive(Debug, Clone)]
struct SeenKey {
    exam_code: String,
    inserted_at: Instant,
}

impl GlobalDedup {
    pub(crate) fn new(ttl: Duration, max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self { ttl, seen: Mutex::new(LruCache::new(capacity)) }
    }

    /// Returns `true` the first time `key` is offered (within its TTL).
    pub(crate) fn check_and_insert(&self, exam_code: &str, key: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);

        // peek: a lookup must not refresh the eviction order.
        if let Some(entry) = seen.peek(key) {
            if now.saturating_duration_since(entry.inserted_at) < self.ttl {
                return false;
            }
        }

        seen.put(key.to_string(), SeenKey { exam_code: exam_code.to_string(), inserted_at: now });
        true
    }

    /// Forgets a key whose handling failed so a redelivery is not dropped.
    pub(crate) fn forget(&self, key: &str) {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).pop(key);
    }

    /// Drops every key recorded for `exam_code`; returns how many were removed.
    pub(crate) fn clear_exam(&self, exam_code: &str) -> usize {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let keys: Vec<String> = seen
            .iter()
            .filter(|(_, entry)| entry.exam_code == exam_code)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            seen.pop(key);
        }
        keys.len()
    }

    pub(crate) fn prune(&self) -> usize {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<String> = seen
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.inserted_at) >= self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            seen.pop(key);
        }
        expired.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_offer_is_rejected() {
        let dedup = GlobalDedup::new(Duration::from_secs(60), 10);
        assert!(dedup.check_and_insert("EX1", "header/EX1/a.png"));
        assert!(!dedup.check_and_insert("EX1", "header/EX1/a.png"));
        assert!(dedup.check_and_insert("EX1", "header/EX1/b.png"));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn oldest_keys_are_evicted_at_capacity() {
        let dedup = GlobalDedup::new(Duration::from_secs(60), 2);
        assert!(dedup.check_and_insert("EX1", "a"));
        assert!(dedup.check_and_insert("EX1", "b"));
        assert!(!dedup.check_and_insert("EX1", "a"));
        assert!(dedup.check_and_insert("EX1", "c"));
        assert_eq!(dedup.len(), 2);
        assert!(dedup.check_and_insert("EX1", "a"));
        assert!(!dedup.check_and_insert("EX1", "c"));
    }

    #[test]
    fn forgotten_keys_are_accepted_again() {
        let dedup = GlobalDedup::new(Duration::from_secs(60), 10);
        assert!(dedup.check_and_insert("EX1", "a"));
        dedup.forget("a");
        assert!(dedup.check_and_insert("EX1", "a"));
        assert!(!dedup.check_and_insert("EX1", "a"));
    }

    #[test]
    fn clear_exam_only_drops_that_exams_keys() {
        let dedup = GlobalDedup::new(Duration::from_secs(60), 10);
        assert!(dedup.check_and_insert("EX1", "header/EX1/a.png"));
        assert!(dedup.check_and_insert("EX1", "header/EX1/b.png"));
        assert!(dedup.check_and_insert("EX2", "header/EX2/a.png"));

        assert_eq!(dedup.clear_exam("EX1"), 2);
        assert_eq!(dedup.len(), 1);
        assert!(dedup.check_and_insert("EX1", "header/EX1/a.png"));
        assert!(!dedup.check_and_insert("EX2", "header/EX2/a.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire_after_ttl() {
        let dedup = GlobalDedup::new(Duration::from_secs(30), 10);
        assert!(dedup.check_and_insert("EX1", "a"));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!dedup.check_and_insert("EX1", "a"));

        tokio::time::advance(Duration::from_secs(25)).await;
        assert_eq!(dedup.prune(), 1);
        assert!(dedup.check_and_insert("EX1", "a"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_key_is_accepted_without_prune() {
        let dedup = GlobalDedup::new(Duration::from_secs(30), 10);
        assert!(dedup.check_and_insert("EX1", "a"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(dedup.check_and_insert("EX1", "a"));
        assert!(!dedup.check_and_insert("EX1", "a"));
        assert_eq!(dedup.prune(), 0);
    }
}
