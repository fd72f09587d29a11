//! Retain counts for cache keys.

use std::collections::HashMap;
use std::time::Duration;
use strata_core::CacheKey;
use tokio::time::Instant;

/// Tracks how many holders each key has and how long zero-count keys have
/// been idle. A key becomes collectable once it has sat at zero for the
/// retention period.
pub(crate) struct RefCounts {
    counts: HashMap<CacheKey, usize>,
    idle_since: HashMap<CacheKey, Instant>,
    retention: Duration,
}

impl RefCounts {
    pub(crate) fn new(retention: Duration) -> Self {
        Self {
            counts: HashMap::new(),
            idle_since: HashMap::new(),
            retention,
        }
    }

    /// Start tracking `key` at zero if it is not tracked yet.
    pub(crate) fn register(&mut self, key: CacheKey, now: Instant) {
        if !self.counts.contains_key(&key) {
            self.counts.insert(key, 0);
            self.idle_since.insert(key, now);
        }
    }

    pub(crate) fn retain(&mut self, key: CacheKey) {
        *self.counts.entry(key).or_insert(0) += 1;
        self.idle_since.remove(&key);
    }

    pub(crate) fn release(&mut self, key: CacheKey, now: Instant) {
        let Some(count) = self.counts.get_mut(&key) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle_since.insert(key, now);
        }
    }

    pub(crate) fn count(&self, key: CacheKey) -> usize {
        self.counts.get(&key).copied().unwrap_or(0)
    }

    /// Remove and return every key idle for at least the retention period.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<CacheKey> {
        let retention = self.retention;
        let expired: Vec<CacheKey> = self
            .idle_since
            .iter()
            .filter(|(_, since)| now.saturating_duration_since(**since) >= retention)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            self.idle_since.remove(key);
            self.counts.remove(key);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::CacheKeys;

    #[test]
    fn test_release_to_zero_starts_retention_clock() {
        let mut keys = CacheKeys::new();
        let k = keys.object("Employee", &1.into());
        let mut rc = RefCounts::new(Duration::from_secs(60));
        let t0 = Instant::now();

        rc.register(k, t0);
        rc.retain(k);
        rc.retain(k);
        assert_eq!(rc.count(k), 2);
        assert!(rc.take_expired(t0 + Duration::from_secs(120)).is_empty());

        rc.release(k, t0);
        rc.release(k, t0);
        assert_eq!(rc.count(k), 0);
        assert!(rc.take_expired(t0 + Duration::from_secs(30)).is_empty());
        assert_eq!(rc.take_expired(t0 + Duration::from_secs(60)), vec![k]);
        assert_eq!(rc.count(k), 0);
    }

    #[test]
    fn test_retain_cancels_pending_expiry() {
        let mut keys = CacheKeys::new();
        let k = keys.object("Employee", &1.into());
        let mut rc = RefCounts::new(Duration::ZERO);
        let t0 = Instant::now();
        rc.register(k, t0);
        rc.retain(k);
        assert!(rc.take_expired(t0).is_empty());
        rc.release(k, t0);
        rc.release(k, t0);
        assert_eq!(rc.count(k), 0);
        assert_eq!(rc.take_expired(t0), vec![k]);
    }
}
