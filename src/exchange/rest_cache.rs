//! Short-TTL cache for REST-sourced snapshots shared by every adapter.
//!
//! Grounded on `BinancePriceFeed`'s `Arc<RwLock<HashMap<...>>>` price cache:
//! same shape, generalized to a TTL any adapter can reuse for both its
//! last-price snapshot (short TTL, ~2s) and its active-symbols set (long
//! TTL, ~1h) instead of hardcoding one cache per concern.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    fetched_at: Instant,
}

/// A single-slot or keyed TTL cache. `K = ()` degenerates to a single slot,
/// used for the active-symbols set; any other `K` gives a per-key cache,
/// used for last-price lookups.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read();
        entries.get(key).and_then(|entry| {
            if entry.fetched_at.elapsed() < self.ttl {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    pub fn put(&self, key: K, value: V) {
        self.entries.write().insert(
            key,
            Entry {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.write().remove(key);
    }
}

/// Convenience wrapper for the single-slot case (e.g. a venue's full
/// active-symbols set), so callers don't thread a dummy key through.
pub struct SingleSlotCache<V> {
    inner: TtlCache<(), V>,
}

impl<V: Clone> SingleSlotCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: TtlCache::new(ttl),
        }
    }

    pub fn get(&self) -> Option<V> {
        self.inner.get(&())
    }

    pub fn put(&self, value: V) {
        self.inner.put((), value);
    }
}

/// Coalesces concurrent misses for the same key into a single upstream
/// fetch, so a burst of subscribers for one symbol doesn't fan out into N
/// identical REST calls. Mirrors the single-flight pattern the price feed
/// relies on implicitly by serializing through its background poll loop;
/// here it's explicit because requests are caller-driven, not poll-driven.
pub struct SingleFlight<K> {
    inflight: Arc<RwLock<HashMap<K, Arc<tokio::sync::Notify>>>>,
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns `true` if this call is the leader and should perform the
    /// fetch and call [`Self::finish`]; `false` if it should await the
    /// leader's [`tokio::sync::Notify`] and then re-check the cache.
    pub fn begin(&self, key: &K) -> Result<(), Arc<tokio::sync::Notify>> {
        let mut inflight = self.inflight.write();
        if let Some(notify) = inflight.get(key) {
            return Err(notify.clone());
        }
        inflight.insert(key.clone(), Arc::new(tokio::sync::Notify::new()));
        Ok(())
    }

    pub fn finish(&self, key: &K) {
        if let Some(notify) = self.inflight.write().remove(key) {
            notify.notify_waiters();
        }
    }
}

impl<K: Eq + Hash + Clone> Default for SingleFlight<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hit_before_ttl_miss_after() {
        let cache: TtlCache<String, f64> = TtlCache::new(Duration::from_millis(20));
        cache.put("BTCUSDT".to_string(), 65000.0);
        assert_eq!(cache.get(&"BTCUSDT".to_string()), Some(65000.0));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&"BTCUSDT".to_string()), None);
    }

    #[test]
    fn single_slot_cache_holds_one_value() {
        let cache: SingleSlotCache<Vec<String>> = SingleSlotCache::new(Duration::from_secs(60));
        assert_eq!(cache.get(), None);
        cache.put(vec!["BTCUSDT".to_string()]);
        assert_eq!(cache.get(), Some(vec!["BTCUSDT".to_string()]));
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache: TtlCache<String, f64> = TtlCache::new(Duration::from_secs(60));
        cache.put("BTCUSDT".to_string(), 1.0);
        cache.invalidate(&"BTCUSDT".to_string());
        assert_eq!(cache.get(&"BTCUSDT".to_string()), None);
    }

    #[test]
    fn single_flight_second_caller_gets_leader_notify() {
        let sf: SingleFlight<String> = SingleFlight::new();
        assert!(sf.begin(&"BTCUSDT".to_string()).is_ok());
        assert!(sf.begin(&"BTCUSDT".to_string()).is_err());
        sf.finish(&"BTCUSDT".to_string());
        assert!(sf.begin(&"BTCUSDT".to_string()).is_ok());
    }
}
