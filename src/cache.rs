//! Bounded LRU response cache with per-entry TTL (C3).
//!
//! Thread-safe; on lookup, expired entries are purged and counted as misses.
//! On insert, the least-recently-used entry is evicted once the bucket is at
//! capacity. Only successfully-parsed task results are cached -- the caller
//! (the orchestrator / AI engine) decides what's "successfully parsed"; this
//! cache just stores whatever it's given.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    stored_at: Instant,
}

/// An intrusive doubly-linked-list-free LRU: we keep insertion order in a
/// `Vec` of keys and move-to-end on access. Good enough at the cache sizes
/// this component is configured for (tens to low hundreds of entries).
struct Inner {
    map: HashMap<String, Entry>,
    order: Vec<String>,
    hits: u64,
    misses: u64,
}

pub struct ResponseCache {
    inner: Mutex<Inner>,
    max_size: usize,
    ttl: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
}

impl ResponseCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: Vec::new(),
                hits: 0,
                misses: 0,
            }),
            max_size,
            ttl,
        }
    }

    /// Key = SHA-256(task ∥ first 500 chars of payload ∥ provider ∥ model),
    /// truncated to a short hex prefix.
    pub fn make_key(task: &str, payload: &str, provider: &str, model: &str) -> String {
        let prefix: String = payload.chars().take(500).collect();
        let mut hasher = Sha256::new();
        hasher.update(task.as_bytes());
        hasher.update(prefix.as_bytes());
        hasher.update(provider.as_bytes());
        hasher.update(model.as_bytes());
        let digest = hasher.finalize();
        hex_prefix(&digest, 32)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        let expired = match inner.map.get(key) {
            Some(entry) => entry.stored_at.elapsed() > self.ttl,
            None => {
                inner.misses += 1;
                return None;
            }
        };
        if expired {
            inner.map.remove(key);
            inner.order.retain(|k| k != key);
            inner.misses += 1;
            return None;
        }
        if let Some(pos) = inner.order.iter().position(|k| k == key) {
            let k = inner.order.remove(pos);
            inner.order.push(k);
        }
        inner.hits += 1;
        inner.map.get(key).map(|e| e.value.clone())
    }

    pub fn set(&self, key: String, value: String) {
        let mut inner = self.inner.lock();
        if inner.map.contains_key(&key) {
            inner.order.retain(|k| k != &key);
        } else if inner.map.len() >= self.max_size {
            if !inner.order.is_empty() {
                let evicted = inner.order.remove(0);
                inner.map.remove(&evicted);
            }
        }
        inner.order.push(key.clone());
        inner.map.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.map.len(),
            max_size: self.max_size,
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
        .chars()
        .take(len)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_within_ttl() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        let key = ResponseCache::make_key("ioc", "report text", "openai", "gpt-4.1");
        cache.set(key.clone(), "cached-value".to_string());
        assert_eq!(cache.get(&key), Some("cached-value".to_string()));
    }

    #[test]
    fn miss_after_ttl_expires() {
        let cache = ResponseCache::new(10, Duration::from_millis(1));
        let key = ResponseCache::make_key("ioc", "report text", "openai", "gpt-4.1");
        cache.set(key.clone(), "cached-value".to_string());
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.get(&key), None);
    }

    #[test]
    fn evicts_least_recently_used_when_full() {
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        cache.set("a".to_string(), "1".to_string());
        cache.set("b".to_string(), "2".to_string());
        // touch "a" so "b" becomes the LRU victim
        assert_eq!(cache.get("a"), Some("1".to_string()));
        cache.set("c".to_string(), "3".to_string());
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some("1".to_string()));
        assert_eq!(cache.get("c"), Some("3".to_string()));
    }

    #[test]
    fn same_inputs_produce_same_key() {
        let k1 = ResponseCache::make_key("ioc", "abc", "openai", "gpt-4.1");
        let k2 = ResponseCache::make_key("ioc", "abc", "openai", "gpt-4.1");
        assert_eq!(k1, k2);
    }
}
