//! Bounded LRU+TTL result cache with an optional byte budget.
//!
//! Ported from the kernel's original `LruTtlCache` (insertion-ordered
//! map, purge-then-evict eviction order) with the byte-budget tracking
//! of its richer sibling implementation folded in. Entries are keyed by
//! a content-addressed [`CacheKey`] derived from a callable's identity
//! and its canonically-serialized arguments, matching `brain_tooling`'s
//! `stable_json_string` sorted-key JSON convention.

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("max_entries must be greater than zero")]
    InvalidMaxEntries,
    #[error("ttl must be greater than zero")]
    InvalidTtl,
    #[error("snapshot serialization failed: {0}")]
    SnapshotFailed(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Content-addressed fingerprint for a cached computation.
///
/// Built from the callable's stable identifier plus the canonical
/// (sorted-key) JSON serialization of its positional and keyword
/// arguments, so semantically identical calls always collide on the
/// same key regardless of argument ordering in the caller's source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build a key from a callable identifier and its canonicalized
    /// argument value (already key-sorted, e.g. via
    /// `brain_tooling::serialization::stable_json_string`).
    pub fn new(callable_id: &str, canonical_args: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        callable_id.hash(&mut hasher);
        canonical_args.hash(&mut hasher);
        Self(format!("{callable_id}:{:016x}", hasher.finish()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build a key directly from a callable identifier and a
    /// `serde_json::Value` of its arguments, canonicalizing the value
    /// via `brain_tooling`'s sorted-key JSON serialization so argument
    /// order in the caller never changes the key.
    pub fn for_call(callable_id: &str, args: &Value) -> Self {
        let canonical = brain_tooling::serialization::stable_json_string(args)
            .unwrap_or_else(|_| args.to_string());
        Self::new(callable_id, &canonical)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SerializableEntry {
    key: String,
    value: Value,
    size_bytes: usize,
    expires_in_secs: f64,
}

struct CacheEntry {
    value: Value,
    expires_at: Instant,
    size_bytes: usize,
}

/// Point-in-time cache statistics, mirroring `get_stats()` on the
/// original implementation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub current_bytes: usize,
    pub max_bytes: Option<usize>,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Inner {
    entries: IndexMap<CacheKey, CacheEntry>,
    max_entries: usize,
    ttl: Duration,
    max_bytes: Option<usize>,
    current_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expired: u64,
}

/// Thread-safe LRU+TTL cache bounded by entry count and, optionally,
/// total estimated byte size.
pub struct Cache {
    inner: Mutex<Inner>,
}

impl Cache {
    pub fn new(max_entries: usize, ttl: Duration) -> Result<Self> {
        if max_entries == 0 {
            return Err(CacheError::InvalidMaxEntries);
        }
        if ttl.is_zero() {
            return Err(CacheError::InvalidTtl);
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                entries: IndexMap::new(),
                max_entries,
                ttl,
                max_bytes: None,
                current_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expired: 0,
            }),
        })
    }

    pub fn with_max_bytes(self, max_bytes: usize) -> Self {
        self.inner.lock().max_bytes = Some(max_bytes);
        self
    }

    /// Retrieve a live value, moving it to the fresh end of the
    /// insertion order on hit. Returns `None` on miss or expiry.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let mut inner = self.inner.lock();
        purge_expired_front(&mut inner);

        let Some(entry) = inner.entries.shift_remove(key) else {
            inner.misses += 1;
            return None;
        };

        if entry.expires_at <= Instant::now() {
            inner.current_bytes = inner.current_bytes.saturating_sub(entry.size_bytes);
            inner.expired += 1;
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        let value = entry.value.clone();
        inner.entries.insert(key.clone(), entry);
        Some(value)
    }

    /// Insert or replace an entry, then evict until all limits hold.
    pub fn set(&self, key: CacheKey, value: Value) {
        let size_bytes = estimate_size(&value, 0);
        let mut inner = self.inner.lock();

        if let Some(old) = inner.entries.shift_remove(&key) {
            inner.current_bytes = inner.current_bytes.saturating_sub(old.size_bytes);
        }

        inner.current_bytes += size_bytes;
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + inner.ttl,
                size_bytes,
            },
        );

        evict_if_needed(&mut inner);
    }

    pub fn delete(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.shift_remove(key) {
            inner.current_bytes = inner.current_bytes.saturating_sub(entry.size_bytes);
            true
        } else {
            false
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.current_bytes = 0;
    }

    pub fn set_limits(&self, max_entries: usize, ttl: Duration, max_bytes: Option<usize>) {
        let mut inner = self.inner.lock();
        inner.max_entries = max_entries.max(1);
        inner.ttl = ttl;
        inner.max_bytes = max_bytes;
        evict_if_needed(&mut inner);
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            max_entries: inner.max_entries,
            current_bytes: inner.current_bytes,
            max_bytes: inner.max_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expired: inner.expired,
        }
    }

    /// Serialize the live (non-expired) entries for disk persistence.
    pub fn snapshot(&self) -> Result<String> {
        let inner = self.inner.lock();
        let now = Instant::now();
        let items: Vec<SerializableEntry> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(k, e)| SerializableEntry {
                key: k.as_str().to_string(),
                value: e.value.clone(),
                size_bytes: e.size_bytes,
                expires_in_secs: (e.expires_at - now).as_secs_f64(),
            })
            .collect();
        Ok(serde_json::to_string(&items)?)
    }

    /// Restore entries from a snapshot produced by [`Cache::snapshot`].
    /// Entries whose remaining TTL has already lapsed are dropped.
    pub fn restore(&self, snapshot: &str) -> Result<usize> {
        let items: Vec<SerializableEntry> = serde_json::from_str(snapshot)?;
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let mut loaded = 0;

        for item in items {
            if item.expires_in_secs <= 0.0 {
                continue;
            }
            let key = CacheKey(item.key);
            inner.current_bytes += item.size_bytes;
            inner.entries.insert(
                key,
                CacheEntry {
                    value: item.value,
                    expires_at: now + Duration::from_secs_f64(item.expires_in_secs),
                    size_bytes: item.size_bytes,
                },
            );
            loaded += 1;
        }

        evict_if_needed(&mut inner);
        Ok(loaded)
    }
}

/// Drop contiguous expired entries from the oldest (front) end. Stops
/// at the first live entry, matching the original `_purge_expired_front`
/// semantics rather than scanning the whole map on every access.
fn purge_expired_front(inner: &mut Inner) {
    let now = Instant::now();
    while let Some((_, entry)) = inner.entries.first() {
        if entry.expires_at > now {
            break;
        }
        let (_, entry) = inner.entries.shift_remove_index(0).expect("checked above");
        inner.current_bytes = inner.current_bytes.saturating_sub(entry.size_bytes);
        inner.expired += 1;
    }
}

fn evict_if_needed(inner: &mut Inner) {
    purge_expired_front(inner);

    while inner.entries.len() > inner.max_entries {
        if let Some((_, entry)) = inner.entries.shift_remove_index(0) {
            inner.current_bytes = inner.current_bytes.saturating_sub(entry.size_bytes);
            inner.evictions += 1;
        } else {
            break;
        }
    }

    if let Some(max_bytes) = inner.max_bytes {
        while inner.current_bytes > max_bytes && !inner.entries.is_empty() {
            if let Some((_, entry)) = inner.entries.shift_remove_index(0) {
                inner.current_bytes = inner.current_bytes.saturating_sub(entry.size_bytes);
                inner.evictions += 1;
            } else {
                break;
            }
        }
    }
}

/// Recursively estimate the in-memory footprint of a JSON value,
/// depth- and breadth-capped the way the original `_estimate_size`
/// caps container traversal, with a fixed fallback for anything that
/// would otherwise require unbounded work.
fn estimate_size(value: &Value, depth: usize) -> usize {
    const MAX_DEPTH: usize = 8;
    const MAX_ELEMENTS: usize = 100;
    const FALLBACK: usize = 1024;

    if depth > MAX_DEPTH {
        return FALLBACK;
    }

    match value {
        Value::Null => 8,
        Value::Bool(_) => 8,
        Value::Number(_) => 16,
        Value::String(s) => 32 + s.len(),
        Value::Array(items) => {
            32 + items
                .iter()
                .take(MAX_ELEMENTS)
                .map(|v| estimate_size(v, depth + 1))
                .sum::<usize>()
        }
        Value::Object(map) => {
            32 + map
                .iter()
                .take(MAX_ELEMENTS)
                .map(|(k, v)| k.len() + estimate_size(v, depth + 1))
                .sum::<usize>()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name, "[]")
    }

    #[test]
    fn test_set_and_get() {
        let cache = Cache::new(10, Duration::from_secs(60)).unwrap();
        cache.set(key("a"), json!(1));
        assert_eq!(cache.get(&key("a")), Some(json!(1)));
    }

    #[test]
    fn test_miss_increments_stats() {
        let cache = Cache::new(10, Duration::from_secs(60)).unwrap();
        assert_eq!(cache.get(&key("missing")), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = Cache::new(2, Duration::from_secs(60)).unwrap();
        cache.set(key("a"), json!(1));
        cache.set(key("b"), json!(2));
        // Touch "a" so "b" becomes the oldest.
        cache.get(&key("a"));
        cache.set(key("c"), json!(3));

        assert_eq!(cache.get(&key("b")), None, "b should have been evicted");
        assert_eq!(cache.get(&key("a")), Some(json!(1)));
        assert_eq!(cache.get(&key("c")), Some(json!(3)));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = Cache::new(10, Duration::from_millis(10)).unwrap();
        cache.set(key("a"), json!(1));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&key("a")), None);
        assert_eq!(cache.stats().expired, 1);
    }

    #[test]
    fn test_byte_budget_eviction() {
        let cache = Cache::new(100, Duration::from_secs(60))
            .unwrap()
            .with_max_bytes(1);
        cache.set(key("a"), json!("x".repeat(64)));
        cache.set(key("b"), json!("y".repeat(64)));

        assert!(cache.stats().entries <= 1, "byte budget should force eviction");
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let cache = Cache::new(10, Duration::from_secs(60)).unwrap();
        cache.set(key("a"), json!({"n": 1}));
        let snapshot = cache.snapshot().unwrap();

        let restored = Cache::new(10, Duration::from_secs(60)).unwrap();
        let loaded = restored.restore(&snapshot).unwrap();

        assert_eq!(loaded, 1);
        assert_eq!(restored.get(&key("a")), Some(json!({"n": 1})));
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = Cache::new(10, Duration::from_secs(60)).unwrap();
        cache.set(key("a"), json!(1));
        assert!(cache.delete(&key("a")));
        assert!(!cache.delete(&key("a")));

        cache.set(key("b"), json!(2));
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_invalid_limits_rejected() {
        assert!(Cache::new(0, Duration::from_secs(1)).is_err());
        assert!(Cache::new(1, Duration::ZERO).is_err());
    }

    #[test]
    fn test_for_call_is_stable_under_key_reordering() {
        let a = CacheKey::for_call("double", &json!({"b": 2, "a": 1}));
        let b = CacheKey::for_call("double", &json!({"a": 1, "b": 2}));
        assert_eq!(a, b, "argument key order should not change the cache key");
    }

    #[test]
    fn test_hit_rate() {
        let cache = Cache::new(10, Duration::from_secs(60)).unwrap();
        cache.set(key("a"), json!(1));
        cache.get(&key("a"));
        cache.get(&key("missing"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }
}
