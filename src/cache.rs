//! Purpose: Memoize results of idempotent calls with LFU eviction and a tunable global TTL.
//! Exports: `ResponseCache`, `CacheEntry`, `cache_key`, `canonical_json`.
//! Role: Owned by the dispatcher; the self-tuner adjusts its TTL.
//! Invariants: An entry is served only while `now - created_at < ttl`; expired entries are
//! removed when looked up or pruned.
//! Invariants: At capacity, inserting a new key evicts the entry with the lowest access count
//! (oldest first on ties).
//! Invariants: TTL always stays inside `[min_ttl, max_ttl]`.
use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::CacheConfig;

/// Stable key for a method plus its parameters; object key order does not matter.
pub fn cache_key(method: &str, params: Option<&Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update([0u8]);
    if let Some(params) = params {
        hasher.update(canonical_json(params).as_bytes());
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Compact JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub created_at: Instant,
    pub access_count: u64,
}

#[derive(Debug)]
pub struct ResponseCache {
    entries: HashMap<String, CacheEntry>,
    capacity: usize,
    ttl: Duration,
    min_ttl: Duration,
    max_ttl: Duration,
    evictions: u64,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        let min_ttl = config.min_ttl.min(config.max_ttl);
        Self {
            entries: HashMap::new(),
            capacity: config.capacity.max(1),
            ttl: config.initial_ttl.clamp(min_ttl, config.max_ttl),
            min_ttl,
            max_ttl: config.max_ttl,
            evictions: 0,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Set the TTL, clamped to the configured bounds; returns the value applied.
    pub fn set_ttl(&mut self, ttl: Duration) -> Duration {
        self.ttl = ttl.clamp(self.min_ttl, self.max_ttl);
        self.ttl
    }

    pub fn get(&mut self, key: &str) -> Option<Value> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&mut self, key: &str, now: Instant) -> Option<Value> {
        let ttl = self.ttl;
        match self.entries.get_mut(key) {
            None => return None,
            Some(entry) if now.saturating_duration_since(entry.created_at) < ttl => {
                entry.access_count += 1;
                return Some(entry.value.clone());
            }
            Some(_) => {}
        }
        self.entries.remove(key);
        None
    }

    pub fn insert(&mut self, key: String, value: Value) {
        self.insert_at(key, value, Instant::now());
    }

    /// Store or overwrite an entry; an overwrite keeps the accumulated usage count.
    pub fn insert_at(&mut self, key: String, value: Value, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            entry.created_at = now;
            entry.access_count += 1;
            return;
        }
        if self.entries.len() >= self.capacity {
            self.prune_expired_at(now);
        }
        while self.entries.len() >= self.capacity {
            if !self.evict_least_used() {
                break;
            }
        }
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                created_at: now,
                access_count: 1,
            },
        );
    }

    pub fn prune_expired(&mut self) -> usize {
        self.prune_expired_at(Instant::now())
    }

    pub fn prune_expired_at(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.created_at) < ttl);
        before - self.entries.len()
    }

    fn evict_least_used(&mut self) -> bool {
        let victim = self
            .entries
            .values()
            .min_by_key(|entry| (entry.access_count, entry.created_at))
            .map(|entry| entry.key.clone());
        match victim {
            Some(key) => {
                self.entries.remove(&key);
                self.evictions += 1;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(capacity: usize) -> CacheConfig {
        CacheConfig {
            capacity,
            initial_ttl: Duration::from_secs(30),
            min_ttl: Duration::from_secs(5),
            max_ttl: Duration::from_secs(300),
        }
    }

    #[test]
    fn key_ignores_object_key_order() {
        let a = json!({"name": "search_text", "arguments": {"pattern": "x", "path": "."}});
        let b = json!({"arguments": {"path": ".", "pattern": "x"}, "name": "search_text"});
        assert_eq!(cache_key("tools/call", Some(&a)), cache_key("tools/call", Some(&b)));
        assert_ne!(cache_key("tools/call", Some(&a)), cache_key("tools/list", Some(&a)));
        assert_ne!(cache_key("tools/list", None), cache_key("tools/list", Some(&json!({}))));
        assert_eq!(cache_key("tools/list", None).len(), 64);
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": [{"z": 1, "a": 2}], "a": "q\"uote"});
        assert_eq!(canonical_json(&value), r#"{"a":"q\"uote","b":[{"a":2,"z":1}]}"#);
    }

    #[test]
    fn entries_expire_lazily() {
        let mut cache = ResponseCache::new(&config(4));
        let start = Instant::now();
        cache.insert_at("k".to_string(), json!({"v": 1}), start);
        assert_eq!(
            cache.get_at("k", start + Duration::from_secs(29)),
            Some(json!({"v": 1}))
        );
        assert_eq!(cache.get_at("k", start + Duration::from_secs(30)), None);
        assert!(cache.is_empty(), "expired entry is purged on lookup");
    }

    #[test]
    fn evicts_least_used_entry_at_capacity() {
        let mut cache = ResponseCache::new(&config(2));
        let start = Instant::now();
        cache.insert_at("hot".to_string(), json!(1), start);
        cache.insert_at("cold".to_string(), json!(2), start + Duration::from_millis(1));
        for _ in 0..3 {
            assert!(cache.get_at("hot", start + Duration::from_secs(1)).is_some());
        }
        cache.insert_at("new".to_string(), json!(3), start + Duration::from_secs(2));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evictions(), 1);
        let now = start + Duration::from_secs(3);
        assert!(cache.get_at("cold", now).is_none());
        assert!(cache.get_at("hot", now).is_some());
        assert!(cache.get_at("new", now).is_some());
    }

    #[test]
    fn expired_entries_make_room_before_eviction() {
        let mut cache = ResponseCache::new(&config(1));
        let start = Instant::now();
        cache.insert_at("old".to_string(), json!(1), start);
        cache.insert_at("fresh".to_string(), json!(2), start + Duration::from_secs(60));
        assert_eq!(cache.evictions(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn ttl_is_clamped() {
        let mut cache = ResponseCache::new(&config(1));
        assert_eq!(cache.set_ttl(Duration::from_secs(1)), Duration::from_secs(5));
        assert_eq!(cache.set_ttl(Duration::from_secs(9000)), Duration::from_secs(300));
        assert_eq!(cache.set_ttl(Duration::from_secs(45)), Duration::from_secs(45));
    }

    #[test]
    fn prune_drops_only_stale_entries() {
        let mut cache = ResponseCache::new(&config(8));
        let start = Instant::now();
        cache.insert_at("a".to_string(), json!(1), start);
        cache.insert_at("b".to_string(), json!(2), start + Duration::from_secs(20));
        assert_eq!(cache.prune_expired_at(start + Duration::from_secs(35)), 1);
        assert_eq!(cache.len(), 1);
    }
}
