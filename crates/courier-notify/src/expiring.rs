//! Map whose entries stop counting once their deadline passes.
//!
//! Validity is pull-based: a lookup ignores an expired entry even if it is
//! still stored. [`sweep`](ExpiringMap::sweep) reclaims the memory.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Clone, Debug)]
struct Entry<V> {
    value: V,
    expires_at_ms: u64,
}

/// Entry-level TTL map keyed on caller-supplied millisecond timestamps.
#[derive(Clone, Debug)]
pub struct ExpiringMap<K, V> {
    entries: HashMap<K, Entry<V>>,
}

impl<K: Eq + Hash, V> ExpiringMap<K, V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Inserts or replaces `key`, live until `expires_at_ms` (exclusive).
    pub fn insert(&mut self, key: K, value: V, expires_at_ms: u64) -> Option<V> {
        self.entries
            .insert(
                key,
                Entry {
                    value,
                    expires_at_ms,
                },
            )
            .map(|e| e.value)
    }

    /// Value for `key` if it is still live at `now_ms`.
    pub fn get(&self, key: &K, now_ms: u64) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|e| now_ms < e.expires_at_ms)
            .map(|e| &e.value)
    }

    /// Whether `key` is live at `now_ms`.
    pub fn is_live(&self, key: &K, now_ms: u64) -> bool {
        self.get(key, now_ms).is_some()
    }

    /// Deadline of `key`, expired or not.
    pub fn expires_at(&self, key: &K) -> Option<u64> {
        self.entries.get(key).map(|e| e.expires_at_ms)
    }

    /// Removes `key` regardless of expiry.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Drops every entry expired at `now_ms`. Returns how many were dropped.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| now_ms < e.expires_at_ms);
        before - self.entries.len()
    }

    /// Stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash, V> Default for ExpiringMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
