//! Recency-ordered entry index
//!
//! Maps keys to sizes (plus an optional payload) and keeps them in the order
//! the configured [`EvictionStrategy`] evicts from. Every insertion or access
//! gets a fresh sequence number, so entries with equal recency are always
//! ordered by when they were inserted.

use crate::types::EvictionStrategy;
use std::collections::{BTreeMap, HashMap};

/// A single indexed entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry<V> {
    pub size: i64,
    pub value: V,
    seq: u64,
}

/// Ordered map from key to size, enforcing an eviction policy
#[derive(Debug)]
pub struct EntryIndex<V = ()> {
    strategy: EvictionStrategy,
    entries: HashMap<String, IndexEntry<V>>,
    /// Sequence number -> key, oldest first
    order: BTreeMap<u64, String>,
    next_seq: u64,
    total_size: i64,
}

impl<V> EntryIndex<V> {
    pub fn new(strategy: EvictionStrategy) -> Self {
        Self {
            strategy,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            total_size: 0,
        }
    }

    pub fn strategy(&self) -> EvictionStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all entry sizes
    pub fn total_size(&self) -> i64 {
        self.total_size
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up an entry without changing its position
    pub fn get(&self, key: &str) -> Option<&IndexEntry<V>> {
        self.entries.get(key)
    }

    /// Record an access. Access-ordered strategies move the entry to the
    /// newest position; insertion-ordered strategies leave it in place.
    pub fn touch(&mut self, key: &str) -> Option<&IndexEntry<V>> {
        let entry = self.entries.get_mut(key)?;
        if self.strategy.is_access_ordered() {
            let seq = self.next_seq;
            self.next_seq += 1;
            let owned = self
                .order
                .remove(&entry.seq)
                .unwrap_or_else(|| key.to_string());
            entry.seq = seq;
            self.order.insert(seq, owned);
        }
        Some(entry)
    }

    /// Insert or replace an entry, returning the prior size if any
    pub fn insert(&mut self, key: String, size: i64, value: V) -> Option<i64> {
        let seq = self.next_seq;
        self.next_seq += 1;

        match self.entries.get_mut(&key) {
            Some(entry) => {
                let prior = entry.size;
                if self.strategy.is_access_ordered() {
                    self.order.remove(&entry.seq);
                    entry.seq = seq;
                    self.order.insert(seq, key);
                }
                entry.size = size;
                entry.value = value;
                self.total_size += size - prior;
                Some(prior)
            }
            None => {
                self.order.insert(seq, key.clone());
                self.entries.insert(key, IndexEntry { size, value, seq });
                self.total_size += size;
                None
            }
        }
    }

    /// Remove an entry, returning its size
    pub fn remove(&mut self, key: &str) -> Option<i64> {
        self.remove_entry(key).map(|entry| entry.size)
    }

    /// Remove an entry, returning it whole
    pub fn remove_entry(&mut self, key: &str) -> Option<IndexEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        self.total_size -= entry.size;
        Some(entry)
    }

    /// Evict policy-selected victims until the total size is at most
    /// `max_size`. Each victim is handed to `on_evict` after it has left the
    /// index. Returns the number of evicted entries.
    pub fn evict_until<F>(&mut self, max_size: i64, mut on_evict: F) -> usize
    where
        F: FnMut(String, IndexEntry<V>),
    {
        let mut evicted = 0;
        while self.total_size > max_size {
            let victim = if self.strategy.evicts_newest() {
                self.order.pop_last()
            } else {
                self.order.pop_first()
            };
            let Some((_, key)) = victim else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.total_size -= entry.size;
                on_evict(key, entry);
                evicted += 1;
            }
        }
        evicted
    }

    /// Keys from oldest to newest position
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.values().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.total_size = 0;
    }
}

impl EntryIndex<()> {
    /// Insert or replace a size-only entry, returning the prior size if any
    pub fn upsert(&mut self, key: impl Into<String>, size: i64) -> Option<i64> {
        self.insert(key.into(), size, ())
    }
}
