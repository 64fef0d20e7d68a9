//! Keyed store with last-touched timestamps and expiry.
//!
//! An entry is live while its age is strictly below the TTL; a zero TTL means
//! nothing is ever live. Expired entries stay in memory until `purge`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    touched: Instant,
}

#[derive(Debug, Clone)]
pub struct TtlCache<V> {
    entries: HashMap<String, Entry<V>>,
    ttl: Duration,
}

impl<V> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|e| self.is_live(e, now))
            .map(|e| &e.value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or overwrite, touching the entry.
    pub fn insert(&mut self, key: impl Into<String>, value: V) -> Option<V> {
        self.insert_at(key, value, Instant::now())
    }

    pub fn insert_at(&mut self, key: impl Into<String>, value: V, now: Instant) -> Option<V> {
        self.entries
            .insert(
                key.into(),
                Entry {
                    value,
                    touched: now,
                },
            )
            .map(|e| e.value)
    }

    /// Age of a live entry.
    pub fn age(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| self.is_live(e, now))
            .map(|e| now.saturating_duration_since(e.touched))
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str, &V) -> bool) {
        self.entries.retain(|k, e| keep(k, &e.value));
    }

    /// Drop expired entries. Returns how many went.
    pub fn purge(&mut self) -> usize {
        self.purge_at(Instant::now())
    }

    pub fn purge_at(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.touched) < ttl);
        before - self.entries.len()
    }

    /// Live entries at `now`.
    pub fn iter_live(&self, now: Instant) -> impl Iterator<Item = (&str, &V)> {
        self.entries
            .iter()
            .filter(move |(_, e)| self.is_live(e, now))
            .map(|(k, e)| (k.as_str(), &e.value))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_live(&self, entry: &Entry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.touched) < self.ttl
    }
}
