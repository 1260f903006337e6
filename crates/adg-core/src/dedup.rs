use std::{collections::HashMap, hash::Hash, time::Duration};

use tokio::time::Instant;

/// Time-bounded "seen" set.
///
/// Entries older than the TTL read as unseen. Memory is reclaimed lazily: once
/// the map grows past `sweep_threshold`, the next `mark` drops expired entries.
#[derive(Debug)]
pub struct TtlCache<K> {
    ttl: Duration,
    sweep_threshold: usize,
    entries: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> TtlCache<K> {
    pub fn new(ttl: Duration, sweep_threshold: usize) -> Self {
        Self {
            ttl,
            sweep_threshold,
            entries: HashMap::new(),
        }
    }

    pub fn seen(&self, key: &K, now: Instant) -> bool {
        self.entries
            .get(key)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.ttl)
    }

    pub fn mark(&mut self, key: K, now: Instant) {
        self.entries.insert(key, now);
        if self.entries.len() > self.sweep_threshold {
            self.sweep(now);
        }
    }

    /// `true` if the key was fresh (and is now marked).
    pub fn check_and_mark(&mut self, key: K, now: Instant) -> bool {
        if self.seen(&key, now) {
            return false;
        }
        self.mark(key, now);
        true
    }

    pub fn forget(&mut self, key: &K) {
        self.entries.remove(key);
    }

    pub fn sweep(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, at| now.saturating_duration_since(*at) < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Like [`TtlCache`] but carries a value (album caption cache, mute targets).
#[derive(Debug)]
pub struct TtlMap<K, V> {
    ttl: Duration,
    sweep_threshold: usize,
    entries: HashMap<K, (Instant, V)>,
}

impl<K: Eq + Hash + Clone, V> TtlMap<K, V> {
    pub fn new(ttl: Duration, sweep_threshold: usize) -> Self {
        Self {
            ttl,
            sweep_threshold,
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, key: &K, now: Instant) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|(at, _)| now.saturating_duration_since(*at) < self.ttl)
            .map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: K, value: V, now: Instant) {
        self.entries.insert(key, (now, value));
        if self.entries.len() > self.sweep_threshold {
            self.sweep(now);
        }
    }

    pub fn remove(&mut self, key: &K, now: Instant) -> Option<V> {
        self.entries
            .remove(key)
            .filter(|(at, _)| now.saturating_duration_since(*at) < self.ttl)
            .map(|(_, v)| v)
    }

    pub fn sweep(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, (at, _)| now.saturating_duration_since(*at) < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
