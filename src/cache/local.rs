//! Bounded in-process tier with TTL and LRU eviction

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Instant,
    created_at: Instant,
    // position in the recency index
    tick: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    // tick → key, oldest first; ticks are unique so eviction order is total
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    // bumped by every write, delete and clear; expiry and eviction leave it
    generation: u64,
    evictions: u64,
    expirations: u64,
}

impl State {
    fn touch(&mut self, key: &str) {
        let tick = self.next_tick;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, key.to_string());
            self.next_tick += 1;
        }
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    fn evict_lru(&mut self) -> bool {
        let Some((_, key)) = self.recency.pop_first() else {
            return false;
        };
        self.entries.remove(&key);
        self.evictions += 1;
        true
    }
}

/// Local-tier counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTierStats {
    pub entries: usize,
    pub capacity: usize,
    pub evictions: u64,
    pub expirations: u64,
}

/// A value read from the local tier with its remaining lifetime
#[derive(Debug, Clone, PartialEq)]
pub struct LocalHit {
    pub value: Bytes,
    pub remaining: Duration,
    pub age: Duration,
}

/// LRU map of key → bytes with a per-entry deadline
///
/// Expired entries are never returned: reads check the deadline and drop
/// stale entries on the spot, and [`sweep_expired`](Self::sweep_expired)
/// reclaims the ones nobody reads.
#[derive(Debug)]
pub struct LocalTier {
    capacity: usize,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl LocalTier {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: capacity.max(1),
            clock,
            state: Mutex::new(State::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entry count, including expired entries not yet swept
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.get_entry(key).map(|hit| hit.value)
    }

    /// Read a live entry and mark it most recently used
    pub fn get_entry(&self, key: &str) -> Option<LocalHit> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let entry = state.entries.get(key)?;
        if entry.is_expired(now) {
            state.remove(key);
            state.expirations += 1;
            return None;
        }

        let hit = LocalHit {
            value: entry.value.clone(),
            remaining: entry.expires_at.saturating_duration_since(now),
            age: now.saturating_duration_since(entry.created_at),
        };
        state.touch(key);
        Some(hit)
    }

    /// Store `value` for `ttl`; returns how many entries were evicted to make room
    ///
    /// A zero TTL stores nothing and removes any previous value.
    pub fn set(&self, key: &str, value: Bytes, ttl: Duration) -> usize {
        let mut state = self.state.lock();
        self.insert(&mut state, key, value, ttl)
    }

    /// Current write generation
    ///
    /// Any `set`, `delete` or `clear_prefix` on any key moves it forward.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// [`set`](Self::set) unless a write happened since `generation` was read
    ///
    /// Returns `None` when the tier changed in between and nothing was stored.
    pub fn set_if_unchanged(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        generation: u64,
    ) -> Option<usize> {
        let mut state = self.state.lock();
        if state.generation != generation {
            return None;
        }
        Some(self.insert(&mut state, key, value, ttl))
    }

    fn insert(&self, state: &mut State, key: &str, value: Bytes, ttl: Duration) -> usize {
        let now = self.clock.now();
        // far-future TTLs saturate to "practically never"
        let expires_at = now
            .checked_add(ttl)
            .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 86_400));
        state.generation += 1;

        if expires_at <= now {
            state.remove(key);
            return 0;
        }

        let tick = state.next_tick;
        state.next_tick += 1;

        if let Some(existing) = state.entries.get_mut(key) {
            let old_tick = existing.tick;
            existing.value = value;
            existing.expires_at = expires_at;
            existing.created_at = now;
            existing.tick = tick;
            state.recency.remove(&old_tick);
            state.recency.insert(tick, key.to_string());
            return 0;
        }

        let mut evicted = 0;
        while state.entries.len() >= self.capacity {
            if !state.evict_lru() {
                break;
            }
            evicted += 1;
        }

        state.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at,
                created_at: now,
                tick,
            },
        );
        state.recency.insert(tick, key.to_string());
        evicted
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        state.generation += 1;
        state.remove(key).is_some()
    }

    /// Remove every key starting with `prefix`, or everything when `None`
    pub fn clear_prefix(&self, prefix: Option<&str>) -> usize {
        let mut state = self.state.lock();
        state.generation += 1;

        match prefix {
            None => {
                let removed = state.entries.len();
                state.entries.clear();
                state.recency.clear();
                removed
            }
            Some(prefix) => {
                let doomed: Vec<String> = state
                    .entries
                    .keys()
                    .filter(|key| key.starts_with(prefix))
                    .cloned()
                    .collect();
                for key in &doomed {
                    state.remove(key);
                }
                doomed.len()
            }
        }
    }

    /// Drop every expired entry; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.remove(key);
        }
        state.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn stats(&self) -> LocalTierStats {
        let state = self.state.lock();
        LocalTierStats {
            entries: state.entries.len(),
            capacity: self.capacity,
            evictions: state.evictions,
            expirations: state.expirations,
        }
    }
}
