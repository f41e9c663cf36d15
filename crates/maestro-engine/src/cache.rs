//! Bounded in-memory cache with TTL expiration and least-recently-used eviction.
//!
//! Entries live in a slot arena addressed through a key index. A min-heap of
//! `(last access, generation, slot)` stamps picks the eviction victim; stale
//! stamps left behind by later accesses are skipped lazily.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Slot<K, V> {
    key: K,
    value: V,
    inserted_at: Instant,
    generation: u64,
}

/// Cache bounded by entry count and entry age.
pub struct BoundedCache<K, V> {
    index: HashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    access_heap: BinaryHeap<Reverse<(Instant, u64, usize)>>,
    next_generation: u64,
    capacity: usize,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V> BoundedCache<K, V> {
    /// Creates a cache holding at most `capacity` entries, each for at most `ttl`.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            access_heap: BinaryHeap::new(),
            next_generation: 0,
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Inserts or replaces an entry. Returns the entry evicted to make room, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        let now = Instant::now();

        if let Some(&slot_index) = self.index.get(&key) {
            let generation = self.bump_generation();
            if let Some(slot) = self.slots.get_mut(slot_index).and_then(Option::as_mut) {
                slot.value = value;
                slot.inserted_at = now;
                slot.generation = generation;
            }
            self.access_heap
                .push(Reverse((now, generation, slot_index)));
            return None;
        }

        self.purge_expired();
        let evicted = if self.index.len() >= self.capacity {
            self.evict_least_recent()
        } else {
            None
        };

        let generation = self.bump_generation();
        let slot = Slot {
            key: key.clone(),
            value,
            inserted_at: now,
            generation,
        };
        let slot_index = if let Some(free_index) = self.free.pop() {
            if let Some(entry) = self.slots.get_mut(free_index) {
                *entry = Some(slot);
            }
            free_index
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        };

        self.index.insert(key, slot_index);
        self.access_heap
            .push(Reverse((now, generation, slot_index)));
        self.compact_heap();
        evicted
    }

    /// Returns the entry and marks it as recently used. Expired entries are removed.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let slot_index = *self.index.get(key)?;
        if self.is_expired(slot_index) {
            self.remove(key);
            return None;
        }

        let generation = self.bump_generation();
        let now = Instant::now();
        self.access_heap
            .push(Reverse((now, generation, slot_index)));
        self.compact_heap();

        let slot = self.slots.get_mut(slot_index)?.as_mut()?;
        slot.generation = generation;
        Some(&slot.value)
    }

    /// Returns the entry without touching its recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let slot_index = *self.index.get(key)?;
        if self.is_expired(slot_index) {
            return None;
        }
        self.slots
            .get(slot_index)?
            .as_ref()
            .map(|slot| &slot.value)
    }

    /// Whether a live (non-expired) entry exists for `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        self.peek(key).is_some()
    }

    /// Removes an entry, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot_index = self.index.remove(key)?;
        let slot = self.slots.get_mut(slot_index)?.take()?;
        self.free.push(slot_index);
        Some(slot.value)
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let expired: Vec<K> = self
            .index
            .iter()
            .filter(|&(_, &slot_index)| self.is_expired(slot_index))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    /// Number of entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn is_expired(&self, slot_index: usize) -> bool {
        self.slots
            .get(slot_index)
            .and_then(Option::as_ref)
            .is_none_or(|slot| slot.inserted_at.elapsed() >= self.ttl)
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn evict_least_recent(&mut self) -> Option<(K, V)> {
        while let Some(Reverse((_, generation, slot_index))) = self.access_heap.pop() {
            let current = self
                .slots
                .get(slot_index)
                .and_then(Option::as_ref)
                .map(|slot| (slot.generation, slot.key.clone()));

            // Stamps from before the slot's latest access (or reuse) are stale.
            if let Some((slot_generation, key)) = current
                && slot_generation == generation
            {
                let value = self.remove(&key)?;
                return Some((key, value));
            }
        }
        None
    }

    fn compact_heap(&mut self) {
        if self.access_heap.len() <= self.index.len() * 4 + 16 {
            return;
        }
        let live: Vec<Reverse<(Instant, u64, usize)>> = self
            .access_heap
            .drain()
            .filter(|Reverse((_, generation, slot_index))| {
                self.slots
                    .get(*slot_index)
                    .and_then(Option::as_ref)
                    .is_some_and(|slot| slot.generation == *generation)
            })
            .collect();
        self.access_heap = live.into_iter().collect();
    }
}
