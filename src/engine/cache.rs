use std::collections::VecDeque;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::{Error, Result};

struct Slot<V> {
    /// Insertion sequence number, used to tell a live entry apart from a
    /// stale position left behind in the eviction queue.
    seq: u64,
    value: V,
}

struct Inner<V> {
    entries: HashMap<u64, Slot<V>>,
    /// Keys in insertion order, oldest first.
    order: VecDeque<(u64, u64)>,
    next_seq: u64,
}

impl<V> Inner<V> {
    fn insert(&mut self, key: u64, value: V, capacity: usize) {
        match self.entries.get_mut(&key) {
            // an overwrite keeps its original place in line
            Some(slot) => slot.value = value,
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.entries.insert(key, Slot { seq, value });
                self.order.push_back((key, seq));
            }
        }
        while self.entries.len() > capacity {
            self.evict_oldest();
        }
        // positions of taken entries pile up without eviction pressure
        if self.order.len() > 2 * capacity.max(16) {
            let entries = &self.entries;
            self.order.retain(|(key, seq)| {
                entries.get(key).map_or(false, |slot| slot.seq == *seq)
            });
        }
    }

    fn evict_oldest(&mut self) {
        while let Some((key, seq)) = self.order.pop_front() {
            if self.entries.get(&key).map_or(false, |slot| slot.seq == seq) {
                self.entries.remove(&key);
                return;
            }
        }
    }
}

/// A capacity-limited map from an integer key to a value.
///
/// Eviction is strictly first-in-first-out: once an insert pushes the cache
/// over capacity, the oldest surviving insertion goes, however recently it
/// was read. A value someone is still waiting for can be evicted; that is the
/// price of never growing without bound.
///
/// All operations take a single lock.
pub struct BoundedCache<V> {
    inner: Mutex<Inner<V>>,
    capacity: usize,
}

impl<V: Clone> BoundedCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
                next_seq: 0,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Inserts `value` under `key`. Fails with `DuplicateKey` if the key is
    /// present and `allow_overwrite` is false.
    pub fn put(&self, key: u64, value: V, allow_overwrite: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if !allow_overwrite && inner.entries.contains_key(&key) {
            Err(Error::DuplicateKey(key))?
        }
        inner.insert(key, value, self.capacity);
        Ok(())
    }

    /// Returns a copy of the value without removing it.
    pub fn get(&self, key: u64) -> Result<V> {
        self.inner
            .lock()
            .entries
            .get(&key)
            .map(|slot| slot.value.clone())
            .ok_or(Error::NotFound(key))
    }

    /// Removes and returns the value.
    pub fn take(&self, key: u64) -> Result<V> {
        self.inner
            .lock()
            .entries
            .remove(&key)
            .map(|slot| slot.value)
            .ok_or(Error::NotFound(key))
    }

    /// Atomically takes the value under `key` if there is one, or stores
    /// `value` in its place if there isn't. Used to meet up two halves that
    /// arrive independently: whichever comes second gets the first.
    pub fn take_or_insert(&self, key: u64, value: V) -> Option<V> {
        let mut inner = self.inner.lock();
        match inner.entries.remove(&key) {
            Some(slot) => Some(slot.value),
            None => {
                inner.insert(key, value, self.capacity);
                None
            }
        }
    }

    pub fn has(&self, key: u64) -> bool {
        self.inner.lock().entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}
