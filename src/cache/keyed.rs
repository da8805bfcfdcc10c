use std::collections::VecDeque;
use std::hash::Hash;

use ahash::AHashMap;

/// Bounded sequence indexed by key. Re-appending a key replaces its value and
/// moves it to the tail; eviction always takes the current head.
///
/// `order` may hold stale `(stamp, key)` pairs for keys that were touched again
/// later. They are skipped on read and dropped by `compact`.
#[derive(Debug, Clone)]
pub struct BoundedKeyedSequence<K, T> {
    entries: AHashMap<K, (u64, T)>,
    order: VecDeque<(u64, K)>,
    capacity: usize,
    next_stamp: u64,
    new_updates: usize,
}

impl<K: Hash + Eq + Clone, T> BoundedKeyedSequence<K, T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: AHashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            next_stamp: 0,
            new_updates: 0,
        }
    }

    pub fn append(&mut self, item: T, key: K) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;

        if !self.entries.contains_key(&key) && self.entries.len() == self.capacity {
            self.evict_head();
        }
        self.entries.insert(key.clone(), (stamp, item));
        self.order.push_back((stamp, key));
        self.new_updates = (self.new_updates + 1).min(self.capacity);

        if self.order.len() > self.capacity * 2 {
            self.compact();
        }
    }

    pub fn get_by_key(&self, key: &K) -> Option<&T> {
        self.entries.get(key).map(|(_, v)| v)
    }

    /// Live entries, least recently touched first.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &T)> {
        self.order.iter().filter_map(move |(stamp, key)| match self.entries.get(key) {
            Some((s, v)) if s == stamp => Some((key, v)),
            _ => None,
        })
    }

    pub fn iter_where<'a, P>(&'a self, mut pred: P) -> impl Iterator<Item = &'a T>
    where
        P: FnMut(&K, &T) -> bool + 'a,
    {
        self.iter().filter(move |(k, v)| pred(k, v)).map(|(_, v)| v)
    }

    pub fn take_new_updates(&mut self) -> usize {
        std::mem::take(&mut self.new_updates)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn evict_head(&mut self) {
        while let Some((stamp, key)) = self.order.pop_front() {
            if matches!(self.entries.get(&key), Some((s, _)) if *s == stamp) {
                self.entries.remove(&key);
                return;
            }
        }
    }

    fn compact(&mut self) {
        let entries = &self.entries;
        self.order.retain(|(stamp, key)| matches!(entries.get(key), Some((s, _)) if s == stamp));
    }
}

impl<K: Hash + Eq + Clone, T: Clone> BoundedKeyedSequence<K, T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().map(|(_, v)| v.clone()).collect()
    }
}
