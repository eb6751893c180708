//! Keyed registry of live device instances.
//!
//! Devices are discovered at runtime (one per backend node), so instances are
//! kept in a map instead of a fixed-size table.

use alloc::vec::Vec;
use core::hash::Hash;

use hashbrown::HashMap;
use spin::Mutex;

pub struct Registry<K, V> {
    entries: Mutex<HashMap<K, V>>,
}

impl<K: Eq + Hash + Copy, V: Clone> Registry<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert `value` under `key`, returning the value it replaced.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.entries.lock().insert(key, value)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().remove(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<(K, V)> {
        self.entries.lock().drain().collect()
    }
}

impl<K: Eq + Hash + Copy, V: Clone> Default for Registry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
