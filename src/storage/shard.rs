//! Sharded Map
//!
//! Concurrent hashmap split over a power-of-two number of `parking_lot`
//! RwLock shards. Entry counts and byte weights are tracked per shard with
//! atomics so totals never take a lock.

use std::borrow::Borrow;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Values that report their size in bytes
pub trait Weighted {
    fn weight(&self) -> u64;
}

/// Single shard
pub struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
    count: AtomicU64,
    size_bytes: AtomicU64,
}

impl<K, V> Default for Shard<K, V> {
    fn default() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            count: AtomicU64::new(0),
            size_bytes: AtomicU64::new(0),
        }
    }
}

impl<K: Eq + Hash, V: Weighted> Shard<K, V> {
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }

    fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.map.read().get(key).cloned()
    }

    fn insert(&self, key: K, value: V) -> Option<V> {
        let added = value.weight();
        let mut guard = self.map.write();
        let old = guard.insert(key, value);
        match &old {
            Some(previous) => {
                self.size_bytes.fetch_sub(previous.weight(), Ordering::Relaxed);
            }
            None => {
                self.count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.size_bytes.fetch_add(added, Ordering::Relaxed);
        old
    }

    fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let removed = self.map.write().remove(key);
        if let Some(value) = &removed {
            self.count.fetch_sub(1, Ordering::Relaxed);
            self.size_bytes.fetch_sub(value.weight(), Ordering::Relaxed);
        }
        removed
    }

    fn update<F>(&self, key: &K, f: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        let mut guard = self.map.write();
        match guard.get_mut(key) {
            Some(value) => {
                let before = value.weight();
                f(value);
                let after = value.weight();
                self.size_bytes.fetch_add(after, Ordering::Relaxed);
                self.size_bytes.fetch_sub(before, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut guard = self.map.write();
        let mut removed = 0usize;
        let mut freed = 0u64;
        guard.retain(|k, v| {
            if keep(k, v) {
                true
            } else {
                removed += 1;
                freed += v.weight();
                false
            }
        });
        self.count.fetch_sub(removed as u64, Ordering::Relaxed);
        self.size_bytes.fetch_sub(freed, Ordering::Relaxed);
        removed
    }

    fn clear(&self) {
        let mut guard = self.map.write();
        guard.clear();
        self.count.store(0, Ordering::Relaxed);
        self.size_bytes.store(0, Ordering::Relaxed);
    }

    fn entries(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Hashmap sharded `N` ways; `N` must be a power of two
pub struct ShardedMap<K, V, const N: usize> {
    shards: Vec<Shard<K, V>>,
}

impl<K, V, const N: usize> Default for ShardedMap<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const N: usize> ShardedMap<K, V, N> {
    pub fn new() -> Self {
        assert!(N.is_power_of_two(), "shard count must be a power of two");
        Self {
            shards: (0..N).map(|_| Shard::default()).collect(),
        }
    }

    #[inline]
    pub const fn shard_count(&self) -> usize {
        N
    }
}

impl<K: Eq + Hash, V: Weighted, const N: usize> ShardedMap<K, V, N> {
    #[inline]
    fn shard_for<Q: Hash + ?Sized>(&self, key: &Q) -> &Shard<K, V> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & (N - 1)]
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(Shard::is_empty)
    }

    /// Total weight of all values
    pub fn size_bytes(&self) -> u64 {
        self.shards.iter().map(Shard::size_bytes).sum()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.shard_for(key).get(key)
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard_for(&key).insert(key, value)
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard_for(key).remove(key)
    }

    /// Mutate a value in place; `false` when absent
    pub fn update<F>(&self, key: &K, f: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        self.shard_for(key).update(key, f)
    }

    /// Drop every entry `keep` rejects; returns how many were dropped
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.shards.iter().map(|s| s.retain(&mut keep)).sum()
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.clear();
        }
    }

    /// Snapshot of every entry
    pub fn entries(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.shards.iter().flat_map(Shard::entries).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    impl Weighted for Vec<u8> {
        fn weight(&self) -> u64 {
            self.len() as u64
        }
    }

    #[test]
    fn test_insert_replace_tracks_weight() {
        let map: ShardedMap<String, Vec<u8>, 8> = ShardedMap::new();
        assert!(map.insert("a".into(), vec![0; 10]).is_none());
        assert_eq!(map.size_bytes(), 10);

        let old = map.insert("a".into(), vec![0; 4]).unwrap();
        assert_eq!(old.len(), 10);
        assert_eq!(map.len(), 1);
        assert_eq!(map.size_bytes(), 4);

        assert_eq!(map.remove("a").map(|v| v.len()), Some(4));
        assert!(map.is_empty());
        assert_eq!(map.size_bytes(), 0);
    }

    #[test]
    fn test_update_adjusts_weight() {
        let map: ShardedMap<u32, Vec<u8>, 4> = ShardedMap::new();
        map.insert(1, vec![1, 2, 3]);
        assert!(map.update(&1, |v| v.push(4)));
        assert_eq!(map.size_bytes(), 4);
        assert!(!map.update(&2, |v| v.push(4)));
    }

    #[test]
    fn test_retain_and_clear() {
        let map: ShardedMap<u32, Vec<u8>, 16> = ShardedMap::new();
        for i in 0..100u32 {
            map.insert(i, vec![0; 2]);
        }
        assert_eq!(map.retain(|k, _| k % 2 == 0), 50);
        assert_eq!(map.len(), 50);
        assert_eq!(map.size_bytes(), 100);
        assert_eq!(map.entries().len(), 50);

        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.size_bytes(), 0);
    }

    #[test]
    fn test_shard_count_is_power_of_two() {
        let map: ShardedMap<u32, Vec<u8>, 64> = ShardedMap::new();
        assert_eq!(map.shard_count(), 64);
        assert!(map.shard_count().is_power_of_two());
    }
}
