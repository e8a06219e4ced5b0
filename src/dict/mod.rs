//! Sharded Concurrent Dictionary
//!
//! The core map behind every database. Instead of one big lock, keys are
//! spread over independent shards, each guarded by its own `RwLock`. Multiple
//! tasks can read and write different keys concurrently without blocking each
//! other.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ConcurrentDict                          │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  │ HashMap │ │ HashMap │ │ HashMap │ │ HashMap │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Keys are routed to shards with a 32-bit FNV-1a hash. The shard count is
//! always a power of two so routing is a mask instead of a modulo.
//!
//! ## Multi-key locking
//!
//! Commands that touch several keys at once (MSET, DEL, transactions) need
//! all of their shards locked atomically. [`ConcurrentDict::lock_keys`]
//! collects the distinct shard indices of the key group, sorts them
//! ascending, and acquires each lock in that order. Every caller uses the
//! same order, so two lock groups can never form a cyclic wait. The returned
//! [`KeyGroup`] exposes map access that routes through the already-held
//! guards, and releases them in reverse order when dropped.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::Rng;

/// Smallest allowed shard count.
const MIN_SHARDS: usize = 16;

/// FNV-1a 32-bit offset basis.
const FNV_OFFSET: u32 = 2_166_136_261;

/// FNV-1a 32-bit prime.
const FNV_PRIME: u32 = 16_777_619;

/// Hashes a key with 32-bit FNV-1a (XOR the byte, then multiply).
#[inline]
pub fn fnv1a_32(key: &str) -> u32 {
    let mut hash = FNV_OFFSET;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Rounds `requested` up to the smallest power of two that can hold it.
///
/// Never returns less than [`MIN_SHARDS`]; saturates at 2^31 on overflow.
fn compute_capacity(requested: usize) -> usize {
    if requested <= MIN_SHARDS {
        return MIN_SHARDS;
    }
    match requested.checked_next_power_of_two() {
        Some(n) if n <= 1 << 31 => n,
        _ => 1 << 31,
    }
}

/// A striped-lock map from `String` keys to values of type `V`.
///
/// All operations are thread-safe. The dictionary is meant to be shared
/// behind an `Arc` across every connection task.
#[derive(Debug)]
pub struct ConcurrentDict<V> {
    shards: Vec<RwLock<HashMap<String, V>>>,
    count: AtomicI32,
    mask: u32,
}

impl<V> ConcurrentDict<V> {
    /// Creates a dictionary with at least `capacity` shards.
    pub fn with_capacity(capacity: usize) -> Self {
        let shard_count = compute_capacity(capacity);
        let shards = (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            shards,
            count: AtomicI32::new(0),
            mask: (shard_count - 1) as u32,
        }
    }

    /// Number of shards backing this dictionary.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Maps a key to its shard index.
    #[inline]
    fn index_of(&self, key: &str) -> usize {
        (self.mask & fnv1a_32(key)) as usize
    }

    /// Number of live entries, read atomically.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a key under the shard's shared lock.
    pub fn get(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        let shard = self.shards[self.index_of(key)].read().unwrap();
        shard.get(key).cloned()
    }

    /// Returns true if the key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        let shard = self.shards[self.index_of(key)].read().unwrap();
        shard.contains_key(key)
    }

    /// Inserts or replaces a value.
    ///
    /// Returns `1` if the key was newly inserted, `0` if an existing value
    /// was replaced.
    pub fn put(&self, key: String, value: V) -> usize {
        let mut shard = self.shards[self.index_of(&key)].write().unwrap();
        if shard.insert(key, value).is_some() {
            0
        } else {
            self.count.fetch_add(1, Ordering::Relaxed);
            1
        }
    }

    /// Inserts only if the key is absent. Returns `1` on insert, `0` otherwise.
    pub fn put_if_absent(&self, key: String, value: V) -> usize {
        let mut shard = self.shards[self.index_of(&key)].write().unwrap();
        if shard.contains_key(&key) {
            return 0;
        }
        shard.insert(key, value);
        self.count.fetch_add(1, Ordering::Relaxed);
        1
    }

    /// Replaces only if the key exists. Returns `1` on replace, `0` otherwise.
    pub fn put_if_exists(&self, key: String, value: V) -> usize {
        let mut shard = self.shards[self.index_of(&key)].write().unwrap();
        match shard.get_mut(&key) {
            Some(slot) => {
                *slot = value;
                1
            }
            None => 0,
        }
    }

    /// Removes a key, returning its value if it was present.
    pub fn remove(&self, key: &str) -> Option<V> {
        let mut shard = self.shards[self.index_of(key)].write().unwrap();
        let removed = shard.remove(key);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Visits every entry, shard by shard, under each shard's shared lock.
    ///
    /// Stops early when `consumer` returns false. There is no ordering
    /// guarantee across shards, and entries inserted concurrently in
    /// not-yet-visited shards may or may not be seen.
    pub fn for_each(&self, mut consumer: impl FnMut(&str, &V) -> bool) {
        for shard in &self.shards {
            let guard = shard.read().unwrap();
            for (key, value) in guard.iter() {
                if !consumer(key, value) {
                    return;
                }
            }
        }
    }

    /// Collects every key.
    ///
    /// The result is pre-sized to [`len`](Self::len); keys appearing
    /// concurrently are appended, so the slice may grow past the initial
    /// estimate. No key is reported twice.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len());
        self.for_each(|key, _| {
            keys.push(key.to_string());
            true
        });
        keys
    }

    /// Samples up to `limit` keys by picking random shards.
    ///
    /// May contain duplicates. Returns all keys when `limit` exceeds the
    /// dictionary size.
    pub fn random_keys(&self, limit: usize) -> Vec<String> {
        if limit > self.len() {
            return self.keys();
        }
        let mut rng = rand::rng();
        let mut keys = Vec::with_capacity(limit);
        // An empty shard yields nothing; resample until the quota is met.
        // limit <= len here, so some shard is always non-empty.
        while keys.len() < limit {
            let shard = self.shards[rng.random_range(0..self.shards.len())].read().unwrap();
            if let Some(key) = shard.keys().next() {
                keys.push(key.clone());
            }
        }
        keys
    }

    /// Samples up to `limit` distinct keys.
    ///
    /// May return fewer than `limit` when shard sampling collides.
    pub fn random_distinct_keys(&self, limit: usize) -> Vec<String> {
        if limit > self.len() {
            return self.keys();
        }
        let mut rng = rand::rng();
        let mut seen = HashSet::with_capacity(limit);
        for _ in 0..limit {
            let shard = self.shards[rng.random_range(0..self.shards.len())].read().unwrap();
            if let Some(key) = shard.keys().next() {
                seen.insert(key.clone());
            }
        }
        seen.into_iter().collect()
    }

    /// Removes every entry, leaving the shard layout in place.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().unwrap().clear();
        }
        self.count.store(0, Ordering::Relaxed);
    }

    /// Computes the distinct, ascending shard indices touched by `keys`.
    fn lock_indices(&self, keys: impl Iterator<Item = impl AsRef<str>>) -> Vec<usize> {
        let mut indices = BTreeSet::new();
        for key in keys {
            indices.insert(self.index_of(key.as_ref()));
        }
        indices.into_iter().collect()
    }

    /// Atomically locks the shards of a key group.
    ///
    /// A shard is write-locked if any key in `write_keys` maps to it,
    /// read-locked otherwise. Locks are taken in ascending shard order,
    /// the invariant that makes multi-key acquisition deadlock-free, and
    /// released in reverse order when the returned [`KeyGroup`] drops.
    /// Duplicate keys are allowed.
    pub fn lock_keys<'d>(&'d self, write_keys: &[String], read_keys: &[String]) -> KeyGroup<'d, V> {
        let write_indices: HashSet<usize> =
            write_keys.iter().map(|key| self.index_of(key)).collect();
        let all = self.lock_indices(write_keys.iter().chain(read_keys.iter()));

        let mut guards = Vec::with_capacity(all.len());
        for index in all {
            let guard = if write_indices.contains(&index) {
                ShardGuard::Write(self.shards[index].write().unwrap())
            } else {
                ShardGuard::Read(self.shards[index].read().unwrap())
            };
            guards.push((index, guard));
        }
        KeyGroup { dict: self, guards }
    }
}

enum ShardGuard<'d, V> {
    Read(RwLockReadGuard<'d, HashMap<String, V>>),
    Write(RwLockWriteGuard<'d, HashMap<String, V>>),
}

/// A set of held shard locks covering a group of keys.
///
/// Produced by [`ConcurrentDict::lock_keys`]. All accessors route to the
/// guard of the key's shard; touching a key outside the locked group, or
/// writing through a shard that was only read-locked, is a caller bug and
/// panics.
pub struct KeyGroup<'d, V> {
    dict: &'d ConcurrentDict<V>,
    // Ascending by shard index; Drop pops from the back.
    guards: Vec<(usize, ShardGuard<'d, V>)>,
}

impl<'d, V> KeyGroup<'d, V> {
    fn guard(&self, key: &str) -> &ShardGuard<'d, V> {
        let index = self.dict.index_of(key);
        let pos = self
            .guards
            .binary_search_by_key(&index, |(i, _)| *i)
            .unwrap_or_else(|_| panic!("key {:?} accessed outside its lock group", key));
        &self.guards[pos].1
    }

    fn map_mut(&mut self, key: &str) -> &mut HashMap<String, V> {
        let index = self.dict.index_of(key);
        let pos = self
            .guards
            .binary_search_by_key(&index, |(i, _)| *i)
            .unwrap_or_else(|_| panic!("key {:?} accessed outside its lock group", key));
        match &mut self.guards[pos].1 {
            ShardGuard::Write(guard) => &mut *guard,
            ShardGuard::Read(_) => panic!("write access to {:?} through a read lock", key),
        }
    }

    /// Looks up a key through the held guard.
    pub fn get(&self, key: &str) -> Option<&V> {
        match self.guard(key) {
            ShardGuard::Read(guard) => guard.get(key),
            ShardGuard::Write(guard) => guard.get(key),
        }
    }

    /// Mutable lookup; the key's shard must be write-locked.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.map_mut(key).get_mut(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Inserts or replaces under the held write lock. Same contract as
    /// [`ConcurrentDict::put`].
    pub fn put(&mut self, key: &str, value: V) -> usize {
        let inserted = self.map_mut(key).insert(key.to_string(), value).is_none();
        if inserted {
            self.dict.count.fetch_add(1, Ordering::Relaxed);
            1
        } else {
            0
        }
    }

    pub fn put_if_absent(&mut self, key: &str, value: V) -> usize {
        let map = self.map_mut(key);
        if map.contains_key(key) {
            return 0;
        }
        map.insert(key.to_string(), value);
        self.dict.count.fetch_add(1, Ordering::Relaxed);
        1
    }

    pub fn put_if_exists(&mut self, key: &str, value: V) -> usize {
        match self.map_mut(key).get_mut(key) {
            Some(slot) => {
                *slot = value;
                1
            }
            None => 0,
        }
    }

    /// Removes under the held write lock, returning the old value.
    pub fn remove(&mut self, key: &str) -> Option<V> {
        let removed = self.map_mut(key).remove(key);
        if removed.is_some() {
            self.dict.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Shard indices held by this group, ascending.
    pub fn held_indices(&self) -> Vec<usize> {
        self.guards.iter().map(|(i, _)| *i).collect()
    }
}

impl<V> Drop for KeyGroup<'_, V> {
    fn drop(&mut self) {
        // Release in reverse of the acquisition order.
        while self.guards.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_capacity_rounding() {
        assert_eq!(compute_capacity(0), 16);
        assert_eq!(compute_capacity(16), 16);
        assert_eq!(compute_capacity(17), 32);
        assert_eq!(compute_capacity(1000), 1024);
        assert_eq!(compute_capacity(usize::MAX), 1 << 31);
    }

    #[test]
    fn test_fnv1a_reference_values() {
        // Published FNV-1a 32-bit vectors.
        assert_eq!(fnv1a_32(""), 0x811c9dc5);
        assert_eq!(fnv1a_32("a"), 0xe40c292c);
        assert_eq!(fnv1a_32("foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_put_get_remove() {
        let dict = ConcurrentDict::with_capacity(16);
        assert_eq!(dict.put("k".into(), 1), 1);
        assert_eq!(dict.put("k".into(), 2), 0);
        assert_eq!(dict.get("k"), Some(2));
        assert_eq!(dict.len(), 1);

        assert_eq!(dict.remove("k"), Some(2));
        assert_eq!(dict.remove("k"), None);
        assert_eq!(dict.get("k"), None);
        assert_eq!(dict.len(), 0);
    }

    #[test]
    fn test_put_if_absent_and_exists() {
        let dict = ConcurrentDict::with_capacity(16);
        assert_eq!(dict.put_if_exists("k".into(), 1), 0);
        assert_eq!(dict.put_if_absent("k".into(), 1), 1);
        assert_eq!(dict.put_if_absent("k".into(), 2), 0);
        assert_eq!(dict.get("k"), Some(1));
        assert_eq!(dict.put_if_exists("k".into(), 3), 1);
        assert_eq!(dict.get("k"), Some(3));
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn test_len_tracks_inserts_and_removes() {
        let dict = ConcurrentDict::with_capacity(16);
        for i in 0..100 {
            dict.put(format!("key-{}", i), i);
        }
        assert_eq!(dict.len(), 100);
        for i in 0..40 {
            dict.remove(&format!("key-{}", i));
        }
        assert_eq!(dict.len(), 60);
        dict.clear();
        assert_eq!(dict.len(), 0);
        assert!(dict.is_empty());
    }

    #[test]
    fn test_keys_and_for_each_stop() {
        let dict = ConcurrentDict::with_capacity(16);
        for i in 0..10 {
            dict.put(format!("key-{}", i), i);
        }
        let mut keys = dict.keys();
        keys.sort();
        assert_eq!(keys.len(), 10);
        keys.dedup();
        assert_eq!(keys.len(), 10);

        let mut visited = 0;
        dict.for_each(|_, _| {
            visited += 1;
            visited < 3
        });
        assert_eq!(visited, 3);
    }

    #[test]
    fn test_random_keys() {
        let dict = ConcurrentDict::with_capacity(16);
        for i in 0..50 {
            dict.put(format!("key-{}", i), i);
        }
        assert_eq!(dict.random_keys(10).len(), 10);
        // limit above len returns everything
        assert_eq!(dict.random_keys(100).len(), 50);

        let distinct = dict.random_distinct_keys(10);
        let mut sorted = distinct.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), distinct.len());
        assert!(distinct.len() <= 10);
    }

    #[test]
    fn test_every_key_visible_in_its_shard() {
        let dict = ConcurrentDict::with_capacity(64);
        for i in 0..200 {
            dict.put(format!("key-{}", i), i);
        }
        for i in 0..200 {
            let key = format!("key-{}", i);
            let index = dict.index_of(&key);
            let shard = dict.shards[index].read().unwrap();
            assert!(shard.contains_key(&key));
        }
    }

    #[test]
    fn test_lock_indices_ascending_and_distinct() {
        let dict: ConcurrentDict<i32> = ConcurrentDict::with_capacity(16);
        let keys: Vec<String> = (0..64).map(|i| format!("key-{}", i)).collect();
        let indices = dict.lock_indices(keys.iter());
        for pair in indices.windows(2) {
            assert!(pair[0] < pair[1], "indices must be strictly ascending");
        }
    }

    #[test]
    fn test_key_group_read_and_write() {
        let dict = ConcurrentDict::with_capacity(16);
        dict.put("r".into(), 1);

        let write_keys = vec!["w".to_string()];
        let read_keys = vec!["r".to_string()];
        let mut group = dict.lock_keys(&write_keys, &read_keys);
        assert_eq!(group.get("r"), Some(&1));
        assert_eq!(group.put("w", 2), 1);
        assert_eq!(group.remove("w"), Some(2));
        drop(group);

        // Locks released: plain operations proceed.
        assert_eq!(dict.put("w".into(), 3), 1);
    }

    #[test]
    #[should_panic(expected = "through a read lock")]
    fn test_key_group_rejects_write_through_read_lock() {
        let dict = ConcurrentDict::with_capacity(16);
        let read_keys = vec!["r".to_string()];
        let mut group = dict.lock_keys(&[], &read_keys);
        group.put("r", 1);
    }

    #[test]
    fn test_write_key_escalates_shared_shard() {
        let dict = ConcurrentDict::with_capacity(16);
        // Same key in both lists: the shard must end up write-locked.
        let keys = vec!["k".to_string()];
        let mut group = dict.lock_keys(&keys, &keys);
        assert_eq!(group.put("k", 7), 1);
    }

    #[test]
    fn test_concurrent_access() {
        let dict = Arc::new(ConcurrentDict::with_capacity(64));
        let mut handles = Vec::new();
        for t in 0..8 {
            let dict = Arc::clone(&dict);
            handles.push(thread::spawn(move || {
                for i in 0..250 {
                    let key = format!("key-{}-{}", t, i);
                    dict.put(key.clone(), i);
                    assert_eq!(dict.get(&key), Some(i));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(dict.len(), 2000);
    }

    #[test]
    fn test_concurrent_group_locking() {
        // Overlapping groups acquired in opposite textual order must not
        // deadlock thanks to sorted acquisition.
        let dict = Arc::new(ConcurrentDict::with_capacity(16));
        let keys: Vec<String> = (0..32).map(|i| format!("key-{}", i)).collect();

        let mut handles = Vec::new();
        for t in 0..4 {
            let dict = Arc::clone(&dict);
            let mut keys = keys.clone();
            if t % 2 == 0 {
                keys.reverse();
            }
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let mut group = dict.lock_keys(&keys, &[]);
                    for key in &keys {
                        group.put(key, t);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(dict.len(), 32);
    }
}
