//! Computed-table cache for BDD operation memoization.
//!
//! A fixed-size 4-way set-associative table. Each set keeps its ways ordered
//! from most to least recently used, so an insert into a full set evicts the
//! stale entry. Memory stays bounded for the whole lifetime of a manager, no
//! matter how many queries share it.

use crate::utils::MyHash;

/// Ways per set.
const WAYS: usize = 4;

#[derive(Debug, Copy, Clone)]
struct Entry<K, V> {
    key: K,
    value: V,
}

type Set<K, V> = [Option<Entry<K, V>>; WAYS];

pub struct Cache<K, V> {
    sets: Vec<Set<K, V>>,
    bitmask: u64,
    hits: usize,
    misses: usize,
}

impl<K: Copy, V: Copy> Default for Cache<K, V> {
    fn default() -> Self {
        Self::new(14)
    }
}

impl<K: Copy, V: Copy> Cache<K, V> {
    /// Creates a new cache with `2^bits` sets of [`WAYS`] entries each.
    pub fn new(bits: usize) -> Self {
        assert!(bits <= 31, "Bits should be in the range 0..=31");
        let num_sets = 1usize << bits;
        Self {
            sets: vec![[None; WAYS]; num_sets],
            bitmask: (num_sets - 1) as u64,
            hits: 0,
            misses: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.sets.len() * WAYS
    }

    /// Number of occupied entries.
    pub fn len(&self) -> usize {
        self.sets.iter().flatten().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the number of cache hits.
    pub fn hits(&self) -> usize {
        self.hits
    }
    /// Get the number of cache misses.
    pub fn misses(&self) -> usize {
        self.misses
    }

    pub fn clear(&mut self) {
        self.sets.fill([None; WAYS]);
    }
}

impl<K, V> Cache<K, V>
where
    K: MyHash + Eq + Copy,
    V: Copy,
{
    fn set_mut(&mut self, key: &K) -> &mut Set<K, V> {
        let index = (key.hash() & self.bitmask) as usize;
        &mut self.sets[index]
    }

    /// Moves the matching way to the front of its set.
    fn promote(set: &mut Set<K, V>, key: &K) -> bool {
        match set.iter().position(|e| e.is_some_and(|e| e.key == *key)) {
            Some(pos) => {
                set[..=pos].rotate_right(1);
                true
            }
            None => false,
        }
    }

    /// Get the cached result.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let set = self.set_mut(key);
        let found = if Self::promote(set, key) {
            set[0].map(|e| e.value)
        } else {
            None
        };
        match found {
            Some(_) => self.hits += 1,
            None => self.misses += 1,
        }
        found
    }

    /// Insert a result into the cache, evicting the least recently used way
    /// of a full set.
    pub fn insert(&mut self, key: K, value: V) {
        let set = self.set_mut(&key);
        if !Self::promote(set, &key) {
            set.rotate_right(1);
        }
        set[0] = Some(Entry { key, value });
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_cache() {
        let mut cache = Cache::<(u64, u64), i32>::new(3);

        cache.insert((1, 2), 3);
        cache.insert((2, 3), 1);
        cache.insert((1, 3), 2);

        assert_eq!(cache.get(&(1, 2)), Some(3));
        assert_eq!(cache.get(&(2, 3)), Some(1));
        assert_eq!(cache.get(&(1, 3)), Some(2));
        assert_eq!(cache.get(&(2, 1)), None);
        assert_eq!(cache.get(&(3, 3)), None);

        assert_eq!(cache.hits(), 3);
        assert_eq!(cache.misses(), 2);
        assert_eq!(cache.len(), 3);

        cache.insert((1, 2), 7);
        assert_eq!(cache.get(&(1, 2)), Some(7));
        assert_eq!(cache.len(), 3);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&(1, 2)), None);
    }

    #[test]
    fn test_bounded_with_lru_eviction() {
        // A single set: every key competes for the same four ways.
        let mut cache = Cache::<(u64, u64), u64>::new(0);
        for i in 1..=4 {
            cache.insert((i, 0), i);
        }
        assert_eq!(cache.get(&(1, 0)), Some(1));

        cache.insert((5, 0), 5);
        assert_eq!(cache.get(&(2, 0)), None);
        assert_eq!(cache.get(&(1, 0)), Some(1));
        assert_eq!(cache.get(&(5, 0)), Some(5));

        for i in 0..1000 {
            cache.insert((i, i), i);
        }
        assert_eq!(cache.len(), cache.capacity());
        assert_eq!(cache.capacity(), 4);
    }
}
