//! Collections used in `ferrite`.
use std::collections::VecDeque;
use std::hash::Hash;

use bitcoin_hashes::siphash24;

/// A `HashMap` which uses `fastrand::Rng` for its random state.
pub type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;

/// A `HashSet` which uses `fastrand::Rng` for its random state.
pub type HashSet<K> = std::collections::HashSet<K, RandomState>;

/// Hasher using `siphash24`.
#[derive(Default)]
pub struct Hasher {
    data: Vec<u8>,
    key1: u64,
    key2: u64,
}

impl Hasher {
    fn new(key1: u64, key2: u64) -> Self {
        Self {
            data: vec![],
            key1,
            key2,
        }
    }
}

impl std::hash::Hasher for Hasher {
    fn write(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes)
    }

    fn finish(&self) -> u64 {
        siphash24::Hash::hash_with_keys(self.key1, self.key2, &self.data).as_u64()
    }
}

/// Random hasher state.
#[derive(Default, Clone)]
pub struct RandomState {
    key1: u64,
    key2: u64,
}

impl RandomState {
    fn new(rng: fastrand::Rng) -> Self {
        Self {
            key1: rng.u64(..),
            key2: rng.u64(..),
        }
    }
}

impl std::hash::BuildHasher for RandomState {
    type Hasher = Hasher;

    fn build_hasher(&self) -> Self::Hasher {
        Hasher::new(self.key1, self.key2)
    }
}

impl From<fastrand::Rng> for RandomState {
    fn from(rng: fastrand::Rng) -> Self {
        Self::new(rng)
    }
}

/// A bounded set remembering the most recently inserted items.
///
/// Used to keep track of what a peer already knows about, eg. addresses or
/// inventories we have sent or received. When the set is at capacity, the
/// oldest item is evicted to make room for the newly inserted one.
#[derive(Debug)]
pub struct KnownFilter<T> {
    set: HashSet<T>,
    queue: VecDeque<T>,
    capacity: usize,
}

impl<T: Eq + Hash + Clone> KnownFilter<T> {
    /// Create a new filter holding at most `capacity` items.
    pub fn new(capacity: usize, rng: fastrand::Rng) -> Self {
        Self {
            set: HashSet::with_capacity_and_hasher(capacity, rng.into()),
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert an item into the filter. Returns `false` if the item was
    /// already known. Evicts the oldest item when at capacity.
    pub fn insert(&mut self, item: T) -> bool {
        if self.set.contains(&item) {
            return false;
        }
        if self.queue.len() == self.capacity {
            if let Some(oldest) = self.queue.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.queue.push_back(item.clone());
        self.set.insert(item);

        true
    }

    /// Check whether an item is known.
    pub fn contains(&self, item: &T) -> bool {
        self.set.contains(item)
    }

    /// Number of items currently known.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the filter is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_filter_eviction() {
        let mut filter = KnownFilter::new(3, fastrand::Rng::with_seed(1));

        assert!(filter.insert(1));
        assert!(filter.insert(2));
        assert!(filter.insert(3));
        assert!(!filter.insert(2), "duplicates are rejected");
        assert_eq!(filter.len(), 3);

        // Inserting beyond capacity evicts the oldest entry.
        assert!(filter.insert(4));
        assert_eq!(filter.len(), 3);
        assert!(!filter.contains(&1));
        assert!(filter.contains(&2));
        assert!(filter.contains(&3));
        assert!(filter.contains(&4));

        // Evicted items can be inserted again.
        assert!(filter.insert(1));
        assert!(!filter.contains(&2));
    }
}
