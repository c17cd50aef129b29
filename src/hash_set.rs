//! Bucket-striped concurrent hash set.
//!
//! The bucket count is fixed at construction. Every bucket carries its own
//! reader-writer lock: `contains` takes it shared, `insert` and `remove` take
//! it exclusive. There is no table-wide lock, so operations on different
//! buckets never wait for each other.

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;
use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};

/// Keys of one bucket. Insertion pushes to the end, removal swaps the last
/// entry into the hole; order inside a bucket carries no meaning.
type Chain<K> = Vec<K>;

pub struct ConcurrentSet<K, S = RandomState> {
    buckets: Box<[CachePadded<RwLock<Chain<K>>>]>,
    hasher: S,
}

impl<K: Hash + Eq> ConcurrentSet<K, RandomState> {
    /// Creates an empty set with `bucket_count` buckets.
    ///
    /// # Panics
    ///
    /// Panics if `bucket_count` is zero.
    pub fn new(bucket_count: usize) -> Self {
        Self::with_hasher(bucket_count, RandomState::new())
    }
}

impl<K: Hash + Eq, S: BuildHasher> ConcurrentSet<K, S> {
    /// Creates an empty set that places keys with `hasher`.
    ///
    /// # Panics
    ///
    /// Panics if `bucket_count` is zero.
    pub fn with_hasher(bucket_count: usize, hasher: S) -> Self {
        assert!(bucket_count > 0, "bucket count must be positive");
        let buckets = (0..bucket_count)
            .map(|_| CachePadded::new(RwLock::new(Chain::new())))
            .collect();
        Self { buckets, hasher }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket that holds `key`. Stable for the lifetime of the set.
    #[inline]
    pub fn bucket_index<Q>(&self, key: &Q) -> usize
    where
        Q: Hash + ?Sized,
    {
        (self.hasher.hash_one(key) % self.buckets.len() as u64) as usize
    }

    /// Adds `key` unless an equal key is already present.
    pub fn insert(&self, key: K) {
        let mut chain = self.buckets[self.bucket_index(&key)].write();
        if !chain.contains(&key) {
            chain.push(key);
        }
    }

    /// Removes `key` if present.
    pub fn remove<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut chain = self.buckets[self.bucket_index(key)].write();
        if let Some(pos) = chain.iter().position(|k| k.borrow() == key) {
            chain.swap_remove(pos);
        }
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.buckets[self.bucket_index(key)]
            .read()
            .iter()
            .any(|k| k.borrow() == key)
    }

    /// Number of keys, summed bucket by bucket.
    ///
    /// Buckets are locked one at a time, so under concurrent writes the result
    /// is not a snapshot of any single instant.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.read().is_empty())
    }
}

impl<K: Hash + Eq, S: BuildHasher> fmt::Debug for ConcurrentSet<K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentSet")
            .field("bucket_count", &self.bucket_count())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use std::collections::BTreeSet;
    use std::ops::RangeInclusive;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    const MAX_VALUE: u32 = 16;

    fn assert_matches_reference(
        set: &ConcurrentSet<u32>,
        reference: &BTreeSet<u32>,
        range: RangeInclusive<u32>,
    ) {
        for k in range {
            assert_eq!(
                set.contains(&k),
                reference.contains(&k),
                "membership of {} diverged",
                k
            );
        }
    }

    #[test]
    fn insert_remove_contains() {
        let set: ConcurrentSet<String> = ConcurrentSet::new(8);
        assert!(set.is_empty());
        assert!(!set.contains("foo"));

        set.insert("foo".to_string());
        assert!(set.contains("foo"));
        assert_eq!(set.len(), 1);

        set.remove("foo");
        assert!(!set.contains("foo"));
        assert!(set.is_empty());
    }

    #[test]
    fn duplicate_insert_is_a_no_op() {
        let set = ConcurrentSet::new(4);
        for k in 0..10u32 {
            set.insert(k);
        }
        set.insert(3);
        set.insert(3);
        assert_eq!(set.len(), 10);
        for k in 0..10u32 {
            assert!(set.contains(&k));
        }
    }

    #[test]
    fn removing_absent_key_is_a_no_op() {
        let set = ConcurrentSet::new(4);
        set.insert(1u32);
        set.insert(2u32);
        set.remove(&99);
        set.remove(&99);
        assert_eq!(set.len(), 2);
        assert!(set.contains(&1));
        assert!(set.contains(&2));
    }

    #[test]
    fn single_bucket_holds_many_keys() {
        let set = ConcurrentSet::new(1);
        for k in 0..100u32 {
            set.insert(k);
        }
        for k in (0..100u32).step_by(2) {
            set.remove(&k);
        }
        for k in 0..100u32 {
            assert_eq!(set.contains(&k), k % 2 == 1);
        }
        assert_eq!(set.len(), 50);
    }

    #[test]
    fn bucket_index_is_stable_and_in_range() {
        let set: ConcurrentSet<String> = ConcurrentSet::new(7);
        for k in 0..200 {
            let key = format!("key-{}", k);
            let index = set.bucket_index(key.as_str());
            assert!(index < 7);
            assert_eq!(index, set.bucket_index(&key));
        }
    }

    #[test]
    #[should_panic(expected = "bucket count must be positive")]
    fn zero_buckets_panics() {
        let _ = ConcurrentSet::<u32>::new(0);
    }

    #[test]
    fn random_ops_match_reference() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let set: ConcurrentSet<u32> = ConcurrentSet::new(4);
        let mut reference = BTreeSet::new();

        for _ in 0..20_000 {
            let value = rng.gen_range(0..=MAX_VALUE);
            if rng.gen_bool(0.5) {
                set.remove(&value);
                reference.remove(&value);
            } else {
                set.insert(value);
                reference.insert(value);
            }
            assert_matches_reference(&set, &reference, 0..=MAX_VALUE);
        }
        assert_eq!(set.len(), reference.len());
    }

    #[test]
    fn concurrent_random_ops_match_per_thread_reference() {
        const THREADS: u32 = 4;
        let set: ConcurrentSet<u32> = ConcurrentSet::new(4);

        thread::scope(|s| {
            for t in 0..THREADS {
                let set = &set;
                s.spawn(move || {
                    // disjoint key ranges, shared buckets
                    let base = t * (MAX_VALUE + 1);
                    let range = base..=base + MAX_VALUE;
                    let mut rng = StdRng::seed_from_u64(t as u64);
                    let mut reference = BTreeSet::new();

                    for _ in 0..5_000 {
                        let value = rng.gen_range(range.clone());
                        if rng.gen_bool(0.5) {
                            set.remove(&value);
                            reference.remove(&value);
                        } else {
                            set.insert(value);
                            reference.insert(value);
                        }
                        assert_matches_reference(set, &reference, range.clone());
                    }
                });
            }
        });
    }

    #[test]
    fn concurrent_inserts_of_same_key_leave_one_entry() {
        let set: ConcurrentSet<u32> = ConcurrentSet::new(2);
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for k in 0..50u32 {
                        set.insert(k);
                    }
                });
            }
        });
        assert_eq!(set.len(), 50);
    }

    /// Keys in different buckets, found by probing.
    fn keys_in_two_buckets(set: &ConcurrentSet<u32>) -> (u32, u32, u32) {
        let locked = 0u32;
        let same = (1..)
            .find(|k| set.bucket_index(k) == set.bucket_index(&locked))
            .unwrap();
        let other = (1..)
            .find(|k| set.bucket_index(k) != set.bucket_index(&locked))
            .unwrap();
        (locked, same, other)
    }

    #[test]
    fn writer_on_one_bucket_does_not_block_other_buckets() {
        let set = ConcurrentSet::new(16);
        let (locked, _, other) = keys_in_two_buckets(&set);
        set.insert(other);

        let guard = set.buckets[set.bucket_index(&locked)].write();
        let (tx, rx) = mpsc::channel();
        thread::scope(|s| {
            s.spawn(|| {
                let present = set.contains(&other);
                set.remove(&other);
                tx.send(present).unwrap();
            });
            // completes while the other bucket is still write-locked
            assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        });
        drop(guard);
    }

    #[test]
    fn writer_blocks_readers_of_the_same_bucket() {
        let set = ConcurrentSet::new(16);
        let (locked, same, _) = keys_in_two_buckets(&set);

        let guard = set.buckets[set.bucket_index(&locked)].write();
        let (tx, rx) = mpsc::channel();
        thread::scope(|s| {
            s.spawn(|| tx.send(set.contains(&same)).unwrap());
            assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
            drop(guard);
            assert!(!rx.recv_timeout(Duration::from_secs(5)).unwrap());
        });
    }

    #[test]
    fn readers_of_the_same_bucket_share_the_lock() {
        let set = ConcurrentSet::new(16);
        let (locked, same, _) = keys_in_two_buckets(&set);
        set.insert(same);

        let reader = set.buckets[set.bucket_index(&locked)].read();
        let (tx, rx) = mpsc::channel();
        thread::scope(|s| {
            s.spawn(|| tx.send(set.contains(&same)).unwrap());
            assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        });
        drop(reader);
    }
}
