use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

#[derive(Debug)]
struct Bucket<K, V> {
    // fixed at creation; buckets are replaced wholesale on split
    local_depth: u32,
    items: Mutex<Vec<(K, V)>>,
}

impl<K, V> Bucket<K, V>
where
    K: PartialEq,
{
    fn new(capacity: usize, local_depth: u32) -> Self {
        Self {
            local_depth,
            items: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    fn find(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.items
            .lock()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    fn remove(&self, key: &K) -> bool {
        let mut items = self.items.lock();
        if let Some(pos) = items.iter().position(|(k, _)| k == key) {
            items.remove(pos);
            true
        } else {
            false
        }
    }

    /// Inserts or replaces. Returns false when the bucket is full and the key
    /// is not already present.
    fn insert(&self, key: K, value: V, bucket_size: usize) -> bool {
        let mut items = self.items.lock();
        if let Some(pos) = items.iter().position(|(k, _)| *k == key) {
            items[pos].1 = value;
            return true;
        }
        if items.len() >= bucket_size {
            return false;
        }
        items.push((key, value));
        true
    }
}

#[derive(Debug)]
struct Directory<K, V> {
    global_depth: u32,
    num_buckets: usize,
    // 2^global_depth slots; several slots may alias one bucket
    buckets: Vec<Arc<Bucket<K, V>>>,
}

/// Concurrent extendible hash table.
///
/// Lookups and removals run under a shared directory latch plus the target
/// bucket's own mutex; only a structural change (bucket split, possibly
/// doubling the directory) takes the directory latch exclusively. Overflow of
/// a bucket whose local depth equals the global depth doubles the directory,
/// and a single insert may double it several times until the colliding keys
/// separate.
#[derive(Debug)]
pub struct ExtendibleHashTable<K, V, S = RandomState> {
    bucket_size: usize,
    hash_builder: S,
    dir: RwLock<Directory<K, V>>,
}

impl<K, V> ExtendibleHashTable<K, V, RandomState>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(bucket_size: usize) -> Self {
        Self::with_hasher(bucket_size, RandomState::new())
    }
}

impl<K, V, S> ExtendibleHashTable<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    pub fn with_hasher(bucket_size: usize, hash_builder: S) -> Self {
        assert!(bucket_size > 0, "bucket size must be positive");
        Self {
            bucket_size,
            hash_builder,
            dir: RwLock::new(Directory {
                global_depth: 0,
                num_buckets: 1,
                buckets: vec![Arc::new(Bucket::new(bucket_size, 0))],
            }),
        }
    }

    fn hash(&self, key: &K) -> usize {
        self.hash_builder.hash_one(key) as usize
    }

    fn index_of(&self, key: &K, global_depth: u32) -> usize {
        self.hash(key) & ((1usize << global_depth) - 1)
    }

    pub fn global_depth(&self) -> u32 {
        self.dir.read().global_depth
    }

    pub fn local_depth(&self, dir_index: usize) -> u32 {
        self.dir.read().buckets[dir_index].local_depth
    }

    pub fn num_buckets(&self) -> usize {
        self.dir.read().num_buckets
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let dir = self.dir.read();
        let index = self.index_of(key, dir.global_depth);
        dir.buckets[index].find(key)
    }

    pub fn remove(&self, key: &K) -> bool {
        let dir = self.dir.read();
        let index = self.index_of(key, dir.global_depth);
        dir.buckets[index].remove(key)
    }

    pub fn insert(&self, key: K, value: V) {
        loop {
            {
                let dir = self.dir.read();
                let index = self.index_of(&key, dir.global_depth);
                if dir.buckets[index].insert(key.clone(), value.clone(), self.bucket_size) {
                    return;
                }
            }
            // overflow: split the target bucket under the exclusive latch
            let mut dir = self.dir.write();
            let index = self.index_of(&key, dir.global_depth);
            let bucket = dir.buckets[index].clone();
            // another writer may have split this bucket already
            if bucket.insert(key.clone(), value.clone(), self.bucket_size) {
                return;
            }
            self.split_bucket(&mut dir, index, &bucket);
        }
    }

    fn split_bucket(&self, dir: &mut Directory<K, V>, index: usize, bucket: &Arc<Bucket<K, V>>) {
        let depth = bucket.local_depth;
        if depth == dir.global_depth {
            dir.global_depth += 1;
            let doubled = dir.buckets.clone();
            dir.buckets.extend(doubled);
        }

        let zero = Arc::new(Bucket::new(self.bucket_size, depth + 1));
        let one = Arc::new(Bucket::new(self.bucket_size, depth + 1));
        dir.num_buckets += 1;

        // rehash on the bit that now distinguishes the two halves
        let mask = 1usize << depth;
        {
            let mut items = bucket.items.lock();
            for (k, v) in items.drain(..) {
                let target = if self.hash(&k) & mask != 0 { &one } else { &zero };
                target.items.lock().push((k, v));
            }
        }

        // every slot whose low `depth` bits match the split bucket gets rewired
        let low_bits = index & (mask - 1);
        let mut slot = low_bits;
        while slot < dir.buckets.len() {
            if Arc::ptr_eq(&dir.buckets[slot], bucket) {
                dir.buckets[slot] = if slot & mask != 0 {
                    one.clone()
                } else {
                    zero.clone()
                };
            }
            slot += mask;
        }
    }
}
