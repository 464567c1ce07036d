//! An open-addressed hash table using Robin Hood displacement over an
//! [`Array`] of buckets, growing and rehashing wholesale when the load
//! factor crosses three quarters.

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::array::{Array, ArrayAnchor, GrowthPolicy};
use crate::binary_format;
use crate::engine::Engine;
use crate::error::Result;
use crate::serialize::{CustomLayout, StaticLayout};

const INITIAL_CAPACITY: u64 = 8;

#[derive(Clone, Copy)]
struct Bucket<K, V> {
    occupied: bool,
    distance: u32,
    key: K,
    value: V,
}

impl<K: StaticLayout, V: StaticLayout> StaticLayout for Bucket<K, V> {
    const SIZE: usize = bool::SIZE + u32::SIZE + K::SIZE + V::SIZE;

    fn write_layout(&self, buf: &mut [u8]) {
        let mut offset = 0;
        self.occupied.write_layout(&mut buf[offset..offset + bool::SIZE]);
        offset += bool::SIZE;
        self.distance.write_layout(&mut buf[offset..offset + u32::SIZE]);
        offset += u32::SIZE;
        self.key.write_layout(&mut buf[offset..offset + K::SIZE]);
        offset += K::SIZE;
        self.value.write_layout(&mut buf[offset..offset + V::SIZE]);
    }

    fn read_layout(buf: &[u8]) -> Self {
        let mut offset = 0;
        let occupied = bool::read_layout(&buf[offset..offset + bool::SIZE]);
        offset += bool::SIZE;
        let distance = u32::read_layout(&buf[offset..offset + u32::SIZE]);
        offset += u32::SIZE;
        let key = K::read_layout(&buf[offset..offset + K::SIZE]);
        offset += K::SIZE;
        let value = V::read_layout(&buf[offset..offset + V::SIZE]);
        Bucket {
            occupied,
            distance,
            key,
            value,
        }
    }
}

impl<K: StaticLayout, V: StaticLayout> CustomLayout for Bucket<K, V> {}

binary_format! {
    /// Persistent state of a [`HashTable`]: its bucket array and the
    /// number of occupied slots.
    pub struct HashTableAnchor {
        buckets: ArrayAnchor,
        size: u64,
    }
}

impl HashTableAnchor {
    /// The anchor of a hash table with no buckets allocated yet.
    pub fn empty() -> Self {
        HashTableAnchor {
            buckets: ArrayAnchor::empty(),
            size: 0,
        }
    }
}

/// A hash table mapping `K` to `V`, probing linearly with Robin Hood
/// displacement (the bucket holding the larger probe distance stays put)
/// and deleting by backward-shifting trailing entries rather than by
/// tombstone.
pub struct HashTable<K, V, E: Engine> {
    engine: Rc<RefCell<E>>,
    buckets: Array<Bucket<K, V>, E>,
    size: u64,
}

impl<K, V, E> HashTable<K, V, E>
where
    K: StaticLayout + Copy + Hash + Eq,
    V: StaticLayout + Copy,
    E: Engine,
{
    /// Attaches to a previously persisted hash table.
    pub fn open(engine: Rc<RefCell<E>>, anchor: HashTableAnchor) -> Self {
        let buckets = Array::open(engine.clone(), anchor.buckets, GrowthPolicy::Exponential);
        HashTable {
            engine,
            buckets,
            size: anchor.size,
        }
    }

    /// Creates a fresh, empty hash table.
    pub fn create(engine: Rc<RefCell<E>>) -> Self {
        Self::open(engine, HashTableAnchor::empty())
    }

    /// The table's persistent anchor, to be saved by the caller.
    pub fn anchor(&self) -> HashTableAnchor {
        HashTableAnchor {
            buckets: self.buckets.anchor(),
            size: self.size,
        }
    }

    /// Number of key-value pairs stored.
    pub fn len(&self) -> u64 {
        self.size
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn capacity(&self) -> u64 {
        self.buckets.len()
    }

    fn slot_for(&self, key: &K, capacity: u64) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() % capacity
    }

    /// Looks up the value stored for `key`.
    pub fn get(&mut self, key: &K) -> Result<Option<V>> {
        let capacity = self.capacity();
        if capacity == 0 {
            return Ok(None);
        }
        let mut idx = self.slot_for(key, capacity);
        let mut dist = 0u32;
        loop {
            let bucket = self.buckets.get(idx)?;
            if !bucket.occupied || dist > bucket.distance {
                return Ok(None);
            }
            if bucket.key == *key {
                return Ok(Some(bucket.value));
            }
            idx = (idx + 1) % capacity;
            dist += 1;
        }
    }

    /// Whether `key` is present.
    pub fn contains_key(&mut self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn grow_and_rehash(&mut self, alloc: &mut crate::allocator::DefaultAllocator<E>) -> Result<()> {
        let old_capacity = self.capacity();
        let mut collected = Vec::with_capacity(self.size as usize);
        for i in 0..old_capacity {
            let bucket = self.buckets.get(i)?;
            if bucket.occupied {
                collected.push((bucket.key, bucket.value));
            }
        }
        let new_capacity = old_capacity.max(INITIAL_CAPACITY / 2) * 2;
        let mut new_buckets: Array<Bucket<K, V>, E> =
            Array::create(self.engine.clone(), GrowthPolicy::Exponential);
        new_buckets.resize(alloc, new_capacity)?;
        self.buckets.reset(alloc)?;
        self.buckets = new_buckets;
        for (key, value) in collected {
            self.raw_insert(key, value)?;
        }
        Ok(())
    }

    fn raw_insert(&mut self, mut key: K, mut value: V) -> Result<()> {
        let capacity = self.capacity();
        let mut idx = self.slot_for(&key, capacity);
        let mut distance = 0u32;
        loop {
            let mut bucket = self.buckets.get(idx)?;
            if !bucket.occupied {
                self.buckets.set(
                    idx,
                    &Bucket {
                        occupied: true,
                        distance,
                        key,
                        value,
                    },
                )?;
                return Ok(());
            }
            if bucket.key == key {
                bucket.value = value;
                self.buckets.set(idx, &bucket)?;
                return Ok(());
            }
            if bucket.distance < distance {
                self.buckets.set(
                    idx,
                    &Bucket {
                        occupied: true,
                        distance,
                        key,
                        value,
                    },
                )?;
                key = bucket.key;
                value = bucket.value;
                distance = bucket.distance;
            }
            idx = (idx + 1) % capacity;
            distance += 1;
        }
    }

    /// Inserts or replaces the value for `key`, returning the previous
    /// value if one was present.
    pub fn insert(
        &mut self,
        alloc: &mut crate::allocator::DefaultAllocator<E>,
        key: K,
        value: V,
    ) -> Result<Option<V>> {
        let previous = self.get(&key)?;
        if previous.is_none() {
            if self.capacity() == 0 {
                self.buckets.resize(alloc, INITIAL_CAPACITY)?;
            } else if (self.size + 1) * 4 > self.capacity() * 3 {
                self.grow_and_rehash(alloc)?;
            }
            self.size += 1;
        }
        self.raw_insert(key, value)?;
        Ok(previous)
    }

    /// Removes `key`, returning its value if it was present, and
    /// backward-shifts any entries displaced past it to keep probe
    /// chains contiguous.
    pub fn remove(&mut self, key: &K) -> Result<Option<V>> {
        let capacity = self.capacity();
        if capacity == 0 {
            return Ok(None);
        }
        let mut idx = self.slot_for(key, capacity);
        let mut dist = 0u32;
        let removed = loop {
            let bucket = self.buckets.get(idx)?;
            if !bucket.occupied || dist > bucket.distance {
                return Ok(None);
            }
            if bucket.key == *key {
                break bucket.value;
            }
            idx = (idx + 1) % capacity;
            dist += 1;
        };

        let mut hole = idx;
        loop {
            let next = (hole + 1) % capacity;
            let next_bucket = self.buckets.get(next)?;
            if !next_bucket.occupied || next_bucket.distance == 0 {
                self.buckets.set(
                    hole,
                    &Bucket {
                        occupied: false,
                        distance: 0,
                        key: next_bucket.key,
                        value: next_bucket.value,
                    },
                )?;
                break;
            }
            self.buckets.set(
                hole,
                &Bucket {
                    occupied: true,
                    distance: next_bucket.distance - 1,
                    key: next_bucket.key,
                    value: next_bucket.value,
                },
            )?;
            hole = next;
        }
        self.size -= 1;
        Ok(Some(removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::DefaultAllocator;
    use crate::engine::BufferedEngine;
    use crate::vfs::MemoryFile;

    fn new_pair(block_size: u32) -> (Rc<RefCell<BufferedEngine<MemoryFile>>>, DefaultAllocator<BufferedEngine<MemoryFile>>) {
        let file = MemoryFile::new();
        let engine = Rc::new(RefCell::new(BufferedEngine::new(file, block_size, 64).unwrap()));
        let alloc = DefaultAllocator::create(engine.clone());
        (engine, alloc)
    }

    #[test]
    fn insert_get_round_trip() {
        let (engine, mut alloc) = new_pair(256);
        let mut table: HashTable<u32, u32, _> = HashTable::create(engine);
        for i in 0..50u32 {
            table.insert(&mut alloc, i, i * 10).unwrap();
        }
        assert_eq!(table.len(), 50);
        for i in 0..50u32 {
            assert_eq!(table.get(&i).unwrap(), Some(i * 10));
        }
    }

    #[test]
    fn insert_replaces_existing_key() {
        let (engine, mut alloc) = new_pair(256);
        let mut table: HashTable<u32, u32, _> = HashTable::create(engine);
        table.insert(&mut alloc, 1, 100).unwrap();
        let previous = table.insert(&mut alloc, 1, 200).unwrap();
        assert_eq!(previous, Some(100));
        assert_eq!(table.get(&1).unwrap(), Some(200));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_shrinks_and_preserves_others() {
        let (engine, mut alloc) = new_pair(256);
        let mut table: HashTable<u32, u32, _> = HashTable::create(engine);
        for i in 0..30u32 {
            table.insert(&mut alloc, i, i).unwrap();
        }
        for i in 0..15u32 {
            assert_eq!(table.remove(&i).unwrap(), Some(i));
        }
        assert_eq!(table.len(), 15);
        for i in 15..30u32 {
            assert_eq!(table.get(&i).unwrap(), Some(i));
        }
        for i in 0..15u32 {
            assert_eq!(table.get(&i).unwrap(), None);
        }
    }

    #[test]
    fn grows_past_initial_capacity() {
        let (engine, mut alloc) = new_pair(256);
        let mut table: HashTable<u32, u32, _> = HashTable::create(engine);
        for i in 0..500u32 {
            table.insert(&mut alloc, i, i).unwrap();
        }
        assert_eq!(table.len(), 500);
        for i in 0..500u32 {
            assert_eq!(table.get(&i).unwrap(), Some(i));
        }
    }
}
