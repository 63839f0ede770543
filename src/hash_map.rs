// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Chained hash map over flat parallel arrays
//!
//! Keys, values and an intrusive `next` link live in slot arrays; a bucket
//! array twice the slot capacity holds chain heads. Reclaimed slots form a
//! free list threaded through `next`.
//!
//! Insertion through a [`ConcurrentWriter`] / [`ConcurrentMultiWriter`] is
//! lock-free (CAS on bucket heads and on the free list head) and may run
//! on many threads at once. Everything else takes `&mut self`.
//!
//! Slots handed back by a concurrent insert that lost a duplicate-key race
//! go to a separate push-only list and are merged into the main free list
//! on the next exclusive operation, so the main list is pop-only while
//! writers are live and cannot suffer ABA.

use std::cell::UnsafeCell;
use std::fmt;
use std::hash::Hash;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use ahash::RandomState;
use crossbeam::utils::CachePadded;

use crate::error::{EcsError, Result};

const NONE: i32 = -1;

/// Cursor over the values stored under one key
///
/// Invalidated by any grow of the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashMapIterator<K> {
    key: K,
    entry_index: i32,
    next_entry_index: i32,
}

impl<K: Copy> HashMapIterator<K> {
    /// Key this cursor walks
    pub fn key(&self) -> K {
        self.key
    }
}

struct HashMapData<K, V> {
    keys: Box<[UnsafeCell<MaybeUninit<K>>]>,
    values: Box<[UnsafeCell<MaybeUninit<V>>]>,
    next: Box<[AtomicI32]>,
    buckets: Box<[AtomicI32]>,
    first_free: CachePadded<AtomicI32>,
    pending_free: CachePadded<AtomicI32>,
    allocated_index_length: CachePadded<AtomicI32>,
    len: AtomicUsize,
    hasher: RandomState,
}

// SAFETY: slot contents are only written by the thread that allocated the
// slot, before it is published with a release CAS on its bucket head.
unsafe impl<K: Send, V: Send> Send for HashMapData<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for HashMapData<K, V> {}

fn atomic_array(len: usize) -> Box<[AtomicI32]> {
    (0..len).map(|_| AtomicI32::new(NONE)).collect()
}

fn slot_array<T>(len: usize) -> Box<[UnsafeCell<MaybeUninit<T>>]> {
    (0..len)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect()
}

impl<K, V> HashMapData<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    fn allocate(capacity: usize, hasher: RandomState) -> Self {
        assert!(
            capacity <= i32::MAX as usize / 2,
            "hash map capacity {capacity} exceeds the slot index range"
        );
        Self {
            keys: slot_array(capacity),
            values: slot_array(capacity),
            next: atomic_array(capacity),
            buckets: atomic_array((capacity * 2).max(1)),
            first_free: CachePadded::new(AtomicI32::new(NONE)),
            pending_free: CachePadded::new(AtomicI32::new(NONE)),
            allocated_index_length: CachePadded::new(AtomicI32::new(0)),
            len: AtomicUsize::new(0),
            hasher,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    fn bucket_of(&self, key: &K) -> usize {
        let hash = self.hasher.hash_one(key) as i32;
        hash.unsigned_abs() as usize % self.buckets.len()
    }

    /// # Safety
    /// `index` must be a slot that has been written at least once.
    #[inline]
    unsafe fn key_at(&self, index: i32) -> K {
        (*self.keys[index as usize].get()).assume_init()
    }

    /// # Safety
    /// `index` must be a slot that has been written at least once.
    #[inline]
    unsafe fn value_at(&self, index: i32) -> V {
        (*self.values[index as usize].get()).assume_init()
    }

    fn high_water_mark(&self) -> usize {
        (self.allocated_index_length.load(Ordering::Acquire).max(0) as usize).min(self.capacity())
    }

    fn pop_free(&self) -> Option<i32> {
        let mut head = self.first_free.load(Ordering::Acquire);
        while head >= 0 {
            let next = self.next[head as usize].load(Ordering::Acquire);
            match self.first_free.compare_exchange_weak(
                head,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(head),
                Err(actual) => head = actual,
            }
        }
        None
    }

    /// Free list first, then the never-used tail, then the free list again
    /// in case another thread released into it meanwhile.
    fn alloc_entry(&self) -> Option<i32> {
        if let Some(index) = self.pop_free() {
            return Some(index);
        }
        let index = self.allocated_index_length.fetch_add(1, Ordering::AcqRel);
        if (index as usize) < self.capacity() {
            return Some(index);
        }
        self.pop_free()
    }

    fn push_pending(&self, index: i32) {
        let mut head = self.pending_free.load(Ordering::Acquire);
        loop {
            self.next[index as usize].store(head, Ordering::Relaxed);
            match self.pending_free.compare_exchange_weak(
                head,
                index,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    fn push_free(&mut self, index: i32) {
        let head = *self.first_free.get_mut();
        *self.next[index as usize].get_mut() = head;
        *self.first_free.get_mut() = index;
    }

    fn merge_pending(&mut self) {
        let mut index = std::mem::replace(self.pending_free.get_mut(), NONE);
        while index >= 0 {
            let next = *self.next[index as usize].get_mut();
            self.push_free(index);
            index = next;
        }
    }

    fn is_full(&mut self) -> bool {
        self.merge_pending();
        *self.first_free.get_mut() < 0 && self.high_water_mark() >= self.capacity()
    }

    fn find_in_chain(&self, key: &K, mut index: i32, stop: i32) -> Option<i32> {
        while index >= 0 && index != stop {
            // SAFETY: every index reachable from a bucket head has been written
            if unsafe { self.key_at(index) } == *key {
                return Some(index);
            }
            index = self.next[index as usize].load(Ordering::Acquire);
        }
        None
    }

    /// Lock-free insert; `unique` rejects keys already present
    fn insert(&self, key: K, value: V, unique: bool) -> bool {
        let bucket = &self.buckets[self.bucket_of(&key)];
        let mut head = bucket.load(Ordering::Acquire);
        if unique && self.find_in_chain(&key, head, NONE).is_some() {
            return false;
        }

        let Some(index) = self.alloc_entry() else {
            panic!(
                "hash map is full (capacity {}), reserve before concurrent insertion",
                self.capacity()
            );
        };

        // SAFETY: the slot was just taken off the free list or the unused
        // tail, no other thread can observe it until the CAS below succeeds.
        unsafe {
            (*self.keys[index as usize].get()).write(key);
            (*self.values[index as usize].get()).write(value);
        }

        loop {
            self.next[index as usize].store(head, Ordering::Relaxed);
            match bucket.compare_exchange(head, index, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => {
                    // Only the entries prepended since `head` can be new
                    if unique && self.find_in_chain(&key, actual, head).is_some() {
                        self.push_pending(index);
                        return false;
                    }
                    head = actual;
                }
            }
        }

        self.len.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn first(&self, key: K) -> Option<(V, HashMapIterator<K>)> {
        let mut it = HashMapIterator {
            key,
            entry_index: NONE,
            next_entry_index: self.buckets[self.bucket_of(&key)].load(Ordering::Acquire),
        };
        self.next_value(&mut it).map(|value| (value, it))
    }

    fn next_value(&self, it: &mut HashMapIterator<K>) -> Option<V> {
        let start = it.next_entry_index;
        it.entry_index = NONE;
        it.next_entry_index = NONE;

        let index = self.find_in_chain(&it.key, start, NONE)?;
        it.entry_index = index;
        it.next_entry_index = self.next[index as usize].load(Ordering::Acquire);
        // SAFETY: found through a bucket chain
        Some(unsafe { self.value_at(index) })
    }

    fn unlink(&mut self, bucket: usize, prev: i32, index: i32) {
        let next = *self.next[index as usize].get_mut();
        if prev < 0 {
            *self.buckets[bucket].get_mut() = next;
        } else {
            *self.next[prev as usize].get_mut() = next;
        }
        self.push_free(index);
        *self.len.get_mut() -= 1;
    }

    fn remove_key(&mut self, key: &K) -> usize {
        self.merge_pending();
        let bucket = self.bucket_of(key);
        let mut prev = NONE;
        let mut index = *self.buckets[bucket].get_mut();
        let mut removed = 0;
        while index >= 0 {
            let next = *self.next[index as usize].get_mut();
            // SAFETY: reachable from a bucket head
            if unsafe { self.key_at(index) } == *key {
                self.unlink(bucket, prev, index);
                removed += 1;
            } else {
                prev = index;
            }
            index = next;
        }
        removed
    }

    fn remove_at(&mut self, it: &HashMapIterator<K>) -> bool {
        if it.entry_index < 0 {
            return false;
        }
        self.merge_pending();
        let bucket = self.bucket_of(&it.key);
        let mut prev = NONE;
        let mut index = *self.buckets[bucket].get_mut();
        while index >= 0 {
            if index == it.entry_index {
                self.unlink(bucket, prev, index);
                return true;
            }
            prev = index;
            index = *self.next[index as usize].get_mut();
        }
        false
    }

    fn clear(&mut self) {
        for bucket in self.buckets.iter_mut() {
            *bucket.get_mut() = NONE;
        }
        *self.first_free.get_mut() = NONE;
        *self.pending_free.get_mut() = NONE;
        *self.allocated_index_length.get_mut() = 0;
        *self.len.get_mut() = 0;
    }

    fn reallocate(&mut self, capacity: usize) -> Result<()> {
        if capacity < self.capacity() {
            return Err(EcsError::InvalidOperation(
                "Shrinking a hash map is not supported".into(),
            ));
        }
        self.grow_to(capacity);
        Ok(())
    }

    /// Grow to `capacity`, keeping slot indices and rehashing every chain;
    /// no-op unless `capacity` exceeds the current one
    fn grow_to(&mut self, capacity: usize) {
        if capacity <= self.capacity() {
            return;
        }
        self.merge_pending();

        let mut grown = Self::allocate(capacity, self.hasher.clone());
        let used = self.high_water_mark();
        for i in 0..used {
            *grown.keys[i].get_mut() = *self.keys[i].get_mut();
            *grown.values[i].get_mut() = *self.values[i].get_mut();
            *grown.next[i].get_mut() = *self.next[i].get_mut();
        }
        *grown.first_free.get_mut() = *self.first_free.get_mut();
        *grown.allocated_index_length.get_mut() = used as i32;
        *grown.len.get_mut() = *self.len.get_mut();

        for b in 0..self.buckets.len() {
            let mut index = *self.buckets[b].get_mut();
            while index >= 0 {
                let next = *self.next[index as usize].get_mut();
                // SAFETY: reachable from a bucket head
                let key = unsafe { self.key_at(index) };
                let target = grown.bucket_of(&key);
                let head = *grown.buckets[target].get_mut();
                *grown.next[index as usize].get_mut() = head;
                *grown.buckets[target].get_mut() = index;
                index = next;
            }
        }

        *self = grown;
    }

    fn grow_if_full(&mut self) {
        if self.is_full() {
            self.grow_to((self.capacity() * 2).max(1));
        }
    }

    fn reserve(&mut self, additional: usize) {
        self.merge_pending();
        let needed = *self.len.get_mut() + additional;
        if needed > self.capacity() {
            self.grow_to(needed.max(self.capacity() * 2));
        }
    }

    fn entries(&self) -> Vec<(K, V)> {
        let mut out = Vec::with_capacity(self.len.load(Ordering::Relaxed));
        for bucket in self.buckets.iter() {
            let mut index = bucket.load(Ordering::Acquire);
            while index >= 0 {
                // SAFETY: reachable from a bucket head
                unsafe { out.push((self.key_at(index), self.value_at(index))) };
                index = self.next[index as usize].load(Ordering::Acquire);
            }
        }
        out
    }
}

fn default_hasher() -> RandomState {
    RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    )
}

/// Single-value map: one value per key
pub struct ConcurrentHashMap<K, V> {
    data: HashMapData<K, V>,
}

impl<K, V> ConcurrentHashMap<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: HashMapData::allocate(capacity, default_hasher()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Grow to exactly `capacity`; shrinking fails
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        self.data.reallocate(capacity)
    }

    /// Make room for `additional` more entries
    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    /// Insert unless the key is present; grows when full
    pub fn try_add(&mut self, key: K, value: V) -> bool {
        self.data.grow_if_full();
        self.data.insert(key, value, true)
    }

    pub fn try_get_value(&self, key: K) -> Option<V> {
        self.data.first(key).map(|(value, _)| value)
    }

    pub fn contains_key(&self, key: K) -> bool {
        self.try_get_value(key).is_some()
    }

    /// Remove the entry for `key`, returns whether one existed
    pub fn remove(&mut self, key: K) -> bool {
        self.data.remove_key(&key) > 0
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Snapshot of all entries in bucket order
    pub fn entries(&self) -> Vec<(K, V)> {
        self.data.entries()
    }

    /// Writer usable from many threads at once; capacity is fixed while it lives
    pub fn concurrent(&mut self) -> ConcurrentWriter<'_, K, V> {
        self.data.merge_pending();
        ConcurrentWriter { data: &self.data }
    }
}

impl<K, V> Default for ConcurrentHashMap<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for ConcurrentHashMap<K, V>
where
    K: Copy + Eq + Hash + fmt::Debug,
    V: Copy + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.data.entries()).finish()
    }
}

/// Lock-free insertion handle for [`ConcurrentHashMap`]
pub struct ConcurrentWriter<'a, K, V> {
    data: &'a HashMapData<K, V>,
}

impl<K, V> Clone for ConcurrentWriter<'_, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for ConcurrentWriter<'_, K, V> {}

impl<K, V> ConcurrentWriter<'_, K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    /// Insert unless present. Panics when the map is full.
    pub fn try_add(&self, key: K, value: V) -> bool {
        self.data.insert(key, value, true)
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }
}

/// Multi-value map: any number of values per key
pub struct ConcurrentMultiHashMap<K, V> {
    data: HashMapData<K, V>,
}

impl<K, V> ConcurrentMultiHashMap<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: HashMapData::allocate(capacity, default_hasher()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        self.data.reallocate(capacity)
    }

    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    /// Insert another value under `key`; grows when full
    pub fn add(&mut self, key: K, value: V) {
        self.data.grow_if_full();
        self.data.insert(key, value, false);
    }

    pub fn try_get_first_value(&self, key: K) -> Option<(V, HashMapIterator<K>)> {
        self.data.first(key)
    }

    pub fn try_get_next_value(&self, it: &mut HashMapIterator<K>) -> Option<V> {
        self.data.next_value(it)
    }

    /// All values under `key`
    pub fn values(&self, key: K) -> Vec<V> {
        let mut out = Vec::new();
        if let Some((value, mut it)) = self.data.first(key) {
            out.push(value);
            while let Some(value) = self.data.next_value(&mut it) {
                out.push(value);
            }
        }
        out
    }

    /// Remove every value under `key`, returns how many
    pub fn remove(&mut self, key: K) -> usize {
        self.data.remove_key(&key)
    }

    /// Remove exactly the entry the cursor points at
    ///
    /// The cursor can keep iterating afterwards.
    pub fn remove_at(&mut self, it: &HashMapIterator<K>) -> bool {
        self.data.remove_at(it)
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.data.entries()
    }

    pub fn concurrent(&mut self) -> ConcurrentMultiWriter<'_, K, V> {
        self.data.merge_pending();
        ConcurrentMultiWriter { data: &self.data }
    }
}

impl<K, V> Default for ConcurrentMultiHashMap<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for ConcurrentMultiHashMap<K, V>
where
    K: Copy + Eq + Hash + fmt::Debug,
    V: Copy + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.data.entries()).finish()
    }
}

/// Lock-free insertion handle for [`ConcurrentMultiHashMap`]
pub struct ConcurrentMultiWriter<'a, K, V> {
    data: &'a HashMapData<K, V>,
}

impl<K, V> Clone for ConcurrentMultiWriter<'_, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for ConcurrentMultiWriter<'_, K, V> {}

impl<K, V> ConcurrentMultiWriter<'_, K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    /// Panics when the map is full
    pub fn add(&self, key: K, value: V) {
        self.data.insert(key, value, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_add_rejects_duplicate() {
        let mut map = ConcurrentHashMap::with_capacity(4);
        assert!(map.try_add(1u32, 10u32));
        assert!(!map.try_add(1, 11));
        assert_eq!(map.try_get_value(1), Some(10));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_grows_from_zero() {
        let mut map = ConcurrentHashMap::new();
        for i in 0..100u64 {
            assert!(map.try_add(i, i * 2));
        }
        assert!(map.capacity() >= 100);
        for i in 0..100u64 {
            assert_eq!(map.try_get_value(i), Some(i * 2));
        }
    }

    #[test]
    fn test_multi_map_values() {
        let mut map = ConcurrentMultiHashMap::with_capacity(8);
        map.add(7u32, 1u32);
        map.add(7, 2);
        map.add(8, 3);

        let mut values = map.values(7);
        values.sort_unstable();
        assert_eq!(values, vec![1, 2]);
        assert_eq!(map.values(8), vec![3]);
        assert!(map.values(9).is_empty());
    }

    #[test]
    fn test_remove_at_leaves_other_value() {
        let mut map = ConcurrentMultiHashMap::with_capacity(8);
        map.add(5u32, 100u32);
        map.add(5, 200);

        let (first, it) = map.try_get_first_value(5).expect("two values present");
        assert!(map.remove_at(&it));
        assert_eq!(map.len(), 1);

        let remaining = map.values(5);
        assert_eq!(remaining.len(), 1);
        assert_ne!(remaining[0], first);
    }

    #[test]
    fn test_remove_all_for_key() {
        let mut map = ConcurrentMultiHashMap::with_capacity(8);
        for v in 0..5u32 {
            map.add(1u32, v);
        }
        map.add(2, 9);
        assert_eq!(map.remove(1), 5);
        assert!(map.values(1).is_empty());
        assert_eq!(map.values(2), vec![9]);
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let mut map = ConcurrentHashMap::with_capacity(2);
        assert!(map.try_add(1u32, 1u32));
        assert!(map.try_add(2, 2));
        assert!(map.remove(1));
        assert!(map.try_add(3, 3));
        assert_eq!(map.capacity(), 2);
    }

    #[test]
    fn test_shrink_fails() {
        let mut map: ConcurrentHashMap<u32, u32> = ConcurrentHashMap::with_capacity(16);
        assert!(map.set_capacity(8).is_err());
        assert!(map.set_capacity(32).is_ok());
        assert_eq!(map.capacity(), 32);
        assert!(map.set_capacity(32).is_ok());
    }

    #[test]
    fn test_reserve_rehashes_chains() {
        let mut map = ConcurrentHashMap::with_capacity(3);
        for i in 0..3u32 {
            assert!(map.try_add(i, i + 10));
        }
        map.reserve(50);
        assert!(map.capacity() >= 53);
        for i in 0..3u32 {
            assert_eq!(map.try_get_value(i), Some(i + 10));
        }
        for i in 3..53u32 {
            assert!(map.try_add(i, i + 10));
        }
        assert_eq!(map.len(), 53);
        assert_eq!(map.try_get_value(52), Some(62));
    }

    #[test]
    fn test_grow_keeps_entries_and_free_list() {
        let mut map = ConcurrentMultiHashMap::with_capacity(4);
        for i in 0..4u32 {
            map.add(i % 2, i);
        }
        map.remove(0);
        map.set_capacity(64).unwrap();
        let mut ones = map.values(1);
        ones.sort_unstable();
        assert_eq!(ones, vec![1, 3]);
        map.add(0, 42);
        assert_eq!(map.values(0), vec![42]);
    }

    #[test]
    fn test_concurrent_insert() {
        let mut map = ConcurrentHashMap::with_capacity(4096);
        {
            let writer = map.concurrent();
            std::thread::scope(|s| {
                for t in 0..4u32 {
                    s.spawn(move || {
                        for i in 0..1000u32 {
                            assert!(writer.try_add(t * 1000 + i, i));
                        }
                    });
                }
            });
        }
        assert_eq!(map.len(), 4000);
        assert_eq!(map.try_get_value(2500), Some(500));
    }

    #[test]
    fn test_concurrent_duplicate_single_winner() {
        let mut map = ConcurrentHashMap::with_capacity(64);
        let wins = AtomicUsize::new(0);
        {
            let writer = map.concurrent();
            std::thread::scope(|s| {
                for t in 0..8u32 {
                    let wins = &wins;
                    s.spawn(move || {
                        if writer.try_add(42u32, t) {
                            wins.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                }
            });
        }
        assert_eq!(wins.load(Ordering::Relaxed), 1);
        assert_eq!(map.len(), 1);
        // Loser slots come back after the writer is gone
        for i in 0..63u32 {
            assert!(map.try_add(i + 100, i));
        }
        assert_eq!(map.capacity(), 64);
    }

    #[test]
    #[should_panic(expected = "hash map is full")]
    fn test_concurrent_overflow_panics() {
        let mut map = ConcurrentHashMap::with_capacity(2);
        let writer = map.concurrent();
        for i in 0..3u32 {
            writer.try_add(i, i);
        }
    }
}
