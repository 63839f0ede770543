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

//! Deduplicated, reference-counted storage for shared component values
//!
//! Chunks store a `u32` index per shared type. Index 0 always means the
//! type's `Default` value and carries no reference count.

use std::any::Any;
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHasher};
use smallvec::SmallVec;

use crate::component::{SharedComponent, TypeIndex, TypeRegistry};
use crate::error::{EcsError, Result};

type BoxedValue = Box<dyn Any + Send + Sync>;

struct SharedEntry {
    type_index: TypeIndex,
    hash: u64,
    refcount: usize,
    value: BoxedValue,
    clone_fn: fn(&dyn Any) -> BoxedValue,
    eq_fn: fn(&dyn Any, &dyn Any) -> bool,
}

fn clone_value<S: SharedComponent>(value: &dyn Any) -> BoxedValue {
    match value.downcast_ref::<S>() {
        Some(value) => Box::new(value.clone()),
        None => unreachable!("shared entry holds a different type"),
    }
}

fn eq_value<S: SharedComponent>(a: &dyn Any, b: &dyn Any) -> bool {
    matches!((a.downcast_ref::<S>(), b.downcast_ref::<S>()), (Some(a), Some(b)) if a == b)
}

fn hash_value<S: SharedComponent>(value: &S) -> u64 {
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

/// A shared value held outside the store, looked up by equality
///
/// Unlike a store index it cannot go stale: the index is resolved on each
/// lookup, so a value released and re-added, or added for the first time,
/// is found again.
#[derive(Clone)]
pub struct SharedValueKey {
    type_index: TypeIndex,
    hash: u64,
    is_default: bool,
    value: Arc<dyn Any + Send + Sync>,
    eq_fn: fn(&dyn Any, &dyn Any) -> bool,
}

impl SharedValueKey {
    pub fn new<S: SharedComponent>(value: S) -> Self {
        Self {
            type_index: TypeRegistry::shared_type_index::<S>(),
            hash: hash_value(&value),
            is_default: value == S::default(),
            value: Arc::new(value),
            eq_fn: eq_value::<S>,
        }
    }

    pub fn type_index(&self) -> TypeIndex {
        self.type_index
    }

    pub fn value<S: SharedComponent>(&self) -> Option<&S> {
        self.value.downcast_ref::<S>()
    }
}

impl fmt::Debug for SharedValueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedValueKey")
            .field("type", &TypeRegistry::name(self.type_index))
            .field("hash", &self.hash)
            .finish()
    }
}

impl PartialEq for SharedValueKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_index == other.type_index
            && self.hash == other.hash
            && (self.eq_fn)(self.value.as_ref(), other.value.as_ref())
    }
}

impl Eq for SharedValueKey {}

/// Store of shared component values
pub struct SharedComponentStore {
    entries: Vec<Option<SharedEntry>>,
    free: Vec<u32>,
    lookup: FxHashMap<(TypeIndex, u64), SmallVec<[u32; 2]>>,
}

impl Default for SharedComponentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedComponentStore {
    pub fn new() -> Self {
        Self {
            // Slot 0 is the per-type default value
            entries: vec![None],
            free: Vec::new(),
            lookup: FxHashMap::default(),
        }
    }

    /// Number of distinct stored values
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find_erased(
        &self,
        type_index: TypeIndex,
        hash: u64,
        value: &dyn Any,
        eq: fn(&dyn Any, &dyn Any) -> bool,
    ) -> Option<u32> {
        self.lookup.get(&(type_index, hash))?.iter().copied().find(|&index| {
            self.entries[index as usize]
                .as_ref()
                .is_some_and(|entry| eq(entry.value.as_ref(), value))
        })
    }

    /// Index of `value` if stored, 0 for the default value
    pub fn find_index<S: SharedComponent>(&self, value: &S) -> Option<u32> {
        if *value == S::default() {
            return Some(0);
        }
        let type_index = TypeRegistry::shared_type_index::<S>();
        self.find_erased(type_index, hash_value(value), value, eq_value::<S>)
    }

    /// Current index of `key`'s value; `None` when no chunk uses it
    pub fn resolve(&self, key: &SharedValueKey) -> Option<u32> {
        if key.is_default {
            return Some(0);
        }
        self.find_erased(key.type_index, key.hash, key.value.as_ref(), key.eq_fn)
    }

    fn insert_entry(&mut self, entry: SharedEntry) -> u32 {
        let key = (entry.type_index, entry.hash);
        let index = match self.free.pop() {
            Some(index) => {
                self.entries[index as usize] = Some(entry);
                index
            }
            None => {
                self.entries.push(Some(entry));
                (self.entries.len() - 1) as u32
            }
        };
        self.lookup.entry(key).or_default().push(index);
        index
    }

    /// Index for `value` holding one new reference, inserting it if needed
    pub fn insert_with_ref<S: SharedComponent>(&mut self, value: S) -> u32 {
        if let Some(index) = self.find_index(&value) {
            self.add_ref(index);
            return index;
        }
        let hash = hash_value(&value);
        self.insert_entry(SharedEntry {
            type_index: TypeRegistry::shared_type_index::<S>(),
            hash,
            refcount: 1,
            value: Box::new(value),
            clone_fn: clone_value::<S>,
            eq_fn: eq_value::<S>,
        })
    }

    /// Copy value `index` of `other` into this store, holding one new reference
    pub fn import_with_ref(&mut self, other: &SharedComponentStore, index: u32) -> u32 {
        if index == 0 {
            return 0;
        }
        let Some(source) = other.entries.get(index as usize).and_then(Option::as_ref) else {
            panic!("shared value index {index} is not live in the source store");
        };
        if let Some(existing) =
            self.find_erased(source.type_index, source.hash, source.value.as_ref(), source.eq_fn)
        {
            self.add_ref(existing);
            return existing;
        }
        self.insert_entry(SharedEntry {
            type_index: source.type_index,
            hash: source.hash,
            refcount: 1,
            value: (source.clone_fn)(source.value.as_ref()),
            clone_fn: source.clone_fn,
            eq_fn: source.eq_fn,
        })
    }

    pub fn add_ref(&mut self, index: u32) {
        if index == 0 {
            return;
        }
        match self.entries.get_mut(index as usize).and_then(Option::as_mut) {
            Some(entry) => entry.refcount += 1,
            None => panic!("add_ref on dead shared value {index}"),
        }
    }

    /// Drop one reference; the value is removed when none remain
    pub fn release(&mut self, index: u32) {
        if index == 0 {
            return;
        }
        let slot = &mut self.entries[index as usize];
        let Some(entry) = slot.as_mut() else {
            panic!("release on dead shared value {index}");
        };
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return;
        }
        let key = (entry.type_index, entry.hash);
        *slot = None;
        if let Some(bucket) = self.lookup.get_mut(&key) {
            bucket.retain(|i| *i != index);
            if bucket.is_empty() {
                self.lookup.remove(&key);
            }
        }
        self.free.push(index);
    }

    pub fn refcount(&self, index: u32) -> usize {
        self.entries
            .get(index as usize)
            .and_then(Option::as_ref)
            .map_or(0, |entry| entry.refcount)
    }

    /// Clone of the value at `index`
    pub fn get<S: SharedComponent>(&self, index: u32) -> Result<S> {
        if index == 0 {
            return Ok(S::default());
        }
        self.entries
            .get(index as usize)
            .and_then(Option::as_ref)
            .and_then(|entry| entry.value.downcast_ref::<S>())
            .cloned()
            .ok_or(EcsError::InvalidComponentType(std::any::type_name::<S>()))
    }

    /// Borrow the value at `index`; `None` for the default slot
    pub fn get_ref<S: SharedComponent>(&self, index: u32) -> Option<&S> {
        self.entries
            .get(index as usize)?
            .as_ref()?
            .value
            .downcast_ref::<S>()
    }
}
