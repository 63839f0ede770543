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

//! Component groups: cached archetype matching and chunk iteration
//!
//! A group is identified by its sorted component type set. Matching
//! archetypes are found once at creation; archetypes created later are
//! pushed into every existing group, so a query never rescans.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use rustc_hash::FxHasher;
use smallvec::SmallVec;
#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::{Archetype, ArchetypeId, ArchetypeManager};
use crate::array::{
    ComponentDataArray, ComponentDataArrayMut, EntityArray, IndexFromEntity,
    SharedComponentDataArray,
};
use crate::chunk::{Chunk, ChunkId};
use crate::component::{
    AccessMode, Component, ComponentType, SharedComponent, TypeCategory, TypeIndex, TypeRegistry,
};
use crate::dependency::{ComponentAccess, JobHandle};
use crate::entity::Entity;
use crate::entity_manager::EntityManager;
use crate::error::{EcsError, Result};
use crate::hash_map::ConcurrentMultiHashMap;
use crate::shared::{SharedComponentStore, SharedValueKey};

/// Index of a group in its manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub usize);

/// An archetype matched by a group, with where each group type sits in it
#[derive(Debug, Clone)]
pub struct MatchingArchetype {
    pub archetype: ArchetypeId,
    /// Signature position per group type, `None` for subtractive types
    pub type_positions: SmallVec<[Option<usize>; 8]>,
}

/// Shared state of all handles to one type set
pub struct GroupData {
    types: SmallVec<[ComponentType; 8]>,
    access: ComponentAccess,
    matches: Vec<MatchingArchetype>,
}

impl GroupData {
    fn new(types: SmallVec<[ComponentType; 8]>) -> Self {
        Self {
            access: ComponentAccess::from_types(&types),
            types,
            matches: Vec::new(),
        }
    }

    pub fn types(&self) -> &[ComponentType] {
        &self.types
    }

    pub fn access(&self) -> &ComponentAccess {
        &self.access
    }

    /// Matching archetypes in registration order
    pub fn matching_archetypes(&self) -> &[MatchingArchetype] {
        &self.matches
    }

    pub fn matches(&self, archetype: &Archetype) -> bool {
        self.types.iter().all(|ty| {
            let present = archetype.has_type(ty.type_index);
            if ty.is_subtractive() {
                !present
            } else {
                present
            }
        })
    }

    fn add_archetype_if_matching(&mut self, archetype: &Archetype) {
        if !self.matches(archetype) {
            return;
        }
        let type_positions = self
            .types
            .iter()
            .map(|ty| {
                if ty.is_subtractive() {
                    None
                } else {
                    archetype.type_position(ty.type_index)
                }
            })
            .collect();
        self.matches.push(MatchingArchetype {
            archetype: archetype.id(),
            type_positions,
        });
    }

    /// Position of `type_index` in the group's type list, ignoring subtractive entries
    pub fn index_of(&self, type_index: TypeIndex) -> Option<usize> {
        self.types
            .iter()
            .position(|ty| ty.type_index == type_index && !ty.is_subtractive())
    }
}

fn normalize(types: &[ComponentType]) -> SmallVec<[ComponentType; 8]> {
    let mut sorted: SmallVec<[ComponentType; 8]> = types.iter().copied().collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
}

fn types_hash(types: &[ComponentType]) -> u64 {
    let mut hasher = FxHasher::default();
    types.hash(&mut hasher);
    hasher.finish()
}

/// Cache of groups keyed by type set
pub struct GroupManager {
    groups: Vec<GroupData>,
    lookup: ConcurrentMultiHashMap<u64, GroupId>,
}

impl Default for GroupManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupManager {
    pub fn new() -> Self {
        Self {
            groups: Vec::new(),
            lookup: ConcurrentMultiHashMap::with_capacity(32),
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group(&self, id: GroupId) -> &GroupData {
        &self.groups[id.0]
    }

    fn find(&self, types: &[ComponentType]) -> Option<GroupId> {
        let (mut candidate, mut it) = self.lookup.try_get_first_value(types_hash(types))?;
        loop {
            if self.groups[candidate.0].types.as_slice() == types {
                return Some(candidate);
            }
            candidate = self.lookup.try_get_next_value(&mut it)?;
        }
    }

    /// Cached group for `types`, matching it against every known archetype on creation
    pub fn get_or_create(
        &mut self,
        types: &[ComponentType],
        archetypes: &ArchetypeManager,
    ) -> GroupId {
        let types = normalize(types);
        if let Some(id) = self.find(&types) {
            return id;
        }
        let id = GroupId(self.groups.len());
        let mut data = GroupData::new(types);
        for archetype in archetypes.archetypes() {
            data.add_archetype_if_matching(archetype);
        }
        tracing::debug!(
            group = id.0,
            types = data.types.len(),
            matches = data.matches.len(),
            "created component group"
        );
        self.lookup.add(types_hash(&data.types), id);
        self.groups.push(data);
        id
    }

    /// Offer a newly created archetype to every group
    pub fn on_archetype_added(&mut self, archetype: &Archetype) {
        for group in &mut self.groups {
            group.add_archetype_if_matching(archetype);
        }
    }
}

/// Equality filter on one or two shared component types
///
/// Holds the values themselves; their store indices are looked up each
/// time the group is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFilter {
    keys: SmallVec<[SharedValueKey; 2]>,
}

impl SharedFilter {
    pub fn keys(&self) -> &[SharedValueKey] {
        &self.keys
    }

    fn resolve(&self, shared: &SharedComponentStore) -> ResolvedFilter {
        let mut values = SmallVec::new();
        for key in &self.keys {
            match shared.resolve(key) {
                Some(index) => values.push((key.type_index(), index)),
                // No chunk holds the value
                None => return ResolvedFilter::Nothing,
            }
        }
        ResolvedFilter::Values(values)
    }
}

enum ResolvedFilter {
    All,
    Nothing,
    Values(SmallVec<[(TypeIndex, u32); 2]>),
}

impl ResolvedFilter {
    fn of(filter: Option<&SharedFilter>, shared: &SharedComponentStore) -> Self {
        filter.map_or(ResolvedFilter::All, |f| f.resolve(shared))
    }

    /// (shared position, value index) pairs a chunk of `archetype` must hold;
    /// `None` when no chunk of it can pass
    fn slots(&self, archetype: &Archetype) -> Option<SmallVec<[(usize, u32); 2]>> {
        match self {
            ResolvedFilter::All => Some(SmallVec::new()),
            ResolvedFilter::Nothing => None,
            ResolvedFilter::Values(values) => values
                .iter()
                .map(|&(type_index, value)| {
                    archetype.shared_position(type_index).map(|position| (position, value))
                })
                .collect(),
        }
    }
}

/// A run of rows of one chunk inside a group's flattened index space
#[derive(Debug, Clone, Copy)]
pub struct ChunkSlice {
    pub chunk: ChunkId,
    pub match_index: usize,
    pub begin: usize,
    pub count: usize,
}

/// Resolves flat group indices to (chunk, row)
///
/// Built from the matching archetypes' chunk lists; remembers the last slice
/// hit so sequential access only crosses a boundary once per chunk.
pub struct ComponentChunkIterator {
    slices: Vec<ChunkSlice>,
    length: usize,
    cursor: AtomicUsize,
}

impl ComponentChunkIterator {
    pub(crate) fn new(
        data: &GroupData,
        filter: Option<&SharedFilter>,
        archetypes: &ArchetypeManager,
        shared: &SharedComponentStore,
    ) -> Self {
        let resolved = ResolvedFilter::of(filter, shared);
        let mut slices = Vec::new();
        let mut length = 0;
        for (match_index, matching) in data.matches.iter().enumerate() {
            let archetype = archetypes.archetype(matching.archetype);
            if archetype.entity_count() == 0 {
                continue;
            }
            let Some(slots) = resolved.slots(archetype) else {
                continue;
            };
            for chunk_id in archetype.chunk_ids(archetypes.chunk_arena()) {
                let chunk = archetypes.chunk(chunk_id);
                if !chunk_passes(chunk, &slots) {
                    continue;
                }
                slices.push(ChunkSlice {
                    chunk: chunk_id,
                    match_index,
                    begin: length,
                    count: chunk.count(),
                });
                length += chunk.count();
            }
        }
        Self {
            slices,
            length,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn slices(&self) -> &[ChunkSlice] {
        &self.slices
    }

    /// Slice index and row for a flat index
    pub fn locate(&self, index: usize) -> Option<(usize, usize)> {
        if index >= self.length {
            return None;
        }
        let hint = self.cursor.load(Ordering::Relaxed);
        let contains = |i: usize| {
            self.slices
                .get(i)
                .is_some_and(|s| index >= s.begin && index < s.begin + s.count)
        };
        let slice = if contains(hint) {
            hint
        } else if contains(hint + 1) {
            hint + 1
        } else {
            self.slices.partition_point(|s| s.begin + s.count <= index)
        };
        self.cursor.store(slice, Ordering::Relaxed);
        Some((slice, index - self.slices[slice].begin))
    }
}

fn chunk_passes(chunk: &Chunk, slots: &[(usize, u32)]) -> bool {
    slots
        .iter()
        .all(|&(position, value)| chunk.shared_values()[position] == value)
}

/// Read-only view of one chunk handed to [`ComponentGroup::for_each_chunk`]
pub struct ChunkView<'a> {
    chunk: &'a Chunk,
    archetype: &'a Archetype,
    group: &'a GroupData,
    shared: &'a SharedComponentStore,
}

impl<'a> ChunkView<'a> {
    pub fn len(&self) -> usize {
        self.chunk.count()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.count() == 0
    }

    pub fn entities(&self) -> &'a [Entity] {
        self.chunk.entities()
    }

    /// Column of a group type in this chunk
    pub fn column<T: Component>(&self) -> Result<&'a [T]> {
        let type_index = TypeRegistry::type_index::<T>();
        if self.group.index_of(type_index).is_none() {
            return Err(EcsError::TypeNotInGroup(std::any::type_name::<T>()));
        }
        let column = self
            .archetype
            .column(type_index)
            .ok_or(EcsError::ComponentNotFound(std::any::type_name::<T>()))?;
        // SAFETY: the column holds `count` initialized values of T and the
        // caller holds read borrows on every group type
        Ok(unsafe {
            std::slice::from_raw_parts(
                self.chunk.column_ptr(column.offset) as *const T,
                self.chunk.count(),
            )
        })
    }

    /// Value of a shared group type for every entity of this chunk
    pub fn shared<S: SharedComponent>(&self) -> Result<S> {
        let type_index = TypeRegistry::shared_type_index::<S>();
        let position = self
            .archetype
            .shared_position(type_index)
            .ok_or(EcsError::ComponentNotFound(std::any::type_name::<S>()))?;
        self.shared.get(self.chunk.shared_values()[position])
    }
}

/// Handle to a cached group, optionally narrowed by a shared value filter
///
/// Cheap to clone and independent of the manager's borrow; store it and pass
/// the manager in each time the group is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentGroup {
    id: GroupId,
    filter: Option<SharedFilter>,
}

impl ComponentGroup {
    pub(crate) fn new(id: GroupId) -> Self {
        Self { id, filter: None }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn filter(&self) -> Option<&SharedFilter> {
        self.filter.as_ref()
    }

    fn data<'a>(&self, manager: &'a EntityManager) -> &'a GroupData {
        manager.group_manager().group(self.id)
    }

    pub fn types<'a>(&self, manager: &'a EntityManager) -> &'a [ComponentType] {
        self.data(manager).types()
    }

    fn filter_key<S: SharedComponent>(
        &self,
        manager: &EntityManager,
        value: &S,
    ) -> Result<SharedValueKey> {
        let type_index = TypeRegistry::shared_type::<S>()?;
        if self.data(manager).index_of(type_index).is_none() {
            return Err(EcsError::TypeNotInGroup(std::any::type_name::<S>()));
        }
        Ok(SharedValueKey::new(value.clone()))
    }

    /// Same group restricted to chunks whose `S` equals `value`
    pub fn with_filter<S: SharedComponent>(
        &self,
        manager: &EntityManager,
        value: &S,
    ) -> Result<ComponentGroup> {
        let key = self.filter_key(manager, value)?;
        Ok(ComponentGroup {
            id: self.id,
            filter: Some(SharedFilter {
                keys: smallvec::smallvec![key],
            }),
        })
    }

    /// Same group restricted to chunks whose `S1` equals `first` and `S2` equals `second`
    pub fn with_filter_pair<S1: SharedComponent, S2: SharedComponent>(
        &self,
        manager: &EntityManager,
        first: &S1,
        second: &S2,
    ) -> Result<ComponentGroup> {
        let first = self.filter_key(manager, first)?;
        let second = self.filter_key(manager, second)?;
        if first.type_index() == second.type_index() {
            return Err(EcsError::InvalidOperation(format!(
                "both filter values are {}",
                std::any::type_name::<S1>()
            )));
        }
        Ok(ComponentGroup {
            id: self.id,
            filter: Some(SharedFilter {
                keys: smallvec::smallvec![first, second],
            }),
        })
    }

    /// Drop the shared value filter
    pub fn reset_filter(&self) -> ComponentGroup {
        ComponentGroup {
            id: self.id,
            filter: None,
        }
    }

    /// Flat index resolver over the current matching chunks
    pub fn chunk_iterator(&self, manager: &EntityManager) -> ComponentChunkIterator {
        ComponentChunkIterator::new(
            self.data(manager),
            self.filter.as_ref(),
            manager.archetype_manager(),
            manager.shared_store(),
        )
    }

    /// Number of entities the group currently yields
    pub fn calculate_length(&self, manager: &EntityManager) -> usize {
        #[cfg(feature = "profiling")]
        let span = info_span!("component_group.calculate_length", group = self.id.0);
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let archetypes = manager.archetype_manager();
        let data = self.data(manager);
        match self.filter {
            None => data
                .matches
                .iter()
                .map(|m| archetypes.archetype(m.archetype).entity_count())
                .sum(),
            Some(_) => self.chunk_iterator(manager).len(),
        }
    }

    /// True when no matching chunk holds a live entity
    pub fn is_empty(&self, manager: &EntityManager) -> bool {
        let archetypes = manager.archetype_manager();
        let data = self.data(manager);
        let resolved = ResolvedFilter::of(self.filter.as_ref(), manager.shared_store());
        data.matches.iter().all(|m| {
            let archetype = archetypes.archetype(m.archetype);
            match resolved.slots(archetype) {
                None => true,
                Some(slots) if slots.is_empty() => archetype.entity_count() == 0,
                Some(slots) => archetype
                    .chunk_ids(archetypes.chunk_arena())
                    .all(|id| !chunk_passes(archetypes.chunk(id), &slots)),
            }
        })
    }

    /// Entity handles in group order
    pub fn entity_array<'a>(&self, manager: &'a EntityManager) -> EntityArray<'a> {
        EntityArray::new(manager, self.chunk_iterator(manager))
    }

    /// Read-only view of component `T`
    pub fn component_data_array<'a, T: Component>(
        &self,
        manager: &'a EntityManager,
    ) -> Result<ComponentDataArray<'a, T>> {
        let type_index = self.require_data_type::<T>(manager)?;
        ComponentDataArray::new(manager, self.chunk_iterator(manager), type_index)
    }

    /// Writable view of component `T`; `T` must be read-write in this group
    pub fn component_data_array_mut<'a, T: Component>(
        &self,
        manager: &'a EntityManager,
    ) -> Result<ComponentDataArrayMut<'a, T>> {
        let type_index = self.require_data_type::<T>(manager)?;
        let data = self.data(manager);
        if !data.access.writes.contains(&type_index) {
            return Err(EcsError::InvalidOperation(format!(
                "{} is read-only in this group",
                std::any::type_name::<T>()
            )));
        }
        ComponentDataArrayMut::new(manager, self.chunk_iterator(manager), type_index)
    }

    /// Per-entity view of a shared component
    pub fn shared_component_data_array<'a, S: SharedComponent>(
        &self,
        manager: &'a EntityManager,
    ) -> Result<SharedComponentDataArray<'a, S>> {
        let type_index = TypeRegistry::shared_type::<S>()?;
        if self.data(manager).index_of(type_index).is_none() {
            return Err(EcsError::TypeNotInGroup(std::any::type_name::<S>()));
        }
        Ok(SharedComponentDataArray::new(
            manager,
            self.chunk_iterator(manager),
            type_index,
        ))
    }

    /// Snapshot map from entity to its index in this group's arrays
    pub fn index_from_entity(&self, manager: &EntityManager) -> IndexFromEntity {
        IndexFromEntity::build(manager, &self.chunk_iterator(manager))
    }

    fn require_data_type<T: Component>(&self, manager: &EntityManager) -> Result<TypeIndex> {
        let type_index = TypeRegistry::data_type::<T>()?;
        if self.data(manager).index_of(type_index).is_none() {
            return Err(EcsError::TypeNotInGroup(std::any::type_name::<T>()));
        }
        Ok(type_index)
    }

    /// Visit each matching chunk with read access to the group's data types
    pub fn for_each_chunk<F>(&self, manager: &EntityManager, mut f: F) -> Result<()>
    where
        F: FnMut(ChunkView<'_>),
    {
        let data = self.data(manager);
        let mut guards = Vec::with_capacity(data.types.len());
        for ty in data.types.iter().filter(|ty| ty.access != AccessMode::Subtractive) {
            if TypeRegistry::info(ty.type_index).category != TypeCategory::Shared {
                manager.tracker().check_readable(ty.type_index)?;
                guards.push(manager.tracker().borrows().borrow_read(ty.type_index)?);
            }
        }
        let archetypes = manager.archetype_manager();
        for slice in self.chunk_iterator(manager).slices() {
            let archetype = archetypes.archetype(data.matches[slice.match_index].archetype);
            f(ChunkView {
                chunk: archetypes.chunk(slice.chunk),
                archetype,
                group: data,
                shared: manager.shared_store(),
            });
        }
        drop(guards);
        Ok(())
    }

    /// Process matching chunks in parallel with a mutable slice of `T` per chunk
    #[cfg(feature = "parallel")]
    pub fn par_for_each_chunk_mut<T, F>(&self, manager: &EntityManager, f: F) -> Result<()>
    where
        T: Component,
        F: Fn(&[Entity], &mut [T]) + Send + Sync,
    {
        use rayon::prelude::*;

        #[cfg(feature = "profiling")]
        let span = info_span!("component_group.par_for_each_chunk_mut", group = self.id.0);
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let type_index = self.require_data_type::<T>(manager)?;
        if !self.data(manager).access.writes.contains(&type_index) {
            return Err(EcsError::InvalidOperation(format!(
                "{} is read-only in this group",
                std::any::type_name::<T>()
            )));
        }
        manager.tracker().check_writable(type_index)?;
        let _guard = manager.tracker().borrows().borrow_write(type_index)?;
        let archetypes = manager.archetype_manager();
        let iterator = self.chunk_iterator(manager);

        iterator.slices().par_iter().try_for_each(|slice| -> Result<()> {
            let chunk = archetypes.chunk(slice.chunk);
            let column = archetypes
                .archetype(chunk.archetype())
                .column(type_index)
                .ok_or(EcsError::ComponentNotFound(std::any::type_name::<T>()))?;
            // SAFETY: every chunk appears in exactly one slice, so the mutable
            // slices are disjoint; the write borrow on T excludes other views.
            let values = unsafe {
                std::slice::from_raw_parts_mut(
                    chunk.column_ptr(column.offset) as *mut T,
                    chunk.count(),
                )
            };
            f(chunk.entities(), values);
            Ok(())
        })
    }

    /// This group's read/write type sets
    pub fn access(&self, manager: &EntityManager) -> ComponentAccess {
        self.data(manager).access.clone()
    }

    /// Handle to wait on before touching this group's data
    pub fn get_dependency(&self, manager: &EntityManager) -> JobHandle {
        manager.tracker().get_dependency_for(&self.data(manager).access)
    }

    /// Register a job that reads/writes this group's data
    pub fn add_dependency(&self, manager: &EntityManager, handle: JobHandle) -> JobHandle {
        manager
            .tracker()
            .add_dependency_for(&self.data(manager).access, handle)
    }

    /// Block until all conflicting jobs finished
    pub fn complete_dependency(&self, manager: &EntityManager) {
        self.get_dependency(manager).complete();
    }
}
