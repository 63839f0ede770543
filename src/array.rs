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

//! Indexable views over a group's chunks
//!
//! Every view captures a [`SafetyToken`] and a borrow on its component type.
//! Accessing a view after the store invalidated its arrays fails with
//! [`EcsError::SafetyViolation`]; creating a view that would alias a live
//! writable view fails the same way.

use std::marker::PhantomData;

use crate::archetype::ArchetypeManager;
use crate::component::{Component, SharedComponent, TypeIndex, TypeRegistry};
use crate::entity::Entity;
use crate::entity_manager::EntityManager;
use crate::error::{EcsError, Result};
use crate::group::ComponentChunkIterator;
use crate::hash_map::ConcurrentHashMap;
use crate::safety::{BorrowGuard, SafetyToken};

/// Column base pointer for each slice of a chunk iterator
struct ColumnIndex<T> {
    iterator: ComponentChunkIterator,
    bases: Vec<*mut T>,
}

impl<T> ColumnIndex<T> {
    fn new(
        archetypes: &ArchetypeManager,
        iterator: ComponentChunkIterator,
        type_index: TypeIndex,
    ) -> Result<Self> {
        let bases = iterator
            .slices()
            .iter()
            .map(|slice| {
                let chunk = archetypes.chunk(slice.chunk);
                archetypes
                    .archetype(chunk.archetype())
                    .column(type_index)
                    .map(|column| chunk.column_ptr(column.offset) as *mut T)
                    .ok_or(EcsError::ComponentNotFound(TypeRegistry::name(type_index)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { iterator, bases })
    }

    fn len(&self) -> usize {
        self.iterator.len()
    }

    fn ptr(&self, index: usize) -> Result<*mut T> {
        let (slice, row) = self.iterator.locate(index).ok_or(EcsError::IndexOutOfRange {
            index,
            length: self.iterator.len(),
        })?;
        // SAFETY: `row` is below the slice's count, which fits the chunk
        Ok(unsafe { self.bases[slice].add(row) })
    }

    fn chunk_parts(&self) -> impl Iterator<Item = (*mut T, usize)> + '_ {
        self.bases
            .iter()
            .zip(self.iterator.slices())
            .map(|(base, slice)| (*base, slice.count))
    }
}

/// Read-only component values of a group, in group order
pub struct ComponentDataArray<'a, T: Component> {
    manager: &'a EntityManager,
    token: SafetyToken,
    column: ColumnIndex<T>,
    _guard: BorrowGuard,
}

// SAFETY: the raw pointers are only read, and T is Send + Sync
unsafe impl<T: Component> Send for ComponentDataArray<'_, T> {}
unsafe impl<T: Component> Sync for ComponentDataArray<'_, T> {}

impl<'a, T: Component> ComponentDataArray<'a, T> {
    pub(crate) fn new(
        manager: &'a EntityManager,
        iterator: ComponentChunkIterator,
        type_index: TypeIndex,
    ) -> Result<Self> {
        manager.tracker().check_readable(type_index)?;
        let guard = manager.tracker().borrows().borrow_read(type_index)?;
        let column = ColumnIndex::new(manager.archetype_manager(), iterator, type_index)?;
        Ok(Self {
            manager,
            token: manager.tracker().safety().token(),
            column,
            _guard: guard,
        })
    }

    pub fn len(&self) -> usize {
        self.column.len()
    }

    pub fn is_empty(&self) -> bool {
        self.column.len() == 0
    }

    fn check(&self) -> Result<()> {
        self.token.check(self.manager.tracker().safety())
    }

    pub fn get(&self, index: usize) -> Result<T> {
        self.check()?;
        // SAFETY: in bounds, and no writable view of T is live
        Ok(unsafe { *self.column.ptr(index)? })
    }

    /// Per-chunk slices in group order
    pub fn chunks(&self) -> Result<Vec<&[T]>> {
        self.check()?;
        Ok(self
            .column
            .chunk_parts()
            // SAFETY: each part covers the chunk's live rows of T
            .map(|(base, count)| unsafe { std::slice::from_raw_parts(base as *const T, count) })
            .collect())
    }

    pub fn iter(&self) -> Result<impl Iterator<Item = &T> + '_> {
        Ok(self.chunks()?.into_iter().flatten())
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        Ok(self.iter()?.copied().collect())
    }
}

/// Writable component values of a group, in group order
pub struct ComponentDataArrayMut<'a, T: Component> {
    manager: &'a EntityManager,
    token: SafetyToken,
    column: ColumnIndex<T>,
    _guard: BorrowGuard,
}

// SAFETY: the write borrow makes this the only view of T; writes need &mut self
unsafe impl<T: Component> Send for ComponentDataArrayMut<'_, T> {}
unsafe impl<T: Component> Sync for ComponentDataArrayMut<'_, T> {}

impl<'a, T: Component> ComponentDataArrayMut<'a, T> {
    pub(crate) fn new(
        manager: &'a EntityManager,
        iterator: ComponentChunkIterator,
        type_index: TypeIndex,
    ) -> Result<Self> {
        manager.tracker().check_writable(type_index)?;
        let guard = manager.tracker().borrows().borrow_write(type_index)?;
        let column = ColumnIndex::new(manager.archetype_manager(), iterator, type_index)?;
        Ok(Self {
            manager,
            token: manager.tracker().safety().token(),
            column,
            _guard: guard,
        })
    }

    pub fn len(&self) -> usize {
        self.column.len()
    }

    pub fn is_empty(&self) -> bool {
        self.column.len() == 0
    }

    fn check(&self) -> Result<()> {
        self.token.check(self.manager.tracker().safety())
    }

    pub fn get(&self, index: usize) -> Result<T> {
        self.check()?;
        // SAFETY: in bounds; this view holds the only borrow of T
        Ok(unsafe { *self.column.ptr(index)? })
    }

    pub fn get_mut(&mut self, index: usize) -> Result<&mut T> {
        self.check()?;
        // SAFETY: in bounds; &mut self rules out a second live reference
        Ok(unsafe { &mut *self.column.ptr(index)? })
    }

    pub fn set(&mut self, index: usize, value: T) -> Result<()> {
        *self.get_mut(index)? = value;
        Ok(())
    }

    /// Per-chunk mutable slices in group order
    pub fn chunks_mut(&mut self) -> Result<Vec<&mut [T]>> {
        self.check()?;
        Ok(self
            .column
            .chunk_parts()
            // SAFETY: distinct chunks never overlap
            .map(|(base, count)| unsafe { std::slice::from_raw_parts_mut(base, count) })
            .collect())
    }

    pub fn for_each_mut<F: FnMut(&mut T)>(&mut self, mut f: F) -> Result<()> {
        for slice in self.chunks_mut()? {
            slice.iter_mut().for_each(&mut f);
        }
        Ok(())
    }
}

/// Entity handles of a group, in group order
pub struct EntityArray<'a> {
    manager: &'a EntityManager,
    token: SafetyToken,
    column: ColumnIndex<Entity>,
}

// SAFETY: entity columns only change under &mut EntityManager
unsafe impl Send for EntityArray<'_> {}
unsafe impl Sync for EntityArray<'_> {}

impl<'a> EntityArray<'a> {
    pub(crate) fn new(manager: &'a EntityManager, iterator: ComponentChunkIterator) -> Self {
        let archetypes = manager.archetype_manager();
        let bases = iterator
            .slices()
            .iter()
            .map(|slice| archetypes.chunk(slice.chunk).entities().as_ptr() as *mut Entity)
            .collect();
        Self {
            manager,
            token: manager.tracker().safety().token(),
            column: ColumnIndex { iterator, bases },
        }
    }

    pub fn len(&self) -> usize {
        self.column.len()
    }

    pub fn is_empty(&self) -> bool {
        self.column.len() == 0
    }

    pub fn get(&self, index: usize) -> Result<Entity> {
        self.token.check(self.manager.tracker().safety())?;
        // SAFETY: in bounds of a live entity column
        Ok(unsafe { *self.column.ptr(index)? })
    }

    pub fn to_vec(&self) -> Result<Vec<Entity>> {
        self.token.check(self.manager.tracker().safety())?;
        let mut entities = Vec::with_capacity(self.len());
        for (base, count) in self.column.chunk_parts() {
            // SAFETY: rows below count hold live handles
            entities.extend_from_slice(unsafe { std::slice::from_raw_parts(base, count) });
        }
        Ok(entities)
    }
}

/// Shared component value per group entity
pub struct SharedComponentDataArray<'a, S: SharedComponent> {
    manager: &'a EntityManager,
    token: SafetyToken,
    iterator: ComponentChunkIterator,
    value_indices: Vec<u32>,
    _marker: PhantomData<fn() -> S>,
}

impl<'a, S: SharedComponent> SharedComponentDataArray<'a, S> {
    pub(crate) fn new(
        manager: &'a EntityManager,
        iterator: ComponentChunkIterator,
        type_index: TypeIndex,
    ) -> Self {
        let archetypes = manager.archetype_manager();
        let value_indices = iterator
            .slices()
            .iter()
            .map(|slice| {
                let chunk = archetypes.chunk(slice.chunk);
                archetypes
                    .archetype(chunk.archetype())
                    .shared_position(type_index)
                    .map_or(0, |position| chunk.shared_values()[position])
            })
            .collect();
        Self {
            manager,
            token: manager.tracker().safety().token(),
            iterator,
            value_indices,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.iterator.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iterator.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<S> {
        self.token.check(self.manager.tracker().safety())?;
        let (slice, _) = self.iterator.locate(index).ok_or(EcsError::IndexOutOfRange {
            index,
            length: self.iterator.len(),
        })?;
        self.manager.shared_store().get(self.value_indices[slice])
    }
}

/// Random access to component `T` by entity handle
pub struct ComponentDataFromEntity<'a, T: Component> {
    manager: &'a EntityManager,
    token: SafetyToken,
    type_index: TypeIndex,
    _guard: BorrowGuard,
    _marker: PhantomData<T>,
}

impl<'a, T: Component> ComponentDataFromEntity<'a, T> {
    pub(crate) fn new(manager: &'a EntityManager) -> Result<Self> {
        let type_index = TypeRegistry::data_type::<T>()?;
        manager.tracker().check_readable(type_index)?;
        let guard = manager.tracker().borrows().borrow_read(type_index)?;
        Ok(Self {
            manager,
            token: manager.tracker().safety().token(),
            type_index,
            _guard: guard,
            _marker: PhantomData,
        })
    }

    /// Whether `entity` is live and has `T`
    pub fn exists(&self, entity: Entity) -> bool {
        locate_column(self.manager, entity, self.type_index).is_ok()
    }

    pub fn get(&self, entity: Entity) -> Result<T> {
        self.token.check(self.manager.tracker().safety())?;
        let ptr = locate_column(self.manager, entity, self.type_index)? as *const T;
        // SAFETY: points at the entity's live row of T
        Ok(unsafe { *ptr })
    }
}

/// Random read/write access to component `T` by entity handle
pub struct ComponentDataFromEntityMut<'a, T: Component> {
    manager: &'a EntityManager,
    token: SafetyToken,
    type_index: TypeIndex,
    _guard: BorrowGuard,
    _marker: PhantomData<T>,
}

impl<'a, T: Component> ComponentDataFromEntityMut<'a, T> {
    pub(crate) fn new(manager: &'a EntityManager) -> Result<Self> {
        let type_index = TypeRegistry::data_type::<T>()?;
        manager.tracker().check_writable(type_index)?;
        let guard = manager.tracker().borrows().borrow_write(type_index)?;
        Ok(Self {
            manager,
            token: manager.tracker().safety().token(),
            type_index,
            _guard: guard,
            _marker: PhantomData,
        })
    }

    pub fn exists(&self, entity: Entity) -> bool {
        locate_column(self.manager, entity, self.type_index).is_ok()
    }

    pub fn get(&self, entity: Entity) -> Result<T> {
        self.token.check(self.manager.tracker().safety())?;
        let ptr = locate_column(self.manager, entity, self.type_index)? as *const T;
        // SAFETY: points at the entity's live row of T
        Ok(unsafe { *ptr })
    }

    pub fn set(&mut self, entity: Entity, value: T) -> Result<()> {
        self.token.check(self.manager.tracker().safety())?;
        let ptr = locate_column(self.manager, entity, self.type_index)? as *mut T;
        // SAFETY: exclusive borrow on T, and &mut self
        unsafe { ptr.write(value) };
        Ok(())
    }
}

fn locate_column(manager: &EntityManager, entity: Entity, type_index: TypeIndex) -> Result<*mut u8> {
    let location = manager.directory().location(entity)?;
    let archetypes = manager.archetype_manager();
    let column = archetypes
        .archetype(location.archetype)
        .column(type_index)
        .ok_or(EcsError::ComponentNotFound(TypeRegistry::name(type_index)))?;
    let chunk = archetypes.chunk(location.chunk);
    Ok(chunk.column_ptr(column.offset + location.index_in_chunk * column.size))
}

/// Snapshot of entity to group index
///
/// Owned, so it survives structural changes, but it describes the group as
/// it was when built.
pub struct IndexFromEntity {
    map: ConcurrentHashMap<Entity, i32>,
}

impl IndexFromEntity {
    pub(crate) fn build(manager: &EntityManager, iterator: &ComponentChunkIterator) -> Self {
        let mut map = ConcurrentHashMap::with_capacity(iterator.len().max(1));
        let archetypes = manager.archetype_manager();
        let writer = map.concurrent();
        let fill = |slice: &crate::group::ChunkSlice| {
            for (row, entity) in archetypes.chunk(slice.chunk).entities().iter().enumerate() {
                writer.try_add(*entity, (slice.begin + row) as i32);
            }
        };

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            iterator.slices().par_iter().for_each(fill);
        }
        #[cfg(not(feature = "parallel"))]
        iterator.slices().iter().for_each(fill);

        Self { map }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Index of `entity` in the group's arrays at build time
    pub fn get(&self, entity: Entity) -> Option<usize> {
        self.map.try_get_value(entity).map(|i| i as usize)
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.map.contains_key(entity)
    }
}
