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

//! Entity manager: the store's public face
//!
//! Owns the entity directory, archetypes and their chunks, cached groups,
//! shared values and the dependency tracker. Every structural change first
//! completes all registered jobs and invalidates outstanding views, then
//! commits fully or fails before touching anything.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;
#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::{
    compute_destination_with, compute_destination_without, ArchetypeId, ArchetypeManager,
    ArchetypeSignature,
};
use crate::array::{ComponentDataFromEntity, ComponentDataFromEntityMut};
use crate::chunk::{self, Chunk, ChunkId, ColumnLayout};
use crate::component::{
    AccessMode, Component, ComponentType, SharedComponent, TypeCategory, TypeIndex, TypeRegistry,
};
use crate::config::StoreConfig;
use crate::dependency::DependencyTracker;
use crate::entity::{Entity, EntityDirectory, EntityLocation};
use crate::error::{EcsError, Result};
use crate::group::{ComponentGroup, GroupManager};
use crate::shared::SharedComponentStore;

type SharedValues = SmallVec<[u32; 4]>;

/// Archetype-based entity/component store
pub struct EntityManager {
    directory: EntityDirectory,
    archetypes: ArchetypeManager,
    groups: GroupManager,
    shared: SharedComponentStore,
    tracker: DependencyTracker,
    config: StoreConfig,
}

impl Default for EntityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityManager {
    /// Create a store with the default configuration
    pub fn new() -> Self {
        Self::build(StoreConfig::default())
    }

    /// Create a store with validated custom knobs
    pub fn with_config(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: StoreConfig) -> Self {
        Self {
            directory: EntityDirectory::with_capacity(config.initial_entity_capacity),
            archetypes: ArchetypeManager::new(config.chunk_bytes, config.max_pooled_chunks),
            groups: GroupManager::new(),
            shared: SharedComponentStore::new(),
            tracker: DependencyTracker::new(),
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Job fences and view safety state
    pub fn tracker(&self) -> &DependencyTracker {
        &self.tracker
    }

    /// Archetypes and chunks, for inspection
    pub fn archetype_manager(&self) -> &ArchetypeManager {
        &self.archetypes
    }

    pub(crate) fn group_manager(&self) -> &GroupManager {
        &self.groups
    }

    pub(crate) fn shared_store(&self) -> &SharedComponentStore {
        &self.shared
    }

    pub(crate) fn directory(&self) -> &EntityDirectory {
        &self.directory
    }

    /// Number of live entities
    pub fn entity_count(&self) -> usize {
        self.directory.len()
    }

    pub fn exists(&self, entity: Entity) -> bool {
        self.directory.exists(entity)
    }

    /// Directory slots currently allocated
    pub fn entity_capacity(&self) -> usize {
        self.directory.capacity()
    }

    /// Grow the directory ahead of a large batch; shrinking fails
    pub fn set_entity_capacity(&mut self, capacity: usize) -> Result<()> {
        self.directory.set_capacity(capacity)
    }

    /// Counter bumped whenever the chunks holding `T` change
    pub fn component_order_version<T: Component>(&self) -> u32 {
        self.archetypes
            .order_version(TypeRegistry::type_index::<T>())
    }

    /// Same as [`component_order_version`](Self::component_order_version) for a shared type
    pub fn shared_component_order_version<S: SharedComponent>(&self) -> u32 {
        self.archetypes
            .order_version(TypeRegistry::shared_type_index::<S>())
    }

    fn locate(&self, entity: Entity) -> Result<EntityLocation> {
        self.directory.location(entity).map_err(|err| {
            tracing::warn!(%entity, "stale or destroyed entity handle");
            err
        })
    }

    fn before_structural_change(&self) {
        self.tracker.complete_all_jobs_and_invalidate_arrays();
    }

    fn get_or_create_archetype(&mut self, types: &[TypeIndex]) -> Result<ArchetypeId> {
        let (id, created) = self.archetypes.get_or_create(types)?;
        if created {
            self.groups.on_archetype_added(self.archetypes.archetype(id));
        }
        Ok(id)
    }

    /// Archetype for a component type set; access modes are ignored
    pub fn create_archetype(&mut self, types: &[ComponentType]) -> Result<ArchetypeId> {
        if let Some(ty) = types.iter().find(|ty| ty.is_subtractive()) {
            return Err(EcsError::InvalidOperation(format!(
                "archetype cannot contain subtractive type {}",
                TypeRegistry::name(ty.type_index)
            )));
        }
        let indices: ArchetypeSignature = types.iter().map(|ty| ty.type_index).collect();
        self.get_or_create_archetype(&indices)
    }

    fn check_archetype(&self, archetype: ArchetypeId) -> Result<()> {
        if archetype.0 < self.archetypes.len() {
            Ok(())
        } else {
            Err(EcsError::InvalidOperation(format!(
                "unknown archetype {}",
                archetype.0
            )))
        }
    }

    /// Create one entity with zeroed components
    pub fn create_entity(&mut self, archetype: ArchetypeId) -> Result<Entity> {
        let mut entities = self.create_entities(archetype, 1)?;
        entities
            .pop()
            .ok_or_else(|| EcsError::InvalidOperation("no entity created".into()))
    }

    /// Create `count` entities with zeroed components, filling chunks in order
    pub fn create_entities(&mut self, archetype: ArchetypeId, count: usize) -> Result<Vec<Entity>> {
        #[cfg(feature = "profiling")]
        let span = info_span!("entity_manager.create_entities", archetype = archetype.0, count);
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        self.check_archetype(archetype)?;
        self.before_structural_change();
        let shared_values: SharedValues =
            SmallVec::from_elem(0, self.archetypes.archetype(archetype).shared_types().len());
        let entities = self.allocate_entities(
            archetype,
            &shared_values,
            count,
            |_, dst, columns, start, rows| {
                // SAFETY: the rows were just claimed in `dst`
                unsafe { chunk::zero_rows(dst, columns, start, rows) }
            },
        )?;
        tracing::trace!(archetype = archetype.0, count, "created entities");
        Ok(entities)
    }

    /// Create `count` copies of `source`, component bytes copied chunk-wise
    pub fn instantiate(&mut self, source: Entity, count: usize) -> Result<Vec<Entity>> {
        #[cfg(feature = "profiling")]
        let span = info_span!("entity_manager.instantiate", count);
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let location = self.locate(source)?;
        self.before_structural_change();
        let shared_values: SharedValues = self
            .archetypes
            .chunk(location.chunk)
            .shared_values()
            .iter()
            .copied()
            .collect();
        let entities = self.allocate_entities(
            location.archetype,
            &shared_values,
            count,
            |archetypes, dst, columns, start, rows| {
                let src = archetypes.chunk(location.chunk);
                // SAFETY: the source row is live and lies below the claimed
                // range when both chunks are the same
                unsafe {
                    chunk::replicate_row(src, location.index_in_chunk, dst, start, rows, columns)
                };
            },
        )?;
        tracing::trace!(%source, count, "instantiated entities");
        Ok(entities)
    }

    /// Claim `count` rows in chunks matching `shared_values`, register
    /// directory entries, then let `init` fill the component columns
    fn allocate_entities<F>(
        &mut self,
        archetype: ArchetypeId,
        shared_values: &[u32],
        count: usize,
        mut init: F,
    ) -> Result<Vec<Entity>>
    where
        F: FnMut(&ArchetypeManager, &Chunk, &[ColumnLayout], usize, usize),
    {
        let needed = self.directory.len() + count;
        if needed > self.directory.capacity() {
            self.directory
                .set_capacity(needed.next_power_of_two().min(i32::MAX as usize))?;
        }

        let mut entities = Vec::with_capacity(count);
        let mut remaining = count;
        while remaining > 0 {
            let chunk_id =
                self.archetypes
                    .get_chunk_with_empty_slots(archetype, shared_values, &mut self.shared);
            let (start, claimed) = self.archetypes.allocate_rows(chunk_id, remaining);
            let first = entities.len();
            for row in 0..claimed {
                let entity = self.directory.allocate();
                self.directory.set_location(
                    entity,
                    EntityLocation {
                        archetype,
                        chunk: chunk_id,
                        index_in_chunk: start + row,
                    },
                );
                entities.push(entity);
            }
            let dst = self.archetypes.chunk(chunk_id);
            let columns = self.archetypes.archetype(archetype).columns();
            // SAFETY: rows [start, start + claimed) were claimed above
            unsafe { chunk::write_entities(dst, start, &entities[first..]) };
            init(&self.archetypes, dst, columns, start, claimed);
            remaining -= claimed;
        }
        self.archetypes.bump_order_version(archetype);
        Ok(entities)
    }

    /// Destroy one entity
    pub fn destroy_entity(&mut self, entity: Entity) -> Result<()> {
        self.destroy_entities(&[entity])
    }

    /// Destroy a batch of entities
    ///
    /// Every handle is validated before anything is removed. Rows are
    /// removed per chunk from the highest run down, so the locations
    /// snapshotted up front stay valid.
    pub fn destroy_entities(&mut self, entities: &[Entity]) -> Result<()> {
        #[cfg(feature = "profiling")]
        let span = info_span!("entity_manager.destroy_entities", count = entities.len());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let mut seen = FxHashSet::default();
        let mut rows: Vec<(ChunkId, usize, ArchetypeId)> = Vec::with_capacity(entities.len());
        for &entity in entities {
            let location = self.locate(entity)?;
            if !seen.insert(entity) {
                return Err(EcsError::InvalidOperation(format!(
                    "{entity} appears twice in the destroy batch"
                )));
            }
            rows.push((location.chunk, location.index_in_chunk, location.archetype));
        }
        if rows.is_empty() {
            return Ok(());
        }
        self.before_structural_change();

        // Group by chunk, highest row first
        rows.sort_unstable_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        let mut touched: SmallVec<[ArchetypeId; 8]> = SmallVec::new();
        let mut i = 0;
        while i < rows.len() {
            let (chunk_id, high, archetype) = rows[i];
            let mut low = high;
            let mut j = i + 1;
            while j < rows.len() && rows[j].0 == chunk_id && rows[j].1 + 1 == low {
                low = rows[j].1;
                j += 1;
            }
            self.remove_run(chunk_id, low, high - low + 1);
            if !touched.contains(&archetype) {
                touched.push(archetype);
            }
            i = j;
        }

        for &entity in entities {
            self.directory.free(entity)?;
        }
        for archetype in touched {
            self.archetypes.bump_order_version(archetype);
        }
        tracing::trace!(count = entities.len(), "destroyed entities");
        Ok(())
    }

    /// Remove rows `[low, low + len)` and fill the hole from the chunk tail
    fn remove_run(&mut self, chunk_id: ChunkId, low: usize, len: usize) {
        let chunk = self.archetypes.chunk(chunk_id);
        let count = chunk.count();
        let after = count - (low + len);
        let moved = after.min(len);
        if moved > 0 {
            let columns = self
                .archetypes
                .archetype(chunk.archetype())
                .columns();
            // SAFETY: both ranges are live rows of this chunk
            unsafe { chunk::move_rows_within(chunk, count - moved, low, moved, columns) };
            for row in low..low + moved {
                let entity = chunk.entity_at(row);
                self.directory.set_index_in_chunk(entity, row);
            }
        }
        self.archetypes
            .set_chunk_count(chunk_id, count - len, &mut self.shared);
    }

    /// Move an entity's row into a chunk of `dst` holding `shared_values`
    ///
    /// Columns present in both archetypes are copied, new ones zeroed. The
    /// destination row is claimed before the source row is released, so a
    /// shared value referenced by both chunks stays alive.
    fn migrate(
        &mut self,
        entity: Entity,
        from: EntityLocation,
        dst: ArchetypeId,
        shared_values: &[u32],
    ) -> EntityLocation {
        let chunk_id = self
            .archetypes
            .get_chunk_with_empty_slots(dst, shared_values, &mut self.shared);
        let (row, _) = self.archetypes.allocate_rows(chunk_id, 1);
        {
            let src = self.archetypes.chunk(from.chunk);
            let src_columns = self.archetypes.archetype(from.archetype).columns();
            let dst_chunk = self.archetypes.chunk(chunk_id);
            let dst_columns = self.archetypes.archetype(dst).columns();
            // SAFETY: distinct chunks, both rows live
            unsafe {
                chunk::convert_row(
                    src,
                    src_columns,
                    from.index_in_chunk,
                    dst_chunk,
                    dst_columns,
                    row,
                )
            };
        }
        let to = EntityLocation {
            archetype: dst,
            chunk: chunk_id,
            index_in_chunk: row,
        };
        self.directory.set_location(entity, to);
        if let Some(moved) =
            self.archetypes
                .remove_row_swap_back(from.chunk, from.index_in_chunk, &mut self.shared)
        {
            self.directory.set_index_in_chunk(moved, from.index_in_chunk);
        }
        self.archetypes.bump_order_version(from.archetype);
        self.archetypes.bump_order_version(dst);
        tracing::trace!(%entity, from = from.archetype.0, to = dst.0, "moved entity");
        to
    }

    fn shared_values_of(&self, location: EntityLocation) -> SharedValues {
        self.archetypes
            .chunk(location.chunk)
            .shared_values()
            .iter()
            .copied()
            .collect()
    }

    /// Shared values for `dst`, taken from `location`'s chunk with `replace` applied
    fn map_shared_values(
        &self,
        location: EntityLocation,
        dst: ArchetypeId,
        replace: Option<(TypeIndex, u32)>,
    ) -> SharedValues {
        let src_archetype = self.archetypes.archetype(location.archetype);
        let src_values = self.archetypes.chunk(location.chunk).shared_values();
        self.archetypes
            .archetype(dst)
            .shared_types()
            .iter()
            .map(|t| match replace {
                Some((replaced, value)) if replaced == *t => value,
                _ => src_archetype
                    .shared_position(*t)
                    .map_or(0, |position| src_values[position]),
            })
            .collect()
    }

    /// Add component `T` with `value`, moving the entity to the wider archetype
    pub fn add_component<T: Component>(&mut self, entity: Entity, value: T) -> Result<()> {
        #[cfg(feature = "profiling")]
        let span = info_span!("entity_manager.add_component", component = std::any::type_name::<T>());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let type_index = TypeRegistry::data_type::<T>()?;
        let location = self.locate(entity)?;
        let signature =
            compute_destination_with(self.archetypes.archetype(location.archetype).types(), type_index)?;
        let dst = self.get_or_create_archetype(&signature)?;
        self.before_structural_change();
        let shared_values = self.shared_values_of(location);
        let to = self.migrate(entity, location, dst, &shared_values);
        self.write_value(to, type_index, value);
        Ok(())
    }

    /// Remove component `T`, moving the entity to the narrower archetype
    pub fn remove_component<T: Component>(&mut self, entity: Entity) -> Result<()> {
        #[cfg(feature = "profiling")]
        let span = info_span!("entity_manager.remove_component", component = std::any::type_name::<T>());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let type_index = TypeRegistry::data_type::<T>()?;
        self.remove_type(entity, type_index)
    }

    /// Remove shared component `S`
    pub fn remove_shared_component<S: SharedComponent>(&mut self, entity: Entity) -> Result<()> {
        let type_index = TypeRegistry::shared_type::<S>()?;
        self.remove_type(entity, type_index)
    }

    fn remove_type(&mut self, entity: Entity, type_index: TypeIndex) -> Result<()> {
        let location = self.locate(entity)?;
        let signature = compute_destination_without(
            self.archetypes.archetype(location.archetype).types(),
            type_index,
        )?;
        let dst = self.get_or_create_archetype(&signature)?;
        self.before_structural_change();
        let shared_values = self.map_shared_values(location, dst, None);
        self.migrate(entity, location, dst, &shared_values);
        Ok(())
    }

    /// Add shared component `S`; the entity moves to a chunk keyed by `value`
    pub fn add_shared_component<S: SharedComponent>(&mut self, entity: Entity, value: S) -> Result<()> {
        let type_index = TypeRegistry::shared_type::<S>()?;
        let location = self.locate(entity)?;
        let signature =
            compute_destination_with(self.archetypes.archetype(location.archetype).types(), type_index)?;
        let dst = self.get_or_create_archetype(&signature)?;
        self.before_structural_change();
        let value_index = self.shared.insert_with_ref(value);
        let shared_values = self.map_shared_values(location, dst, Some((type_index, value_index)));
        self.migrate(entity, location, dst, &shared_values);
        self.shared.release(value_index);
        Ok(())
    }

    /// Change the value of shared component `S`, relocating the entity when it differs
    pub fn set_shared_component<S: SharedComponent>(&mut self, entity: Entity, value: S) -> Result<()> {
        let type_index = TypeRegistry::shared_type::<S>()?;
        let location = self.locate(entity)?;
        let position = self
            .archetypes
            .archetype(location.archetype)
            .shared_position(type_index)
            .ok_or(EcsError::ComponentNotFound(std::any::type_name::<S>()))?;
        let value_index = self.shared.insert_with_ref(value);
        if self.archetypes.chunk(location.chunk).shared_values()[position] == value_index {
            self.shared.release(value_index);
            return Ok(());
        }
        self.before_structural_change();
        let shared_values =
            self.map_shared_values(location, location.archetype, Some((type_index, value_index)));
        self.migrate(entity, location, location.archetype, &shared_values);
        self.shared.release(value_index);
        Ok(())
    }

    /// Current value of shared component `S`
    pub fn get_shared_component<S: SharedComponent>(&self, entity: Entity) -> Result<S> {
        let type_index = TypeRegistry::shared_type::<S>()?;
        let location = self.locate(entity)?;
        let position = self
            .archetypes
            .archetype(location.archetype)
            .shared_position(type_index)
            .ok_or(EcsError::ComponentNotFound(std::any::type_name::<S>()))?;
        self.shared
            .get(self.archetypes.chunk(location.chunk).shared_values()[position])
    }

    pub fn has_shared_component<S: SharedComponent>(&self, entity: Entity) -> bool {
        let type_index = TypeRegistry::shared_type_index::<S>();
        self.directory
            .location(entity)
            .is_ok_and(|location| self.archetypes.archetype(location.archetype).has_type(type_index))
    }

    fn column_of(&self, location: EntityLocation, type_index: TypeIndex) -> Result<ColumnLayout> {
        self.archetypes
            .archetype(location.archetype)
            .column(type_index)
            .ok_or(EcsError::ComponentNotFound(TypeRegistry::name(type_index)))
    }

    fn write_value<T: Component>(&self, location: EntityLocation, type_index: TypeIndex, value: T) {
        let Some(column) = self.archetypes.archetype(location.archetype).column(type_index) else {
            panic!("destination archetype lacks {}", TypeRegistry::name(type_index));
        };
        if column.size == 0 {
            return;
        }
        let chunk = self.archetypes.chunk(location.chunk);
        // SAFETY: the row is live and the column holds values of T
        unsafe {
            (chunk.column_ptr(column.offset + location.index_in_chunk * column.size) as *mut T)
                .write(value)
        };
    }

    /// Read component `T`, waiting for any job writing it
    pub fn get_component<T: Component>(&self, entity: Entity) -> Result<T> {
        let type_index = TypeRegistry::data_type::<T>()?;
        let location = self.locate(entity)?;
        let column = self.column_of(location, type_index)?;
        self.tracker.complete_write_dependency(type_index);
        let _guard = self.tracker.borrows().borrow_read(type_index)?;
        if column.size == 0 {
            return Ok(<T as bytemuck::Zeroable>::zeroed());
        }
        let chunk = self.archetypes.chunk(location.chunk);
        // SAFETY: live row, column of T, and no writable view of T is live
        Ok(unsafe {
            *(chunk.column_ptr(column.offset + location.index_in_chunk * column.size) as *const T)
        })
    }

    /// Overwrite component `T`, waiting for every job touching it
    pub fn set_component<T: Component>(&mut self, entity: Entity, value: T) -> Result<()> {
        let type_index = TypeRegistry::data_type::<T>()?;
        let location = self.locate(entity)?;
        self.column_of(location, type_index)?;
        self.tracker.complete_read_and_write_dependency(type_index);
        self.write_value(location, type_index, value);
        Ok(())
    }

    /// Whether a live `entity` has `T`; false for stale handles
    pub fn has_component<T: Component>(&self, entity: Entity) -> bool {
        let type_index = TypeRegistry::type_index::<T>();
        self.directory
            .location(entity)
            .is_ok_and(|location| self.archetypes.archetype(location.archetype).has_type(type_index))
    }

    /// Cached group for a required/excluded type set
    pub fn create_component_group(&mut self, types: &[ComponentType]) -> Result<ComponentGroup> {
        for ty in types {
            let info = TypeRegistry::info(ty.type_index);
            if info.category == TypeCategory::Entity {
                return Err(EcsError::InvalidComponentType(info.name));
            }
            if info.category == TypeCategory::Shared && ty.access == AccessMode::ReadWrite {
                return Err(EcsError::InvalidOperation(format!(
                    "shared component {} cannot be written through a group",
                    info.name
                )));
            }
            let conflicting = types
                .iter()
                .any(|other| other.type_index == ty.type_index && other.is_subtractive() != ty.is_subtractive());
            if conflicting {
                return Err(EcsError::InvalidOperation(format!(
                    "{} is both required and excluded",
                    info.name
                )));
            }
        }
        let id = self.groups.get_or_create(types, &self.archetypes);
        Ok(ComponentGroup::new(id))
    }

    /// Random read access to `T` by entity
    pub fn component_data_from_entity<T: Component>(&self) -> Result<ComponentDataFromEntity<'_, T>> {
        ComponentDataFromEntity::new(self)
    }

    /// Random read/write access to `T` by entity
    pub fn component_data_from_entity_mut<T: Component>(
        &self,
    ) -> Result<ComponentDataFromEntityMut<'_, T>> {
        ComponentDataFromEntityMut::new(self)
    }

    /// Move every entity of `other` into this store
    ///
    /// Returns `(old, new)` handle pairs; `other` is left empty. Every
    /// destination archetype and the directory growth are validated first,
    /// so on error neither store has changed.
    pub fn move_entities_from(&mut self, other: &mut EntityManager) -> Result<Vec<(Entity, Entity)>> {
        #[cfg(feature = "profiling")]
        let span = info_span!("entity_manager.move_entities_from", count = other.entity_count());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let sources: Vec<(ArchetypeId, ArchetypeSignature)> = other
            .archetypes
            .archetypes()
            .iter()
            .filter(|a| a.entity_count() > 0)
            .map(|a| (a.id(), a.types().iter().copied().collect()))
            .collect();
        for (_, types) in &sources {
            self.archetypes.check_layout(types)?;
        }
        let needed = self.directory.len() + other.entity_count();
        if needed > self.directory.capacity() {
            self.directory
                .set_capacity(needed.next_power_of_two().min(i32::MAX as usize))?;
        }
        let mut pairs = Vec::with_capacity(sources.len());
        for (src_archetype, types) in sources {
            pairs.push((src_archetype, self.get_or_create_archetype(&types)?));
        }

        self.before_structural_change();
        other.before_structural_change();
        let mut remap = Vec::with_capacity(other.entity_count());
        for (src_archetype, dst_archetype) in pairs {
            let chunk_ids: Vec<ChunkId> = other
                .archetypes
                .archetype(src_archetype)
                .chunk_ids(other.archetypes.chunk_arena())
                .collect();
            for src_chunk in chunk_ids {
                self.move_chunk_from(other, src_archetype, src_chunk, dst_archetype, &mut remap);
            }
            self.archetypes.bump_order_version(dst_archetype);
            other.archetypes.bump_order_version(src_archetype);
        }
        tracing::debug!(moved = remap.len(), "moved entities between stores");
        Ok(remap)
    }

    /// Copy every row of `src_chunk` into chunks of `dst_archetype`, then empty it
    fn move_chunk_from(
        &mut self,
        other: &mut EntityManager,
        src_archetype: ArchetypeId,
        src_chunk: ChunkId,
        dst_archetype: ArchetypeId,
        remap: &mut Vec<(Entity, Entity)>,
    ) {
        let shared_values: SharedValues = other
            .archetypes
            .chunk(src_chunk)
            .shared_values()
            .iter()
            .map(|&index| self.shared.import_with_ref(&other.shared, index))
            .collect();
        let count = other.archetypes.chunk(src_chunk).count();
        let mut copied = 0;
        while copied < count {
            let dst_chunk = self.archetypes.get_chunk_with_empty_slots(
                dst_archetype,
                &shared_values,
                &mut self.shared,
            );
            let (start, claimed) = self.archetypes.allocate_rows(dst_chunk, count - copied);
            let src = other.archetypes.chunk(src_chunk);
            let src_columns = other.archetypes.archetype(src_archetype).columns();
            let dst = self.archetypes.chunk(dst_chunk);
            let dst_columns = self.archetypes.archetype(dst_archetype).columns();
            for offset in 0..claimed {
                let old = src.entity_at(copied + offset);
                let new = self.directory.allocate();
                // SAFETY: rows live in different stores' chunks
                unsafe {
                    chunk::convert_row(src, src_columns, copied + offset, dst, dst_columns, start + offset);
                    chunk::write_entities(dst, start + offset, &[new]);
                }
                self.directory.set_location(
                    new,
                    EntityLocation {
                        archetype: dst_archetype,
                        chunk: dst_chunk,
                        index_in_chunk: start + offset,
                    },
                );
                remap.push((old, new));
            }
            copied += claimed;
        }
        for &index in &shared_values {
            self.shared.release(index);
        }

        let moved: Vec<Entity> = other.archetypes.chunk(src_chunk).entities().to_vec();
        for entity in moved {
            if let Err(err) = other.directory.free(entity) {
                panic!("chunk row {entity} missing from its directory: {err}");
            }
        }
        other
            .archetypes
            .set_chunk_count(src_chunk, 0, &mut other.shared);
    }

    /// Cross-check the directory against chunk contents; panics on mismatch
    pub fn check_internal_consistency(&self) {
        self.archetypes.check_consistency();
        let mut live = 0;
        for (entity, location) in self.directory.iter() {
            let Some(chunk) = self.archetypes.chunk_arena().get(location.chunk) else {
                panic!("{entity} points at a released chunk");
            };
            assert_eq!(
                chunk.archetype(),
                location.archetype,
                "{entity} directory archetype disagrees with its chunk"
            );
            assert!(
                location.index_in_chunk < chunk.count(),
                "{entity} row {} past chunk count {}",
                location.index_in_chunk,
                chunk.count()
            );
            assert_eq!(
                chunk.entity_at(location.index_in_chunk),
                entity,
                "chunk row does not hold {entity}"
            );
            live += 1;
        }
        let stored: usize = self
            .archetypes
            .archetypes()
            .iter()
            .map(|a| a.entity_count())
            .sum();
        assert_eq!(live, stored, "directory and chunks disagree on entity count");
        assert_eq!(live, self.directory.len(), "directory live count drifted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;

    #[derive(Debug, Clone, Copy, PartialEq, Zeroable)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Zeroable)]
    struct Health(u32);

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Asleep;
    // SAFETY: zero-sized
    unsafe impl Zeroable for Asleep {}

    #[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
    struct Team(u8);
    impl SharedComponent for Team {}

    fn small_store() -> Result<EntityManager> {
        EntityManager::with_config(StoreConfig::default().with_chunk_bytes(512))
    }

    #[test]
    fn test_create_zeroes_components() -> Result<()> {
        let mut em = EntityManager::new();
        let arch = em.create_archetype(&[ComponentType::write::<Position>()])?;
        let e = em.create_entity(arch)?;
        assert_eq!(em.get_component::<Position>(e)?, Position { x: 0.0, y: 0.0 });
        em.set_component(e, Position { x: 1.0, y: 2.0 })?;
        em.destroy_entity(e)?;
        let e2 = em.create_entity(arch)?;
        assert_eq!(em.get_component::<Position>(e2)?, Position { x: 0.0, y: 0.0 });
        em.check_internal_consistency();
        Ok(())
    }

    #[test]
    fn test_stale_handle_rejected() -> Result<()> {
        let mut em = EntityManager::new();
        let arch = em.create_archetype(&[ComponentType::write::<Health>()])?;
        let e = em.create_entity(arch)?;
        em.destroy_entity(e)?;
        assert_eq!(em.destroy_entity(e), Err(EcsError::EntityNotFound(e)));
        assert!(em.get_component::<Health>(e).is_err());
        assert!(!em.has_component::<Health>(e));
        Ok(())
    }

    #[test]
    fn test_add_remove_migrates() -> Result<()> {
        let mut em = EntityManager::new();
        let arch = em.create_archetype(&[ComponentType::write::<Position>()])?;
        let e = em.create_entity(arch)?;
        em.set_component(e, Position { x: 3.0, y: 4.0 })?;
        em.add_component(e, Health(10))?;
        assert!(matches!(
            em.add_component(e, Health(1)),
            Err(EcsError::ComponentAlreadyExists(_))
        ));
        assert_eq!(em.get_component::<Position>(e)?, Position { x: 3.0, y: 4.0 });
        assert_eq!(em.get_component::<Health>(e)?, Health(10));
        em.remove_component::<Position>(e)?;
        assert!(!em.has_component::<Position>(e));
        assert!(matches!(
            em.remove_component::<Position>(e),
            Err(EcsError::ComponentNotFound(_))
        ));
        assert_eq!(em.get_component::<Health>(e)?, Health(10));
        em.check_internal_consistency();
        Ok(())
    }

    #[test]
    fn test_tag_components() -> Result<()> {
        let mut em = EntityManager::new();
        let arch = em.create_archetype(&[ComponentType::write::<Health>()])?;
        let e = em.create_entity(arch)?;
        em.add_component(e, Asleep)?;
        assert!(em.has_component::<Asleep>(e));
        assert_eq!(em.get_component::<Asleep>(e)?, Asleep);
        Ok(())
    }

    #[test]
    fn test_batched_destroy_same_chunk() -> Result<()> {
        let mut em = small_store()?;
        let arch = em.create_archetype(&[ComponentType::write::<Health>()])?;
        let entities = em.create_entities(arch, 100)?;
        for (i, e) in entities.iter().enumerate() {
            em.set_component(*e, Health(i as u32))?;
        }
        let doomed: Vec<Entity> = entities.iter().copied().filter(|e| e.index % 3 != 0).collect();
        em.destroy_entities(&doomed)?;
        em.check_internal_consistency();
        for (i, e) in entities.iter().enumerate() {
            if doomed.contains(e) {
                assert!(!em.exists(*e));
            } else {
                assert_eq!(em.get_component::<Health>(*e)?, Health(i as u32));
            }
        }
        Ok(())
    }

    #[test]
    fn test_destroy_batch_is_all_or_nothing() -> Result<()> {
        let mut em = EntityManager::new();
        let arch = em.create_archetype(&[ComponentType::write::<Health>()])?;
        let entities = em.create_entities(arch, 4)?;
        em.destroy_entity(entities[3])?;
        assert!(em.destroy_entities(&entities).is_err());
        assert_eq!(em.entity_count(), 3);
        assert!(em.destroy_entities(&[entities[0], entities[0]]).is_err());
        assert_eq!(em.entity_count(), 3);
        Ok(())
    }

    #[test]
    fn test_shared_component_partitions_chunks() -> Result<()> {
        let mut em = EntityManager::new();
        let arch = em.create_archetype(&[ComponentType::write::<Health>()])?;
        let entities = em.create_entities(arch, 4)?;
        em.add_shared_component(entities[0], Team(1))?;
        em.add_shared_component(entities[1], Team(1))?;
        em.add_shared_component(entities[2], Team(2))?;
        let a = em.directory.location(entities[0])?;
        let b = em.directory.location(entities[1])?;
        let c = em.directory.location(entities[2])?;
        assert_eq!(a.chunk, b.chunk);
        assert_ne!(a.chunk, c.chunk);
        assert_eq!(em.get_shared_component::<Team>(entities[2])?, Team(2));

        em.set_shared_component(entities[2], Team(1))?;
        assert_eq!(em.directory.location(entities[2])?.chunk, a.chunk);
        // Team(2) lost its last chunk
        assert_eq!(em.shared.find_index(&Team(2)), None);

        em.remove_shared_component::<Team>(entities[0])?;
        assert!(!em.has_shared_component::<Team>(entities[0]));
        em.check_internal_consistency();
        Ok(())
    }

    #[test]
    fn test_entity_capacity_grows() -> Result<()> {
        let mut em = EntityManager::with_config(StoreConfig::default().with_entity_capacity(8))?;
        let arch = em.create_archetype(&[])?;
        em.create_entities(arch, 100)?;
        assert!(em.entity_capacity() >= 100);
        assert!(em.set_entity_capacity(10).is_err());
        em.set_entity_capacity(4096)?;
        assert_eq!(em.entity_capacity(), 4096);
        Ok(())
    }

    #[test]
    fn test_order_version_tracks_structure() -> Result<()> {
        let mut em = EntityManager::new();
        let arch = em.create_archetype(&[ComponentType::write::<Health>()])?;
        let before = em.component_order_version::<Health>();
        let e = em.create_entity(arch)?;
        let after_create = em.component_order_version::<Health>();
        assert_ne!(before, after_create);
        em.set_component(e, Health(5))?;
        assert_eq!(em.component_order_version::<Health>(), after_create);
        Ok(())
    }

    #[test]
    fn test_move_entities_between_stores() -> Result<()> {
        let mut source = EntityManager::new();
        let mut target = small_store()?;
        let arch = source.create_archetype(&[ComponentType::write::<Health>()])?;
        let entities = source.create_entities(arch, 50)?;
        for (i, e) in entities.iter().enumerate() {
            source.set_component(*e, Health(i as u32))?;
        }
        source.add_shared_component(entities[0], Team(3))?;

        let remap = target.move_entities_from(&mut source)?;
        assert_eq!(remap.len(), 50);
        assert_eq!(source.entity_count(), 0);
        for (old, new) in &remap {
            let i = entities.iter().position(|e| e == old).unwrap();
            assert_eq!(target.get_component::<Health>(*new)?, Health(i as u32));
        }
        let (_, moved_first) = remap
            .iter()
            .find(|(old, _)| *old == entities[0])
            .copied()
            .ok_or(EcsError::EntityNotFound(entities[0]))?;
        assert_eq!(target.get_shared_component::<Team>(moved_first)?, Team(3));
        target.check_internal_consistency();
        source.check_internal_consistency();
        Ok(())
    }
}
