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

//! Archetypes, their chunk lists, and structural transitions

use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::chunk::{
    self, Chunk, ChunkArena, ChunkBuffer, ChunkId, ChunkList, ColumnLayout, ListKind,
};
use crate::component::{TypeCategory, TypeIndex, TypeRegistry};
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::hash_map::ConcurrentMultiHashMap;
use crate::shared::SharedComponentStore;

/// Sorted type set, entity column first
pub type ArchetypeSignature = SmallVec<[TypeIndex; 8]>;

/// Index of an archetype in its manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchetypeId(pub usize);

/// One distinct component type set and its chunk layout
pub struct Archetype {
    id: ArchetypeId,
    types: ArchetypeSignature,
    columns: SmallVec<[ColumnLayout; 8]>,
    type_positions: FxHashMap<TypeIndex, usize>,
    shared_types: SmallVec<[TypeIndex; 4]>,
    bytes_per_entity: usize,
    chunk_capacity: usize,
    entity_count: usize,
    chunks: ChunkList,
    slot_chunks: ChunkList,
}

impl Archetype {
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// Get signature
    pub fn types(&self) -> &[TypeIndex] {
        &self.types
    }

    pub fn columns(&self) -> &[ColumnLayout] {
        &self.columns
    }

    pub fn has_type(&self, type_index: TypeIndex) -> bool {
        self.type_positions.contains_key(&type_index)
    }

    /// Position of a type in the sorted signature
    pub fn type_position(&self, type_index: TypeIndex) -> Option<usize> {
        self.type_positions.get(&type_index).copied()
    }

    pub fn column(&self, type_index: TypeIndex) -> Option<ColumnLayout> {
        self.type_position(type_index).map(|i| self.columns[i])
    }

    /// Shared types in signature order
    pub fn shared_types(&self) -> &[TypeIndex] {
        &self.shared_types
    }

    /// Slot of a shared type in each chunk's shared value list
    pub fn shared_position(&self, type_index: TypeIndex) -> Option<usize> {
        self.shared_types.iter().position(|t| *t == type_index)
    }

    pub fn bytes_per_entity(&self) -> usize {
        self.bytes_per_entity
    }

    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    pub fn entity_count(&self) -> usize {
        self.entity_count
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len
    }

    pub fn first_chunk(&self) -> Option<ChunkId> {
        self.chunks.head
    }

    /// Chunk ids of this archetype, oldest first
    pub fn chunk_ids<'a>(&self, arena: &'a ChunkArena) -> impl Iterator<Item = ChunkId> + 'a {
        self.chunks.iter(arena, ListKind::Archetype)
    }
}

fn signature_hash(types: &[TypeIndex]) -> u64 {
    let mut hasher = FxHasher::default();
    types.hash(&mut hasher);
    hasher.finish()
}

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

/// Column offsets and per-chunk capacity for a sorted type set
///
/// Capacity starts at `chunk_bytes / bytes_per_entity` and shrinks until the
/// alignment padding fits as well.
pub fn compute_layout(
    types: &[TypeIndex],
    chunk_bytes: usize,
) -> Result<(SmallVec<[ColumnLayout; 8]>, usize, usize)> {
    let infos: SmallVec<[_; 8]> = types.iter().map(|t| TypeRegistry::info(*t)).collect();
    let bytes_per_entity: usize = infos.iter().map(|info| info.column_size()).sum();
    let mut capacity = chunk_bytes / bytes_per_entity.max(1);

    loop {
        if capacity == 0 {
            let largest = infos
                .iter()
                .max_by_key(|info| info.column_size())
                .map_or("<empty>", |info| info.name);
            return Err(EcsError::InvalidComponentType(largest));
        }
        let mut offset = 0usize;
        let mut columns = SmallVec::new();
        for (type_index, info) in types.iter().zip(infos.iter()) {
            let size = info.column_size();
            if size > 0 {
                offset = align_up(offset, info.align);
            }
            columns.push(ColumnLayout {
                type_index: *type_index,
                offset,
                size,
            });
            offset += size * capacity;
        }
        if offset <= chunk_bytes {
            return Ok((columns, capacity, bytes_per_entity));
        }
        capacity -= 1;
    }
}

/// Normalize a type list into a signature: sorted, deduplicated, entity first
pub fn make_signature(types: &[TypeIndex]) -> ArchetypeSignature {
    let mut signature: ArchetypeSignature = types.iter().copied().collect();
    signature.push(TypeIndex::ENTITY);
    signature.sort_unstable();
    signature.dedup();
    signature
}

/// Signature of `current` plus `added`
pub fn compute_destination_with(
    current: &[TypeIndex],
    added: TypeIndex,
) -> Result<ArchetypeSignature> {
    match current.binary_search(&added) {
        Ok(_) => Err(EcsError::ComponentAlreadyExists(TypeRegistry::name(added))),
        Err(position) => {
            let mut signature: ArchetypeSignature = current.iter().copied().collect();
            signature.insert(position, added);
            Ok(signature)
        }
    }
}

/// Signature of `current` minus `removed`
pub fn compute_destination_without(
    current: &[TypeIndex],
    removed: TypeIndex,
) -> Result<ArchetypeSignature> {
    if removed == TypeIndex::ENTITY {
        return Err(EcsError::InvalidComponentType(TypeRegistry::name(removed)));
    }
    match current.binary_search(&removed) {
        Ok(position) => {
            let mut signature: ArchetypeSignature = current.iter().copied().collect();
            signature.remove(position);
            Ok(signature)
        }
        Err(_) => Err(EcsError::ComponentNotFound(TypeRegistry::name(removed))),
    }
}

/// Registry of archetypes plus the chunk arena they allocate from
pub struct ArchetypeManager {
    archetypes: Vec<Archetype>,
    lookup: ConcurrentMultiHashMap<u64, ArchetypeId>,
    chunks: ChunkArena,
    empty_pool: Vec<ChunkBuffer>,
    chunk_bytes: usize,
    max_pooled_chunks: usize,
    order_versions: Vec<u32>,
}

impl ArchetypeManager {
    pub fn new(chunk_bytes: usize, max_pooled_chunks: usize) -> Self {
        Self {
            archetypes: Vec::new(),
            lookup: ConcurrentMultiHashMap::with_capacity(64),
            chunks: ChunkArena::with_key(),
            empty_pool: Vec::new(),
            chunk_bytes,
            max_pooled_chunks,
            order_versions: Vec::new(),
        }
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }

    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    #[inline]
    pub fn archetype(&self, id: ArchetypeId) -> &Archetype {
        &self.archetypes[id.0]
    }

    #[inline]
    pub fn chunk(&self, id: ChunkId) -> &Chunk {
        &self.chunks[id]
    }

    pub fn chunk_arena(&self) -> &ChunkArena {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn pooled_chunk_count(&self) -> usize {
        self.empty_pool.len()
    }

    /// Look up a signature by structural equality
    pub fn find(&self, signature: &[TypeIndex]) -> Option<ArchetypeId> {
        let (mut candidate, mut it) = self.lookup.try_get_first_value(signature_hash(signature))?;
        loop {
            if self.archetypes[candidate.0].types.as_slice() == signature {
                return Some(candidate);
            }
            candidate = self.lookup.try_get_next_value(&mut it)?;
        }
    }

    /// Archetype for `types`, creating it on first use
    ///
    /// Returns whether it was newly created so callers can notify groups.
    pub fn get_or_create(&mut self, types: &[TypeIndex]) -> Result<(ArchetypeId, bool)> {
        let signature = make_signature(types);
        if let Some(id) = self.find(&signature) {
            return Ok((id, false));
        }

        let (columns, chunk_capacity, bytes_per_entity) =
            compute_layout(&signature, self.chunk_bytes)?;
        let id = ArchetypeId(self.archetypes.len());
        let type_positions = signature.iter().enumerate().map(|(i, t)| (*t, i)).collect();
        let shared_types = signature
            .iter()
            .copied()
            .filter(|t| TypeRegistry::info(*t).category == TypeCategory::Shared)
            .collect();

        tracing::debug!(
            archetype = id.0,
            types = signature.len(),
            chunk_capacity,
            bytes_per_entity,
            "created archetype"
        );

        self.lookup.add(signature_hash(&signature), id);
        self.archetypes.push(Archetype {
            id,
            types: signature,
            columns,
            type_positions,
            shared_types,
            bytes_per_entity,
            chunk_capacity,
            entity_count: 0,
            chunks: ChunkList::default(),
            slot_chunks: ChunkList::default(),
        });
        Ok((id, true))
    }

    /// Whether `types` could be stored here, without creating anything
    pub fn check_layout(&self, types: &[TypeIndex]) -> Result<()> {
        let signature = make_signature(types);
        if self.find(&signature).is_some() {
            return Ok(());
        }
        compute_layout(&signature, self.chunk_bytes).map(|_| ())
    }

    /// A chunk of `archetype` with a free row and the given shared values
    pub fn get_chunk_with_empty_slots(
        &mut self,
        archetype: ArchetypeId,
        shared_values: &[u32],
        shared: &mut SharedComponentStore,
    ) -> ChunkId {
        let found = self.archetypes[archetype.0]
            .slot_chunks
            .iter(&self.chunks, ListKind::EmptySlots)
            .find(|id| self.chunks[*id].shared_values.as_slice() == shared_values);
        if let Some(id) = found {
            return id;
        }
        self.allocate_chunk(archetype, shared_values, shared)
    }

    fn allocate_chunk(
        &mut self,
        archetype: ArchetypeId,
        shared_values: &[u32],
        shared: &mut SharedComponentStore,
    ) -> ChunkId {
        let capacity = self.archetypes[archetype.0].chunk_capacity;
        let buffer = match self.empty_pool.pop() {
            Some(buffer) => buffer,
            None => ChunkBuffer::new(self.chunk_bytes),
        };
        let mut chunk = Chunk::new(archetype, capacity, buffer);
        chunk.shared_values = shared_values.iter().copied().collect();
        for &index in shared_values {
            shared.add_ref(index);
        }

        let id = self.chunks.insert(chunk);
        let arch = &mut self.archetypes[archetype.0];
        arch.chunks.push_back(&mut self.chunks, id, ListKind::Archetype);
        arch.slot_chunks.push_back(&mut self.chunks, id, ListKind::EmptySlots);
        self.chunks[id].in_slot_list = true;
        tracing::debug!(archetype = archetype.0, capacity, "allocated chunk");
        id
    }

    /// Claim up to `wanted` rows at the end of `chunk`; returns (first row, rows claimed)
    pub fn allocate_rows(&mut self, chunk: ChunkId, wanted: usize) -> (usize, usize) {
        let c = &mut self.chunks[chunk];
        let start = c.count;
        let claimed = wanted.min(c.capacity - c.count);
        c.count += claimed;
        let archetype = c.archetype;
        let now_full = c.is_full();
        self.archetypes[archetype.0].entity_count += claimed;
        if now_full {
            self.unlink_slot_chunk(chunk);
        }
        (start, claimed)
    }

    fn unlink_slot_chunk(&mut self, chunk: ChunkId) {
        if !self.chunks[chunk].in_slot_list {
            return;
        }
        let archetype = self.chunks[chunk].archetype;
        self.archetypes[archetype.0]
            .slot_chunks
            .remove(&mut self.chunks, chunk, ListKind::EmptySlots);
        self.chunks[chunk].in_slot_list = false;
    }

    /// Shrink a chunk to `count` rows, recycling it when it becomes empty
    ///
    /// Returns true when the chunk was released.
    pub fn set_chunk_count(
        &mut self,
        chunk: ChunkId,
        count: usize,
        shared: &mut SharedComponentStore,
    ) -> bool {
        let c = &mut self.chunks[chunk];
        assert!(count <= c.count, "chunk count can only shrink here");
        let removed = c.count - count;
        c.count = count;
        let archetype = c.archetype;
        self.archetypes[archetype.0].entity_count -= removed;

        if count == 0 {
            self.release_chunk(chunk, shared);
            return true;
        }
        if !self.chunks[chunk].in_slot_list && removed > 0 {
            self.archetypes[archetype.0]
                .slot_chunks
                .push_front(&mut self.chunks, chunk, ListKind::EmptySlots);
            self.chunks[chunk].in_slot_list = true;
        }
        false
    }

    fn release_chunk(&mut self, chunk: ChunkId, shared: &mut SharedComponentStore) {
        self.unlink_slot_chunk(chunk);
        let archetype = self.chunks[chunk].archetype;
        self.archetypes[archetype.0]
            .chunks
            .remove(&mut self.chunks, chunk, ListKind::Archetype);
        let Some(removed) = self.chunks.remove(chunk) else {
            return;
        };
        for &index in removed.shared_values() {
            shared.release(index);
        }
        if self.empty_pool.len() < self.max_pooled_chunks {
            self.empty_pool.push(removed.into_buffer());
            tracing::debug!(archetype = archetype.0, pooled = self.empty_pool.len(), "recycled chunk");
        }
    }

    /// Remove `row` by moving the last row into it
    ///
    /// Returns the entity that now occupies `row`, if one was moved.
    pub fn remove_row_swap_back(
        &mut self,
        chunk: ChunkId,
        row: usize,
        shared: &mut SharedComponentStore,
    ) -> Option<Entity> {
        let c = &self.chunks[chunk];
        let last = c.count - 1;
        assert!(row <= last, "row {row} past chunk count {}", c.count);
        let moved = if row != last {
            let columns = &self.archetypes[c.archetype.0].columns;
            // SAFETY: both rows are live, distinct, and inside this chunk
            unsafe { chunk::copy_row(c, last, c, row, columns) };
            Some(c.entity_at(row))
        } else {
            None
        };
        self.set_chunk_count(chunk, last, shared);
        moved
    }

    /// Bump the order version of every type in `archetype`
    pub fn bump_order_version(&mut self, archetype: ArchetypeId) {
        for t in self.archetypes[archetype.0].types.iter() {
            let index = t.index();
            if self.order_versions.len() <= index {
                self.order_versions.resize(index + 1, 0);
            }
            self.order_versions[index] = self.order_versions[index].wrapping_add(1);
        }
    }

    pub fn order_version(&self, type_index: TypeIndex) -> u32 {
        self.order_versions.get(type_index.index()).copied().unwrap_or(0)
    }

    /// Verify chunk lists and counts, panicking on the first violation
    pub fn check_consistency(&self) {
        for archetype in &self.archetypes {
            let mut total = 0;
            let mut listed = 0;
            for id in archetype.chunks.iter(&self.chunks, ListKind::Archetype) {
                let c = &self.chunks[id];
                assert_eq!(c.archetype, archetype.id, "chunk linked into foreign archetype");
                assert!(c.count > 0, "empty chunk left in archetype {}", archetype.id.0);
                assert!(c.count <= c.capacity, "chunk count exceeds capacity");
                assert_eq!(
                    c.in_slot_list,
                    !c.is_full(),
                    "slot list membership out of sync"
                );
                assert_eq!(c.shared_values.len(), archetype.shared_types.len());
                total += c.count;
                listed += 1;
            }
            assert_eq!(listed, archetype.chunks.len, "chunk list length mismatch");
            assert_eq!(
                total, archetype.entity_count,
                "archetype {} entity count mismatch",
                archetype.id.0
            );
            for id in archetype.slot_chunks.iter(&self.chunks, ListKind::EmptySlots) {
                assert!(!self.chunks[id].is_full(), "full chunk in slot list");
            }
        }
    }
}
