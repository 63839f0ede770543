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

//! Entity handles and the directory mapping them to chunk slots.

use std::fmt;

use bytemuck::Zeroable;
use serde::{Deserialize, Serialize};

use crate::archetype::ArchetypeId;
use crate::chunk::ChunkId;
use crate::error::{EcsError, Result};

/// Opaque entity handle: directory slot plus the generation it was issued at
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Zeroable, Serialize, Deserialize,
)]
pub struct Entity {
    pub index: i32,
    pub generation: i32,
}

impl Entity {
    /// Never issued: live generations start at 1
    pub const NULL: Entity = Entity {
        index: 0,
        generation: 0,
    };
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}:{})", self.index, self.generation)
    }
}

/// Where an entity currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub archetype: ArchetypeId,
    pub chunk: ChunkId,
    pub index_in_chunk: usize,
}

#[derive(Debug, Clone, Copy)]
struct EntitySlot {
    version: i32,
    location: Option<(ArchetypeId, ChunkId)>,
    /// Row in the chunk while live, next free slot while free
    index_in_chunk: i32,
}

/// Generation-checked table of entity locations
///
/// Free slots form a list threaded through `index_in_chunk`.
pub struct EntityDirectory {
    slots: Vec<EntitySlot>,
    free_head: i32,
    live: usize,
}

impl EntityDirectory {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut directory = Self {
            slots: Vec::new(),
            free_head: -1,
            live: 0,
        };
        directory.grow_to(capacity.max(1));
        directory
    }

    /// Push slots `[len, capacity)` onto the front of the free list in index order
    fn grow_to(&mut self, capacity: usize) {
        let start = self.slots.len();
        if capacity <= start {
            return;
        }
        self.slots.reserve_exact(capacity - start);
        for i in start..capacity {
            let next = if i + 1 < capacity {
                (i + 1) as i32
            } else {
                self.free_head
            };
            self.slots.push(EntitySlot {
                version: 1,
                location: None,
                index_in_chunk: next,
            });
        }
        self.free_head = start as i32;
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Grow the slot table; shrinking is refused
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        if capacity < self.slots.len() {
            return Err(EcsError::InvalidOperation(format!(
                "entity capacity can only grow ({} -> {capacity})",
                self.slots.len()
            )));
        }
        if capacity > i32::MAX as usize {
            return Err(EcsError::InvalidOperation(
                "entity capacity exceeds the index range".into(),
            ));
        }
        self.grow_to(capacity);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn exists(&self, entity: Entity) -> bool {
        entity.index >= 0
            && self
                .slots
                .get(entity.index as usize)
                .is_some_and(|slot| slot.version == entity.generation && slot.location.is_some())
    }

    /// Current location of a live entity
    pub fn location(&self, entity: Entity) -> Result<EntityLocation> {
        if entity.index < 0 {
            return Err(EcsError::EntityNotFound(entity));
        }
        match self.slots.get(entity.index as usize) {
            Some(EntitySlot {
                version,
                location: Some((archetype, chunk)),
                index_in_chunk,
            }) if *version == entity.generation => Ok(EntityLocation {
                archetype: *archetype,
                chunk: *chunk,
                index_in_chunk: *index_in_chunk as usize,
            }),
            _ => Err(EcsError::EntityNotFound(entity)),
        }
    }

    /// Pop a free slot, doubling the table when none is left
    ///
    /// The entity is not live until [`set_location`](Self::set_location).
    pub fn allocate(&mut self) -> Entity {
        if self.free_head < 0 {
            let doubled = (self.slots.len() * 2).max(16);
            assert!(doubled <= i32::MAX as usize, "entity index range exhausted");
            self.grow_to(doubled);
        }
        let index = self.free_head as usize;
        let slot = &mut self.slots[index];
        self.free_head = slot.index_in_chunk;
        slot.index_in_chunk = 0;
        self.live += 1;
        Entity {
            index: index as i32,
            generation: slot.version,
        }
    }

    /// Point an allocated entity at its chunk row
    pub fn set_location(&mut self, entity: Entity, location: EntityLocation) {
        let slot = &mut self.slots[entity.index as usize];
        debug_assert_eq!(slot.version, entity.generation);
        slot.location = Some((location.archetype, location.chunk));
        slot.index_in_chunk = location.index_in_chunk as i32;
    }

    /// Update only the row, used after a swap-back inside one chunk
    pub fn set_index_in_chunk(&mut self, entity: Entity, index_in_chunk: usize) {
        self.slots[entity.index as usize].index_in_chunk = index_in_chunk as i32;
    }

    /// Release a slot and bump its generation
    pub fn free(&mut self, entity: Entity) -> Result<()> {
        if !self.exists(entity) {
            return Err(EcsError::EntityNotFound(entity));
        }
        let slot = &mut self.slots[entity.index as usize];
        slot.version = slot.version.wrapping_add(1).max(1);
        slot.location = None;
        slot.index_in_chunk = self.free_head;
        self.free_head = entity.index;
        self.live -= 1;
        Ok(())
    }

    /// All live entities with their locations
    pub fn iter(&self) -> impl Iterator<Item = (Entity, EntityLocation)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.location.map(|(archetype, chunk)| {
                (
                    Entity {
                        index: i as i32,
                        generation: slot.version,
                    },
                    EntityLocation {
                        archetype,
                        chunk,
                        index_in_chunk: slot.index_in_chunk as usize,
                    },
                )
            })
        })
    }
}
