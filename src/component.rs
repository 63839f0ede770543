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

//! Component traits and the process-wide component type registry
//!
//! Components are plain data: they are copied byte-wise between chunks and
//! zero-initialized on creation, so they must be `Copy + Zeroable`.
//! Shared components are deduplicated values used as chunk partition keys.

use std::any::TypeId;
use std::fmt;
use std::hash::Hash;
use std::sync::OnceLock;

use bytemuck::Zeroable;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{EcsError, Result};

/// Marker trait for chunk-stored components
///
/// Zero-sized types are tags: they take part in archetype identity but
/// occupy no column bytes.
pub trait Component: Copy + Zeroable + Send + Sync + 'static {}

/// Automatically implement Component for all valid types
impl<T: Copy + Zeroable + Send + Sync + 'static> Component for T {}

/// Marker trait for shared (per-chunk) components
///
/// The `Default` value is what entities see before a value is assigned.
pub trait SharedComponent: Clone + Default + PartialEq + Hash + Send + Sync + 'static {}

/// Stable per-process identifier of a component type
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct TypeIndex(pub u32);

impl TypeIndex {
    /// The entity handle column, present in every archetype
    pub const ENTITY: TypeIndex = TypeIndex(0);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Storage category of a registered type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeCategory {
    /// The implicit entity handle column
    Entity,
    /// Sized chunk column
    Data,
    /// Zero-sized marker
    Tag,
    /// Value lives in the shared store, chunk holds an index
    Shared,
}

/// Layout facts about a registered type
#[derive(Debug, Clone, Copy)]
pub struct TypeInfo {
    pub type_id: TypeId,
    pub name: &'static str,
    pub size: usize,
    pub align: usize,
    pub category: TypeCategory,
}

impl TypeInfo {
    /// Bytes this type occupies per entity inside a chunk
    pub fn column_size(&self) -> usize {
        match self.category {
            TypeCategory::Shared => 0,
            _ => self.size,
        }
    }

    pub fn is_zero_sized(&self) -> bool {
        self.column_size() == 0
    }
}

/// Global registry of component types
pub struct TypeRegistry {
    infos: Vec<TypeInfo>,
    by_id: FxHashMap<TypeId, TypeIndex>,
}

static REGISTRY: OnceLock<RwLock<TypeRegistry>> = OnceLock::new();

impl TypeRegistry {
    fn global() -> &'static RwLock<TypeRegistry> {
        REGISTRY.get_or_init(|| {
            let mut registry = TypeRegistry {
                infos: Vec::new(),
                by_id: FxHashMap::default(),
            };
            registry.push(TypeInfo {
                type_id: TypeId::of::<Entity>(),
                name: std::any::type_name::<Entity>(),
                size: std::mem::size_of::<Entity>(),
                align: std::mem::align_of::<Entity>(),
                category: TypeCategory::Entity,
            });
            RwLock::new(registry)
        })
    }

    fn push(&mut self, info: TypeInfo) -> TypeIndex {
        let index = TypeIndex(self.infos.len() as u32);
        self.by_id.insert(info.type_id, index);
        self.infos.push(info);
        index
    }

    fn get_or_register(info: TypeInfo) -> TypeIndex {
        if let Some(&index) = Self::global().read().by_id.get(&info.type_id) {
            return index;
        }
        let mut registry = Self::global().write();
        // Another thread may have won the race between the two locks
        if let Some(&index) = registry.by_id.get(&info.type_id) {
            return index;
        }
        let index = registry.push(info);
        tracing::debug!(type_name = info.name, index = index.0, "registered component type");
        index
    }

    /// Index of `T`, registering it as a data or tag column on first use
    pub fn type_index<T: Component>() -> TypeIndex {
        let size = std::mem::size_of::<T>();
        Self::get_or_register(TypeInfo {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            size,
            align: std::mem::align_of::<T>(),
            category: if size == 0 {
                TypeCategory::Tag
            } else {
                TypeCategory::Data
            },
        })
    }

    /// Index of `S`, registering it as a shared component on first use
    pub fn shared_type_index<S: SharedComponent>() -> TypeIndex {
        Self::get_or_register(TypeInfo {
            type_id: TypeId::of::<S>(),
            name: std::any::type_name::<S>(),
            size: std::mem::size_of::<S>(),
            align: std::mem::align_of::<S>(),
            category: TypeCategory::Shared,
        })
    }

    /// Index of `T`, failing unless it is a chunk column type
    pub fn data_type<T: Component>() -> Result<TypeIndex> {
        let index = Self::type_index::<T>();
        match Self::info(index).category {
            TypeCategory::Data | TypeCategory::Tag => Ok(index),
            _ => Err(EcsError::InvalidComponentType(std::any::type_name::<T>())),
        }
    }

    /// Index of `S`, failing unless it was registered as shared
    pub fn shared_type<S: SharedComponent>() -> Result<TypeIndex> {
        let index = Self::shared_type_index::<S>();
        match Self::info(index).category {
            TypeCategory::Shared => Ok(index),
            _ => Err(EcsError::InvalidComponentType(std::any::type_name::<S>())),
        }
    }

    /// Layout info for a registered index
    ///
    /// Panics if the index was never handed out by this registry.
    pub fn info(index: TypeIndex) -> TypeInfo {
        Self::global().read().infos[index.index()]
    }

    /// Name for diagnostics
    pub fn name(index: TypeIndex) -> &'static str {
        Self::global()
            .read()
            .infos
            .get(index.index())
            .map_or("<unregistered>", |info| info.name)
    }

    /// Number of registered types
    pub fn type_count() -> usize {
        Self::global().read().infos.len()
    }
}

/// How a query uses a component type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
    /// Matching archetypes must NOT contain the type
    Subtractive,
}

/// Component type plus access qualifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentType {
    pub type_index: TypeIndex,
    pub access: AccessMode,
}

impl ComponentType {
    pub fn new(type_index: TypeIndex, access: AccessMode) -> Self {
        Self { type_index, access }
    }

    /// Read-only access to `T`
    pub fn read<T: Component>() -> Self {
        Self::new(TypeRegistry::type_index::<T>(), AccessMode::ReadOnly)
    }

    /// Read-write access to `T`
    pub fn write<T: Component>() -> Self {
        Self::new(TypeRegistry::type_index::<T>(), AccessMode::ReadWrite)
    }

    /// Exclude archetypes containing `T`
    pub fn subtractive<T: Component>() -> Self {
        Self::new(TypeRegistry::type_index::<T>(), AccessMode::Subtractive)
    }

    /// Require the shared component `S`
    pub fn shared<S: SharedComponent>() -> Self {
        Self::new(TypeRegistry::shared_type_index::<S>(), AccessMode::ReadOnly)
    }

    /// Exclude archetypes containing the shared component `S`
    pub fn subtractive_shared<S: SharedComponent>() -> Self {
        Self::new(
            TypeRegistry::shared_type_index::<S>(),
            AccessMode::Subtractive,
        )
    }

    pub fn is_subtractive(&self) -> bool {
        self.access == AccessMode::Subtractive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, Zeroable)]
    #[allow(dead_code)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy)]
    struct Frozen;
    unsafe impl Zeroable for Frozen {}

    #[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
    struct Team(u8);
    impl SharedComponent for Team {}

    #[test]
    fn test_entity_is_index_zero() {
        assert_eq!(TypeRegistry::type_index::<Entity>(), TypeIndex::ENTITY);
        assert_eq!(
            TypeRegistry::info(TypeIndex::ENTITY).category,
            TypeCategory::Entity
        );
    }

    #[test]
    fn test_registration_is_stable() {
        let a = TypeRegistry::type_index::<Position>();
        let b = TypeRegistry::type_index::<Position>();
        assert_eq!(a, b);
        assert_ne!(a, TypeIndex::ENTITY);
        assert_eq!(TypeRegistry::info(a).size, 8);
    }

    #[test]
    fn test_tag_and_shared_categories() {
        let tag = TypeRegistry::type_index::<Frozen>();
        assert_eq!(TypeRegistry::info(tag).category, TypeCategory::Tag);
        assert!(TypeRegistry::info(tag).is_zero_sized());

        let shared = TypeRegistry::shared_type_index::<Team>();
        assert_eq!(TypeRegistry::info(shared).category, TypeCategory::Shared);
        assert_eq!(TypeRegistry::info(shared).column_size(), 0);
    }

    #[test]
    fn test_entity_rejected_as_data() {
        assert!(TypeRegistry::data_type::<Entity>().is_err());
    }

    #[test]
    fn test_component_type_access() {
        let read = ComponentType::read::<Position>();
        let write = ComponentType::write::<Position>();
        assert_eq!(read.type_index, write.type_index);
        assert_eq!(read.access, AccessMode::ReadOnly);
        assert!(ComponentType::subtractive::<Position>().is_subtractive());
    }
}
