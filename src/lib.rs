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

//! Chunk Store - archetype-based entity/component storage
//!
//! Entities are grouped by their component type set into archetypes, whose
//! components live column-wise in fixed-size chunks. Cached component groups
//! iterate matching chunks; a per-type dependency tracker and runtime view
//! checks make concurrent column access safe.

pub mod archetype;
pub mod array;
pub mod chunk;
pub mod command;
pub mod component;
pub mod config;
pub mod debug;
pub mod dependency;
pub mod entity;
pub mod entity_manager;
pub mod error;
pub mod group;
pub mod hash_map;
pub mod prelude;
pub mod safety;
pub mod shared;

pub use archetype::{Archetype, ArchetypeId, ArchetypeManager};
pub use array::*;
pub use command::*;
pub use component::*;
pub use config::*;
pub use debug::*;
pub use dependency::*;
pub use entity::*;
pub use entity_manager::*;
pub use error::*;
pub use group::*;
pub use hash_map::*;
pub use safety::*;
pub use shared::*;
