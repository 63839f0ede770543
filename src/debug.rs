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

//! Read-only store inspection

use serde::Serialize;

use crate::component::TypeRegistry;
use crate::entity::Entity;
use crate::entity_manager::EntityManager;
use crate::error::Result;

/// Store inspector for debugging
pub struct StoreInspector;

impl StoreInspector {
    /// Get total entity count
    pub fn entity_count(manager: &EntityManager) -> usize {
        manager.entity_count()
    }

    /// Get archetype summary
    pub fn archetype_summary(manager: &EntityManager) -> Vec<ArchetypeInfo> {
        let archetypes = manager.archetype_manager();
        archetypes
            .archetypes()
            .iter()
            .map(|archetype| ArchetypeInfo {
                id: archetype.id().0,
                signature: archetype
                    .types()
                    .iter()
                    .map(|t| TypeRegistry::name(*t).to_string())
                    .collect(),
                entity_count: archetype.entity_count(),
                chunk_count: archetype.chunk_count(),
                chunk_capacity: archetype.chunk_capacity(),
                bytes_per_entity: archetype.bytes_per_entity(),
            })
            .collect()
    }

    /// Memory held by chunks and the directory
    pub fn memory_stats(manager: &EntityManager) -> MemoryStats {
        let archetypes = manager.archetype_manager();
        let chunk_bytes = archetypes.chunk_bytes();
        let live_chunks = archetypes.chunk_count();
        let pooled_chunks = archetypes.pooled_chunk_count();
        let used_bytes: usize = archetypes
            .archetypes()
            .iter()
            .map(|a| a.entity_count() * a.bytes_per_entity())
            .sum();
        let directory_bytes = manager.entity_capacity() * std::mem::size_of::<(Entity, usize)>();
        MemoryStats {
            live_chunks,
            pooled_chunks,
            chunk_memory: (live_chunks + pooled_chunks) * chunk_bytes,
            used_component_bytes: used_bytes,
            directory_memory: directory_bytes,
            total_memory: (live_chunks + pooled_chunks) * chunk_bytes + directory_bytes,
        }
    }

    /// Summary plus memory stats as pretty JSON
    pub fn to_json(manager: &EntityManager) -> Result<String> {
        let report = StoreReport {
            entity_count: manager.entity_count(),
            archetypes: Self::archetype_summary(manager),
            memory: Self::memory_stats(manager),
        };
        Ok(serde_json::to_string_pretty(&report)?)
    }

    /// Print store summary to console
    pub fn print_summary(manager: &EntityManager) {
        println!("=== Store Summary ===");
        println!("Entities: {}", manager.entity_count());
        println!("Archetypes: {}", manager.archetype_manager().len());

        println!("\n=== Archetypes ===");
        for info in Self::archetype_summary(manager) {
            println!(
                "Archetype {}: {} entities in {} chunks ({} per chunk)",
                info.id, info.entity_count, info.chunk_count, info.chunk_capacity
            );
        }
    }
}

/// Archetype information for debugging
#[derive(Clone, Debug, Serialize)]
pub struct ArchetypeInfo {
    pub id: usize,
    pub signature: Vec<String>,
    pub entity_count: usize,
    pub chunk_count: usize,
    pub chunk_capacity: usize,
    pub bytes_per_entity: usize,
}

/// Memory usage statistics
#[derive(Clone, Debug, Default, Serialize)]
pub struct MemoryStats {
    pub live_chunks: usize,
    pub pooled_chunks: usize,
    pub chunk_memory: usize,
    pub used_component_bytes: usize,
    pub directory_memory: usize,
    pub total_memory: usize,
}

#[derive(Serialize)]
struct StoreReport {
    entity_count: usize,
    archetypes: Vec<ArchetypeInfo>,
    memory: MemoryStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentType;
    use bytemuck::Zeroable;

    #[derive(Clone, Copy, Zeroable)]
    #[allow(dead_code)]
    struct Mass(f64);

    #[test]
    fn test_store_inspector() -> Result<()> {
        let mut em = EntityManager::new();
        assert_eq!(StoreInspector::entity_count(&em), 0);
        let arch = em.create_archetype(&[ComponentType::write::<Mass>()])?;
        em.create_entities(arch, 10)?;

        let summary = StoreInspector::archetype_summary(&em);
        let info = summary.iter().find(|a| a.id == arch.0).map(|a| a.entity_count);
        assert_eq!(info, Some(10));

        let stats = StoreInspector::memory_stats(&em);
        assert_eq!(stats.live_chunks, 1);
        assert_eq!(stats.used_component_bytes, 10 * 16);

        let json = StoreInspector::to_json(&em)?;
        assert!(json.contains("\"entity_count\": 10"));
        Ok(())
    }
}
