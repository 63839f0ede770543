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

//! Deferred structural changes
//!
//! Jobs that must not touch the store's structure record commands here; the
//! owner plays them back once the jobs have completed.

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::ArchetypeId;
use crate::component::{Component, SharedComponent};
use crate::entity::Entity;
use crate::entity_manager::EntityManager;
use crate::error::{EcsError, Result};

/// Mutation applied to an arbitrary entity
pub type CommandClosure = Box<dyn FnOnce(&mut EntityManager) -> Result<()> + Send>;

/// Mutation applied to the entity most recently created during playback
pub type CreatedClosure = Box<dyn FnOnce(&mut EntityManager, Entity) -> Result<()> + Send>;

/// Recorded command
pub enum Command {
    /// Create an entity in an archetype
    Create(ArchetypeId),

    /// Clone an entity `count` times
    Instantiate { source: Entity, count: usize },

    /// Destroy entity
    Destroy(Entity),

    /// Mutate the last entity created by this buffer
    OnCreated(CreatedClosure),

    /// Custom store mutation
    Custom(CommandClosure),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Create(archetype) => f.debug_tuple("Create").field(archetype).finish(),
            Command::Instantiate { source, count } => f
                .debug_struct("Instantiate")
                .field("source", source)
                .field("count", count)
                .finish(),
            Command::Destroy(e) => f.debug_tuple("Destroy").field(e).finish(),
            Command::OnCreated(_) => write!(f, "OnCreated(...)"),
            Command::Custom(_) => write!(f, "Custom(...)"),
        }
    }
}

/// Command buffer for deferred operations
#[derive(Default)]
pub struct EntityCommandBuffer {
    commands: Vec<Command>,
}

impl EntityCommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            commands: Vec::with_capacity(capacity),
        }
    }

    /// Queue creation of a zeroed entity
    pub fn create_entity(&mut self, archetype: ArchetypeId) {
        self.commands.push(Command::Create(archetype));
    }

    /// Queue `count` copies of `source`
    pub fn instantiate(&mut self, source: Entity, count: usize) {
        self.commands.push(Command::Instantiate { source, count });
    }

    pub fn destroy_entity(&mut self, entity: Entity) {
        self.commands.push(Command::Destroy(entity));
    }

    /// Queue a custom store mutation
    pub fn add<F>(&mut self, f: F)
    where
        F: FnOnce(&mut EntityManager) -> Result<()> + Send + 'static,
    {
        self.commands.push(Command::Custom(Box::new(f)));
    }

    pub fn add_component<T: Component>(&mut self, entity: Entity, value: T) {
        self.add(move |em| em.add_component(entity, value));
    }

    pub fn set_component<T: Component>(&mut self, entity: Entity, value: T) {
        self.add(move |em| em.set_component(entity, value));
    }

    pub fn remove_component<T: Component>(&mut self, entity: Entity) {
        self.add(move |em| em.remove_component::<T>(entity));
    }

    pub fn add_shared_component<S: SharedComponent>(&mut self, entity: Entity, value: S) {
        self.add(move |em| em.add_shared_component(entity, value));
    }

    pub fn set_shared_component<S: SharedComponent>(&mut self, entity: Entity, value: S) {
        self.add(move |em| em.set_shared_component(entity, value));
    }

    /// Add `T` to the entity created by the latest create/instantiate command
    pub fn add_component_to_created<T: Component>(&mut self, value: T) {
        self.commands.push(Command::OnCreated(Box::new(move |em, entity| {
            em.add_component(entity, value)
        })));
    }

    /// Set `T` on the entity created by the latest create/instantiate command
    pub fn set_component_on_created<T: Component>(&mut self, value: T) {
        self.commands.push(Command::OnCreated(Box::new(move |em, entity| {
            em.set_component(entity, value)
        })));
    }

    /// Apply all commands in order and clear the buffer
    ///
    /// Returns every entity created during playback. Stops at the first
    /// failing command; commands before it stay applied.
    pub fn playback(&mut self, manager: &mut EntityManager) -> Result<Vec<Entity>> {
        #[cfg(feature = "profiling")]
        let span = info_span!("entity_command_buffer.playback", queued = self.commands.len());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let mut created = Vec::new();
        for (position, command) in self.commands.drain(..).enumerate() {
            let outcome = match command {
                Command::Create(archetype) => manager
                    .create_entity(archetype)
                    .map(|entity| created.push(entity)),
                Command::Instantiate { source, count } => manager
                    .instantiate(source, count)
                    .map(|entities| created.extend(entities)),
                Command::Destroy(entity) => manager.destroy_entity(entity),
                Command::OnCreated(f) => match created.last() {
                    Some(&entity) => f(manager, entity),
                    None => Err(EcsError::InvalidOperation(
                        "no entity was created before this command".into(),
                    )),
                },
                Command::Custom(f) => f(manager),
            };
            if let Err(err) = outcome {
                tracing::warn!(position, %err, "command playback failed");
                return Err(EcsError::CommandError(format!("command {position}: {err}")));
            }
        }
        Ok(created)
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }
}
