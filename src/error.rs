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

//! Error types

use std::fmt;

use crate::entity::Entity;

/// Store error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EcsError {
    /// Entity handle is stale or was never issued
    EntityNotFound(Entity),

    /// Entity does not have the component
    ComponentNotFound(&'static str),

    /// Entity already has the component
    ComponentAlreadyExists(&'static str),

    /// Type cannot be used this way (wrong category, reserved type, too large)
    InvalidComponentType(&'static str),

    /// Component type is not part of the group's type set
    TypeNotInGroup(&'static str),

    /// View index past its length
    IndexOutOfRange { index: usize, length: usize },

    /// Caller protocol violation
    InvalidOperation(String),

    /// View used across a fence or aliased with a conflicting view
    SafetyViolation(String),

    /// Command buffer playback error
    CommandError(String),

    /// Configuration could not be parsed or is out of range
    ConfigError(String),
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::EntityNotFound(entity) => {
                write!(f, "Entity {entity} does not exist (destroyed or stale handle)")
            }
            EcsError::ComponentNotFound(name) => write!(f, "Component not found: {name}"),
            EcsError::ComponentAlreadyExists(name) => {
                write!(f, "Component already exists: {name}")
            }
            EcsError::InvalidComponentType(name) => write!(f, "Invalid component type: {name}"),
            EcsError::TypeNotInGroup(name) => {
                write!(f, "Component type {name} is not part of this group")
            }
            EcsError::IndexOutOfRange { index, length } => {
                write!(f, "Index {index} is out of range of length {length}")
            }
            EcsError::InvalidOperation(msg) => write!(f, "Invalid operation: {msg}"),
            EcsError::SafetyViolation(msg) => write!(f, "Safety violation: {msg}"),
            EcsError::CommandError(msg) => write!(f, "Command error: {msg}"),
            EcsError::ConfigError(msg) => write!(f, "Config error: {msg}"),
        }
    }
}

impl std::error::Error for EcsError {}

impl From<serde_json::Error> for EcsError {
    fn from(err: serde_json::Error) -> Self {
        EcsError::ConfigError(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcsError>;
