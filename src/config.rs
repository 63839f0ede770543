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

//! Store configuration

use serde::{Deserialize, Serialize};

use crate::error::{EcsError, Result};

/// Default chunk size in bytes
pub const DEFAULT_CHUNK_BYTES: usize = 16 * 1024;

/// Default number of directory slots reserved up front
pub const DEFAULT_ENTITY_CAPACITY: usize = 1024;

/// Alignment of every chunk buffer
pub const CHUNK_ALIGN: usize = 64;

/// Per-store capacity knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory slots allocated at construction. Growth past this reallocates.
    pub initial_entity_capacity: usize,
    /// Byte budget of a single chunk
    pub chunk_bytes: usize,
    /// Emptied chunks kept for reuse before being freed
    pub max_pooled_chunks: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            initial_entity_capacity: DEFAULT_ENTITY_CAPACITY,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            max_pooled_chunks: 64,
        }
    }
}

impl StoreConfig {
    /// Parse from JSON, missing fields fall back to defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: StoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Builder-style chunk size override
    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes;
        self
    }

    /// Builder-style entity capacity override
    pub fn with_entity_capacity(mut self, capacity: usize) -> Self {
        self.initial_entity_capacity = capacity;
        self
    }

    /// Check the knobs are usable
    pub fn validate(&self) -> Result<()> {
        if self.chunk_bytes < 256 {
            return Err(EcsError::ConfigError(format!(
                "chunk_bytes must be at least 256, got {}",
                self.chunk_bytes
            )));
        }
        if self.chunk_bytes % CHUNK_ALIGN != 0 {
            return Err(EcsError::ConfigError(format!(
                "chunk_bytes must be a multiple of {CHUNK_ALIGN}, got {}",
                self.chunk_bytes
            )));
        }
        if self.initial_entity_capacity > i32::MAX as usize {
            return Err(EcsError::ConfigError(
                "initial_entity_capacity exceeds the entity index range".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() -> Result<()> {
        let config = StoreConfig::from_json(r#"{ "initial_entity_capacity": 10 }"#)?;
        assert_eq!(config.initial_entity_capacity, 10);
        assert_eq!(config.chunk_bytes, DEFAULT_CHUNK_BYTES);
        Ok(())
    }

    #[test]
    fn test_rejects_unaligned_chunk() {
        let result = StoreConfig::from_json(r#"{ "chunk_bytes": 1000 }"#);
        assert!(matches!(result, Err(EcsError::ConfigError(_))));
    }

    #[test]
    fn test_bad_json() {
        assert!(StoreConfig::from_json("{ not json").is_err());
    }
}
