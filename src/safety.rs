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

//! Runtime alias checks for component views
//!
//! Each component type has a borrow counter: positive values count live
//! read views, `-1` marks a live write view. A [`SafetyToken`] captures the
//! store's safety version when a view is made; bumping the version
//! invalidates every older view.

use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::component::{TypeIndex, TypeRegistry};
use crate::error::{EcsError, Result};

/// Per-type borrow counters
#[derive(Default)]
pub struct BorrowTable {
    flags: RwLock<FxHashMap<TypeIndex, Arc<AtomicIsize>>>,
}

impl BorrowTable {
    fn flag(&self, type_index: TypeIndex) -> Arc<AtomicIsize> {
        if let Some(flag) = self.flags.read().get(&type_index) {
            return Arc::clone(flag);
        }
        Arc::clone(self.flags.write().entry(type_index).or_default())
    }

    /// Shared borrow; fails while a write view of the type is live
    pub fn borrow_read(&self, type_index: TypeIndex) -> Result<BorrowGuard> {
        let state = self.flag(type_index);
        loop {
            let read = state.load(Ordering::SeqCst);
            if read < 0 {
                return Err(EcsError::SafetyViolation(format!(
                    "{} is already borrowed for writing",
                    TypeRegistry::name(type_index)
                )));
            }
            if state
                .compare_exchange(read, read + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(BorrowGuard {
                    state,
                    exclusive: false,
                });
            }
        }
    }

    /// Exclusive borrow; fails while any other view of the type is live
    pub fn borrow_write(&self, type_index: TypeIndex) -> Result<BorrowGuard> {
        let state = self.flag(type_index);
        match state.compare_exchange(0, -1, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => Ok(BorrowGuard {
                state,
                exclusive: true,
            }),
            Err(x) if x < 0 => Err(EcsError::SafetyViolation(format!(
                "{} is already borrowed for writing",
                TypeRegistry::name(type_index)
            ))),
            Err(_) => Err(EcsError::SafetyViolation(format!(
                "{} is already borrowed for reading",
                TypeRegistry::name(type_index)
            ))),
        }
    }

    /// Current counter value, for diagnostics
    pub fn state(&self, type_index: TypeIndex) -> isize {
        self.flags
            .read()
            .get(&type_index)
            .map_or(0, |flag| flag.load(Ordering::SeqCst))
    }
}

/// Releases its borrow on drop
#[derive(Debug)]
pub struct BorrowGuard {
    state: Arc<AtomicIsize>,
    exclusive: bool,
}

impl Drop for BorrowGuard {
    fn drop(&mut self) {
        if self.exclusive {
            self.state.store(0, Ordering::SeqCst);
        } else {
            self.state.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Store-wide safety version
#[derive(Debug, Default)]
pub struct SafetyVersion {
    version: AtomicU64,
}

impl SafetyVersion {
    pub fn current(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Invalidate every token issued so far
    pub fn bump(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    pub fn token(&self) -> SafetyToken {
        SafetyToken {
            version: self.current(),
        }
    }
}

/// Version captured when a view was created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyToken {
    version: u64,
}

impl SafetyToken {
    /// Fail if the store invalidated views since this token was taken
    #[inline]
    pub fn check(&self, current: &SafetyVersion) -> Result<()> {
        if self.version == current.current() {
            Ok(())
        } else {
            Err(EcsError::SafetyViolation(
                "view used after its arrays were invalidated".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readers_share_writer_excludes() -> Result<()> {
        let table = BorrowTable::default();
        let t = TypeIndex(9000);
        let a = table.borrow_read(t)?;
        let b = table.borrow_read(t)?;
        assert_eq!(table.state(t), 2);
        assert!(table.borrow_write(t).is_err());
        drop(a);
        drop(b);
        let w = table.borrow_write(t)?;
        assert!(table.borrow_read(t).is_err());
        assert!(table.borrow_write(t).is_err());
        drop(w);
        assert_eq!(table.state(t), 0);
        Ok(())
    }

    #[test]
    fn test_token_invalidated_by_bump() {
        let version = SafetyVersion::default();
        let token = version.token();
        assert!(token.check(&version).is_ok());
        version.bump();
        assert!(matches!(
            token.check(&version),
            Err(EcsError::SafetyViolation(_))
        ));
    }
}
