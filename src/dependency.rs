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

//! Job completion handles and per-component-type read/write fencing
//!
//! For every component type the tracker remembers the last writer and the
//! readers scheduled since. Readers of a type only wait for its writer;
//! writers wait for the writer and every reader.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::component::{AccessMode, ComponentType, TypeIndex, TypeRegistry};
use crate::error::{EcsError, Result};
use crate::safety::{BorrowTable, SafetyVersion};

/// Read fences kept per type before they are folded into one combined handle
pub const MAX_READ_FENCES: usize = 17;

struct Fence {
    done: Mutex<bool>,
    signal: Condvar,
}

#[derive(Clone, Default)]
enum HandleInner {
    #[default]
    Completed,
    Fence(Arc<Fence>),
    Combined(Arc<[JobHandle]>),
}

/// Completion handle for externally scheduled work
#[derive(Clone, Default)]
pub struct JobHandle {
    inner: HandleInner,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            HandleInner::Completed => write!(f, "JobHandle(completed)"),
            HandleInner::Fence(_) => write!(f, "JobHandle(done: {})", self.is_completed()),
            HandleInner::Combined(handles) => write!(f, "JobHandle(combined: {})", handles.len()),
        }
    }
}

impl JobHandle {
    /// Handle that is already satisfied
    pub fn completed() -> Self {
        Self::default()
    }

    /// Handle plus the completer the job signals when it finishes
    pub fn pending() -> (JobHandle, JobCompleter) {
        let fence = Arc::new(Fence {
            done: Mutex::new(false),
            signal: Condvar::new(),
        });
        (
            JobHandle {
                inner: HandleInner::Fence(Arc::clone(&fence)),
            },
            JobCompleter { fence: Some(fence) },
        )
    }

    pub fn is_completed(&self) -> bool {
        match &self.inner {
            HandleInner::Completed => true,
            HandleInner::Fence(fence) => *fence.done.lock(),
            HandleInner::Combined(handles) => handles.iter().all(JobHandle::is_completed),
        }
    }

    /// Block until the work behind this handle has finished
    pub fn complete(&self) {
        match &self.inner {
            HandleInner::Completed => {}
            HandleInner::Fence(fence) => {
                let mut done = fence.done.lock();
                while !*done {
                    fence.signal.wait(&mut done);
                }
            }
            HandleInner::Combined(handles) => handles.iter().for_each(JobHandle::complete),
        }
    }

    /// Handle satisfied once all of `handles` are
    pub fn combine(handles: &[JobHandle]) -> JobHandle {
        let mut pending: Vec<JobHandle> = Vec::with_capacity(handles.len());
        for handle in handles {
            match &handle.inner {
                HandleInner::Completed => {}
                HandleInner::Combined(inner) => pending.extend(
                    inner.iter().filter(|h| !h.is_completed()).cloned(),
                ),
                HandleInner::Fence(_) => {
                    if !handle.is_completed() {
                        pending.push(handle.clone());
                    }
                }
            }
        }
        match pending.len() {
            0 => JobHandle::completed(),
            1 => pending.remove(0),
            _ => JobHandle {
                inner: HandleInner::Combined(pending.into()),
            },
        }
    }

    /// Run `job` on the rayon pool once `dependency` completes
    #[cfg(feature = "parallel")]
    pub fn spawn<F>(dependency: JobHandle, job: F) -> JobHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let (handle, completer) = JobHandle::pending();
        rayon::spawn(move || {
            dependency.complete_on_worker();
            job();
            completer.complete();
        });
        handle
    }

    /// Scoped variant of [`spawn`](Self::spawn); the job may borrow from the scope
    #[cfg(feature = "parallel")]
    pub fn spawn_in<'s, F>(scope: &rayon::Scope<'s>, dependency: JobHandle, job: F) -> JobHandle
    where
        F: FnOnce() + Send + 's,
    {
        let (handle, completer) = JobHandle::pending();
        scope.spawn(move |_| {
            dependency.complete_on_worker();
            job();
            completer.complete();
        });
        handle
    }

    /// Wait from inside the pool, running other pending jobs meanwhile
    #[cfg(feature = "parallel")]
    fn complete_on_worker(&self) {
        while !self.is_completed() {
            match rayon::yield_now() {
                Some(rayon::Yield::Executed) => {}
                _ => std::thread::yield_now(),
            }
        }
    }
}

/// Signals a pending [`JobHandle`]; completes on drop so a panicking job
/// cannot leave waiters blocked forever
pub struct JobCompleter {
    fence: Option<Arc<Fence>>,
}

impl JobCompleter {
    pub fn complete(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        if let Some(fence) = self.fence.take() {
            *fence.done.lock() = true;
            fence.signal.notify_all();
        }
    }
}

impl Drop for JobCompleter {
    fn drop(&mut self) {
        self.signal();
    }
}

/// Read/write type sets of one consumer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentAccess {
    pub reads: SmallVec<[TypeIndex; 8]>,
    pub writes: SmallVec<[TypeIndex; 8]>,
}

impl ComponentAccess {
    /// Create empty access
    pub fn empty() -> Self {
        Self::default()
    }

    /// Split query types by access mode; subtractive types touch no data
    pub fn from_types(types: &[ComponentType]) -> Self {
        let mut access = Self::empty();
        for ty in types {
            match ty.access {
                AccessMode::ReadOnly => access.reads.push(ty.type_index),
                AccessMode::ReadWrite => access.writes.push(ty.type_index),
                AccessMode::Subtractive => {}
            }
        }
        access
    }

    /// Merge two accesses (union of all reads/writes)
    pub fn merge(&self, other: &ComponentAccess) -> ComponentAccess {
        let mut merged = self.clone();
        for read in &other.reads {
            if !merged.reads.contains(read) {
                merged.reads.push(*read);
            }
        }
        for write in &other.writes {
            if !merged.writes.contains(write) {
                merged.writes.push(*write);
            }
        }
        merged
    }

    /// Check if this access conflicts with another
    pub fn conflicts_with(&self, other: &ComponentAccess) -> bool {
        self.writes
            .iter()
            .any(|w| other.writes.contains(w) || other.reads.contains(w))
            || other.writes.iter().any(|w| self.reads.contains(w))
    }
}

#[derive(Default)]
struct TypeFences {
    write: JobHandle,
    reads: SmallVec<[JobHandle; 4]>,
}

impl TypeFences {
    fn prune(&mut self) {
        if self.write.is_completed() {
            self.write = JobHandle::completed();
        }
        self.reads.retain(|h| !h.is_completed());
    }
}

/// Tracks outstanding jobs per component type
#[derive(Default)]
pub struct DependencyTracker {
    fences: Mutex<FxHashMap<TypeIndex, TypeFences>>,
    safety: SafetyVersion,
    borrows: BorrowTable,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle a consumer must wait on before touching `reads`/`writes`
    pub fn get_dependency(&self, reads: &[TypeIndex], writes: &[TypeIndex]) -> JobHandle {
        let mut fences = self.fences.lock();
        let mut wait = Vec::new();
        for t in reads {
            if let Some(f) = fences.get_mut(t) {
                f.prune();
                wait.push(f.write.clone());
            }
        }
        for t in writes {
            if let Some(f) = fences.get_mut(t) {
                f.prune();
                wait.push(f.write.clone());
                wait.extend(f.reads.iter().cloned());
            }
        }
        JobHandle::combine(&wait)
    }

    /// Record `handle` as writer of `writes` and reader of `reads`
    pub fn add_dependency(
        &self,
        reads: &[TypeIndex],
        writes: &[TypeIndex],
        handle: JobHandle,
    ) -> JobHandle {
        if handle.is_completed() {
            return handle;
        }
        let mut fences = self.fences.lock();
        for t in writes {
            let f = fences.entry(*t).or_default();
            f.write = handle.clone();
            f.reads.clear();
        }
        for t in reads {
            let f = fences.entry(*t).or_default();
            f.prune();
            if f.reads.len() == MAX_READ_FENCES {
                let folded = JobHandle::combine(&f.reads);
                f.reads.clear();
                f.reads.push(folded);
            }
            f.reads.push(handle.clone());
        }
        tracing::trace!(reads = reads.len(), writes = writes.len(), "registered job dependency");
        handle
    }

    /// Same as [`get_dependency`](Self::get_dependency) for an access set
    pub fn get_dependency_for(&self, access: &ComponentAccess) -> JobHandle {
        self.get_dependency(&access.reads, &access.writes)
    }

    pub fn add_dependency_for(&self, access: &ComponentAccess, handle: JobHandle) -> JobHandle {
        self.add_dependency(&access.reads, &access.writes, handle)
    }

    /// Block until every conflicting job for these type sets has finished
    pub fn complete_dependency(&self, reads: &[TypeIndex], writes: &[TypeIndex]) {
        self.get_dependency(reads, writes).complete();
    }

    /// Wait for the writer of `type_index`, enough for reading it
    pub fn complete_write_dependency(&self, type_index: TypeIndex) {
        self.complete_dependency(&[type_index], &[]);
    }

    /// Wait for the writer and all readers of `type_index`, needed for writing it
    pub fn complete_read_and_write_dependency(&self, type_index: TypeIndex) {
        self.complete_dependency(&[], &[type_index]);
    }

    /// Whether any unfinished job still touches `type_index`
    pub fn has_pending(&self, type_index: TypeIndex) -> bool {
        self.fences
            .lock()
            .get(&type_index)
            .is_some_and(|f| !f.write.is_completed() || f.reads.iter().any(|h| !h.is_completed()))
    }

    /// Fails while an unfinished job writes `type_index`
    pub fn check_readable(&self, type_index: TypeIndex) -> Result<()> {
        let mut fences = self.fences.lock();
        match fences.get_mut(&type_index) {
            Some(f) => {
                f.prune();
                if f.write.is_completed() {
                    Ok(())
                } else {
                    Err(EcsError::SafetyViolation(format!(
                        "{} is written by an unfinished job; complete its dependency first",
                        TypeRegistry::name(type_index)
                    )))
                }
            }
            None => Ok(()),
        }
    }

    /// Fails while any unfinished job reads or writes `type_index`
    pub fn check_writable(&self, type_index: TypeIndex) -> Result<()> {
        self.check_readable(type_index)?;
        let mut fences = self.fences.lock();
        match fences.get_mut(&type_index) {
            Some(f) => {
                f.prune();
                if f.reads.is_empty() {
                    Ok(())
                } else {
                    Err(EcsError::SafetyViolation(format!(
                        "{} is read by an unfinished job; complete its dependency first",
                        TypeRegistry::name(type_index)
                    )))
                }
            }
            None => Ok(()),
        }
    }

    /// Wait for every tracked job, then invalidate all outstanding views
    pub fn complete_all_jobs_and_invalidate_arrays(&self) {
        let all: Vec<JobHandle> = {
            let mut fences = self.fences.lock();
            fences
                .drain()
                .flat_map(|(_, f)| std::iter::once(f.write).chain(f.reads))
                .collect()
        };
        JobHandle::combine(&all).complete();
        self.safety.bump();
    }

    pub fn safety(&self) -> &SafetyVersion {
        &self.safety
    }

    pub fn borrows(&self) -> &BorrowTable {
        &self.borrows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: TypeIndex = TypeIndex(1001);
    const B: TypeIndex = TypeIndex(1002);

    #[test]
    fn test_combine_skips_completed() {
        let (pending, completer) = JobHandle::pending();
        let combined = JobHandle::combine(&[JobHandle::completed(), pending.clone()]);
        assert!(!combined.is_completed());
        completer.complete();
        assert!(combined.is_completed());
        assert!(JobHandle::combine(&[]).is_completed());
    }

    #[test]
    fn test_dropped_completer_signals() {
        let (handle, completer) = JobHandle::pending();
        drop(completer);
        handle.complete();
        assert!(handle.is_completed());
    }

    #[test]
    fn test_reader_waits_for_writer() {
        let tracker = DependencyTracker::new();
        let (writer, finish_writer) = JobHandle::pending();
        tracker.add_dependency(&[], &[A], writer);

        let reader_dep = tracker.get_dependency(&[A], &[]);
        assert!(!reader_dep.is_completed());
        finish_writer.complete();
        assert!(reader_dep.is_completed());
    }

    #[test]
    fn test_readers_do_not_wait_for_readers() {
        let tracker = DependencyTracker::new();
        let (reader, _finish) = JobHandle::pending();
        tracker.add_dependency(&[A], &[], reader);
        assert!(tracker.get_dependency(&[A], &[]).is_completed());
        assert!(!tracker.get_dependency(&[], &[A]).is_completed());
        assert!(tracker.get_dependency(&[], &[B]).is_completed());
    }

    #[test]
    fn test_read_fences_fold_when_full() {
        let tracker = DependencyTracker::new();
        let mut completers = Vec::new();
        for _ in 0..(MAX_READ_FENCES * 2) {
            let (h, c) = JobHandle::pending();
            tracker.add_dependency(&[A], &[], h);
            completers.push(c);
        }
        let writer_dep = tracker.get_dependency(&[], &[A]);
        let last = completers.pop();
        completers.into_iter().for_each(JobCompleter::complete);
        assert!(!writer_dep.is_completed());
        drop(last);
        assert!(writer_dep.is_completed());
    }

    #[test]
    fn test_access_checks_follow_pending_jobs() {
        let tracker = DependencyTracker::new();
        let (reader, finish_reader) = JobHandle::pending();
        tracker.add_dependency(&[A], &[], reader);
        assert!(tracker.check_readable(A).is_ok());
        assert!(matches!(tracker.check_writable(A), Err(EcsError::SafetyViolation(_))));
        finish_reader.complete();
        assert!(tracker.check_writable(A).is_ok());

        let (writer, finish_writer) = JobHandle::pending();
        tracker.add_dependency(&[], &[B], writer);
        assert!(tracker.check_readable(B).is_err());
        assert!(tracker.check_writable(B).is_err());
        assert!(tracker.check_readable(A).is_ok());
        finish_writer.complete();
        assert!(tracker.check_readable(B).is_ok());
    }

    #[test]
    fn test_invalidate_bumps_version() {
        let tracker = DependencyTracker::new();
        let before = tracker.safety().current();
        let (h, c) = JobHandle::pending();
        tracker.add_dependency(&[A], &[B], h.clone());
        let waiter = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            c.complete();
        });
        tracker.complete_all_jobs_and_invalidate_arrays();
        assert!(h.is_completed());
        assert_ne!(tracker.safety().current(), before);
        waiter.join().unwrap();
    }

    #[test]
    fn test_access_conflicts() {
        let mut writer = ComponentAccess::empty();
        writer.writes.push(A);
        let mut reader = ComponentAccess::empty();
        reader.reads.push(A);
        let mut other = ComponentAccess::empty();
        other.reads.push(B);
        assert!(writer.conflicts_with(&reader));
        assert!(reader.conflicts_with(&writer));
        assert!(!reader.conflicts_with(&reader.clone()));
        assert!(!writer.conflicts_with(&other));
        assert_eq!(writer.merge(&other).reads.len(), 1);
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_spawned_reader_runs_after_writer() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let tracker = DependencyTracker::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let step = Arc::new(AtomicUsize::new(0));

        let (gate, open_gate) = JobHandle::pending();
        let log = Arc::clone(&order);
        let writer = JobHandle::spawn(gate, move || log.lock().push("writer"));
        tracker.add_dependency(&[], &[A], writer.clone());

        let dep = tracker.get_dependency(&[A], &[]);
        let log = Arc::clone(&order);
        let counter = Arc::clone(&step);
        let reader = JobHandle::spawn(dep, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            log.lock().push("reader");
        });
        tracker.add_dependency(&[A], &[], reader.clone());

        assert!(!reader.is_completed());
        open_gate.complete();
        reader.complete();
        assert!(writer.is_completed());
        assert_eq!(*order.lock(), vec!["writer", "reader"]);
        assert_eq!(step.load(Ordering::SeqCst), 1);
    }
}
