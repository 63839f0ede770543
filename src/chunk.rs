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

//! Fixed-size chunk buffers and the row-level data movement on them
//!
//! A chunk holds `capacity` rows of one archetype as packed columns; the
//! entity handle column sits at offset 0. Chunks live in a slotmap arena
//! and are linked into per-archetype lists by id, never by pointer.

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};

use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;

use crate::archetype::ArchetypeId;
use crate::component::TypeIndex;
use crate::config::CHUNK_ALIGN;
use crate::entity::Entity;

new_key_type! {
    /// Arena id of a chunk
    pub struct ChunkId;
}

/// Arena holding every chunk of a store
pub type ChunkArena = SlotMap<ChunkId, Chunk>;

/// Zeroed, 64-byte aligned heap block
pub struct ChunkBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is plain bytes owned by this value; shared access to
// the bytes is mediated by the store's borrow flags.
unsafe impl Send for ChunkBuffer {}
unsafe impl Sync for ChunkBuffer {}

impl ChunkBuffer {
    pub fn new(bytes: usize) -> Self {
        let layout = Layout::from_size_align(bytes.max(CHUNK_ALIGN), CHUNK_ALIGN)
            .unwrap_or_else(|_| panic!("invalid chunk size {bytes}"));
        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        Self { ptr, layout }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Drop for ChunkBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Placement of one type's column inside a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnLayout {
    pub type_index: TypeIndex,
    pub offset: usize,
    /// Bytes per row, 0 for tags and shared types
    pub size: usize,
}

/// Intrusive list links stored on each chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkLinks {
    pub prev: Option<ChunkId>,
    pub next: Option<ChunkId>,
}

/// Which of a chunk's two lists an operation refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    /// All chunks of the archetype
    Archetype,
    /// Chunks of the archetype with at least one free row
    EmptySlots,
}

/// One block of rows belonging to a single archetype
pub struct Chunk {
    pub(crate) archetype: ArchetypeId,
    pub(crate) count: usize,
    pub(crate) capacity: usize,
    pub(crate) links: ChunkLinks,
    pub(crate) slot_links: ChunkLinks,
    pub(crate) in_slot_list: bool,
    /// Shared value index per shared type of the archetype, 0 = default
    pub(crate) shared_values: SmallVec<[u32; 4]>,
    buffer: ChunkBuffer,
}

impl Chunk {
    pub fn new(archetype: ArchetypeId, capacity: usize, buffer: ChunkBuffer) -> Self {
        Self {
            archetype,
            count: 0,
            capacity,
            links: ChunkLinks::default(),
            slot_links: ChunkLinks::default(),
            in_slot_list: false,
            shared_values: SmallVec::new(),
            buffer,
        }
    }

    /// Give the buffer back, e.g. to the empty chunk pool
    pub fn into_buffer(self) -> ChunkBuffer {
        self.buffer
    }

    pub fn archetype(&self) -> ArchetypeId {
        self.archetype
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    pub fn shared_values(&self) -> &[u32] {
        &self.shared_values
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub(crate) fn data_ptr(&self) -> *mut u8 {
        self.buffer.as_ptr()
    }

    /// Pointer to the first row of the column at `offset`
    #[inline]
    pub(crate) fn column_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.buffer.len());
        // SAFETY: offsets come from the archetype layout that sized this buffer
        unsafe { self.buffer.as_ptr().add(offset) }
    }

    /// Live entity handles, in row order
    pub fn entities(&self) -> &[Entity] {
        // SAFETY: column 0 holds `capacity` entity handles, rows below `count`
        // are written
        unsafe { std::slice::from_raw_parts(self.data_ptr() as *const Entity, self.count) }
    }

    /// Entity handle at `row`
    #[inline]
    pub fn entity_at(&self, row: usize) -> Entity {
        assert!(row < self.count, "row {row} past chunk count {}", self.count);
        // SAFETY: bounds checked above
        unsafe { *(self.data_ptr() as *const Entity).add(row) }
    }

    pub(crate) fn links(&self, kind: ListKind) -> ChunkLinks {
        match kind {
            ListKind::Archetype => self.links,
            ListKind::EmptySlots => self.slot_links,
        }
    }

    fn links_mut(&mut self, kind: ListKind) -> &mut ChunkLinks {
        match kind {
            ListKind::Archetype => &mut self.links,
            ListKind::EmptySlots => &mut self.slot_links,
        }
    }
}

/// Head/tail of an intrusive chunk list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkList {
    pub head: Option<ChunkId>,
    pub tail: Option<ChunkId>,
    pub len: usize,
}

impl ChunkList {
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn push_back(&mut self, arena: &mut ChunkArena, id: ChunkId, kind: ListKind) {
        let old_tail = self.tail;
        *arena[id].links_mut(kind) = ChunkLinks {
            prev: old_tail,
            next: None,
        };
        match old_tail {
            Some(tail) => arena[tail].links_mut(kind).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    pub fn push_front(&mut self, arena: &mut ChunkArena, id: ChunkId, kind: ListKind) {
        let old_head = self.head;
        *arena[id].links_mut(kind) = ChunkLinks {
            prev: None,
            next: old_head,
        };
        match old_head {
            Some(head) => arena[head].links_mut(kind).prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.len += 1;
    }

    pub fn remove(&mut self, arena: &mut ChunkArena, id: ChunkId, kind: ListKind) {
        let ChunkLinks { prev, next } = arena[id].links(kind);
        match prev {
            Some(prev) => arena[prev].links_mut(kind).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => arena[next].links_mut(kind).prev = prev,
            None => self.tail = prev,
        }
        *arena[id].links_mut(kind) = ChunkLinks::default();
        self.len -= 1;
    }

    /// Ids from head to tail
    pub fn iter<'a>(&self, arena: &'a ChunkArena, kind: ListKind) -> ChunkListIter<'a> {
        ChunkListIter {
            arena,
            current: self.head,
            kind,
        }
    }
}

pub struct ChunkListIter<'a> {
    arena: &'a ChunkArena,
    current: Option<ChunkId>,
    kind: ListKind,
}

impl Iterator for ChunkListIter<'_> {
    type Item = ChunkId;

    fn next(&mut self) -> Option<ChunkId> {
        let id = self.current?;
        self.current = self.arena[id].links(self.kind).next;
        Some(id)
    }
}

// Row-level data movement. Callers guarantee rows are within capacity, the
// column layouts belong to the chunks' archetypes, and no view borrows the
// touched rows.

/// Zero `count` rows starting at `start` in every column but the entity one
///
/// # Safety
/// `start + count` must not exceed the chunk capacity.
pub(crate) unsafe fn zero_rows(chunk: &Chunk, columns: &[ColumnLayout], start: usize, count: usize) {
    for column in columns.iter().skip(1).filter(|c| c.size > 0) {
        ptr::write_bytes(
            chunk.column_ptr(column.offset + start * column.size),
            0,
            count * column.size,
        );
    }
}

/// Write entity handles for rows `[start, start + entities.len())`
///
/// # Safety
/// Rows must be within the chunk capacity.
pub(crate) unsafe fn write_entities(chunk: &Chunk, start: usize, entities: &[Entity]) {
    ptr::copy_nonoverlapping(
        entities.as_ptr(),
        (chunk.data_ptr() as *mut Entity).add(start),
        entities.len(),
    );
}

/// Copy one row between chunks of the same archetype, entity column included
///
/// # Safety
/// Both rows must be within capacity; `src`/`dst` rows must not alias.
pub(crate) unsafe fn copy_row(
    src: &Chunk,
    src_row: usize,
    dst: &Chunk,
    dst_row: usize,
    columns: &[ColumnLayout],
) {
    for column in columns.iter().filter(|c| c.size > 0) {
        ptr::copy_nonoverlapping(
            src.column_ptr(column.offset + src_row * column.size),
            dst.column_ptr(column.offset + dst_row * column.size),
            column.size,
        );
    }
}

/// Copy a row into a chunk of a different archetype
///
/// Types present in both layouts are copied, types only in `dst_columns` are
/// zeroed. Both layouts are sorted by type index.
///
/// # Safety
/// Both rows must be within capacity of their chunks.
pub(crate) unsafe fn convert_row(
    src: &Chunk,
    src_columns: &[ColumnLayout],
    src_row: usize,
    dst: &Chunk,
    dst_columns: &[ColumnLayout],
    dst_row: usize,
) {
    let mut s = 0;
    for column in dst_columns {
        while s < src_columns.len() && src_columns[s].type_index < column.type_index {
            s += 1;
        }
        if column.size == 0 {
            continue;
        }
        let dst_ptr = dst.column_ptr(column.offset + dst_row * column.size);
        if s < src_columns.len() && src_columns[s].type_index == column.type_index {
            let src_column = src_columns[s];
            ptr::copy_nonoverlapping(
                src.column_ptr(src_column.offset + src_row * src_column.size),
                dst_ptr,
                column.size,
            );
        } else {
            ptr::write_bytes(dst_ptr, 0, column.size);
        }
    }
}

/// Fill `count` rows from `dst_start` with copies of `src_row`, entity column excluded
///
/// # Safety
/// Rows must be within capacity; `src_row` must not fall in the target range
/// when `src` and `dst` are the same chunk.
pub(crate) unsafe fn replicate_row(
    src: &Chunk,
    src_row: usize,
    dst: &Chunk,
    dst_start: usize,
    count: usize,
    columns: &[ColumnLayout],
) {
    for column in columns.iter().skip(1).filter(|c| c.size > 0) {
        let from = src.column_ptr(column.offset + src_row * column.size);
        let to = dst.column_ptr(column.offset + dst_start * column.size);
        for i in 0..count {
            ptr::copy_nonoverlapping(from, to.add(i * column.size), column.size);
        }
    }
}

/// Move rows `[src_start, src_start + count)` to `dst_start` inside one chunk
///
/// # Safety
/// Both ranges must be within capacity; overlap is allowed.
pub(crate) unsafe fn move_rows_within(
    chunk: &Chunk,
    src_start: usize,
    dst_start: usize,
    count: usize,
    columns: &[ColumnLayout],
) {
    for column in columns.iter().filter(|c| c.size > 0) {
        ptr::copy(
            chunk.column_ptr(column.offset + src_start * column.size),
            chunk.column_ptr(column.offset + dst_start * column.size),
            count * column.size,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_chunk(arena: &mut ChunkArena) -> ChunkId {
        arena.insert(Chunk::new(ArchetypeId(0), 4, ChunkBuffer::new(256)))
    }

    #[test]
    fn test_buffer_is_aligned_and_zeroed() {
        let buffer = ChunkBuffer::new(1024);
        assert_eq!(buffer.as_ptr() as usize % CHUNK_ALIGN, 0);
        // SAFETY: 1024 bytes were allocated
        let bytes = unsafe { std::slice::from_raw_parts(buffer.as_ptr(), 1024) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_list_push_and_remove() {
        let mut arena = ChunkArena::with_key();
        let mut list = ChunkList::default();
        let a = new_chunk(&mut arena);
        let b = new_chunk(&mut arena);
        let c = new_chunk(&mut arena);
        list.push_back(&mut arena, a, ListKind::Archetype);
        list.push_back(&mut arena, b, ListKind::Archetype);
        list.push_front(&mut arena, c, ListKind::Archetype);
        let order: Vec<_> = list.iter(&arena, ListKind::Archetype).collect();
        assert_eq!(order, vec![c, a, b]);

        list.remove(&mut arena, a, ListKind::Archetype);
        let order: Vec<_> = list.iter(&arena, ListKind::Archetype).collect();
        assert_eq!(order, vec![c, b]);
        assert_eq!(list.len, 2);

        list.remove(&mut arena, c, ListKind::Archetype);
        list.remove(&mut arena, b, ListKind::Archetype);
        assert!(list.is_empty());
        assert_eq!(list.tail, None);
    }

    #[test]
    fn test_lists_are_independent() {
        let mut arena = ChunkArena::with_key();
        let mut all = ChunkList::default();
        let mut slots = ChunkList::default();
        let a = new_chunk(&mut arena);
        let b = new_chunk(&mut arena);
        all.push_back(&mut arena, a, ListKind::Archetype);
        all.push_back(&mut arena, b, ListKind::Archetype);
        slots.push_back(&mut arena, b, ListKind::EmptySlots);
        assert_eq!(slots.iter(&arena, ListKind::EmptySlots).collect::<Vec<_>>(), vec![b]);
        assert_eq!(all.iter(&arena, ListKind::Archetype).count(), 2);
    }

    #[test]
    fn test_convert_row_copies_shared_types_and_zeroes_new() {
        let mut arena = ChunkArena::with_key();
        let src_id = new_chunk(&mut arena);
        let dst_id = new_chunk(&mut arena);
        let src_columns = [
            ColumnLayout { type_index: TypeIndex(0), offset: 0, size: 8 },
            ColumnLayout { type_index: TypeIndex(3), offset: 32, size: 4 },
        ];
        let dst_columns = [
            ColumnLayout { type_index: TypeIndex(0), offset: 0, size: 8 },
            ColumnLayout { type_index: TypeIndex(3), offset: 32, size: 4 },
            ColumnLayout { type_index: TypeIndex(5), offset: 48, size: 4 },
        ];
        let (src, dst) = (&arena[src_id], &arena[dst_id]);
        unsafe {
            *(src.column_ptr(32) as *mut u32).add(1) = 77;
            *(dst.column_ptr(48) as *mut u32).add(2) = 99;
            convert_row(src, &src_columns, 1, dst, &dst_columns, 2);
            assert_eq!(*(dst.column_ptr(32) as *const u32).add(2), 77);
            assert_eq!(*(dst.column_ptr(48) as *const u32).add(2), 0);
        }
    }
}
