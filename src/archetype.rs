// Copyright 2025 the simframe developers
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

//! Archetype storage: fixed-capacity chunks of type-erased columns.
//!
//! An archetype owns every entity whose hot component set equals its
//! signature. Rows live in chunks of up to [`CHUNK_ROWS`] entries; each chunk
//! keeps a parallel entity array plus one byte column per component type and
//! a per-column change-version counter.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::component::ComponentTypeId;
use crate::entity::Entity;

/// Rows per chunk, sized for cache residency.
pub const CHUNK_ROWS: usize = 128;

/// Sorted set of hot component type ids.
pub type Signature = SmallVec<[ComponentTypeId; 8]>;

/// Per-column layout shared by all chunks of an archetype.
#[derive(Clone, Copy)]
pub(crate) struct ColumnMeta {
    pub type_id: ComponentTypeId,
    pub size: usize,
    pub drop_fn: Option<unsafe fn(*mut u8)>,
}

/// One component column of one chunk: raw value bytes plus the chunk
/// version bumped when a write scope touches any row of the column.
pub struct ChunkColumn {
    data: UnsafeCell<Vec<u8>>,
    version: AtomicU64,
}

// Columns are written through `&self` from query write scopes. Exclusive
// access is established externally: either the caller holds `&mut World`,
// or the scheduler placed the writing system in a conflict-free batch.
unsafe impl Send for ChunkColumn {}
unsafe impl Sync for ChunkColumn {}

impl ChunkColumn {
    fn new() -> Self {
        Self {
            data: UnsafeCell::new(Vec::new()),
            version: AtomicU64::new(0),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Base pointer of the column bytes.
    ///
    /// # Safety
    /// Caller must hold exclusive or scheduler-validated access and must not
    /// outlive the next structural change to this chunk.
    pub(crate) unsafe fn base_ptr(&self) -> *mut u8 {
        (*self.data.get()).as_mut_ptr()
    }

    /// Pointer to the value at `row`.
    ///
    /// # Safety
    /// `row` must hold an initialized value of this column's type.
    pub(crate) unsafe fn ptr_at(&self, row: usize, size: usize) -> *mut u8 {
        self.base_ptr().add(row * size)
    }

    /// Append one value by moving `size` raw bytes from `src`.
    ///
    /// # Safety
    /// `src` must point to a valid value whose ownership transfers here; the
    /// caller must forget or otherwise stop owning the source. Requires the
    /// exclusive-access contract of [`Self::base_ptr`].
    pub(crate) unsafe fn push_raw(&self, src: *const u8, size: usize) {
        let data = &mut *self.data.get();
        data.reserve(size);
        let len = data.len();
        std::ptr::copy_nonoverlapping(src, data.as_mut_ptr().add(len), size);
        data.set_len(len + size);
    }

    /// Swap-remove the value at `row`, optionally dropping it first.
    ///
    /// Pass `drop_fn = None` when the value's bytes were already moved out
    /// (archetype transition); pass the column's drop fn to destroy it.
    ///
    /// # Safety
    /// `row` must be in bounds; requires the exclusive-access contract.
    pub(crate) unsafe fn swap_remove(
        &self,
        row: usize,
        size: usize,
        drop_fn: Option<unsafe fn(*mut u8)>,
    ) {
        let data = &mut *self.data.get();
        debug_assert!(size == 0 || (row + 1) * size <= data.len());
        if size == 0 {
            return;
        }

        let base = data.as_mut_ptr();
        if let Some(drop_fn) = drop_fn {
            drop_fn(base.add(row * size));
        }

        let last = data.len() / size - 1;
        if row != last {
            std::ptr::copy_nonoverlapping(base.add(last * size), base.add(row * size), size);
        }
        data.set_len(last * size);
    }

    /// Drop every remaining value. Used when tearing a chunk down.
    ///
    /// # Safety
    /// Requires the exclusive-access contract; the column holds `len`
    /// initialized values of `size` bytes each.
    unsafe fn drop_all(&self, size: usize, drop_fn: Option<unsafe fn(*mut u8)>) {
        let data = &mut *self.data.get();
        if let Some(drop_fn) = drop_fn {
            if size > 0 {
                let count = data.len() / size;
                for i in 0..count {
                    drop_fn(data.as_mut_ptr().add(i * size));
                }
            }
        }
        data.clear();
    }
}

/// Fixed-capacity row partition of an archetype.
pub struct Chunk {
    entities: Vec<Entity>,
    columns: Vec<ChunkColumn>,
}

impl Chunk {
    fn new(column_count: usize) -> Self {
        Self {
            entities: Vec::new(),
            columns: (0..column_count).map(|_| ChunkColumn::new()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn column(&self, index: usize) -> &ChunkColumn {
        &self.columns[index]
    }
}

/// Storage for one hot component-set signature.
pub struct Archetype {
    signature: Signature,
    metas: Vec<ColumnMeta>,
    column_index: FxHashMap<ComponentTypeId, usize>,
    chunks: Vec<Chunk>,
}

impl Archetype {
    pub(crate) fn new(signature: Signature, metas: Vec<ColumnMeta>) -> Self {
        debug_assert_eq!(signature.len(), metas.len());
        let mut column_index = FxHashMap::default();
        for (idx, meta) in metas.iter().enumerate() {
            column_index.insert(meta.type_id, idx);
        }
        Self {
            signature,
            metas,
            column_index,
            chunks: Vec::new(),
        }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn column_index(&self, type_id: ComponentTypeId) -> Option<usize> {
        self.column_index.get(&type_id).copied()
    }

    pub(crate) fn meta(&self, column: usize) -> ColumnMeta {
        self.metas[column]
    }

    pub fn column_count(&self) -> usize {
        self.metas.len()
    }

    /// Total live rows across all chunks.
    pub fn row_count(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }

    /// Reserve a row for `entity` and return its (chunk, row) address.
    ///
    /// Only the entity slot is claimed here; every column of the chosen
    /// chunk must receive exactly one pushed value before the operation
    /// completes, which all call sites in `world.rs` guarantee.
    pub(crate) fn allocate_row(&mut self, entity: Entity) -> (u32, u32) {
        let chunk_idx = match self.chunks.iter().position(|c| c.len() < CHUNK_ROWS) {
            Some(idx) => idx,
            None => {
                self.chunks.push(Chunk::new(self.metas.len()));
                self.chunks.len() - 1
            }
        };

        let row = self.chunks[chunk_idx].entities.len();
        self.chunks[chunk_idx].entities.push(entity);
        (chunk_idx as u32, row as u32)
    }

    /// Swap-remove a row, dropping values for columns not listed in
    /// `moved_to`. Returns the entity swapped into the vacated row, if any.
    ///
    /// # Safety
    /// `(chunk, row)` must address a live row, and any column whose type is
    /// in `moved_to` must already have had its bytes moved out.
    pub(crate) unsafe fn remove_row_moved(
        &mut self,
        chunk: u32,
        row: u32,
        moved_to: &Signature,
    ) -> Option<Entity> {
        let chunk_ref = &mut self.chunks[chunk as usize];
        for (idx, meta) in self.metas.iter().enumerate() {
            let drop_fn = if moved_to.contains(&meta.type_id) {
                None
            } else {
                meta.drop_fn
            };
            chunk_ref.columns[idx].swap_remove(row as usize, meta.size, drop_fn);
        }

        chunk_ref.entities.swap_remove(row as usize);
        chunk_ref.entities.get(row as usize).copied()
    }

    /// Swap-remove a row, dropping every column value.
    ///
    /// # Safety
    /// `(chunk, row)` must address a live row.
    pub(crate) unsafe fn remove_row(&mut self, chunk: u32, row: u32) -> Option<Entity> {
        self.remove_row_moved(chunk, row, &Signature::new())
    }

    /// Drop empty trailing chunks. Interior chunks are never removed: stored
    /// entity locations index chunks by position.
    pub(crate) fn compact(&mut self) {
        while self.chunks.last().is_some_and(Chunk::is_empty) {
            self.chunks.pop();
        }
    }
}

impl Drop for Archetype {
    fn drop(&mut self) {
        for chunk in &mut self.chunks {
            for (idx, meta) in self.metas.iter().enumerate() {
                // Exclusive access: we hold `&mut self`.
                unsafe { chunk.columns[idx].drop_all(meta.size, meta.drop_fn) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn meta_of<T: crate::component::Component>() -> ColumnMeta {
        let id = crate::component::component_type_id::<T>();
        let info = crate::component::component_info(id).unwrap();
        ColumnMeta {
            type_id: id,
            size: info.size,
            drop_fn: info.drop_fn,
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Pos(f32, f32);
    impl crate::component::Component for Pos {}

    fn e(index: u32) -> Entity {
        Entity {
            index,
            generation: 1,
        }
    }

    #[test]
    fn rows_spill_into_new_chunks() {
        let meta = meta_of::<Pos>();
        let mut arch = Archetype::new(smallvec![meta.type_id], vec![meta]);

        for i in 0..(CHUNK_ROWS + 1) {
            let (chunk, row) = arch.allocate_row(e(i as u32));
            unsafe {
                let value = Pos(i as f32, 0.0);
                arch.chunks()[chunk as usize]
                    .column(0)
                    .push_raw(&value as *const Pos as *const u8, meta.size);
                std::mem::forget(value);
            }
            if i < CHUNK_ROWS {
                assert_eq!((chunk, row), (0, i as u32));
            } else {
                assert_eq!((chunk, row), (1, 0));
            }
        }

        assert_eq!(arch.chunks().len(), 2);
        assert_eq!(arch.row_count(), CHUNK_ROWS + 1);
    }

    #[test]
    fn swap_remove_reports_displaced_entity() {
        let meta = meta_of::<Pos>();
        let mut arch = Archetype::new(smallvec![meta.type_id], vec![meta]);

        for i in 0..3 {
            arch.allocate_row(e(i));
            unsafe {
                let value = Pos(i as f32, 0.0);
                arch.chunks()[0]
                    .column(0)
                    .push_raw(&value as *const Pos as *const u8, meta.size);
                std::mem::forget(value);
            }
        }

        let swapped = unsafe { arch.remove_row(0, 0) };
        assert_eq!(swapped, Some(e(2)));

        let ptr = unsafe { arch.chunks()[0].column(0).ptr_at(0, meta.size) };
        let moved = unsafe { &*(ptr as *const Pos) };
        assert_eq!(moved, &Pos(2.0, 0.0));
    }

    #[test]
    fn compact_drops_only_trailing_empty_chunks() {
        let meta = meta_of::<Pos>();
        let mut arch = Archetype::new(smallvec![meta.type_id], vec![meta]);
        for i in 0..(CHUNK_ROWS + 1) {
            let (chunk, _) = arch.allocate_row(e(i as u32));
            unsafe {
                let value = Pos(0.0, 0.0);
                arch.chunks()[chunk as usize]
                    .column(0)
                    .push_raw(&value as *const Pos as *const u8, meta.size);
            }
        }

        unsafe { arch.remove_row(1, 0) };
        arch.compact();
        assert_eq!(arch.chunks().len(), 1);
        assert_eq!(arch.row_count(), CHUNK_ROWS);
    }
}
