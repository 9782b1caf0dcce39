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

//! Query engine: typed tuple parameters over archetype chunks.
//!
//! Parameters are written as references — `(&Transform, &mut LocalToWorld,
//! Option<&RenderLayer>)` — and iterated with `each` (per row) or
//! `each_chunk` (per column slice). Mutable parameters are handed out as
//! [`Mut`] guards inside a [`WriteScope`]; the scope batches dirtiness and
//! publishes version bumps once per touched (chunk, component) pair when it
//! drops. A mutable grant that is never touched bumps nothing.

use std::cell::RefCell;
use std::marker::PhantomData;

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::archetype::{Archetype, Chunk};
use crate::component::{component_name, Component, ComponentTypeId, Residency};
use crate::component::component_type_id;
use crate::entity::Entity;
use crate::world::World;

/// One query argument in plan terms.
#[derive(Clone, Copy, Debug)]
pub struct PlanTerm {
    pub type_id: ComponentTypeId,
    pub mutable: bool,
    pub optional: bool,
    pub residency: Residency,
}

/// Per-archetype column lookup for one plan term.
#[derive(Clone, Copy, Debug)]
pub struct ColumnRemap {
    pub type_id: ComponentTypeId,
    pub column: u32,
    pub size: u32,
}

/// Cache key: required/optional terms in argument order plus exclusions.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct PlanKey {
    terms: SmallVec<[(ComponentTypeId, bool); 8]>,
    excluded: SmallVec<[ComponentTypeId; 4]>,
}

impl PlanKey {
    pub fn new(terms: &[PlanTerm], excluded: &[ComponentTypeId]) -> Self {
        let mut excluded: SmallVec<[ComponentTypeId; 4]> = excluded.iter().copied().collect();
        excluded.sort_unstable();
        Self {
            terms: terms.iter().map(|t| (t.type_id, t.optional)).collect(),
            excluded,
        }
    }
}

/// Cached match list: archetypes whose component set covers the required
/// terms and avoids the excluded ones, with per-term column remaps.
/// Extended incrementally as new archetypes materialize.
#[derive(Clone)]
pub struct QueryPlan {
    archetypes: Vec<u32>,
    remaps: Vec<SmallVec<[Option<ColumnRemap>; 8]>>,
    seen_archetypes: usize,
}

impl QueryPlan {
    pub(crate) fn build(
        terms: &[PlanTerm],
        excluded: &[ComponentTypeId],
        archetypes: &[Archetype],
    ) -> Self {
        let mut plan = Self {
            archetypes: Vec::new(),
            remaps: Vec::new(),
            seen_archetypes: 0,
        };
        plan.extend(terms, excluded, archetypes);
        plan
    }

    pub(crate) fn extend(
        &mut self,
        terms: &[PlanTerm],
        excluded: &[ComponentTypeId],
        archetypes: &[Archetype],
    ) {
        for (id, arch) in archetypes.iter().enumerate().skip(self.seen_archetypes) {
            if Self::matches(terms, excluded, arch) {
                self.archetypes.push(id as u32);
                self.remaps.push(
                    terms
                        .iter()
                        .map(|term| {
                            arch.column_index(term.type_id).map(|ci| ColumnRemap {
                                type_id: term.type_id,
                                column: ci as u32,
                                size: arch.meta(ci).size as u32,
                            })
                        })
                        .collect(),
                );
            }
        }
        self.seen_archetypes = archetypes.len();
    }

    fn matches(terms: &[PlanTerm], excluded: &[ComponentTypeId], arch: &Archetype) -> bool {
        // Cold components never participate in signature matching.
        if terms.iter().any(|t| t.residency == Residency::ColdSparse) {
            return false;
        }
        terms
            .iter()
            .all(|t| t.optional || arch.column_index(t.type_id).is_some())
            && excluded
                .iter()
                .all(|&x| arch.column_index(x).is_none())
    }

    pub(crate) fn archetypes(&self) -> &[u32] {
        &self.archetypes
    }

    pub(crate) fn remaps(&self, slot: usize) -> &[Option<ColumnRemap>] {
        &self.remaps[slot]
    }

    pub(crate) fn seen_archetypes(&self) -> usize {
        self.seen_archetypes
    }
}

/// (archetype, chunk, component) triple recorded by mutable access.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DirtyKey {
    pub archetype: u32,
    pub chunk: u32,
    pub component: ComponentTypeId,
}

/// Collector for mutation intents. Implemented by [`WriteScope`].
pub trait DirtySink {
    fn mark(&self, key: DirtyKey);
}

/// Bounded mutation interval. Mutable queries run inside one; version bumps
/// for all touched (chunk, component) pairs publish exactly once at drop.
pub struct WriteScope<'w> {
    world: &'w World,
    touched: RefCell<FxHashSet<DirtyKey>>,
}

impl<'w> WriteScope<'w> {
    pub(crate) fn new(world: &'w World) -> Self {
        Self {
            world,
            touched: RefCell::new(FxHashSet::default()),
        }
    }

    pub fn query<'s, Q: QueryParams<'s>>(&'s self) -> Query<'s, Q> {
        Query::new(self.world, Some(self as &dyn DirtySink))
    }

    pub fn world(&self) -> &'w World {
        self.world
    }
}

impl DirtySink for WriteScope<'_> {
    fn mark(&self, key: DirtyKey) {
        self.touched.borrow_mut().insert(key);
    }
}

impl Drop for WriteScope<'_> {
    fn drop(&mut self) {
        let touched = self.touched.get_mut();
        if touched.is_empty() {
            return;
        }

        let mut types: SmallVec<[ComponentTypeId; 8]> = SmallVec::new();
        for key in touched.iter() {
            self.world.bump_chunk_version(*key);
            if !types.contains(&key.component) {
                types.push(key.component);
            }
        }
        for &type_id in &types {
            self.world.bump_component_version(type_id);
        }
    }
}

/// Write guard for one component value.
///
/// Reading through `Deref` leaves versions untouched; `touch()` or any
/// mutable dereference records the dirty intent for the enclosing scope.
pub struct Mut<'a, T> {
    value: &'a mut T,
    sink: &'a dyn DirtySink,
    key: DirtyKey,
}

impl<'a, T> Mut<'a, T> {
    pub fn touch(&self) {
        self.sink.mark(self.key);
    }
}

impl<T> std::ops::Deref for Mut<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value
    }
}

impl<T> std::ops::DerefMut for Mut<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.sink.mark(self.key);
        self.value
    }
}

/// Write guard for one chunk column, handed out by `each_chunk`.
pub struct ColMut<'a, T> {
    base: *mut T,
    len: usize,
    sink: &'a dyn DirtySink,
    key: DirtyKey,
    _marker: PhantomData<&'a mut [T]>,
}

impl<'a, T> ColMut<'a, T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn touch(&self) {
        self.sink.mark(self.key);
    }

    pub fn as_slice(&self) -> &[T] {
        // Base/len come from a live chunk column prepared for this query.
        unsafe { std::slice::from_raw_parts(self.base, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.sink.mark(self.key);
        unsafe { std::slice::from_raw_parts_mut(self.base, self.len) }
    }
}

/// One query argument.
///
/// # Safety
/// `fetch`/`fetch_chunk` hand out references derived from raw column
/// pointers; implementations must only be driven by [`Query`], which
/// guarantees rows are in bounds and access rights were established.
pub unsafe trait QueryParam<'w> {
    type Item;
    type ChunkItem;
    type State;

    fn term() -> PlanTerm;

    /// # Safety
    /// `remap` must come from the plan entry for this chunk's archetype.
    unsafe fn prepare(
        chunk: &'w Chunk,
        remap: Option<ColumnRemap>,
        sink: Option<&'w dyn DirtySink>,
        location: (u32, u32),
    ) -> Self::State;

    /// # Safety
    /// `row < chunk.len()` for the chunk passed to `prepare`.
    unsafe fn fetch(state: &Self::State, row: usize) -> Self::Item;

    /// # Safety
    /// `len == chunk.len()` for the chunk passed to `prepare`.
    unsafe fn fetch_chunk(state: &Self::State, len: usize) -> Self::ChunkItem;
}

pub struct ReadState<T> {
    base: *const T,
}

pub struct MutState<'w, T> {
    base: *mut T,
    sink: &'w dyn DirtySink,
    key: DirtyKey,
}

unsafe impl<'w, T: Component> QueryParam<'w> for &'w T {
    type Item = &'w T;
    type ChunkItem = &'w [T];
    type State = ReadState<T>;

    fn term() -> PlanTerm {
        PlanTerm {
            type_id: component_type_id::<T>(),
            mutable: false,
            optional: false,
            residency: T::RESIDENCY,
        }
    }

    unsafe fn prepare(
        chunk: &'w Chunk,
        remap: Option<ColumnRemap>,
        _sink: Option<&'w dyn DirtySink>,
        _location: (u32, u32),
    ) -> Self::State {
        let remap = remap.expect("required query column missing from plan");
        ReadState {
            base: chunk.column(remap.column as usize).base_ptr() as *const T,
        }
    }

    unsafe fn fetch(state: &Self::State, row: usize) -> Self::Item {
        &*state.base.add(row)
    }

    unsafe fn fetch_chunk(state: &Self::State, len: usize) -> Self::ChunkItem {
        std::slice::from_raw_parts(state.base, len)
    }
}

unsafe impl<'w, T: Component> QueryParam<'w> for &'w mut T {
    type Item = Mut<'w, T>;
    type ChunkItem = ColMut<'w, T>;
    type State = MutState<'w, T>;

    fn term() -> PlanTerm {
        PlanTerm {
            type_id: component_type_id::<T>(),
            mutable: true,
            optional: false,
            residency: T::RESIDENCY,
        }
    }

    unsafe fn prepare(
        chunk: &'w Chunk,
        remap: Option<ColumnRemap>,
        sink: Option<&'w dyn DirtySink>,
        location: (u32, u32),
    ) -> Self::State {
        let remap = remap.expect("required query column missing from plan");
        let sink = sink.expect("mutable query parameters require a write scope");
        MutState {
            base: chunk.column(remap.column as usize).base_ptr() as *mut T,
            sink,
            key: DirtyKey {
                archetype: location.0,
                chunk: location.1,
                component: remap.type_id,
            },
        }
    }

    unsafe fn fetch(state: &Self::State, row: usize) -> Self::Item {
        Mut {
            value: &mut *state.base.add(row),
            sink: state.sink,
            key: state.key,
        }
    }

    unsafe fn fetch_chunk(state: &Self::State, len: usize) -> Self::ChunkItem {
        ColMut {
            base: state.base,
            len,
            sink: state.sink,
            key: state.key,
            _marker: PhantomData,
        }
    }
}

unsafe impl<'w, T: Component> QueryParam<'w> for Option<&'w T> {
    type Item = Option<&'w T>;
    type ChunkItem = Option<&'w [T]>;
    type State = Option<ReadState<T>>;

    fn term() -> PlanTerm {
        PlanTerm {
            type_id: component_type_id::<T>(),
            mutable: false,
            optional: true,
            residency: T::RESIDENCY,
        }
    }

    unsafe fn prepare(
        chunk: &'w Chunk,
        remap: Option<ColumnRemap>,
        _sink: Option<&'w dyn DirtySink>,
        _location: (u32, u32),
    ) -> Self::State {
        remap.map(|remap| ReadState {
            base: chunk.column(remap.column as usize).base_ptr() as *const T,
        })
    }

    unsafe fn fetch(state: &Self::State, row: usize) -> Self::Item {
        state.as_ref().map(|s| &*s.base.add(row))
    }

    unsafe fn fetch_chunk(state: &Self::State, len: usize) -> Self::ChunkItem {
        state
            .as_ref()
            .map(|s| std::slice::from_raw_parts(s.base, len))
    }
}

unsafe impl<'w, T: Component> QueryParam<'w> for Option<&'w mut T> {
    type Item = Option<Mut<'w, T>>;
    type ChunkItem = Option<ColMut<'w, T>>;
    type State = Option<MutState<'w, T>>;

    fn term() -> PlanTerm {
        PlanTerm {
            type_id: component_type_id::<T>(),
            mutable: true,
            optional: true,
            residency: T::RESIDENCY,
        }
    }

    unsafe fn prepare(
        chunk: &'w Chunk,
        remap: Option<ColumnRemap>,
        sink: Option<&'w dyn DirtySink>,
        location: (u32, u32),
    ) -> Self::State {
        let sink = sink.expect("mutable query parameters require a write scope");
        remap.map(|remap| MutState {
            base: chunk.column(remap.column as usize).base_ptr() as *mut T,
            sink,
            key: DirtyKey {
                archetype: location.0,
                chunk: location.1,
                component: remap.type_id,
            },
        })
    }

    unsafe fn fetch(state: &Self::State, row: usize) -> Self::Item {
        state.as_ref().map(|s| Mut {
            value: &mut *s.base.add(row),
            sink: s.sink,
            key: s.key,
        })
    }

    unsafe fn fetch_chunk(state: &Self::State, len: usize) -> Self::ChunkItem {
        state.as_ref().map(|s| ColMut {
            base: s.base,
            len,
            sink: s.sink,
            key: s.key,
            _marker: PhantomData,
        })
    }
}

/// Tuple of query arguments.
///
/// # Safety
/// See [`QueryParam`].
pub unsafe trait QueryParams<'w> {
    type Item;
    type ChunkItem;
    type State;

    fn collect_terms(out: &mut SmallVec<[PlanTerm; 8]>);

    /// # Safety
    /// `remaps` must be the plan entry for this chunk's archetype.
    unsafe fn prepare(
        chunk: &'w Chunk,
        remaps: &[Option<ColumnRemap>],
        sink: Option<&'w dyn DirtySink>,
        location: (u32, u32),
    ) -> Self::State;

    /// # Safety
    /// `row < chunk.len()` for the prepared chunk.
    unsafe fn fetch(state: &Self::State, row: usize) -> Self::Item;

    /// # Safety
    /// `len == chunk.len()` for the prepared chunk.
    unsafe fn fetch_chunk(state: &Self::State, len: usize) -> Self::ChunkItem;
}

macro_rules! impl_query_params {
    ($(($P:ident, $idx:tt)),+) => {
        unsafe impl<'w, $($P: QueryParam<'w>),+> QueryParams<'w> for ($($P,)+) {
            type Item = ($($P::Item,)+);
            type ChunkItem = ($($P::ChunkItem,)+);
            type State = ($($P::State,)+);

            fn collect_terms(out: &mut SmallVec<[PlanTerm; 8]>) {
                $(out.push($P::term());)+
            }

            unsafe fn prepare(
                chunk: &'w Chunk,
                remaps: &[Option<ColumnRemap>],
                sink: Option<&'w dyn DirtySink>,
                location: (u32, u32),
            ) -> Self::State {
                ($($P::prepare(chunk, remaps[$idx], sink, location),)+)
            }

            unsafe fn fetch(state: &Self::State, row: usize) -> Self::Item {
                ($($P::fetch(&state.$idx, row),)+)
            }

            unsafe fn fetch_chunk(state: &Self::State, len: usize) -> Self::ChunkItem {
                ($($P::fetch_chunk(&state.$idx, len),)+)
            }
        }
    };
}

impl_query_params!((A, 0));
impl_query_params!((A, 0), (B, 1));
impl_query_params!((A, 0), (B, 1), (C, 2));
impl_query_params!((A, 0), (B, 1), (C, 2), (D, 3));
impl_query_params!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4));
impl_query_params!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4), (F, 5));
impl_query_params!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4), (F, 5), (G, 6));
impl_query_params!(
    (A, 0),
    (B, 1),
    (C, 2),
    (D, 3),
    (E, 4),
    (F, 5),
    (G, 6),
    (H, 7)
);

/// A query over all archetypes matching the parameter tuple `Q`.
pub struct Query<'w, Q: QueryParams<'w>> {
    world: &'w World,
    sink: Option<&'w dyn DirtySink>,
    excluded: SmallVec<[ComponentTypeId; 4]>,
    _marker: PhantomData<Q>,
}

impl<'w, Q: QueryParams<'w>> Query<'w, Q> {
    pub(crate) fn new(world: &'w World, sink: Option<&'w dyn DirtySink>) -> Self {
        Self {
            world,
            sink,
            excluded: SmallVec::new(),
            _marker: PhantomData,
        }
    }

    /// Skip archetypes that contain `T`.
    pub fn exclude<T: Component>(mut self) -> Self {
        self.excluded.push(component_type_id::<T>());
        self
    }

    fn terms(&self) -> SmallVec<[PlanTerm; 8]> {
        let mut terms = SmallVec::new();
        Q::collect_terms(&mut terms);

        for (i, term) in terms.iter().enumerate() {
            debug_assert!(
                term.residency == Residency::HotArchetype,
                "cold component {} is direct-lookup only and cannot be queried",
                component_name(term.type_id)
            );
            if term.mutable {
                assert!(
                    self.sink.is_some(),
                    "mutable query parameters require a write scope"
                );
            }
            for other in &terms[..i] {
                assert!(
                    !(other.type_id == term.type_id && (other.mutable || term.mutable)),
                    "component {} appears twice in one query with mutable access",
                    component_name(term.type_id)
                );
            }
        }
        terms
    }

    /// Call `f` once per matching row.
    pub fn each(self, mut f: impl FnMut(Entity, Q::Item)) {
        let terms = self.terms();
        let plan = self.world.plan_for(&terms, &self.excluded);

        for (slot, &arch_id) in plan.archetypes().iter().enumerate() {
            let arch = &self.world.archetypes()[arch_id as usize];
            let remaps = plan.remaps(slot);
            for (chunk_idx, chunk) in arch.chunks().iter().enumerate() {
                if chunk.is_empty() {
                    continue;
                }
                // Plan entry matches this archetype; rows stay in bounds.
                let state =
                    unsafe { Q::prepare(chunk, remaps, self.sink, (arch_id, chunk_idx as u32)) };
                for row in 0..chunk.len() {
                    let entity = chunk.entities()[row];
                    let item = unsafe { Q::fetch(&state, row) };
                    f(entity, item);
                }
            }
        }
    }

    /// Call `f` once per matching chunk with whole-column access.
    ///
    /// Column views stay valid only until the next structural write, which
    /// the borrow on the world already enforces.
    pub fn each_chunk(self, mut f: impl FnMut(&'w [Entity], Q::ChunkItem)) {
        let terms = self.terms();
        let plan = self.world.plan_for(&terms, &self.excluded);

        for (slot, &arch_id) in plan.archetypes().iter().enumerate() {
            let arch = &self.world.archetypes()[arch_id as usize];
            let remaps = plan.remaps(slot);
            for (chunk_idx, chunk) in arch.chunks().iter().enumerate() {
                if chunk.is_empty() {
                    continue;
                }
                let state =
                    unsafe { Q::prepare(chunk, remaps, self.sink, (arch_id, chunk_idx as u32)) };
                let item = unsafe { Q::fetch_chunk(&state, chunk.len()) };
                f(chunk.entities(), item);
            }
        }
    }

    /// Number of matching rows.
    pub fn count(self) -> usize {
        let terms = self.terms();
        let plan = self.world.plan_for(&terms, &self.excluded);
        plan.archetypes()
            .iter()
            .map(|&id| self.world.archetypes()[id as usize].row_count())
            .sum()
    }
}
