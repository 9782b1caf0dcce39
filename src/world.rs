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

//! World: entity registry, archetype storage, cold stores, change versions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::archetype::{Archetype, ColumnMeta, Signature};
use crate::component::{
    component_info, component_type_id, Component, ComponentTypeId, ErasedValue, Residency,
};
use crate::entity::{Entity, EntityLocation, EntityRegistry};
use crate::error::{EcsError, Result};
use crate::query::{DirtyKey, PlanKey, PlanTerm, Query, QueryParams, QueryPlan, WriteScope};
use crate::sparse::{ErasedSparseStore, SparseSet};

/// Serializable capture of one entity's components, keyed by type id.
///
/// Produced by [`World::snapshot_entity`] and consumed by destroy-undo;
/// restoring yields an entity alive at the original generation with
/// identical component values.
pub struct EntitySnapshot {
    entity: Entity,
    components: Vec<SnapshotComponent>,
}

struct SnapshotComponent {
    type_id: ComponentTypeId,
    value: ErasedValue,
    insert: fn(&mut World, Entity, &ErasedValue) -> Result<()>,
}

impl EntitySnapshot {
    pub fn entity(&self) -> Entity {
        self.entity
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    pub fn has_type(&self, type_id: ComponentTypeId) -> bool {
        self.components.iter().any(|c| c.type_id == type_id)
    }
}

/// Central simulation storage.
pub struct World {
    entities: EntityRegistry,
    /// Hot-storage address per entity index; valid only while alive.
    locations: Vec<EntityLocation>,
    archetypes: Vec<Archetype>,
    archetype_index: AHashMap<Signature, u32>,
    cold: AHashMap<ComponentTypeId, Box<dyn ErasedSparseStore>>,
    /// Global change version per component type id.
    versions: Vec<AtomicU64>,
    plan_cache: Mutex<AHashMap<PlanKey, Arc<QueryPlan>>>,
    reset_epoch: u64,
}

impl World {
    pub fn new() -> Self {
        let mut world = Self {
            entities: EntityRegistry::new(),
            locations: Vec::new(),
            archetypes: Vec::with_capacity(16),
            archetype_index: AHashMap::with_capacity(16),
            cold: AHashMap::new(),
            versions: Vec::new(),
            plan_cache: Mutex::new(AHashMap::with_capacity(32)),
            reset_epoch: 0,
        };
        world.bootstrap_empty_archetype();
        world
    }

    // The empty archetype sits at index 0 so every live entity always has a
    // hot-storage location, component set or not.
    fn bootstrap_empty_archetype(&mut self) {
        let empty = Signature::new();
        let id = self.get_or_create_archetype(&empty);
        debug_assert_eq!(id, 0);
    }

    // ---- entity lifecycle -------------------------------------------------

    pub fn create_entity(&mut self) -> Entity {
        let entity = self.entities.allocate();
        let idx = entity.index as usize;
        if self.locations.len() <= idx {
            self.locations.resize(idx + 1, EntityLocation::DETACHED);
        }

        let (chunk, row) = self.archetypes[0].allocate_row(entity);
        self.locations[idx] = EntityLocation {
            archetype: 0,
            chunk,
            row,
        };
        entity
    }

    /// Destroy an entity and erase all of its components.
    /// No-op (returns false) for stale handles.
    pub fn destroy_entity(&mut self, entity: Entity) -> bool {
        if !self.entities.is_alive(entity) {
            return false;
        }

        let loc = self.locations[entity.index as usize];
        let sig = self.archetypes[loc.archetype as usize].signature().clone();
        self.detach_hot_row(loc);
        for &type_id in &sig {
            self.bump_component_version(type_id);
        }

        for store in self.cold.values_mut() {
            store.erase(entity);
        }

        self.locations[entity.index as usize] = EntityLocation::DETACHED;
        self.entities.release(entity);
        true
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.alive_count()
    }

    pub fn location_of(&self, entity: Entity) -> Option<EntityLocation> {
        if self.entities.is_alive(entity) {
            Some(self.locations[entity.index as usize])
        } else {
            None
        }
    }

    // ---- components -------------------------------------------------------

    /// Add or overwrite a component on a live entity.
    ///
    /// Hot components may move the entity to a different archetype; cold
    /// components go straight into the sparse store.
    pub fn emplace_component<T: Component>(&mut self, entity: Entity, value: T) -> Result<()> {
        if !self.entities.is_alive(entity) {
            return Err(EcsError::StaleHandle);
        }

        let id = component_type_id::<T>();
        self.ensure_version_slot(id);

        match T::RESIDENCY {
            Residency::ColdSparse => {
                let store = self
                    .cold
                    .entry(id)
                    .or_insert_with(|| Box::new(SparseSet::<T>::new()));
                let set = store
                    .as_any_mut()
                    .downcast_mut::<SparseSet<T>>()
                    .expect("cold store registered under a different type");
                set.insert(entity, value);
                self.bump_component_version(id);
                Ok(())
            }
            Residency::HotArchetype => {
                let loc = self.locations[entity.index as usize];

                // Overwrite in place when the column already exists.
                {
                    let arch = &self.archetypes[loc.archetype as usize];
                    if let Some(ci) = arch.column_index(id) {
                        let meta = arch.meta(ci);
                        let column = arch.chunks()[loc.chunk as usize].column(ci);
                        // Exclusive access: `&mut self`.
                        unsafe {
                            let ptr = column.ptr_at(loc.row as usize, meta.size);
                            if let Some(drop_fn) = meta.drop_fn {
                                drop_fn(ptr);
                            }
                            std::ptr::write(ptr as *mut T, value);
                        }
                        column.bump_version();
                        self.bump_component_version(id);
                        return Ok(());
                    }
                }

                let mut sig = self.archetypes[loc.archetype as usize].signature().clone();
                sig.push(id);
                sig.sort_unstable();
                let dst = self.get_or_create_archetype(&sig);
                self.move_entity_to(entity, loc, dst, move |arch, chunk, _row| {
                    let ci = arch
                        .column_index(id)
                        .expect("destination archetype is missing the added column");
                    unsafe {
                        arch.chunks()[chunk as usize].column(ci).push_raw(
                            &value as *const T as *const u8,
                            std::mem::size_of::<T>(),
                        );
                    }
                    std::mem::forget(value);
                });
                self.bump_component_version(id);
                Ok(())
            }
        }
    }

    /// Remove a component. Returns `Ok(false)` when the entity never had it.
    pub fn remove_component<T: Component>(&mut self, entity: Entity) -> Result<bool> {
        if !self.entities.is_alive(entity) {
            return Err(EcsError::StaleHandle);
        }

        let id = component_type_id::<T>();
        match T::RESIDENCY {
            Residency::ColdSparse => {
                let removed = self
                    .cold
                    .get_mut(&id)
                    .and_then(|store| store.as_any_mut().downcast_mut::<SparseSet<T>>())
                    .and_then(|set| set.remove(entity))
                    .is_some();
                if removed {
                    self.bump_component_version(id);
                }
                Ok(removed)
            }
            Residency::HotArchetype => {
                let loc = self.locations[entity.index as usize];
                let sig = {
                    let arch = &self.archetypes[loc.archetype as usize];
                    if arch.column_index(id).is_none() {
                        return Ok(false);
                    }
                    let mut sig = arch.signature().clone();
                    sig.retain(|t| *t != id);
                    sig
                };

                let dst = self.get_or_create_archetype(&sig);
                self.move_entity_to(entity, loc, dst, |_, _, _| {});
                self.bump_component_version(id);
                Ok(true)
            }
        }
    }

    pub fn has_component<T: Component>(&self, entity: Entity) -> bool {
        if !self.entities.is_alive(entity) {
            return false;
        }
        let id = component_type_id::<T>();
        match T::RESIDENCY {
            Residency::ColdSparse => self
                .cold
                .get(&id)
                .is_some_and(|store| store.has_entity(entity)),
            Residency::HotArchetype => {
                let loc = self.locations[entity.index as usize];
                self.archetypes[loc.archetype as usize]
                    .column_index(id)
                    .is_some()
            }
        }
    }

    pub fn get_component<T: Component>(&self, entity: Entity) -> Option<&T> {
        if !self.entities.is_alive(entity) {
            return None;
        }
        let id = component_type_id::<T>();
        match T::RESIDENCY {
            Residency::ColdSparse => self
                .cold
                .get(&id)?
                .as_any()
                .downcast_ref::<SparseSet<T>>()?
                .get(entity),
            Residency::HotArchetype => {
                let loc = self.locations[entity.index as usize];
                let arch = self.archetypes.get(loc.archetype as usize)?;
                let ci = arch.column_index(id)?;
                let chunk = arch.chunks().get(loc.chunk as usize)?;
                // Row is live and typed as T; shared borrow of self.
                unsafe {
                    let ptr = chunk.column(ci).ptr_at(loc.row as usize, std::mem::size_of::<T>());
                    Some(&*(ptr as *const T))
                }
            }
        }
    }

    /// Mutable component access; bumps the chunk and global versions.
    pub fn get_component_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        if !self.entities.is_alive(entity) {
            return None;
        }
        let id = component_type_id::<T>();
        match T::RESIDENCY {
            Residency::ColdSparse => self
                .cold
                .get_mut(&id)?
                .as_any_mut()
                .downcast_mut::<SparseSet<T>>()?
                .get_mut(entity),
            Residency::HotArchetype => {
                let loc = self.locations[entity.index as usize];
                let ptr = {
                    let arch = self.archetypes.get(loc.archetype as usize)?;
                    let ci = arch.column_index(id)?;
                    let chunk = arch.chunks().get(loc.chunk as usize)?;
                    let column = chunk.column(ci);
                    column.bump_version();
                    unsafe { column.ptr_at(loc.row as usize, std::mem::size_of::<T>()) }
                };
                self.bump_component_version(id);
                // Exclusive access: `&mut self` for the returned lifetime.
                unsafe { Some(&mut *(ptr as *mut T)) }
            }
        }
    }

    // ---- snapshots --------------------------------------------------------

    /// Capture every present component of a live entity as owned clones.
    pub fn snapshot_entity(&self, entity: Entity) -> Option<EntitySnapshot> {
        if !self.entities.is_alive(entity) {
            return None;
        }

        let mut components = Vec::new();
        let loc = self.locations[entity.index as usize];
        let arch = &self.archetypes[loc.archetype as usize];
        for ci in 0..arch.column_count() {
            let meta = arch.meta(ci);
            let info = component_info(meta.type_id)?;
            // Row is live; shared borrow of self.
            let value = unsafe {
                let ptr = arch.chunks()[loc.chunk as usize]
                    .column(ci)
                    .ptr_at(loc.row as usize, meta.size);
                (info.ops.clone_from_ptr)(ptr)
            };
            components.push(SnapshotComponent {
                type_id: meta.type_id,
                value,
                insert: info.ops.insert_erased,
            });
        }

        for (&type_id, store) in &self.cold {
            if store.has_entity(entity) {
                let info = component_info(type_id)?;
                components.push(SnapshotComponent {
                    type_id,
                    value: store.clone_value(entity)?,
                    insert: info.ops.insert_erased,
                });
            }
        }

        Some(EntitySnapshot { entity, components })
    }

    /// Resurrect a destroyed entity at its original generation and restore
    /// its components. The snapshot stays usable afterwards.
    pub fn restore_entity(&mut self, snapshot: &EntitySnapshot) -> Result<Entity> {
        let entity = self
            .entities
            .revive_at(snapshot.entity.index, snapshot.entity.generation)?;

        let idx = entity.index as usize;
        if self.locations.len() <= idx {
            self.locations.resize(idx + 1, EntityLocation::DETACHED);
        }
        let (chunk, row) = self.archetypes[0].allocate_row(entity);
        self.locations[idx] = EntityLocation {
            archetype: 0,
            chunk,
            row,
        };

        for component in &snapshot.components {
            (component.insert)(self, entity, &component.value)?;
        }
        Ok(entity)
    }

    // ---- queries ----------------------------------------------------------

    /// Read-only query. Mutable parameters require [`World::write_scope`].
    pub fn query<'w, Q: QueryParams<'w>>(&'w self) -> Query<'w, Q> {
        Query::new(self, None)
    }

    /// Open a write scope for mutable queries. Version bumps for every
    /// touched (chunk, component) pair publish once, when the scope drops.
    pub fn write_scope(&self) -> WriteScope<'_> {
        WriteScope::new(self)
    }

    pub(crate) fn plan_for(
        &self,
        terms: &[PlanTerm],
        excluded: &[ComponentTypeId],
    ) -> Arc<QueryPlan> {
        let key = PlanKey::new(terms, excluded);
        let mut cache = self.plan_cache.lock();
        let plan = cache
            .entry(key)
            .or_insert_with(|| Arc::new(QueryPlan::build(terms, excluded, &self.archetypes)));
        if plan.seen_archetypes() < self.archetypes.len() {
            Arc::make_mut(plan).extend(terms, excluded, &self.archetypes);
        }
        plan.clone()
    }

    // ---- change versions --------------------------------------------------

    pub fn component_version(&self, type_id: ComponentTypeId) -> u64 {
        self.versions
            .get(type_id as usize)
            .map_or(0, |v| v.load(Ordering::Acquire))
    }

    pub fn chunk_version(
        &self,
        archetype: u32,
        chunk: u32,
        type_id: ComponentTypeId,
    ) -> Option<u64> {
        let arch = self.archetypes.get(archetype as usize)?;
        let ci = arch.column_index(type_id)?;
        Some(arch.chunks().get(chunk as usize)?.column(ci).version())
    }

    pub(crate) fn bump_component_version(&self, type_id: ComponentTypeId) {
        if let Some(v) = self.versions.get(type_id as usize) {
            v.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn bump_chunk_version(&self, key: DirtyKey) {
        if let Some(arch) = self.archetypes.get(key.archetype as usize) {
            if let Some(ci) = arch.column_index(key.component) {
                if let Some(chunk) = arch.chunks().get(key.chunk as usize) {
                    chunk.column(ci).bump_version();
                }
            }
        }
    }

    fn ensure_version_slot(&mut self, type_id: ComponentTypeId) {
        let needed = type_id as usize + 1;
        if self.versions.len() < needed {
            self.versions.resize_with(needed, AtomicU64::default);
        }
    }

    // ---- archetype management ---------------------------------------------

    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    pub fn archetype(&self, id: u32) -> Option<&Archetype> {
        self.archetypes.get(id as usize)
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    fn get_or_create_archetype(&mut self, signature: &Signature) -> u32 {
        if let Some(&id) = self.archetype_index.get(signature) {
            return id;
        }

        let metas: Vec<ColumnMeta> = signature
            .iter()
            .map(|&type_id| {
                let info =
                    component_info(type_id).expect("archetype signature of unregistered type");
                ColumnMeta {
                    type_id,
                    size: info.size,
                    drop_fn: info.drop_fn,
                }
            })
            .collect();

        self.archetypes
            .push(Archetype::new(signature.clone(), metas));
        let id = (self.archetypes.len() - 1) as u32;
        self.archetype_index.insert(signature.clone(), id);
        for &type_id in signature {
            self.ensure_version_slot(type_id);
        }
        id
    }

    fn detach_hot_row(&mut self, loc: EntityLocation) {
        let arch = &mut self.archetypes[loc.archetype as usize];
        // Row address comes from the location table and is live.
        let swapped = unsafe { arch.remove_row(loc.chunk, loc.row) };
        if let Some(swapped) = swapped {
            let slot = &mut self.locations[swapped.index as usize];
            slot.chunk = loc.chunk;
            slot.row = loc.row;
        }
    }

    /// Move an entity's row to another archetype, copying overlapping
    /// columns bytewise and letting `seed` push values for new columns.
    fn move_entity_to<F>(&mut self, entity: Entity, old: EntityLocation, dst_id: u32, seed: F)
    where
        F: FnOnce(&Archetype, u32, u32),
    {
        debug_assert_ne!(old.archetype, dst_id);
        let locations = &mut self.locations;
        let archetypes = &mut self.archetypes;

        let (src, dst) = if old.archetype < dst_id {
            let (left, right) = archetypes.split_at_mut(dst_id as usize);
            (&mut left[old.archetype as usize], &mut right[0])
        } else {
            let (left, right) = archetypes.split_at_mut(old.archetype as usize);
            (&mut right[0], &mut left[dst_id as usize])
        };

        let (dst_chunk, dst_row) = dst.allocate_row(entity);
        for ci in 0..dst.column_count() {
            let meta = dst.meta(ci);
            if let Some(sci) = src.column_index(meta.type_id) {
                // Ownership of the bytes transfers to the destination; the
                // source row is swap-removed with the moved columns skipped.
                unsafe {
                    let src_ptr = src.chunks()[old.chunk as usize]
                        .column(sci)
                        .ptr_at(old.row as usize, meta.size);
                    dst.chunks()[dst_chunk as usize]
                        .column(ci)
                        .push_raw(src_ptr, meta.size);
                }
            }
        }

        seed(&*dst, dst_chunk, dst_row);

        let dst_sig = dst.signature().clone();
        let swapped = unsafe { src.remove_row_moved(old.chunk, old.row, &dst_sig) };
        if let Some(swapped) = swapped {
            let slot = &mut locations[swapped.index as usize];
            slot.chunk = old.chunk;
            slot.row = old.row;
        }

        locations[entity.index as usize] = EntityLocation {
            archetype: dst_id,
            chunk: dst_chunk,
            row: dst_row,
        };
    }

    // ---- frame maintenance ------------------------------------------------

    /// Drop empty trailing chunks; called at end of frame.
    pub fn compact_chunks(&mut self) {
        for arch in &mut self.archetypes {
            arch.compact();
        }
    }

    /// Drop all entities, components, and cached plans. Bumps the reset
    /// epoch observed by the render extractor.
    pub fn clear(&mut self) {
        self.entities = EntityRegistry::new();
        self.locations.clear();
        self.archetypes.clear();
        self.archetype_index.clear();
        self.cold.clear();
        self.versions.clear();
        self.plan_cache.lock().clear();
        self.reset_epoch += 1;
        self.bootstrap_empty_archetype();
    }

    pub fn reset_epoch(&self) -> u64 {
        self.reset_epoch
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }
    impl Component for Position {}

    #[derive(Clone, Debug, PartialEq)]
    struct Velocity {
        x: f32,
    }
    impl Component for Velocity {}

    #[derive(Clone, Debug, PartialEq)]
    struct Label(String);
    impl Component for Label {
        const RESIDENCY: Residency = Residency::ColdSparse;
    }

    #[test]
    fn create_destroy_recycles_with_bumped_generation() {
        let mut world = World::new();
        let a = world.create_entity();
        assert!(world.is_alive(a));

        assert!(world.destroy_entity(a));
        assert!(!world.is_alive(a));
        assert!(!world.destroy_entity(a));

        let b = world.create_entity();
        assert_eq!(b.index, a.index);
        assert_eq!(b.generation, a.generation + 1);
        assert!(!world.is_alive(a));
    }

    #[test]
    fn emplace_moves_between_archetypes() {
        let mut world = World::new();
        let e = world.create_entity();
        world.emplace_component(e, Position { x: 1.0, y: 2.0 }).unwrap();
        world.emplace_component(e, Velocity { x: 3.0 }).unwrap();

        assert_eq!(
            world.get_component::<Position>(e),
            Some(&Position { x: 1.0, y: 2.0 })
        );
        assert_eq!(world.get_component::<Velocity>(e), Some(&Velocity { x: 3.0 }));

        // empty + {Position} + {Position, Velocity}
        assert_eq!(world.archetype_count(), 3);

        assert!(world.remove_component::<Velocity>(e).unwrap());
        assert!(!world.has_component::<Velocity>(e));
        assert_eq!(
            world.get_component::<Position>(e),
            Some(&Position { x: 1.0, y: 2.0 })
        );
        assert!(!world.remove_component::<Velocity>(e).unwrap());
    }

    #[test]
    fn swap_fixups_keep_locations_valid() {
        let mut world = World::new();
        let a = world.create_entity();
        let b = world.create_entity();
        let c = world.create_entity();
        for (i, &e) in [a, b, c].iter().enumerate() {
            world
                .emplace_component(e, Position { x: i as f32, y: 0.0 })
                .unwrap();
        }

        world.destroy_entity(a);
        assert_eq!(
            world.get_component::<Position>(c),
            Some(&Position { x: 2.0, y: 0.0 })
        );
        assert_eq!(
            world.get_component::<Position>(b),
            Some(&Position { x: 1.0, y: 0.0 })
        );
    }

    #[test]
    fn cold_components_bypass_archetypes() {
        let mut world = World::new();
        let e = world.create_entity();
        let before = world.archetype_count();
        world.emplace_component(e, Label("tag".into())).unwrap();
        assert_eq!(world.archetype_count(), before);
        assert_eq!(world.get_component::<Label>(e), Some(&Label("tag".into())));

        world.destroy_entity(e);
        let e2 = world.create_entity();
        assert_eq!(e2.index, e.index);
        assert!(world.get_component::<Label>(e2).is_none());
    }

    #[test]
    fn snapshot_restore_round_trip_preserves_generation() {
        let mut world = World::new();
        let e = world.create_entity();
        world.emplace_component(e, Position { x: 10.0, y: 0.0 }).unwrap();
        world.emplace_component(e, Label("named".into())).unwrap();

        let snap = world.snapshot_entity(e).unwrap();
        assert_eq!(snap.component_count(), 2);

        world.destroy_entity(e);
        assert!(!world.is_alive(e));

        let restored = world.restore_entity(&snap).unwrap();
        assert_eq!(restored, e);
        assert!(world.is_alive(e));
        assert_eq!(
            world.get_component::<Position>(e),
            Some(&Position { x: 10.0, y: 0.0 })
        );
        assert_eq!(world.get_component::<Label>(e), Some(&Label("named".into())));
    }

    #[test]
    fn direct_mutation_bumps_versions() {
        let mut world = World::new();
        let e = world.create_entity();
        world.emplace_component(e, Position { x: 0.0, y: 0.0 }).unwrap();

        let id = component_type_id::<Position>();
        let before = world.component_version(id);
        world.get_component_mut::<Position>(e).unwrap().x = 5.0;
        assert_eq!(world.component_version(id), before + 1);
    }

    #[test]
    fn clear_bumps_reset_epoch() {
        let mut world = World::new();
        let e = world.create_entity();
        world.emplace_component(e, Position { x: 0.0, y: 0.0 }).unwrap();
        let epoch = world.reset_epoch();

        world.clear();
        assert_eq!(world.reset_epoch(), epoch + 1);
        assert_eq!(world.entity_count(), 0);
        assert_eq!(world.archetype_count(), 1);
    }
}
