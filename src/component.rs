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

//! Component trait, residency classification, and the process-wide type
//! registry.
//!
//! Every concrete component type gets one stable `u32` id for the lifetime
//! of the process, assigned on first use by an atomic interner. The registry
//! also records the erased operations (clone, insert) that entity snapshots
//! and destroy-undo need.

use std::any::{Any, TypeId};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::world::World;

/// Process-stable component type id.
pub type ComponentTypeId = u32;

/// Storage strategy for a component type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Chunked column inside the owning entity's archetype.
    HotArchetype,
    /// Single sparse map keyed by entity index; never part of query plans.
    ColdSparse,
}

/// Marker trait for component types.
///
/// Components must be `Clone` because the transactional command buffer
/// snapshots prior values for rollback; non-copyable components are rejected
/// here, at the type level, rather than at registration time.
pub trait Component: Clone + Send + Sync + 'static {
    const RESIDENCY: Residency = Residency::HotArchetype;
}

/// Owned, type-erased component value used by entity snapshots.
pub type ErasedValue = Box<dyn Any + Send + Sync>;

/// Erased per-type operations registered alongside the id.
#[derive(Clone, Copy)]
pub(crate) struct ComponentOps {
    /// Clone the value behind a raw column pointer into an owned box.
    pub clone_from_ptr: unsafe fn(*const u8) -> ErasedValue,
    /// Downcast-and-clone an erased value back onto an entity.
    pub insert_erased: fn(&mut World, Entity, &ErasedValue) -> Result<()>,
}

#[derive(Clone, Copy)]
pub(crate) struct ComponentInfo {
    pub id: ComponentTypeId,
    pub name: &'static str,
    pub size: usize,
    pub residency: Residency,
    pub drop_fn: Option<unsafe fn(*mut u8)>,
    pub ops: ComponentOps,
}

#[derive(Default)]
struct TypeRegistry {
    by_type: FxHashMap<TypeId, ComponentTypeId>,
    infos: Vec<ComponentInfo>,
}

static REGISTRY: Lazy<RwLock<TypeRegistry>> = Lazy::new(|| RwLock::new(TypeRegistry::default()));

unsafe fn drop_erased<T>(ptr: *mut u8) {
    std::ptr::drop_in_place(ptr as *mut T);
}

unsafe fn clone_erased<T: Component>(ptr: *const u8) -> ErasedValue {
    Box::new((*(ptr as *const T)).clone())
}

fn insert_erased<T: Component>(world: &mut World, entity: Entity, value: &ErasedValue) -> Result<()> {
    let value = value
        .downcast_ref::<T>()
        .ok_or(EcsError::ComponentNotFound)?
        .clone();
    world.emplace_component(entity, value)
}

/// Intern (or look up) the process-wide id for `T`.
pub fn component_type_id<T: Component>() -> ComponentTypeId {
    let key = TypeId::of::<T>();
    if let Some(&id) = REGISTRY.read().by_type.get(&key) {
        return id;
    }

    let mut registry = REGISTRY.write();
    if let Some(&id) = registry.by_type.get(&key) {
        return id;
    }

    let id = registry.infos.len() as ComponentTypeId;
    registry.infos.push(ComponentInfo {
        id,
        name: std::any::type_name::<T>(),
        size: std::mem::size_of::<T>(),
        residency: T::RESIDENCY,
        drop_fn: if std::mem::needs_drop::<T>() {
            Some(drop_erased::<T>)
        } else {
            None
        },
        ops: ComponentOps {
            clone_from_ptr: clone_erased::<T>,
            insert_erased: insert_erased::<T>,
        },
    });
    registry.by_type.insert(key, id);
    id
}

pub(crate) fn component_info(id: ComponentTypeId) -> Option<ComponentInfo> {
    REGISTRY.read().infos.get(id as usize).copied()
}

/// Human-readable name for a registered component type id.
pub fn component_name(id: ComponentTypeId) -> &'static str {
    component_info(id).map_or("<unregistered>", |info| info.name)
}
