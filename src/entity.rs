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

//! Entity handles and the generational registry.

use crate::error::{EcsError, Result};

/// Generational entity handle.
///
/// An `Entity` stays valid until the entity is destroyed; once the index is
/// recycled the stored generation no longer matches and every lookup fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Entity {
    pub index: u32,
    pub generation: u32,
}

/// Entity location in hot storage (archetype, chunk, row)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub archetype: u32,
    pub chunk: u32,
    pub row: u32,
}

impl EntityLocation {
    pub(crate) const DETACHED: EntityLocation = EntityLocation {
        archetype: u32::MAX,
        chunk: u32::MAX,
        row: u32::MAX,
    };
}

/// Index allocator with generation tracking and a free list.
///
/// Generations start at 1 so a zeroed `Entity` never matches a live record.
#[derive(Default)]
pub(crate) struct EntityRegistry {
    generations: Vec<u32>,
    alive: Vec<bool>,
    free: Vec<u32>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> Entity {
        if let Some(index) = self.free.pop() {
            self.alive[index as usize] = true;
            return Entity {
                index,
                generation: self.generations[index as usize],
            };
        }

        let index = self.generations.len() as u32;
        self.generations.push(1);
        self.alive.push(true);
        Entity {
            index,
            generation: 1,
        }
    }

    /// Release an entity. Returns false (and does nothing) for dead handles.
    pub fn release(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }

        self.alive[entity.index as usize] = false;
        self.generations[entity.index as usize] += 1;
        self.free.push(entity.index);
        true
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        let idx = entity.index as usize;
        idx < self.alive.len()
            && self.alive[idx]
            && self.generations[idx] == entity.generation
    }

    /// Resurrect an index at its pre-destroy generation.
    ///
    /// Only destroy-undo goes through here: the index must currently sit on
    /// the free list, and the restored handle must compare equal to the one
    /// captured before the destroy.
    pub fn revive_at(&mut self, index: u32, generation: u32) -> Result<Entity> {
        let idx = index as usize;
        if idx >= self.alive.len() || self.alive[idx] {
            return Err(EcsError::StructuralApply(format!(
                "cannot revive entity index {index}: slot is not free"
            )));
        }

        let Some(pos) = self.free.iter().position(|&i| i == index) else {
            return Err(EcsError::StructuralApply(format!(
                "cannot revive entity index {index}: not on the free list"
            )));
        };
        self.free.swap_remove(pos);

        self.generations[idx] = generation;
        self.alive[idx] = true;
        Ok(Entity { index, generation })
    }

    pub fn alive_count(&self) -> usize {
        self.alive.iter().filter(|&&a| a).count()
    }
}
