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

//! simframe - simulation runtime core for a real-time renderer
//!
//! Archetype-chunked ECS world, conflict-analyzed parallel system
//! scheduler, transactional structural command buffer, incremental render
//! extraction, and an SPSC staged snapshot ring for frame hand-off.

pub mod archetype;
pub mod assets;
pub mod command;
pub mod component;
pub mod components;
pub mod entity;
pub mod error;
pub mod extract;
pub mod frame;
pub mod journal;
pub mod query;
pub mod resources;
pub mod ring;
pub mod schedule;
pub mod simulation;
pub mod sparse;
pub mod systems;
pub mod world;

// Re-exports for convenience
pub use command::{CommandPhase, EntityRef, PendingEntity, StructuralCommandBuffer};
pub use component::{component_type_id, Component, ComponentTypeId, Residency};
pub use entity::{Entity, EntityLocation};
pub use error::{EcsError, Result};
pub use extract::{ExtractorState, RenderExtractor};
pub use frame::{DrawPacket, FrameInput, FrameSnapshot, MaterialBatch, RenderView};
pub use journal::{FailureInjection, JournalEntry, Transaction, TransactionPhase};
pub use query::{ColMut, Mut, Query, WriteScope};
pub use ring::{ReadTicket, SnapshotRing, WriteTicket};
pub use schedule::{Phase, SystemContext, SystemScheduler};
pub use simulation::Simulation;
pub use world::{EntitySnapshot, World};
