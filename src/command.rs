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

//! Structural command buffer: deferred, ordered, rollbackable mutations.
//!
//! Systems record structural changes here while the world is shared; the
//! scheduler plays queues back at batch barriers (`PostSim`) and at end of
//! frame (`EndFrame`). Playback validates every drained command first, then
//! applies non-deferred records followed by deferred destroys, and unwinds
//! the undo stack in strict reverse order if any apply fails.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::component::Component;
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::journal::{FailureInjection, TransactionPhase};
use crate::world::{EntitySnapshot, World};

/// Playback point a command is tagged for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPhase {
    /// Applied at batch barriers after simulation phases.
    PostSim = 0,
    /// Applied once per frame, after all phases (deferred destroys).
    EndFrame = 1,
}

/// Token for an entity whose creation is still queued.
///
/// Valid only within the commit epoch it was issued in; the epoch advances
/// when `EndFrame` playback completes, and stale tokens are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEntity {
    slot: u32,
    epoch: u64,
}

/// Target of a structural command: a live entity or a pending token.
#[derive(Debug, Clone, Copy)]
pub enum EntityRef {
    Live(Entity),
    Pending(PendingEntity),
}

impl From<Entity> for EntityRef {
    fn from(e: Entity) -> Self {
        EntityRef::Live(e)
    }
}

impl From<PendingEntity> for EntityRef {
    fn from(p: PendingEntity) -> Self {
        EntityRef::Pending(p)
    }
}

type PendingSlots = Mutex<Vec<Option<Entity>>>;

enum Target {
    Live(Entity),
    Pending { table: Arc<PendingSlots>, slot: usize },
}

enum ResolveState {
    Unresolved,
    Dead(Entity),
    Alive(Entity),
}

impl Target {
    fn resolve(&self) -> Option<Entity> {
        match self {
            Target::Live(e) => Some(*e),
            Target::Pending { table, slot } => table.lock().get(*slot).copied().flatten(),
        }
    }

    fn state(&self, world: &World) -> ResolveState {
        match self.resolve() {
            None => ResolveState::Unresolved,
            Some(e) if world.is_alive(e) => ResolveState::Alive(e),
            Some(e) => ResolveState::Dead(e),
        }
    }

    fn resolve_live(&self, world: &World) -> Result<Entity> {
        match self.state(world) {
            ResolveState::Alive(e) => Ok(e),
            _ => Err(EcsError::StructuralApply(
                "command target is not a live entity".into(),
            )),
        }
    }
}

trait StructuralCommand: Send {
    fn validate(&self, world: &World) -> Result<()>;
    fn apply(&mut self, world: &mut World) -> Result<()>;
    fn rollback(&mut self, world: &mut World);
    fn deferred(&self) -> bool {
        false
    }
}

// Validation for component commands: an unresolved pending target is fine —
// validation of a playback pass runs before any of its creates apply.
fn validate_component_target(target: &Target, world: &World) -> Result<()> {
    match target.state(world) {
        ResolveState::Dead(_) => Err(EcsError::Validation(
            "structural command targets a dead entity".into(),
        )),
        _ => Ok(()),
    }
}

struct CreateEntity {
    table: Arc<PendingSlots>,
    slot: usize,
    created: Option<Entity>,
}

impl StructuralCommand for CreateEntity {
    fn validate(&self, _world: &World) -> Result<()> {
        Ok(())
    }

    fn apply(&mut self, world: &mut World) -> Result<()> {
        let entity = world.create_entity();
        self.table.lock()[self.slot] = Some(entity);
        self.created = Some(entity);
        Ok(())
    }

    fn rollback(&mut self, world: &mut World) {
        if let Some(entity) = self.created.take() {
            world.destroy_entity(entity);
            self.table.lock()[self.slot] = None;
        }
    }
}

struct DestroyEntity {
    target: Target,
    snapshot: Option<EntitySnapshot>,
}

impl StructuralCommand for DestroyEntity {
    fn validate(&self, world: &World) -> Result<()> {
        match self.target.state(world) {
            ResolveState::Alive(_) => Ok(()),
            _ => Err(EcsError::Validation(
                "destroy targets a dead or unresolved entity".into(),
            )),
        }
    }

    fn apply(&mut self, world: &mut World) -> Result<()> {
        let entity = self.target.resolve_live(world)?;
        self.snapshot = Some(world.snapshot_entity(entity).ok_or_else(|| {
            EcsError::StructuralApply("failed to snapshot entity for destroy-undo".into())
        })?);
        world.destroy_entity(entity);
        Ok(())
    }

    fn rollback(&mut self, world: &mut World) {
        if let Some(snapshot) = self.snapshot.take() {
            if let Err(err) = world.restore_entity(&snapshot) {
                tracing::error!(category = err.category(), "destroy-undo failed to restore");
            }
        }
    }

    fn deferred(&self) -> bool {
        true
    }
}

struct EmplaceComponent<T: Component> {
    target: Target,
    value: Option<T>,
    prior: Option<T>,
}

impl<T: Component> StructuralCommand for EmplaceComponent<T> {
    fn validate(&self, world: &World) -> Result<()> {
        validate_component_target(&self.target, world)
    }

    fn apply(&mut self, world: &mut World) -> Result<()> {
        let entity = self.target.resolve_live(world)?;
        self.prior = world.get_component::<T>(entity).cloned();
        let value = self.value.take().ok_or_else(|| {
            EcsError::StructuralApply("component command applied twice".into())
        })?;
        world.emplace_component(entity, value)
    }

    fn rollback(&mut self, world: &mut World) {
        let Some(entity) = self.target.resolve() else {
            return;
        };
        let result = match self.prior.take() {
            Some(prior) => world.emplace_component(entity, prior),
            None => world.remove_component::<T>(entity).map(|_| ()),
        };
        if let Err(err) = result {
            tracing::error!(category = err.category(), "component rollback failed");
        }
    }
}

struct RemoveComponent<T: Component> {
    target: Target,
    prior: Option<T>,
}

impl<T: Component> StructuralCommand for RemoveComponent<T> {
    fn validate(&self, world: &World) -> Result<()> {
        validate_component_target(&self.target, world)
    }

    fn apply(&mut self, world: &mut World) -> Result<()> {
        let entity = self.target.resolve_live(world)?;
        self.prior = world.get_component::<T>(entity).cloned();
        world.remove_component::<T>(entity).map(|_| ())
    }

    fn rollback(&mut self, world: &mut World) {
        let Some(entity) = self.target.resolve() else {
            return;
        };
        if let Some(prior) = self.prior.take() {
            if let Err(err) = world.emplace_component(entity, prior) {
                tracing::error!(category = err.category(), "component rollback failed");
            }
        }
    }
}

struct Inner {
    queues: [Vec<Box<dyn StructuralCommand>>; 2],
    pending: Arc<PendingSlots>,
    epoch: u64,
    failure: Option<FailureInjection>,
}

/// Recorder of deferred structural mutations.
///
/// Enqueueing takes `&self` so each system can hold a shared handle; the
/// scheduler gives every system its own buffer and merges them in batch-slot
/// order, so command order stays deterministic.
pub struct StructuralCommandBuffer {
    inner: Mutex<Inner>,
}

impl StructuralCommandBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queues: [Vec::new(), Vec::new()],
                pending: Arc::new(Mutex::new(Vec::new())),
                epoch: 0,
                failure: None,
            }),
        }
    }

    /// Queue creation of a new entity; the returned token can target later
    /// commands within the same commit epoch.
    pub fn create_entity(&self) -> PendingEntity {
        let mut inner = self.inner.lock();
        let slot = {
            let mut pending = inner.pending.lock();
            pending.push(None);
            pending.len() - 1
        };
        let token = PendingEntity {
            slot: slot as u32,
            epoch: inner.epoch,
        };
        let command = CreateEntity {
            table: inner.pending.clone(),
            slot,
            created: None,
        };
        inner.queues[CommandPhase::PostSim as usize].push(Box::new(command));
        token
    }

    /// Queue a deferred destroy; rollback restores the full entity snapshot
    /// at its original generation.
    pub fn destroy_entity(&self, target: impl Into<EntityRef>) -> Result<()> {
        let mut inner = self.inner.lock();
        let target = Self::target_for(&inner, target.into())?;
        inner.queues[CommandPhase::EndFrame as usize].push(Box::new(DestroyEntity {
            target,
            snapshot: None,
        }));
        Ok(())
    }

    /// Queue add-or-overwrite of a component.
    pub fn emplace_component<T: Component>(
        &self,
        target: impl Into<EntityRef>,
        value: T,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let target = Self::target_for(&inner, target.into())?;
        inner.queues[CommandPhase::PostSim as usize].push(Box::new(EmplaceComponent {
            target,
            value: Some(value),
            prior: None,
        }));
        Ok(())
    }

    /// Queue overwrite of a component. Alias of [`Self::emplace_component`];
    /// both snapshot the prior value for rollback.
    pub fn set_component<T: Component>(
        &self,
        target: impl Into<EntityRef>,
        value: T,
    ) -> Result<()> {
        self.emplace_component(target, value)
    }

    /// Queue removal of a component.
    pub fn remove_component<T: Component>(&self, target: impl Into<EntityRef>) -> Result<()> {
        let mut inner = self.inner.lock();
        let target = Self::target_for(&inner, target.into())?;
        inner.queues[CommandPhase::PostSim as usize].push(Box::new(RemoveComponent::<T> {
            target,
            prior: None,
        }));
        Ok(())
    }

    fn target_for(inner: &Inner, entity_ref: EntityRef) -> Result<Target> {
        match entity_ref {
            EntityRef::Live(e) => Ok(Target::Live(e)),
            EntityRef::Pending(p) => {
                if p.epoch != inner.epoch {
                    return Err(EcsError::Validation(
                        "stale deferred entity token (commit epoch ended)".into(),
                    ));
                }
                Ok(Target::Pending {
                    table: inner.pending.clone(),
                    slot: p.slot as usize,
                })
            }
        }
    }

    pub fn set_failure_injection(&self, failure: Option<FailureInjection>) {
        self.inner.lock().failure = failure;
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queues.iter().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queues.iter().map(Vec::len).sum()
    }

    /// Move every queued command from `other` into this buffer, preserving
    /// phase tags and FIFO order. Pending-entity resolution travels with the
    /// commands.
    pub fn append_from(&self, other: &StructuralCommandBuffer) {
        let mut theirs = other.inner.lock();
        let mut ours = self.inner.lock();
        for phase in 0..ours.queues.len() {
            let drained = std::mem::take(&mut theirs.queues[phase]);
            ours.queues[phase].extend(drained);
        }
    }

    /// Drain and run the commands tagged for `phase`.
    ///
    /// All validations run before any apply; a validation failure leaves the
    /// world untouched. Apply failures (including injected ones) replay the
    /// undo stack in strict reverse order, clear the buffer, and re-raise.
    pub fn playback(&self, world: &mut World, phase: CommandPhase) -> Result<()> {
        let (mut drained, failure) = {
            let mut inner = self.inner.lock();
            (
                std::mem::take(&mut inner.queues[phase as usize]),
                inner.failure.clone(),
            )
        };

        if drained.is_empty() && failure.is_none() {
            if phase == CommandPhase::EndFrame {
                self.end_epoch();
            }
            return Ok(());
        }

        if let Some(f) = &failure {
            if f.fail_at_phase == Some(TransactionPhase::Prepare) {
                self.abort();
                return Err(EcsError::StructuralApply(
                    "injected prepare failure".into(),
                ));
            }
        }

        for command in &drained {
            command.validate(world)?;
        }

        if let Some(f) = &failure {
            if f.fail_at_phase == Some(TransactionPhase::Commit) {
                self.abort();
                return Err(EcsError::StructuralApply("injected commit failure".into()));
            }
        }

        // Non-deferred first, deferred (destroys) after, all on one undo
        // stack so a late failure unwinds the whole pass.
        let mut order: Vec<usize> = (0..drained.len())
            .filter(|&i| !drained[i].deferred())
            .collect();
        order.extend((0..drained.len()).filter(|&i| drained[i].deferred()));

        let mut applied: Vec<usize> = Vec::with_capacity(order.len());
        let mut failed: Option<EcsError> = None;
        for &idx in &order {
            if let Err(err) = drained[idx].apply(world) {
                failed = Some(err);
                break;
            }
            applied.push(idx);

            if let Some(f) = &failure {
                if f.fail_after_n_apply.is_some_and(|n| applied.len() >= n) {
                    failed = Some(EcsError::StructuralApply(format!(
                        "injected failure after {} applies",
                        applied.len()
                    )));
                    break;
                }
            }
        }

        if let Some(err) = failed {
            for &idx in applied.iter().rev() {
                drained[idx].rollback(world);
            }
            tracing::debug!(
                category = err.category(),
                commands = drained.len(),
                "structural playback rolled back"
            );
            self.abort();
            return Err(err);
        }

        tracing::trace!(commands = drained.len(), ?phase, "structural playback");
        if phase == CommandPhase::EndFrame {
            self.end_epoch();
        }
        Ok(())
    }

    // Close the commit epoch: outstanding pending tokens become stale.
    fn end_epoch(&self) {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        inner.pending.lock().clear();
    }

    // A failed playback aborts the whole frame transaction: queued commands
    // in every phase are dropped and the epoch closes.
    fn abort(&self) {
        let mut inner = self.inner.lock();
        for queue in &mut inner.queues {
            queue.clear();
        }
        inner.epoch += 1;
        inner.pending.lock().clear();
    }
}

impl Default for StructuralCommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}
