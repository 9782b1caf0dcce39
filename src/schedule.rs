//! System scheduler: conflict-free batches executed across striped workers.
//!
//! Systems register with a phase, declared component access, and a
//! structural-write flag. Within a phase they are partitioned by greedy
//! first-fit into batches of mutually non-conflicting systems; batches run
//! sequentially with a command-buffer flush at each barrier, systems within
//! a batch run concurrently, striped round-robin over at most
//! `min(max_worker_threads, batch_len)` OS threads. No work stealing.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::command::{CommandPhase, StructuralCommandBuffer};
use crate::component::{component_name, Component, ComponentTypeId, Residency};
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::frame::FrameInput;
use crate::query::{PlanTerm, Query, QueryParams, WriteScope};
use crate::world::World;

/// Coarse frame phases with synchronous barriers between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PreSim,
    Sim,
    PostSim,
}

const PHASES: [Phase; 3] = [Phase::PreSim, Phase::Sim, Phase::PostSim];

/// World access handed to a running system.
///
/// Queries run against the shared world under the system's write scope;
/// structural changes go through the per-system command buffer. With debug
/// access validation on, any hot component touched outside the declared
/// read/write sets fails with an access violation. Cold components bypass
/// the check and are reachable by direct lookup only.
pub struct SystemContext<'a> {
    world: &'a World,
    commands: &'a StructuralCommandBuffer,
    scope: WriteScope<'a>,
    name: &'a str,
    reads: &'a FxHashSet<ComponentTypeId>,
    writes: &'a FxHashSet<ComponentTypeId>,
    validate_access: bool,
}

impl<'a> SystemContext<'a> {
    fn new(world: &'a World, commands: &'a StructuralCommandBuffer, desc: &'a SystemDesc, validate_access: bool) -> Self {
        Self {
            world,
            commands,
            scope: world.write_scope(),
            name: &desc.name,
            reads: &desc.reads,
            writes: &desc.writes,
            validate_access,
        }
    }

    /// Query under this system's write scope and access declaration.
    pub fn query<'s, Q: QueryParams<'s>>(&'s self) -> Result<Query<'s, Q>> {
        if self.validate_access {
            let mut terms: SmallVec<[PlanTerm; 8]> = SmallVec::new();
            Q::collect_terms(&mut terms);
            for term in &terms {
                if term.residency == Residency::ColdSparse {
                    continue;
                }
                let allowed = if term.mutable {
                    self.writes.contains(&term.type_id)
                } else {
                    self.reads.contains(&term.type_id) || self.writes.contains(&term.type_id)
                };
                if !allowed {
                    return Err(EcsError::AccessViolation {
                        system: self.name.to_string(),
                        component: component_name(term.type_id),
                    });
                }
            }
        }
        Ok(self.scope.query::<Q>())
    }

    /// Per-system structural command buffer, flushed at the batch barrier.
    pub fn commands(&self) -> &StructuralCommandBuffer {
        self.commands
    }

    /// Direct read of a cold component; exempt from access validation.
    pub fn cold<T: Component>(&self, entity: Entity) -> Option<&T> {
        debug_assert!(
            T::RESIDENCY == Residency::ColdSparse,
            "cold() is reserved for ColdSparse components"
        );
        self.world.get_component::<T>(entity)
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.world.is_alive(entity)
    }
}

type SystemFn =
    Box<dyn Fn(&mut SystemContext<'_>, &FrameInput) -> Result<()> + Send + Sync>;

struct SystemDesc {
    name: String,
    phase: Phase,
    reads: FxHashSet<ComponentTypeId>,
    writes: FxHashSet<ComponentTypeId>,
    structural: bool,
    run: SystemFn,
}

fn conflicts(a: &SystemDesc, b: &SystemDesc) -> bool {
    if a.structural && b.structural {
        return true;
    }
    let shared = |lhs: &FxHashSet<ComponentTypeId>, rhs: &FxHashSet<ComponentTypeId>| {
        lhs.iter().any(|t| rhs.contains(t))
    };
    shared(&a.writes, &b.writes) || shared(&a.writes, &b.reads) || shared(&a.reads, &b.writes)
}

/// Phase scheduler with deterministic batch partitioning.
pub struct SystemScheduler {
    systems: Vec<SystemDesc>,
    /// Cached batch plan per phase; rebuilt when the system set changes.
    batches: Option<Vec<Vec<Vec<usize>>>>,
    max_workers: usize,
    debug_access: bool,
}

impl SystemScheduler {
    pub fn new() -> Self {
        Self {
            systems: Vec::new(),
            batches: None,
            max_workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            debug_access: false,
        }
    }

    /// Register a system. Registration order fixes batch partitioning and
    /// command-buffer merge order.
    pub fn add_system(
        &mut self,
        name: impl Into<String>,
        phase: Phase,
        reads: &[ComponentTypeId],
        writes: &[ComponentTypeId],
        structural_writes: bool,
        run: impl Fn(&mut SystemContext<'_>, &FrameInput) -> Result<()> + Send + Sync + 'static,
    ) {
        self.systems.push(SystemDesc {
            name: name.into(),
            phase,
            reads: reads.iter().copied().collect(),
            writes: writes.iter().copied().collect(),
            structural: structural_writes,
            run: Box::new(run),
        });
        self.batches = None;
    }

    pub fn set_max_worker_threads(&mut self, workers: usize) {
        self.max_workers = workers.max(1);
    }

    /// Fail any query whose components were not declared (hot types only).
    pub fn set_debug_access_validation(&mut self, on: bool) {
        self.debug_access = on;
    }

    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    /// Batch plan for a phase, as system names. Deterministic in
    /// registration order; mainly for tests and diagnostics.
    pub fn batch_plan(&mut self, phase: Phase) -> Vec<Vec<String>> {
        self.ensure_batches();
        let phase_idx = PHASES.iter().position(|&p| p == phase).unwrap_or(0);
        self.batches.as_ref().map_or_else(Vec::new, |all| {
            all[phase_idx]
                .iter()
                .map(|batch| {
                    batch
                        .iter()
                        .map(|&idx| self.systems[idx].name.clone())
                        .collect()
                })
                .collect()
        })
    }

    /// Run one frame: PreSim, Sim, PostSim with batch barriers.
    ///
    /// Each batch's per-system command buffers merge into `commands` in
    /// ascending slot order, and the PostSim queue replays at the barrier.
    /// A system error aborts the frame; no further batches execute.
    pub fn run_frame(
        &mut self,
        world: &mut World,
        commands: &StructuralCommandBuffer,
        frame: &FrameInput,
    ) -> Result<()> {
        self.ensure_batches();
        let batches = self.batches.clone().unwrap_or_default();

        for (phase_idx, _phase) in PHASES.iter().enumerate() {
            for batch in &batches[phase_idx] {
                self.execute_batch(world, commands, frame, batch)?;
            }
        }
        Ok(())
    }

    fn ensure_batches(&mut self) {
        if self.batches.is_some() {
            return;
        }

        let mut all = Vec::with_capacity(PHASES.len());
        for phase in PHASES {
            let mut batches: Vec<Vec<usize>> = Vec::new();
            for (idx, desc) in self.systems.iter().enumerate() {
                if desc.phase != phase {
                    continue;
                }
                let placed = batches.iter_mut().find(|batch| {
                    batch
                        .iter()
                        .all(|&other| !conflicts(&self.systems[other], desc))
                });
                match placed {
                    Some(batch) => batch.push(idx),
                    None => batches.push(vec![idx]),
                }
            }
            tracing::debug!(?phase, batches = batches.len(), "batch plan built");
            all.push(batches);
        }
        self.batches = Some(all);
    }

    fn execute_batch(
        &self,
        world: &mut World,
        commands: &StructuralCommandBuffer,
        frame: &FrameInput,
        batch: &[usize],
    ) -> Result<()> {
        let workers = self.max_workers.min(batch.len()).max(1);
        let buffers: Vec<StructuralCommandBuffer> = if workers <= 1 {
            let mut buffers = Vec::with_capacity(batch.len());
            for &idx in batch {
                buffers.push(self.run_system(world, &self.systems[idx], frame)?);
            }
            buffers
        } else {
            self.run_batch_striped(world, frame, batch, workers)?
        };

        // Barrier: merge in ascending batch-slot order, then flush every
        // structural mutation this batch emitted.
        for buffer in &buffers {
            commands.append_from(buffer);
        }
        commands.playback(world, CommandPhase::PostSim)
    }

    fn run_batch_striped(
        &self,
        world: &World,
        frame: &FrameInput,
        batch: &[usize],
        workers: usize,
    ) -> Result<Vec<StructuralCommandBuffer>> {
        let systems = &self.systems;
        let scheduler = self;

        let mut slots: Vec<Option<StructuralCommandBuffer>> =
            (0..batch.len()).map(|_| None).collect();
        let mut first_err: Option<EcsError> = None;

        std::thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    s.spawn(move || -> Result<Vec<(usize, StructuralCommandBuffer)>> {
                        let mut out = Vec::new();
                        let mut slot = worker;
                        while slot < batch.len() {
                            let desc = &systems[batch[slot]];
                            out.push((slot, scheduler.run_system(world, desc, frame)?));
                            slot += workers;
                        }
                        Ok(out)
                    })
                })
                .collect();

            for handle in handles {
                match handle.join() {
                    Ok(Ok(list)) => {
                        for (slot, buffer) in list {
                            slots[slot] = Some(buffer);
                        }
                    }
                    Ok(Err(err)) => {
                        if first_err.is_none() {
                            first_err = Some(err);
                        }
                    }
                    Err(_) => {
                        if first_err.is_none() {
                            first_err = Some(EcsError::StructuralApply(
                                "system worker panicked".into(),
                            ));
                        }
                    }
                }
            }
        });

        if let Some(err) = first_err {
            return Err(err);
        }
        Ok(slots
            .into_iter()
            .map(|slot| slot.expect("every batch slot ran"))
            .collect())
    }

    // Systems run against the shared world. Data-parallel safety holds
    // because batch members have disjoint declared access (checked by the
    // conflict predicate) and structural changes only flow through the
    // per-system command buffers until the barrier.
    fn run_system(
        &self,
        world: &World,
        desc: &SystemDesc,
        frame: &FrameInput,
    ) -> Result<StructuralCommandBuffer> {
        let buffer = StructuralCommandBuffer::new();
        {
            let mut ctx = SystemContext::new(world, &buffer, desc, self.debug_access);
            (desc.run)(&mut ctx, frame)?;
            // ctx drops here; the write scope publishes its version bumps.
        }
        Ok(buffer)
    }
}

impl Default for SystemScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::component_type_id;

    #[derive(Clone, Debug, PartialEq)]
    struct A(u32);
    impl Component for A {}

    #[derive(Clone, Debug, PartialEq)]
    struct B(u32);
    impl Component for B {}

    #[test]
    fn greedy_first_fit_is_deterministic() {
        let a = component_type_id::<A>();
        let b = component_type_id::<B>();

        let mut scheduler = SystemScheduler::new();
        scheduler.add_system("writes_a", Phase::Sim, &[], &[a], false, |_, _| Ok(()));
        scheduler.add_system("reads_a", Phase::Sim, &[a], &[], false, |_, _| Ok(()));
        scheduler.add_system("writes_b", Phase::Sim, &[], &[b], false, |_, _| Ok(()));
        scheduler.add_system("reads_b", Phase::Sim, &[b], &[], false, |_, _| Ok(()));

        let plan = scheduler.batch_plan(Phase::Sim);
        assert_eq!(
            plan,
            vec![
                vec!["writes_a".to_string(), "writes_b".to_string()],
                vec!["reads_a".to_string(), "reads_b".to_string()],
            ]
        );
    }

    #[test]
    fn structural_systems_never_share_a_batch() {
        let mut scheduler = SystemScheduler::new();
        scheduler.add_system("s1", Phase::Sim, &[], &[], true, |_, _| Ok(()));
        scheduler.add_system("s2", Phase::Sim, &[], &[], true, |_, _| Ok(()));

        let plan = scheduler.batch_plan(Phase::Sim);
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn read_only_systems_share_a_batch() {
        let a = component_type_id::<A>();
        let mut scheduler = SystemScheduler::new();
        scheduler.add_system("r1", Phase::Sim, &[a], &[], false, |_, _| Ok(()));
        scheduler.add_system("r2", Phase::Sim, &[a], &[], false, |_, _| Ok(()));

        let plan = scheduler.batch_plan(Phase::Sim);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].len(), 2);
    }
}
