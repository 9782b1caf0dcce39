//! Render extraction with per-chunk change detection.
//!
//! The extractor walks every chunk holding renderable rows and rebuilds a
//! chunk's draw/view packets only when one of its tracked column versions
//! moved since the last extraction; otherwise the cached packets are reused
//! verbatim. Chunks stripe round-robin across a persistent worker pool gated
//! by a generation-counted condvar; each worker writes only its own pending
//! vectors and a single-threaded merge pass produces the final snapshot.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::components::{LocalToWorld, MeshRef, RenderVisibility, Transform};
use crate::entity::Entity;
use crate::frame::{DrawPacket, FrameSnapshot, MaterialBatch, RenderView};
use crate::query::{PlanTerm, QueryParams};
use crate::world::World;

/// Number of tracked component columns per chunk.
const TRACKED: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorState {
    Cold,
    WarmingUp,
    Steady,
}

#[derive(Clone, Copy)]
struct PendingDraw {
    entity: Entity,
    draw: DrawPacket,
}

#[derive(Clone, Copy)]
struct PendingView {
    view_id: u32,
    has_override: bool,
    clear_color: [f32; 4],
}

struct ChunkExtract {
    views: Vec<PendingView>,
    draws: Vec<PendingDraw>,
}

struct ChunkCache {
    versions: [u64; TRACKED],
    views: Vec<PendingView>,
    draws: Vec<PendingDraw>,
}

struct ChunkTask<'w> {
    key: (u32, u32),
    versions: [u64; TRACKED],
    entities: &'w [Entity],
    mesh: &'w [MeshRef],
    transform: &'w [Transform],
    visibility: &'w [RenderVisibility],
    local_to_world: &'w [LocalToWorld],
    reuse: bool,
}

fn cull_and_emit_chunk(task: &ChunkTask<'_>) -> ChunkExtract {
    let mut out = ChunkExtract {
        views: Vec::new(),
        draws: Vec::new(),
    };

    for row in 0..task.entities.len() {
        let mesh = &task.mesh[row];
        let visibility = &task.visibility[row];
        if !visibility.visible || !mesh.visible {
            continue;
        }

        out.views.push(PendingView {
            view_id: mesh.view_id,
            has_override: mesh.override_clear_color,
            clear_color: mesh.clear_color,
        });

        let entity = task.entities[row];
        let world_position = task.local_to_world[row].matrix.w_axis.truncate().to_array();
        out.draws.push(PendingDraw {
            entity,
            draw: DrawPacket {
                view_id: mesh.view_id,
                material_id: mesh.material_id,
                vertex_count: mesh.vertex_count,
                first_vertex: mesh.first_vertex,
                angle_radians: task.transform[row].rotation_euler.z,
                world_position,
                world_entity_id: entity.index,
            },
        });
    }
    out
}

fn bin_materials(pending: &mut [PendingDraw], snapshot: &mut FrameSnapshot) {
    pending.sort_by(|a, b| {
        a.draw
            .material_id
            .cmp(&b.draw.material_id)
            .then(a.entity.index.cmp(&b.entity.index))
    });

    snapshot.draw_packets.reserve(pending.len());
    let mut current_material = 0u32;
    let mut has_material = false;
    let mut first_draw = 0u32;

    for item in pending.iter() {
        let draw_index = snapshot.draw_packets.len() as u32;
        snapshot.draw_packets.push(item.draw);

        if !has_material {
            current_material = item.draw.material_id;
            has_material = true;
            first_draw = draw_index;
            continue;
        }

        if item.draw.material_id != current_material {
            snapshot.material_batches.push(MaterialBatch {
                material_id: current_material,
                first_draw_packet: first_draw,
                draw_packet_count: draw_index - first_draw,
            });
            current_material = item.draw.material_id;
            first_draw = draw_index;
        }
    }

    if has_material {
        snapshot.material_batches.push(MaterialBatch {
            material_id: current_material,
            first_draw_packet: first_draw,
            draw_packet_count: snapshot.draw_packets.len() as u32 - first_draw,
        });
    }
}

/// Incremental frame extractor.
pub struct RenderExtractor {
    cache: FxHashMap<(u32, u32), ChunkCache>,
    state: ExtractorState,
    last_rebuilt: usize,
    last_reused: usize,
    seen_reset_epoch: u64,
    seen_archetype_count: usize,
    pool: ExtractWorkerPool,
}

impl RenderExtractor {
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self::with_workers(workers)
    }

    pub fn with_workers(workers: usize) -> Self {
        Self {
            cache: FxHashMap::default(),
            state: ExtractorState::Cold,
            last_rebuilt: 0,
            last_reused: 0,
            seen_reset_epoch: 0,
            seen_archetype_count: 0,
            pool: ExtractWorkerPool::new(workers.max(1)),
        }
    }

    pub fn state(&self) -> ExtractorState {
        self.state
    }

    pub fn last_rebuilt_chunk_count(&self) -> usize {
        self.last_rebuilt
    }

    pub fn last_reused_chunk_count(&self) -> usize {
        self.last_reused
    }

    /// Build the frame snapshot from a quiescent post-PostSim world.
    pub fn build(&mut self, world: &World) -> FrameSnapshot {
        // World reset or signature churn invalidates every cached chunk.
        if world.reset_epoch() != self.seen_reset_epoch
            || world.archetype_count() != self.seen_archetype_count
        {
            self.cache.clear();
            self.state = ExtractorState::Cold;
            self.seen_reset_epoch = world.reset_epoch();
            self.seen_archetype_count = world.archetype_count();
        }

        let tasks = self.collect_tasks(world);
        let worker_count = self.pool.worker_count();

        let outputs: Vec<Mutex<Vec<(usize, ChunkExtract)>>> =
            (0..worker_count).map(|_| Mutex::new(Vec::new())).collect();
        self.pool.run(&|worker: usize| {
            let mut local = outputs[worker].lock();
            let mut index = worker;
            while index < tasks.len() {
                let task = &tasks[index];
                if !task.reuse {
                    local.push((index, cull_and_emit_chunk(task)));
                }
                index += worker_count;
            }
        });

        let mut extracts: Vec<Option<ChunkExtract>> =
            (0..tasks.len()).map(|_| None).collect();
        for output in outputs {
            for (index, extract) in output.into_inner() {
                extracts[index] = Some(extract);
            }
        }

        // Single-threaded merge in chunk order keeps the output independent
        // of worker interleaving.
        let mut snapshot = FrameSnapshot {
            run_transfer_stage: true,
            run_compute_stage: true,
            ..Default::default()
        };
        let mut view_map: FxHashMap<u32, RenderView> = FxHashMap::default();
        let mut pending_draws: Vec<PendingDraw> = Vec::new();
        let mut rebuilt = 0usize;
        let mut reused = 0usize;

        for (index, task) in tasks.iter().enumerate() {
            let (views, draws): (&[PendingView], &[PendingDraw]) = if task.reuse {
                reused += 1;
                let cached = &self.cache[&task.key];
                (&cached.views, &cached.draws)
            } else {
                rebuilt += 1;
                let extract = extracts[index]
                    .take()
                    .expect("rebuilt chunk produced no extract");
                let entry = self.cache.entry(task.key).or_insert(ChunkCache {
                    versions: task.versions,
                    views: Vec::new(),
                    draws: Vec::new(),
                });
                entry.versions = task.versions;
                entry.views = extract.views;
                entry.draws = extract.draws;
                (&entry.views, &entry.draws)
            };

            for view in views {
                if view.has_override {
                    view_map.insert(
                        view.view_id,
                        RenderView {
                            view_id: view.view_id,
                            clear_color: view.clear_color,
                        },
                    );
                } else {
                    view_map.entry(view.view_id).or_insert(RenderView {
                        view_id: view.view_id,
                        ..Default::default()
                    });
                }
            }
            pending_draws.extend_from_slice(draws);
        }

        snapshot.views = view_map.into_values().collect();
        snapshot.views.sort_by_key(|v| v.view_id);
        bin_materials(&mut pending_draws, &mut snapshot);

        self.last_rebuilt = rebuilt;
        self.last_reused = reused;
        self.state = match self.state {
            ExtractorState::Cold => ExtractorState::WarmingUp,
            ExtractorState::WarmingUp if reused > 0 => ExtractorState::Steady,
            other => other,
        };
        tracing::trace!(rebuilt, reused, draws = snapshot.draw_packets.len(), "extract");
        snapshot
    }

    fn collect_tasks<'w>(&self, world: &'w World) -> Vec<ChunkTask<'w>> {
        let mut terms: SmallVec<[PlanTerm; 8]> = SmallVec::new();
        <(&MeshRef, &Transform, &RenderVisibility, &LocalToWorld) as QueryParams>::collect_terms(
            &mut terms,
        );
        let plan = world.plan_for(&terms, &[]);

        let mut tasks = Vec::new();
        for (slot, &arch_id) in plan.archetypes().iter().enumerate() {
            let arch = &world.archetypes()[arch_id as usize];
            let remaps = plan.remaps(slot);
            let columns: SmallVec<[u32; TRACKED]> = remaps
                .iter()
                .copied()
                .map(|r| r.expect("tracked columns are required").column)
                .collect();

            for (chunk_idx, chunk) in arch.chunks().iter().enumerate() {
                if chunk.is_empty() {
                    continue;
                }

                let mut versions = [0u64; TRACKED];
                for (i, &column) in columns.iter().enumerate() {
                    versions[i] = chunk.column(column as usize).version();
                }

                let key = (arch_id, chunk_idx as u32);
                let reuse = self
                    .cache
                    .get(&key)
                    .is_some_and(|cached| cached.versions == versions);

                let len = chunk.len();
                // Post-PostSim the world is quiescent; the slices stay valid
                // for the duration of the borrow on `world`.
                unsafe {
                    tasks.push(ChunkTask {
                        key,
                        versions,
                        entities: chunk.entities(),
                        mesh: column_slice::<MeshRef>(chunk, columns[0], len),
                        transform: column_slice::<Transform>(chunk, columns[1], len),
                        visibility: column_slice::<RenderVisibility>(chunk, columns[2], len),
                        local_to_world: column_slice::<LocalToWorld>(chunk, columns[3], len),
                        reuse,
                    });
                }
            }
        }
        tasks
    }
}

impl Default for RenderExtractor {
    fn default() -> Self {
        Self::new()
    }
}

// # Safety
// `column` must hold `len` initialized values of `T` in the given chunk.
unsafe fn column_slice<T>(chunk: &crate::archetype::Chunk, column: u32, len: usize) -> &[T] {
    std::slice::from_raw_parts(chunk.column(column as usize).base_ptr() as *const T, len)
}

/// Fixed worker pool gated by a run-generation counter.
///
/// `run` publishes a task, wakes every worker, and blocks until each one
/// reports completion, so borrowed task state never outlives the call.
/// Cancellation is by teardown only.
struct ExtractWorkerPool {
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
    worker_count: usize,
}

struct PoolShared {
    state: Mutex<PoolState>,
    start: Condvar,
    done: Condvar,
}

struct PoolState {
    generation: u64,
    completed: usize,
    stop: bool,
    task: Option<&'static (dyn Fn(usize) + Sync)>,
}

impl ExtractWorkerPool {
    fn new(worker_count: usize) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                generation: 0,
                completed: 0,
                stop: false,
                task: None,
            }),
            start: Condvar::new(),
            done: Condvar::new(),
        });

        let handles = (0..worker_count)
            .map(|index| {
                let shared = shared.clone();
                std::thread::spawn(move || Self::worker_loop(&shared, index, worker_count))
            })
            .collect();

        Self {
            shared,
            handles,
            worker_count,
        }
    }

    fn worker_count(&self) -> usize {
        self.worker_count
    }

    fn worker_loop(shared: &PoolShared, index: usize, worker_count: usize) {
        let mut seen = 0u64;
        loop {
            let task = {
                let mut state = shared.state.lock();
                while !state.stop && state.generation == seen {
                    shared.start.wait(&mut state);
                }
                if state.stop {
                    return;
                }
                seen = state.generation;
                state.task
            };

            if let Some(task) = task {
                task(index);
            }

            let mut state = shared.state.lock();
            state.completed += 1;
            if state.completed == worker_count {
                shared.done.notify_all();
            }
        }
    }

    fn run(&self, task: &(dyn Fn(usize) + Sync)) {
        // The 'static lifetime is a loan: `run` blocks until every worker
        // finished the generation, so the borrow cannot escape this call.
        let task: &'static (dyn Fn(usize) + Sync) = unsafe { std::mem::transmute(task) };

        let mut state = self.shared.state.lock();
        state.task = Some(task);
        state.completed = 0;
        state.generation = state.generation.wrapping_add(1);
        self.shared.start.notify_all();
        while state.completed < self.worker_count {
            self.shared.done.wait(&mut state);
        }
        state.task = None;
    }
}

impl Drop for ExtractWorkerPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
        }
        self.shared.start.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderable_world(count: usize) -> (World, Vec<Entity>) {
        let mut world = World::new();
        let mut entities = Vec::new();
        for i in 0..count {
            let e = world.create_entity();
            world.emplace_component(e, Transform::default()).unwrap();
            world
                .emplace_component(
                    e,
                    MeshRef {
                        material_id: 1 + (i % 2) as u32,
                        ..Default::default()
                    },
                )
                .unwrap();
            world
                .emplace_component(e, RenderVisibility::default())
                .unwrap();
            world.emplace_component(e, LocalToWorld::default()).unwrap();
            entities.push(e);
        }
        (world, entities)
    }

    #[test]
    fn rebuild_then_reuse_then_rebuild_on_touch() {
        let (world, _) = renderable_world(1);
        let mut extractor = RenderExtractor::with_workers(2);

        let first = extractor.build(&world);
        assert_eq!(first.draw_packets.len(), 1);
        assert!(extractor.last_rebuilt_chunk_count() >= 1);
        assert_eq!(extractor.state(), ExtractorState::WarmingUp);

        let second = extractor.build(&world);
        assert_eq!(second.draw_packets.len(), 1);
        assert_eq!(extractor.last_rebuilt_chunk_count(), 0);
        assert!(extractor.last_reused_chunk_count() >= 1);
        assert_eq!(extractor.state(), ExtractorState::Steady);

        {
            let scope = world.write_scope();
            scope
                .query::<(&mut Transform,)>()
                .each(|_, (mut t,)| t.rotation_euler.z += 1.0);
        }
        extractor.build(&world);
        assert!(extractor.last_rebuilt_chunk_count() >= 1);
    }

    #[test]
    fn culling_skips_invisible_rows() {
        let (mut world, entities) = renderable_world(2);
        world
            .emplace_component(entities[1], RenderVisibility { visible: false })
            .unwrap();

        let mut extractor = RenderExtractor::with_workers(1);
        let snapshot = extractor.build(&world);
        assert_eq!(snapshot.draw_packets.len(), 1);
        assert_eq!(snapshot.draw_packets[0].world_entity_id, entities[0].index);
        assert_eq!(extractor.last_rebuilt_chunk_count(), 1);
    }

    #[test]
    fn draws_sort_by_material_then_entity() {
        let (world, _) = renderable_world(4);
        let mut extractor = RenderExtractor::with_workers(2);
        let snapshot = extractor.build(&world);

        assert_eq!(snapshot.draw_packets.len(), 4);
        let keys: Vec<(u32, u32)> = snapshot
            .draw_packets
            .iter()
            .map(|d| (d.material_id, d.world_entity_id))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        assert_eq!(snapshot.material_batches.len(), 2);
        assert_eq!(snapshot.material_batches[0].material_id, 1);
        assert_eq!(snapshot.material_batches[0].draw_packet_count, 2);
        assert_eq!(snapshot.material_batches[1].first_draw_packet, 2);
    }

    #[test]
    fn world_clear_drops_back_to_cold() {
        let (mut world, _) = renderable_world(1);
        let mut extractor = RenderExtractor::with_workers(1);
        extractor.build(&world);
        extractor.build(&world);
        assert_eq!(extractor.state(), ExtractorState::Steady);

        world.clear();
        extractor.build(&world);
        assert_eq!(extractor.state(), ExtractorState::WarmingUp);
        assert_eq!(extractor.last_reused_chunk_count(), 0);
    }

    #[test]
    fn untouched_write_grant_does_not_rebuild() {
        let (world, _) = renderable_world(1);
        let mut extractor = RenderExtractor::with_workers(1);
        extractor.build(&world);

        // A mutable pass over a tracked column that never touches anything
        // must leave the chunk versions, and the cache, alone.
        {
            let scope = world.write_scope();
            scope.query::<(&mut Transform,)>().each(|_, (t,)| {
                let _ = t.rotation_euler;
            });
        }
        extractor.build(&world);
        assert_eq!(extractor.last_rebuilt_chunk_count(), 0);
        assert!(extractor.last_reused_chunk_count() >= 1);
    }
}
