//! Frame driver: world + scheduler + structural commands + extraction.

use crate::command::{CommandPhase, StructuralCommandBuffer};
use crate::error::Result;
use crate::extract::RenderExtractor;
use crate::frame::{FrameInput, FrameSnapshot};
use crate::schedule::SystemScheduler;
use crate::systems::register_default_systems;
use crate::world::World;

/// Owns the simulation world and runs it one tick at a time.
///
/// A tick executes PreSim, Sim, and PostSim with command-buffer flushes at
/// every batch barrier, then plays back end-of-frame destroys, compacts
/// empty trailing chunks, and advances the frame index. Render data is
/// pulled afterwards with [`Simulation::build_frame_snapshot`].
pub struct Simulation {
    world: World,
    scheduler: SystemScheduler,
    commands: StructuralCommandBuffer,
    extractor: RenderExtractor,
    frame_index: u64,
}

impl Simulation {
    /// Simulation with the default system pipeline registered.
    pub fn new() -> Self {
        let mut scheduler = SystemScheduler::new();
        register_default_systems(&mut scheduler);
        Self::with_scheduler(scheduler)
    }

    /// Simulation over a caller-assembled scheduler.
    pub fn with_scheduler(scheduler: SystemScheduler) -> Self {
        Self {
            world: World::new(),
            scheduler,
            commands: StructuralCommandBuffer::new(),
            extractor: RenderExtractor::new(),
            frame_index: 0,
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn scheduler_mut(&mut self) -> &mut SystemScheduler {
        &mut self.scheduler
    }

    /// Frame-level command buffer; commands queued here outside systems
    /// replay at the next tick's barriers.
    pub fn commands(&self) -> &StructuralCommandBuffer {
        &self.commands
    }

    pub fn extractor(&self) -> &RenderExtractor {
        &self.extractor
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Advance the simulation by `delta_seconds`.
    pub fn tick(&mut self, delta_seconds: f32) -> Result<()> {
        let frame = FrameInput {
            delta_seconds,
            frame_index: self.frame_index,
        };

        self.scheduler
            .run_frame(&mut self.world, &self.commands, &frame)?;
        self.commands
            .playback(&mut self.world, CommandPhase::EndFrame)?;
        self.world.compact_chunks();
        self.frame_index += 1;
        Ok(())
    }

    /// Extract the current frame's render data; unchanged chunks reuse
    /// their cached packets.
    pub fn build_frame_snapshot(&mut self) -> FrameSnapshot {
        self.extractor.build(&self.world)
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}
