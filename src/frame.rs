//! Frame hand-off types shared between the simulation and the renderer.

/// Per-tick input for simulation systems.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameInput {
    pub delta_seconds: f32,
    pub frame_index: u64,
}

/// One render view contributing to the frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderView {
    pub view_id: u32,
    pub clear_color: [f32; 4],
}

impl Default for RenderView {
    fn default() -> Self {
        Self {
            view_id: 0,
            clear_color: DEFAULT_CLEAR_COLOR,
        }
    }
}

pub const DEFAULT_CLEAR_COLOR: [f32; 4] = [0.02, 0.02, 0.08, 1.0];

/// Contiguous run of draw packets sharing one material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialBatch {
    pub material_id: u32,
    pub first_draw_packet: u32,
    pub draw_packet_count: u32,
}

/// One draw call worth of extracted render state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawPacket {
    pub view_id: u32,
    pub material_id: u32,
    pub vertex_count: u32,
    pub first_vertex: u32,
    pub angle_radians: f32,
    pub world_position: [f32; 3],
    pub world_entity_id: u32,
}

/// Immutable frame snapshot handed to the renderer thread.
///
/// `views` are sorted ascending by view id; `draw_packets` are grouped by
/// material and `material_batches` index contiguous runs into them.
#[derive(Debug, Clone, Default)]
pub struct FrameSnapshot {
    pub views: Vec<RenderView>,
    pub material_batches: Vec<MaterialBatch>,
    pub draw_packets: Vec<DrawPacket>,
    pub run_transfer_stage: bool,
    pub run_compute_stage: bool,
}
