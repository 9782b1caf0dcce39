//! End-to-end: spinning triangle through tick + extraction + snapshot ring
//! hand-off, plus the pull-based asset catalog.

use simframe::assets::AssetCatalog;
use simframe::components::{AngularVelocity, MeshRef, RenderVisibility, Transform};
use simframe::{FrameSnapshot, Simulation, SnapshotRing};

use glam::Vec3;

fn spinning_triangle(sim: &mut Simulation) -> simframe::Entity {
    let world = sim.world_mut();
    let e = world.create_entity();
    world.emplace_component(e, Transform::default()).unwrap();
    world
        .emplace_component(
            e,
            AngularVelocity {
                radians_per_second: Vec3::new(0.0, 0.0, 1.0),
            },
        )
        .unwrap();
    world
        .emplace_component(
            e,
            MeshRef {
                vertex_count: 3,
                first_vertex: 0,
                ..Default::default()
            },
        )
        .unwrap();
    world
        .emplace_component(e, RenderVisibility { visible: true })
        .unwrap();
    e
}

#[test]
fn spinning_triangle_first_frame() {
    let mut sim = Simulation::new();
    let e = spinning_triangle(&mut sim);

    sim.tick(0.5).unwrap();
    let snapshot = sim.build_frame_snapshot();

    assert_eq!(snapshot.draw_packets.len(), 1);
    assert_eq!(snapshot.views.len(), 1);
    assert_eq!(snapshot.material_batches.len(), 1);

    let draw = &snapshot.draw_packets[0];
    assert_eq!(draw.vertex_count, 3);
    assert_eq!(draw.first_vertex, 0);
    assert_eq!(draw.world_entity_id, e.index);
    assert!((draw.angle_radians - 0.5).abs() < 1e-6);
    assert!(snapshot.run_transfer_stage);
    assert!(snapshot.run_compute_stage);
}

#[test]
fn angle_integrates_across_frames() {
    let mut sim = Simulation::new();
    spinning_triangle(&mut sim);

    sim.tick(0.5).unwrap();
    sim.tick(0.25).unwrap();
    let snapshot = sim.build_frame_snapshot();

    assert_eq!(snapshot.draw_packets.len(), 1);
    assert!((snapshot.draw_packets[0].angle_radians - 0.75).abs() < 1e-6);
    assert_eq!(sim.frame_index(), 2);
}

#[test]
fn snapshot_ring_warm_up_and_staged_frames() {
    let mut sim = Simulation::new();
    spinning_triangle(&mut sim);
    let ring: SnapshotRing<FrameSnapshot, 3> = SnapshotRing::new();

    // Frame 1.
    sim.tick(0.5).unwrap();
    let frame_a = sim.build_frame_snapshot();
    let mut ticket = ring.begin_write().unwrap();
    *ticket = frame_a.clone();
    ring.publish(ticket);

    // One publication: the staged reader still sees nothing.
    assert!(ring.begin_read_staged().is_none());

    // Frame 2.
    sim.tick(0.5).unwrap();
    let frame_b = sim.build_frame_snapshot();
    let mut ticket = ring.begin_write().unwrap();
    *ticket = frame_b;
    ring.publish(ticket);

    // Two publications: the reader gets the first frame.
    let read = ring.begin_read_staged().unwrap();
    assert_eq!(read.read_epoch(), 1);
    assert_eq!(read.draw_packets.len(), 1);
    assert!((read.draw_packets[0].angle_radians - frame_a.draw_packets[0].angle_radians).abs()
        < 1e-6);
    ring.end_read(read);
}

#[test]
fn asset_catalog_snapshot_tracks_frames() {
    let catalog = AssetCatalog::new();
    catalog.upsert_mesh(1, 3, 0);
    catalog.upsert_mesh(2, 36, 3);
    catalog.upsert_material(1);

    let mut sim = Simulation::new();
    spinning_triangle(&mut sim);

    sim.tick(0.016).unwrap();
    let a = catalog.snapshot(sim.frame_index());
    assert_eq!(a.simulation_frame_index, 1);
    assert_eq!(a.meshes.len(), 2);
    assert_eq!(a.materials.len(), 1);

    sim.tick(0.016).unwrap();
    let b = catalog.snapshot(sim.frame_index());
    assert_eq!(b.simulation_frame_index, 2);
    assert_eq!(b.meshes.len(), a.meshes.len());
    assert_eq!(b.materials.len(), a.materials.len());
}

#[test]
fn transforms_advance_between_snapshots() {
    let mut sim = Simulation::new();
    let e = spinning_triangle(&mut sim);
    sim.world_mut()
        .get_component_mut::<Transform>(e)
        .unwrap()
        .translation = Vec3::new(1.0, 2.0, 3.0);

    sim.tick(0.1).unwrap();
    let first = sim.build_frame_snapshot();
    sim.tick(0.1).unwrap();
    let second = sim.build_frame_snapshot();

    assert_eq!(first.draw_packets[0].world_position, [1.0, 2.0, 3.0]);
    assert_eq!(second.draw_packets[0].world_position, [1.0, 2.0, 3.0]);
    assert!(
        (second.draw_packets[0].angle_radians - first.draw_packets[0].angle_radians).abs() > 1e-6
    );
}
