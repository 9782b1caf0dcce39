//! Built-in simulation systems and their registration order.

use std::f32::consts::TAU;

use crate::component::component_type_id;
use crate::components::{
    AngularVelocity, Lifetime, LinearVelocity, LocalToWorld, MeshRef, RenderVisibility, Transform,
};
use crate::entity::Entity;
use crate::schedule::{Phase, SystemScheduler};

/// Register the default frame pipeline.
///
/// PreSim seeds missing render state, Sim advances motion and lifetimes,
/// PostSim composes world matrices for extraction.
pub fn register_default_systems(scheduler: &mut SystemScheduler) {
    let transform = component_type_id::<Transform>();
    let local_to_world = component_type_id::<LocalToWorld>();
    let linear = component_type_id::<LinearVelocity>();
    let angular = component_type_id::<AngularVelocity>();
    let mesh = component_type_id::<MeshRef>();
    let lifetime = component_type_id::<Lifetime>();

    // Renderable entities pick up LocalToWorld and RenderVisibility on the
    // frame after they appear; both adds replay at the PreSim batch barrier.
    scheduler.add_system(
        "render_state.setup",
        Phase::PreSim,
        &[mesh],
        &[],
        true,
        |ctx, _frame| {
            let mut missing_l2w: Vec<Entity> = Vec::new();
            ctx.query::<(&MeshRef,)>()?
                .exclude::<LocalToWorld>()
                .each(|entity, _| missing_l2w.push(entity));
            for entity in missing_l2w {
                ctx.commands()
                    .emplace_component(entity, LocalToWorld::default())?;
            }

            let mut missing_vis: Vec<Entity> = Vec::new();
            ctx.query::<(&MeshRef,)>()?
                .exclude::<RenderVisibility>()
                .each(|entity, _| missing_vis.push(entity));
            for entity in missing_vis {
                ctx.commands()
                    .emplace_component(entity, RenderVisibility::default())?;
            }
            Ok(())
        },
    );

    scheduler.add_system(
        "motion.spin",
        Phase::Sim,
        &[angular],
        &[transform],
        false,
        |ctx, frame| {
            let dt = frame.delta_seconds;
            ctx.query::<(&mut Transform, &AngularVelocity)>()?
                .each(|_, (mut transform, angular)| {
                    let step = angular.radians_per_second * dt;
                    if step == glam::Vec3::ZERO {
                        return;
                    }
                    let mut euler = transform.rotation_euler + step;
                    euler.x = euler.x.rem_euclid(TAU);
                    euler.y = euler.y.rem_euclid(TAU);
                    euler.z = euler.z.rem_euclid(TAU);
                    transform.rotation_euler = euler;
                });
            Ok(())
        },
    );

    scheduler.add_system(
        "motion.integrate",
        Phase::Sim,
        &[linear],
        &[transform],
        false,
        |ctx, frame| {
            let dt = frame.delta_seconds;
            ctx.query::<(&mut Transform, &LinearVelocity)>()?
                .each(|_, (mut transform, velocity)| {
                    let step = velocity.units_per_second * dt;
                    if step == glam::Vec3::ZERO {
                        return;
                    }
                    transform.translation += step;
                });
            Ok(())
        },
    );

    scheduler.add_system(
        "lifetime.expire",
        Phase::Sim,
        &[],
        &[lifetime],
        true,
        |ctx, frame| {
            let dt = frame.delta_seconds;
            let mut expired: Vec<Entity> = Vec::new();
            ctx.query::<(&mut Lifetime,)>()?.each(|entity, (mut life,)| {
                if life.seconds_remaining < 0.0 {
                    return;
                }
                life.seconds_remaining -= dt;
                if life.seconds_remaining <= 0.0 {
                    expired.push(entity);
                }
            });
            for entity in expired {
                ctx.commands().destroy_entity(entity)?;
            }
            Ok(())
        },
    );

    scheduler.add_system(
        "transform.compose",
        Phase::PostSim,
        &[transform],
        &[local_to_world],
        false,
        |ctx, _frame| {
            ctx.query::<(&Transform, &mut LocalToWorld)>()?
                .each(|_, (transform, mut l2w)| {
                    l2w.matrix = transform.local_matrix();
                });
            Ok(())
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandPhase, StructuralCommandBuffer};
    use crate::frame::FrameInput;
    use crate::world::World;
    use glam::Vec3;

    fn tick(
        world: &mut World,
        scheduler: &mut SystemScheduler,
        commands: &StructuralCommandBuffer,
        dt: f32,
    ) {
        let frame = FrameInput {
            delta_seconds: dt,
            frame_index: 0,
        };
        scheduler.run_frame(world, commands, &frame).unwrap();
        commands.playback(world, CommandPhase::EndFrame).unwrap();
    }

    #[test]
    fn spin_advances_and_wraps() {
        let mut world = World::new();
        let mut scheduler = SystemScheduler::new();
        register_default_systems(&mut scheduler);
        let commands = StructuralCommandBuffer::new();

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

        tick(&mut world, &mut scheduler, &commands, 0.5);
        let t = world.get_component::<Transform>(e).unwrap();
        assert!((t.rotation_euler.z - 0.5).abs() < 1e-6);

        for _ in 0..13 {
            tick(&mut world, &mut scheduler, &commands, 0.5);
        }
        let t = world.get_component::<Transform>(e).unwrap();
        assert!(t.rotation_euler.z < TAU);
        assert!((t.rotation_euler.z - (7.0_f32).rem_euclid(TAU)).abs() < 1e-4);
    }

    #[test]
    fn lifetime_expiry_destroys_through_commands() {
        let mut world = World::new();
        let mut scheduler = SystemScheduler::new();
        register_default_systems(&mut scheduler);
        let commands = StructuralCommandBuffer::new();

        let doomed = world.create_entity();
        world
            .emplace_component(
                doomed,
                Lifetime {
                    seconds_remaining: 0.3,
                },
            )
            .unwrap();
        let immortal = world.create_entity();
        world.emplace_component(immortal, Lifetime::default()).unwrap();

        tick(&mut world, &mut scheduler, &commands, 0.2);
        assert!(world.is_alive(doomed));

        tick(&mut world, &mut scheduler, &commands, 0.2);
        assert!(!world.is_alive(doomed));
        assert!(world.is_alive(immortal));
    }

    #[test]
    fn setup_seeds_render_state_for_new_meshes() {
        let mut world = World::new();
        let mut scheduler = SystemScheduler::new();
        register_default_systems(&mut scheduler);
        let commands = StructuralCommandBuffer::new();

        let e = world.create_entity();
        world.emplace_component(e, MeshRef::default()).unwrap();
        world.emplace_component(e, Transform::default()).unwrap();

        tick(&mut world, &mut scheduler, &commands, 0.016);
        assert!(world.has_component::<LocalToWorld>(e));
        assert!(world.has_component::<RenderVisibility>(e));
    }
}
