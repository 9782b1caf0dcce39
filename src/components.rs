//! Built-in simulation components.
//!
//! Hot components live in archetype chunks and drive queries; `DebugTag` is
//! the one cold resident, reachable by direct lookup only.

use glam::{EulerRot, Mat4, Quat, Vec3};

use crate::component::{Component, Residency};
use crate::frame::DEFAULT_CLEAR_COLOR;

/// Local TRS transform. Euler angles compose as Rz * Ry * Rx.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation_euler: Vec3,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation_euler: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn local_matrix(&self) -> Mat4 {
        let rotation = Quat::from_euler(
            EulerRot::ZYX,
            self.rotation_euler.z,
            self.rotation_euler.y,
            self.rotation_euler.x,
        );
        Mat4::from_scale_rotation_translation(self.scale, rotation, self.translation)
    }
}

impl Component for Transform {}

/// World-space matrix composed from [`Transform`] each frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocalToWorld {
    pub matrix: Mat4,
}

impl Default for LocalToWorld {
    fn default() -> Self {
        Self {
            matrix: Mat4::IDENTITY,
        }
    }
}

impl Component for LocalToWorld {}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LinearVelocity {
    pub units_per_second: Vec3,
}

impl Component for LinearVelocity {}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AngularVelocity {
    pub radians_per_second: Vec3,
}

impl Default for AngularVelocity {
    fn default() -> Self {
        Self {
            radians_per_second: Vec3::new(0.0, 0.0, 1.0),
        }
    }
}

impl Component for AngularVelocity {}

/// Reference to mesh/material render state plus view routing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshRef {
    pub view_id: u32,
    pub material_id: u32,
    pub mesh_id: u32,
    pub vertex_count: u32,
    pub first_vertex: u32,
    pub visible: bool,
    pub override_clear_color: bool,
    pub clear_color: [f32; 4],
}

impl Default for MeshRef {
    fn default() -> Self {
        Self {
            view_id: 0,
            material_id: 1,
            mesh_id: 1,
            vertex_count: 3,
            first_vertex: 0,
            visible: true,
            override_clear_color: false,
            clear_color: DEFAULT_CLEAR_COLOR,
        }
    }
}

impl Component for MeshRef {}

/// Culling result; draws require this AND `MeshRef::visible`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderVisibility {
    pub visible: bool,
}

impl Default for RenderVisibility {
    fn default() -> Self {
        Self { visible: true }
    }
}

impl Component for RenderVisibility {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderLayer {
    pub value: u32,
}

impl Component for RenderLayer {}

/// Remaining lifetime in seconds; negative means unbounded.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Lifetime {
    pub seconds_remaining: f32,
}

impl Default for Lifetime {
    fn default() -> Self {
        Self {
            seconds_remaining: -1.0,
        }
    }
}

impl Component for Lifetime {}

/// Diagnostic tag, cold-resident: direct lookup only, never queried.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebugTag {
    pub tag: u32,
}

impl Component for DebugTag {
    const RESIDENCY: Residency = Residency::ColdSparse;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_matrix_translation_lands_in_w_axis() {
        let t = Transform {
            translation: Vec3::new(1.0, 2.0, 3.0),
            ..Default::default()
        };
        let m = t.local_matrix();
        assert_eq!(m.w_axis.truncate(), Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn z_rotation_spins_x_axis() {
        let t = Transform {
            rotation_euler: Vec3::new(0.0, 0.0, std::f32::consts::FRAC_PI_2),
            ..Default::default()
        };
        let m = t.local_matrix();
        let rotated = m.transform_vector3(Vec3::X);
        assert!((rotated - Vec3::Y).length() < 1e-5);
    }
}
