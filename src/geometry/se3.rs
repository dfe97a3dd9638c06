//! SE3 rigid-body transform.
//!
//! The convention throughout the crate: a pose stored as `SE3` maps world
//! coordinates into the rig (camera assembly) frame,
//! `p_rig = pose.transform_point(&p_world)`. The rig position in world
//! coordinates is recovered with [`SE3::rig_position`].

use nalgebra::{Matrix4, UnitQuaternion, Vector3, Vector4};

/// A rigid-body transform: rotation followed by translation.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from an axis-angle rotation vector and a translation.
    pub fn from_parts(axis_angle: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(axis_angle),
            translation,
        }
    }

    /// The inverse transform.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            translation: -(rot_inv * self.translation),
            rotation: rot_inv,
        }
    }

    /// Composition: `self.compose(&other)` applies `other` first, then `self`.
    pub fn compose(&self, other: &Self) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Transform a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Transform a homogeneous point (w is carried through unchanged).
    pub fn transform_homogeneous(&self, p: &Vector4<f64>) -> Vector4<f64> {
        let xyz = self.rotation * p.xyz() + self.translation * p.w;
        Vector4::new(xyz.x, xyz.y, xyz.z, p.w)
    }

    /// The 4x4 homogeneous matrix of this transform.
    pub fn matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.to_rotation_matrix().matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Position of the rig in world coordinates (for a world-to-rig pose).
    ///
    /// For `p_rig = R p_world + t` the rig center satisfies `R c + t = 0`.
    pub fn rig_position(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    /// Euclidean distance between the rig positions of two poses.
    pub fn distance(&self, other: &Self) -> f64 {
        (self.rig_position() - other.rig_position()).norm()
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}
