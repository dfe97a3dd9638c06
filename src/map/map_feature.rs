//! 3D map features and their 2D measurements.

use nalgebra::{Matrix2, Matrix4, Vector2, Vector3, Vector4};

use super::types::KeyframeId;

/// A persistent 3D landmark owned by the map.
///
/// The position estimate is kept homogeneous with unit fourth coordinate;
/// bundle adjustment refines the x/y/z part. The track lists the keyframes
/// observing the feature, oldest first, and is non-empty from the moment
/// the feature enters the map.
#[derive(Debug, Clone)]
pub struct MapFeature {
    estimate: Vector4<f64>,
    covariance: Matrix4<f64>,
    track: Vec<KeyframeId>,
}

impl MapFeature {
    pub fn new(estimate: Vector4<f64>, covariance: Matrix4<f64>) -> Self {
        Self {
            estimate,
            covariance,
            track: Vec::new(),
        }
    }

    pub fn estimate(&self) -> &Vector4<f64> {
        &self.estimate
    }

    /// Euclidean world position (the estimate is kept at w = 1).
    pub fn position(&self) -> Vector3<f64> {
        self.estimate.xyz()
    }

    /// Replace the position, keeping the homogeneous form normalized.
    pub fn set_position(&mut self, position: Vector3<f64>) {
        self.estimate = Vector4::new(position.x, position.y, position.z, 1.0);
    }

    pub fn covariance(&self) -> &Matrix4<f64> {
        &self.covariance
    }

    /// Keyframes observing this feature, oldest first.
    pub fn track(&self) -> &[KeyframeId] {
        &self.track
    }

    /// The keyframe that created this feature.
    pub fn anchor_keyframe(&self) -> Option<KeyframeId> {
        self.track.first().copied()
    }

    pub(super) fn add_to_track(&mut self, kf_id: KeyframeId) {
        if !self.track.contains(&kf_id) {
            self.track.push(kf_id);
        }
    }
}

/// A single 2D observation of a map feature from one keyframe.
///
/// The information matrix is the inverse covariance of the pixel
/// measurement; it weights the observation during bundle adjustment.
#[derive(Debug, Clone)]
pub struct MapMeasurement {
    pub point: Vector2<f64>,
    pub information: Matrix2<f64>,
}

impl MapMeasurement {
    pub fn new(point: Vector2<f64>, information: Matrix2<f64>) -> Self {
        Self { point, information }
    }

    /// Measurement with isotropic information weight.
    pub fn with_weight(point: Vector2<f64>, weight: f64) -> Self {
        Self {
            point,
            information: Matrix2::identity() * weight,
        }
    }
}
