//! Keyframe: a stored pose + reference image + measurement set.

use std::collections::HashMap;

use image::GrayImage;

use crate::geometry::SE3;

use super::map_feature::MapMeasurement;
use super::types::{KeyframeId, MapPointId};

/// A map anchor frame.
///
/// The reference image is immutable after creation; the pose starts at the
/// rig pose the frame was captured with and is refined by bundle
/// adjustment. Measurements record which map features this keyframe
/// observed and where.
pub struct Keyframe {
    id: KeyframeId,
    /// World-to-rig pose.
    pose: SE3,
    /// Undistorted reference image (left camera).
    image: GrayImage,
    measurements: HashMap<MapPointId, MapMeasurement>,
}

impl Keyframe {
    pub fn new(id: KeyframeId, pose: SE3, image: GrayImage) -> Self {
        Self {
            id,
            pose,
            image,
            measurements: HashMap::new(),
        }
    }

    pub fn id(&self) -> KeyframeId {
        self.id
    }

    pub fn pose(&self) -> &SE3 {
        &self.pose
    }

    pub fn set_pose(&mut self, pose: SE3) {
        self.pose = pose;
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub fn add_measurement(&mut self, point_id: MapPointId, measurement: MapMeasurement) {
        self.measurements.insert(point_id, measurement);
    }

    pub fn measurement(&self, point_id: MapPointId) -> Option<&MapMeasurement> {
        self.measurements.get(&point_id)
    }

    pub fn measurements(&self) -> impl Iterator<Item = (&MapPointId, &MapMeasurement)> {
        self.measurements.iter()
    }

    pub fn num_measurements(&self) -> usize {
        self.measurements.len()
    }

    /// Distance between this keyframe's rig position and another pose's.
    pub fn distance(&self, pose: &SE3) -> f64 {
        self.pose.distance(pose)
    }
}

impl std::fmt::Debug for Keyframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyframe")
            .field("id", &self.id)
            .field("measurements", &self.measurements.len())
            .field("image", &self.image.dimensions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Vector2, Vector3};

    #[test]
    fn test_measurements_roundtrip() {
        let mut kf = Keyframe::new(KeyframeId::new(0), SE3::identity(), GrayImage::new(4, 4));
        let id = MapPointId::new(3);
        kf.add_measurement(id, MapMeasurement::with_weight(Vector2::new(1.0, 2.0), 0.02));

        assert_eq!(kf.num_measurements(), 1);
        let meas = kf.measurement(id).unwrap();
        assert_eq!(meas.point, Vector2::new(1.0, 2.0));
        assert!(kf.measurement(MapPointId::new(4)).is_none());
    }

    #[test]
    fn test_distance_uses_rig_positions() {
        let kf = Keyframe::new(KeyframeId::new(0), SE3::identity(), GrayImage::new(4, 4));

        let mut other = SE3::identity();
        other.translation = Vector3::new(0.0, 0.0, -2.0);
        // rig position of `other` is at z = +2.
        assert!((kf.distance(&other) - 2.0).abs() < 1e-12);
    }
}
