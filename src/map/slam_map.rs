//! The map aggregate owning keyframes and 3D features.

use std::collections::HashMap;

use anyhow::{ensure, Result};
use image::GrayImage;
use nalgebra::{Matrix3, Vector2};

use crate::geometry::SE3;

use super::keyframe::Keyframe;
use super::map_feature::{MapFeature, MapMeasurement};
use super::types::{KeyframeId, MapPointId};

/// Pixel margin around the image border still counted as visible.
const VISIBILITY_MARGIN: f64 = 10.0;

/// The SLAM map: all keyframes and map features of a session.
///
/// Ids are issued here, monotonically, and stay unique for the lifetime of
/// the map object; `clear()` removes all content but does not recycle ids.
pub struct SlamMap {
    keyframes: HashMap<KeyframeId, Keyframe>,
    features: HashMap<MapPointId, MapFeature>,
    next_keyframe_id: u64,
    next_point_id: u64,
    /// Intrinsics of the reference camera, used for visibility prediction.
    intrinsics: Matrix3<f64>,
}

impl SlamMap {
    pub fn new() -> Self {
        Self {
            keyframes: HashMap::new(),
            features: HashMap::new(),
            next_keyframe_id: 0,
            next_point_id: 0,
            intrinsics: Matrix3::identity(),
        }
    }

    pub fn set_intrinsics(&mut self, intrinsics: Matrix3<f64>) {
        self.intrinsics = intrinsics;
    }

    pub fn intrinsics(&self) -> &Matrix3<f64> {
        &self.intrinsics
    }

    // ─────────────────────────────────────────────────────────────────────
    // Keyframes
    // ─────────────────────────────────────────────────────────────────────

    /// Add a keyframe with the given rig pose and reference image.
    pub fn add_keyframe(&mut self, pose: SE3, image: GrayImage) -> KeyframeId {
        let id = KeyframeId::new(self.next_keyframe_id);
        self.next_keyframe_id += 1;
        self.keyframes.insert(id, Keyframe::new(id, pose, image));
        id
    }

    pub fn keyframe(&self, id: KeyframeId) -> Option<&Keyframe> {
        self.keyframes.get(&id)
    }

    pub fn keyframe_mut(&mut self, id: KeyframeId) -> Option<&mut Keyframe> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &Keyframe> {
        self.keyframes.values()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    /// The keyframe whose rig position is closest to the given pose.
    pub fn find_closest_keyframe(&self, pose: &SE3) -> Option<KeyframeId> {
        self.keyframes
            .values()
            .map(|kf| (kf.id(), kf.distance(pose)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Features and measurements
    // ─────────────────────────────────────────────────────────────────────

    pub fn feature(&self, id: MapPointId) -> Option<&MapFeature> {
        self.features.get(&id)
    }

    pub fn feature_mut(&mut self, id: MapPointId) -> Option<&mut MapFeature> {
        self.features.get_mut(&id)
    }

    pub fn features(&self) -> impl Iterator<Item = (&MapPointId, &MapFeature)> {
        self.features.iter()
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    /// Record that `keyframe_id` observed the existing feature `point_id`.
    ///
    /// Both ids must refer to live entities; passing stale ids is a logic
    /// error and is rejected rather than corrupting the map.
    pub fn add_measurement(
        &mut self,
        point_id: MapPointId,
        keyframe_id: KeyframeId,
        measurement: MapMeasurement,
    ) -> Result<()> {
        let feature = self.features.get_mut(&point_id).ok_or_else(|| {
            anyhow::anyhow!("measurement references unknown map point {}", point_id)
        })?;
        let keyframe = self.keyframes.get_mut(&keyframe_id).ok_or_else(|| {
            anyhow::anyhow!("measurement references unknown keyframe {}", keyframe_id)
        })?;

        keyframe.add_measurement(point_id, measurement);
        feature.add_to_track(keyframe_id);
        Ok(())
    }

    /// Insert a new feature together with its first measurement.
    ///
    /// Returns the id of the created feature. The feature's track starts
    /// with `keyframe_id`, keeping the non-empty-track invariant.
    pub fn add_feature_to_keyframe(
        &mut self,
        feature: MapFeature,
        measurement: MapMeasurement,
        keyframe_id: KeyframeId,
    ) -> Result<MapPointId> {
        ensure!(
            self.keyframes.contains_key(&keyframe_id),
            "new feature references unknown keyframe {}",
            keyframe_id
        );

        let id = MapPointId::new(self.next_point_id);
        self.next_point_id += 1;
        self.features.insert(id, feature);
        self.add_measurement(id, keyframe_id, measurement)?;
        Ok(id)
    }

    /// Predict which map features are visible from `pose`.
    ///
    /// Projects every feature through the reference camera and keeps those
    /// in front of the rig and inside the image bounds (with a small
    /// margin). Returns ids with their predicted pixel positions,
    /// index-aligned.
    pub fn select_visible_features(
        &self,
        pose: &SE3,
        image_width: u32,
        image_height: u32,
    ) -> (Vec<MapPointId>, Vec<Vector2<f64>>) {
        let mut ids = Vec::new();
        let mut positions = Vec::new();

        let (fx, fy) = (self.intrinsics[(0, 0)], self.intrinsics[(1, 1)]);
        let (cx, cy) = (self.intrinsics[(0, 2)], self.intrinsics[(1, 2)]);

        for (&id, feature) in &self.features {
            let p_rig = pose.transform_point(&feature.position());
            if p_rig.z <= 0.0 {
                continue;
            }

            let u = fx * p_rig.x / p_rig.z + cx;
            let v = fy * p_rig.y / p_rig.z + cy;

            if u < -VISIBILITY_MARGIN
                || u >= image_width as f64 + VISIBILITY_MARGIN
                || v < -VISIBILITY_MARGIN
                || v >= image_height as f64 + VISIBILITY_MARGIN
            {
                continue;
            }

            ids.push(id);
            positions.push(Vector2::new(u, v));
        }

        (ids, positions)
    }

    /// Drop all keyframes and features. Ids are not recycled.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.features.clear();
    }
}

impl Default for SlamMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SlamMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlamMap")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_features", &self.features.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix4, Vector3, Vector4};

    fn test_map() -> SlamMap {
        let mut map = SlamMap::new();
        map.set_intrinsics(Matrix3::new(
            400.0, 0.0, 320.0, 0.0, 400.0, 240.0, 0.0, 0.0, 1.0,
        ));
        map
    }

    fn feature_at(x: f64, y: f64, z: f64) -> MapFeature {
        MapFeature::new(Vector4::new(x, y, z, 1.0), Matrix4::identity())
    }

    fn measurement() -> MapMeasurement {
        MapMeasurement::with_weight(Vector2::new(100.0, 100.0), 0.02)
    }

    #[test]
    fn test_ids_are_sequential_and_survive_clear() {
        let mut map = test_map();

        let kf0 = map.add_keyframe(SE3::identity(), GrayImage::new(4, 4));
        let kf1 = map.add_keyframe(SE3::identity(), GrayImage::new(4, 4));
        assert_eq!(kf0, KeyframeId::new(0));
        assert_eq!(kf1, KeyframeId::new(1));

        let p0 = map
            .add_feature_to_keyframe(feature_at(0.0, 0.0, 5.0), measurement(), kf0)
            .unwrap();
        assert_eq!(p0, MapPointId::new(0));

        map.clear();
        assert_eq!(map.num_keyframes(), 0);
        assert_eq!(map.num_features(), 0);

        // Ids issued after a clear do not collide with earlier ones.
        let kf2 = map.add_keyframe(SE3::identity(), GrayImage::new(4, 4));
        assert_eq!(kf2, KeyframeId::new(2));
    }

    #[test]
    fn test_new_feature_track_starts_nonempty() {
        let mut map = test_map();
        let kf = map.add_keyframe(SE3::identity(), GrayImage::new(4, 4));
        let id = map
            .add_feature_to_keyframe(feature_at(0.0, 0.0, 5.0), measurement(), kf)
            .unwrap();

        let feature = map.feature(id).unwrap();
        assert_eq!(feature.track(), &[kf]);
        assert!(map.keyframe(kf).unwrap().measurement(id).is_some());
    }

    #[test]
    fn test_measurement_validation() {
        let mut map = test_map();
        let kf = map.add_keyframe(SE3::identity(), GrayImage::new(4, 4));

        // Unknown point id.
        assert!(map
            .add_measurement(MapPointId::new(99), kf, measurement())
            .is_err());

        // Unknown keyframe id.
        let id = map
            .add_feature_to_keyframe(feature_at(0.0, 0.0, 5.0), measurement(), kf)
            .unwrap();
        assert!(map
            .add_measurement(id, KeyframeId::new(99), measurement())
            .is_err());

        // Second observation extends the track.
        let kf2 = map.add_keyframe(SE3::identity(), GrayImage::new(4, 4));
        map.add_measurement(id, kf2, measurement()).unwrap();
        assert_eq!(map.feature(id).unwrap().track(), &[kf, kf2]);
    }

    #[test]
    fn test_select_visible_features() {
        let mut map = test_map();
        let kf = map.add_keyframe(SE3::identity(), GrayImage::new(4, 4));

        // In front of the camera, near the optical axis.
        let visible = map
            .add_feature_to_keyframe(feature_at(0.1, 0.0, 5.0), measurement(), kf)
            .unwrap();
        // Behind the camera.
        map.add_feature_to_keyframe(feature_at(0.0, 0.0, -5.0), measurement(), kf)
            .unwrap();
        // Far outside the field of view.
        map.add_feature_to_keyframe(feature_at(50.0, 0.0, 2.0), measurement(), kf)
            .unwrap();

        let (ids, positions) = map.select_visible_features(&SE3::identity(), 640, 480);
        assert_eq!(ids, vec![visible]);
        assert_eq!(positions.len(), 1);
        assert!((positions[0].x - (400.0 * 0.1 / 5.0 + 320.0)).abs() < 1e-9);
    }

    #[test]
    fn test_find_closest_keyframe() {
        let mut map = test_map();
        assert!(map.find_closest_keyframe(&SE3::identity()).is_none());

        let kf0 = map.add_keyframe(SE3::identity(), GrayImage::new(4, 4));
        let far = SE3 {
            rotation: nalgebra::UnitQuaternion::identity(),
            translation: Vector3::new(-5.0, 0.0, 0.0),
        };
        let kf1 = map.add_keyframe(far, GrayImage::new(4, 4));

        assert_eq!(map.find_closest_keyframe(&SE3::identity()), Some(kf0));

        let near_far = SE3 {
            rotation: nalgebra::UnitQuaternion::identity(),
            translation: Vector3::new(-4.9, 0.0, 0.0),
        };
        assert_eq!(map.find_closest_keyframe(&near_far), Some(kf1));
    }
}
