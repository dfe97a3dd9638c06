//! The stereo SLAM orchestrator.
//!
//! Per-frame cycle: undistort the left image, extract features, predict
//! visible map points from the current pose, match and patch-validate them,
//! refine the pose from the resulting 3D-2D set, and decide whether the
//! frame becomes a keyframe. Only then is the right image touched: its
//! features are stereo-matched under the epipolar constraint, validated,
//! triangulated, and inserted into the map, after which a bundle-adjustment
//! pass runs. Observers are notified through the [`SlamEvents`] signals.

use std::collections::HashSet;

use anyhow::{ensure, Result};
use image::GrayImage;
use nalgebra::{Matrix2, Matrix4, Vector2};
use tracing::{debug, info};

use crate::camera::{CameraCalibration, UndistortionMap};
use crate::features::{DescriptorDatabase, FeatureExtractor, FeatureSet};
use crate::geometry::{sampson_correct, symmetric_reprojection_error, triangulate_dlt, SE3};
use crate::map::{KeyframeId, MapFeature, MapMeasurement, MapPointId, SlamMap};
use crate::optimizer::MapOptimizer;
use crate::tracking::{
    check_feature_sad, refine_pose, DetectorController, FeatureTracking, KeyframeAction,
    StereoMatcher,
};

use super::config::SlamConfig;
use super::events::Signal;

/// Observer hooks of a SLAM session. Fire-and-forget, synchronous.
#[derive(Debug, Default)]
pub struct SlamEvents {
    /// The rig pose was re-estimated; carries the 4x4 world-to-rig matrix.
    pub pose_changed: Signal<Matrix4<f64>>,
    /// The map gained a keyframe and/or was re-optimized.
    pub map_changed: Signal<SlamMap>,
    /// A new keyframe was inserted.
    pub keyframe_added: Signal<KeyframeId>,
    /// Number of map points tracked in the frame just processed.
    pub tracked_points: Signal<usize>,
}

/// Stereo visual SLAM session.
pub struct StereoSlam {
    config: SlamConfig,

    calib0: CameraCalibration,
    calib1: CameraCalibration,
    undistort0: UndistortionMap,
    undistort1: UndistortionMap,

    /// Rectified images of the last processed frame.
    undistorted0: GrayImage,
    undistorted1: GrayImage,

    extractor: Box<dyn FeatureExtractor>,
    detector: DetectorController,
    tracking: FeatureTracking,
    stereo_matcher: StereoMatcher,
    descriptor_db: DescriptorDatabase,

    /// Current world-to-rig pose, updated once per processed frame.
    pose: SE3,
    /// Keyframe closest to the current pose.
    active_keyframe: Option<KeyframeId>,

    map: SlamMap,
    optimizer: MapOptimizer,

    pub events: SlamEvents,
}

impl StereoSlam {
    pub fn new(
        calib0: CameraCalibration,
        calib1: CameraCalibration,
        extractor: Box<dyn FeatureExtractor>,
        config: SlamConfig,
    ) -> Result<Self> {
        ensure!(
            calib0.width() > 0 && calib0.height() > 0 && calib1.width() > 0 && calib1.height() > 0,
            "calibration image sizes must be non-zero"
        );

        let undistort0 = UndistortionMap::new(&calib0);
        let undistort1 = UndistortionMap::new(&calib1);
        let stereo_matcher = StereoMatcher::new(
            &calib0,
            &calib1,
            config.max_epipolar_distance,
            config.max_descriptor_distance,
        );
        let tracking = FeatureTracking::new(
            config.tracking_search_radius,
            config.max_descriptor_distance,
        );
        let detector = DetectorController::new(config.detector.clone());
        let optimizer = MapOptimizer::new(config.bundle_adjustment.clone());

        let mut map = SlamMap::new();
        map.set_intrinsics(*calib0.intrinsics());

        let undistorted0 = GrayImage::new(calib0.width(), calib0.height());
        let undistorted1 = GrayImage::new(calib1.width(), calib1.height());

        Ok(Self {
            config,
            calib0,
            calib1,
            undistort0,
            undistort1,
            undistorted0,
            undistorted1,
            extractor,
            detector,
            tracking,
            stereo_matcher,
            descriptor_db: DescriptorDatabase::new(),
            pose: SE3::identity(),
            active_keyframe: None,
            map,
            optimizer,
            events: SlamEvents::default(),
        })
    }

    /// Process a new stereo pair.
    pub fn new_images(&mut self, img0: &GrayImage, img1: &GrayImage) -> Result<()> {
        self.undistorted0 = self.undistort0.apply(img0)?;
        let current = self
            .extractor
            .extract(&self.undistorted0, self.detector.threshold());

        // Predict visible map points from the current pose.
        let (predicted_ids, predicted_positions) = self.map.select_visible_features(
            &self.pose,
            self.calib0.width(),
            self.calib0.height(),
        );

        let matches = self.tracking.track(
            &predicted_ids,
            &predicted_positions,
            &current,
            &self.descriptor_db,
        );

        // Build the validated 3D-2D correspondence set.
        let mut points3d = Vec::new();
        let mut points2d = Vec::new();
        let mut matched_left: HashSet<usize> = HashSet::new();
        let mut tracked_observations: Vec<(MapPointId, Vector2<f64>)> = Vec::new();

        for (i, m) in matches.iter().enumerate() {
            let Some(f1) = m.feature1 else { continue };
            let point_id = predicted_ids[i];

            let Some(feature) = self.map.feature(point_id) else { continue };
            let Some(anchor) = feature.anchor_keyframe() else { continue };
            let Some(keyframe) = self.map.keyframe(anchor) else { continue };
            let Some(entry) = self.descriptor_db.get(point_id) else { continue };

            let current_pos = current.features[f1].position();
            if !check_feature_sad(
                &entry.position,
                &current_pos,
                keyframe.image(),
                &self.undistorted0,
            ) {
                continue;
            }

            points3d.push(feature.position());
            points2d.push(current_pos);
            matched_left.insert(f1);
            tracked_observations.push((point_id, current_pos));
        }

        let num_tracked = points3d.len();

        if num_tracked >= self.config.min_pose_correspondences {
            let refinement = refine_pose(
                &points3d,
                &points2d,
                self.calib0.intrinsics(),
                &self.pose,
                &self.config.pose,
            );
            debug!(
                initial_cost = refinement.initial_cost,
                final_cost = refinement.final_cost,
                iterations = refinement.iterations,
                "pose refined"
            );
            self.pose = refinement.pose;

            let matrix = self.pose.matrix();
            self.events.pose_changed.notify(&matrix);
        } else {
            debug!(num_tracked, "too few correspondences, pose kept");
        }

        // Keyframe decision against the active keyframe known so far.
        let active_distance = self
            .active_keyframe
            .and_then(|id| self.map.keyframe(id))
            .map(|kf| kf.distance(&self.pose));

        if self.config.keyframe.decide(num_tracked, active_distance) == KeyframeAction::NewKeyframe
        {
            self.spawn_keyframe(img1, &current, &matched_left, &tracked_observations)?;
        }

        let last_active = self.active_keyframe;
        self.active_keyframe = self.map.find_closest_keyframe(&self.pose);
        if self.active_keyframe != last_active {
            if let Some(id) = self.active_keyframe {
                debug!(%id, "active keyframe changed");
            }
        }

        self.detector.update(current.len());
        self.events.tracked_points.notify(&num_tracked);
        Ok(())
    }

    /// Undistort the right view, stereo-match, triangulate and insert a
    /// keyframe with the tracked and newly created measurements.
    fn spawn_keyframe(
        &mut self,
        img1: &GrayImage,
        current: &FeatureSet,
        matched_left: &HashSet<usize>,
        tracked_observations: &[(MapPointId, Vector2<f64>)],
    ) -> Result<()> {
        let undistorted1 = self.undistort1.apply(img1)?;
        let right = self
            .extractor
            .extract(&undistorted1, self.detector.threshold());

        let stereo_matches = self
            .stereo_matcher
            .match_epipolar(current, &right, matched_left);

        if !stereo_matches.iter().any(|m| m.is_matched()) {
            debug!("no stereo matches, keyframe skipped");
            self.undistorted1 = undistorted1;
            return Ok(());
        }

        let kf_id = self.map.add_keyframe(self.pose.clone(), self.undistorted0.clone());
        let information = Matrix2::identity() * (1.0 / self.config.tracking_search_radius);

        // Carry over the map points tracked this frame.
        for (point_id, position) in tracked_observations {
            self.map.add_measurement(
                *point_id,
                kf_id,
                MapMeasurement::new(*position, information),
            )?;
        }

        // Triangulate new map points from the remaining stereo matches.
        let proj0 = self.calib0.projection_matrix();
        let proj1 = self.calib1.projection_matrix();
        let mut new_points = 0usize;

        for m in &stereo_matches {
            let Some(f1) = m.feature1 else { continue };

            let p0 = current.features[m.feature0].position();
            let p1 = right.features[f1].position();

            if !check_feature_sad(&p0, &p1, &self.undistorted0, &undistorted1) {
                continue;
            }

            let (c0, c1) = sampson_correct(&p0, &p1, self.stereo_matcher.fundamental());
            let Some(point_rig) = triangulate_dlt(&c0, &c1, &proj0, &proj1) else {
                continue;
            };

            let depth = self
                .calib0
                .extrinsics()
                .transform_homogeneous(&point_rig)
                .z;
            if depth <= self.config.min_triangulation_depth
                || depth >= self.config.max_triangulation_depth
            {
                continue;
            }

            let error = symmetric_reprojection_error(&point_rig, &p0, &p1, &proj0, &proj1);
            if error >= self.config.max_triangulation_reproj_error {
                debug!(error, "triangulation rejected");
                continue;
            }

            let world = self.pose.inverse().transform_homogeneous(&point_rig);
            let feature = MapFeature::new(world, Matrix4::identity());
            let id = self.map.add_feature_to_keyframe(
                feature,
                MapMeasurement::new(p0, information),
                kf_id,
            )?;
            self.descriptor_db
                .add(id, current.descriptors[m.feature0], p0);
            new_points += 1;
        }

        info!(%kf_id, new_points, tracked = tracked_observations.len(), "new keyframe");

        // Re-optimize once a second keyframe ties the map together.
        if self.map.num_keyframes() > 1 {
            self.optimizer.run(&self.map)?;
            self.optimizer.join(&mut self.map);
        }

        self.events.map_changed.notify(&self.map);
        self.events.keyframe_added.notify(&kf_id);
        self.undistorted1 = undistorted1;
        Ok(())
    }

    /// Reset the session: empty map and descriptor database, identity pose.
    ///
    /// Blocks on any in-flight bundle adjustment first so the map is never
    /// mutated concurrently with an optimization pass.
    pub fn clear(&mut self) {
        if self.optimizer.is_running() {
            self.optimizer.join(&mut self.map);
        }
        self.map.clear();
        self.descriptor_db.clear();
        self.pose = SE3::identity();
        self.active_keyframe = None;
    }

    pub fn map(&self) -> &SlamMap {
        &self.map
    }

    pub fn pose(&self) -> &SE3 {
        &self.pose
    }

    pub fn active_keyframe(&self) -> Option<KeyframeId> {
        self.active_keyframe
    }

    pub fn descriptor_database(&self) -> &DescriptorDatabase {
        &self.descriptor_db
    }

    /// The last rectified image of the given view (0 = left, 1 = right).
    pub fn undistorted(&self, idx: usize) -> &GrayImage {
        if idx == 0 {
            &self.undistorted0
        } else {
            &self.undistorted1
        }
    }

    /// The corner threshold the detector controller currently commands.
    pub fn detector_threshold(&self) -> u8 {
        self.detector.threshold()
    }
}
