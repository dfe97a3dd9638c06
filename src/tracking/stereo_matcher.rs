//! Epipolar-constrained matching between the two rectified stereo views.

use std::collections::HashSet;

use nalgebra::Matrix3;

use crate::camera::CameraCalibration;
use crate::features::{FeatureMatch, FeatureSet};
use crate::geometry::triangulation::{epipolar_line_distance, fundamental_matrix};

/// Matches left-view features against right-view features.
///
/// A candidate pair must lie within `max_line_distance` pixels of the
/// epipolar line induced by the rig's fundamental matrix and within
/// `max_descriptor_distance` Hamming distance; the nearest descriptor wins
/// and each right feature is used at most once.
pub struct StereoMatcher {
    fundamental: Matrix3<f64>,
    max_line_distance: f64,
    max_descriptor_distance: u32,
}

impl StereoMatcher {
    pub fn new(
        calib0: &CameraCalibration,
        calib1: &CameraCalibration,
        max_line_distance: f64,
        max_descriptor_distance: u32,
    ) -> Self {
        let fundamental = fundamental_matrix(
            calib0.intrinsics(),
            calib0.extrinsics(),
            calib1.intrinsics(),
            calib1.extrinsics(),
        );
        Self {
            fundamental,
            max_line_distance,
            max_descriptor_distance,
        }
    }

    pub fn fundamental(&self) -> &Matrix3<f64> {
        &self.fundamental
    }

    /// Match `set0` (left) against `set1` (right), skipping left features in
    /// `skip0` (those already matched against the map).
    ///
    /// One entry is produced per considered left feature; entries with no
    /// valid partner carry `feature1: None`.
    pub fn match_epipolar(
        &self,
        set0: &FeatureSet,
        set1: &FeatureSet,
        skip0: &HashSet<usize>,
    ) -> Vec<FeatureMatch> {
        let mut used1 = vec![false; set1.len()];
        let mut matches = Vec::new();

        for idx0 in 0..set0.len() {
            if skip0.contains(&idx0) {
                continue;
            }

            let p0 = set0.features[idx0].position();
            let d0 = &set0.descriptors[idx0];
            let mut m = FeatureMatch::unmatched(idx0);

            for idx1 in 0..set1.len() {
                if used1[idx1] {
                    continue;
                }

                let p1 = set1.features[idx1].position();
                if epipolar_line_distance(&self.fundamental, &p0, &p1) > self.max_line_distance {
                    continue;
                }

                let dist = d0.hamming(&set1.descriptors[idx1]);
                if dist <= self.max_descriptor_distance && dist < m.distance {
                    m.feature1 = Some(idx1);
                    m.distance = dist;
                }
            }

            if let Some(idx1) = m.feature1 {
                used1[idx1] = true;
            }
            matches.push(m);
        }

        matches
    }
}
