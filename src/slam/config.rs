//! Session configuration.
//!
//! All tuned constants of the pipeline in one serde-friendly struct. The
//! defaults are the reference values; none of them are claimed optimal.

use serde::{Deserialize, Serialize};

use crate::optimizer::BaConfig;
use crate::tracking::detector_control::DetectorThresholds;
use crate::tracking::keyframe_decision::KeyframePolicy;
use crate::tracking::pose_estimation::PoseRefinementConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlamConfig {
    /// Maximum descriptor Hamming distance for any match.
    pub max_descriptor_distance: u32,
    /// Maximum distance to the epipolar line for stereo matches, pixels.
    pub max_epipolar_distance: f64,
    /// Search radius around a predicted map-point position, pixels.
    pub tracking_search_radius: f64,
    /// Maximum mean reprojection error of an accepted triangulation, pixels.
    pub max_triangulation_reproj_error: f64,
    /// Accepted triangulation depth range (exclusive bounds), camera frame.
    pub min_triangulation_depth: f64,
    pub max_triangulation_depth: f64,
    /// Pose estimation is skipped below this correspondence count.
    pub min_pose_correspondences: usize,
    /// Keyframe creation hysteresis.
    pub keyframe: KeyframePolicy,
    /// Adaptive detector threshold tuning.
    pub detector: DetectorThresholds,
    /// Pose refinement solver settings.
    pub pose: PoseRefinementConfig,
    /// Bundle adjustment solver settings.
    pub bundle_adjustment: BaConfig,
}

impl Default for SlamConfig {
    fn default() -> Self {
        Self {
            max_descriptor_distance: 70,
            max_epipolar_distance: 5.0,
            tracking_search_radius: 50.0,
            max_triangulation_reproj_error: 7.0,
            min_triangulation_depth: 0.0,
            max_triangulation_depth: 30.0,
            min_pose_correspondences: 6,
            keyframe: KeyframePolicy::default(),
            detector: DetectorThresholds::default(),
            pose: PoseRefinementConfig::default(),
            bundle_adjustment: BaConfig::default(),
        }
    }
}
