//! The persistent SLAM map: keyframes, 3D map features and measurements.

pub mod keyframe;
pub mod map_feature;
pub mod slam_map;
pub mod types;

pub use keyframe::Keyframe;
pub use map_feature::{MapFeature, MapMeasurement};
pub use slam_map::SlamMap;
pub use types::{KeyframeId, MapPointId};
