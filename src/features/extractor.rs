//! Keypoints and the feature-extractor boundary.
//!
//! Feature detection and description is an external collaborator: the SLAM
//! core only consumes the produced keypoint/descriptor sets through the
//! [`FeatureExtractor`] trait. The corner threshold is passed per call
//! because the orchestrator retunes it every frame.

use image::GrayImage;
use nalgebra::Vector2;

use super::Descriptor;

/// A detected 2D keypoint.
#[derive(Debug, Clone, Copy)]
pub struct Feature {
    /// Sub-pixel position in the (undistorted) image.
    pub pt: Vector2<f32>,
    /// Detector response strength.
    pub response: f32,
    /// Pyramid octave the feature was detected on.
    pub octave: u8,
}

impl Feature {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            pt: Vector2::new(x, y),
            response: 0.0,
            octave: 0,
        }
    }

    /// Position in double precision, as used by the geometry code.
    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.pt.x as f64, self.pt.y as f64)
    }
}

/// Keypoints with their descriptors, index-aligned.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub features: Vec<Feature>,
    pub descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn new(features: Vec<Feature>, descriptors: Vec<Descriptor>) -> Self {
        debug_assert_eq!(features.len(), descriptors.len());
        Self {
            features,
            descriptors,
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Producer of keypoints and binary descriptors for a grayscale image.
///
/// Implementations are expected to honor `corner_threshold` as their
/// detector sensitivity; the orchestrator adapts it frame to frame.
pub trait FeatureExtractor: Send {
    fn extract(&mut self, image: &GrayImage, corner_threshold: u8) -> FeatureSet;
}
