//! Matching predicted map points against current-frame features.
//!
//! Candidates are gated twice: a pixel-radius search around the predicted
//! position with nearest-descriptor selection, and a patch-similarity check
//! (normalized SAD) that rejects matches that look right to the descriptor
//! but not to the pixels (aliasing, repetitive texture).

use image::GrayImage;
use nalgebra::Vector2;

use crate::features::{DescriptorDatabase, FeatureMatch, FeatureSet};
use crate::map::MapPointId;

/// Side length of the SAD comparison patch.
const PATCH_SIZE: i64 = 16;
/// Half-window: patches are centered with this offset.
const PATCH_HALF: i64 = 8;
/// Minimum normalized SAD similarity for a correspondence to pass.
const MIN_SAD_SIMILARITY: f64 = 0.75;

/// Radius-and-descriptor matcher for predicted map points.
#[derive(Debug, Clone)]
pub struct FeatureTracking {
    search_radius: f64,
    max_descriptor_distance: u32,
}

impl FeatureTracking {
    pub fn new(search_radius: f64, max_descriptor_distance: u32) -> Self {
        Self {
            search_radius,
            max_descriptor_distance,
        }
    }

    /// Match each predicted map point against the current features.
    ///
    /// The result is index-aligned with `predicted_ids`: entry `i` holds the
    /// best current-frame feature within the search radius of
    /// `predicted_positions[i]` whose descriptor distance passes the gate,
    /// or an unmatched entry if none does.
    pub fn track(
        &self,
        predicted_ids: &[MapPointId],
        predicted_positions: &[Vector2<f64>],
        current: &FeatureSet,
        database: &DescriptorDatabase,
    ) -> Vec<FeatureMatch> {
        debug_assert_eq!(predicted_ids.len(), predicted_positions.len());

        let radius_sq = self.search_radius * self.search_radius;
        let mut matches = Vec::with_capacity(predicted_ids.len());

        for (i, (&id, predicted)) in predicted_ids
            .iter()
            .zip(predicted_positions.iter())
            .enumerate()
        {
            let mut m = FeatureMatch::unmatched(i);

            if let Some(entry) = database.get(id) {
                for (j, feature) in current.features.iter().enumerate() {
                    let d = feature.position() - predicted;
                    if d.norm_squared() > radius_sq {
                        continue;
                    }

                    let dist = entry.descriptor.hamming(&current.descriptors[j]);
                    if dist <= self.max_descriptor_distance && dist < m.distance {
                        m.feature1 = Some(j);
                        m.distance = dist;
                    }
                }
            }

            matches.push(m);
        }

        matches
    }
}

/// Validate a candidate correspondence by normalized patch SAD.
///
/// Compares a 16x16 patch centered (with an 8-pixel half-window) on the
/// rounded positions `p0` in `img0` and `p1` in `img1`. Returns true iff the
/// normalized similarity exceeds 0.75. Patches that would cross an image
/// border are rejected outright.
pub fn check_feature_sad(
    p0: &Vector2<f64>,
    p1: &Vector2<f64>,
    img0: &GrayImage,
    img1: &GrayImage,
) -> bool {
    let (x0, y0) = (p0.x.round() as i64, p0.y.round() as i64);
    let (x1, y1) = (p1.x.round() as i64, p1.y.round() as i64);

    if !patch_in_bounds(x0, y0, img0) || !patch_in_bounds(x1, y1, img1) {
        return false;
    }

    let mut sad = 0u32;
    for dy in -PATCH_HALF..PATCH_HALF {
        for dx in -PATCH_HALF..PATCH_HALF {
            let a = img0.get_pixel((x0 + dx) as u32, (y0 + dy) as u32).0[0];
            let b = img1.get_pixel((x1 + dx) as u32, (y1 + dy) as u32).0[0];
            sad += a.abs_diff(b) as u32;
        }
    }

    let similarity = 1.0 - sad as f64 / ((PATCH_SIZE * PATCH_SIZE * 256) as f64);
    similarity > MIN_SAD_SIMILARITY
}

fn patch_in_bounds(x: i64, y: i64, img: &GrayImage) -> bool {
    let (w, h) = img.dimensions();
    x - PATCH_HALF >= 0
        && y - PATCH_HALF >= 0
        && x + PATCH_HALF <= w as i64
        && y + PATCH_HALF <= h as i64
}
