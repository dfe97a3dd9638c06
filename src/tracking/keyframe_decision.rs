//! Keyframe creation policy.
//!
//! A hysteresis rule on the distance to the active keyframe: never re-key
//! on pixel-level jitter (the `min` floor), always re-key after large
//! motion (the `max` bound), and re-key on weak tracking only once the rig
//! has moved at least the floor distance.

use serde::{Deserialize, Serialize};

/// Outcome of the per-frame keyframe decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyframeAction {
    /// Keep tracking against the active keyframe.
    Continue,
    /// Spawn a new keyframe from the current stereo pair.
    NewKeyframe,
}

/// Thresholds of the keyframe decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyframePolicy {
    /// Below this rig distance the map is never re-keyed.
    pub min_keyframe_distance: f64,
    /// Above this rig distance a new keyframe is always created.
    pub max_keyframe_distance: f64,
    /// Tracking is considered weak below this feature count.
    pub min_tracked_features: usize,
}

impl Default for KeyframePolicy {
    fn default() -> Self {
        Self {
            min_keyframe_distance: 0.1,
            max_keyframe_distance: 0.2,
            min_tracked_features: 50,
        }
    }
}

impl KeyframePolicy {
    /// Decide whether the current frame should become a keyframe.
    ///
    /// `active_kf_distance` is the rig distance to the active keyframe;
    /// `None` (no keyframe yet) forces creation.
    pub fn decide(
        &self,
        num_tracked_features: usize,
        active_kf_distance: Option<f64>,
    ) -> KeyframeAction {
        let kf_dist = active_kf_distance.unwrap_or(self.min_keyframe_distance + 1.0);

        if kf_dist > self.max_keyframe_distance {
            return KeyframeAction::NewKeyframe;
        }

        if num_tracked_features < self.min_tracked_features
            && kf_dist > self.min_keyframe_distance
        {
            return KeyframeAction::NewKeyframe;
        }

        KeyframeAction::Continue
    }
}
