//! Adaptive corner-detector threshold.
//!
//! A bounded hill-climbing controller: lower the threshold when the
//! extractor starves, raise it when it floods. The steps and bounds are
//! hand-tuned constants carried as configuration, not re-derived.

use serde::{Deserialize, Serialize};

/// Tuning of the adaptive detector threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorThresholds {
    /// Initial corner threshold handed to the feature extractor.
    pub corner_threshold: u8,
    /// Upper bound on extracted features before the threshold is raised.
    pub max_features: usize,
    /// Feature count below which the threshold is lowered.
    pub low_feature_count: usize,
    /// Step subtracted when lowering.
    pub decrease_step: u8,
    /// The threshold is only lowered while strictly above this floor.
    pub decrease_floor: u8,
    /// Step added when raising.
    pub increase_step: u8,
    /// The threshold is only raised while strictly below this ceiling.
    pub increase_ceiling: u8,
}

impl Default for DetectorThresholds {
    fn default() -> Self {
        Self {
            corner_threshold: 10,
            max_features: 2000,
            low_feature_count: 100,
            decrease_step: 5,
            decrease_floor: 15,
            increase_step: 2,
            increase_ceiling: 40,
        }
    }
}

/// Per-frame negative-feedback controller for the corner threshold.
#[derive(Debug, Clone)]
pub struct DetectorController {
    threshold: u8,
    config: DetectorThresholds,
}

impl DetectorController {
    pub fn new(config: DetectorThresholds) -> Self {
        Self {
            threshold: config.corner_threshold,
            config,
        }
    }

    /// The threshold to use for the next extraction.
    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Adjust the threshold from the number of features just extracted.
    pub fn update(&mut self, extracted_features: usize) {
        if extracted_features < self.config.low_feature_count
            && self.threshold > self.config.decrease_floor
        {
            self.threshold = self.threshold.saturating_sub(self.config.decrease_step);
        } else if extracted_features > self.config.max_features
            && self.threshold < self.config.increase_ceiling
        {
            self.threshold = self.threshold.saturating_add(self.config.increase_step);
        }
    }
}
