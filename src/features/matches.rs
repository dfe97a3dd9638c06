//! Feature correspondence candidates.

/// A match candidate pairing a query feature with its best partner.
///
/// `feature1` is `None` when no partner passed the matching gates. Every
/// consumer has to pattern-match on it; unmatched candidates are carried
/// through so callers can account for them.
#[derive(Debug, Clone, Copy)]
pub struct FeatureMatch {
    /// Index of the query feature (view 0, or the predicted-point slot when
    /// matching against the map).
    pub feature0: usize,
    /// Index of the matched feature in the other set, if any.
    pub feature1: Option<usize>,
    /// Descriptor Hamming distance of the match; `u32::MAX` when unmatched.
    pub distance: u32,
}

impl FeatureMatch {
    pub fn unmatched(feature0: usize) -> Self {
        Self {
            feature0,
            feature1: None,
            distance: u32::MAX,
        }
    }

    pub fn is_matched(&self) -> bool {
        self.feature1.is_some()
    }
}
