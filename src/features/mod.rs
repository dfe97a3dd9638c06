//! Feature primitives: keypoints, binary descriptors, matches and the
//! descriptor database used for map-point re-identification.

pub mod database;
pub mod descriptor;
pub mod extractor;
pub mod matches;

pub use database::{DescriptorDatabase, DescriptorEntry};
pub use descriptor::Descriptor;
pub use extractor::{Feature, FeatureExtractor, FeatureSet};
pub use matches::FeatureMatch;
