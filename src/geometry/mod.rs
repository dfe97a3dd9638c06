//! Geometry utilities: SE3 transforms, triangulation, epipolar tools.

pub mod se3;
pub mod triangulation;

pub use se3::SE3;
pub use triangulation::{
    fundamental_matrix, sampson_correct, symmetric_reprojection_error, triangulate_dlt,
};
