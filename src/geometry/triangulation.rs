//! Two-view triangulation and epipolar geometry.
//!
//! Triangulation follows the direct linear transform: each view contributes
//! two rows to a 4x4 system whose null space (smallest singular vector) is
//! the homogeneous 3D point. Correspondences are first nudged onto the
//! epipolar constraint with a first-order Sampson correction.

use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector2, Vector3, Vector4};

use super::SE3;

/// Triangulate a homogeneous 3D point from two pixel observations and the
/// cameras' 3x4 projection matrices (intrinsics times extrinsics).
///
/// The result is normalized to unit fourth coordinate and expressed in the
/// frame the projection matrices project from. Returns `None` when the
/// system is degenerate (point at infinity).
pub fn triangulate_dlt(
    p0: &Vector2<f64>,
    p1: &Vector2<f64>,
    proj0: &Matrix3x4<f64>,
    proj1: &Matrix3x4<f64>,
) -> Option<Vector4<f64>> {
    let mut a = Matrix4::<f64>::zeros();

    for j in 0..4 {
        a[(0, j)] = p0.x * proj0[(2, j)] - proj0[(0, j)];
        a[(1, j)] = p0.y * proj0[(2, j)] - proj0[(1, j)];
        a[(2, j)] = p1.x * proj1[(2, j)] - proj1[(0, j)];
        a[(3, j)] = p1.y * proj1[(2, j)] - proj1[(1, j)];
    }

    let svd = a.svd(true, true);
    let v = svd.v_t?.transpose();
    let x = v.column(3);

    if x[3].abs() < 1e-12 {
        return None;
    }

    Some(Vector4::new(x[0] / x[3], x[1] / x[3], x[2] / x[3], 1.0))
}

/// Mean reprojection distance of a homogeneous point over both views.
pub fn symmetric_reprojection_error(
    point: &Vector4<f64>,
    p0: &Vector2<f64>,
    p1: &Vector2<f64>,
    proj0: &Matrix3x4<f64>,
    proj1: &Matrix3x4<f64>,
) -> f64 {
    let mut error = 0.0;

    for (proj, observed) in [(proj0, p0), (proj1, p1)] {
        let repr = proj * point;
        let reprojected = Vector2::new(repr.x / repr.z, repr.y / repr.z);
        error += (observed - reprojected).norm();
    }

    error / 2.0
}

/// Fundamental matrix of a calibrated two-camera rig.
///
/// `extrinsics` are rig-to-camera transforms. The returned matrix satisfies
/// `x1^T F x0 = 0` for corresponding pixel coordinates, i.e. `F * x0` is the
/// epipolar line in view 1.
pub fn fundamental_matrix(
    intrinsics0: &Matrix3<f64>,
    extrinsics0: &SE3,
    intrinsics1: &Matrix3<f64>,
    extrinsics1: &SE3,
) -> Matrix3<f64> {
    // Relative transform taking camera-0 coordinates into camera 1.
    let rel = extrinsics1.compose(&extrinsics0.inverse());
    let r = rel.rotation.to_rotation_matrix();
    let t = rel.translation;

    let essential = skew(&t) * r.matrix();

    let k0_inv = intrinsics0
        .try_inverse()
        .unwrap_or_else(Matrix3::identity);
    let k1_inv = intrinsics1
        .try_inverse()
        .unwrap_or_else(Matrix3::identity);

    k1_inv.transpose() * essential * k0_inv
}

/// Distance of the correspondence `(p0, p1)` from the epipolar line `F p0`
/// in view 1, in pixels.
pub fn epipolar_line_distance(f: &Matrix3<f64>, p0: &Vector2<f64>, p1: &Vector2<f64>) -> f64 {
    let line = f * Vector3::new(p0.x, p0.y, 1.0);
    let den = (line.x * line.x + line.y * line.y).sqrt();
    if den < 1e-12 {
        return f64::MAX;
    }
    (line.x * p1.x + line.y * p1.y + line.z).abs() / den
}

/// First-order Sampson correction of a correspondence pair toward the
/// epipolar constraint `x1^T F x0 = 0`.
pub fn sampson_correct(
    p0: &Vector2<f64>,
    p1: &Vector2<f64>,
    f: &Matrix3<f64>,
) -> (Vector2<f64>, Vector2<f64>) {
    let x0 = Vector3::new(p0.x, p0.y, 1.0);
    let x1 = Vector3::new(p1.x, p1.y, 1.0);

    let line1 = f * x0;
    let line0 = f.transpose() * x1;
    let residual = x1.dot(&line1);

    let den = line1.x * line1.x + line1.y * line1.y + line0.x * line0.x + line0.y * line0.y;
    if den < 1e-12 {
        return (*p0, *p1);
    }
    let lambda = residual / den;

    (
        Vector2::new(p0.x - lambda * line0.x, p0.y - lambda * line0.y),
        Vector2::new(p1.x - lambda * line1.x, p1.y - lambda * line1.y),
    )
}

fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}
