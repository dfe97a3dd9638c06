//! Robust pose refinement from 3D-2D correspondences.
//!
//! Minimizes Huber-weighted reprojection error with Levenberg-Marquardt.
//! The pose is updated multiplicatively: each iteration solves for a small
//! camera-frame twist (axis-angle rotation + translation) that is composed
//! onto the current estimate, so the analytic 2x6 Jacobian is exact at the
//! linearization point. The initial guess is the previous rig pose; callers
//! gate on a minimum correspondence count before invoking this.

use nalgebra::{Matrix2x6, Matrix3, Matrix6, Vector2, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;

/// Residual assigned to points that fall behind the camera.
const BEHIND_CAMERA_RESIDUAL: f64 = 100.0;

/// Termination and robustness settings of the pose solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoseRefinementConfig {
    /// Huber kernel threshold in pixels.
    pub huber_threshold: f64,
    /// Stop once an accepted step improves the cost by less than this.
    pub cost_decrease_threshold: f64,
    /// Hard iteration cap.
    pub max_iterations: usize,
}

impl Default for PoseRefinementConfig {
    fn default() -> Self {
        Self {
            huber_threshold: 5.0,
            cost_decrease_threshold: 0.001,
            max_iterations: 10,
        }
    }
}

/// Outcome of a pose refinement.
#[derive(Debug, Clone)]
pub struct PoseRefinement {
    pub pose: SE3,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
}

/// Refine a world-to-rig pose so the 3D world points project onto their
/// 2D observations.
pub fn refine_pose(
    points3d: &[Vector3<f64>],
    observations: &[Vector2<f64>],
    intrinsics: &Matrix3<f64>,
    initial_pose: &SE3,
    config: &PoseRefinementConfig,
) -> PoseRefinement {
    debug_assert_eq!(points3d.len(), observations.len());

    let mut pose = initial_pose.clone();
    let mut cost = total_cost(&pose, points3d, observations, intrinsics, config);
    let initial_cost = cost;

    let mut lambda = 1e-3;
    let mut iterations = 0;

    for _ in 0..config.max_iterations {
        iterations += 1;

        let mut h = Matrix6::<f64>::zeros();
        let mut g = Vector6::<f64>::zeros();

        for (point, observed) in points3d.iter().zip(observations.iter()) {
            let p_rig = pose.transform_point(point);
            let residual = reprojection_residual(&p_rig, observed, intrinsics);
            let weight = huber_weight(residual.norm(), config.huber_threshold);
            let jac = pose_jacobian(&p_rig, intrinsics);

            h += weight * jac.transpose() * jac;
            g += weight * jac.transpose() * residual;
        }

        let mut damped = h;
        for i in 0..6 {
            damped[(i, i)] += lambda * damped[(i, i)].max(1e-6);
        }

        let delta = match damped.lu().solve(&(-g)) {
            Some(d) => d,
            None => break,
        };

        let twist = SE3::from_parts(
            Vector3::new(delta[0], delta[1], delta[2]),
            Vector3::new(delta[3], delta[4], delta[5]),
        );
        let trial = twist.compose(&pose);
        let trial_cost = total_cost(&trial, points3d, observations, intrinsics, config);

        if trial_cost < cost {
            let improvement = cost - trial_cost;
            pose = trial;
            cost = trial_cost;
            lambda = (lambda * 0.1).max(1e-10);
            if improvement < config.cost_decrease_threshold {
                break;
            }
        } else {
            lambda = (lambda * 10.0).min(1e10);
        }
    }

    PoseRefinement {
        pose,
        initial_cost,
        final_cost: cost,
        iterations,
    }
}

/// Residual `observed - projected` for a point already in rig coordinates.
fn reprojection_residual(
    p_rig: &Vector3<f64>,
    observed: &Vector2<f64>,
    intrinsics: &Matrix3<f64>,
) -> Vector2<f64> {
    if p_rig.z <= 1e-3 {
        return Vector2::new(BEHIND_CAMERA_RESIDUAL, BEHIND_CAMERA_RESIDUAL);
    }

    let u = intrinsics[(0, 0)] * p_rig.x / p_rig.z + intrinsics[(0, 2)];
    let v = intrinsics[(1, 1)] * p_rig.y / p_rig.z + intrinsics[(1, 2)];
    Vector2::new(observed.x - u, observed.y - v)
}

/// Jacobian of the residual w.r.t. a camera-frame twist [rot | trans].
fn pose_jacobian(p_rig: &Vector3<f64>, intrinsics: &Matrix3<f64>) -> Matrix2x6<f64> {
    let (x, y, z) = (p_rig.x, p_rig.y, p_rig.z);
    if z.abs() < 1e-6 {
        return Matrix2x6::zeros();
    }

    let invz = 1.0 / z;
    let invz2 = invz * invz;
    let fx = intrinsics[(0, 0)];
    let fy = intrinsics[(1, 1)];

    Matrix2x6::new(
        x * y * invz2 * fx,
        -(1.0 + x * x * invz2) * fx,
        y * invz * fx,
        -invz * fx,
        0.0,
        x * invz2 * fx,
        (1.0 + y * y * invz2) * fy,
        -x * y * invz2 * fy,
        -x * invz * fy,
        0.0,
        -invz * fy,
        y * invz2 * fy,
    )
}

fn huber_weight(residual_norm: f64, threshold: f64) -> f64 {
    if residual_norm <= threshold {
        1.0
    } else {
        threshold / residual_norm
    }
}

fn total_cost(
    pose: &SE3,
    points3d: &[Vector3<f64>],
    observations: &[Vector2<f64>],
    intrinsics: &Matrix3<f64>,
    config: &PoseRefinementConfig,
) -> f64 {
    points3d
        .iter()
        .zip(observations.iter())
        .map(|(point, observed)| {
            let residual =
                reprojection_residual(&pose.transform_point(point), observed, intrinsics);
            let norm = residual.norm();
            huber_weight(norm, config.huber_threshold) * norm * norm
        })
        .sum()
}
