//! Bundle adjustment in three phases.
//!
//! 1. **Collect**: snapshot poses, points and measurements out of the map.
//! 2. **Solve**: Levenberg-Marquardt over all keyframe poses (the oldest
//!    stays fixed as gauge anchor) and all feature positions, using the
//!    measurements' information weights and a Huber kernel.
//! 3. **Apply**: write refined poses and positions back into the map.
//!
//! The solve phase owns its data completely, so it can run on a worker
//! thread without the map being locked; entities deleted in the meantime
//! are skipped silently on apply.

use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix2x6, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;
use crate::map::{KeyframeId, MapPointId, SlamMap};

/// Residual assigned to points that fall behind a camera.
const BEHIND_CAMERA_RESIDUAL: f64 = 100.0;

/// Solver settings for bundle adjustment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaConfig {
    /// Hard iteration cap.
    pub max_iterations: usize,
    /// Huber kernel threshold in pixels.
    pub huber_threshold: f64,
    /// Stop once an accepted step improves the squared cost by less.
    pub cost_decrease_threshold: f64,
}

impl Default for BaConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            huber_threshold: 5.991_f64.sqrt(), // chi2 95% with 2 DOF
            cost_decrease_threshold: 1e-6,
        }
    }
}

/// One measurement edge of the problem.
#[derive(Debug, Clone)]
pub struct BaObservation {
    kf_index: usize,
    point_index: usize,
    observed: Vector2<f64>,
    /// Scalar information weight of the measurement.
    weight: f64,
}

/// Snapshot of everything the solver needs, detached from the map.
#[derive(Debug, Clone)]
pub struct BaProblem {
    intrinsics: Matrix3<f64>,
    keyframes: Vec<(KeyframeId, SE3)>,
    points: Vec<(MapPointId, Vector3<f64>)>,
    observations: Vec<BaObservation>,
}

/// Refined values ready to be merged back into the map.
#[derive(Debug, Clone)]
pub struct BaSolution {
    pub poses: Vec<(KeyframeId, SE3)>,
    pub points: Vec<(MapPointId, Vector3<f64>)>,
    /// RMS reprojection error before optimization, in pixels.
    pub initial_error: f64,
    /// RMS reprojection error after optimization, in pixels.
    pub final_error: f64,
    pub iterations: usize,
}

/// PHASE 1: snapshot the map into a self-contained problem.
///
/// Returns `None` when there is nothing to optimize (fewer than two
/// keyframes, or no measurements).
pub fn collect_ba_problem(map: &SlamMap) -> Option<BaProblem> {
    if map.num_keyframes() < 2 {
        return None;
    }

    let mut keyframes: Vec<(KeyframeId, SE3)> = map
        .keyframes()
        .map(|kf| (kf.id(), kf.pose().clone()))
        .collect();
    keyframes.sort_by_key(|(id, _)| *id);

    let mut points: Vec<(MapPointId, Vector3<f64>)> = map
        .features()
        .map(|(&id, feature)| (id, feature.position()))
        .collect();
    points.sort_by_key(|(id, _)| *id);

    let kf_index: std::collections::HashMap<KeyframeId, usize> = keyframes
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (*id, i))
        .collect();
    let point_index: std::collections::HashMap<MapPointId, usize> = points
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (*id, i))
        .collect();

    let mut observations = Vec::new();
    for kf in map.keyframes() {
        let kf_idx = kf_index[&kf.id()];
        for (point_id, measurement) in kf.measurements() {
            if let Some(&point_idx) = point_index.get(point_id) {
                observations.push(BaObservation {
                    kf_index: kf_idx,
                    point_index: point_idx,
                    observed: measurement.point,
                    weight: measurement.information[(0, 0)].max(1e-12),
                });
            }
        }
    }

    if observations.is_empty() || points.is_empty() {
        return None;
    }

    Some(BaProblem {
        intrinsics: *map.intrinsics(),
        keyframes,
        points,
        observations,
    })
}

/// PHASE 2: Levenberg-Marquardt solve. Needs no access to the map.
pub fn solve_ba(problem: &BaProblem, config: &BaConfig) -> BaSolution {
    let num_kf = problem.keyframes.len();
    let num_points = problem.points.len();
    // The oldest keyframe anchors the gauge and is not parameterized.
    let num_params = (num_kf - 1) * 6 + num_points * 3;
    let num_residuals = problem.observations.len() * 2;

    let mut poses: Vec<SE3> = problem.keyframes.iter().map(|(_, p)| p.clone()).collect();
    let mut points: Vec<Vector3<f64>> = problem.points.iter().map(|(_, p)| *p).collect();

    let initial_residuals = residual_vector(problem, &poses, &points, config);
    let mut cost = initial_residuals.norm_squared();
    let initial_error = (cost / num_residuals as f64).sqrt();

    let mut lambda = 1e-3;
    let mut iterations = 0;

    for _ in 0..config.max_iterations {
        iterations += 1;

        let residuals = residual_vector(problem, &poses, &points, config);
        let jacobian = jacobian_matrix(problem, &poses, &points, config, num_params);

        let gradient = jacobian.transpose() * &residuals;
        let mut damped = jacobian.transpose() * &jacobian;
        for i in 0..num_params {
            damped[(i, i)] += lambda * damped[(i, i)].max(1e-6);
        }

        let delta = match damped.lu().solve(&(-&gradient)) {
            Some(d) => d,
            None => break,
        };

        let (trial_poses, trial_points) = apply_step(&poses, &points, &delta);
        let trial_cost = residual_vector(problem, &trial_poses, &trial_points, config)
            .norm_squared();

        if trial_cost < cost {
            let improvement = cost - trial_cost;
            poses = trial_poses;
            points = trial_points;
            cost = trial_cost;
            lambda = (lambda * 0.1).max(1e-10);
            if improvement < config.cost_decrease_threshold {
                break;
            }
        } else {
            lambda = (lambda * 10.0).min(1e10);
        }
    }

    let final_error = (cost / num_residuals as f64).sqrt();

    BaSolution {
        poses: problem
            .keyframes
            .iter()
            .zip(poses)
            .map(|((id, _), pose)| (*id, pose))
            .collect(),
        points: problem
            .points
            .iter()
            .zip(points)
            .map(|((id, _), point)| (*id, point))
            .collect(),
        initial_error,
        final_error,
        iterations,
    }
}

/// PHASE 3: merge refined values back into the map.
///
/// Entities removed from the map while the solver ran are skipped.
/// Returns the number of updated entities.
pub fn apply_ba_solution(map: &mut SlamMap, solution: &BaSolution) -> usize {
    let mut updated = 0;

    for (id, pose) in &solution.poses {
        if let Some(kf) = map.keyframe_mut(*id) {
            kf.set_pose(pose.clone());
            updated += 1;
        }
    }

    for (id, position) in &solution.points {
        if let Some(feature) = map.feature_mut(*id) {
            feature.set_position(*position);
            updated += 1;
        }
    }

    updated
}

fn residual_for(
    problem: &BaProblem,
    pose: &SE3,
    point: &Vector3<f64>,
    observed: &Vector2<f64>,
) -> (Vector2<f64>, Vector3<f64>) {
    let p_rig = pose.transform_point(point);
    if p_rig.z <= 1e-3 {
        return (
            Vector2::new(BEHIND_CAMERA_RESIDUAL, BEHIND_CAMERA_RESIDUAL),
            p_rig,
        );
    }

    let k = &problem.intrinsics;
    let u = k[(0, 0)] * p_rig.x / p_rig.z + k[(0, 2)];
    let v = k[(1, 1)] * p_rig.y / p_rig.z + k[(1, 2)];
    (Vector2::new(observed.x - u, observed.y - v), p_rig)
}

fn residual_vector(
    problem: &BaProblem,
    poses: &[SE3],
    points: &[Vector3<f64>],
    config: &BaConfig,
) -> DVector<f64> {
    let mut residuals = DVector::zeros(problem.observations.len() * 2);

    for (i, obs) in problem.observations.iter().enumerate() {
        let (r, _) = residual_for(
            problem,
            &poses[obs.kf_index],
            &points[obs.point_index],
            &obs.observed,
        );
        let weight = obs.weight * huber_weight(r.norm(), config.huber_threshold);
        let weighted = r * weight.sqrt();
        residuals[i * 2] = weighted.x;
        residuals[i * 2 + 1] = weighted.y;
    }

    residuals
}

fn jacobian_matrix(
    problem: &BaProblem,
    poses: &[SE3],
    points: &[Vector3<f64>],
    config: &BaConfig,
    num_params: usize,
) -> DMatrix<f64> {
    let mut jacobian = DMatrix::zeros(problem.observations.len() * 2, num_params);
    let num_kf_params = (poses.len() - 1) * 6;

    for (i, obs) in problem.observations.iter().enumerate() {
        let pose = &poses[obs.kf_index];
        let point = &points[obs.point_index];
        let (r, p_rig) = residual_for(problem, pose, point, &obs.observed);
        let weight = obs.weight * huber_weight(r.norm(), config.huber_threshold);
        let w_sqrt = weight.sqrt();

        // Pose block (anchor keyframe 0 has no parameters).
        if obs.kf_index > 0 {
            let j_pose = pose_jacobian(&p_rig, &problem.intrinsics) * w_sqrt;
            let col = (obs.kf_index - 1) * 6;
            copy_block::<2, 6>(&mut jacobian, i * 2, col, &j_pose);
        }

        // Point block.
        let j_point = point_jacobian(&p_rig, pose, &problem.intrinsics) * w_sqrt;
        let col = num_kf_params + obs.point_index * 3;
        copy_block::<2, 3>(&mut jacobian, i * 2, col, &j_point);
    }

    jacobian
}

fn copy_block<const R: usize, const C: usize>(
    target: &mut DMatrix<f64>,
    row: usize,
    col: usize,
    block: &nalgebra::SMatrix<f64, R, C>,
) {
    for r in 0..R {
        for c in 0..C {
            target[(row + r, col + c)] = block[(r, c)];
        }
    }
}

/// Jacobian of the residual w.r.t. a camera-frame pose twist [rot | trans].
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

/// Jacobian of the residual w.r.t. the 3D point position in world frame.
fn point_jacobian(
    p_rig: &Vector3<f64>,
    pose: &SE3,
    intrinsics: &Matrix3<f64>,
) -> Matrix2x3<f64> {
    let (x, y, z) = (p_rig.x, p_rig.y, p_rig.z);
    if z.abs() < 1e-6 {
        return Matrix2x3::zeros();
    }

    let invz = 1.0 / z;
    let fx = intrinsics[(0, 0)];
    let fy = intrinsics[(1, 1)];

    let tmp = Matrix2x3::new(fx, 0.0, -fx * x * invz, 0.0, fy, -fy * y * invz);
    let r = pose.rotation.to_rotation_matrix();

    (-invz) * tmp * r.matrix()
}

fn huber_weight(residual_norm: f64, threshold: f64) -> f64 {
    if residual_norm <= threshold {
        1.0
    } else {
        threshold / residual_norm
    }
}

fn apply_step(
    poses: &[SE3],
    points: &[Vector3<f64>],
    delta: &DVector<f64>,
) -> (Vec<SE3>, Vec<Vector3<f64>>) {
    let num_kf_params = (poses.len() - 1) * 6;

    let new_poses: Vec<SE3> = poses
        .iter()
        .enumerate()
        .map(|(k, pose)| {
            if k == 0 {
                pose.clone()
            } else {
                let base = (k - 1) * 6;
                let twist = SE3::from_parts(
                    Vector3::new(delta[base], delta[base + 1], delta[base + 2]),
                    Vector3::new(delta[base + 3], delta[base + 4], delta[base + 5]),
                );
                twist.compose(pose)
            }
        })
        .collect();

    let new_points: Vec<Vector3<f64>> = points
        .iter()
        .enumerate()
        .map(|(p, point)| {
            let base = num_kf_params + p * 3;
            point + Vector3::new(delta[base], delta[base + 1], delta[base + 2])
        })
        .collect();

    (new_poses, new_points)
}
