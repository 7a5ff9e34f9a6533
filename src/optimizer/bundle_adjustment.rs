//! Bundle adjustment: joint refinement of keyframe poses and point positions.
//!
//! Minimizes the robust (Huber) reprojection error
//!
//! ```text
//! E = Σ_ij ρ(‖u_ij − π(T_i, p_j)‖²_Σ)
//! ```
//!
//! with Levenberg-Marquardt. The normal equations are reduced to the pose
//! block with the Schur complement: the point block is 3×3 block-diagonal,
//! so each point is eliminated on its own and only the (small) reduced
//! camera system is factorized.
//!
//! A step is only accepted when it lowers the total cost, so the state held
//! at any time is the best one seen. Running out of iterations keeps it and
//! reports `converged = false`.
//!
//! The usual three-phase pattern applies:
//! 1. COLLECT: [`BundleProblem::collect_local`] / [`BundleProblem::collect_global`] under a read view
//! 2. SOLVE: [`BundleAdjuster::solve`] without locks
//! 3. APPLY: [`BundleSolution::to_correction`] through `MapManager::apply_correction`

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{DMatrix, DVector, Matrix3, Matrix6x3, Vector2, Vector3, Vector6};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::projection::{huber_cost, huber_weight, project_with_jacobians};
use crate::geometry::two_view::CHI2_TWO_DOF;
use crate::geometry::{CameraModel, SE3};
use crate::map::{KeyFrameId, Map, MapCorrection, MapPointId};

/// Cost charged to an observation that falls behind its camera.
const BEHIND_CAMERA_COST: f64 = 1e6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleAdjustmentConfig {
    /// Keyframes optimized by local BA, the new keyframe included.
    pub local_window: usize,
    pub local_iterations: usize,
    pub global_iterations: usize,
    /// Huber threshold on the whitened residual norm.
    pub huber_threshold: f64,
    /// Observations above this whitened χ² are reported as outliers.
    pub chi2_threshold: f64,
    pub initial_lambda: f64,
    /// Relative cost decrease under which the solver stops.
    pub convergence_threshold: f64,
}

impl Default for BundleAdjustmentConfig {
    fn default() -> Self {
        Self {
            local_window: 10,
            local_iterations: 10,
            global_iterations: 20,
            huber_threshold: CHI2_TWO_DOF.sqrt(),
            chi2_threshold: CHI2_TWO_DOF,
            initial_lambda: 1e-4,
            convergence_threshold: 1e-6,
        }
    }
}

/// How an optimization run ended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizationOutcome {
    /// False when the iteration cap or a stop request ended the run early.
    pub converged: bool,
    pub initial_cost: f64,
    /// Cost of the returned (best) state.
    pub best_cost: f64,
    pub iterations: usize,
    /// Cost after every accepted step, starting with the initial cost.
    pub cost_history: Vec<f64>,
}

impl OptimizationOutcome {
    fn unchanged(cost: f64) -> Self {
        Self {
            converged: true,
            initial_cost: cost,
            best_cost: cost,
            iterations: 0,
            cost_history: vec![cost],
        }
    }
}

/// One pixel measurement of point `point` by camera `camera`.
#[derive(Debug, Clone, Copy)]
pub struct BundleObservation {
    pub camera: usize,
    pub point: usize,
    pub pixel: Vector2<f64>,
    /// Inverse pixel variance of the feature's pyramid level.
    pub information: f64,
}

/// Snapshot of the variables and measurements of one BA run.
#[derive(Debug, Clone, Default)]
pub struct BundleProblem {
    /// World-to-camera poses.
    pub poses: Vec<SE3>,
    /// Poses held constant. At least one is fixed before solving.
    pub fixed: Vec<bool>,
    pub points: Vec<Vector3<f64>>,
    pub observations: Vec<BundleObservation>,
    pub keyframe_ids: Vec<KeyFrameId>,
    pub point_ids: Vec<MapPointId>,
    /// Map version the problem was collected at.
    pub version: u64,
    /// Map epoch the problem was collected at.
    pub epoch: u64,
}

impl BundleProblem {
    /// Local window around `kf_id`: the keyframe and its best covisibles are
    /// optimized together with every point they observe. Other observers of
    /// those points enter fixed. The origin stays fixed when it is in the
    /// window; otherwise the oldest keyframe is fixed if nothing else is.
    pub fn collect_local(map: &Map, kf_id: KeyFrameId, window: usize) -> Option<Self> {
        map.keyframe(kf_id)?;
        let mut local: Vec<KeyFrameId> = vec![kf_id];
        local.extend(map.best_covisibles(kf_id, window.saturating_sub(1)));
        let points = map.map_points_of(&local);
        if points.is_empty() {
            return None;
        }
        let local_set: BTreeSet<KeyFrameId> = local.iter().copied().collect();
        let mut fixed_set: BTreeSet<KeyFrameId> = BTreeSet::new();
        for mp_id in &points {
            if let Some(mp) = map.map_point(*mp_id) {
                fixed_set.extend(mp.observations.keys().filter(|id| !local_set.contains(id)));
            }
        }
        if let Some(origin) = map.origin().filter(|o| local_set.contains(o)) {
            fixed_set.insert(origin);
        }
        if fixed_set.is_empty() {
            if let Some(oldest) = local_set.iter().next() {
                fixed_set.insert(*oldest);
            }
        }
        let keyframes: BTreeSet<KeyFrameId> = local_set.union(&fixed_set).copied().collect();
        Self::collect(map, &keyframes, &fixed_set, &points)
    }

    /// Every keyframe and point; the origin is the gauge.
    pub fn collect_global(map: &Map) -> Option<Self> {
        let keyframes: BTreeSet<KeyFrameId> = map.keyframe_ids().into_iter().collect();
        let points: BTreeSet<MapPointId> = map.map_point_ids().into_iter().collect();
        let fixed: BTreeSet<KeyFrameId> = map.origin().or_else(|| keyframes.iter().next().copied()).into_iter().collect();
        Self::collect(map, &keyframes, &fixed, &points)
    }

    fn collect(
        map: &Map,
        keyframes: &BTreeSet<KeyFrameId>,
        fixed: &BTreeSet<KeyFrameId>,
        points: &BTreeSet<MapPointId>,
    ) -> Option<Self> {
        let levels = map.scale_levels();
        let mut problem = Self {
            version: map.version(),
            epoch: map.epoch(),
            ..Default::default()
        };
        let mut camera_index: BTreeMap<KeyFrameId, usize> = BTreeMap::new();
        for &kf_id in keyframes {
            let Some(kf) = map.keyframe(kf_id) else { continue };
            camera_index.insert(kf_id, problem.poses.len());
            problem.poses.push(kf.pose_cw);
            problem.fixed.push(fixed.contains(&kf_id));
            problem.keyframe_ids.push(kf_id);
        }
        for &mp_id in points {
            let Some(mp) = map.map_point(mp_id) else { continue };
            let point = problem.points.len();
            let mut added = 0;
            for (kf_id, &idx) in &mp.observations {
                let (Some(&camera), Some(kf)) = (camera_index.get(kf_id), map.keyframe(*kf_id)) else {
                    continue;
                };
                if kf.pose_cw.transform_point(&mp.position).z <= 0.0 {
                    continue;
                }
                let octave = kf.keypoints.get(idx).map_or(0, |k| k.octave);
                problem.observations.push(BundleObservation {
                    camera,
                    point,
                    pixel: kf.points[idx],
                    information: 1.0 / levels.sigma2(octave),
                });
                added += 1;
            }
            if added == 0 {
                continue;
            }
            problem.points.push(mp.position);
            problem.point_ids.push(mp_id);
        }
        if problem.observations.is_empty() || problem.poses.is_empty() {
            return None;
        }
        Some(problem)
    }

    pub fn num_free_poses(&self) -> usize {
        self.fixed.iter().filter(|f| !**f).count()
    }
}

/// Optimized variables and the outcome of a run.
#[derive(Debug, Clone)]
pub struct BundleSolution {
    pub poses: Vec<SE3>,
    pub points: Vec<Vector3<f64>>,
    pub outcome: OptimizationOutcome,
    /// Indices into `BundleProblem::observations` rejected by the χ² test.
    pub outliers: Vec<usize>,
}

impl BundleSolution {
    /// Map update carrying the optimized free poses, all points and the
    /// outlier observations.
    pub fn to_correction(&self, problem: &BundleProblem) -> MapCorrection {
        let keyframe_poses = problem
            .keyframe_ids
            .iter()
            .zip(&self.poses)
            .zip(&problem.fixed)
            .filter(|&(_, &fixed)| !fixed)
            .map(|((id, pose), _)| (*id, *pose))
            .collect();
        let map_points = problem.point_ids.iter().copied().zip(self.points.iter().copied()).collect();
        let outlier_observations = self
            .outliers
            .iter()
            .filter_map(|&i| problem.observations.get(i))
            .map(|obs| (problem.keyframe_ids[obs.camera], problem.point_ids[obs.point]))
            .collect();
        MapCorrection {
            keyframe_poses,
            map_points,
            outlier_observations,
        }
    }
}

/// Per-point blocks of the normal equations.
struct PointBlock {
    h_ll: Matrix3<f64>,
    b_l: Vector3<f64>,
    /// `(free pose parameter index, H_pl block)`.
    h_pl: Vec<(usize, Matrix6x3<f64>)>,
}

pub struct BundleAdjuster {
    camera: CameraModel,
    config: BundleAdjustmentConfig,
}

impl BundleAdjuster {
    pub fn new(camera: CameraModel, config: BundleAdjustmentConfig) -> Self {
        Self { camera, config }
    }

    pub fn config(&self) -> &BundleAdjustmentConfig {
        &self.config
    }

    /// Local BA around `kf_id` in one call, for single-threaded use.
    pub fn local(&self, map: &Map, kf_id: KeyFrameId, should_stop: &dyn Fn() -> bool) -> Option<(MapCorrection, OptimizationOutcome)> {
        let problem = BundleProblem::collect_local(map, kf_id, self.config.local_window)?;
        let solution = self.solve(&problem, self.config.local_iterations, should_stop);
        Some((solution.to_correction(&problem), solution.outcome))
    }

    /// Global BA over the whole map.
    pub fn global(&self, map: &Map, should_stop: &dyn Fn() -> bool) -> Option<(MapCorrection, OptimizationOutcome)> {
        let problem = BundleProblem::collect_global(map)?;
        let solution = self.solve(&problem, self.config.global_iterations, should_stop);
        Some((solution.to_correction(&problem), solution.outcome))
    }

    /// Runs LM for at most `max_iterations` accepted or rejected steps.
    pub fn solve(&self, problem: &BundleProblem, max_iterations: usize, should_stop: &dyn Fn() -> bool) -> BundleSolution {
        let mut poses = problem.poses.clone();
        let mut points = problem.points.clone();

        // Gauge: never let every pose float.
        let mut fixed = problem.fixed.clone();
        if !fixed.iter().any(|f| *f) {
            if let Some(first) = fixed.first_mut() {
                *first = true;
            }
        }
        let mut param_of = vec![None; poses.len()];
        let mut n_free = 0;
        for (i, f) in fixed.iter().enumerate() {
            if !*f {
                param_of[i] = Some(n_free);
                n_free += 1;
            }
        }

        let initial_cost = self.total_cost(problem, &poses, &points);
        let mut outcome = OptimizationOutcome::unchanged(initial_cost);
        if points.is_empty() {
            return BundleSolution {
                outliers: self.outliers(problem, &poses, &points),
                poses,
                points,
                outcome,
            };
        }

        let mut cost = initial_cost;
        let mut lambda = self.config.initial_lambda;
        let mut converged = false;
        let mut iterations = 0;

        while iterations < max_iterations {
            if should_stop() {
                debug!("[BA] stop requested after {} iterations", iterations);
                break;
            }
            iterations += 1;

            let (h_pp, b_p, blocks) = self.build_normal_equations(problem, &poses, &points, &param_of, n_free);
            let Some((delta_p, delta_l)) = solve_schur(&h_pp, &b_p, &blocks, lambda, n_free) else {
                lambda *= 10.0;
                continue;
            };

            let trial_poses: Vec<SE3> = poses
                .iter()
                .zip(&param_of)
                .map(|(pose, param)| match param {
                    Some(k) => {
                        let d = Vector6::from_iterator((0..6).map(|r| delta_p[k * 6 + r]));
                        pose.retract_left(&d)
                    }
                    None => *pose,
                })
                .collect();
            let trial_points: Vec<Vector3<f64>> = points.iter().zip(&delta_l).map(|(p, d)| p + d).collect();
            let trial_cost = self.total_cost(problem, &trial_poses, &trial_points);

            if trial_cost < cost {
                let decrease = (cost - trial_cost) / cost.max(f64::EPSILON);
                poses = trial_poses;
                points = trial_points;
                cost = trial_cost;
                outcome.cost_history.push(cost);
                lambda = (lambda * 0.1).max(1e-12);
                if decrease < self.config.convergence_threshold {
                    converged = true;
                    break;
                }
            } else {
                lambda *= 10.0;
                if lambda > 1e12 {
                    // No descent direction left.
                    converged = true;
                    break;
                }
            }
        }

        outcome.converged = converged;
        outcome.best_cost = cost;
        outcome.iterations = iterations;
        debug!(
            "[BA] {} poses ({} free), {} points, {} obs: cost {:.3} -> {:.3} in {} iterations (converged: {})",
            poses.len(),
            n_free,
            points.len(),
            problem.observations.len(),
            initial_cost,
            cost,
            iterations,
            converged
        );
        BundleSolution {
            outliers: self.outliers(problem, &poses, &points),
            poses,
            points,
            outcome,
        }
    }

    fn total_cost(&self, problem: &BundleProblem, poses: &[SE3], points: &[Vector3<f64>]) -> f64 {
        problem
            .observations
            .iter()
            .map(|obs| {
                let p_c = poses[obs.camera].transform_point(&points[obs.point]);
                match self.camera.project(&p_c) {
                    Some(px) => huber_cost((obs.pixel - px).norm_squared() * obs.information, self.config.huber_threshold),
                    None => BEHIND_CAMERA_COST,
                }
            })
            .sum()
    }

    fn outliers(&self, problem: &BundleProblem, poses: &[SE3], points: &[Vector3<f64>]) -> Vec<usize> {
        problem
            .observations
            .iter()
            .enumerate()
            .filter(|(_, obs)| {
                let p_c = poses[obs.camera].transform_point(&points[obs.point]);
                self.camera
                    .project(&p_c)
                    .map_or(true, |px| (obs.pixel - px).norm_squared() * obs.information > self.config.chi2_threshold)
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn build_normal_equations(
        &self,
        problem: &BundleProblem,
        poses: &[SE3],
        points: &[Vector3<f64>],
        param_of: &[Option<usize>],
        n_free: usize,
    ) -> (DMatrix<f64>, DVector<f64>, Vec<PointBlock>) {
        let mut h_pp = DMatrix::zeros(n_free * 6, n_free * 6);
        let mut b_p = DVector::zeros(n_free * 6);
        let mut blocks: Vec<PointBlock> = (0..points.len())
            .map(|_| PointBlock {
                h_ll: Matrix3::zeros(),
                b_l: Vector3::zeros(),
                h_pl: Vec::new(),
            })
            .collect();

        for obs in &problem.observations {
            let Some(proj) = project_with_jacobians(&self.camera, &poses[obs.camera], &points[obs.point]) else {
                continue;
            };
            let r = obs.pixel - proj.pixel;
            let norm = (r.norm_squared() * obs.information).sqrt();
            let w = huber_weight(norm, self.config.huber_threshold) * obs.information;

            let block = &mut blocks[obs.point];
            block.h_ll += proj.d_point.transpose() * proj.d_point * w;
            block.b_l += proj.d_point.transpose() * r * w;

            if let Some(k) = param_of[obs.camera] {
                let jp_t = proj.d_pose.transpose();
                let h = jp_t * proj.d_pose * w;
                let mut view = h_pp.fixed_view_mut::<6, 6>(k * 6, k * 6);
                view += h;
                let mut bv = b_p.fixed_rows_mut::<6>(k * 6);
                bv += jp_t * r * w;
                block.h_pl.push((k, jp_t * proj.d_point * w));
            }
        }
        (h_pp, b_p, blocks)
    }
}

/// Solves the damped system by eliminating the points.
///
/// Returns the pose update (stacked 6-vectors) and the point updates.
fn solve_schur(
    h_pp: &DMatrix<f64>,
    b_p: &DVector<f64>,
    blocks: &[PointBlock],
    lambda: f64,
    n_free: usize,
) -> Option<(DVector<f64>, Vec<Vector3<f64>>)> {
    let mut s = h_pp.clone();
    for i in 0..s.nrows() {
        s[(i, i)] += lambda * s[(i, i)].max(1e-6);
    }
    let mut b_s = b_p.clone();

    let mut inverses = Vec::with_capacity(blocks.len());
    for block in blocks {
        let mut h_ll = block.h_ll;
        for i in 0..3 {
            h_ll[(i, i)] += lambda * h_ll[(i, i)].max(1e-6);
        }
        let inv = h_ll.try_inverse().unwrap_or_else(Matrix3::zeros);
        for (a, w_a) in &block.h_pl {
            let w_a_inv = w_a * inv;
            let mut bv = b_s.fixed_rows_mut::<6>(a * 6);
            bv -= w_a_inv * block.b_l;
            for (b, w_b) in &block.h_pl {
                let mut view = s.fixed_view_mut::<6, 6>(a * 6, b * 6);
                view -= w_a_inv * w_b.transpose();
            }
        }
        inverses.push(inv);
    }

    let delta_p = if n_free == 0 {
        DVector::zeros(0)
    } else {
        match s.clone().cholesky() {
            Some(chol) => chol.solve(&b_s),
            None => s.lu().solve(&b_s)?,
        }
    };
    if delta_p.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let delta_l = blocks
        .iter()
        .zip(&inverses)
        .map(|(block, inv)| {
            let mut rhs = block.b_l;
            for (a, w_a) in &block.h_pl {
                let dp = delta_p.fixed_rows::<6>(a * 6);
                rhs -= w_a.transpose() * dp;
            }
            inv * rhs
        })
        .collect();
    Some((delta_p, delta_l))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geometry::se3::rotation_from_euler;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    pub(crate) fn camera() -> CameraModel {
        CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480)
    }

    /// Five cameras sliding along x looking at a cloud of points, with
    /// perturbed poses and points and noisy pixels.
    pub(crate) fn noisy_problem(seed: u64) -> (BundleProblem, Vec<SE3>, Vec<Vector3<f64>>) {
        let cam = camera();
        let mut rng = StdRng::seed_from_u64(seed);
        let truth_poses: Vec<SE3> = (0..5)
            .map(|i| {
                let q = rotation_from_euler(0.0, 0.02 * i as f64, 0.0);
                SE3::from_parts(q, Vector3::new(-0.2 * i as f64, 0.0, 0.0))
            })
            .collect();
        let truth_points: Vec<Vector3<f64>> = (0..60)
            .map(|_| Vector3::new(rng.gen_range(-1.5..1.5), rng.gen_range(-1.0..1.0), rng.gen_range(3.0..6.0)))
            .collect();

        let mut problem = BundleProblem::default();
        for (c, pose) in truth_poses.iter().enumerate() {
            for (p, point) in truth_points.iter().enumerate() {
                let Some(px) = cam.project(&pose.transform_point(point)) else { continue };
                if !cam.in_image(&px, 0.0) {
                    continue;
                }
                let noise = Vector2::new(rng.gen_range(-0.5..0.5), rng.gen_range(-0.5..0.5));
                problem.observations.push(BundleObservation {
                    camera: c,
                    point: p,
                    pixel: px + noise,
                    information: 1.0,
                });
            }
        }
        problem.poses = truth_poses
            .iter()
            .enumerate()
            .map(|(i, pose)| {
                if i == 0 {
                    *pose
                } else {
                    let d = Vector6::new(0.01, -0.01, 0.005, 0.03, -0.02, 0.02);
                    pose.retract_left(&d)
                }
            })
            .collect();
        problem.fixed = (0..5).map(|i| i < 2).collect();
        if problem.fixed[1] {
            problem.poses[1] = truth_poses[1];
        }
        problem.points = truth_points
            .iter()
            .map(|p| p + Vector3::new(rng.gen_range(-0.05..0.05), rng.gen_range(-0.05..0.05), rng.gen_range(-0.1..0.1)))
            .collect();
        problem.keyframe_ids = (0..5).map(KeyFrameId::new).collect();
        problem.point_ids = (0..truth_points.len() as u64).map(MapPointId::new).collect();
        (problem, truth_poses, truth_points)
    }

    #[test]
    fn test_cost_decreases_monotonically() {
        let (problem, _, _) = noisy_problem(3);
        let ba = BundleAdjuster::new(camera(), BundleAdjustmentConfig::default());
        let solution = ba.solve(&problem, 30, &|| false);
        let history = &solution.outcome.cost_history;
        assert!(history.len() > 1);
        for pair in history.windows(2) {
            assert!(pair[1] < pair[0]);
        }
        assert!(solution.outcome.best_cost <= solution.outcome.initial_cost);
        assert!(solution.outcome.best_cost < 0.2 * solution.outcome.initial_cost);
    }

    #[test]
    fn test_fixed_poses_do_not_move() {
        let (problem, _, _) = noisy_problem(5);
        let ba = BundleAdjuster::new(camera(), BundleAdjustmentConfig::default());
        let solution = ba.solve(&problem, 10, &|| false);
        for i in 0..2 {
            assert_relative_eq!(solution.poses[i].translation, problem.poses[i].translation, epsilon = 1e-15);
        }
        let correction = solution.to_correction(&problem);
        assert_eq!(correction.keyframe_poses.len(), 3);
        assert_eq!(correction.map_points.len(), problem.points.len());
    }

    #[test]
    fn test_stop_request_keeps_initial_state() {
        let (problem, _, _) = noisy_problem(9);
        let ba = BundleAdjuster::new(camera(), BundleAdjustmentConfig::default());
        let solution = ba.solve(&problem, 10, &|| true);
        assert!(!solution.outcome.converged);
        assert_eq!(solution.outcome.iterations, 0);
        assert_eq!(solution.outcome.best_cost, solution.outcome.initial_cost);
    }

    #[test]
    fn test_gross_outlier_is_reported() {
        let (mut problem, _, _) = noisy_problem(11);
        problem.observations[7].pixel += Vector2::new(40.0, -35.0);
        let ba = BundleAdjuster::new(camera(), BundleAdjustmentConfig::default());
        let solution = ba.solve(&problem, 20, &|| false);
        assert!(solution.outliers.contains(&7));
        assert!(solution.outliers.len() < 5);
    }
}
