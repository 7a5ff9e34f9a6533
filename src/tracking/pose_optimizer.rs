//! Motion-only pose refinement.
//!
//! Levenberg-Marquardt over the 6-DoF world-to-camera pose minimizing the
//! reprojection error of matched map points. Runs several rounds; after each
//! round observations are classified against a χ² threshold and outliers are
//! left out of the next one. The robust kernel is dropped in the final
//! rounds, once outliers are gone.
//!
//! An optional motion prior (inertial prediction) adds a residual
//! `log(T ∘ T_pred⁻¹)` whose weight shrinks as the vision confidence grows.

use nalgebra::{Matrix6, Vector2, Vector3, Vector6};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::two_view::CHI2_TWO_DOF;
use crate::geometry::{CameraModel, SE3};
use crate::optimizer::projection::{huber_cost, huber_weight, project_with_jacobians};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseOptimizerConfig {
    pub rounds: usize,
    pub iterations_per_round: usize,
    /// Rounds using the Huber kernel.
    pub robust_rounds: usize,
    /// χ² inlier threshold on the whitened squared error (2 DoF).
    pub chi2_threshold: f64,
    /// Inlier count at which vision alone is fully trusted.
    pub confident_inliers: usize,
}

impl Default for PoseOptimizerConfig {
    fn default() -> Self {
        Self {
            rounds: 4,
            iterations_per_round: 10,
            robust_rounds: 2,
            chi2_threshold: CHI2_TWO_DOF,
            confident_inliers: 50,
        }
    }
}

/// A matched map point.
#[derive(Debug, Clone, Copy)]
pub struct PoseObservation {
    /// Undistorted pixel.
    pub pixel: Vector2<f64>,
    pub point_w: Vector3<f64>,
    /// Measurement variance of the feature's pyramid level.
    pub sigma2: f64,
}

/// Predicted pose and the caller's trust in it, in [0, 1].
#[derive(Debug, Clone, Copy)]
pub struct MotionPrior {
    pub predicted_cw: SE3,
    pub weight: f64,
}

#[derive(Debug, Clone)]
pub struct PoseEstimate {
    pub pose_cw: SE3,
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
    /// Inlier ratio scaled down when few inliers support the pose, in [0, 1].
    pub confidence: f64,
    /// Effective prior weight of the last round.
    pub prior_weight: f64,
}

pub struct PoseOptimizer {
    camera: CameraModel,
    config: PoseOptimizerConfig,
}

impl PoseOptimizer {
    pub fn new(camera: CameraModel, config: PoseOptimizerConfig) -> Self {
        Self { camera, config }
    }

    pub fn config(&self) -> &PoseOptimizerConfig {
        &self.config
    }

    /// Refines `initial` against `observations`.
    pub fn optimize(&self, initial: &SE3, observations: &[PoseObservation], prior: Option<&MotionPrior>) -> PoseEstimate {
        let mut pose = *initial;
        let mut inliers = self.classify(&pose, observations);
        let mut num_inliers = inliers.iter().filter(|&&b| b).count();
        let mut confidence = self.confidence(num_inliers, observations.len());
        let mut prior_weight = 0.0;

        if observations.is_empty() && prior.is_none() {
            return PoseEstimate {
                pose_cw: pose,
                inliers,
                num_inliers,
                confidence,
                prior_weight,
            };
        }

        // Every observation takes part in the first round.
        let mut active = vec![true; observations.len()];
        for round in 0..self.config.rounds {
            let robust = round < self.config.robust_rounds;
            prior_weight = prior.map_or(0.0, |p| p.weight.clamp(0.0, 1.0) * (1.0 - confidence));
            let prior_term = prior.map(|p| (p.predicted_cw, self.prior_information(prior_weight, num_inliers)));

            pose = self.refine(&pose, observations, &active, robust, prior_term.as_ref());

            inliers = self.classify(&pose, observations);
            num_inliers = inliers.iter().filter(|&&b| b).count();
            confidence = self.confidence(num_inliers, observations.len());
            active.clone_from(&inliers);

            if num_inliers < 3 && prior.is_none() {
                break;
            }
        }

        debug!(
            "[PoseOpt] {} / {} inliers, confidence {:.2}, prior weight {:.2}",
            num_inliers,
            observations.len(),
            confidence,
            prior_weight
        );
        PoseEstimate {
            pose_cw: pose,
            inliers,
            num_inliers,
            confidence,
            prior_weight,
        }
    }

    /// Vision confidence: inlier ratio, reduced when the inlier count is low.
    fn confidence(&self, num_inliers: usize, total: usize) -> f64 {
        if total == 0 {
            return 0.0;
        }
        let ratio = num_inliers as f64 / total as f64;
        let support = (num_inliers as f64 / self.config.confident_inliers.max(1) as f64).min(1.0);
        ratio * support
    }

    /// Information of the prior residual, scaled like that many pixel
    /// observations so it competes with vision on equal terms.
    fn prior_information(&self, weight: f64, num_inliers: usize) -> f64 {
        weight * num_inliers.max(1) as f64 * self.camera.fx * self.camera.fx
    }

    fn classify(&self, pose: &SE3, observations: &[PoseObservation]) -> Vec<bool> {
        observations
            .iter()
            .map(|obs| self.whitened_error(pose, obs).is_some_and(|e2| e2 <= self.config.chi2_threshold))
            .collect()
    }

    fn whitened_error(&self, pose: &SE3, obs: &PoseObservation) -> Option<f64> {
        let p_c = pose.transform_point(&obs.point_w);
        let px = self.camera.project(&p_c)?;
        Some((px - obs.pixel).norm_squared() / obs.sigma2)
    }

    fn cost(
        &self,
        pose: &SE3,
        observations: &[PoseObservation],
        active: &[bool],
        robust: bool,
        prior: Option<&(SE3, f64)>,
    ) -> f64 {
        let delta = self.config.chi2_threshold.sqrt();
        let mut cost = 0.0;
        for (obs, _) in observations.iter().zip(active).filter(|&(_, &a)| a) {
            // Points that fell behind the camera keep a fixed penalty.
            let e2 = self.whitened_error(pose, obs).unwrap_or(4.0 * self.config.chi2_threshold);
            cost += if robust { huber_cost(e2, delta) } else { e2 };
        }
        if let Some((predicted, info)) = prior {
            cost += info * pose.compose(&predicted.inverse()).log().norm_squared();
        }
        cost
    }

    fn refine(
        &self,
        initial: &SE3,
        observations: &[PoseObservation],
        active: &[bool],
        robust: bool,
        prior: Option<&(SE3, f64)>,
    ) -> SE3 {
        let delta_huber = self.config.chi2_threshold.sqrt();
        let mut pose = *initial;
        let mut cost = self.cost(&pose, observations, active, robust, prior);
        let mut lambda = 1e-3;

        for _ in 0..self.config.iterations_per_round {
            let mut h = Matrix6::<f64>::zeros();
            let mut b = Vector6::<f64>::zeros();
            for (obs, _) in observations.iter().zip(active).filter(|&(_, &a)| a) {
                let Some(proj) = project_with_jacobians(&self.camera, &pose, &obs.point_w) else {
                    continue;
                };
                let e = proj.pixel - obs.pixel;
                let info = 1.0 / obs.sigma2;
                let w = if robust {
                    huber_weight((e.norm_squared() * info).sqrt(), delta_huber)
                } else {
                    1.0
                };
                let jt = proj.d_pose.transpose();
                h += (w * info) * jt * proj.d_pose;
                b += (w * info) * jt * e;
            }
            if let Some((predicted, info)) = prior {
                // Jacobian of log(exp(δ) T T_pred⁻¹) taken as identity near the prediction.
                let r = pose.compose(&predicted.inverse()).log();
                h += Matrix6::identity() * *info;
                b += r * *info;
            }

            let mut improved = false;
            for _ in 0..5 {
                let mut damped = h;
                for k in 0..6 {
                    damped[(k, k)] += lambda * h[(k, k)].max(1e-9);
                }
                let Some(chol) = damped.cholesky() else {
                    lambda *= 10.0;
                    continue;
                };
                let step = chol.solve(&(-b));
                let candidate = pose.retract_left(&step);
                let candidate_cost = self.cost(&candidate, observations, active, robust, prior);
                if candidate_cost < cost {
                    pose = candidate;
                    cost = candidate_cost;
                    lambda = (lambda * 0.3).max(1e-9);
                    improved = step.norm() > 1e-10;
                    break;
                }
                lambda *= 10.0;
            }
            if !improved {
                break;
            }
        }
        pose
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geometry::se3::rotation_from_euler;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    pub(crate) fn camera() -> CameraModel {
        CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480)
    }

    pub(crate) fn grid_points() -> Vec<Vector3<f64>> {
        (0..80)
            .map(|i| {
                let x = (i % 10) as f64 * 0.25 - 1.1;
                let y = (i / 10) as f64 * 0.2 - 0.7;
                Vector3::new(x, y, 3.0 + 0.4 * ((i * 3) % 4) as f64)
            })
            .collect()
    }

    fn observe(pose: &SE3, points: &[Vector3<f64>]) -> Vec<PoseObservation> {
        let cam = camera();
        points
            .iter()
            .map(|p| PoseObservation {
                pixel: cam.project(&pose.transform_point(p)).unwrap(),
                point_w: *p,
                sigma2: 1.0,
            })
            .collect()
    }

    #[test]
    fn test_recovers_pose_from_perturbed_start() {
        let truth = SE3::from_parts(rotation_from_euler(0.05, -0.1, 0.02), Vector3::new(0.2, -0.1, 0.3));
        let obs = observe(&truth, &grid_points());
        let start = SE3::from_parts(
            rotation_from_euler(0.08, -0.06, 0.0),
            truth.translation + Vector3::new(0.05, 0.03, -0.05),
        );
        let optimizer = PoseOptimizer::new(camera(), PoseOptimizerConfig::default());
        let est = optimizer.optimize(&start, &obs, None);

        assert_eq!(est.num_inliers, obs.len());
        assert_relative_eq!(est.pose_cw.translation, truth.translation, epsilon = 1e-6);
        assert!(est.pose_cw.rotation.angle_to(&truth.rotation) < 1e-6);
        assert_relative_eq!(est.confidence, 1.0);
    }

    #[test]
    fn test_rejects_outliers() {
        let truth = SE3::from_parts(UnitQuaternion::identity(), Vector3::new(-0.1, 0.0, 0.0));
        let mut obs = observe(&truth, &grid_points());
        for o in obs.iter_mut().step_by(8) {
            o.pixel += Vector2::new(40.0, -25.0);
        }
        let optimizer = PoseOptimizer::new(camera(), PoseOptimizerConfig::default());
        let est = optimizer.optimize(&SE3::identity(), &obs, None);

        assert_eq!(est.num_inliers, obs.len() - 10);
        assert!(est.inliers.iter().step_by(8).all(|&b| !b));
        assert_relative_eq!(est.pose_cw.translation, truth.translation, epsilon = 1e-5);
    }

    #[test]
    fn test_prior_fills_in_for_weak_vision() {
        let truth = SE3::from_parts(UnitQuaternion::identity(), Vector3::new(-0.1, 0.0, 0.0));
        let optimizer = PoseOptimizer::new(camera(), PoseOptimizerConfig::default());
        let prior = MotionPrior {
            predicted_cw: truth,
            weight: 1.0,
        };
        // No usable vision at all: the prior alone decides.
        let est = optimizer.optimize(&SE3::identity(), &[], Some(&prior));
        assert_relative_eq!(est.pose_cw.translation, truth.translation, epsilon = 1e-6);
        assert_relative_eq!(est.prior_weight, 1.0);

        // Strong vision: the prior weight collapses and a wrong prediction is ignored.
        let obs = observe(&truth, &grid_points());
        let wrong = MotionPrior {
            predicted_cw: SE3::from_parts(UnitQuaternion::identity(), Vector3::new(-0.3, 0.0, 0.0)),
            weight: 1.0,
        };
        let est = optimizer.optimize(&truth, &obs, Some(&wrong));
        assert!(est.prior_weight < 1e-9);
        assert_relative_eq!(est.pose_cw.translation, truth.translation, epsilon = 1e-6);
    }
}
