//! Two-view map initialization.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::frame::Frame;
use crate::error::InitializationError;
use crate::features::{FeatureMatcher, MatcherConfig};
use crate::geometry::linalg::median;
use crate::geometry::ransac::RansacParams;
use crate::geometry::two_view::{reconstruct, TwoViewModel, TwoViewParams};
use crate::geometry::{CameraModel, SE3};
use crate::imu::InertialPrior;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitializerConfig {
    /// Matches needed between the two frames.
    pub min_matches: usize,
    pub min_parallax_deg: f64,
    pub min_triangulated: usize,
    /// A reference frame older than this many frames is replaced.
    pub max_reference_age: u64,
}

impl Default for InitializerConfig {
    fn default() -> Self {
        Self {
            min_matches: 100,
            min_parallax_deg: 1.0,
            min_triangulated: 50,
            max_reference_age: 30,
        }
    }
}

/// A map point of the initial map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitialPoint {
    pub reference_idx: usize,
    pub current_idx: usize,
    /// World position; the reference camera defines the world frame.
    pub position: Vector3<f64>,
}

#[derive(Debug, Clone)]
pub struct InitialMap {
    /// Pose of the current frame. The reference frame sits at the identity.
    pub pose_cw: SE3,
    pub points: Vec<InitialPoint>,
    pub model: TwoViewModel,
    pub parallax_deg: f64,
    /// Factor applied to the unit-baseline reconstruction.
    pub scale: f64,
}

pub struct Initializer {
    config: InitializerConfig,
    matcher: FeatureMatcher,
    two_view: TwoViewParams,
}

impl Initializer {
    pub fn new(config: InitializerConfig, matcher: MatcherConfig) -> Self {
        let two_view = TwoViewParams {
            sigma: matcher.ransac_sigma,
            min_parallax_deg: config.min_parallax_deg,
            min_triangulated: config.min_triangulated,
            ransac: RansacParams {
                max_iterations: matcher.ransac_iterations,
                confidence: 0.99,
            },
            seed: matcher.seed,
        };
        Self {
            config,
            matcher: FeatureMatcher::new(matcher),
            two_view,
        }
    }

    pub fn config(&self) -> &InitializerConfig {
        &self.config
    }

    /// Reconstructs relative motion and structure between two frames.
    ///
    /// Monocular reconstruction is up to scale. With an inertial prior the
    /// baseline takes the length of the predicted translation; otherwise the
    /// median scene depth is normalised to 1.
    pub fn initialize(
        &self,
        reference: &Frame,
        current: &Frame,
        camera: &CameraModel,
        prior: Option<&InertialPrior>,
    ) -> Result<InitialMap, InitializationError> {
        let matches = self
            .matcher
            .match_features(&reference.points, &reference.descriptors, &current.points, &current.descriptors);
        debug!(
            "[Init] frames {} -> {}: {} matches",
            reference.id,
            current.id,
            matches.matches.len()
        );
        if matches.matches.len() < self.config.min_matches {
            return Err(InitializationError::TooFewMatches {
                found: matches.matches.len(),
                required: self.config.min_matches,
            });
        }

        let p1: Vec<_> = matches.matches.iter().map(|m| reference.points[m.query_idx]).collect();
        let p2: Vec<_> = matches.matches.iter().map(|m| current.points[m.train_idx]).collect();
        let recon = reconstruct(&p1, &p2, camera, &self.two_view)?;

        let mut depths: Vec<f64> = recon.points.iter().flatten().map(|p| p.z).collect();
        let median_depth = median(&mut depths).ok_or(InitializationError::TooFewTriangulated {
            found: 0,
            required: self.config.min_triangulated,
        })?;
        let scale = match prior {
            Some(p) if p.delta.translation.norm() > 1e-9 => p.delta.translation.norm() / recon.translation.norm(),
            _ => 1.0 / median_depth,
        };
        if !scale.is_finite() || scale <= 0.0 {
            return Err(InitializationError::NoModel);
        }

        let points: Vec<InitialPoint> = matches
            .matches
            .iter()
            .zip(&recon.points)
            .filter_map(|(m, p)| {
                p.map(|p| InitialPoint {
                    reference_idx: m.query_idx,
                    current_idx: m.train_idx,
                    position: p * scale,
                })
            })
            .collect();
        let pose_cw = SE3::from_rt(&recon.rotation, recon.translation * scale);

        info!(
            "[Init] {:?} model: {} points, parallax {:.2} deg, baseline {:.4}",
            recon.model,
            points.len(),
            recon.parallax_deg,
            pose_cw.camera_center().norm()
        );
        Ok(InitialMap {
            pose_cw,
            points,
            model: recon.model,
            parallax_deg: recon.parallax_deg,
            scale,
        })
    }
}
