//! Relocalization against the whole keyframe database.
//!
//! For each place-recognition candidate: descriptor matching against the
//! candidate's map points, a PnP RANSAC hypothesis, robust pose refinement,
//! then a projection search over the candidate's local map and a final
//! refinement. The first candidate that ends with enough inliers wins.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::frame::Frame;
use super::local_map::{frame_observations, search_by_projection, LocalMap, ProjectionSearchParams};
use super::pose_optimizer::{PoseEstimate, PoseObservation, PoseOptimizer};
use crate::features::FeatureMatcher;
use crate::geometry::pnp::solve_pnp_ransac;
use crate::geometry::ransac::RansacParams;
use crate::geometry::{CameraModel, SE3};
use crate::map::{KeyFrameId, Map, MapPointId};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocalizerConfig {
    /// Database candidates tried per attempt.
    pub candidates: usize,
    /// Descriptor matches a candidate needs before PnP is tried.
    pub min_matches: usize,
    /// Inliers after the final refinement.
    pub min_inliers: usize,
    /// PnP RANSAC inlier threshold, in pixels.
    pub pnp_threshold: f64,
    pub ransac_iterations: usize,
    /// Keyframes in the candidate's local map.
    pub local_keyframes: usize,
    pub seed: u64,
}

impl Default for RelocalizerConfig {
    fn default() -> Self {
        Self {
            candidates: 5,
            min_matches: 15,
            min_inliers: 30,
            pnp_threshold: 4.0,
            ransac_iterations: 300,
            local_keyframes: 10,
            seed: 7,
        }
    }
}

/// A successful relocalization.
#[derive(Debug, Clone)]
pub struct Relocalization {
    pub keyframe_id: KeyFrameId,
    pub pose_cw: SE3,
    pub num_inliers: usize,
}

pub struct Relocalizer {
    config: RelocalizerConfig,
    camera: CameraModel,
    search: ProjectionSearchParams,
}

impl Relocalizer {
    pub fn new(camera: CameraModel, config: RelocalizerConfig, search: ProjectionSearchParams) -> Self {
        Self { config, camera, search }
    }

    pub fn config(&self) -> &RelocalizerConfig {
        &self.config
    }

    /// Tries to find the frame's pose in `map`. On success the frame keeps
    /// the inlier associations.
    pub fn relocalize(
        &self,
        frame: &mut Frame,
        map: &Map,
        matcher: &FeatureMatcher,
        optimizer: &PoseOptimizer,
    ) -> Option<Relocalization> {
        let candidates = map.database().query(&frame.bow, |_| true, 0.0);
        debug!("[Reloc] frame {}: {} database candidates", frame.id, candidates.len());
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        for candidate in candidates.iter().take(self.config.candidates) {
            frame.clear_matches();
            let Some(estimate) = self.hypothesize(frame, map, candidate.keyframe_id, matcher, optimizer, &mut rng) else {
                continue;
            };

            // Extend with the candidate's neighbourhood and refine once more.
            let local = LocalMap::build(map, candidate.keyframe_id, self.config.local_keyframes);
            let params = ProjectionSearchParams {
                radius: self.search.radius * 0.5,
                ..self.search
            };
            search_by_projection(frame, map, &local.points, &estimate.pose_cw, &self.camera, &params);
            let (observations, pairs) = frame_observations(frame, map);
            let refined = optimizer.optimize(&estimate.pose_cw, &observations, None);
            drop_outliers(frame, &pairs, &refined.inliers);

            debug!(
                "[Reloc] candidate {} (score {:.3}): {} inliers",
                candidate.keyframe_id, candidate.score, refined.num_inliers
            );
            if refined.num_inliers >= self.config.min_inliers {
                return Some(Relocalization {
                    keyframe_id: candidate.keyframe_id,
                    pose_cw: refined.pose_cw,
                    num_inliers: refined.num_inliers,
                });
            }
        }
        frame.clear_matches();
        None
    }

    /// Pose hypothesis from descriptor matches against one keyframe. The
    /// linear PnP solution and the keyframe's own pose both seed the robust
    /// refinement; the better supported result is kept. Planar scenes defeat
    /// the linear solver, the keyframe seed covers them.
    fn hypothesize(
        &self,
        frame: &mut Frame,
        map: &Map,
        kf_id: KeyFrameId,
        matcher: &FeatureMatcher,
        optimizer: &PoseOptimizer,
        rng: &mut StdRng,
    ) -> Option<PoseEstimate> {
        let kf = map.keyframe(kf_id)?;
        let indexed: Vec<(usize, MapPointId)> = kf.map_point_indices().collect();
        let descriptors: Vec<_> = indexed.iter().map(|(i, _)| kf.descriptors[*i]).collect();
        let matches = matcher.match_descriptors(&frame.descriptors, &descriptors);
        if matches.len() < self.config.min_matches {
            return None;
        }

        let levels = map.scale_levels();
        let mut observations = Vec::with_capacity(matches.len());
        let mut pairs = Vec::with_capacity(matches.len());
        for m in &matches {
            let mp_id = indexed[m.train_idx].1;
            let Some(mp) = map.map_point(mp_id) else { continue };
            observations.push(PoseObservation {
                pixel: frame.points[m.query_idx],
                point_w: mp.position,
                sigma2: levels.sigma2(frame.keypoints[m.query_idx].octave),
            });
            pairs.push((m.query_idx, mp_id));
        }

        let points: Vec<_> = observations.iter().map(|o| o.point_w).collect();
        let pixels: Vec<_> = observations.iter().map(|o| o.pixel).collect();
        let ransac = RansacParams {
            max_iterations: self.config.ransac_iterations,
            confidence: 0.99,
        };
        let mut seeds = vec![kf.pose_cw];
        if let Some(pnp) = solve_pnp_ransac(&points, &pixels, &self.camera, self.config.pnp_threshold, &ransac, rng) {
            seeds.push(pnp.pose_cw);
        }

        let best = seeds
            .iter()
            .map(|seed| optimizer.optimize(seed, &observations, None))
            .max_by_key(|e| e.num_inliers)?;
        if best.num_inliers < self.config.min_matches {
            return None;
        }
        for (&(idx, mp_id), &inlier) in pairs.iter().zip(&best.inliers) {
            if inlier {
                frame.map_points[idx] = Some(mp_id);
            }
        }
        Some(best)
    }
}

/// Clears the frame associations flagged as outliers.
pub fn drop_outliers(frame: &mut Frame, pairs: &[(usize, MapPointId)], inliers: &[bool]) {
    for (&(idx, _), &inlier) in pairs.iter().zip(inliers) {
        if !inlier {
            frame.map_points[idx] = None;
        }
    }
}
