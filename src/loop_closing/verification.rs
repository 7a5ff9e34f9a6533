//! Geometric verification of loop candidates.
//!
//! This is the only guard against false loop closures: a candidate is
//! accepted only when a single similarity transform explains enough
//! descriptor matches in both views, and projecting the loop place through
//! that transform finds further matches in the current keyframe.

use std::collections::BTreeSet;

use nalgebra::{Vector2, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::detector::LoopCandidate;
use crate::error::LoopRejection;
use crate::features::{hamming_distance, Descriptor, FeatureMatcher};
use crate::geometry::ransac::{self, RansacParams};
use crate::geometry::sim3::align_umeyama;
use crate::geometry::{CameraModel, Sim3, SE3};
use crate::map::{KeyFrameId, Map, MapPointId};

/// 99% quantile of chi-square with two degrees of freedom.
const CHI2_SIM3: f64 = 9.21;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopVerificationConfig {
    /// Descriptor matches needed before the similarity is estimated.
    pub min_matches: usize,
    /// Geometric inliers the similarity must explain.
    pub min_inliers: usize,
    /// Matches needed after the projection search of the loop place.
    pub min_total_matches: usize,
    pub ransac_iterations: usize,
    pub seed: u64,
    /// Projection search radius in level-0 pixels.
    pub search_radius: f64,
    pub max_descriptor_distance: u32,
    /// Pin the scale to 1 (only when scale cannot drift).
    pub fix_scale: bool,
}

impl Default for LoopVerificationConfig {
    fn default() -> Self {
        Self {
            min_matches: 20,
            min_inliers: 20,
            min_total_matches: 30,
            ransac_iterations: 300,
            seed: 11,
            search_radius: 10.0,
            max_descriptor_distance: 50,
            fix_scale: false,
        }
    }
}

/// A loop that passed verification.
#[derive(Debug, Clone)]
pub struct VerifiedLoop {
    pub current_kf_id: KeyFrameId,
    pub loop_kf_id: KeyFrameId,
    /// Corrected pose of the current keyframe: maps world points of the
    /// loop place into the current camera, including the scale drift.
    pub s_cw: Sim3,
    pub num_inliers: usize,
    /// `(feature of the current keyframe, map point of the loop place)`.
    pub matches: Vec<(usize, MapPointId)>,
    pub loop_group: Vec<KeyFrameId>,
}

/// One descriptor match between the current keyframe's own point and a
/// point of the loop keyframe.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Sim3Correspondence {
    /// Loop point in world coordinates.
    pub loop_point_w: Vector3<f64>,
    /// The current keyframe's own (drifted) point, in its camera frame.
    pub current_point_c: Vector3<f64>,
    pub current_px: Vector2<f64>,
    pub loop_px: Vector2<f64>,
    pub current_sigma2: f64,
    pub loop_sigma2: f64,
}

impl Sim3Correspondence {
    fn is_inlier(&self, s_cw: &Sim3, s_wc: &Sim3, loop_pose_cw: &SE3, camera: &CameraModel) -> bool {
        let in_current = camera.project(&s_cw.transform_point(&self.loop_point_w));
        let in_loop = camera.project(&loop_pose_cw.transform_point(&s_wc.transform_point(&self.current_point_c)));
        match (in_current, in_loop) {
            (Some(a), Some(b)) => {
                (a - self.current_px).norm_squared() / self.current_sigma2 < CHI2_SIM3
                    && (b - self.loop_px).norm_squared() / self.loop_sigma2 < CHI2_SIM3
            }
            _ => false,
        }
    }
}

/// Seeded RANSAC over 3-point Umeyama alignments, refined on all inliers.
pub(crate) fn estimate_sim3(
    correspondences: &[Sim3Correspondence],
    loop_pose_cw: &SE3,
    camera: &CameraModel,
    config: &LoopVerificationConfig,
) -> Option<(Sim3, Vec<bool>)> {
    let src: Vec<Vector3<f64>> = correspondences.iter().map(|c| c.loop_point_w).collect();
    let dst: Vec<Vector3<f64>> = correspondences.iter().map(|c| c.current_point_c).collect();
    let evaluate = |s: &Sim3| {
        let s_wc = s.inverse();
        let mask: Vec<bool> = correspondences
            .iter()
            .map(|c| c.is_inlier(s, &s_wc, loop_pose_cw, camera))
            .collect();
        let score = mask.iter().filter(|&&x| x).count() as f64;
        (mask, score)
    };

    let params = RansacParams {
        max_iterations: config.ransac_iterations,
        ..RansacParams::default()
    };
    let mut rng = StdRng::seed_from_u64(config.seed);
    let best = ransac::run(
        correspondences.len(),
        3,
        &params,
        &mut rng,
        |sample| {
            let s: Vec<Vector3<f64>> = sample.iter().map(|&i| src[i]).collect();
            let d: Vec<Vector3<f64>> = sample.iter().map(|&i| dst[i]).collect();
            align_umeyama(&s, &d, config.fix_scale)
        },
        evaluate,
    )?;

    let (s_in, d_in): (Vec<_>, Vec<_>) = best
        .inliers
        .iter()
        .enumerate()
        .filter(|(_, &keep)| keep)
        .map(|(i, _)| (src[i], dst[i]))
        .unzip();
    if let Some(refined) = align_umeyama(&s_in, &d_in, config.fix_scale) {
        let (mask, score) = evaluate(&refined);
        if score >= best.score {
            return Some((refined, mask));
        }
    }
    Some((best.model, best.inliers))
}

/// Verifies `candidate` geometrically.
///
/// The current keyframe's own points are matched by descriptor to the loop
/// keyframe's points, a similarity is estimated from those matches, and the
/// loop place is then projected through it to collect further matches.
pub fn verify_loop(
    map: &Map,
    candidate: &LoopCandidate,
    camera: &CameraModel,
    matcher: &FeatureMatcher,
    config: &LoopVerificationConfig,
) -> Result<VerifiedLoop, LoopRejection> {
    let current = map
        .keyframe(candidate.current_kf_id)
        .ok_or(LoopRejection::MissingKeyFrame(candidate.current_kf_id.0))?;
    let loop_kf = map
        .keyframe(candidate.loop_kf_id)
        .ok_or(LoopRejection::MissingKeyFrame(candidate.loop_kf_id.0))?;
    let levels = map.scale_levels();

    let current_features: Vec<(usize, MapPointId)> =
        current.map_point_indices().filter(|(_, mp)| map.map_point(*mp).is_some()).collect();
    let loop_features: Vec<(usize, MapPointId)> =
        loop_kf.map_point_indices().filter(|(_, mp)| map.map_point(*mp).is_some()).collect();
    let current_desc: Vec<Descriptor> = current_features.iter().map(|&(i, _)| current.descriptors[i]).collect();
    let loop_desc: Vec<Descriptor> = loop_features.iter().map(|&(i, _)| loop_kf.descriptors[i]).collect();

    let mut correspondences = Vec::new();
    let mut pairs = Vec::new();
    for m in matcher.match_descriptors(&current_desc, &loop_desc) {
        let (cur_idx, cur_mp) = current_features[m.query_idx];
        let (loop_idx, loop_mp) = loop_features[m.train_idx];
        if cur_mp == loop_mp {
            continue;
        }
        let (Some(own), Some(other)) = (map.map_point(cur_mp), map.map_point(loop_mp)) else {
            continue;
        };
        correspondences.push(Sim3Correspondence {
            loop_point_w: other.position,
            current_point_c: current.pose_cw.transform_point(&own.position),
            current_px: current.points[cur_idx],
            loop_px: loop_kf.points[loop_idx],
            current_sigma2: levels.sigma2(current.keypoints[cur_idx].octave),
            loop_sigma2: levels.sigma2(loop_kf.keypoints[loop_idx].octave),
        });
        pairs.push((cur_idx, loop_mp));
    }
    if correspondences.len() < config.min_matches {
        return Err(LoopRejection::TooFewMatches {
            found: correspondences.len(),
            required: config.min_matches,
        });
    }

    let (s_cw, mask) =
        estimate_sim3(&correspondences, &loop_kf.pose_cw, camera, config).ok_or(LoopRejection::NoTransform)?;
    let mut matches: Vec<(usize, MapPointId)> =
        pairs.into_iter().zip(&mask).filter_map(|(p, &keep)| keep.then_some(p)).collect();
    let num_inliers = matches.len();
    if num_inliers < config.min_inliers {
        return Err(LoopRejection::TooFewInliers {
            found: num_inliers,
            required: config.min_inliers,
        });
    }

    // Projection search of the whole loop place through the similarity.
    let mut used_features: BTreeSet<usize> = matches.iter().map(|&(i, _)| i).collect();
    let mut used_points: BTreeSet<MapPointId> = matches.iter().map(|&(_, mp)| mp).collect();
    for mp_id in map.map_points_of(&candidate.loop_group) {
        if used_points.contains(&mp_id) {
            continue;
        }
        let Some(mp) = map.map_point(mp_id) else { continue };
        if mp.is_observed_by(candidate.current_kf_id) {
            continue;
        }
        let p_c = s_cw.transform_point(&mp.position);
        let Some(px) = camera.project(&p_c) else { continue };
        if !camera.in_image(&px, 0.0) || !mp.is_in_distance_range(p_c.norm() / s_cw.scale) {
            continue;
        }
        let best = current
            .features_in_area(&px, config.search_radius, None)
            .into_iter()
            .filter(|idx| !used_features.contains(idx))
            .map(|idx| (hamming_distance(&mp.descriptor, &current.descriptors[idx]), idx))
            .filter(|&(d, _)| d <= config.max_descriptor_distance)
            .min();
        if let Some((_, idx)) = best {
            used_features.insert(idx);
            used_points.insert(mp_id);
            matches.push((idx, mp_id));
        }
    }

    debug!(
        "[LoopVerify] {} -> {}: {} matches, {} inliers, {} after projection, scale {:.3}",
        candidate.current_kf_id,
        candidate.loop_kf_id,
        correspondences.len(),
        num_inliers,
        matches.len(),
        s_cw.scale
    );
    if matches.len() < config.min_total_matches {
        return Err(LoopRejection::TooFewInliers {
            found: matches.len(),
            required: config.min_total_matches,
        });
    }

    Ok(VerifiedLoop {
        current_kf_id: candidate.current_kf_id,
        loop_kf_id: candidate.loop_kf_id,
        s_cw,
        num_inliers,
        matches,
        loop_group: candidate.loop_group.clone(),
    })
}
