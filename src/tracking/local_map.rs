//! Local map around the reference keyframe and projection search against it.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use super::frame::Frame;
use super::pose_optimizer::PoseObservation;
use crate::features::hamming_distance;
use crate::geometry::{CameraModel, SE3};
use crate::map::{KeyFrameId, Map, MapPointId};

/// Viewing directions further than this from a point's mean normal are not searched (cos 60°).
const MIN_VIEW_COS: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionSearchParams {
    /// Search radius at level 0, in pixels; scaled with the predicted level.
    pub radius: f64,
    pub max_distance: u32,
    /// Best/second-best ratio, applied when both candidates share a level.
    pub ratio: f64,
}

impl Default for ProjectionSearchParams {
    fn default() -> Self {
        Self {
            radius: 15.0,
            max_distance: 80,
            ratio: 0.8,
        }
    }
}

/// Keyframes and points considered when tracking a frame.
#[derive(Debug, Clone, Default)]
pub struct LocalMap {
    pub keyframes: Vec<KeyFrameId>,
    pub points: Vec<MapPointId>,
}

impl LocalMap {
    /// The reference keyframe, its strongest covisibles, their strongest
    /// covisibles and the spanning-tree neighbours, up to `max_keyframes`.
    pub fn build(map: &Map, reference: KeyFrameId, max_keyframes: usize) -> Self {
        let max_keyframes = max_keyframes.max(1);
        let mut keyframes = Vec::new();
        let mut seen = HashSet::new();
        let mut push = |id: KeyFrameId, keyframes: &mut Vec<KeyFrameId>| {
            if keyframes.len() < max_keyframes && map.keyframe(id).is_some() && seen.insert(id) {
                keyframes.push(id);
            }
        };

        push(reference, &mut keyframes);
        let first_ring = map.best_covisibles(reference, max_keyframes);
        for &id in &first_ring {
            push(id, &mut keyframes);
        }
        if let Some(kf) = map.keyframe(reference) {
            if let Some(parent) = kf.parent {
                push(parent, &mut keyframes);
            }
            for &child in &kf.children {
                push(child, &mut keyframes);
            }
        }
        for &id in &first_ring {
            for second in map.best_covisibles(id, 5) {
                push(second, &mut keyframes);
            }
        }

        let points = map.map_points_of(&keyframes).into_iter().collect();
        Self { keyframes, points }
    }
}

/// Outcome of one projection search.
#[derive(Debug, Clone, Default)]
pub struct ProjectionSearch {
    /// New associations written into the frame.
    pub matches: usize,
    /// Points predicted inside the frustum.
    pub visible: Vec<MapPointId>,
}

/// Projects `points` with `pose_cw` and associates each with the best
/// unmatched frame feature near its projection. Points already matched in
/// the frame are skipped. When two points compete for one feature the lower
/// descriptor distance wins.
pub fn search_by_projection(
    frame: &mut Frame,
    map: &Map,
    points: &[MapPointId],
    pose_cw: &SE3,
    camera: &CameraModel,
    params: &ProjectionSearchParams,
) -> ProjectionSearch {
    let levels = map.scale_levels();
    let center = pose_cw.camera_center();
    let already: BTreeSet<MapPointId> = frame.map_points.iter().flatten().copied().collect();

    let mut visible = Vec::new();
    let mut candidates: Vec<(u32, usize, MapPointId)> = Vec::new();
    for &mp_id in points {
        if already.contains(&mp_id) {
            continue;
        }
        let Some(mp) = map.map_point(mp_id) else { continue };
        let p_c = pose_cw.transform_point(&mp.position);
        let Some(px) = camera.project(&p_c) else { continue };
        if !camera.in_image(&px, 0.0) {
            continue;
        }
        let ray = mp.position - center;
        let distance = ray.norm();
        if !mp.is_in_distance_range(distance) {
            continue;
        }
        if mp.normal.norm() > 1e-9 && ray.dot(&mp.normal) / distance < MIN_VIEW_COS {
            continue;
        }
        visible.push(mp_id);

        let octave = mp.predict_octave(distance, levels);
        let radius = params.radius * levels.factor(octave);
        let mut best: Option<(u32, usize)> = None;
        let mut second: Option<(u32, usize)> = None;
        for idx in frame.features_in_area(&px, radius, Some((octave.saturating_sub(1), octave + 1))) {
            if frame.map_points[idx].is_some() {
                continue;
            }
            let dist = hamming_distance(&mp.descriptor, &frame.descriptors[idx]);
            if best.map_or(true, |(d, _)| dist < d) {
                second = best;
                best = Some((dist, idx));
            } else if second.map_or(true, |(d, _)| dist < d) {
                second = Some((dist, idx));
            }
        }
        let Some((dist, idx)) = best else { continue };
        if dist > params.max_distance {
            continue;
        }
        if let Some((d2, idx2)) = second {
            let same_level = frame.keypoints[idx].octave == frame.keypoints[idx2].octave;
            if same_level && dist as f64 > params.ratio * d2 as f64 {
                continue;
            }
        }
        candidates.push((dist, idx, mp_id));
    }

    candidates.sort_unstable();
    let mut matches = 0;
    for (_, idx, mp_id) in candidates {
        if frame.map_points[idx].is_none() {
            frame.map_points[idx] = Some(mp_id);
            matches += 1;
        }
    }
    ProjectionSearch { matches, visible }
}

/// Pose optimizer observations for the frame's current associations,
/// aligned with the returned `(feature, point)` list.
pub fn frame_observations(frame: &Frame, map: &Map) -> (Vec<PoseObservation>, Vec<(usize, MapPointId)>) {
    let levels = map.scale_levels();
    let mut observations = Vec::new();
    let mut pairs = Vec::new();
    for (idx, mp_id) in frame.tracked() {
        let Some(mp) = map.map_point(mp_id) else { continue };
        observations.push(PoseObservation {
            pixel: frame.points[idx],
            point_w: mp.position,
            sigma2: levels.sigma2(frame.keypoints[idx].octave),
        });
        pairs.push((idx, mp_id));
    }
    (observations, pairs)
}
