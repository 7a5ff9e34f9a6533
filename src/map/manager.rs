//! Map maintenance: keyframe insertion with triangulation, point fusion,
//! culling and application of optimizer corrections.
//!
//! `MapManager` carries no map state of its own. Every operation takes the
//! map it mutates, so the same code runs on the live map under the writer
//! lock and on private copies in tests.

use std::collections::BTreeSet;

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::keyframe::KeyFrameSource;
use super::map::Map;
use super::types::{KeyFrameId, MapPointId};
use crate::features::{hamming_distance, FeatureMatcher, MatcherConfig};
use crate::geometry::linalg::median;
use crate::geometry::so3::skew;
use crate::geometry::triangulation::{reprojection_error_sq, triangulate_checked, TriangulationCheck, ViewObservation};
use crate::geometry::two_view::{CHI2_ONE_DOF, CHI2_TWO_DOF};
use crate::geometry::{CameraModel, SE3};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapManagerConfig {
    /// Keyframes sharing at least this many points are covisibility neighbours.
    pub covisibility_min_weight: usize,
    /// Neighbours used to triangulate and fuse new points.
    pub triangulation_neighbors: usize,
    /// Baseline must exceed this fraction of the neighbour's median depth.
    pub min_baseline_ratio: f64,
    /// Rays must diverge more than this (cosine of the parallax angle).
    pub min_parallax_cos: f64,
    pub max_descriptor_distance: u32,
    /// Projection search radius for fusion, in level-0 pixels.
    pub fuse_radius: f64,
    /// A keyframe is redundant when more than this fraction of its points
    /// are seen by enough other keyframes.
    pub keyframe_redundancy: f64,
    pub redundant_observers: usize,
    /// Keyframes a new point may live before the observation rule applies.
    pub grace_keyframes: u64,
    pub min_found_ratio: f64,
    /// Mean level-normalised reprojection error (px) above which a point is culled.
    pub max_reprojection_error: f64,
}

impl Default for MapManagerConfig {
    fn default() -> Self {
        Self {
            covisibility_min_weight: 15,
            triangulation_neighbors: 10,
            min_baseline_ratio: 0.01,
            min_parallax_cos: 0.9998,
            max_descriptor_distance: 50,
            fuse_radius: 3.0,
            keyframe_redundancy: 0.9,
            redundant_observers: 3,
            grace_keyframes: 3,
            min_found_ratio: 0.25,
            max_reprojection_error: 3.0,
        }
    }
}

/// What one keyframe insertion did to the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyFrameInsertion {
    pub keyframe_id: KeyFrameId,
    pub tracked_points: usize,
    pub new_points: usize,
    pub fused_points: usize,
}

/// Pose and position updates computed off the map, applied in one step.
#[derive(Debug, Clone, Default)]
pub struct MapCorrection {
    pub keyframe_poses: Vec<(KeyFrameId, SE3)>,
    pub map_points: Vec<(MapPointId, Vector3<f64>)>,
    /// Observations rejected as outliers, removed on apply.
    pub outlier_observations: Vec<(KeyFrameId, MapPointId)>,
}

impl MapCorrection {
    pub fn is_empty(&self) -> bool {
        self.keyframe_poses.is_empty() && self.map_points.is_empty() && self.outlier_observations.is_empty()
    }
}

pub struct MapManager {
    camera: CameraModel,
    config: MapManagerConfig,
    matcher: FeatureMatcher,
}

impl MapManager {
    pub fn new(camera: CameraModel, config: MapManagerConfig, matcher: MatcherConfig) -> Self {
        let matcher = FeatureMatcher::new(MatcherConfig {
            max_distance: config.max_descriptor_distance.min(matcher.max_distance),
            ..matcher
        });
        Self { camera, config, matcher }
    }

    pub fn config(&self) -> &MapManagerConfig {
        &self.config
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Insertion
    // ─────────────────────────────────────────────────────────────────────────

    /// Inserts a tracked frame as a keyframe.
    ///
    /// `tracked` lists `(feature index, map point)` pairs found by tracking.
    /// The keyframe is linked into the covisibility graph and spanning tree,
    /// new points are triangulated against its neighbours and duplicates are
    /// fused.
    pub fn insert_keyframe(&self, map: &mut Map, source: KeyFrameSource, tracked: &[(usize, MapPointId)]) -> KeyFrameInsertion {
        let kf_id = map.create_keyframe(source);

        let mut tracked_points = 0;
        for &(feature_idx, mp_id) in tracked {
            if map.associate(kf_id, feature_idx, mp_id) {
                tracked_points += 1;
                map.update_map_point_geometry(mp_id);
            }
        }
        map.update_connections(kf_id);

        let new_points = self.triangulate_new_points(map, kf_id);
        let fused_points = self.fuse_with_neighbors(map, kf_id);
        if map.keyframe(kf_id).map_or(false, |kf| kf.parent.is_none()) {
            map.update_connections(kf_id);
        }

        debug!(
            "[MapManager] inserted {}: tracked={} new={} fused={} (kfs={}, points={})",
            kf_id,
            tracked_points,
            new_points,
            fused_points,
            map.num_keyframes(),
            map.num_map_points()
        );
        KeyFrameInsertion {
            keyframe_id: kf_id,
            tracked_points,
            new_points,
            fused_points,
        }
    }

    /// Creates the first two keyframes of an empty map and the points
    /// triangulated between them. `points` holds `(reference feature,
    /// current feature, world position)`. Returns both keyframe ids.
    pub fn initialize_map(
        &self,
        map: &mut Map,
        reference: KeyFrameSource,
        current: KeyFrameSource,
        points: &[(usize, usize, Vector3<f64>)],
    ) -> (KeyFrameId, KeyFrameId) {
        let kf0 = map.create_keyframe(reference);
        let kf1 = map.create_keyframe(current);
        for &(i0, i1, position) in points {
            let Some(kf) = map.keyframe(kf0) else { break };
            let Some(&descriptor) = kf.descriptors.get(i0) else { continue };
            let color = kf
                .image
                .as_ref()
                .and_then(|img| img.sample_bilinear(kf.keypoints[i0].pt.x, kf.keypoints[i0].pt.y))
                .map(|g| g.round().clamp(0.0, 255.0) as u8);

            let mp_id = map.create_map_point(position, descriptor, kf0);
            if let (Some(mp), Some(gray)) = (map.map_point_mut(mp_id), color) {
                mp.color = [gray; 3];
            }
            if !map.associate(kf0, i0, mp_id) || !map.associate(kf1, i1, mp_id) {
                map.remove_map_point(mp_id);
                continue;
            }
            map.update_map_point_geometry(mp_id);
        }
        map.update_connections(kf1);
        info!(
            "[MapManager] initial map: {} and {} with {} points",
            kf0,
            kf1,
            map.num_map_points()
        );
        (kf0, kf1)
    }

    /// Adds per-point `(visible, found)` counts gathered by tracking.
    pub fn apply_point_statistics(&self, map: &mut Map, stats: &[(MapPointId, u32, u32)]) {
        for &(mp_id, visible, found) in stats {
            if let Some(mp) = map.map_point_mut(mp_id) {
                mp.increase_visible(visible);
                mp.increase_found(found);
            }
        }
    }

    /// Neighbours used for triangulation: best covisibles, or the previous
    /// keyframe when the new one shares nothing yet.
    fn triangulation_neighbors(&self, map: &Map, kf_id: KeyFrameId) -> Vec<KeyFrameId> {
        let mut neighbors = map.best_covisibles(kf_id, self.config.triangulation_neighbors);
        if neighbors.is_empty() {
            if let Some(parent) = map.keyframe(kf_id).and_then(|kf| kf.parent) {
                neighbors.push(parent);
            }
        }
        neighbors
    }

    /// Triangulates unassociated features of `kf_id` against its neighbours.
    pub fn triangulate_new_points(&self, map: &mut Map, kf_id: KeyFrameId) -> usize {
        let neighbors = self.triangulation_neighbors(map, kf_id);
        let levels = map.scale_levels().clone();
        let check = TriangulationCheck {
            max_parallax_cos: self.config.min_parallax_cos,
            ..TriangulationCheck::default()
        };
        let ratio_factor = 1.5 * levels.factor(1);
        let mut created = Vec::new();

        for neighbor_id in neighbors {
            let (Some(kf1), Some(kf2)) = (map.keyframe(kf_id), map.keyframe(neighbor_id)) else {
                continue;
            };
            let baseline = (kf1.camera_center() - kf2.camera_center()).norm();
            let Some(depth) = scene_median_depth(map, neighbor_id) else {
                continue;
            };
            if baseline / depth < self.config.min_baseline_ratio {
                continue;
            }

            let free1: Vec<usize> = (0..kf1.num_features()).filter(|&i| kf1.map_point(i).is_none()).collect();
            let free2: Vec<usize> = (0..kf2.num_features()).filter(|&i| kf2.map_point(i).is_none()).collect();
            let desc1: Vec<_> = free1.iter().map(|&i| kf1.descriptors[i]).collect();
            let desc2: Vec<_> = free2.iter().map(|&i| kf2.descriptors[i]).collect();
            let f21 = fundamental_between(&self.camera, &kf1.pose_cw, &kf2.pose_cw);

            let mut accepted = Vec::new();
            for m in self.matcher.match_descriptors(&desc1, &desc2) {
                let (i1, i2) = (free1[m.query_idx], free2[m.train_idx]);
                let (o1, o2) = (kf1.keypoints[i1].octave, kf2.keypoints[i2].octave);
                if !epipolar_consistent(&f21, &kf1.points[i1], &kf2.points[i2], levels.sigma2(o2)) {
                    continue;
                }
                let Some(p) = triangulate_checked(
                    &self.camera,
                    ViewObservation {
                        pose_cw: &kf1.pose_cw,
                        pixel: kf1.points[i1],
                        sigma2: levels.sigma2(o1),
                    },
                    ViewObservation {
                        pose_cw: &kf2.pose_cw,
                        pixel: kf2.points[i2],
                        sigma2: levels.sigma2(o2),
                    },
                    &check,
                ) else {
                    continue;
                };

                let dist1 = (p - kf1.camera_center()).norm();
                let dist2 = (p - kf2.camera_center()).norm();
                if dist1 <= 0.0 || dist2 <= 0.0 {
                    continue;
                }
                let ratio_dist = dist2 / dist1;
                let ratio_octave = levels.factor(o1) / levels.factor(o2);
                if ratio_dist * ratio_factor < ratio_octave || ratio_dist > ratio_octave * ratio_factor {
                    continue;
                }
                let color = kf1
                    .image
                    .as_ref()
                    .and_then(|img| img.sample_bilinear(kf1.keypoints[i1].pt.x, kf1.keypoints[i1].pt.y))
                    .map(|g| g.round().clamp(0.0, 255.0) as u8);
                accepted.push((i1, i2, p, kf1.descriptors[i1], color));
            }

            for (i1, i2, p, descriptor, color) in accepted {
                let mp_id = map.create_map_point(p, descriptor, kf_id);
                if let (Some(mp), Some(gray)) = (map.map_point_mut(mp_id), color) {
                    mp.color = [gray; 3];
                }
                if !map.associate(kf_id, i1, mp_id) || !map.associate(neighbor_id, i2, mp_id) {
                    map.remove_map_point(mp_id);
                    continue;
                }
                map.update_map_point_geometry(mp_id);
                created.push(mp_id);
            }
        }

        if !created.is_empty() {
            debug!("[MapManager] triangulated {} points for {}", created.len(), kf_id);
        }
        created.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fusion
    // ─────────────────────────────────────────────────────────────────────────

    /// Fuses the points of `kf_id` with those of its neighbourhood in both
    /// directions. Returns the number of merged or newly linked observations.
    pub fn fuse_with_neighbors(&self, map: &mut Map, kf_id: KeyFrameId) -> usize {
        let neighbors = self.triangulation_neighbors(map, kf_id);
        if neighbors.is_empty() {
            return 0;
        }
        let own: Vec<MapPointId> = map.map_points_of(&[kf_id]).into_iter().collect();
        let mut fused = self.fuse_points(map, &own, &neighbors);

        let theirs: Vec<MapPointId> = map
            .map_points_of(&neighbors)
            .into_iter()
            .filter(|mp| map.map_point(*mp).map_or(false, |p| !p.is_observed_by(kf_id)))
            .collect();
        fused += self.fuse_points(map, &theirs, &[kf_id]);
        fused
    }

    /// Projects each point into each target keyframe and links it with the
    /// best matching feature there. A feature that already carries another
    /// point triggers a merge into the better observed of the two.
    pub fn fuse_points(&self, map: &mut Map, points: &[MapPointId], targets: &[KeyFrameId]) -> usize {
        let levels = map.scale_levels().clone();
        let mut fused = 0;
        for &mp_id in points {
            for &kf_id in targets {
                let Some(mp) = map.map_point(mp_id) else { break };
                let Some(kf) = map.keyframe(kf_id) else { continue };
                if mp.is_observed_by(kf_id) {
                    continue;
                }
                let p_c = kf.pose_cw.transform_point(&mp.position);
                let Some(px) = self.camera.project(&p_c) else { continue };
                if !self.camera.in_image(&px, 0.0) {
                    continue;
                }
                let distance = (mp.position - kf.camera_center()).norm();
                if !mp.is_in_distance_range(distance) {
                    continue;
                }
                let octave = mp.predict_octave(distance, &levels);
                let radius = self.config.fuse_radius * levels.factor(octave);
                let lo = octave.saturating_sub(1);
                let hi = octave + 1;

                let mut best: Option<(u32, usize)> = None;
                for idx in kf.features_in_area(&px, radius, Some((lo, hi))) {
                    let err = (kf.points[idx] - px).norm_squared() / levels.sigma2(kf.keypoints[idx].octave);
                    if err > CHI2_TWO_DOF {
                        continue;
                    }
                    let dist = hamming_distance(&mp.descriptor, &kf.descriptors[idx]);
                    if dist <= self.config.max_descriptor_distance && best.map_or(true, |(d, _)| dist < d) {
                        best = Some((dist, idx));
                    }
                }
                let Some((_, idx)) = best else { continue };

                match kf.map_point(idx) {
                    Some(existing) if existing != mp_id => {
                        let existing_obs = map.map_point(existing).map_or(0, |p| p.num_observations());
                        let own_obs = mp.num_observations();
                        let (keep, drop) = if existing_obs >= own_obs { (existing, mp_id) } else { (mp_id, existing) };
                        if map.replace_map_point(drop, keep) {
                            fused += 1;
                        }
                        if drop == mp_id {
                            break;
                        }
                    }
                    Some(_) => {}
                    None => {
                        if map.associate(kf_id, idx, mp_id) {
                            map.update_map_point_geometry(mp_id);
                            fused += 1;
                        }
                    }
                }
            }
        }
        fused
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Culling
    // ─────────────────────────────────────────────────────────────────────────

    /// Removes points that are rarely found when predicted visible, that lost
    /// their second observer after the grace period, or whose reprojection
    /// error stays high.
    pub fn cull_map_points(&self, map: &mut Map) -> usize {
        let now = map.keyframe_counter();
        let levels = map.scale_levels().clone();
        let to_cull: Vec<MapPointId> = map
            .map_points()
            .filter(|mp| {
                let age = now.saturating_sub(mp.created_at);
                if mp.num_observations() < 2 && (age >= self.config.grace_keyframes || mp.visible_count > 2) {
                    return true;
                }
                if mp.found_ratio() < self.config.min_found_ratio {
                    return true;
                }
                if age < self.config.grace_keyframes {
                    return false;
                }
                let mut errors = Vec::with_capacity(mp.num_observations());
                for (&kf_id, &idx) in &mp.observations {
                    let Some(kf) = map.keyframe(kf_id) else { continue };
                    let sigma2 = levels.sigma2(kf.keypoints.get(idx).map_or(0, |k| k.octave));
                    match reprojection_error_sq(&self.camera, &kf.pose_cw, &mp.position, &kf.points[idx]) {
                        Some(e) => errors.push((e / sigma2).sqrt()),
                        None => return true,
                    }
                }
                !errors.is_empty() && errors.iter().sum::<f64>() / errors.len() as f64 > self.config.max_reprojection_error
            })
            .map(|mp| mp.id)
            .collect();

        for &mp_id in &to_cull {
            map.remove_map_point(mp_id);
        }
        if !to_cull.is_empty() {
            debug!("[MapCulling] removed {} points (remaining: {})", to_cull.len(), map.num_map_points());
        }
        to_cull.len()
    }

    /// Removes covisible keyframes of `current` whose points are more than
    /// the redundancy fraction seen by enough other keyframes at the same or
    /// a finer scale. Never removes `current` or the origin.
    pub fn cull_keyframes(&self, map: &mut Map, current: KeyFrameId) -> usize {
        let candidates = map.covisible_keyframes(current, 1);
        let mut removed = 0;
        for kf_id in candidates {
            if kf_id == current || Some(kf_id) == map.origin() {
                continue;
            }
            if !self.is_redundant(map, kf_id) {
                continue;
            }
            if remove_keyframe_with_points(map, kf_id) {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("[KFCulling] removed {} redundant keyframes (remaining: {})", removed, map.num_keyframes());
        }
        removed
    }

    /// Removes every keyframe other than the origin that shares no point
    /// with any other keyframe, repeating while removals orphan further
    /// keyframes. Run after the other culls.
    pub fn cull_orphan_keyframes(&self, map: &mut Map) -> usize {
        let mut removed = 0;
        loop {
            let orphans: Vec<KeyFrameId> = map
                .keyframe_ids()
                .into_iter()
                .filter(|&id| Some(id) != map.origin() && map.covisible_keyframes(id, 1).is_empty())
                .collect();
            if orphans.is_empty() {
                break;
            }
            for kf_id in orphans {
                if remove_keyframe_with_points(map, kf_id) {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!("[KFCulling] removed {} disconnected keyframes (remaining: {})", removed, map.num_keyframes());
        }
        removed
    }

    fn is_redundant(&self, map: &Map, kf_id: KeyFrameId) -> bool {
        let Some(kf) = map.keyframe(kf_id) else {
            return false;
        };
        let mut total = 0usize;
        let mut redundant = 0usize;
        for (idx, mp_id) in kf.map_point_indices() {
            let Some(mp) = map.map_point(mp_id) else { continue };
            total += 1;
            let octave = kf.keypoints[idx].octave;
            let observers = mp
                .observations
                .iter()
                .filter(|(&other, _)| other != kf_id)
                .filter(|(other, &other_idx)| {
                    map.keyframe(**other)
                        .and_then(|o| o.keypoints.get(other_idx))
                        .map_or(false, |k| k.octave <= octave + 1)
                })
                .count();
            if observers >= self.config.redundant_observers {
                redundant += 1;
            }
        }
        total > 0 && redundant as f64 > self.config.keyframe_redundancy * total as f64
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Corrections
    // ─────────────────────────────────────────────────────────────────────────

    /// Writes optimized poses and positions back. Entities removed since the
    /// correction was computed are skipped. Returns the number of updates.
    pub fn apply_correction(&self, map: &mut Map, correction: &MapCorrection) -> usize {
        let mut updated = 0;
        for (kf_id, pose) in &correction.keyframe_poses {
            if map.keyframe(*kf_id).is_some() {
                map.set_keyframe_pose(*kf_id, *pose);
                updated += 1;
            }
        }
        for (mp_id, position) in &correction.map_points {
            if map.map_point(*mp_id).is_some() {
                map.set_map_point_position(*mp_id, *position);
                updated += 1;
            }
        }
        for &(kf_id, mp_id) in &correction.outlier_observations {
            let idx = map.keyframe(kf_id).and_then(|kf| kf.feature_of(mp_id));
            if let Some(idx) = idx {
                map.disassociate(kf_id, idx);
            }
        }
        let touched: BTreeSet<MapPointId> = correction
            .map_points
            .iter()
            .map(|(id, _)| *id)
            .chain(correction.outlier_observations.iter().map(|(_, id)| *id))
            .collect();
        for mp_id in touched {
            if map.map_point(mp_id).map_or(false, |mp| mp.num_observations() < 2) {
                map.remove_map_point(mp_id);
            } else {
                map.update_map_point_geometry(mp_id);
            }
        }
        map.bump_version();
        updated
    }
}

/// Median depth of the points a keyframe observes.
pub fn scene_median_depth(map: &Map, kf_id: KeyFrameId) -> Option<f64> {
    let kf = map.keyframe(kf_id)?;
    let mut depths: Vec<f64> = kf
        .map_point_indices()
        .filter_map(|(_, mp)| map.map_point(mp))
        .map(|mp| kf.pose_cw.transform_point(&mp.position).z)
        .filter(|z| *z > 0.0)
        .collect();
    median(&mut depths)
}

/// Fundamental matrix mapping pixels of view 1 to epipolar lines in view 2.
fn fundamental_between(camera: &CameraModel, pose1_cw: &SE3, pose2_cw: &SE3) -> Matrix3<f64> {
    let t21 = pose2_cw.compose(&pose1_cw.inverse());
    let e = skew(&t21.translation) * t21.rotation_matrix();
    let k_inv = camera.k_inverse();
    k_inv.transpose() * e * k_inv
}

fn epipolar_consistent(f21: &Matrix3<f64>, p1: &Vector2<f64>, p2: &Vector2<f64>, sigma2: f64) -> bool {
    let line = f21 * p1.push(1.0);
    let den = line.x * line.x + line.y * line.y;
    if den < 1e-20 {
        return false;
    }
    let num = line.dot(&p2.push(1.0));
    num * num / den < CHI2_ONE_DOF * sigma2
}

/// Removes a keyframe and the points left with fewer than two observers.
fn remove_keyframe_with_points(map: &mut Map, kf_id: KeyFrameId) -> bool {
    let points: Vec<MapPointId> = map.map_points_of(&[kf_id]).into_iter().collect();
    if !map.remove_keyframe(kf_id) {
        return false;
    }
    for mp_id in points {
        if map.map_point(mp_id).map_or(false, |mp| mp.num_observations() < 2) {
            map.remove_map_point(mp_id);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{KeyPoint, ScaleLevels};
    use crate::map::KeyFrameSource;
    use crate::vocabulary::BowVector;
    use nalgebra::UnitQuaternion;

    fn camera() -> CameraModel {
        CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480)
    }

    fn descriptor(i: usize) -> [u8; 32] {
        let mut d = [0u8; 32];
        let mut state = (i as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        for b in d.iter_mut() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            *b = state as u8;
        }
        d
    }

    fn scene() -> Vec<Vector3<f64>> {
        (0..60)
            .map(|i| {
                let x = (i % 10) as f64 * 0.3 - 1.35;
                let y = (i / 10) as f64 * 0.3 - 0.75;
                Vector3::new(x, y, 4.0 + 0.5 * ((i * 7) % 5) as f64)
            })
            .collect()
    }

    fn view(points: &[Vector3<f64>], pose_cw: SE3) -> KeyFrameSource {
        let cam = camera();
        let mut pixels = Vec::new();
        let mut descriptors = Vec::new();
        for (i, p) in points.iter().enumerate() {
            if let Some(px) = cam.project(&pose_cw.transform_point(p)) {
                if cam.in_image(&px, 0.0) {
                    pixels.push(px);
                    descriptors.push(descriptor(i));
                }
            }
        }
        KeyFrameSource {
            frame_id: 0,
            timestamp: 0.0,
            pose_cw,
            keypoints: pixels
                .iter()
                .map(|p| KeyPoint {
                    pt: *p,
                    octave: 0,
                    scale: 1.0,
                    angle: 0.0,
                    response: 1.0,
                })
                .collect(),
            points: pixels,
            descriptors,
            bow: BowVector::new(),
            image: None,
            depth: None,
        }
    }

    fn pose_at(x: f64) -> SE3 {
        SE3::from_parts(UnitQuaternion::identity(), Vector3::new(-x, 0.0, 0.0))
    }

    /// Map with two keyframes 0.3 apart, every scene point triangulated.
    fn bootstrap() -> (Map, MapManager, Vec<Vector3<f64>>) {
        let pts = scene();
        let manager = MapManager::new(camera(), MapManagerConfig::default(), MatcherConfig::default());
        let mut map = Map::new(ScaleLevels::new(4, 1.2));
        let kf0 = map.create_keyframe(view(&pts, pose_at(0.0)));
        let kf1 = map.create_keyframe(view(&pts, pose_at(0.3)));
        for (i, p) in pts.iter().enumerate() {
            let mp = map.create_map_point(*p, descriptor(i), kf0);
            map.associate(kf0, i, mp);
            map.associate(kf1, i, mp);
            map.update_map_point_geometry(mp);
        }
        map.update_connections(kf1);
        (map, manager, pts)
    }

    #[test]
    fn test_insert_keyframe_tracks_and_connects() {
        let (mut map, manager, pts) = bootstrap();
        let tracked: Vec<(usize, MapPointId)> = map.map_point_ids().into_iter().enumerate().collect();
        let report = manager.insert_keyframe(&mut map, view(&pts, pose_at(0.6)), &tracked);

        assert_eq!(report.tracked_points, pts.len());
        assert_eq!(report.new_points, 0);
        let kf = map.keyframe(report.keyframe_id).unwrap();
        assert!(kf.parent.is_some());
        assert_eq!(kf.covisibility_weight(KeyFrameId::new(0)), pts.len());
        assert!(map.map_points().all(|mp| mp.num_observations() == 3));
    }

    #[test]
    fn test_triangulates_untracked_features() {
        let (mut map, manager, pts) = bootstrap();
        // Track only the first half; the rest must be triangulated against the neighbours.
        let tracked: Vec<(usize, MapPointId)> = map.map_point_ids().into_iter().enumerate().take(30).collect();
        for mp_id in map.map_point_ids().into_iter().skip(30) {
            map.remove_map_point(mp_id);
        }
        let report = manager.insert_keyframe(&mut map, view(&pts, pose_at(0.6)), &tracked);
        assert_eq!(report.tracked_points, 30);
        assert!(report.new_points >= 25, "new points: {}", report.new_points);

        for mp in map.map_points() {
            let idx = *mp.observations.get(&report.keyframe_id).unwrap();
            let truth = pts[idx];
            assert!((mp.position - truth).norm() / truth.norm() < 1e-3);
            assert!(mp.num_observations() >= 2);
        }
    }

    #[test]
    fn test_fuse_merges_duplicates() {
        let (mut map, manager, pts) = bootstrap();
        let kf2 = map.create_keyframe(view(&pts, pose_at(0.6)));
        let kf0 = KeyFrameId::new(0);
        // Duplicate of point 0, observed only by kf2.
        let dup = map.create_map_point(pts[0] + Vector3::new(0.001, 0.0, 0.0), descriptor(0), kf2);
        map.associate(kf2, 0, dup);
        let original = map.keyframe(kf0).unwrap().map_point(0).unwrap();

        let fused = manager.fuse_points(&mut map, &[dup], &[kf0]);
        assert_eq!(fused, 1);
        assert!(map.map_point(dup).is_none());
        assert_eq!(map.keyframe(kf2).unwrap().map_point(0), Some(original));
        assert_eq!(map.map_point(original).unwrap().num_observations(), 3);
    }

    #[test]
    fn test_cull_map_points_removes_bad_points() {
        let (mut map, manager, _) = bootstrap();
        let ids = map.map_point_ids();
        // Rarely found.
        map.map_point_mut(ids[0]).unwrap().increase_visible(20);
        // Far from where it is observed.
        let moved = map.map_point(ids[1]).unwrap().position + Vector3::new(0.5, 0.0, 0.0);
        map.set_map_point_position(ids[1], moved);
        for _ in 0..3 {
            map.create_keyframe(view(&scene(), pose_at(0.1)));
        }

        let culled = manager.cull_map_points(&mut map);
        assert_eq!(culled, 2);
        assert!(map.map_point(ids[0]).is_none());
        assert!(map.map_point(ids[1]).is_none());
        assert!(map.map_point(ids[2]).is_some());
    }

    #[test]
    fn test_cull_redundant_keyframe() {
        let (mut map, manager, pts) = bootstrap();
        let mut last = KeyFrameId::new(1);
        for x in [0.45, 0.6, 0.75] {
            let tracked: Vec<(usize, MapPointId)> = map.map_point_ids().into_iter().enumerate().collect();
            last = manager.insert_keyframe(&mut map, view(&pts, pose_at(x)), &tracked).keyframe_id;
        }
        assert_eq!(map.num_keyframes(), 5);

        let removed = manager.cull_keyframes(&mut map, last);
        assert!(removed >= 1);
        assert!(map.keyframe(KeyFrameId::new(0)).is_some());
        assert!(map.keyframe(last).is_some());
        assert!(map.map_points().all(|mp| mp.num_observations() >= 2));
    }

    #[test]
    fn test_initialize_map() {
        let pts = scene();
        let manager = MapManager::new(camera(), MapManagerConfig::default(), MatcherConfig::default());
        let mut map = Map::new(ScaleLevels::new(4, 1.2));
        let triples: Vec<(usize, usize, Vector3<f64>)> = pts.iter().enumerate().map(|(i, p)| (i, i, *p)).collect();
        let (kf0, kf1) = manager.initialize_map(&mut map, view(&pts, pose_at(0.0)), view(&pts, pose_at(0.3)), &triples);

        assert_eq!(map.num_map_points(), pts.len());
        assert_eq!(map.origin(), Some(kf0));
        assert_eq!(map.keyframe(kf1).unwrap().parent, Some(kf0));
        assert_eq!(map.keyframe(kf0).unwrap().covisibility_weight(kf1), pts.len());

        let id = map.map_point_ids()[0];
        manager.apply_point_statistics(&mut map, &[(id, 4, 1)]);
        let mp = map.map_point(id).unwrap();
        assert_eq!((mp.visible_count, mp.found_count), (5, 2));
    }

    #[test]
    fn test_apply_correction_skips_removed() {
        let (mut map, manager, _) = bootstrap();
        let ids = map.map_point_ids();
        map.remove_map_point(ids[5]);
        let version = map.version();
        let correction = MapCorrection {
            keyframe_poses: vec![(KeyFrameId::new(1), pose_at(0.31)), (KeyFrameId::new(9), pose_at(1.0))],
            map_points: vec![(ids[0], Vector3::new(0.0, 0.0, 5.0)), (ids[5], Vector3::zeros())],
            outlier_observations: Vec::new(),
        };
        assert_eq!(manager.apply_correction(&mut map, &correction), 2);
        assert_eq!(map.map_point(ids[0]).unwrap().position, Vector3::new(0.0, 0.0, 5.0));
        assert!(map.version() > version);
    }

    /// Every keyframe but the origin shares a point with another keyframe.
    fn assert_connected(map: &Map) {
        for id in map.keyframe_ids() {
            if Some(id) != map.origin() {
                assert!(!map.covisible_keyframes(id, 1).is_empty(), "{} is disconnected", id);
            }
        }
    }

    #[test]
    fn test_point_culling_does_not_leave_disconnected_keyframes() {
        let (mut map, manager, pts) = bootstrap();
        // Two keyframes linked to each other only by points that are rarely found.
        let kf2 = map.create_keyframe(view(&pts, pose_at(0.6)));
        let kf3 = map.create_keyframe(view(&pts, pose_at(0.9)));
        for i in 0..3 {
            let mp = map.create_map_point(pts[i], descriptor(i), kf2);
            assert!(map.associate(kf2, i, mp));
            assert!(map.associate(kf3, i, mp));
            map.map_point_mut(mp).unwrap().increase_visible(20);
        }
        assert_eq!(map.covisible_keyframes(kf2, 1), vec![kf3]);

        assert_eq!(manager.cull_map_points(&mut map), 3);
        assert_eq!(manager.cull_orphan_keyframes(&mut map), 2);
        assert!(map.keyframe(kf2).is_none());
        assert!(map.keyframe(kf3).is_none());
        assert_eq!(map.num_keyframes(), 2);
        assert_eq!(map.num_map_points(), pts.len());
        assert_connected(&map);
    }

    #[test]
    fn test_insert_and_cull_keep_keyframes_connected() {
        let (mut map, manager, pts) = bootstrap();
        // A keyframe observing nothing is dropped; the origin never is.
        let lonely = map.create_keyframe(view(&pts, pose_at(1.2)));
        for x in [0.45, 0.6, 0.75] {
            let tracked: Vec<(usize, MapPointId)> = map.map_point_ids().into_iter().take(pts.len()).enumerate().collect();
            let kf = manager.insert_keyframe(&mut map, view(&pts, pose_at(x)), &tracked).keyframe_id;
            manager.cull_map_points(&mut map);
            manager.cull_keyframes(&mut map, kf);
            manager.cull_orphan_keyframes(&mut map);
            assert_connected(&map);
        }
        assert!(map.keyframe(lonely).is_none());
        assert!(map.keyframe(KeyFrameId::new(0)).is_some());
    }
}
