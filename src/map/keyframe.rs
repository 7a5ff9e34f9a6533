//! KeyFrame: a frame promoted into the map.
//!
//! A keyframe keeps its features, its pose and two graph relationships:
//! covisibility (shared map point counts, maintained incrementally by
//! [`super::Map::associate`]) and the spanning tree used by loop correction.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use nalgebra::{Vector2, Vector3};

use super::types::{KeyFrameId, MapPointId};
use crate::features::{DepthImage, Descriptor, GrayImage, KeyPoint};
use crate::geometry::SE3;
use crate::vocabulary::BowVector;

/// Everything needed to create a keyframe from a tracked frame.
#[derive(Debug, Clone)]
pub struct KeyFrameSource {
    pub frame_id: u64,
    pub timestamp: f64,
    pub pose_cw: SE3,
    pub keypoints: Vec<KeyPoint>,
    /// Undistorted keypoint positions.
    pub points: Vec<Vector2<f64>>,
    pub descriptors: Vec<Descriptor>,
    pub bow: BowVector,
    pub image: Option<Arc<GrayImage>>,
    pub depth: Option<Arc<DepthImage>>,
}

#[derive(Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,
    /// Id of the frame this keyframe was created from.
    pub frame_id: u64,
    pub timestamp: f64,
    /// World-to-camera pose.
    pub pose_cw: SE3,

    pub keypoints: Vec<KeyPoint>,
    /// Undistorted keypoint positions, used by all geometry.
    pub points: Vec<Vector2<f64>>,
    pub descriptors: Vec<Descriptor>,
    pub bow: BowVector,

    /// Feature index → MapPoint association.
    pub map_point_ids: Vec<Option<MapPointId>>,

    /// Connected keyframe → number of shared map points.
    covisibility: BTreeMap<KeyFrameId, usize>,

    pub parent: Option<KeyFrameId>,
    pub children: BTreeSet<KeyFrameId>,
    pub loop_edges: BTreeSet<KeyFrameId>,

    pub image: Option<Arc<GrayImage>>,
    pub depth: Option<Arc<DepthImage>>,
}

impl KeyFrame {
    pub fn new(id: KeyFrameId, source: KeyFrameSource) -> Self {
        let num_features = source.keypoints.len();
        Self {
            id,
            frame_id: source.frame_id,
            timestamp: source.timestamp,
            pose_cw: source.pose_cw,
            keypoints: source.keypoints,
            points: source.points,
            descriptors: source.descriptors,
            bow: source.bow,
            map_point_ids: vec![None; num_features],
            covisibility: BTreeMap::new(),
            parent: None,
            children: BTreeSet::new(),
            loop_edges: BTreeSet::new(),
            image: source.image,
            depth: source.depth,
        }
    }

    pub fn pose_wc(&self) -> SE3 {
        self.pose_cw.inverse()
    }

    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose_cw.camera_center()
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Point Associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Associates a feature with a MapPoint, returning the previous one.
    pub(super) fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        let slot = self.map_point_ids.get_mut(feature_idx)?;
        slot.replace(mp_id)
    }

    pub(super) fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(feature_idx)?.take()
    }

    /// `(feature index, map point)` for every associated feature.
    pub fn map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }

    /// Feature index observing `mp_id`, if any.
    pub fn feature_of(&self, mp_id: MapPointId) -> Option<usize> {
        self.map_point_ids.iter().position(|m| *m == Some(mp_id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    pub fn covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisibility(&self) -> &BTreeMap<KeyFrameId, usize> {
        &self.covisibility
    }

    pub(super) fn set_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        if weight == 0 {
            self.covisibility.remove(&kf_id);
        } else {
            self.covisibility.insert(kf_id, weight);
        }
    }

    pub(super) fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        self.covisibility.remove(&kf_id);
    }

    /// Covisible keyframes with their weights, heaviest first (ties by id).
    pub fn ordered_covisibles(&self) -> Vec<(KeyFrameId, usize)> {
        let mut ordered: Vec<(KeyFrameId, usize)> = self.covisibility.iter().map(|(&id, &w)| (id, w)).collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ordered
    }

    /// Up to `n` covisible keyframes, heaviest first.
    pub fn best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        self.ordered_covisibles().into_iter().take(n).map(|(id, _)| id).collect()
    }

    /// Covisible keyframes sharing at least `min_weight` points.
    pub fn covisibles_above(&self, min_weight: usize) -> Vec<KeyFrameId> {
        self.ordered_covisibles()
            .into_iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| id)
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spatial Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Features within `radius` of an undistorted position, optionally
    /// restricted to an octave range.
    pub fn features_in_area(&self, center: &Vector2<f64>, radius: f64, levels: Option<(usize, usize)>) -> Vec<usize> {
        let radius_sq = radius * radius;
        (0..self.points.len())
            .filter(|&i| {
                levels.map_or(true, |(lo, hi)| (lo..=hi).contains(&self.keypoints[i].octave))
                    && (self.points[i] - center).norm_squared() <= radius_sq
            })
            .collect()
    }
}

impl fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("frame_id", &self.frame_id)
            .field("features", &self.keypoints.len())
            .field("map_points", &self.num_map_points())
            .field("covisibles", &self.covisibility.len())
            .field("parent", &self.parent)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Keyframe source with `n` features laid out on a line.
    pub(crate) fn source(n: usize, pose_cw: SE3) -> KeyFrameSource {
        let points: Vec<Vector2<f64>> = (0..n).map(|i| Vector2::new(10.0 * i as f64, 5.0)).collect();
        KeyFrameSource {
            frame_id: 0,
            timestamp: 0.0,
            pose_cw,
            keypoints: points
                .iter()
                .map(|p| KeyPoint {
                    pt: *p,
                    octave: 0,
                    scale: 1.0,
                    angle: 0.0,
                    response: 1.0,
                })
                .collect(),
            points,
            descriptors: (0..n).map(|i| [i as u8; 32]).collect(),
            bow: BowVector::new(),
            image: None,
            depth: None,
        }
    }

    #[test]
    fn test_map_point_slots() {
        let mut kf = KeyFrame::new(KeyFrameId::new(0), source(4, SE3::identity()));
        assert_eq!(kf.set_map_point(2, MapPointId::new(9)), None);
        assert_eq!(kf.map_point(2), Some(MapPointId::new(9)));
        assert_eq!(kf.feature_of(MapPointId::new(9)), Some(2));
        assert_eq!(kf.set_map_point(10, MapPointId::new(1)), None);
        assert_eq!(kf.erase_map_point(2), Some(MapPointId::new(9)));
        assert_eq!(kf.num_map_points(), 0);
    }

    #[test]
    fn test_ordered_covisibles() {
        let mut kf = KeyFrame::new(KeyFrameId::new(0), source(1, SE3::identity()));
        kf.set_covisibility(KeyFrameId::new(3), 5);
        kf.set_covisibility(KeyFrameId::new(1), 20);
        kf.set_covisibility(KeyFrameId::new(2), 5);
        kf.set_covisibility(KeyFrameId::new(0), 99);
        assert_eq!(kf.best_covisibles(2), vec![KeyFrameId::new(1), KeyFrameId::new(2)]);
        assert_eq!(kf.covisibles_above(6), vec![KeyFrameId::new(1)]);
        kf.set_covisibility(KeyFrameId::new(1), 0);
        assert_eq!(kf.covisibility_weight(KeyFrameId::new(1)), 0);
    }

    #[test]
    fn test_features_in_area() {
        let kf = KeyFrame::new(KeyFrameId::new(0), source(10, SE3::identity()));
        let found = kf.features_in_area(&Vector2::new(20.0, 5.0), 10.5, None);
        assert_eq!(found, vec![1, 2, 3]);
        assert!(kf.features_in_area(&Vector2::new(20.0, 5.0), 10.5, Some((1, 3))).is_empty());
    }
}
