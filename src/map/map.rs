//! Map - arena of KeyFrames and MapPoints.
//!
//! KeyFrames and MapPoints reference each other through ids only. The map
//! keeps both directions of every observation consistent, maintains the
//! covisibility weights incrementally and owns the place-recognition
//! database so that a cloned snapshot is self-contained.
//!
//! Two counters order concurrent work:
//! - `version` increases with every structural change
//! - `epoch` increases when the whole map is rewritten (loop correction),
//!   which invalidates any optimization computed against an older epoch

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use nalgebra::Vector3;

use super::keyframe::{KeyFrame, KeyFrameSource};
use super::keyframe_db::KeyFrameDatabase;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};
use crate::features::{Descriptor, ScaleLevels};
use crate::geometry::SE3;

#[derive(Clone)]
pub struct Map {
    keyframes: BTreeMap<KeyFrameId, KeyFrame>,
    map_points: BTreeMap<MapPointId, MapPoint>,
    next_kf_id: u64,
    next_mp_id: u64,
    /// First keyframe; fixed gauge of every optimization.
    origin: Option<KeyFrameId>,
    last_keyframe_id: Option<KeyFrameId>,
    database: KeyFrameDatabase,
    levels: ScaleLevels,
    version: u64,
    epoch: u64,
}

impl Map {
    pub fn new(levels: ScaleLevels) -> Self {
        Self {
            keyframes: BTreeMap::new(),
            map_points: BTreeMap::new(),
            next_kf_id: 0,
            next_mp_id: 0,
            origin: None,
            last_keyframe_id: None,
            database: KeyFrameDatabase::new(),
            levels,
            version: 0,
            epoch: 0,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Marks a whole-map rewrite. Results computed against older epochs are stale.
    pub fn bump_epoch(&mut self) {
        self.epoch += 1;
        self.version += 1;
    }

    pub fn scale_levels(&self) -> &ScaleLevels {
        &self.levels
    }

    pub fn database(&self) -> &KeyFrameDatabase {
        &self.database
    }

    pub fn origin(&self) -> Option<KeyFrameId> {
        self.origin
    }

    pub fn last_keyframe_id(&self) -> Option<KeyFrameId> {
        self.last_keyframe_id
    }

    /// Number of keyframes ever created; the clock of map point grace periods.
    pub fn keyframe_counter(&self) -> u64 {
        self.next_kf_id
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Adds a keyframe and indexes it for place recognition.
    pub fn create_keyframe(&mut self, source: KeyFrameSource) -> KeyFrameId {
        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;
        let kf = KeyFrame::new(id, source);
        self.database.add(id, kf.bow.clone());
        self.keyframes.insert(id, kf);
        if self.origin.is_none() {
            self.origin = Some(id);
        }
        self.last_keyframe_id = Some(id);
        self.bump_version();
        id
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn keyframe_ids(&self) -> Vec<KeyFrameId> {
        self.keyframes.keys().copied().collect()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    pub fn set_keyframe_pose(&mut self, id: KeyFrameId, pose_cw: SE3) {
        if let Some(kf) = self.keyframes.get_mut(&id) {
            kf.pose_cw = pose_cw;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_map_point(&mut self, position: Vector3<f64>, descriptor: Descriptor, reference_kf: KeyFrameId) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        let mp = MapPoint::new(id, position, descriptor, reference_kf, self.next_kf_id);
        self.map_points.insert(id, mp);
        self.bump_version();
        id
    }

    pub fn map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn map_point_ids(&self) -> Vec<MapPointId> {
        self.map_points.keys().copied().collect()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    pub fn set_map_point_position(&mut self, id: MapPointId, position: Vector3<f64>) {
        if let Some(mp) = self.map_points.get_mut(&id) {
            mp.position = position;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Links feature `feature_idx` of `kf_id` with `mp_id` in both directions
    /// and raises the covisibility weight with every other observer.
    ///
    /// Fails when either side is missing, the feature is already associated,
    /// or the keyframe already observes the point through another feature.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return false;
        };
        if feature_idx >= kf.num_features() || kf.map_point(feature_idx).is_some() {
            return false;
        }
        let Some(mp) = self.map_points.get(&mp_id) else {
            return false;
        };
        if mp.is_observed_by(kf_id) {
            return false;
        }
        let existing_observers: Vec<KeyFrameId> = mp.observations.keys().copied().collect();

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.add_observation(kf_id, feature_idx);
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(feature_idx, mp_id);
        }
        for other in existing_observers {
            self.adjust_covisibility(kf_id, other, 1);
        }
        true
    }

    /// Removes the association of one feature. Returns the point it pointed to.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get(&kf_id)?.map_point(feature_idx)?;
        let other_observers: Vec<KeyFrameId> = self
            .map_points
            .get(&mp_id)
            .map(|mp| mp.observations.keys().filter(|&&id| id != kf_id).copied().collect())
            .unwrap_or_default();

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.erase_map_point(feature_idx);
        }
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.erase_observation(kf_id);
            if mp.reference_kf == kf_id {
                if let Some(&first) = mp.observations.keys().next() {
                    mp.reference_kf = first;
                }
            }
        }
        for other in other_observers {
            self.adjust_covisibility(kf_id, other, -1);
        }
        Some(mp_id)
    }

    fn adjust_covisibility(&mut self, a: KeyFrameId, b: KeyFrameId, delta: i64) {
        if a == b {
            return;
        }
        let current = self.keyframes.get(&a).map_or(0, |kf| kf.covisibility_weight(b)) as i64;
        let weight = (current + delta).max(0) as usize;
        if let Some(kf) = self.keyframes.get_mut(&a) {
            kf.set_covisibility(b, weight);
        }
        if let Some(kf) = self.keyframes.get_mut(&b) {
            kf.set_covisibility(a, weight);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Graph Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Up to `n` covisible keyframes of `kf_id`, heaviest first.
    pub fn best_covisibles(&self, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        self.keyframes.get(&kf_id).map(|kf| kf.best_covisibles(n)).unwrap_or_default()
    }

    /// Covisibility-graph neighbours: keyframes sharing at least `min_weight` points.
    pub fn covisible_keyframes(&self, kf_id: KeyFrameId, min_weight: usize) -> Vec<KeyFrameId> {
        self.keyframes
            .get(&kf_id)
            .map(|kf| kf.covisibles_above(min_weight))
            .unwrap_or_default()
    }

    /// Gives a parentless keyframe a spanning-tree parent: its strongest
    /// covisible keyframe, or else the previous keyframe.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        if Some(kf_id) == self.origin {
            return;
        }
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };
        if kf.parent.is_some() {
            return;
        }
        let parent = kf
            .best_covisibles(1)
            .first()
            .copied()
            .or_else(|| self.keyframes.range(..kf_id).next_back().map(|(&id, _)| id));
        if let Some(parent) = parent {
            self.set_parent(kf_id, parent);
        }
    }

    fn set_parent(&mut self, child: KeyFrameId, parent: KeyFrameId) {
        if let Some(old) = self.keyframes.get(&child).and_then(|kf| kf.parent) {
            if let Some(old_kf) = self.keyframes.get_mut(&old) {
                old_kf.children.remove(&child);
            }
        }
        if let Some(kf) = self.keyframes.get_mut(&child) {
            kf.parent = Some(parent);
        }
        if let Some(kf) = self.keyframes.get_mut(&parent) {
            kf.children.insert(child);
        }
    }

    pub fn add_loop_edge(&mut self, a: KeyFrameId, b: KeyFrameId) {
        if let Some(kf) = self.keyframes.get_mut(&a) {
            kf.loop_edges.insert(b);
        }
        if let Some(kf) = self.keyframes.get_mut(&b) {
            kf.loop_edges.insert(a);
        }
        self.bump_version();
    }

    /// All map points observed by a set of keyframes.
    pub fn map_points_of(&self, kf_ids: &[KeyFrameId]) -> BTreeSet<MapPointId> {
        kf_ids
            .iter()
            .filter_map(|id| self.keyframes.get(id))
            .flat_map(|kf| kf.map_point_indices().map(|(_, mp)| mp))
            .collect()
    }

    /// Keyframes with their poses in creation order.
    pub fn trajectory(&self) -> Vec<(KeyFrameId, f64, SE3)> {
        self.keyframes.values().map(|kf| (kf.id, kf.timestamp, kf.pose_cw)).collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Removal
    // ─────────────────────────────────────────────────────────────────────────

    /// Removes a map point and every observation of it.
    pub fn remove_map_point(&mut self, mp_id: MapPointId) -> bool {
        let observations: Vec<(KeyFrameId, usize)> = match self.map_points.get(&mp_id) {
            Some(mp) => mp.observations.iter().map(|(&k, &i)| (k, i)).collect(),
            None => return false,
        };
        for (kf_id, idx) in observations {
            self.disassociate(kf_id, idx);
        }
        self.map_points.remove(&mp_id);
        self.bump_version();
        true
    }

    /// Removes a keyframe, its observations and its database entry. Children
    /// in the spanning tree are re-parented to the removed keyframe's parent.
    /// The origin keyframe is never removed.
    pub fn remove_keyframe(&mut self, kf_id: KeyFrameId) -> bool {
        if Some(kf_id) == self.origin {
            return false;
        }
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return false;
        };
        let associations: Vec<usize> = kf.map_point_indices().map(|(idx, _)| idx).collect();
        let parent = kf.parent;
        let children: Vec<KeyFrameId> = kf.children.iter().copied().collect();
        let loop_partners: Vec<KeyFrameId> = kf.loop_edges.iter().copied().collect();

        for idx in associations {
            self.disassociate(kf_id, idx);
        }
        if let Some(parent) = parent {
            if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
                parent_kf.children.remove(&kf_id);
            }
            for child in children {
                if let Some(child_kf) = self.keyframes.get_mut(&child) {
                    child_kf.parent = None;
                }
                self.set_parent(child, parent);
            }
        }
        for partner in loop_partners {
            if let Some(p) = self.keyframes.get_mut(&partner) {
                p.loop_edges.remove(&kf_id);
            }
        }
        let covisibles: Vec<KeyFrameId> = self
            .keyframes
            .get(&kf_id)
            .map(|kf| kf.covisibility().keys().copied().collect())
            .unwrap_or_default();
        for other in covisibles {
            if let Some(o) = self.keyframes.get_mut(&other) {
                o.erase_covisibility(kf_id);
            }
        }

        self.database.erase(kf_id);
        self.keyframes.remove(&kf_id);
        if self.last_keyframe_id == Some(kf_id) {
            self.last_keyframe_id = self.keyframes.keys().next_back().copied();
        }
        self.bump_version();
        true
    }

    /// Merges `old` into `new`: observations of `old` move to `new` unless the
    /// keyframe already observes `new`, then `old` is removed.
    pub fn replace_map_point(&mut self, old: MapPointId, new: MapPointId) -> bool {
        if old == new || !self.map_points.contains_key(&new) {
            return false;
        }
        let Some(old_mp) = self.map_points.get(&old) else {
            return false;
        };
        let observations: Vec<(KeyFrameId, usize)> = old_mp.observations.iter().map(|(&k, &i)| (k, i)).collect();
        let (visible, found) = (old_mp.visible_count, old_mp.found_count);

        for (kf_id, idx) in observations {
            self.disassociate(kf_id, idx);
            self.associate(kf_id, idx, new);
        }
        if let Some(mp) = self.map_points.get_mut(&new) {
            mp.increase_visible(visible);
            mp.increase_found(found);
        }
        self.map_points.remove(&old);
        self.update_map_point_geometry(new);
        self.bump_version();
        true
    }

    /// Recomputes a point's viewing normal, distance bounds and descriptor.
    pub fn update_map_point_geometry(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let mut centers = Vec::with_capacity(mp.observations.len());
        let mut descriptors = Vec::with_capacity(mp.observations.len());
        let mut reference = None;
        for (&kf_id, &idx) in &mp.observations {
            let Some(kf) = self.keyframes.get(&kf_id) else { continue };
            centers.push(kf.camera_center());
            if let Some(d) = kf.descriptors.get(idx) {
                descriptors.push(*d);
            }
            if kf_id == mp.reference_kf || reference.is_none() {
                let octave = kf.keypoints.get(idx).map_or(0, |k| k.octave);
                reference = Some((kf.camera_center(), octave));
            }
        }
        let Some(reference) = reference else {
            return;
        };
        let levels = self.levels.clone();
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.update_normal_and_depth(centers.iter(), reference, &levels);
            mp.update_descriptor(&descriptors);
        }
    }

    /// Drops everything, keeping the scale levels. Id counters keep running,
    /// so an id from before the clear never names a new entity.
    pub fn clear(&mut self) {
        let fresh = Self::new(self.levels.clone());
        *self = Self {
            next_kf_id: self.next_kf_id,
            next_mp_id: self.next_mp_id,
            version: self.version + 1,
            epoch: self.epoch + 1,
            ..fresh
        };
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .field("version", &self.version)
            .field("epoch", &self.epoch)
            .finish()
    }
}
