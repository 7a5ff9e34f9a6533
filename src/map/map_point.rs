//! MapPoint: a triangulated 3D landmark and its observations.

use std::collections::BTreeMap;
use std::fmt;

use nalgebra::Vector3;

use super::types::{KeyFrameId, MapPointId};
use crate::features::{hamming_distance, Descriptor, ScaleLevels};

#[derive(Clone)]
pub struct MapPoint {
    pub id: MapPointId,
    /// Position in the world frame.
    pub position: Vector3<f64>,
    /// Gray level sampled from the creating keyframe, replicated to RGB.
    pub color: [u8; 3],
    /// Representative descriptor: the one with the least median distance to
    /// the other observations.
    pub descriptor: Descriptor,
    /// Observing keyframe → feature index in that keyframe.
    pub observations: BTreeMap<KeyFrameId, usize>,
    /// Mean unit viewing direction (world frame).
    pub normal: Vector3<f64>,
    /// Scale-invariance distance bounds.
    pub min_distance: f64,
    pub max_distance: f64,
    /// Frames in which the point was inside the frustum / actually matched.
    pub visible_count: u32,
    pub found_count: u32,
    pub reference_kf: KeyFrameId,
    /// Value of the map's keyframe counter when the point was created.
    pub created_at: u64,
}

impl MapPoint {
    pub fn new(id: MapPointId, position: Vector3<f64>, descriptor: Descriptor, reference_kf: KeyFrameId, created_at: u64) -> Self {
        Self {
            id,
            position,
            color: [128; 3],
            descriptor,
            observations: BTreeMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible_count: 1,
            found_count: 1,
            reference_kf,
            created_at,
        }
    }

    pub(super) fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    pub(super) fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn is_observed_by(&self, kf_id: KeyFrameId) -> bool {
        self.observations.contains_key(&kf_id)
    }

    /// found / visible; 1.0 before the point was ever predicted visible.
    pub fn found_ratio(&self) -> f64 {
        if self.visible_count == 0 {
            1.0
        } else {
            self.found_count as f64 / self.visible_count as f64
        }
    }

    pub fn increase_visible(&mut self, n: u32) {
        self.visible_count += n;
    }

    pub fn increase_found(&mut self, n: u32) {
        self.found_count += n;
    }

    /// Recomputes the mean viewing direction and the distance bounds.
    ///
    /// `reference` is the camera center of the reference keyframe and the
    /// octave at which it observes the point.
    pub fn update_normal_and_depth<'a>(
        &mut self,
        observer_centers: impl Iterator<Item = &'a Vector3<f64>>,
        reference: (Vector3<f64>, usize),
        levels: &ScaleLevels,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut n = 0;
        for center in observer_centers {
            let dir = self.position - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
                n += 1;
            }
        }
        if n > 0 && normal_sum.norm() > 1e-10 {
            self.normal = normal_sum.normalize();
        }

        let (ref_center, octave) = reference;
        let dist = (self.position - ref_center).norm();
        let level_factor = levels.factor(octave);
        let last_factor = levels.factor(levels.num_levels() - 1);
        self.max_distance = dist * level_factor;
        self.min_distance = self.max_distance / last_factor;
    }

    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= 0.8 * self.min_distance && distance <= 1.2 * self.max_distance
    }

    /// Pyramid level at which the point is expected to be detected from `distance`.
    pub fn predict_octave(&self, distance: f64, levels: &ScaleLevels) -> usize {
        if distance <= 0.0 || !self.max_distance.is_finite() {
            return 0;
        }
        let ratio = self.max_distance / distance;
        let log_scale = levels.factor(1).max(1.0 + 1e-9).ln();
        let octave = (ratio.ln() / log_scale).ceil();
        octave.clamp(0.0, (levels.num_levels() - 1) as f64) as usize
    }

    /// Picks the observation descriptor with the least median distance to the others.
    pub fn update_descriptor(&mut self, descriptors: &[Descriptor]) {
        if descriptors.is_empty() {
            return;
        }
        let mut best = (u32::MAX, 0);
        for (i, a) in descriptors.iter().enumerate() {
            let mut dists: Vec<u32> = descriptors.iter().map(|b| hamming_distance(a, b)).collect();
            dists.sort_unstable();
            let median = dists[(dists.len() - 1) / 2];
            if median < best.0 {
                best = (median, i);
            }
        }
        self.descriptor = descriptors[best.1];
    }
}

impl fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("visible_count", &self.visible_count)
            .field("found_count", &self.found_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_point() -> MapPoint {
        MapPoint::new(MapPointId::new(1), Vector3::new(0.0, 0.0, 4.0), [0; 32], KeyFrameId::new(0), 0)
    }

    #[test]
    fn test_add_remove_observation() {
        let mut mp = test_point();
        mp.add_observation(KeyFrameId::new(1), 5);
        mp.add_observation(KeyFrameId::new(2), 10);
        assert_eq!(mp.num_observations(), 2);
        assert_eq!(mp.observations.get(&KeyFrameId::new(1)), Some(&5));
        assert!(mp.erase_observation(KeyFrameId::new(1)));
        assert!(!mp.erase_observation(KeyFrameId::new(1)));
    }

    #[test]
    fn test_found_ratio() {
        let mut mp = test_point();
        mp.increase_visible(2);
        mp.increase_found(1);
        assert!((mp.found_ratio() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_normal_and_depth() {
        let levels = ScaleLevels::new(4, 1.2);
        let mut mp = test_point();
        let centers = [Vector3::new(0.0, 0.0, 0.0), Vector3::new(0.0, 0.0, 0.0)];
        mp.update_normal_and_depth(centers.iter(), (Vector3::zeros(), 0), &levels);
        assert!((mp.normal - Vector3::z()).norm() < 1e-12);
        assert!((mp.max_distance - 4.0).abs() < 1e-12);
        assert!((mp.min_distance - 4.0 / 1.728).abs() < 1e-9);
        assert_eq!(mp.predict_octave(4.0, &levels), 0);
        assert_eq!(mp.predict_octave(4.0 / 1.3, &levels), 2);
        assert!(mp.is_in_distance_range(3.0));
        assert!(!mp.is_in_distance_range(10.0));
    }

    #[test]
    fn test_descriptor_is_medoid() {
        let mut mp = test_point();
        let a = [0u8; 32];
        let mut b = a;
        b[0] = 0b1;
        let mut c = a;
        c[1] = 0xff;
        mp.update_descriptor(&[c, b, a]);
        assert!(mp.descriptor == a || mp.descriptor == b);
    }
}
