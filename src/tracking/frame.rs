//! Tracking frames.
//!
//! [`FrameInput`] is what the caller hands in. [`Frame`] is what the
//! tracker works on: undistorted features, a bag of words, a spatial grid
//! and the per-feature map point associations found while tracking.

use std::sync::Arc;

use nalgebra::Vector2;

use crate::features::{DepthImage, Descriptor, FeatureGrid, FeatureSet, GrayImage, KeyPoint};
use crate::geometry::{CameraModel, SE3};
use crate::imu::InertialInput;
use crate::map::{KeyFrameSource, MapPointId};
use crate::vocabulary::{BowVector, Vocabulary};

/// Grid cell size of the per-frame feature grid, in pixels.
const GRID_CELL_SIZE: f64 = 16.0;

/// One camera frame as supplied by the sensor layer.
#[derive(Debug, Clone)]
pub struct FrameInput {
    /// Seconds.
    pub timestamp: f64,
    pub image: GrayImage,
    pub depth: Option<DepthImage>,
    pub inertial: InertialInput,
}

impl FrameInput {
    pub fn new(timestamp: f64, image: GrayImage) -> Self {
        Self {
            timestamp,
            image,
            depth: None,
            inertial: InertialInput::None,
        }
    }

    pub fn with_depth(mut self, depth: DepthImage) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn with_inertial(mut self, inertial: InertialInput) -> Self {
        self.inertial = inertial;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u64,
    pub timestamp: f64,
    pub keypoints: Vec<KeyPoint>,
    /// Undistorted keypoint positions.
    pub points: Vec<Vector2<f64>>,
    pub descriptors: Vec<Descriptor>,
    pub bow: BowVector,
    pub pose_cw: Option<SE3>,
    /// Map point matched to each feature.
    pub map_points: Vec<Option<MapPointId>>,
    grid: FeatureGrid,
    pub image: Arc<GrayImage>,
    pub depth: Option<Arc<DepthImage>>,
}

impl Frame {
    pub fn new(
        id: u64,
        timestamp: f64,
        features: FeatureSet,
        camera: &CameraModel,
        vocabulary: &Vocabulary,
        image: Arc<GrayImage>,
        depth: Option<Arc<DepthImage>>,
    ) -> Self {
        let points: Vec<Vector2<f64>> = features.keypoints.iter().map(|kp| camera.undistort(&kp.pt)).collect();
        let grid = FeatureGrid::new(&points, camera.width, camera.height, GRID_CELL_SIZE);
        let bow = vocabulary.transform(&features.descriptors);
        let n = features.keypoints.len();
        Self {
            id,
            timestamp,
            keypoints: features.keypoints,
            points,
            descriptors: features.descriptors,
            bow,
            pose_cw: None,
            map_points: vec![None; n],
            grid,
            image,
            depth,
        }
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    /// Features within `radius` of an undistorted position, optionally
    /// restricted to an octave range.
    pub fn features_in_area(&self, center: &Vector2<f64>, radius: f64, octaves: Option<(usize, usize)>) -> Vec<usize> {
        let mut found = self.grid.radius_search(center, radius);
        if let Some((lo, hi)) = octaves {
            found.retain(|&i| (lo..=hi).contains(&self.keypoints[i].octave));
        }
        found
    }

    pub fn clear_matches(&mut self) {
        self.map_points.iter_mut().for_each(|m| *m = None);
    }

    /// `(feature index, map point)` for every matched feature.
    pub fn tracked(&self) -> Vec<(usize, MapPointId)> {
        self.map_points
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.map(|id| (i, id)))
            .collect()
    }

    pub fn num_tracked(&self) -> usize {
        self.map_points.iter().filter(|m| m.is_some()).count()
    }

    /// Keyframe contents for this frame at `pose_cw`.
    pub fn to_keyframe_source(&self, pose_cw: SE3) -> KeyFrameSource {
        KeyFrameSource {
            frame_id: self.id,
            timestamp: self.timestamp,
            pose_cw,
            keypoints: self.keypoints.clone(),
            points: self.points.clone(),
            descriptors: self.descriptors.clone(),
            bow: self.bow.clone(),
            image: Some(Arc::clone(&self.image)),
            depth: self.depth.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocabulary::VocabularyConfig;

    fn features(points: &[(f64, f64)]) -> FeatureSet {
        FeatureSet {
            keypoints: points
                .iter()
                .map(|&(x, y)| KeyPoint {
                    pt: Vector2::new(x, y),
                    octave: if x > 100.0 { 2 } else { 0 },
                    scale: 1.0,
                    angle: 0.0,
                    response: 1.0,
                })
                .collect(),
            descriptors: (0..points.len()).map(|i| [i as u8; 32]).collect(),
        }
    }

    #[test]
    fn test_frame_queries() {
        let camera = CameraModel::pinhole(300.0, 300.0, 160.0, 120.0, 320, 240);
        let vocabulary = Vocabulary::new(&VocabularyConfig::default());
        let mut frame = Frame::new(
            3,
            0.5,
            features(&[(10.0, 10.0), (14.0, 12.0), (120.0, 12.0)]),
            &camera,
            &vocabulary,
            Arc::new(GrayImage::filled(320, 240, 0)),
            None,
        );
        assert_eq!(frame.num_features(), 3);
        assert_eq!(frame.features_in_area(&Vector2::new(12.0, 11.0), 5.0, None), vec![0, 1]);
        assert!(frame.features_in_area(&Vector2::new(120.0, 12.0), 2.0, Some((0, 1))).is_empty());
        assert!(!frame.bow.is_empty());

        frame.map_points[1] = Some(MapPointId::new(7));
        assert_eq!(frame.tracked(), vec![(1, MapPointId::new(7))]);
        let source = frame.to_keyframe_source(SE3::identity());
        assert_eq!(source.frame_id, 3);
        assert_eq!(source.points.len(), 3);
        frame.clear_matches();
        assert_eq!(frame.num_tracked(), 0);
    }
}
