//! Exported view of the sparse map.

use nalgebra::Vector3;

use super::map::Map;
use super::types::{KeyFrameId, MapPointId};
use crate::geometry::SE3;

/// One point of a [`PointCloud`].
#[derive(Debug, Clone, PartialEq)]
pub struct CloudPoint {
    pub id: MapPointId,
    pub position: Vector3<f64>,
    pub color: [u8; 3],
    pub normal: Vector3<f64>,
    pub observations: usize,
}

/// A keyframe camera that contributed to the cloud.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudCamera {
    pub keyframe_id: KeyFrameId,
    pub timestamp: f64,
    pub pose_cw: SE3,
}

/// Map points ordered by id, plus the keyframe cameras that produced them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    pub points: Vec<CloudPoint>,
    pub cameras: Vec<CloudCamera>,
}

impl PointCloud {
    pub fn from_map(map: &Map) -> Self {
        let points = map
            .map_points()
            .map(|mp| CloudPoint {
                id: mp.id,
                position: mp.position,
                color: mp.color,
                normal: mp.normal,
                observations: mp.num_observations(),
            })
            .collect();
        let cameras = map
            .keyframes()
            .map(|kf| CloudCamera {
                keyframe_id: kf.id,
                timestamp: kf.timestamp,
                pose_cw: kf.pose_cw,
            })
            .collect();
        Self { points, cameras }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Axis-aligned bounds of the point positions.
    pub fn bounds(&self) -> Option<(Vector3<f64>, Vector3<f64>)> {
        let first = self.points.first()?.position;
        Some(self.points.iter().fold((first, first), |(lo, hi), p| {
            (lo.inf(&p.position), hi.sup(&p.position))
        }))
    }
}
