//! Tracking results and the map updates the tracker hands to the mapper.
//!
//! These types describe what happened during processing of a single frame:
//! - tracking state after the frame
//! - pose estimate (absent while initializing or lost)
//! - correspondence counts
//! - the recoverable condition hit on this frame, if any

use nalgebra::Vector3;

use super::initializer::InitialPoint;
use super::keyframe_decision::KeyFrameReason;
use super::state::TrackingState;
use crate::error::ReconError;
use crate::geometry::SE3;
use crate::map::{KeyFrameId, KeyFrameSource, MapPointId};

/// Summary of tracking for a single frame.
#[derive(Debug, Clone)]
pub struct TrackingResult {
    pub frame_id: u64,
    pub timestamp: f64,
    pub state: TrackingState,
    /// World-to-camera pose of the frame when it was tracked.
    pub pose_cw: Option<SE3>,
    pub reference_kf_id: Option<KeyFrameId>,
    pub metrics: TrackingMetrics,
    /// Whether this frame was sent to the mapper as a keyframe.
    pub keyframe_requested: bool,
    /// Non-fatal condition reported for this frame.
    pub event: Option<ReconError>,
}

impl TrackingResult {
    /// Camera position in the world.
    pub fn camera_center(&self) -> Option<Vector3<f64>> {
        self.pose_cw.as_ref().map(SE3::camera_center)
    }

    pub fn is_tracking(&self) -> bool {
        self.state.is_tracking() && self.pose_cw.is_some()
    }
}

/// Scalar metrics useful for debugging tracking quality.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrackingMetrics {
    pub n_features: usize,
    pub n_map_point_matches: usize,
    pub n_inliers: usize,
    pub inlier_ratio: f64,
    /// Effective weight of the inertial prior in the final pose refinement.
    pub prior_weight: f64,
}

/// Structural map change requested by the tracker.
#[derive(Debug, Clone)]
pub enum MapUpdate {
    /// Create the first two keyframes and their points.
    Initialize {
        reference: KeyFrameSource,
        current: KeyFrameSource,
        points: Vec<InitialPoint>,
    },
    /// Insert a tracked frame as a keyframe.
    InsertKeyFrame(KeyFrameRequest),
}

#[derive(Debug, Clone)]
pub struct KeyFrameRequest {
    /// Epoch of the map the frame was tracked against.
    pub base_epoch: u64,
    pub source: KeyFrameSource,
    /// `(feature index, map point)` associations of the frame.
    pub tracked: Vec<(usize, MapPointId)>,
    /// `(point, visible, found)` counts accumulated since the last request.
    pub point_stats: Vec<(MapPointId, u32, u32)>,
    pub reason: KeyFrameReason,
}

/// Everything the tracker produced for one frame.
#[derive(Debug, Clone)]
pub struct TrackingOutput {
    pub result: TrackingResult,
    pub update: Option<MapUpdate>,
}
