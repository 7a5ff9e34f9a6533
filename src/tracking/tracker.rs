//! Main tracker: orchestrates frame processing and pose estimation.
//!
//! - Extracts features and rejects unusable frames
//! - Bootstraps the map from two views
//! - Tracks map points by projection from a predicted pose (inertial prior
//!   or constant velocity), then refines against the local map
//! - Relocalizes against the keyframe database after loss
//! - Requests keyframes through [`MapUpdate`] values
//!
//! The tracker reads the map but never writes it. Structural changes leave
//! as [`MapUpdate`]s that the caller applies under the writer lock, so the
//! real-time path only needs a snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::frame::{Frame, FrameInput};
use super::initializer::Initializer;
use super::keyframe_decision::{KeyFrameContext, KeyFrameDecision};
use super::local_map::{frame_observations, search_by_projection, LocalMap, ProjectionSearchParams};
use super::motion_model::MotionModel;
use super::pose_optimizer::{MotionPrior, PoseOptimizer};
use super::relocalizer::{drop_outliers, Relocalizer};
use super::result::{KeyFrameRequest, MapUpdate, TrackingMetrics, TrackingOutput, TrackingResult};
use super::state::{TrackingEvent, TrackingState};
use crate::config::SystemConfig;
use crate::error::{FrameError, InitializationError, ReconError, TrackingError};
use crate::features::{FeatureExtractor, FeatureMatcher};
use crate::geometry::linalg::median;
use crate::geometry::{CameraModel, SE3};
use crate::imu::{preintegrate, ImuConfig, InertialInput, InertialPrior};
use crate::map::{KeyFrameId, Map, MapPointId};
use crate::vocabulary::Vocabulary;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Frames with fewer features are unusable.
    pub min_features: usize,
    /// Inliers needed after pose optimization to keep tracking.
    pub min_inliers: usize,
    /// Inliers needed as a fraction of the attempted matches.
    pub min_inlier_ratio: f64,
    /// Failed relocalization attempts before tracking is permanently lost.
    pub max_relocalization_attempts: u32,
    /// Projection search from the predicted pose.
    pub search: ProjectionSearchParams,
    /// Search radius of the second projection pass, from the refined pose.
    pub refine_radius: f64,
    /// Keyframes in the local map.
    pub local_keyframes: usize,
    /// Trust in priors integrated from raw IMU samples, in [0, 1].
    pub inertial_prior_weight: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            min_features: 50,
            min_inliers: 15,
            min_inlier_ratio: 0.1,
            max_relocalization_attempts: 5,
            search: ProjectionSearchParams::default(),
            refine_radius: 4.0,
            local_keyframes: 10,
            inertial_prior_weight: 0.5,
        }
    }
}

/// Main tracking structure.
pub struct Tracker {
    camera: CameraModel,
    config: TrackingConfig,
    imu: ImuConfig,
    extractor: FeatureExtractor,
    vocabulary: Arc<Vocabulary>,
    matcher: FeatureMatcher,
    initializer: Initializer,
    optimizer: PoseOptimizer,
    relocalizer: Relocalizer,
    motion_model: MotionModel,

    /// Keyframe creation decision logic.
    kf_decision: KeyFrameDecision,
    /// Flow control: cleared while a map correction is in flight.
    keyframes_enabled: bool,

    /// Tracking state machine.
    state: TrackingState,
    /// Running frame counter.
    frame_count: u64,
    /// First frame of a pending initialization.
    init_reference: Option<Frame>,

    /// Reference keyframe used for tracking.
    reference_kf: Option<KeyFrameId>,
    /// Pose and time of the last requested keyframe.
    last_kf: Option<(SE3, f64)>,
    last_timestamp: Option<f64>,
    /// World-frame velocity, used to integrate IMU samples.
    velocity_w: Vector3<f64>,
    /// `(visible, found)` per map point since the last keyframe request.
    point_stats: BTreeMap<MapPointId, (u32, u32)>,
}

impl Tracker {
    pub fn new(camera: CameraModel, config: &SystemConfig, vocabulary: Arc<Vocabulary>) -> Self {
        Self {
            camera,
            config: config.tracking,
            imu: config.imu,
            extractor: FeatureExtractor::new(config.features),
            vocabulary,
            matcher: FeatureMatcher::new(config.matcher),
            initializer: Initializer::new(config.initializer, config.matcher),
            optimizer: PoseOptimizer::new(camera, config.pose_optimizer),
            relocalizer: Relocalizer::new(camera, config.relocalization, config.tracking.search),
            motion_model: MotionModel::new(),
            kf_decision: KeyFrameDecision::new(config.keyframes),
            keyframes_enabled: true,
            state: TrackingState::Initializing,
            frame_count: 0,
            init_reference: None,
            reference_kf: None,
            last_kf: None,
            last_timestamp: None,
            velocity_w: Vector3::zeros(),
            point_stats: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn reference_keyframe(&self) -> Option<KeyFrameId> {
        self.reference_kf
    }

    /// Last tracked world-to-camera pose.
    pub fn last_pose(&self) -> Option<SE3> {
        self.motion_model.last_pose().copied()
    }

    /// Suspends or resumes keyframe requests.
    pub fn set_keyframe_creation(&mut self, enabled: bool) {
        self.keyframes_enabled = enabled;
    }

    /// Back to `Initializing` with no memory of the old map.
    pub fn reset(&mut self) {
        self.apply(TrackingEvent::Reset);
        self.init_reference = None;
        self.reference_kf = None;
        self.last_kf = None;
        self.last_timestamp = None;
        self.velocity_w = Vector3::zeros();
        self.point_stats.clear();
        self.motion_model.reset();
        self.kf_decision.reset();
    }

    /// Process one frame against a snapshot of the map.
    pub fn process_frame(&mut self, input: FrameInput, map: &Map) -> TrackingOutput {
        let frame_id = self.frame_count;
        self.frame_count += 1;
        let timestamp = input.timestamp;

        if let TrackingState::PermanentlyLost { attempts } = self.state {
            debug!("[Tracking] frame {} ignored: permanently lost", frame_id);
            let event = TrackingError::PermanentlyLost { attempts }.into();
            return self.report(frame_id, timestamp, None, TrackingMetrics::default(), Some(event), None);
        }

        let prior = self.inertial_prior(&input.inertial);
        let frame = match self.prepare_frame(frame_id, input) {
            Ok(frame) => frame,
            Err(err) => return self.unusable_frame(frame_id, timestamp, err),
        };

        match self.state {
            TrackingState::Initializing => self.initialize(frame, prior, map),
            TrackingState::Tracking => self.track(frame, prior, map),
            _ => self.relocalize(frame, map),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Frame preparation
    // ─────────────────────────────────────────────────────────────────────────

    fn prepare_frame(&self, frame_id: u64, input: FrameInput) -> Result<Frame, FrameError> {
        self.extractor.check_usable(&input.image)?;
        let features = self.extractor.extract(&input.image);
        if features.len() < self.config.min_features {
            return Err(FrameError::TooFewFeatures {
                found: features.len(),
                required: self.config.min_features,
            });
        }
        Ok(Frame::new(
            frame_id,
            input.timestamp,
            features,
            &self.camera,
            &self.vocabulary,
            Arc::new(input.image),
            input.depth.map(Arc::new),
        ))
    }

    /// Relative motion prediction from the frame's inertial data.
    fn inertial_prior(&self, inertial: &InertialInput) -> Option<InertialPrior> {
        match inertial {
            InertialInput::None => None,
            InertialInput::Prior(prior) => Some(*prior),
            InertialInput::Samples(samples) => {
                let start = self.motion_model.last_pose()?;
                if samples.len() < 2 {
                    return None;
                }
                let state = preintegrate(samples, &self.imu.bias);
                Some(state.to_prior(start, &self.velocity_w, &self.imu.gravity, self.config.inertial_prior_weight))
            }
        }
    }

    /// Skips the frame. A tracked sequence counts it as lost; relocalization
    /// starts on the next usable frame.
    fn unusable_frame(&mut self, frame_id: u64, timestamp: f64, err: FrameError) -> TrackingOutput {
        debug!("[Tracking] frame {} unusable: {}", frame_id, err);
        if self.state.is_tracking() {
            warn!("[Tracking] lost at frame {}: {}", frame_id, err);
            self.apply(TrackingEvent::TrackingLost);
        }
        self.report(frame_id, timestamp, None, TrackingMetrics::default(), Some(err.into()), None)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────────────

    fn initialize(&mut self, frame: Frame, prior: Option<InertialPrior>, map: &Map) -> TrackingOutput {
        let metrics = TrackingMetrics {
            n_features: frame.num_features(),
            ..Default::default()
        };
        if !map.is_empty() {
            warn!("[Init] map is not empty, waiting for a reset");
            self.init_reference = None;
            let event = InitializationError::MapNotEmpty {
                keyframes: map.num_keyframes(),
            }
            .into();
            return self.report(frame.id, frame.timestamp, None, metrics, Some(event), None);
        }
        let Some(reference) = self.init_reference.as_ref() else {
            debug!("[Init] frame {} stored as reference", frame.id);
            let (frame_id, timestamp) = (frame.id, frame.timestamp);
            self.init_reference = Some(frame);
            let event = InitializationError::AwaitingSecondFrame.into();
            return self.report(frame_id, timestamp, None, metrics, Some(event), None);
        };

        match self.initializer.initialize(reference, &frame, &self.camera, prior.as_ref()) {
            Err(err) => {
                let age = frame.id.saturating_sub(reference.id);
                let replace = matches!(err, InitializationError::TooFewMatches { .. })
                    || age >= self.initializer.config().max_reference_age;
                debug!("[Init] frame {} failed: {} (replace reference: {})", frame.id, err, replace);
                let (frame_id, timestamp) = (frame.id, frame.timestamp);
                if replace {
                    self.init_reference = Some(frame);
                }
                self.report(frame_id, timestamp, None, metrics, Some(err.into()), None)
            }
            Ok(init) => {
                let Some(reference) = self.init_reference.take() else {
                    return self.report(frame.id, frame.timestamp, None, metrics, None, None);
                };
                let reference_pose = SE3::identity();
                if frame.id == reference.id + 1 {
                    self.motion_model.update(&reference_pose);
                    self.motion_model.update(&init.pose_cw);
                } else {
                    self.motion_model.anchor(&init.pose_cw);
                }
                let dt = frame.timestamp - reference.timestamp;
                self.velocity_w = if dt > 0.0 {
                    init.pose_cw.camera_center() / dt
                } else {
                    Vector3::zeros()
                };
                self.last_timestamp = Some(frame.timestamp);
                self.last_kf = Some((init.pose_cw, frame.timestamp));
                self.reference_kf = None;
                self.point_stats.clear();
                self.kf_decision.reset();
                self.apply(TrackingEvent::Initialized);

                let metrics = TrackingMetrics {
                    n_map_point_matches: init.points.len(),
                    n_inliers: init.points.len(),
                    inlier_ratio: 1.0,
                    ..metrics
                };
                let update = MapUpdate::Initialize {
                    reference: reference.to_keyframe_source(reference_pose),
                    current: frame.to_keyframe_source(init.pose_cw),
                    points: init.points,
                };
                let mut out = self.report(frame.id, frame.timestamp, Some(init.pose_cw), metrics, None, Some(update));
                out.result.keyframe_requested = true;
                out
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tracking
    // ─────────────────────────────────────────────────────────────────────────

    fn track(&mut self, mut frame: Frame, prior: Option<InertialPrior>, map: &Map) -> TrackingOutput {
        let mut metrics = TrackingMetrics {
            n_features: frame.num_features(),
            ..Default::default()
        };
        let reference = self
            .reference_kf
            .filter(|id| map.keyframe(*id).is_some())
            .or_else(|| map.last_keyframe_id());
        let (Some(last_pose), Some(reference)) = (self.motion_model.last_pose().copied(), reference) else {
            return self.lose_tracking(&frame, metrics, 0, 0);
        };

        let predicted = match &prior {
            Some(p) => p.predict(&last_pose),
            None => self.motion_model.predict().unwrap_or(last_pose),
        };
        let motion_prior = prior.map(|p| MotionPrior {
            predicted_cw: predicted,
            weight: p.weight,
        });

        let local = LocalMap::build(map, reference, self.config.local_keyframes);

        // Wide search from the prediction, reference keyframe as fallback.
        search_by_projection(&mut frame, map, &local.points, &predicted, &self.camera, &self.config.search);
        if frame.num_tracked() < self.config.min_inliers {
            let found = self.match_reference_keyframe(&mut frame, map, reference);
            debug!("[Tracking] projection search weak, {} matches by descriptor", found);
        }
        let (observations, pairs) = frame_observations(&frame, map);
        let coarse = self.optimizer.optimize(&predicted, &observations, motion_prior.as_ref());
        drop_outliers(&mut frame, &pairs, &coarse.inliers);

        // Track the local map from the refined pose.
        let params = ProjectionSearchParams {
            radius: self.config.refine_radius,
            ..self.config.search
        };
        let search = search_by_projection(&mut frame, map, &local.points, &coarse.pose_cw, &self.camera, &params);
        let (observations, pairs) = frame_observations(&frame, map);
        let estimate = self.optimizer.optimize(&coarse.pose_cw, &observations, motion_prior.as_ref());
        drop_outliers(&mut frame, &pairs, &estimate.inliers);

        let attempted = observations.len();
        metrics.n_map_point_matches = attempted;
        metrics.n_inliers = estimate.num_inliers;
        metrics.inlier_ratio = if attempted > 0 {
            estimate.num_inliers as f64 / attempted as f64
        } else {
            0.0
        };
        metrics.prior_weight = estimate.prior_weight;

        let enough = estimate.num_inliers >= self.config.min_inliers
            && metrics.inlier_ratio >= self.config.min_inlier_ratio;
        if !enough {
            return self.lose_tracking(&frame, metrics, estimate.num_inliers, attempted);
        }

        let pose = estimate.pose_cw;
        frame.pose_cw = Some(pose);
        if let Some(last_ts) = self.last_timestamp {
            let dt = frame.timestamp - last_ts;
            if dt > 0.0 {
                self.velocity_w = (pose.camera_center() - last_pose.camera_center()) / dt;
            }
        }
        self.last_timestamp = Some(frame.timestamp);
        self.motion_model.update(&pose);

        let tracked = frame.tracked();
        for mp_id in search.visible.iter().copied().chain(tracked.iter().map(|(_, id)| *id)) {
            self.point_stats.entry(mp_id).or_default().0 += 1;
        }
        for (_, mp_id) in &tracked {
            self.point_stats.entry(*mp_id).or_default().1 += 1;
        }
        self.reference_kf = Some(best_reference(map, &tracked).unwrap_or(reference));

        debug!(
            "[Tracking] frame {}: {} inliers / {} matches, ref {}",
            frame.id, estimate.num_inliers, attempted, reference
        );
        let update = self.keyframe_request(&frame, pose, map);
        let keyframe_requested = update.is_some();
        let mut out = self.report(frame.id, frame.timestamp, Some(pose), metrics, None, update);
        out.result.keyframe_requested = keyframe_requested;
        out
    }

    /// Descriptor matching against the reference keyframe's map points.
    fn match_reference_keyframe(&self, frame: &mut Frame, map: &Map, kf_id: KeyFrameId) -> usize {
        let Some(kf) = map.keyframe(kf_id) else {
            return 0;
        };
        let indexed: Vec<(usize, MapPointId)> = kf.map_point_indices().collect();
        let descriptors: Vec<_> = indexed.iter().map(|(i, _)| kf.descriptors[*i]).collect();
        let already: Vec<MapPointId> = frame.map_points.iter().flatten().copied().collect();
        let mut found = 0;
        for m in self.matcher.match_descriptors(&frame.descriptors, &descriptors) {
            let mp_id = indexed[m.train_idx].1;
            if frame.map_points[m.query_idx].is_none() && !already.contains(&mp_id) {
                frame.map_points[m.query_idx] = Some(mp_id);
                found += 1;
            }
        }
        found
    }

    fn keyframe_request(&mut self, frame: &Frame, pose: SE3, map: &Map) -> Option<MapUpdate> {
        if !self.keyframes_enabled {
            return None;
        }
        let (last_pose, last_time) = self.last_kf?;
        let mut depths: Vec<f64> = frame
            .tracked()
            .iter()
            .filter_map(|(_, id)| map.map_point(*id))
            .map(|mp| pose.transform_point(&mp.position).z)
            .filter(|z| *z > 0.0)
            .collect();
        let ctx = KeyFrameContext {
            relative: pose.compose(&last_pose.inverse()),
            median_depth: median(&mut depths).unwrap_or(0.0),
            elapsed: frame.timestamp - last_time,
            tracked: frame.num_tracked(),
            reference_points: self
                .reference_kf
                .and_then(|id| map.keyframe(id))
                .map_or(0, |kf| kf.num_map_points()),
        };
        let reason = self.kf_decision.evaluate(&ctx)?;
        debug!("[Tracking] keyframe requested at frame {} ({:?})", frame.id, reason);

        self.last_kf = Some((pose, frame.timestamp));
        let point_stats = std::mem::take(&mut self.point_stats)
            .into_iter()
            .map(|(id, (visible, found))| (id, visible, found))
            .collect();
        Some(MapUpdate::InsertKeyFrame(KeyFrameRequest {
            base_epoch: map.epoch(),
            source: frame.to_keyframe_source(pose),
            tracked: frame.tracked(),
            point_stats,
            reason,
        }))
    }

    fn lose_tracking(&mut self, frame: &Frame, metrics: TrackingMetrics, inliers: usize, attempted: usize) -> TrackingOutput {
        warn!(
            "[Tracking] lost at frame {}: {} inliers / {} matches",
            frame.id, inliers, attempted
        );
        self.apply(TrackingEvent::TrackingLost);
        let event = TrackingError::Lost { inliers, attempted }.into();
        self.report(frame.id, frame.timestamp, None, metrics, Some(event), None)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Relocalization
    // ─────────────────────────────────────────────────────────────────────────

    fn relocalize(&mut self, mut frame: Frame, map: &Map) -> TrackingOutput {
        self.apply(TrackingEvent::RelocalizationStarted);
        let attempt = match self.state {
            TrackingState::Relocalizing { attempt } => attempt,
            _ => 0,
        };
        let mut metrics = TrackingMetrics {
            n_features: frame.num_features(),
            ..Default::default()
        };

        match self.relocalizer.relocalize(&mut frame, map, &self.matcher, &self.optimizer) {
            Some(reloc) => {
                info!(
                    "[Reloc] frame {} relocalized against {} ({} inliers, attempt {})",
                    frame.id, reloc.keyframe_id, reloc.num_inliers, attempt
                );
                self.apply(TrackingEvent::Relocalized);
                self.motion_model.anchor(&reloc.pose_cw);
                self.velocity_w = Vector3::zeros();
                self.last_timestamp = Some(frame.timestamp);
                self.last_kf = Some((reloc.pose_cw, frame.timestamp));
                self.reference_kf = Some(reloc.keyframe_id);
                self.kf_decision.reset();
                metrics.n_map_point_matches = frame.num_tracked();
                metrics.n_inliers = reloc.num_inliers;
                metrics.inlier_ratio = 1.0;
                self.report(frame.id, frame.timestamp, Some(reloc.pose_cw), metrics, None, None)
            }
            None => {
                let max_attempts = self.config.max_relocalization_attempts;
                self.apply(TrackingEvent::RelocalizationFailed { max_attempts });
                let event = match self.state {
                    TrackingState::PermanentlyLost { attempts } => {
                        warn!("[Reloc] giving up after {} attempts; reset required", attempts);
                        TrackingError::PermanentlyLost { attempts }
                    }
                    _ => {
                        debug!("[Reloc] attempt {}/{} failed", attempt, max_attempts);
                        TrackingError::RelocalizationFailed { attempt, max_attempts }
                    }
                };
                self.report(frame.id, frame.timestamp, None, metrics, Some(event.into()), None)
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn apply(&mut self, event: TrackingEvent) {
        match self.state.transition(event) {
            Ok(next) => {
                if next != self.state {
                    info!("[Tracking] {} -> {} ({})", self.state, next, event.name());
                }
                self.state = next;
            }
            Err(err) => warn!("[Tracking] {}", err),
        }
    }

    fn report(
        &self,
        frame_id: u64,
        timestamp: f64,
        pose_cw: Option<SE3>,
        metrics: TrackingMetrics,
        event: Option<ReconError>,
        update: Option<MapUpdate>,
    ) -> TrackingOutput {
        TrackingOutput {
            result: TrackingResult {
                frame_id,
                timestamp,
                state: self.state,
                pose_cw,
                reference_kf_id: self.reference_kf,
                metrics,
                keyframe_requested: false,
                event,
            },
            update,
        }
    }
}

/// Keyframe observing most of the tracked points.
fn best_reference(map: &Map, tracked: &[(usize, MapPointId)]) -> Option<KeyFrameId> {
    let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
    for (_, mp_id) in tracked {
        if let Some(mp) = map.map_point(*mp_id) {
            for kf_id in mp.observations.keys() {
                *counter.entry(*kf_id).or_insert(0) += 1;
            }
        }
    }
    counter
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(id, _)| id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{GrayImage, ScaleLevels};
    use crate::io::{linear_trajectory, PlanarScene, SceneConfig, SyntheticSequence};
    use crate::map::MapManager;
    use approx::assert_relative_eq;

    fn setup() -> (Tracker, SyntheticSequence, MapManager) {
        let config = SystemConfig {
            camera: CameraModel::pinhole(300.0, 300.0, 160.0, 120.0, 320, 240),
            ..SystemConfig::default()
        };
        let vocabulary = Arc::new(Vocabulary::new(&config.vocabulary));
        let tracker = Tracker::new(config.camera, &config, vocabulary);
        let scene = PlanarScene::new(config.camera, SceneConfig::default());
        let sequence = SyntheticSequence::new(scene, linear_trajectory(5, 0.05));
        let manager = MapManager::new(config.camera, config.mapping, config.matcher);
        (tracker, sequence, manager)
    }

    fn empty_map() -> Map {
        let features = crate::features::FeatureConfig::default();
        Map::new(ScaleLevels::new(features.n_levels, features.scale_factor))
    }

    /// Applies an initialization update the way the system does.
    fn apply(update: Option<MapUpdate>, manager: &MapManager, map: &mut Map) {
        if let Some(MapUpdate::Initialize {
            reference,
            current,
            points,
        }) = update
        {
            let points: Vec<_> = points
                .iter()
                .map(|p| (p.reference_idx, p.current_idx, p.position))
                .collect();
            manager.initialize_map(map, reference, current, &points);
        }
    }

    #[test]
    fn test_flat_frame_is_reported_and_skipped() {
        let (mut tracker, _, _) = setup();
        let out = tracker.process_frame(FrameInput::new(0.0, GrayImage::filled(320, 240, 90)), &empty_map());
        assert!(matches!(out.result.event, Some(ReconError::Frame(_))));
        assert_eq!(out.result.state, TrackingState::Initializing);
        assert!(out.update.is_none());
        assert_eq!(tracker.frame_count(), 1);
    }

    #[test]
    fn test_first_frame_becomes_reference() {
        let (mut tracker, sequence, _) = setup();
        let out = tracker.process_frame(sequence.frame(0).unwrap(), &empty_map());
        assert_eq!(
            out.result.event,
            Some(ReconError::Initialization(InitializationError::AwaitingSecondFrame))
        );
        assert!(out.result.pose_cw.is_none());
    }

    #[test]
    fn test_initializes_then_tracks() {
        let (mut tracker, sequence, manager) = setup();
        let mut map = empty_map();
        tracker.process_frame(sequence.frame(0).unwrap(), &map);

        // Without a prior the baseline is fixed by the median scene depth,
        // which is the true depth of the plane.
        let out = tracker.process_frame(sequence.frame(2).unwrap(), &map);
        assert_eq!(out.result.state, TrackingState::Tracking);
        assert!(out.result.keyframe_requested);
        let center = out.result.camera_center().unwrap();
        assert_relative_eq!(center.norm(), 0.1, epsilon = 5e-3);
        assert!(center.x > 0.09);
        apply(out.update, &manager, &mut map);
        assert_eq!(map.num_keyframes(), 2);

        let out = tracker.process_frame(sequence.frame(4).unwrap(), &map);
        assert!(out.result.is_tracking(), "{:?}", out.result.event);
        assert!(out.result.metrics.n_inliers >= 15);
        let truth = sequence.poses[4].camera_center();
        assert!((out.result.camera_center().unwrap() - truth).norm() < 0.01);
    }

    #[test]
    fn test_loss_and_reset() {
        let (mut tracker, sequence, manager) = setup();
        let mut map = empty_map();
        tracker.process_frame(sequence.frame(0).unwrap(), &map);
        let out = tracker.process_frame(sequence.frame(2).unwrap(), &map);
        apply(out.update, &manager, &mut map);

        let out = tracker.process_frame(FrameInput::new(1.0, GrayImage::filled(320, 240, 90)), &map);
        assert_eq!(out.result.state, TrackingState::Lost { failed_attempts: 0 });
        assert!(out.result.pose_cw.is_none());

        tracker.reset();
        assert_eq!(tracker.state(), TrackingState::Initializing);
        assert!(tracker.last_pose().is_none());
        assert!(tracker.reference_keyframe().is_none());
    }

    #[test]
    fn test_initialization_waits_for_cleared_map() {
        let (mut tracker, sequence, manager) = setup();
        let mut map = empty_map();
        tracker.process_frame(sequence.frame(0).unwrap(), &map);
        let out = tracker.process_frame(sequence.frame(2).unwrap(), &map);
        apply(out.update, &manager, &mut map);
        tracker.reset();

        for i in [3, 4] {
            let out = tracker.process_frame(sequence.frame(i).unwrap(), &map);
            assert_eq!(
                out.result.event,
                Some(ReconError::Initialization(InitializationError::MapNotEmpty { keyframes: 2 }))
            );
            assert!(out.update.is_none());
        }
        assert_eq!(map.num_keyframes(), 2);

        map.clear();
        let out = tracker.process_frame(sequence.frame(0).unwrap(), &map);
        assert_eq!(
            out.result.event,
            Some(ReconError::Initialization(InitializationError::AwaitingSecondFrame))
        );
    }
}
