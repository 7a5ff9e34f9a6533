//! Bundle adjustment results only land on the map they were computed for.

use std::sync::Arc;

use crossbeam_channel::unbounded;
use nalgebra::{UnitQuaternion, Vector3};

use rust_recon::features::{KeyPoint, MatcherConfig, ScaleLevels};
use rust_recon::geometry::{CameraModel, SE3};
use rust_recon::map::{KeyFrameId, KeyFrameSource, MapCorrection, MapManager, MapManagerConfig, MapPointId};
use rust_recon::optimizer::OptimizationOutcome;
use rust_recon::system::{
    BundleAdjustmentKind, BundleAdjustmentRequest, BundleAdjustmentResult, MappingMessage, MappingWorker,
    ResultDisposition, SharedState, StaleReason,
};
use rust_recon::tracking::{KeyFrameReason, KeyFrameRequest};
use rust_recon::vocabulary::BowVector;

fn empty_keyframe(frame_id: u64) -> KeyFrameSource {
    KeyFrameSource {
        frame_id,
        timestamp: frame_id as f64,
        pose_cw: SE3::identity(),
        keypoints: Vec::new(),
        points: Vec::new(),
        descriptors: Vec::new(),
        bow: BowVector::new(),
        image: None,
        depth: None,
    }
}

fn moved(x: f64) -> SE3 {
    SE3::from_parts(UnitQuaternion::identity(), Vector3::new(x, 0.0, 0.0))
}

/// What the bundle adjustment worker would return for `request`.
fn result_for(request: &BundleAdjustmentRequest, kf: KeyFrameId, pose: SE3) -> BundleAdjustmentResult {
    BundleAdjustmentResult {
        request_id: request.request_id,
        kind: request.kind,
        base_version: request.snapshot.version(),
        base_epoch: request.snapshot.epoch(),
        correction: MapCorrection {
            keyframe_poses: vec![(kf, pose)],
            ..MapCorrection::default()
        },
        outcome: OptimizationOutcome::default(),
    }
}

struct Fixture {
    shared: Arc<SharedState>,
    worker: MappingWorker,
    requests: crossbeam_channel::Receiver<BundleAdjustmentRequest>,
    kf: KeyFrameId,
}

impl Fixture {
    fn new() -> Self {
        let shared = SharedState::new(ScaleLevels::new(8, 1.2));
        let kf = shared.write(|map| map.create_keyframe(empty_keyframe(0)));
        let camera = CameraModel::default();
        let manager = MapManager::new(camera, MapManagerConfig::default(), MatcherConfig::default());
        let (sender, requests) = unbounded();
        let worker = MappingWorker::new(Arc::clone(&shared), manager, Some(sender), None);
        Self {
            shared,
            worker,
            requests,
            kf,
        }
    }

    /// Lets the worker issue a global adjustment and returns the request.
    fn global_request(&mut self) -> BundleAdjustmentRequest {
        let epoch = self.shared.map_version().1;
        self.worker.handle(MappingMessage::Initialized { current_kf: self.kf, epoch });
        self.requests.try_recv().expect("global request issued")
    }

    fn pose(&self) -> SE3 {
        self.shared.snapshot().keyframe(self.kf).unwrap().pose_cw
    }
}

#[test]
fn superseded_result_is_discarded() {
    let mut fx = Fixture::new();
    let first = fx.global_request();
    let second = fx.global_request();
    assert_eq!(second.kind, BundleAdjustmentKind::Global);
    assert!(second.request_id > first.request_id);

    // The older result arrives late and must not overwrite anything.
    let stale = fx.worker.apply_bundle_adjustment(&result_for(&first, fx.kf, moved(1.0)));
    assert_eq!(
        stale,
        ResultDisposition::Discarded(StaleReason::Superseded {
            request_id: first.request_id,
            latest: second.request_id,
        })
    );
    assert_eq!(fx.pose().translation, Vector3::zeros());

    let fresh = fx.worker.apply_bundle_adjustment(&result_for(&second, fx.kf, moved(2.0)));
    assert_eq!(fresh, ResultDisposition::Applied(1));
    assert_eq!(fx.pose().translation.x, 2.0);

    let stats = fx.shared.stats();
    assert_eq!(stats.results_applied, 1);
    assert_eq!(stats.results_discarded, 1);
}

#[test]
fn result_from_before_a_map_rewrite_is_discarded() {
    let mut fx = Fixture::new();
    let request = fx.global_request();

    // A loop correction lands while the adjustment is running.
    fx.shared.write(|map| map.bump_epoch());

    let disposition = fx.worker.apply_bundle_adjustment(&result_for(&request, fx.kf, moved(1.0)));
    assert!(matches!(
        disposition,
        ResultDisposition::Discarded(StaleReason::EpochChanged { .. })
    ));
    assert_eq!(fx.pose(), SE3::identity());
}

#[test]
fn lanes_do_not_supersede_each_other() {
    let mut fx = Fixture::new();
    let kind = BundleAdjustmentKind::Local(fx.kf);
    let local = BundleAdjustmentRequest {
        request_id: fx.shared.next_request_id(kind),
        kind,
        snapshot: fx.shared.snapshot(),
    };
    // A newer global request leaves the local lane untouched.
    let global = fx.global_request();

    assert_eq!(
        fx.worker.apply_bundle_adjustment(&result_for(&local, fx.kf, moved(0.5))),
        ResultDisposition::Applied(1)
    );
    assert_eq!(
        fx.worker.apply_bundle_adjustment(&result_for(&global, fx.kf, moved(0.7))),
        ResultDisposition::Applied(1)
    );
    assert_eq!(fx.pose().translation.x, 0.7);
}

#[test]
fn reset_discards_results_in_flight() {
    let mut fx = Fixture::new();
    let request = fx.global_request();
    fx.shared.write(|map| map.clear());
    let kf = fx.shared.write(|map| map.create_keyframe(empty_keyframe(1)));

    let disposition = fx.worker.apply_bundle_adjustment(&result_for(&request, kf, moved(1.0)));
    assert!(matches!(disposition, ResultDisposition::Discarded(_)));
    assert_eq!(fx.shared.snapshot().keyframe(kf).unwrap().pose_cw, SE3::identity());
}

/// A keyframe request whose single feature tracks `mp`.
fn keyframe_request(frame_id: u64, base_epoch: u64, mp: MapPointId) -> KeyFrameRequest {
    let pt = nalgebra::Vector2::new(100.0, 80.0);
    let mut source = empty_keyframe(frame_id);
    source.keypoints = vec![KeyPoint {
        pt,
        octave: 0,
        scale: 1.0,
        angle: 0.0,
        response: 1.0,
    }];
    source.points = vec![pt];
    source.descriptors = vec![[0u8; 32]];
    KeyFrameRequest {
        base_epoch,
        source,
        tracked: vec![(0, mp)],
        point_stats: Vec::new(),
        reason: KeyFrameReason::Translation,
    }
}

#[test]
fn keyframe_from_before_reset_is_dropped() {
    let mut fx = Fixture::new();
    let kf = fx.kf;
    let old_point = fx.shared.write(|map| map.create_map_point(Vector3::new(0.0, 0.0, 2.0), [0u8; 32], kf));
    let stale = keyframe_request(1, fx.shared.map_version().1, old_point);

    // The session restarts while the request is still queued.
    fx.shared.write(|map| map.clear());
    let (new_kf, new_point) = fx.shared.write(|map| {
        let kf = map.create_keyframe(empty_keyframe(2));
        (kf, map.create_map_point(Vector3::new(0.0, 0.0, 1.0), [0u8; 32], kf))
    });
    assert_ne!(new_kf, kf);
    assert_ne!(new_point, old_point);

    assert_eq!(fx.worker.insert_keyframe(stale), None);
    let map = fx.shared.snapshot();
    assert_eq!(map.num_keyframes(), 1);
    assert_eq!(map.map_point(new_point).unwrap().num_observations(), 0);
    assert!(map.map_point(old_point).is_none());
    assert_eq!(fx.shared.stats().requests_dropped, 1);
    assert_eq!(fx.shared.stats().keyframes_inserted, 0);
}

#[test]
fn keyframe_from_before_loop_correction_is_dropped() {
    let mut fx = Fixture::new();
    let kf = fx.kf;
    let point = fx.shared.write(|map| map.create_map_point(Vector3::new(0.0, 0.0, 2.0), [0u8; 32], kf));
    let request = keyframe_request(1, fx.shared.map_version().1, point);

    fx.shared.write(|map| map.bump_epoch());
    assert_eq!(fx.worker.insert_keyframe(request), None);
    assert_eq!(fx.shared.snapshot().num_keyframes(), 1);
}

#[test]
fn initialization_from_old_session_requests_nothing() {
    let mut fx = Fixture::new();
    let epoch = fx.shared.map_version().1;
    fx.shared.write(|map| map.clear());

    fx.worker.handle(MappingMessage::Initialized { current_kf: fx.kf, epoch });
    assert!(fx.requests.try_recv().is_err());
    assert_eq!(fx.shared.stats().requests_dropped, 1);
}
