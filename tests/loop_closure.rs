//! Loop closing on a drifted map of a closed trajectory.

use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::{UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rust_recon::features::{Descriptor, KeyPoint, MatcherConfig, ScaleLevels};
use rust_recon::geometry::{CameraModel, SE3};
use rust_recon::io::camera_pose;
use rust_recon::loop_closing::{apply_loop_correction, LoopCloser, LoopClosingConfig};
use rust_recon::map::{KeyFrameId, KeyFrameSource, Map, MapManager, MapManagerConfig, MapPointId};
use rust_recon::system::SharedState;
use rust_recon::vocabulary::{Vocabulary, VocabularyConfig};

/// Keyframes around the loop; the last one revisits the first pose.
const LOOP_KEYFRAMES: usize = 12;
/// Keyframe index after which the drift stops growing.
const DRIFT_END: usize = 8;
/// A keyframe reuses points created at most this many keyframes earlier.
const TRACKING_WINDOW: usize = 3;

fn camera() -> CameraModel {
    CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480)
}

fn descriptor(rng: &mut StdRng) -> Descriptor {
    let mut d = [0u8; 32];
    rng.fill(&mut d[..]);
    d
}

fn true_pose(i: usize) -> SE3 {
    let theta = std::f64::consts::TAU * (i % LOOP_KEYFRAMES) as f64 / LOOP_KEYFRAMES as f64;
    camera_pose(&Vector3::new(theta.cos() - 1.0, theta.sin(), 0.0), UnitQuaternion::identity())
}

/// World-frame error of keyframe `i`: grows linearly, then stays constant.
fn drift(i: usize) -> SE3 {
    let t = i.min(DRIFT_END) as f64 / DRIFT_END as f64;
    SE3::from_parts(
        UnitQuaternion::from_euler_angles(0.0, 0.0, 0.03 * t),
        Vector3::new(0.12, -0.08, 0.04) * t,
    )
}

/// Estimated pose: the true camera seen through the drifted world.
fn drifted_pose(i: usize) -> SE3 {
    true_pose(i).compose(&drift(i).inverse())
}

struct DriftedMap {
    map: Map,
    keyframes: Vec<KeyFrameId>,
}

/// Builds the map a drifting tracker would have produced: every keyframe
/// sees the true scene, but points it creates are placed through its own
/// drifted pose. Points from outside the tracking window are not recognised
/// and get duplicated.
fn drifted_map(vocabulary: &Vocabulary) -> DriftedMap {
    let camera = camera();
    let mut rng = StdRng::seed_from_u64(21);
    let mut scene: Vec<(Vector3<f64>, Descriptor)> = Vec::new();
    for i in 0..LOOP_KEYFRAMES {
        let center = true_pose(i).camera_center();
        for _ in 0..30 {
            let p = Vector3::new(
                center.x + rng.gen_range(-0.5..0.5),
                center.y + rng.gen_range(-0.5..0.5),
                rng.gen_range(2.5..3.5),
            );
            scene.push((p, descriptor(&mut rng)));
        }
    }

    let mut map = Map::new(ScaleLevels::new(8, 1.2));
    let mut keyframes = Vec::new();
    // Newest point created for each scene point, with its creator's index.
    let mut instances: HashMap<usize, (usize, MapPointId)> = HashMap::new();

    for i in 0..=LOOP_KEYFRAMES {
        let pose = true_pose(i);
        let visible: Vec<(usize, nalgebra::Vector2<f64>)> = scene
            .iter()
            .enumerate()
            .filter_map(|(j, (p, _))| {
                let px = camera.project(&pose.transform_point(p))?;
                camera.in_image(&px, 5.0).then_some((j, px))
            })
            .collect();
        let descriptors: Vec<Descriptor> = visible.iter().map(|&(j, _)| scene[j].1).collect();
        let source = KeyFrameSource {
            frame_id: i as u64,
            timestamp: i as f64,
            pose_cw: drifted_pose(i),
            keypoints: visible
                .iter()
                .map(|&(_, px)| KeyPoint {
                    pt: px,
                    octave: 0,
                    scale: 1.0,
                    angle: 0.0,
                    response: 1.0,
                })
                .collect(),
            points: visible.iter().map(|&(_, px)| px).collect(),
            bow: vocabulary.transform(&descriptors),
            descriptors,
            image: None,
            depth: None,
        };
        let kf = map.create_keyframe(source);

        for (feature, &(j, _)) in visible.iter().enumerate() {
            let reusable = instances
                .get(&j)
                .filter(|(creator, _)| i - creator <= TRACKING_WINDOW)
                .map(|&(_, mp)| mp);
            let mp = match reusable {
                Some(mp) => mp,
                None => {
                    let position = drift(i).transform_point(&scene[j].0);
                    let mp = map.create_map_point(position, scene[j].1, kf);
                    instances.insert(j, (i, mp));
                    mp
                }
            };
            map.associate(kf, feature, mp);
        }
        map.update_connections(kf);
        keyframes.push(kf);
    }
    for mp in map.map_point_ids() {
        map.update_map_point_geometry(mp);
    }
    DriftedMap { map, keyframes }
}

fn center_errors(map: &Map, keyframes: &[KeyFrameId]) -> Vec<f64> {
    keyframes
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let estimated = map.keyframe(*id).unwrap().pose_cw.camera_center();
            (estimated - true_pose(i).camera_center()).norm()
        })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

#[test]
fn loop_closure_reduces_drift() {
    let vocabulary = Vocabulary::new(&VocabularyConfig::default());
    let DriftedMap { map, keyframes } = drifted_map(&vocabulary);
    let before = center_errors(&map, &keyframes);
    assert!(before[LOOP_KEYFRAMES] > 0.1);

    let shared = Arc::new(SharedState::with_map(map));
    let mut config = LoopClosingConfig::default();
    config.detector.consistency_threshold = 1;
    let mut closer = LoopCloser::new(Arc::clone(&shared), camera(), config, MatcherConfig::default());

    let current = keyframes[LOOP_KEYFRAMES];
    let correction = closer.process_keyframe(current).expect("loop detected and verified");
    assert_eq!(correction.current_kf_id(), current);
    assert_eq!(correction.loop_kf_id(), keyframes[0]);
    assert!(correction.verified.num_inliers >= 20);
    assert!((correction.verified.s_cw.scale - 1.0).abs() < 0.01);
    assert!(correction.outcome.best_cost <= correction.outcome.initial_cost);
    assert!(shared.is_loop_in_flight());

    let manager = MapManager::new(camera(), MapManagerConfig::default(), MatcherConfig::default());
    let epoch = shared.map_version().1;
    let applied = shared.write(|map| apply_loop_correction(map, &manager, &correction));
    let applied = applied.expect("correction computed on the current epoch");
    assert!(applied.updated > 0);
    assert!(applied.replaced > 0);
    assert_eq!(shared.map_version().1, epoch + 1);

    let map = shared.snapshot();
    let after = center_errors(&map, &keyframes);
    assert!(after[LOOP_KEYFRAMES] < 0.03, "revisit error {:.4}", after[LOOP_KEYFRAMES]);
    assert!(
        mean(&after) < 0.5 * mean(&before),
        "mean error {:.4} -> {:.4}",
        mean(&before),
        mean(&after)
    );
    let loop_kf = map.keyframe(current).unwrap();
    assert!(loop_kf.loop_edges.contains(&keyframes[0]));

    // The same correction cannot be applied twice.
    assert!(shared.write(|map| apply_loop_correction(map, &manager, &correction)).is_none());
}
