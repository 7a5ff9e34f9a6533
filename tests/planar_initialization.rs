//! Two-view start on a textured plane, through the full system.

use std::time::Duration;

use rust_recon::error::{InitializationError, ReconError};
use rust_recon::geometry::CameraModel;
use rust_recon::io::{linear_trajectory, PlanarScene, SceneConfig, SyntheticSequence};
use rust_recon::map::PointCloud;
use rust_recon::tracking::TrackingState;
use rust_recon::{ReconstructionSystem, SystemConfig};

fn config(background: bool) -> SystemConfig {
    let mut config = SystemConfig {
        camera: CameraModel::pinhole(300.0, 300.0, 160.0, 120.0, 320, 240),
        ..SystemConfig::default()
    };
    config.loop_closing.enabled = false;
    config.runtime.bundle_adjustment = background;
    config
}

fn sequence(config: &SystemConfig, plane_depth: f64, frames: usize, step: f64) -> SyntheticSequence {
    let scene = PlanarScene::new(
        config.camera,
        SceneConfig {
            plane_depth,
            ..SceneConfig::default()
        },
    );
    SyntheticSequence::new(scene, linear_trajectory(frames, step))
}

fn median_depth(cloud: &PointCloud) -> f64 {
    let mut depths: Vec<f64> = cloud.points.iter().map(|p| p.position.z).collect();
    depths.sort_by(f64::total_cmp);
    depths[depths.len() / 2]
}

#[test]
fn ten_centimetre_shift_initializes_map() {
    let config = config(false);
    let sequence = sequence(&config, 1.0, 2, 0.1);
    let mut system = ReconstructionSystem::new(config).unwrap();

    let first = system.process_frame(sequence.frame(0).unwrap());
    assert_eq!(first.state, TrackingState::Initializing);
    assert_eq!(
        first.event,
        Some(ReconError::Initialization(InitializationError::AwaitingSecondFrame))
    );

    let second = system.process_frame(sequence.frame(1).unwrap());
    assert_eq!(second.state, TrackingState::Tracking, "{:?}", second.event);
    let translation = second.pose_cw.unwrap().translation;
    assert!((translation.norm() - 0.1).abs() < 5e-3, "baseline {:.4}", translation.norm());
    assert!(second.camera_center().unwrap().x > 0.09);

    // Scale is fixed by the median depth, which is the plane's.
    let cloud = system.point_cloud();
    assert!(cloud.len() >= 50, "{} points", cloud.len());
    assert!((median_depth(&cloud) - 1.0).abs() < 0.05);
    assert_eq!(system.keyframe_trajectory().len(), 2);
    system.shutdown();
}

#[test]
fn motion_prior_sets_metric_scale() {
    let config = config(false);
    let mut sequence = sequence(&config, 2.0, 2, 0.1);
    sequence.prior_weight = Some(1.0);
    let mut system = ReconstructionSystem::new(config).unwrap();

    system.process_frame(sequence.frame(0).unwrap());
    let second = system.process_frame(sequence.frame(1).unwrap());
    assert!(second.is_tracking(), "{:?}", second.event);
    assert!((second.pose_cw.unwrap().translation.norm() - 0.1).abs() < 5e-3);

    // The plane is recovered at its true depth, not at unit depth.
    let depth = median_depth(&system.point_cloud());
    assert!((depth - 2.0).abs() < 0.1, "median depth {:.3}", depth);
}

#[test]
fn tracking_continues_with_background_mapping() {
    let config = config(true);
    let mut sequence = sequence(&config, 1.0, 8, 0.05);
    sequence.with_depth = true;
    let mut system = ReconstructionSystem::new(config).unwrap();

    let results: Vec<_> = sequence.frames().map(|f| system.process_frame(f)).collect();
    assert!(results[1..].iter().all(|r| r.is_tracking()));
    let last = results.last().unwrap();
    let truth = sequence.poses.last().unwrap().camera_center();
    assert!((last.camera_center().unwrap() - truth).norm() < 0.02);
    assert_eq!(system.trajectory().len(), sequence.len() - 1);

    assert!(system.wait_until_idle(Duration::from_secs(60)));
    assert!(system.worker_stats().results_applied >= 1);

    let mesh = system.build_mesh();
    assert!(!mesh.is_empty());
    let mut offsets: Vec<f64> = mesh.vertices.iter().map(|v| (v.z - 1.0).abs()).collect();
    offsets.sort_by(f64::total_cmp);
    assert!(offsets[offsets.len() / 2] < 0.05);

    system.reset();
    assert_eq!(system.state(), TrackingState::Initializing);
    assert!(system.point_cloud().is_empty());
}
