use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use rust_recon::geometry::CameraModel;
use rust_recon::io::{loop_trajectory, save_mesh, save_point_cloud, save_trajectory, PlanarScene, SceneConfig, SyntheticSequence};
use rust_recon::{ReconstructionSystem, SystemConfig};

const FRAMES: usize = 150;
const LOOP_RADIUS: f64 = 0.2;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Usage: rust-recon [OUTPUT_DIR] [CONFIG.yaml]
    let mut args = std::env::args().skip(1);
    let output_dir = PathBuf::from(args.next().unwrap_or_else(|| "output".to_string()));
    let config = match args.next() {
        Some(path) => SystemConfig::from_yaml_file(&path)?,
        None => SystemConfig {
            camera: CameraModel::pinhole(300.0, 300.0, 160.0, 120.0, 320, 240),
            ..SystemConfig::default()
        },
    };

    let scene = PlanarScene::new(config.camera, SceneConfig::default());
    let mut sequence = SyntheticSequence::new(scene, loop_trajectory(FRAMES, LOOP_RADIUS));
    sequence.with_depth = true;
    info!(
        "[Demo] {} frames around a {:.2} m loop, output to {}",
        sequence.len(),
        LOOP_RADIUS,
        output_dir.display()
    );

    let mut system = ReconstructionSystem::new(config)?;
    let start = Instant::now();
    let mut tracked = 0;
    for (i, input) in sequence.frames().enumerate() {
        let result = system.process_frame(input);
        if result.is_tracking() {
            tracked += 1;
        }
        if let Some(event) = &result.event {
            debug!("[Demo] frame {}: {}", i, event);
        }
        if i % 25 == 0 {
            info!(
                "[Demo] frame {}: {} ({} inliers / {} matches)",
                i,
                result.state,
                result.metrics.n_inliers,
                result.metrics.n_map_point_matches
            );
        }
    }
    info!(
        "[Demo] tracked {}/{} frames in {:.2} s",
        tracked,
        sequence.len(),
        start.elapsed().as_secs_f64()
    );

    if !system.wait_until_idle(Duration::from_secs(60)) {
        warn!("[Demo] background work still pending, exporting current state");
    }

    // Keyframe error against ground truth. The map frame is the first
    // camera, which the synthetic loop starts at.
    let keyframes = system.keyframe_trajectory();
    let errors: Vec<f64> = keyframes
        .iter()
        .filter_map(|(timestamp, pose)| {
            let index = (timestamp / sequence.frame_interval).round() as usize;
            let truth = sequence.poses.get(index)?;
            Some((pose.camera_center() - truth.camera_center()).norm())
        })
        .collect();
    if !errors.is_empty() {
        let rmse = (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt();
        info!("[Demo] {} keyframes, position RMSE {:.4} m", keyframes.len(), rmse);
    }

    let cloud = system.point_cloud();
    save_point_cloud(&cloud, output_dir.join("points.csv"))?;
    save_trajectory(system.trajectory(), output_dir.join("trajectory.csv"))?;
    save_trajectory(&keyframes, output_dir.join("keyframes.csv"))?;

    let mesh = system
        .spawn_mesh_build()?
        .join()
        .map_err(|_| anyhow!("mesh build thread panicked"))?;
    let written = save_mesh(&mesh, &output_dir, "mesh")?;

    let stats = system.worker_stats();
    info!(
        "[Demo] {} points, mesh {} vertices / {} triangles, {} loops closed, {} files in {}",
        cloud.len(),
        mesh.num_vertices(),
        mesh.num_triangles(),
        stats.loops_closed,
        written.len() + 3,
        output_dir.display()
    );

    system.shutdown();
    Ok(())
}
