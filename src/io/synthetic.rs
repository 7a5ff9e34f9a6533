//! Deterministic synthetic scenes with ground truth.
//!
//! A textured plane `z = plane_depth` in world coordinates, rendered by ray
//! casting. The albedo is two layers of random blocks (a coarse and a fine
//! one) so corners exist at several scales and every patch is distinctive.
//! Pixels are supersampled, which keeps block edges stable under sub-pixel
//! motion.

use nalgebra::{UnitQuaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::features::{DepthImage, GrayImage};
use crate::geometry::{CameraModel, SE3};
use crate::imu::{InertialInput, InertialPrior};
use crate::tracking::FrameInput;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub plane_depth: f64,
    /// Block sizes of the two texture layers, in map units.
    pub coarse_cell: f64,
    pub fine_cell: f64,
    /// Samples per pixel along each axis.
    pub supersample: usize,
    pub seed: u64,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            plane_depth: 1.0,
            coarse_cell: 0.1,
            fine_cell: 0.037,
            supersample: 2,
            seed: 7,
        }
    }
}

fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Uniform value in [0, 1) for a texture cell.
fn cell_value(ix: i64, iy: i64, layer: u64, seed: u64) -> f64 {
    let h = mix(seed ^ mix(ix as u64 ^ mix(iy as u64 ^ mix(layer))));
    (h >> 11) as f64 / (1u64 << 53) as f64
}

#[derive(Debug, Clone)]
pub struct PlanarScene {
    camera: CameraModel,
    config: SceneConfig,
}

impl PlanarScene {
    pub fn new(camera: CameraModel, config: SceneConfig) -> Self {
        Self { camera, config }
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    /// Albedo in [0, 255] at a point of the plane.
    pub fn albedo(&self, x: f64, y: f64) -> f64 {
        let coarse = cell_value(
            (x / self.config.coarse_cell).floor() as i64,
            (y / self.config.coarse_cell).floor() as i64,
            0,
            self.config.seed,
        );
        let fine = cell_value(
            (x / self.config.fine_cell).floor() as i64,
            (y / self.config.fine_cell).floor() as i64,
            1,
            self.config.seed,
        );
        30.0 + 195.0 * (0.65 * coarse + 0.35 * fine)
    }

    /// Intersection of the viewing ray through a measured pixel with the
    /// plane, as `(world point, depth along the optical axis)`.
    pub fn intersect(&self, pose_cw: &SE3, px: &Vector2<f64>) -> Option<(Vector3<f64>, f64)> {
        let ray_c = self.camera.unproject(&self.camera.undistort(px));
        let pose_wc = pose_cw.inverse();
        let ray_w = pose_wc.rotation * ray_c;
        let center = pose_wc.translation;
        if ray_w.z.abs() < 1e-12 {
            return None;
        }
        // `ray_c` has unit depth, so the ray parameter is the depth.
        let t = (self.config.plane_depth - center.z) / ray_w.z;
        (t > 0.0).then(|| (center + ray_w * t, t))
    }

    pub fn render(&self, pose_cw: &SE3) -> GrayImage {
        let n = self.config.supersample.max(1);
        let step = 1.0 / n as f64;
        GrayImage::from_fn(self.camera.width as usize, self.camera.height as usize, |x, y| {
            let mut sum = 0.0;
            let mut count = 0;
            for sy in 0..n {
                for sx in 0..n {
                    let px = Vector2::new(
                        x as f64 - 0.5 + (sx as f64 + 0.5) * step,
                        y as f64 - 0.5 + (sy as f64 + 0.5) * step,
                    );
                    if let Some((p, _)) = self.intersect(pose_cw, &px) {
                        sum += self.albedo(p.x, p.y);
                        count += 1;
                    }
                }
            }
            if count == 0 {
                0
            } else {
                (sum / count as f64).round().clamp(0.0, 255.0) as u8
            }
        })
    }

    /// Depth along the optical axis; zero where the plane is not visible.
    pub fn render_depth(&self, pose_cw: &SE3) -> DepthImage {
        DepthImage::from_fn(self.camera.width as usize, self.camera.height as usize, |x, y| {
            self.intersect(pose_cw, &Vector2::new(x as f64, y as f64))
                .map_or(0.0, |(_, d)| d as f32)
        })
    }
}

/// World-to-camera pose of a camera at `center` with orientation `rotation_wc`.
pub fn camera_pose(center: &Vector3<f64>, rotation_wc: UnitQuaternion<f64>) -> SE3 {
    let rotation_cw = rotation_wc.inverse();
    SE3::from_parts(rotation_cw, -(rotation_cw * center))
}

/// Closed loop over the plane: a circle of `radius` in the camera plane,
/// with a gentle sway of the viewing direction. First and last poses
/// coincide.
pub fn loop_trajectory(frames: usize, radius: f64) -> Vec<SE3> {
    let n = frames.max(2);
    (0..n)
        .map(|i| {
            let phase = std::f64::consts::TAU * i as f64 / (n - 1) as f64;
            let center = Vector3::new(radius * (phase.cos() - 1.0), radius * phase.sin(), 0.0);
            let sway = UnitQuaternion::from_euler_angles(0.03 * phase.sin(), 0.03 * phase.cos() - 0.03, 0.0);
            camera_pose(&center, sway)
        })
        .collect()
}

/// Straight sideways motion along +x, `step` per frame.
pub fn linear_trajectory(frames: usize, step: f64) -> Vec<SE3> {
    (0..frames)
        .map(|i| camera_pose(&Vector3::new(step * i as f64, 0.0, 0.0), UnitQuaternion::identity()))
        .collect()
}

/// Ground-truth poses and the frames rendered from them.
#[derive(Debug, Clone)]
pub struct SyntheticSequence {
    pub scene: PlanarScene,
    pub poses: Vec<SE3>,
    /// Seconds between frames.
    pub frame_interval: f64,
    /// Attach a rendered depth image to every frame.
    pub with_depth: bool,
    /// Attach a ground-truth motion prior with this weight.
    pub prior_weight: Option<f64>,
}

impl SyntheticSequence {
    pub fn new(scene: PlanarScene, poses: Vec<SE3>) -> Self {
        Self {
            scene,
            poses,
            frame_interval: 1.0 / 30.0,
            with_depth: false,
            prior_weight: None,
        }
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    pub fn timestamp(&self, index: usize) -> f64 {
        index as f64 * self.frame_interval
    }

    /// Rendered input for frame `index`.
    pub fn frame(&self, index: usize) -> Option<FrameInput> {
        let pose = self.poses.get(index)?;
        let mut input = FrameInput::new(self.timestamp(index), self.scene.render(pose));
        if self.with_depth {
            input = input.with_depth(self.scene.render_depth(pose));
        }
        if let (Some(weight), Some(previous)) = (self.prior_weight, index.checked_sub(1).and_then(|i| self.poses.get(i))) {
            let delta = pose.compose(&previous.inverse());
            input = input.with_inertial(InertialInput::Prior(InertialPrior::new(delta, weight)));
        }
        Some(input)
    }

    pub fn frames(&self) -> impl Iterator<Item = FrameInput> + '_ {
        (0..self.len()).filter_map(|i| self.frame(i))
    }
}
