//! Pinhole camera with three-term radial distortion.
//!
//! Keypoints are undistorted once when a frame is built, so everything
//! downstream (matching geometry, pose optimization, bundle adjustment)
//! works with the ideal pinhole projection.

use nalgebra::{Matrix3, Matrix4, UnitQuaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::SE3;

/// Iterations of the fixed-point undistortion.
const UNDISTORT_ITERATIONS: usize = 20;

/// Intrinsics plus radial distortion (k1, k2, k3).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraModel {
    fn default() -> Self {
        Self::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480)
    }
}

impl CameraModel {
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            k1: 0.0,
            k2: 0.0,
            k3: 0.0,
            width,
            height,
        }
    }

    pub fn with_distortion(mut self, k1: f64, k2: f64, k3: f64) -> Self {
        self.k1 = k1;
        self.k2 = k2;
        self.k3 = k3;
        self
    }

    pub fn has_distortion(&self) -> bool {
        self.k1 != 0.0 || self.k2 != 0.0 || self.k3 != 0.0
    }

    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    pub fn k_inverse(&self) -> Matrix3<f64> {
        Matrix3::new(
            1.0 / self.fx,
            0.0,
            -self.cx / self.fx,
            0.0,
            1.0 / self.fy,
            -self.cy / self.fy,
            0.0,
            0.0,
            1.0,
        )
    }

    /// Ideal projection of a camera-frame point. `None` behind the camera.
    #[inline]
    pub fn project(&self, p_c: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_c.z <= 1e-9 {
            return None;
        }
        let inv_z = 1.0 / p_c.z;
        Some(Vector2::new(
            self.fx * p_c.x * inv_z + self.cx,
            self.fy * p_c.y * inv_z + self.cy,
        ))
    }

    /// Pixel to normalized image plane coordinates.
    #[inline]
    pub fn normalize(&self, px: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new((px.x - self.cx) / self.fx, (px.y - self.cy) / self.fy)
    }

    /// Pixel to a unit-depth ray `(x, y, 1)` in the camera frame.
    pub fn unproject(&self, px: &Vector2<f64>) -> Vector3<f64> {
        let n = self.normalize(px);
        Vector3::new(n.x, n.y, 1.0)
    }

    fn radial_factor(&self, r2: f64) -> f64 {
        1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3))
    }

    /// Applies radial distortion to an ideal pixel.
    pub fn distort(&self, px: &Vector2<f64>) -> Vector2<f64> {
        let n = self.normalize(px);
        let f = self.radial_factor(n.norm_squared());
        Vector2::new(self.fx * n.x * f + self.cx, self.fy * n.y * f + self.cy)
    }

    /// Removes radial distortion from a measured pixel by fixed-point iteration.
    pub fn undistort(&self, px: &Vector2<f64>) -> Vector2<f64> {
        if !self.has_distortion() {
            return *px;
        }
        let distorted = self.normalize(px);
        let mut n = distorted;
        for _ in 0..UNDISTORT_ITERATIONS {
            let f = self.radial_factor(n.norm_squared());
            if f.abs() < 1e-12 {
                break;
            }
            n = distorted / f;
        }
        Vector2::new(self.fx * n.x + self.cx, self.fy * n.y + self.cy)
    }

    #[inline]
    pub fn in_image(&self, px: &Vector2<f64>, margin: f64) -> bool {
        px.x >= margin
            && px.y >= margin
            && px.x < self.width as f64 - margin
            && px.y < self.height as f64 - margin
    }
}

/// A posed camera: world position, orientation and intrinsics.
///
/// `orientation` rotates camera-frame vectors into the world frame, so the
/// camera-to-world transform is `[R | position]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    pub model: CameraModel,
}

impl Camera {
    /// Builds a camera from a world-to-camera pose.
    pub fn from_pose_cw(pose_cw: &SE3, model: CameraModel) -> Self {
        Self {
            position: pose_cw.camera_center(),
            orientation: pose_cw.rotation.inverse(),
            model,
        }
    }

    /// World-to-camera pose.
    pub fn pose_cw(&self) -> SE3 {
        SE3::from_parts(self.orientation, self.position).inverse()
    }

    /// 4x4 camera-to-world transform derived from position and orientation.
    pub fn transform_matrix(&self) -> Matrix4<f64> {
        SE3::from_parts(self.orientation, self.position).to_matrix()
    }

    /// Recovers position and orientation from a camera-to-world transform.
    pub fn from_transform_matrix(m: &Matrix4<f64>, model: CameraModel) -> Self {
        let twc = SE3::from_matrix(m);
        Self {
            position: twc.translation,
            orientation: twc.rotation,
            model,
        }
    }

    pub fn project_world(&self, p_w: &Vector3<f64>) -> Option<Vector2<f64>> {
        self.model.project(&(self.orientation.inverse() * (p_w - self.position)))
    }
}
