//! SE(3) rigid transforms.
//!
//! Poses in the map are stored as `T_cw` (world to camera). Tangent vectors
//! are ordered `[ω; υ]` (rotation first), matching the bundle adjuster's
//! Jacobian layout.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use super::so3;

/// Rigid body transform: p' = R p + t.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn from_parts(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self { rotation, translation }
    }

    /// Construct from a rotation matrix, which is re-orthonormalized first.
    pub fn from_rt(rotation: &Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot = so3::orthonormalize(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot),
            translation,
        }
    }

    /// Construct from quaternion coefficients (w, x, y, z). The quaternion is normalized.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(qw, qx, qy, qz)),
            translation,
        }
    }

    /// Homogeneous 4x4 matrix `[R | t; 0 0 0 1]`.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.to_rotation_matrix().matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Decompose a homogeneous rigid transform.
    pub fn from_matrix(m: &Matrix4<f64>) -> Self {
        let r = m.fixed_view::<3, 3>(0, 0).into_owned();
        let t = Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]);
        Self::from_rt(&r, t)
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// self ∘ other.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    #[inline]
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Exponential map of `[ω; υ]`.
    pub fn exp(xi: &Vector6<f64>) -> Self {
        let omega = Vector3::new(xi[0], xi[1], xi[2]);
        let upsilon = Vector3::new(xi[3], xi[4], xi[5]);
        Self {
            rotation: so3::exp(&omega),
            translation: so3::left_jacobian(&omega) * upsilon,
        }
    }

    /// Logarithm map, inverse of [`SE3::exp`].
    pub fn log(&self) -> Vector6<f64> {
        let omega = so3::log(&self.rotation);
        let upsilon = so3::left_jacobian_inv(&omega) * self.translation;
        Vector6::new(omega.x, omega.y, omega.z, upsilon.x, upsilon.y, upsilon.z)
    }

    /// Left-multiplicative update `exp(δ) ∘ self`.
    pub fn retract_left(&self, delta: &Vector6<f64>) -> Self {
        Self::exp(delta).compose(self)
    }

    /// Rotation angle in radians.
    pub fn rotation_angle(&self) -> f64 {
        self.rotation.angle()
    }

    /// Camera center in world coordinates when `self` is `T_cw`.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

/// True when the 3x3 block is orthonormal with determinant +1.
pub fn is_rotation_orthonormal(m: &Matrix3<f64>, tolerance: f64) -> bool {
    let should_be_identity = m.transpose() * m;
    (should_be_identity - Matrix3::identity()).amax() < tolerance
        && (m.determinant() - 1.0).abs() < tolerance
}

/// Builds a rotation from Euler angles (roll, pitch, yaw). Used by tests and the demo.
pub fn rotation_from_euler(roll: f64, pitch: f64, yaw: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_rotation_matrix(&Rotation3::from_euler_angles(roll, pitch, yaw))
}
