//! SO(3) helpers shared by the SE3/Sim3 types and the inertial integrator.
//!
//! Conventions: rotation vectors are axis * angle, Jacobians follow the
//! left-perturbation convention used by the pose and bundle optimizers.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

/// Below this angle the series expansions are used.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-8;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Exponential map from a rotation vector to a unit quaternion.
pub fn exp(phi: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*phi)
}

/// Logarithm of a rotation, returned as a rotation vector in [-π, π].
pub fn log(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    q.scaled_axis()
}

/// Projects an arbitrary 3x3 matrix onto the closest rotation (Frobenius).
pub fn orthonormalize(m: &Matrix3<f64>) -> Rotation3<f64> {
    let svd = m.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Rotation3::identity();
    };
    let mut d = Matrix3::identity();
    if (u * v_t).determinant() < 0.0 {
        // Flip the direction with the smallest singular value.
        let weakest = svd.singular_values.imin();
        d[(weakest, weakest)] = -1.0;
    }
    Rotation3::from_matrix_unchecked(u * d * v_t)
}

/// Left Jacobian of SO(3).
///
/// ```text
/// Jl(φ) = I + (1 - cos θ)/θ² [φ]× + (θ - sin θ)/θ³ [φ]×²
/// ```
///
/// It maps the translational part of an se(3) tangent vector to the
/// translation of the corresponding SE3 element.
pub fn left_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let k = skew(phi);
    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() + 0.5 * k;
    }
    let theta_sq = theta * theta;
    Matrix3::identity()
        + ((1.0 - theta.cos()) / theta_sq) * k
        + ((theta - theta.sin()) / (theta_sq * theta)) * k * k
}

/// Inverse of the left Jacobian.
///
/// ```text
/// Jl⁻¹(φ) = I - 0.5 [φ]× + (1/θ² - (1 + cos θ)/(2θ sin θ)) [φ]×²
/// ```
pub fn left_jacobian_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let k = skew(phi);
    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() - 0.5 * k + (1.0 / 12.0) * k * k;
    }
    let coeff = 1.0 / (theta * theta) - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Matrix3::identity() - 0.5 * k + coeff * k * k
}

/// Right Jacobian, Jr(φ) = Jl(-φ).
pub fn right_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    left_jacobian(&(-phi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);
        assert_relative_eq!(v.cross(&u), skew(&v) * u, epsilon = 1e-12);
    }

    #[test]
    fn test_exp_log_roundtrip() {
        let phi = Vector3::new(0.3, -0.2, 0.9);
        assert_relative_eq!(log(&exp(&phi)), phi, epsilon = 1e-12);
    }

    #[test]
    fn test_left_jacobian_inverse() {
        let phi = Vector3::new(0.4, 0.1, -0.7);
        let product = left_jacobian(&phi) * left_jacobian_inv(&phi);
        assert_relative_eq!(product, Matrix3::identity(), epsilon = 1e-10);
    }

    #[test]
    fn test_right_jacobian_is_transpose_of_left() {
        let phi = Vector3::new(-0.2, 0.5, 0.3);
        assert_relative_eq!(right_jacobian(&phi), left_jacobian(&phi).transpose(), epsilon = 1e-12);
    }

    #[test]
    fn test_orthonormalize_recovers_rotation() {
        let r = Rotation3::from_euler_angles(0.1, 0.2, 0.3);
        let noisy = r.matrix() + Matrix3::from_element(1e-4);
        let fixed = orthonormalize(&noisy);
        assert_relative_eq!(fixed.matrix(), r.matrix(), epsilon = 1e-3);
        assert_relative_eq!(fixed.matrix().determinant(), 1.0, epsilon = 1e-10);
    }
}
