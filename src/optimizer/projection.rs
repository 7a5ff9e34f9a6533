//! Reprojection residuals and their Jacobians.
//!
//! Poses are world-to-camera and perturbed on the left, `exp(δ) ∘ T_cw`
//! with `δ = [ω; υ]`, matching [`SE3::retract_left`].

use nalgebra::{Matrix2x3, Matrix2x6, Vector2, Vector3};

use crate::geometry::{CameraModel, SE3};

/// Points closer than this to the image plane produce no residual.
pub const MIN_DEPTH: f64 = 1e-6;

/// Projection of a world point with the Jacobians of the projected pixel
/// with respect to the pose perturbation and the point.
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    pub pixel: Vector2<f64>,
    pub d_pose: Matrix2x6<f64>,
    pub d_point: Matrix2x3<f64>,
}

/// `None` when the point is behind the camera.
pub fn project_with_jacobians(camera: &CameraModel, pose_cw: &SE3, point_w: &Vector3<f64>) -> Option<Projection> {
    let p = pose_cw.transform_point(point_w);
    if p.z <= MIN_DEPTH {
        return None;
    }
    let inv_z = 1.0 / p.z;
    let inv_z2 = inv_z * inv_z;
    let (fx, fy) = (camera.fx, camera.fy);

    let d_proj = Matrix2x3::new(
        fx * inv_z,
        0.0,
        -fx * p.x * inv_z2,
        0.0,
        fy * inv_z,
        -fy * p.y * inv_z2,
    );
    // d(p_c)/dω = -[p_c]×, d(p_c)/dυ = I
    let d_rot = d_proj * -crate::geometry::so3::skew(&p);
    let mut d_pose = Matrix2x6::zeros();
    d_pose.fixed_view_mut::<2, 3>(0, 0).copy_from(&d_rot);
    d_pose.fixed_view_mut::<2, 3>(0, 3).copy_from(&d_proj);

    let d_point = d_proj * pose_cw.rotation.to_rotation_matrix().into_inner();
    Some(Projection {
        pixel: Vector2::new(fx * p.x * inv_z + camera.cx, fy * p.y * inv_z + camera.cy),
        d_pose,
        d_point,
    })
}

/// Huber weight for a residual with the given (whitened) norm.
#[inline]
pub fn huber_weight(norm: f64, delta: f64) -> f64 {
    if norm <= delta {
        1.0
    } else {
        delta / norm
    }
}

/// Huber cost of a squared (whitened) residual.
#[inline]
pub fn huber_cost(sq_norm: f64, delta: f64) -> f64 {
    let norm = sq_norm.sqrt();
    if norm <= delta {
        sq_norm
    } else {
        2.0 * delta * norm - delta * delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::se3::rotation_from_euler;
    use approx::assert_relative_eq;
    use nalgebra::Vector6;

    fn camera() -> CameraModel {
        CameraModel::pinhole(450.0, 460.0, 320.0, 240.0, 640, 480)
    }

    #[test]
    fn test_pose_jacobian_matches_numerical() {
        let cam = camera();
        let pose = SE3::from_parts(rotation_from_euler(0.1, -0.2, 0.05), Vector3::new(0.1, -0.3, 0.4));
        let point = Vector3::new(0.4, 0.2, 3.0);
        let analytic = project_with_jacobians(&cam, &pose, &point).unwrap();

        let eps = 1e-6;
        for k in 0..6 {
            let mut delta = Vector6::zeros();
            delta[k] = eps;
            let plus = cam.project(&pose.retract_left(&delta).transform_point(&point)).unwrap();
            delta[k] = -eps;
            let minus = cam.project(&pose.retract_left(&delta).transform_point(&point)).unwrap();
            let numeric = (plus - minus) / (2.0 * eps);
            assert_relative_eq!(analytic.d_pose.column(k).into_owned(), numeric, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_point_jacobian_matches_numerical() {
        let cam = camera();
        let pose = SE3::from_parts(rotation_from_euler(-0.1, 0.3, 0.0), Vector3::new(0.2, 0.0, 0.1));
        let point = Vector3::new(-0.5, 0.3, 2.5);
        let analytic = project_with_jacobians(&cam, &pose, &point).unwrap();

        let eps = 1e-6;
        for k in 0..3 {
            let mut d = Vector3::zeros();
            d[k] = eps;
            let plus = cam.project(&pose.transform_point(&(point + d))).unwrap();
            let minus = cam.project(&pose.transform_point(&(point - d))).unwrap();
            let numeric = (plus - minus) / (2.0 * eps);
            assert_relative_eq!(analytic.d_point.column(k).into_owned(), numeric, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_behind_camera() {
        let cam = camera();
        assert!(project_with_jacobians(&cam, &SE3::identity(), &Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_huber() {
        assert_eq!(huber_weight(1.0, 2.0), 1.0);
        assert_relative_eq!(huber_weight(4.0, 2.0), 0.5);
        assert_relative_eq!(huber_cost(9.0, 1.0), 5.0);
    }
}
