//! Two-view triangulation and the checks a new map point has to pass.

use nalgebra::{DMatrix, Vector2, Vector3};

use super::linalg::null_vector;
use super::{CameraModel, SE3};

/// Linear (DLT) triangulation from two views.
///
/// `xn1`/`xn2` are normalized image coordinates; poses are world-to-camera.
/// Returns the world point, or `None` when the system is degenerate or the
/// solution lies at infinity.
pub fn triangulate_dlt(
    xn1: &Vector2<f64>,
    xn2: &Vector2<f64>,
    pose1_cw: &SE3,
    pose2_cw: &SE3,
) -> Option<Vector3<f64>> {
    let p1 = pose1_cw.to_matrix();
    let p2 = pose2_cw.to_matrix();

    let mut a = DMatrix::<f64>::zeros(4, 4);
    for c in 0..4 {
        a[(0, c)] = xn1.x * p1[(2, c)] - p1[(0, c)];
        a[(1, c)] = xn1.y * p1[(2, c)] - p1[(1, c)];
        a[(2, c)] = xn2.x * p2[(2, c)] - p2[(0, c)];
        a[(3, c)] = xn2.y * p2[(2, c)] - p2[(1, c)];
    }
    let x = null_vector(&a)?;
    if x[3].abs() < 1e-12 {
        return None;
    }
    let p = Vector3::new(x[0] / x[3], x[1] / x[3], x[2] / x[3]);
    p.iter().all(|v| v.is_finite()).then_some(p)
}

/// Cosine of the angle between the rays from two camera centers to `p`.
pub fn parallax_cos(p: &Vector3<f64>, center1: &Vector3<f64>, center2: &Vector3<f64>) -> f64 {
    let r1 = p - center1;
    let r2 = p - center2;
    let denom = r1.norm() * r2.norm();
    if denom <= 0.0 {
        return 1.0;
    }
    r1.dot(&r2) / denom
}

/// Squared pixel reprojection error of a world point, `None` behind the camera.
pub fn reprojection_error_sq(
    camera: &CameraModel,
    pose_cw: &SE3,
    point_w: &Vector3<f64>,
    observed: &Vector2<f64>,
) -> Option<f64> {
    let projected = camera.project(&pose_cw.transform_point(point_w))?;
    Some((projected - observed).norm_squared())
}

/// Thresholds for accepting a freshly triangulated point.
#[derive(Debug, Clone, Copy)]
pub struct TriangulationCheck {
    /// Rays must diverge by more than this (cosine must be smaller).
    pub max_parallax_cos: f64,
    /// χ² bound (2 DOF) on the reprojection residual in each view.
    pub chi2_threshold: f64,
}

impl Default for TriangulationCheck {
    fn default() -> Self {
        Self {
            max_parallax_cos: 0.9998,
            chi2_threshold: 5.991,
        }
    }
}

/// One view of a candidate point.
#[derive(Debug, Clone, Copy)]
pub struct ViewObservation<'a> {
    pub pose_cw: &'a SE3,
    pub pixel: Vector2<f64>,
    /// Variance of the pixel measurement (grows with pyramid level).
    pub sigma2: f64,
}

/// Triangulates and validates a point seen in two views.
///
/// Rejects points with too little parallax, behind either camera, or with a
/// reprojection residual outside the χ² gate.
pub fn triangulate_checked(
    camera: &CameraModel,
    view1: ViewObservation<'_>,
    view2: ViewObservation<'_>,
    check: &TriangulationCheck,
) -> Option<Vector3<f64>> {
    let c1 = view1.pose_cw.camera_center();
    let c2 = view2.pose_cw.camera_center();
    let ray1 = view1.pose_cw.rotation.inverse() * camera.unproject(&view1.pixel);
    let ray2 = view2.pose_cw.rotation.inverse() * camera.unproject(&view2.pixel);
    let cos_rays = ray1.dot(&ray2) / (ray1.norm() * ray2.norm());
    if cos_rays >= check.max_parallax_cos {
        return None;
    }

    let p = triangulate_dlt(
        &camera.normalize(&view1.pixel),
        &camera.normalize(&view2.pixel),
        view1.pose_cw,
        view2.pose_cw,
    )?;

    for view in [&view1, &view2] {
        if view.pose_cw.transform_point(&p).z <= 0.0 {
            return None;
        }
        let err = reprojection_error_sq(camera, view.pose_cw, &p, &view.pixel)?;
        if err / view.sigma2 > check.chi2_threshold {
            return None;
        }
    }
    if parallax_cos(&p, &c1, &c2) >= check.max_parallax_cos {
        return None;
    }
    Some(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::se3::rotation_from_euler;

    fn two_poses() -> (SE3, SE3) {
        let pose1 = SE3::identity();
        let pose2 = SE3::from_parts(rotation_from_euler(0.0, -0.05, 0.0), Vector3::new(-0.3, 0.02, 0.01));
        (pose1, pose2)
    }

    #[test]
    fn test_dlt_recovers_point() {
        let (pose1, pose2) = two_poses();
        let camera = CameraModel::default();
        for truth in [
            Vector3::new(0.4, -0.3, 3.0),
            Vector3::new(-1.0, 0.5, 6.5),
            Vector3::new(0.05, 0.1, 1.2),
        ] {
            let px1 = camera.project(&pose1.transform_point(&truth)).expect("visible");
            let px2 = camera.project(&pose2.transform_point(&truth)).expect("visible");
            let p = triangulate_dlt(&camera.normalize(&px1), &camera.normalize(&px2), &pose1, &pose2)
                .expect("triangulated");
            assert!((p - truth).norm() / truth.norm() < 1e-3);
        }
    }

    #[test]
    fn test_checked_rejects_inconsistent_observation() {
        let (pose1, pose2) = two_poses();
        let camera = CameraModel::default();
        let truth = Vector3::new(0.4, -0.3, 3.0);
        let px1 = camera.project(&pose1.transform_point(&truth)).expect("visible");
        let px2 = camera.project(&pose2.transform_point(&truth)).expect("visible");
        let ok = triangulate_checked(
            &camera,
            ViewObservation { pose_cw: &pose1, pixel: px1, sigma2: 1.0 },
            ViewObservation { pose_cw: &pose2, pixel: px2, sigma2: 1.0 },
            &TriangulationCheck::default(),
        );
        assert!(ok.is_some());

        // Shifting the second observation off the epipolar line breaks consistency.
        let bogus = Vector2::new(px2.x, px2.y + 40.0);
        let bad = triangulate_checked(
            &camera,
            ViewObservation { pose_cw: &pose1, pixel: px1, sigma2: 1.0 },
            ViewObservation { pose_cw: &pose2, pixel: bogus, sigma2: 1.0 },
            &TriangulationCheck::default(),
        );
        assert!(bad.is_none());
    }

    #[test]
    fn test_parallax_cos_identical_centers() {
        let c = Vector3::zeros();
        assert_eq!(parallax_cos(&Vector3::new(0.0, 0.0, 1.0), &c, &c), 1.0);
    }
}
