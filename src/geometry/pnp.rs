//! Perspective-n-Point: camera pose from 3D-2D correspondences.
//!
//! A linear 6-point DLT inside seeded RANSAC. The DLT degenerates on planar
//! structure, so callers that know a nearby pose (relocalization against a
//! keyframe) also try the robust pose optimizer seeded with that pose and
//! keep whichever explains more correspondences.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};
use rand::rngs::StdRng;

use super::linalg::{null_vector, svd3_sorted};
use super::ransac::{self, RansacParams};
use super::{CameraModel, SE3};

/// Minimal sample for the linear solver.
pub const PNP_SAMPLE_SIZE: usize = 6;

/// Result of a RANSAC PnP run.
#[derive(Debug, Clone)]
pub struct PnPResult {
    /// Estimated world-to-camera pose.
    pub pose_cw: SE3,
    /// Inlier mask per correspondence.
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
}

/// Linear pose from at least six correspondences (`pixels` are undistorted).
pub fn solve_pnp_dlt(points_w: &[Vector3<f64>], pixels: &[Vector2<f64>], camera: &CameraModel) -> Option<SE3> {
    let n = points_w.len();
    if n < PNP_SAMPLE_SIZE || n != pixels.len() {
        return None;
    }
    let mut a = DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (p, px)) in points_w.iter().zip(pixels).enumerate() {
        let xn = camera.normalize(px);
        let hp = [p.x, p.y, p.z, 1.0];
        for c in 0..4 {
            a[(2 * i, c)] = hp[c];
            a[(2 * i, 8 + c)] = -xn.x * hp[c];
            a[(2 * i + 1, 4 + c)] = hp[c];
            a[(2 * i + 1, 8 + c)] = -xn.y * hp[c];
        }
    }
    let v = null_vector(&a)?;
    let m = Matrix3::new(v[0], v[1], v[2], v[4], v[5], v[6], v[8], v[9], v[10]);
    let mut t = Vector3::new(v[3], v[7], v[11]);

    let (u, s, w) = svd3_sorted(&m)?;
    let mut scale = (s[0] + s[1] + s[2]) / 3.0;
    if scale <= 1e-12 {
        return None;
    }
    let mut r = u * w.transpose();
    if r.determinant() < 0.0 {
        r = -r;
        scale = -scale;
    }
    t /= scale;
    let pose = SE3::from_rt(&r, t);

    // Most points must end up in front of the camera, otherwise the sign is wrong.
    let in_front = points_w.iter().filter(|p| pose.transform_point(p).z > 0.0).count();
    (in_front * 2 > n).then_some(pose)
}

/// Counts correspondences reprojecting within `max_error_px`.
pub fn pnp_inliers(
    pose_cw: &SE3,
    points_w: &[Vector3<f64>],
    pixels: &[Vector2<f64>],
    camera: &CameraModel,
    max_error_px: f64,
) -> Vec<bool> {
    let th2 = max_error_px * max_error_px;
    points_w
        .iter()
        .zip(pixels)
        .map(|(p, px)| {
            camera
                .project(&pose_cw.transform_point(p))
                .is_some_and(|proj| (proj - px).norm_squared() <= th2)
        })
        .collect()
}

/// RANSAC over the linear solver, refitting on all inliers at the end.
pub fn solve_pnp_ransac(
    points_w: &[Vector3<f64>],
    pixels: &[Vector2<f64>],
    camera: &CameraModel,
    max_error_px: f64,
    params: &RansacParams,
    rng: &mut StdRng,
) -> Option<PnPResult> {
    let best = ransac::run(
        points_w.len(),
        PNP_SAMPLE_SIZE,
        params,
        rng,
        |s| {
            let pts: Vec<_> = s.iter().map(|&i| points_w[i]).collect();
            let pxs: Vec<_> = s.iter().map(|&i| pixels[i]).collect();
            solve_pnp_dlt(&pts, &pxs, camera)
        },
        |pose| {
            let mask = pnp_inliers(pose, points_w, pixels, camera, max_error_px);
            let score = mask.iter().filter(|&&m| m).count() as f64;
            (mask, score)
        },
    )?;

    let mut result = PnPResult {
        pose_cw: best.model,
        num_inliers: best.num_inliers,
        inliers: best.inliers,
    };
    let (pts, pxs): (Vec<_>, Vec<_>) = points_w
        .iter()
        .zip(pixels)
        .zip(&result.inliers)
        .filter_map(|((p, px), &inl)| inl.then_some((*p, *px)))
        .unzip();
    if let Some(refit) = solve_pnp_dlt(&pts, &pxs, camera) {
        let mask = pnp_inliers(&refit, points_w, pixels, camera, max_error_px);
        let count = mask.iter().filter(|&&m| m).count();
        if count >= result.num_inliers {
            result = PnPResult {
                pose_cw: refit,
                inliers: mask,
                num_inliers: count,
            };
        }
    }
    Some(result)
}
