//! Two-view geometry: homography and fundamental matrix estimation,
//! their decompositions into relative motion, and the reconstruction used
//! to bootstrap a monocular map.
//!
//! Both models are fitted with seeded RANSAC on Hartley-normalized
//! coordinates and scored with χ² gated residuals in both images. The
//! homography wins when it explains the data clearly better (planar or
//! low-parallax scenes); the motion is then picked among the candidate
//! decompositions by a cheirality and reprojection vote.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use super::linalg::{null_vector, svd3_sorted};
use super::ransac::{self, RansacOutcome, RansacParams};
use super::triangulation::triangulate_dlt;
use super::{CameraModel, SE3};
use crate::error::InitializationError;

/// χ² (2 DOF, 95%) gate for point-to-point transfer.
pub const CHI2_TWO_DOF: f64 = 5.991;
/// χ² (1 DOF, 95%) gate for point-to-line distance.
pub const CHI2_ONE_DOF: f64 = 3.841;

/// Rays closer than this are treated as parallel.
const PARALLEL_RAYS_COS: f64 = 0.99998;

/// Which model explained the correspondences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwoViewModel {
    Homography,
    Fundamental,
}

/// Hartley normalization: zero mean and unit mean absolute deviation.
pub fn normalize_points(pts: &[Vector2<f64>]) -> (Vec<Vector2<f64>>, Matrix3<f64>) {
    let n = pts.len().max(1) as f64;
    let mean = pts.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let (mut dev_x, mut dev_y) = (0.0, 0.0);
    for p in pts {
        dev_x += (p.x - mean.x).abs();
        dev_y += (p.y - mean.y).abs();
    }
    let sx = if dev_x > 0.0 { n / dev_x } else { 1.0 };
    let sy = if dev_y > 0.0 { n / dev_y } else { 1.0 };
    let normalized = pts
        .iter()
        .map(|p| Vector2::new((p.x - mean.x) * sx, (p.y - mean.y) * sy))
        .collect();
    let t = Matrix3::new(sx, 0.0, -mean.x * sx, 0.0, sy, -mean.y * sy, 0.0, 0.0, 1.0);
    (normalized, t)
}

/// Homography `H21` (x2 ~ H21 x1) from at least four correspondences.
pub fn homography_dlt(p1: &[Vector2<f64>], p2: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let n = p1.len();
    if n < 4 || n != p2.len() {
        return None;
    }
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (x1, x2)) in p1.iter().zip(p2).enumerate() {
        let (u1, v1, u2, v2) = (x1.x, x1.y, x2.x, x2.y);
        let r0 = [0.0, 0.0, 0.0, -u1, -v1, -1.0, v2 * u1, v2 * v1, v2];
        let r1 = [u1, v1, 1.0, 0.0, 0.0, 0.0, -u2 * u1, -u2 * v1, -u2];
        for c in 0..9 {
            a[(2 * i, c)] = r0[c];
            a[(2 * i + 1, c)] = r1[c];
        }
    }
    let h = null_vector(&a)?;
    Some(Matrix3::from_row_slice(h.as_slice()))
}

/// Fundamental matrix `F21` (x2ᵀ F21 x1 = 0) from at least eight
/// correspondences, with the rank-2 constraint enforced.
pub fn fundamental_8pt(p1: &[Vector2<f64>], p2: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let n = p1.len();
    if n < 8 || n != p2.len() {
        return None;
    }
    let mut a = DMatrix::<f64>::zeros(n, 9);
    for (i, (x1, x2)) in p1.iter().zip(p2).enumerate() {
        let (u1, v1, u2, v2) = (x1.x, x1.y, x2.x, x2.y);
        let row = [u2 * u1, u2 * v1, u2, v2 * u1, v2 * v1, v2, u1, v1, 1.0];
        for c in 0..9 {
            a[(i, c)] = row[c];
        }
    }
    let f = null_vector(&a)?;
    let f_pre = Matrix3::from_row_slice(f.as_slice());
    let (u, mut s, v) = svd3_sorted(&f_pre)?;
    s[2] = 0.0;
    Some(u * Matrix3::from_diagonal(&s) * v.transpose())
}

#[inline]
fn transfer(h: &Matrix3<f64>, p: &Vector2<f64>) -> Option<Vector2<f64>> {
    let q = h * Vector3::new(p.x, p.y, 1.0);
    (q.z.abs() > 1e-12).then(|| Vector2::new(q.x / q.z, q.y / q.z))
}

/// Scores a homography with the symmetric transfer error.
///
/// Returns the inlier mask and the score Σ (χ²_gate - χ²) over inlier
/// residuals in both images.
pub fn check_homography(
    h21: &Matrix3<f64>,
    p1: &[Vector2<f64>],
    p2: &[Vector2<f64>],
    sigma: f64,
) -> (Vec<bool>, f64) {
    let Some(h12) = h21.try_inverse() else {
        return (vec![false; p1.len()], 0.0);
    };
    let inv_sigma2 = 1.0 / (sigma * sigma);
    let mut score = 0.0;
    let mask = p1
        .iter()
        .zip(p2)
        .map(|(x1, x2)| {
            let chi2 = transfer(h21, x1).map(|x| (x2 - x).norm_squared() * inv_sigma2);
            let chi1 = transfer(&h12, x2).map(|x| (x1 - x).norm_squared() * inv_sigma2);
            match (chi1, chi2) {
                (Some(c1), Some(c2)) if c1 <= CHI2_TWO_DOF && c2 <= CHI2_TWO_DOF => {
                    score += 2.0 * CHI2_TWO_DOF - c1 - c2;
                    true
                }
                _ => false,
            }
        })
        .collect();
    (mask, score)
}

/// Scores a fundamental matrix with point-to-epipolar-line distances in
/// both images. Same scoring scheme as [`check_homography`].
pub fn check_fundamental(
    f21: &Matrix3<f64>,
    p1: &[Vector2<f64>],
    p2: &[Vector2<f64>],
    sigma: f64,
) -> (Vec<bool>, f64) {
    let inv_sigma2 = 1.0 / (sigma * sigma);
    let mut score = 0.0;
    let mask = p1
        .iter()
        .zip(p2)
        .map(|(x1, x2)| {
            let h1 = Vector3::new(x1.x, x1.y, 1.0);
            let h2 = Vector3::new(x2.x, x2.y, 1.0);
            // Epipolar line of x1 in image 2, and of x2 in image 1.
            let l2 = f21 * h1;
            let l1 = f21.transpose() * h2;
            let num = h2.dot(&l2);
            let d2 = l2.x * l2.x + l2.y * l2.y;
            let d1 = l1.x * l1.x + l1.y * l1.y;
            if d1 <= 0.0 || d2 <= 0.0 {
                return false;
            }
            let chi2 = num * num / d2 * inv_sigma2;
            let chi1 = num * num / d1 * inv_sigma2;
            if chi1 > CHI2_ONE_DOF || chi2 > CHI2_ONE_DOF {
                return false;
            }
            score += 2.0 * CHI2_TWO_DOF - chi1 - chi2;
            true
        })
        .collect();
    (mask, score)
}

fn gather(points: &[Vector2<f64>], idx: &[usize]) -> Vec<Vector2<f64>> {
    idx.iter().map(|&i| points[i]).collect()
}

/// RANSAC homography in pixel coordinates.
pub fn find_homography(
    p1: &[Vector2<f64>],
    p2: &[Vector2<f64>],
    sigma: f64,
    params: &RansacParams,
    rng: &mut StdRng,
) -> Option<RansacOutcome<Matrix3<f64>>> {
    let (n1, t1) = normalize_points(p1);
    let (n2, t2) = normalize_points(p2);
    let t2_inv = t2.try_inverse()?;
    let mut best = ransac::run(
        p1.len(),
        4,
        params,
        rng,
        |s| homography_dlt(&gather(&n1, s), &gather(&n2, s)).map(|hn| t2_inv * hn * t1),
        |h| check_homography(h, p1, p2, sigma),
    )?;
    let idx = inlier_indices(&best.inliers);
    if let Some(hn) = homography_dlt(&gather(&n1, &idx), &gather(&n2, &idx)) {
        let h = t2_inv * hn * t1;
        let (mask, score) = check_homography(&h, p1, p2, sigma);
        adopt_if_better(&mut best, h, mask, score);
    }
    Some(best)
}

/// RANSAC fundamental matrix in pixel coordinates.
pub fn find_fundamental(
    p1: &[Vector2<f64>],
    p2: &[Vector2<f64>],
    sigma: f64,
    params: &RansacParams,
    rng: &mut StdRng,
) -> Option<RansacOutcome<Matrix3<f64>>> {
    let (n1, t1) = normalize_points(p1);
    let (n2, t2) = normalize_points(p2);
    let mut best = ransac::run(
        p1.len(),
        8,
        params,
        rng,
        |s| fundamental_8pt(&gather(&n1, s), &gather(&n2, s)).map(|fn_| t2.transpose() * fn_ * t1),
        |f| check_fundamental(f, p1, p2, sigma),
    )?;
    let idx = inlier_indices(&best.inliers);
    if let Some(fn_) = fundamental_8pt(&gather(&n1, &idx), &gather(&n2, &idx)) {
        let f = t2.transpose() * fn_ * t1;
        let (mask, score) = check_fundamental(&f, p1, p2, sigma);
        adopt_if_better(&mut best, f, mask, score);
    }
    Some(best)
}

fn inlier_indices(mask: &[bool]) -> Vec<usize> {
    mask.iter().enumerate().filter_map(|(i, &m)| m.then_some(i)).collect()
}

/// Replaces the minimal-sample model with the all-inlier refit when it scores at least as well.
fn adopt_if_better(best: &mut RansacOutcome<Matrix3<f64>>, model: Matrix3<f64>, mask: Vec<bool>, score: f64) {
    if score >= best.score {
        best.num_inliers = mask.iter().filter(|&&m| m).count();
        best.model = model;
        best.inliers = mask;
        best.score = score;
    }
}

/// The four (R, t) candidates of an essential matrix.
pub fn decompose_essential(e: &Matrix3<f64>) -> Option<[(Matrix3<f64>, Vector3<f64>); 4]> {
    let (u, _, v) = svd3_sorted(e)?;
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let mut r1 = u * w * v.transpose();
    let mut r2 = u * w.transpose() * v.transpose();
    if r1.determinant() < 0.0 {
        r1 = -r1;
    }
    if r2.determinant() < 0.0 {
        r2 = -r2;
    }
    let t = u.column(2).normalize();
    Some([(r1, t), (r1, -t), (r2, t), (r2, -t)])
}

/// The eight motion hypotheses of a calibrated homography (Faugeras).
///
/// Returns `(R21, t21)` pairs with unit-norm translation. Empty when the
/// singular values are too close to tell the solutions apart.
pub fn decompose_homography(h21: &Matrix3<f64>, camera: &CameraModel) -> Vec<(Matrix3<f64>, Vector3<f64>)> {
    let a = camera.k_inverse() * h21 * camera.k_matrix();
    let Some((u, w, v)) = svd3_sorted(&a) else {
        return Vec::new();
    };
    let vt = v.transpose();
    let s = u.determinant() * vt.determinant();
    let (d1, d2, d3) = (w[0], w[1], w[2]);
    if d1 / d2 < 1.00001 || d2 / d3 < 1.00001 {
        return Vec::new();
    }

    let aux1 = ((d1 * d1 - d2 * d2) / (d1 * d1 - d3 * d3)).sqrt();
    let aux3 = ((d2 * d2 - d3 * d3) / (d1 * d1 - d3 * d3)).sqrt();
    let x1 = [aux1, aux1, -aux1, -aux1];
    let x3 = [aux3, -aux3, aux3, -aux3];

    let mut hypotheses = Vec::with_capacity(8);

    // d' = d2
    let aux_stheta = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 + d3) * d2);
    let ctheta = (d2 * d2 + d1 * d3) / ((d1 + d3) * d2);
    let stheta = [aux_stheta, -aux_stheta, -aux_stheta, aux_stheta];
    for i in 0..4 {
        let rp = Matrix3::new(ctheta, 0.0, -stheta[i], 0.0, 1.0, 0.0, stheta[i], 0.0, ctheta);
        let r = s * u * rp * vt;
        let tp = Vector3::new(x1[i], 0.0, -x3[i]) * (d1 - d3);
        hypotheses.push((r, (u * tp).normalize()));
    }

    // d' = -d2
    let aux_sphi = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 - d3) * d2);
    let cphi = (d1 * d3 - d2 * d2) / ((d1 - d3) * d2);
    let sphi = [aux_sphi, -aux_sphi, -aux_sphi, aux_sphi];
    for i in 0..4 {
        let rp = Matrix3::new(cphi, 0.0, sphi[i], 0.0, -1.0, 0.0, sphi[i], 0.0, -cphi);
        let r = s * u * rp * vt;
        let tp = Vector3::new(x1[i], 0.0, x3[i]) * (d1 + d3);
        hypotheses.push((r, (u * tp).normalize()));
    }
    hypotheses
}

/// Outcome of the cheirality vote for one motion hypothesis.
#[derive(Debug, Clone)]
pub struct CheiralityCheck {
    pub num_good: usize,
    /// Triangulated point (reference camera frame) per correspondence.
    pub points: Vec<Option<Vector3<f64>>>,
    /// Parallax in degrees over the well-conditioned points.
    pub parallax_deg: f64,
}

/// Triangulates all inliers under `(R21, t21)` and counts the points in
/// front of both cameras that reproject within `th2` (squared pixels).
pub fn check_rt(
    r: &Matrix3<f64>,
    t: &Vector3<f64>,
    p1: &[Vector2<f64>],
    p2: &[Vector2<f64>],
    inliers: &[bool],
    camera: &CameraModel,
    th2: f64,
) -> CheiralityCheck {
    let pose1 = SE3::identity();
    let pose2 = SE3::from_rt(r, *t);
    let o2 = pose2.camera_center();

    let mut points = vec![None; p1.len()];
    let mut cos_parallaxes = Vec::new();
    let mut num_good = 0;

    for i in 0..p1.len() {
        if !inliers[i] {
            continue;
        }
        let Some(p) = triangulate_dlt(&camera.normalize(&p1[i]), &camera.normalize(&p2[i]), &pose1, &pose2)
        else {
            continue;
        };
        let n1 = p;
        let n2 = p - o2;
        let cos_parallax = n1.dot(&n2) / (n1.norm() * n2.norm());

        if p.z <= 0.0 && cos_parallax < PARALLEL_RAYS_COS {
            continue;
        }
        let p_c2 = pose2.transform_point(&p);
        if p_c2.z <= 0.0 && cos_parallax < PARALLEL_RAYS_COS {
            continue;
        }
        let (Some(proj1), Some(proj2)) = (camera.project(&p), camera.project(&p_c2)) else {
            continue;
        };
        if (proj1 - p1[i]).norm_squared() > th2 || (proj2 - p2[i]).norm_squared() > th2 {
            continue;
        }

        cos_parallaxes.push(cos_parallax);
        num_good += 1;
        if cos_parallax < PARALLEL_RAYS_COS {
            points[i] = Some(p);
        }
    }

    let parallax_deg = if cos_parallaxes.is_empty() {
        0.0
    } else {
        cos_parallaxes.sort_by(|a, b| a.total_cmp(b));
        let idx = 50.min(cos_parallaxes.len() - 1);
        cos_parallaxes[idx].clamp(-1.0, 1.0).acos().to_degrees()
    };

    CheiralityCheck {
        num_good,
        points,
        parallax_deg,
    }
}

/// Parameters of the two-view reconstruction.
#[derive(Debug, Clone, Copy)]
pub struct TwoViewParams {
    /// Pixel noise sigma used by the model scores.
    pub sigma: f64,
    pub min_parallax_deg: f64,
    pub min_triangulated: usize,
    pub ransac: RansacParams,
    pub seed: u64,
}

impl Default for TwoViewParams {
    fn default() -> Self {
        Self {
            sigma: 1.0,
            min_parallax_deg: 1.0,
            min_triangulated: 50,
            ransac: RansacParams {
                max_iterations: 200,
                confidence: 0.99,
            },
            seed: 42,
        }
    }
}

/// Relative motion and structure recovered from two views.
#[derive(Debug, Clone)]
pub struct TwoViewReconstruction {
    pub model: TwoViewModel,
    /// Rotation taking reference-camera coordinates to current-camera coordinates.
    pub rotation: Matrix3<f64>,
    /// Unit-norm translation, same convention as `rotation`.
    pub translation: Vector3<f64>,
    /// Triangulated point per correspondence in the reference camera frame.
    pub points: Vec<Option<Vector3<f64>>>,
    pub num_triangulated: usize,
    pub parallax_deg: f64,
}

/// Bootstraps relative motion and structure from pixel correspondences.
pub fn reconstruct(
    p1: &[Vector2<f64>],
    p2: &[Vector2<f64>],
    camera: &CameraModel,
    params: &TwoViewParams,
) -> Result<TwoViewReconstruction, InitializationError> {
    let mut rng = StdRng::seed_from_u64(params.seed);
    let homography = find_homography(p1, p2, params.sigma, &params.ransac, &mut rng);
    let fundamental = find_fundamental(p1, p2, params.sigma, &params.ransac, &mut rng);

    let score_h = homography.as_ref().map_or(0.0, |h| h.score);
    let score_f = fundamental.as_ref().map_or(0.0, |f| f.score);
    if score_h + score_f <= 0.0 {
        return Err(InitializationError::NoModel);
    }
    let ratio_h = score_h / (score_h + score_f);
    debug!("[TwoView] score_h={:.1} score_f={:.1} ratio_h={:.2}", score_h, score_f, ratio_h);

    let th2 = 4.0 * params.sigma * params.sigma;
    match (homography, fundamental) {
        (Some(h), _) if ratio_h > 0.40 => reconstruct_from_homography(&h, p1, p2, camera, params, th2),
        (_, Some(f)) => reconstruct_from_fundamental(&f, p1, p2, camera, params, th2),
        (Some(h), None) => reconstruct_from_homography(&h, p1, p2, camera, params, th2),
        (None, None) => Err(InitializationError::NoModel),
    }
}

fn reconstruct_from_homography(
    h: &RansacOutcome<Matrix3<f64>>,
    p1: &[Vector2<f64>],
    p2: &[Vector2<f64>],
    camera: &CameraModel,
    params: &TwoViewParams,
    th2: f64,
) -> Result<TwoViewReconstruction, InitializationError> {
    let hypotheses = decompose_homography(&h.model, camera);
    if hypotheses.is_empty() {
        return Err(InitializationError::NoModel);
    }
    let mut checks: Vec<(usize, CheiralityCheck)> = hypotheses
        .iter()
        .enumerate()
        .map(|(i, (r, t))| (i, check_rt(r, t, p1, p2, &h.inliers, camera, th2)))
        .collect();
    checks.sort_by(|a, b| b.1.num_good.cmp(&a.1.num_good).then(a.0.cmp(&b.0)));

    let (best_idx, best) = &checks[0];
    let second_good = checks.get(1).map_or(0, |c| c.1.num_good);
    let required = params
        .min_triangulated
        .max((0.9 * h.num_inliers as f64).ceil() as usize);

    if (second_good as f64) >= 0.75 * best.num_good as f64 {
        return Err(InitializationError::Ambiguous);
    }
    if best.num_good < required {
        return Err(InitializationError::TooFewTriangulated {
            found: best.num_good,
            required,
        });
    }
    if best.parallax_deg < params.min_parallax_deg {
        return Err(InitializationError::InsufficientParallax {
            parallax_deg: best.parallax_deg,
            required_deg: params.min_parallax_deg,
        });
    }
    let (r, t) = hypotheses[*best_idx];
    Ok(finish(TwoViewModel::Homography, r, t, best.clone()))
}

fn reconstruct_from_fundamental(
    f: &RansacOutcome<Matrix3<f64>>,
    p1: &[Vector2<f64>],
    p2: &[Vector2<f64>],
    camera: &CameraModel,
    params: &TwoViewParams,
    th2: f64,
) -> Result<TwoViewReconstruction, InitializationError> {
    let k = camera.k_matrix();
    let e = k.transpose() * f.model * k;
    let candidates = decompose_essential(&e).ok_or(InitializationError::NoModel)?;
    let checks: Vec<CheiralityCheck> = candidates
        .iter()
        .map(|(r, t)| check_rt(r, t, p1, p2, &f.inliers, camera, th2))
        .collect();

    let max_good = checks.iter().map(|c| c.num_good).max().unwrap_or(0);
    let required = params
        .min_triangulated
        .max((0.9 * f.num_inliers as f64).ceil() as usize);
    if max_good < required {
        return Err(InitializationError::TooFewTriangulated {
            found: max_good,
            required,
        });
    }
    let similar = checks
        .iter()
        .filter(|c| c.num_good as f64 > 0.7 * max_good as f64)
        .count();
    if similar > 1 {
        return Err(InitializationError::Ambiguous);
    }
    let best_idx = checks
        .iter()
        .position(|c| c.num_good == max_good)
        .ok_or(InitializationError::NoModel)?;
    let best = &checks[best_idx];
    if best.parallax_deg < params.min_parallax_deg {
        return Err(InitializationError::InsufficientParallax {
            parallax_deg: best.parallax_deg,
            required_deg: params.min_parallax_deg,
        });
    }
    let (r, t) = candidates[best_idx];
    Ok(finish(TwoViewModel::Fundamental, r, t, best.clone()))
}

fn finish(model: TwoViewModel, r: Matrix3<f64>, t: Vector3<f64>, check: CheiralityCheck) -> TwoViewReconstruction {
    let num_triangulated = check.points.iter().filter(|p| p.is_some()).count();
    TwoViewReconstruction {
        model,
        rotation: r,
        translation: t,
        points: check.points,
        num_triangulated,
        parallax_deg: check.parallax_deg,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::se3::rotation_from_euler;
    use approx::assert_relative_eq;

    /// Projects `points` (world = reference camera) into both views.
    fn project_pair(pose2: &SE3, points: &[Vector3<f64>]) -> (Vec<Vector2<f64>>, Vec<Vector2<f64>>) {
        let cam = CameraModel::default();
        points
            .iter()
            .filter_map(|p| {
                let a = cam.project(p)?;
                let b = cam.project(&pose2.transform_point(p))?;
                (cam.in_image(&a, 0.0) && cam.in_image(&b, 0.0)).then_some((a, b))
            })
            .unzip()
    }

    fn planar_points() -> Vec<Vector3<f64>> {
        let mut pts = Vec::new();
        for i in 0..15 {
            for j in 0..12 {
                pts.push(Vector3::new(-0.8 + 0.11 * i as f64, -0.6 + 0.1 * j as f64, 2.0));
            }
        }
        pts
    }

    fn general_points() -> Vec<Vector3<f64>> {
        (0..200)
            .map(|i| {
                let f = i as f64;
                Vector3::new((f * 0.37).sin() * 0.9, (f * 0.91).cos() * 0.6, 2.0 + (f * 0.13).sin() * 0.8)
            })
            .collect()
    }

    #[test]
    fn test_homography_transfer_exact() {
        let pose2 = SE3::from_parts(rotation_from_euler(0.02, -0.03, 0.01), Vector3::new(-0.1, 0.02, 0.0));
        let (p1, p2) = project_pair(&pose2, &planar_points());
        let h = homography_dlt(&p1, &p2).expect("homography");
        let (mask, _) = check_homography(&h, &p1, &p2, 1.0);
        assert!(mask.iter().all(|&m| m));
    }

    #[test]
    fn test_fundamental_satisfies_epipolar_constraint() {
        let pose2 = SE3::from_parts(rotation_from_euler(0.05, -0.1, 0.02), Vector3::new(-0.3, 0.05, 0.02));
        let (p1, p2) = project_pair(&pose2, &general_points());
        let (n1, t1) = normalize_points(&p1);
        let (n2, t2) = normalize_points(&p2);
        let f = t2.transpose() * fundamental_8pt(&n1, &n2).expect("F") * t1;
        let (mask, _) = check_fundamental(&f, &p1, &p2, 1.0);
        assert!(mask.iter().all(|&m| m));
    }

    #[test]
    fn test_reconstruct_general_scene_recovers_motion() {
        let r_true = rotation_from_euler(0.03, -0.08, 0.02);
        let t_true = Vector3::new(-0.4, 0.05, 0.03);
        let pose2 = SE3::from_parts(r_true, t_true);
        let (p1, p2) = project_pair(&pose2, &general_points());
        let rec = reconstruct(&p1, &p2, &CameraModel::default(), &TwoViewParams::default()).expect("reconstruction");
        assert_eq!(rec.model, TwoViewModel::Fundamental);
        assert_relative_eq!(rec.translation, t_true.normalize(), epsilon = 1e-3);
        let angle = nalgebra::Rotation3::from_matrix_unchecked(rec.rotation)
            .angle_to(&r_true.to_rotation_matrix());
        assert!(angle < 1e-3);
    }

    #[test]
    fn test_reconstruct_planar_scene_uses_homography() {
        let t_true = Vector3::new(-0.1, 0.0, 0.0);
        let pose2 = SE3::from_parts(nalgebra::UnitQuaternion::identity(), t_true);
        let (p1, p2) = project_pair(&pose2, &planar_points());
        let rec = reconstruct(&p1, &p2, &CameraModel::default(), &TwoViewParams::default()).expect("reconstruction");
        assert_eq!(rec.model, TwoViewModel::Homography);
        assert_relative_eq!(rec.translation, t_true.normalize(), epsilon = 1e-3);
        assert!(rec.num_triangulated > 100);
    }

    #[test]
    fn test_pure_rotation_is_rejected() {
        let pose2 = SE3::from_parts(rotation_from_euler(0.0, 0.05, 0.0), Vector3::zeros());
        let (p1, p2) = project_pair(&pose2, &general_points());
        assert!(reconstruct(&p1, &p2, &CameraModel::default(), &TwoViewParams::default()).is_err());
    }
}
