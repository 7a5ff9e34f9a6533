//! Sim(3) similarity transforms.
//!
//! Monocular maps drift in scale as well as in pose, so loop correction
//! works with similarities: p' = s R p + t.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use super::{so3, SE3};

/// 7-DOF similarity transformation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        Self { rotation, translation, scale }
    }

    pub fn from_se3(se3: &SE3) -> Self {
        Self {
            rotation: se3.rotation,
            translation: se3.translation,
            scale: 1.0,
        }
    }

    /// Rigid pose carrying the same rotation and the scale-normalized translation.
    ///
    /// For `S_cw = [sR | t]` this returns `T_cw = [R | t/s]`, which maps world
    /// points expressed in the corrected frame into the camera.
    pub fn to_se3(&self) -> SE3 {
        SE3 {
            rotation: self.rotation,
            translation: self.translation / self.scale,
        }
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let scale_inv = 1.0 / self.scale;
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation) * scale_inv,
            scale: scale_inv,
        }
    }

    /// self ∘ other.
    pub fn compose(&self, other: &Sim3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.scale * (self.rotation * other.translation) + self.translation,
            scale: self.scale * other.scale,
        }
    }

    #[inline]
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    /// Tangent coordinates `[rotation vector, translation, ln s]`.
    ///
    /// This is the decoupled parametrization used by the pose graph; it is not
    /// the true sim(3) logarithm but it is a valid local chart around identity.
    pub fn log(&self) -> [f64; 7] {
        let w = so3::log(&self.rotation);
        [
            w.x,
            w.y,
            w.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.scale.ln(),
        ]
    }

    /// Inverse of [`Sim3::log`].
    pub fn exp(tangent: &[f64; 7]) -> Self {
        Self {
            rotation: so3::exp(&Vector3::new(tangent[0], tangent[1], tangent[2])),
            translation: Vector3::new(tangent[3], tangent[4], tangent[5]),
            scale: tangent[6].exp(),
        }
    }

    /// Right update `self ∘ exp(δ)`.
    pub fn retract(&self, delta: &[f64; 7]) -> Self {
        self.compose(&Self::exp(delta))
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}

/// Closed-form similarity aligning `src` onto `dst` (Umeyama 1991).
///
/// Returns `S` minimizing Σ |dst_i - S(src_i)|². With `fix_scale` the
/// scale is pinned to 1. Needs at least three non-collinear pairs.
pub fn align_umeyama(src: &[Vector3<f64>], dst: &[Vector3<f64>], fix_scale: bool) -> Option<Sim3> {
    let n = src.len();
    if n < 3 || n != dst.len() {
        return None;
    }
    let inv_n = 1.0 / n as f64;
    let mu_src = src.iter().fold(Vector3::zeros(), |acc, p| acc + p) * inv_n;
    let mu_dst = dst.iter().fold(Vector3::zeros(), |acc, p| acc + p) * inv_n;

    let mut cov = Matrix3::zeros();
    let mut var_src = 0.0;
    for (s, d) in src.iter().zip(dst) {
        let sc = s - mu_src;
        let dc = d - mu_dst;
        cov += dc * sc.transpose();
        var_src += sc.norm_squared();
    }
    cov *= inv_n;
    var_src *= inv_n;
    if var_src < 1e-12 {
        return None;
    }

    let svd = cov.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut d = Matrix3::identity();
    if (u * v_t).determinant() < 0.0 {
        d[(2, 2)] = -1.0;
    }
    let r = u * d * v_t;
    let scale = if fix_scale {
        1.0
    } else {
        (svd.singular_values.component_mul(&d.diagonal())).sum() / var_src
    };
    if !scale.is_finite() || scale <= 0.0 {
        return None;
    }
    let rotation = UnitQuaternion::from_rotation_matrix(&so3::orthonormalize(&r));
    let translation = mu_dst - scale * (rotation * mu_src);
    Some(Sim3 { rotation, translation, scale })
}
