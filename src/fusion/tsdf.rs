//! Truncated signed distance volume.
//!
//! A dense grid of samples at voxel centres. Each sample keeps a truncated
//! signed distance in [-1, 1] (positive in front of the surface, in units of
//! the truncation distance) and a confidence weight. Observations are fused
//! with a weighted running average. An observation on the other side of the
//! surface than the stored value takes weight away instead of adding it, so
//! voxels seen inconsistently fall below the extraction weight threshold.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::features::DepthImage;
use crate::geometry::{CameraModel, SE3};

/// Opposite-sign observations further apart than this (in truncation units)
/// contradict each other; closer ones are noise around the surface.
const CONFLICT_TOLERANCE: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Edge length of a voxel in map units.
    pub voxel_size: f64,
    /// Truncation distance in map units.
    pub truncation: f64,
    /// Weight cap per voxel; bounds how slowly old observations fade.
    pub max_weight: f32,
    /// Voxels with less weight are treated as unobserved by extraction.
    pub min_weight: f32,
    /// Depth pixels sampled every `depth_stride` pixels for the bounds.
    pub depth_stride: usize,
    pub min_depth: f64,
    pub max_depth: f64,
    /// Grids are coarsened until they fit this many voxels.
    pub max_voxels: usize,
    /// Fraction of bounds excluded on each side as outliers.
    pub bounds_quantile: f64,
    pub texture: bool,
    /// Texels per triangle pair cell in the texture atlas.
    pub texture_patch: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            voxel_size: 0.02,
            truncation: 0.08,
            max_weight: 64.0,
            min_weight: 0.5,
            depth_stride: 4,
            min_depth: 0.1,
            max_depth: 10.0,
            max_voxels: 8_000_000,
            bounds_quantile: 0.02,
            texture: true,
            texture_patch: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TsdfVolume {
    origin: Vector3<f64>,
    voxel_size: f64,
    dims: [usize; 3],
    truncation: f64,
    max_weight: f32,
    tsdf: Vec<f32>,
    weight: Vec<f32>,
}

impl TsdfVolume {
    /// Empty volume whose first voxel centre is at `origin`.
    pub fn new(origin: Vector3<f64>, dims: [usize; 3], voxel_size: f64, truncation: f64, max_weight: f32) -> Self {
        let n = dims[0] * dims[1] * dims[2];
        Self {
            origin,
            voxel_size,
            dims,
            truncation: truncation.max(voxel_size),
            max_weight,
            tsdf: vec![1.0; n],
            weight: vec![0.0; n],
        }
    }

    /// Volume covering `[min, max]` plus the truncation band. The voxel size
    /// grows when the grid would exceed `config.max_voxels`.
    pub fn from_bounds(min: &Vector3<f64>, max: &Vector3<f64>, config: &FusionConfig) -> Option<Self> {
        if config.voxel_size <= 0.0 || !(min.iter().chain(max.iter()).all(|v| v.is_finite())) {
            return None;
        }
        let margin = Vector3::repeat(config.truncation + config.voxel_size);
        let lo = min - margin;
        let extent = (max + margin) - lo;
        if extent.iter().any(|e| *e <= 0.0) {
            return None;
        }
        let mut voxel_size = config.voxel_size;
        let dims = loop {
            let dims = [0, 1, 2].map(|a| (extent[a] / voxel_size).ceil() as usize + 1);
            if dims.iter().product::<usize>() <= config.max_voxels.max(8) {
                break dims;
            }
            voxel_size *= 1.25;
        };
        Some(Self::new(lo, dims, voxel_size, config.truncation, config.max_weight))
    }

    /// Volume sampled from a signed distance function (tests, synthetic data).
    pub fn from_sdf(
        origin: Vector3<f64>,
        dims: [usize; 3],
        voxel_size: f64,
        truncation: f64,
        sdf: impl Fn(&Vector3<f64>) -> f64,
    ) -> Self {
        let mut volume = Self::new(origin, dims, voxel_size, truncation, 1.0);
        for k in 0..dims[2] {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    let idx = volume.index(i, j, k);
                    let d = sdf(&volume.voxel_center(i, j, k)) / volume.truncation;
                    volume.tsdf[idx] = d.clamp(-1.0, 1.0) as f32;
                    volume.weight[idx] = 1.0;
                }
            }
        }
        volume
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn voxel_size(&self) -> f64 {
        self.voxel_size
    }

    pub fn truncation(&self) -> f64 {
        self.truncation
    }

    pub fn num_voxels(&self) -> usize {
        self.tsdf.len()
    }

    pub fn num_observed(&self) -> usize {
        self.weight.iter().filter(|w| **w > 0.0).count()
    }

    #[inline]
    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        (k * self.dims[1] + j) * self.dims[0] + i
    }

    #[inline]
    pub fn voxel_center(&self, i: usize, j: usize, k: usize) -> Vector3<f64> {
        self.origin + Vector3::new(i as f64, j as f64, k as f64) * self.voxel_size
    }

    /// Normalised signed distance and weight of a voxel.
    #[inline]
    pub fn sample(&self, i: usize, j: usize, k: usize) -> (f32, f32) {
        let idx = self.index(i, j, k);
        (self.tsdf[idx], self.weight[idx])
    }

    /// Nearest voxel to a world position.
    pub fn voxel_of(&self, p: &Vector3<f64>) -> Option<[usize; 3]> {
        let rel = (p - self.origin) / self.voxel_size;
        let mut out = [0usize; 3];
        for a in 0..3 {
            let v = rel[a].round();
            if v < 0.0 || v >= self.dims[a] as f64 {
                return None;
            }
            out[a] = v as usize;
        }
        Some(out)
    }

    /// Fuses one observation into voxel `idx`. `sdf` is in map units.
    fn fuse(&mut self, idx: usize, sdf: f64, w: f32) {
        let d = (sdf / self.truncation).clamp(-1.0, 1.0) as f32;
        let (old_d, old_w) = (self.tsdf[idx], self.weight[idx]);
        self.tsdf[idx] = (old_d * old_w + d * w) / (old_w + w);
        let conflict = old_w > 0.0 && old_d * d < 0.0 && (old_d - d).abs() > CONFLICT_TOLERANCE;
        self.weight[idx] = if conflict {
            (old_w - w).max(0.0)
        } else {
            (old_w + w).min(self.max_weight)
        };
    }

    /// Projective integration of a depth image taken at `pose_cw`.
    ///
    /// Every voxel in front of the camera is projected into the image; the
    /// signed distance is measured along the optical axis. Voxels further
    /// than the truncation behind the observed surface are left untouched.
    pub fn integrate_depth(&mut self, depth: &DepthImage, pose_cw: &SE3, camera: &CameraModel, min_depth: f64, max_depth: f64) -> usize {
        let mut updated = 0;
        for k in 0..self.dims[2] {
            for j in 0..self.dims[1] {
                for i in 0..self.dims[0] {
                    let p_c = pose_cw.transform_point(&self.voxel_center(i, j, k));
                    if p_c.z <= min_depth {
                        continue;
                    }
                    let Some(mut px) = camera.project(&p_c) else { continue };
                    if camera.has_distortion() {
                        px = camera.distort(&px);
                    }
                    if px.x < 0.0 || px.y < 0.0 {
                        continue;
                    }
                    let Some(measured) = depth.get(px.x.round() as usize, px.y.round() as usize) else {
                        continue;
                    };
                    let measured = measured as f64;
                    if measured < min_depth || measured > max_depth {
                        continue;
                    }
                    let sdf = measured - p_c.z;
                    if sdf < -self.truncation {
                        continue;
                    }
                    let idx = self.index(i, j, k);
                    self.fuse(idx, sdf, 1.0);
                    updated += 1;
                }
            }
        }
        updated
    }

    /// Integrates surface points seen from `center` along their viewing rays.
    ///
    /// Used when no depth image is available: only the truncation band
    /// around each point is updated.
    pub fn integrate_points(&mut self, center: &Vector3<f64>, points: &[Vector3<f64>]) -> usize {
        let step = 0.5 * self.voxel_size;
        let mut updated = 0;
        for p in points {
            let ray = p - center;
            let range = ray.norm();
            if range <= self.truncation {
                continue;
            }
            let dir = ray / range;
            let mut visited: Vec<usize> = Vec::new();
            let mut t = -self.truncation;
            while t <= self.truncation {
                if let Some([i, j, k]) = self.voxel_of(&(p + dir * t)) {
                    let idx = self.index(i, j, k);
                    if !visited.contains(&idx) {
                        visited.push(idx);
                        // Signed distance of the voxel centre along the ray.
                        let sdf = (p - center).dot(&dir) - (self.voxel_center(i, j, k) - center).dot(&dir);
                        self.fuse(idx, sdf, 1.0);
                        updated += 1;
                    }
                }
                t += step;
            }
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_running_average_is_weighted() {
        let mut volume = TsdfVolume::new(Vector3::zeros(), [2, 2, 2], 0.1, 0.2, 10.0);
        volume.fuse(0, 0.1, 1.0);
        volume.fuse(0, 0.1, 1.0);
        volume.fuse(0, 0.04, 1.0);
        let (d, w) = volume.sample(0, 0, 0);
        assert_relative_eq!(d, (0.5 + 0.5 + 0.2) / 3.0, epsilon = 1e-6);
        assert_relative_eq!(w, 3.0);
    }

    #[test]
    fn test_contradiction_lowers_confidence() {
        let mut volume = TsdfVolume::new(Vector3::zeros(), [1, 1, 1], 0.1, 0.3, 10.0);
        volume.fuse(0, 0.1, 1.0);
        assert_relative_eq!(volume.sample(0, 0, 0).1, 1.0);
        // Same ray, surface now seen on the other side of the voxel.
        volume.fuse(0, -0.1, 1.0);
        assert_relative_eq!(volume.sample(0, 0, 0).1, 0.0);

        for _ in 0..3 {
            volume.fuse(0, 0.1, 1.0);
        }
        volume.fuse(0, -0.1, 1.0);
        let (d, w) = volume.sample(0, 0, 0);
        assert_relative_eq!(w, 2.0);
        assert!(d > 0.0);
    }

    #[test]
    fn test_noise_across_surface_adds_weight() {
        let mut volume = TsdfVolume::new(Vector3::zeros(), [1, 1, 1], 0.1, 0.2, 10.0);
        volume.fuse(0, 0.02, 1.0);
        volume.fuse(0, -0.02, 1.0);
        let (d, w) = volume.sample(0, 0, 0);
        assert_relative_eq!(w, 2.0);
        assert_relative_eq!(d, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_weight_is_capped() {
        let mut volume = TsdfVolume::new(Vector3::zeros(), [1, 1, 1], 0.1, 0.2, 2.0);
        for _ in 0..5 {
            volume.fuse(0, 0.0, 1.0);
        }
        assert_relative_eq!(volume.sample(0, 0, 0).1, 2.0);
    }

    #[test]
    fn test_depth_of_fronto_parallel_wall() {
        let camera = CameraModel::pinhole(100.0, 100.0, 32.0, 24.0, 64, 48);
        let depth = DepthImage::from_fn(64, 48, |_, _| 1.0);
        let mut volume = TsdfVolume::new(Vector3::new(-0.1, -0.1, 0.8), [3, 3, 9], 0.05, 0.1, 64.0);
        volume.integrate_depth(&depth, &SE3::identity(), &camera, 0.1, 5.0);

        // Voxel at z = 0.9 is 0.1 in front of the wall.
        let (d, w) = volume.sample(1, 1, 2);
        assert!(w > 0.0);
        assert_relative_eq!(d, 1.0, epsilon = 1e-5);
        // On the wall.
        let (d, _) = volume.sample(1, 1, 4);
        assert_relative_eq!(d, 0.0, epsilon = 1e-5);
        // Far behind the wall: never observed.
        assert_relative_eq!(volume.sample(1, 1, 8).1, 0.0);
    }

    #[test]
    fn test_bounds_are_coarsened_to_fit() {
        let config = FusionConfig {
            voxel_size: 0.001,
            max_voxels: 1000,
            ..FusionConfig::default()
        };
        let volume = TsdfVolume::from_bounds(&Vector3::zeros(), &Vector3::repeat(1.0), &config).unwrap();
        assert!(volume.num_voxels() <= 1000);
        assert!(volume.voxel_size() > 0.001);
    }
}
