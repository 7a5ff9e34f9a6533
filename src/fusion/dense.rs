//! Dense fusion of a map snapshot into a textured mesh.

use nalgebra::{Vector2, Vector3};
use tracing::{debug, info, warn};

use super::extraction::extract_mesh;
use super::mesh::Mesh;
use super::texture::texture_mesh;
use super::tsdf::{FusionConfig, TsdfVolume};
use crate::features::DepthImage;
use crate::geometry::{CameraModel, SE3};
use crate::map::{KeyFrame, Map};

/// Builds meshes from map snapshots. Never mutates the map.
#[derive(Debug, Clone)]
pub struct DenseFusion {
    camera: CameraModel,
    config: FusionConfig,
}

impl DenseFusion {
    pub fn new(camera: CameraModel, config: FusionConfig) -> Self {
        Self { camera, config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// World points of a depth image, every `stride` pixels.
    fn depth_points(&self, depth: &DepthImage, pose_cw: &SE3, stride: usize) -> Vec<Vector3<f64>> {
        let pose_wc = pose_cw.inverse();
        let mut points = Vec::new();
        for y in (0..depth.height()).step_by(stride.max(1)) {
            for x in (0..depth.width()).step_by(stride.max(1)) {
                let Some(d) = depth.get(x, y) else { continue };
                let d = d as f64;
                if d < self.config.min_depth || d > self.config.max_depth {
                    continue;
                }
                let px = self.camera.undistort(&Vector2::new(x as f64, y as f64));
                points.push(pose_wc.transform_point(&(self.camera.unproject(&px) * d)));
            }
        }
        points
    }

    fn observed_points(map: &Map, kf: &KeyFrame) -> Vec<Vector3<f64>> {
        kf.map_point_indices()
            .filter_map(|(_, mp_id)| map.map_point(mp_id).map(|mp| mp.position))
            .collect()
    }

    /// Per-axis bounds with `quantile` of the samples cut on each side.
    fn robust_bounds(samples: &[Vector3<f64>], quantile: f64) -> Option<(Vector3<f64>, Vector3<f64>)> {
        if samples.is_empty() {
            return None;
        }
        let mut lo = Vector3::zeros();
        let mut hi = Vector3::zeros();
        for axis in 0..3 {
            let mut values: Vec<f64> = samples.iter().map(|p| p[axis]).collect();
            values.sort_by(f64::total_cmp);
            let last = values.len() - 1;
            let cut = ((values.len() as f64 * quantile.clamp(0.0, 0.49)).floor() as usize).min(last);
            lo[axis] = values[cut];
            hi[axis] = values[last - cut];
        }
        Some((lo, hi))
    }

    /// Fuses every keyframe of `map` into a fresh volume.
    ///
    /// Keyframes with a depth image are integrated projectively; the others
    /// contribute their observed map points along the viewing rays. `None`
    /// when the map holds no geometry.
    pub fn integrate(&self, map: &Map) -> Option<TsdfVolume> {
        let mut samples = Vec::new();
        for kf in map.keyframes() {
            match &kf.depth {
                Some(depth) => samples.extend(self.depth_points(depth, &kf.pose_cw, self.config.depth_stride)),
                None => samples.extend(Self::observed_points(map, kf)),
            }
        }
        let (min, max) = Self::robust_bounds(&samples, self.config.bounds_quantile)?;
        let Some(mut volume) = TsdfVolume::from_bounds(&min, &max, &self.config) else {
            warn!("[Fusion] degenerate bounds {:?} .. {:?}", min, max);
            return None;
        };

        let mut updates = 0;
        for kf in map.keyframes() {
            updates += match &kf.depth {
                Some(depth) => volume.integrate_depth(depth, &kf.pose_cw, &self.camera, self.config.min_depth, self.config.max_depth),
                None => volume.integrate_points(&kf.camera_center(), &Self::observed_points(map, kf)),
            };
        }
        debug!(
            "[Fusion] {} keyframes, {} samples, {:?} voxels of {:.3}, {} updates",
            map.num_keyframes(),
            samples.len(),
            volume.dims(),
            volume.voxel_size(),
            updates
        );
        Some(volume)
    }

    /// Integrates `map`, extracts the surface and textures it.
    pub fn build(&self, map: &Map) -> Mesh {
        let Some(volume) = self.integrate(map) else {
            info!("[Fusion] nothing to fuse");
            return Mesh::default();
        };
        let mut mesh = extract_mesh(&volume, self.config.min_weight);
        if self.config.texture {
            mesh.texture = texture_mesh(&mesh, map, &self.camera, self.config.texture_patch);
        }
        info!(
            "[Fusion] mesh with {} vertices, {} triangles{}",
            mesh.num_vertices(),
            mesh.num_triangles(),
            if mesh.texture.is_some() { ", textured" } else { "" }
        );
        mesh
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use nalgebra::UnitQuaternion;

    use super::*;
    use crate::features::ScaleLevels;
    use crate::map::KeyFrameSource;
    use crate::vocabulary::BowVector;

    fn wall_map(camera: &CameraModel) -> Map {
        let mut map = Map::new(ScaleLevels::new(1, 1.2));
        for (i, x) in [-0.1, 0.0, 0.1].into_iter().enumerate() {
            let depth = DepthImage::from_fn(camera.width as usize, camera.height as usize, |_, _| 1.01);
            map.create_keyframe(KeyFrameSource {
                frame_id: i as u64,
                timestamp: i as f64,
                // Sideways translation keeps the wall at the same depth.
                pose_cw: SE3::from_parts(UnitQuaternion::identity(), Vector3::new(-x, 0.0, 0.0)),
                keypoints: Vec::new(),
                points: Vec::new(),
                descriptors: Vec::new(),
                bow: BowVector::default(),
                image: None,
                depth: Some(Arc::new(depth)),
            });
        }
        map
    }

    #[test]
    fn test_empty_map_builds_empty_mesh() {
        let camera = CameraModel::pinhole(40.0, 40.0, 20.0, 15.0, 40, 30);
        let fusion = DenseFusion::new(camera, FusionConfig::default());
        assert!(fusion.build(&Map::new(ScaleLevels::new(1, 1.2))).is_empty());
    }

    #[test]
    fn test_wall_from_depth() {
        let camera = CameraModel::pinhole(40.0, 40.0, 20.0, 15.0, 40, 30);
        let config = FusionConfig {
            voxel_size: 0.05,
            truncation: 0.15,
            ..FusionConfig::default()
        };
        let mesh = DenseFusion::new(camera, config).build(&wall_map(&camera));

        assert!(!mesh.is_empty());
        for v in &mesh.vertices {
            assert!((v.z - 1.01).abs() < 0.03, "vertex off the wall: {v:?}");
        }
        // Surface faces the cameras.
        let mean_normal: Vector3<f64> = mesh.normals.iter().sum();
        assert!(mean_normal.z < 0.0);
    }

    #[test]
    fn test_robust_bounds_ignore_outliers() {
        let mut samples: Vec<Vector3<f64>> = (0..100).map(|i| Vector3::repeat(i as f64 / 100.0)).collect();
        samples.push(Vector3::repeat(1000.0));
        let (lo, hi) = DenseFusion::robust_bounds(&samples, 0.02).unwrap();
        assert!(lo.x >= 0.0);
        assert!(hi.x < 1.0);
    }
}
