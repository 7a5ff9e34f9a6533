//! Texture atlas for extracted meshes.
//!
//! Every triangle picks the keyframe that sees it most head-on and from the
//! smallest distance. Triangles are packed in pairs into square atlas cells:
//! the first triangle of a pair covers the lower-left half of the cell, the
//! second the upper-right half. Texels are filled by back-projecting their
//! surface point into the chosen keyframe image.

use nalgebra::{Vector2, Vector3};
use tracing::debug;

use super::mesh::{Mesh, MeshTexture, RgbImage};
use crate::geometry::CameraModel;
use crate::map::{KeyFrame, Map};

/// Colour of texels no keyframe observes.
const UNSEEN: [u8; 3] = [128, 128, 128];
/// Views more oblique than this (cosine to the face normal) are ignored.
const MIN_VIEW_COSINE: f64 = 0.1;

/// Projects `p_w` into a keyframe image in measured (distorted) pixels.
fn project_into(kf: &KeyFrame, camera: &CameraModel, p_w: &Vector3<f64>) -> Option<Vector2<f64>> {
    let px = camera.project(&kf.pose_cw.transform_point(p_w))?;
    let px = if camera.has_distortion() { camera.distort(&px) } else { px };
    camera.in_image(&px, 1.0).then_some(px)
}

/// Index into `views` of the best keyframe for triangle `t`.
fn best_view(mesh: &Mesh, t: usize, views: &[&KeyFrame], camera: &CameraModel) -> Option<usize> {
    let [a, b, c] = mesh.triangles[t].map(|i| mesh.vertices[i as usize]);
    let centroid = (a + b + c) / 3.0;
    let normal = mesh.face_normal(t).try_normalize(1e-12)?;

    let mut best: Option<(usize, f64)> = None;
    for (v, kf) in views.iter().enumerate() {
        if project_into(kf, camera, &centroid).is_none() {
            continue;
        }
        let to_camera = kf.camera_center() - centroid;
        let distance = to_camera.norm();
        if distance < 1e-9 {
            continue;
        }
        let cosine = normal.dot(&to_camera) / distance;
        if cosine < MIN_VIEW_COSINE {
            continue;
        }
        let score = cosine / distance;
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((v, score));
        }
    }
    best.map(|(v, _)| v)
}

/// Builds a texture atlas for `mesh` from the keyframe images in `map`.
///
/// `None` when the mesh is empty or no keyframe carries an image.
pub fn texture_mesh(mesh: &Mesh, map: &Map, camera: &CameraModel, patch: usize) -> Option<MeshTexture> {
    let views: Vec<&KeyFrame> = map.keyframes().filter(|kf| kf.image.is_some()).collect();
    if mesh.is_empty() || views.is_empty() {
        return None;
    }
    let patch = patch.max(2);
    let num_cells = mesh.num_triangles().div_ceil(2);
    let cells_per_row = (num_cells as f64).sqrt().ceil() as usize;
    let rows = num_cells.div_ceil(cells_per_row);
    let (width, height) = (cells_per_row * patch, rows * patch);
    let mut image = RgbImage::filled(width, height, UNSEEN);
    let mut uvs = Vec::with_capacity(mesh.num_triangles());
    let mut untextured = 0;

    for t in 0..mesh.num_triangles() {
        let cell = t / 2;
        let upper = t % 2 == 1;
        let (x0, y0) = ((cell % cells_per_row) * patch, (cell / cells_per_row) * patch);
        let uv = |s: f64, r: f64| {
            Vector2::new(
                (x0 as f64 + s * patch as f64) / width as f64,
                (y0 as f64 + r * patch as f64) / height as f64,
            )
        };
        uvs.push(if upper {
            [uv(1.0, 1.0), uv(0.0, 1.0), uv(1.0, 0.0)]
        } else {
            [uv(0.0, 0.0), uv(1.0, 0.0), uv(0.0, 1.0)]
        });

        let Some(view) = best_view(mesh, t, &views, camera) else {
            untextured += 1;
            continue;
        };
        let kf = views[view];
        let Some(gray) = kf.image.as_deref() else { continue };
        let [a, b, c] = mesh.triangles[t].map(|i| mesh.vertices[i as usize]);

        for dy in 0..patch {
            for dx in 0..patch {
                let s = (dx as f64 + 0.5) / patch as f64;
                let r = (dy as f64 + 0.5) / patch as f64;
                let p = match (upper, s + r <= 1.0) {
                    (false, true) => a * (1.0 - s - r) + b * s + c * r,
                    (true, false) => a * (s + r - 1.0) + b * (1.0 - s) + c * (1.0 - r),
                    _ => continue,
                };
                let Some(px) = project_into(kf, camera, &p) else { continue };
                if let Some(value) = gray.sample_bilinear(px.x, px.y) {
                    let g = value.round().clamp(0.0, 255.0) as u8;
                    image.set(x0 + dx, y0 + dy, [g, g, g]);
                }
            }
        }
    }

    debug!(
        "[Texture] {}x{} atlas for {} triangles ({} unseen)",
        width,
        height,
        mesh.num_triangles(),
        untextured
    );
    Some(MeshTexture { image, uvs, untextured })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::features::{GrayImage, ScaleLevels};
    use crate::geometry::SE3;
    use crate::map::KeyFrameSource;
    use crate::vocabulary::BowVector;

    fn square_facing_camera() -> Mesh {
        let mut mesh = Mesh {
            vertices: vec![
                Vector3::new(-0.2, -0.2, 1.0),
                Vector3::new(0.2, -0.2, 1.0),
                Vector3::new(0.2, 0.2, 1.0),
                Vector3::new(-0.2, 0.2, 1.0),
            ],
            // Counter-clockwise seen from the camera at the origin.
            triangles: vec![[0, 2, 1], [0, 3, 2]],
            ..Mesh::default()
        };
        mesh.compute_normals();
        mesh
    }

    fn map_with_view(value: u8) -> Map {
        let mut map = Map::new(ScaleLevels::new(1, 1.2));
        map.create_keyframe(KeyFrameSource {
            frame_id: 0,
            timestamp: 0.0,
            pose_cw: SE3::identity(),
            keypoints: Vec::new(),
            points: Vec::new(),
            descriptors: Vec::new(),
            bow: BowVector::default(),
            image: Some(Arc::new(GrayImage::filled(64, 48, value))),
            depth: None,
        });
        map
    }

    #[test]
    fn test_visible_triangles_take_image_colour() {
        let camera = CameraModel::pinhole(50.0, 50.0, 32.0, 24.0, 64, 48);
        let mesh = square_facing_camera();
        let texture = texture_mesh(&mesh, &map_with_view(200), &camera, 4).unwrap();

        assert_eq!(texture.untextured, 0);
        assert_eq!(texture.uvs.len(), 2);
        assert!(texture.image.data.iter().any(|c| *c == [200, 200, 200]));
        for uv in texture.uvs.iter().flatten() {
            assert!((0.0..=1.0).contains(&uv.x) && (0.0..=1.0).contains(&uv.y));
        }
    }

    #[test]
    fn test_back_facing_triangles_are_untextured() {
        let camera = CameraModel::pinhole(50.0, 50.0, 32.0, 24.0, 64, 48);
        let mut mesh = square_facing_camera();
        for tri in &mut mesh.triangles {
            tri.swap(1, 2);
        }
        let texture = texture_mesh(&mesh, &map_with_view(200), &camera, 4).unwrap();
        assert_eq!(texture.untextured, 2);
        assert!(texture.image.data.iter().all(|c| *c == UNSEEN));
    }
}
