//! Triangle mesh produced by dense fusion.

use std::collections::BTreeMap;

use nalgebra::{Vector2, Vector3};

/// RGB image, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<[u8; 3]>,
}

impl RgbImage {
    pub fn filled(width: usize, height: usize, color: [u8; 3]) -> Self {
        Self {
            width,
            height,
            data: vec![color; width * height],
        }
    }

    pub fn get(&self, x: usize, y: usize) -> Option<[u8; 3]> {
        (x < self.width && y < self.height).then(|| self.data[y * self.width + x])
    }

    pub fn set(&mut self, x: usize, y: usize, color: [u8; 3]) {
        if x < self.width && y < self.height {
            self.data[y * self.width + x] = color;
        }
    }
}

/// Texture atlas with per-corner texture coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshTexture {
    pub image: RgbImage,
    /// UVs in [0, 1] of each triangle's corners, aligned with `Mesh::triangles`.
    pub uvs: Vec<[Vector2<f64>; 3]>,
    /// Triangles with no keyframe seeing them, filled with a neutral colour.
    pub untextured: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Vector3<f64>>,
    /// Unit vertex normals pointing out of the surface.
    pub normals: Vec<Vector3<f64>>,
    /// Counter-clockwise seen from outside.
    pub triangles: Vec<[u32; 3]>,
    pub texture: Option<MeshTexture>,
}

impl Mesh {
    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_triangles(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// Unnormalised face normal (twice the area).
    pub fn face_normal(&self, t: usize) -> Vector3<f64> {
        let [a, b, c] = self.triangles[t].map(|i| self.vertices[i as usize]);
        (b - a).cross(&(c - a))
    }

    pub fn surface_area(&self) -> f64 {
        (0..self.triangles.len()).map(|t| 0.5 * self.face_normal(t).norm()).sum()
    }

    /// Number of triangles using each undirected edge.
    pub fn edge_uses(&self) -> BTreeMap<(u32, u32), usize> {
        let mut uses = BTreeMap::new();
        for tri in &self.triangles {
            for e in 0..3 {
                let (a, b) = (tri[e], tri[(e + 1) % 3]);
                *uses.entry((a.min(b), a.max(b))).or_insert(0) += 1;
            }
        }
        uses
    }

    /// Every edge is shared by exactly two triangles.
    pub fn is_closed_manifold(&self) -> bool {
        !self.triangles.is_empty() && self.edge_uses().values().all(|&n| n == 2)
    }

    pub fn bounds(&self) -> Option<(Vector3<f64>, Vector3<f64>)> {
        let first = *self.vertices.first()?;
        Some(self.vertices.iter().fold((first, first), |(lo, hi), v| (lo.inf(v), hi.sup(v))))
    }

    /// Recomputes vertex normals as area-weighted face normal averages.
    pub fn compute_normals(&mut self) {
        let mut normals = vec![Vector3::zeros(); self.vertices.len()];
        for t in 0..self.triangles.len() {
            let n = self.face_normal(t);
            for &i in &self.triangles[t] {
                normals[i as usize] += n;
            }
        }
        for n in &mut normals {
            let norm = n.norm();
            if norm > 1e-12 {
                *n /= norm;
            }
        }
        self.normals = normals;
    }
}
