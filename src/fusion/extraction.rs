//! Isosurface extraction at the zero crossing of a TSDF volume.
//!
//! Every cell between eight neighbouring voxel centres is split into six
//! tetrahedra around its main diagonal. All cells split their shared faces
//! along the same diagonal, so the pieces of surface produced in adjacent
//! cells meet edge to edge. Vertices are keyed by the grid edge they lie on
//! and shared between all cells touching that edge; a surface that does not
//! leave the observed volume is therefore closed and every edge is used by
//! exactly two triangles.

use std::collections::HashMap;

use nalgebra::Vector3;
use tracing::debug;

use super::mesh::Mesh;
use super::tsdf::TsdfVolume;

/// Cell corner offsets; bit 0 is x, bit 1 is y, bit 2 is z.
const CORNERS: [[usize; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [0, 1, 0],
    [1, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [0, 1, 1],
    [1, 1, 1],
];

/// Six tetrahedra sharing the 0-7 diagonal, one per axis ordering.
const TETRAHEDRA: [[usize; 4]; 6] = [
    [0, 1, 3, 7],
    [0, 1, 5, 7],
    [0, 2, 3, 7],
    [0, 2, 6, 7],
    [0, 4, 5, 7],
    [0, 4, 6, 7],
];

#[derive(Clone, Copy)]
struct Corner {
    node: usize,
    value: f64,
    position: Vector3<f64>,
}

struct Builder {
    mesh: Mesh,
    edge_vertices: HashMap<(usize, usize), u32>,
}

impl Builder {
    fn vertex_on_edge(&mut self, a: &Corner, b: &Corner) -> u32 {
        let (lo, hi) = if a.node < b.node { (a, b) } else { (b, a) };
        if let Some(&v) = self.edge_vertices.get(&(lo.node, hi.node)) {
            return v;
        }
        let t = lo.value / (lo.value - hi.value);
        let position = lo.position + (hi.position - lo.position) * t.clamp(0.0, 1.0);
        let v = self.mesh.vertices.len() as u32;
        self.mesh.vertices.push(position);
        self.edge_vertices.insert((lo.node, hi.node), v);
        v
    }

    /// Adds a triangle facing along `outward`.
    fn triangle(&mut self, mut tri: [u32; 3], outward: &Vector3<f64>) {
        let [a, b, c] = tri.map(|i| self.mesh.vertices[i as usize]);
        if (b - a).cross(&(c - a)).dot(outward) < 0.0 {
            tri.swap(1, 2);
        }
        self.mesh.triangles.push(tri);
    }

    fn tetrahedron(&mut self, corners: [Corner; 4]) {
        let (inside, outside): (Vec<Corner>, Vec<Corner>) = corners.iter().partition(|c| c.value < 0.0);
        if inside.is_empty() || outside.is_empty() {
            return;
        }
        let centroid = |cs: &[Corner]| cs.iter().map(|c| c.position).sum::<Vector3<f64>>() / cs.len() as f64;
        let outward = centroid(&outside) - centroid(&inside);

        match (inside.as_slice(), outside.as_slice()) {
            ([a], [b, c, d]) | ([b, c, d], [a]) => {
                let tri = [self.vertex_on_edge(a, b), self.vertex_on_edge(a, c), self.vertex_on_edge(a, d)];
                self.triangle(tri, &outward);
            }
            ([a, b], [c, d]) => {
                let ac = self.vertex_on_edge(a, c);
                let ad = self.vertex_on_edge(a, d);
                let bd = self.vertex_on_edge(b, d);
                let bc = self.vertex_on_edge(b, c);
                self.triangle([ac, ad, bd], &outward);
                self.triangle([ac, bd, bc], &outward);
            }
            _ => {}
        }
    }
}

/// Extracts the zero level set of `volume`.
///
/// Cells with a corner weighing less than `min_weight` are unobserved and
/// produce no surface.
pub fn extract_mesh(volume: &TsdfVolume, min_weight: f32) -> Mesh {
    let [nx, ny, nz] = volume.dims();
    let mut builder = Builder {
        mesh: Mesh::default(),
        edge_vertices: HashMap::new(),
    };
    if nx < 2 || ny < 2 || nz < 2 {
        return builder.mesh;
    }

    for k in 0..nz - 1 {
        for j in 0..ny - 1 {
            for i in 0..nx - 1 {
                let mut cell = [Corner {
                    node: 0,
                    value: 0.0,
                    position: Vector3::zeros(),
                }; 8];
                let mut observed = true;
                for (c, [dx, dy, dz]) in CORNERS.iter().enumerate() {
                    let (x, y, z) = (i + dx, j + dy, k + dz);
                    let (value, weight) = volume.sample(x, y, z);
                    if weight < min_weight || weight <= 0.0 {
                        observed = false;
                        break;
                    }
                    cell[c] = Corner {
                        node: volume.index(x, y, z),
                        value: value as f64,
                        position: volume.voxel_center(x, y, z),
                    };
                }
                if !observed {
                    continue;
                }
                let any_inside = cell.iter().any(|c| c.value < 0.0);
                let any_outside = cell.iter().any(|c| c.value >= 0.0);
                if !(any_inside && any_outside) {
                    continue;
                }
                for tet in &TETRAHEDRA {
                    builder.tetrahedron(tet.map(|c| cell[c]));
                }
            }
        }
    }

    let mut mesh = builder.mesh;
    mesh.compute_normals();
    debug!(
        "[Mesh] extracted {} vertices, {} triangles from {:?} voxels",
        mesh.num_vertices(),
        mesh.num_triangles(),
        volume.dims()
    );
    mesh
}
