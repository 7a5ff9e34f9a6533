//! Isosurface extraction from a synthetic spherical distance field.

use nalgebra::Vector3;

use rust_recon::fusion::{extract_mesh, Mesh, TsdfVolume};

fn sphere_volume(radius: f64, voxel: f64) -> TsdfVolume {
    let n = (2.0 * radius / voxel).ceil() as usize + 7;
    let origin = Vector3::repeat(-(n as f64 - 1.0) * voxel / 2.0);
    TsdfVolume::from_sdf(origin, [n, n, n], voxel, 3.0 * voxel, |p| p.norm() - radius)
}

/// Vertices expected on a surface of `area`: one per crossed grid edge.
/// The cell split has axis edges, three face diagonals and one body
/// diagonal, crossed on average 1.5, 3 · √2 / 2 and √3 / 2 times per voxel
/// face of surface.
fn expected_vertices(area: f64, voxel: f64) -> f64 {
    let per_area = 1.5 + 3.0 * std::f64::consts::FRAC_1_SQRT_2 + 3f64.sqrt() / 2.0;
    per_area * area / (voxel * voxel)
}

fn euler_characteristic(mesh: &Mesh) -> i64 {
    mesh.num_vertices() as i64 - mesh.edge_uses().len() as i64 + mesh.num_triangles() as i64
}

#[test]
fn sphere_mesh_is_closed_manifold() {
    let (radius, voxel) = (0.5, 0.05);
    let mesh = extract_mesh(&sphere_volume(radius, voxel), 0.5);

    assert!(mesh.is_closed_manifold());
    assert!(mesh.edge_uses().values().all(|&uses| uses == 2));
    assert_eq!(euler_characteristic(&mesh), 2);

    let area = 4.0 * std::f64::consts::PI * radius * radius;
    let expected = expected_vertices(area, voxel);
    let count = mesh.num_vertices() as f64;
    assert!(
        (0.6 * expected..=1.4 * expected).contains(&count),
        "{} vertices, expected about {:.0}",
        count,
        expected
    );
    assert!((mesh.surface_area() - area).abs() / area < 0.05);
}

#[test]
fn vertex_count_follows_resolution() {
    let coarse = extract_mesh(&sphere_volume(0.4, 0.08), 0.5);
    let fine = extract_mesh(&sphere_volume(0.4, 0.04), 0.5);
    assert!(coarse.is_closed_manifold());
    assert!(fine.is_closed_manifold());

    // Halving the voxel size quadruples the vertices.
    let ratio = fine.num_vertices() as f64 / coarse.num_vertices() as f64;
    assert!((3.0..5.0).contains(&ratio), "ratio {:.2}", ratio);
}
