//! Point cloud, trajectory and mesh exports.
//!
//! Every format has a writer-based function (any `std::io::Write`) and a
//! `save_*` wrapper that creates the file.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::WriterBuilder;
use serde::Serialize;

use crate::fusion::{Mesh, RgbImage};
use crate::geometry::SE3;
use crate::map::PointCloud;

#[derive(Debug, Serialize)]
struct PointRow {
    id: u64,
    x: f64,
    y: f64,
    z: f64,
    r: u8,
    g: u8,
    b: u8,
    nx: f64,
    ny: f64,
    nz: f64,
    observations: usize,
}

/// Camera-to-world pose, Hamilton quaternion.
#[derive(Debug, Serialize)]
struct PoseRow {
    timestamp: f64,
    tx: f64,
    ty: f64,
    tz: f64,
    qx: f64,
    qy: f64,
    qz: f64,
    qw: f64,
}

pub fn write_point_cloud_csv<W: Write>(cloud: &PointCloud, writer: W) -> Result<()> {
    let mut csv = WriterBuilder::new().from_writer(writer);
    for p in &cloud.points {
        csv.serialize(PointRow {
            id: p.id.0,
            x: p.position.x,
            y: p.position.y,
            z: p.position.z,
            r: p.color[0],
            g: p.color[1],
            b: p.color[2],
            nx: p.normal.x,
            ny: p.normal.y,
            nz: p.normal.z,
            observations: p.observations,
        })?;
    }
    csv.flush()?;
    Ok(())
}

/// One row per `(timestamp, world-to-camera pose)`, written as the camera
/// position and orientation in the world.
pub fn write_trajectory_csv<W: Write>(poses: &[(f64, SE3)], writer: W) -> Result<()> {
    let mut csv = WriterBuilder::new().from_writer(writer);
    for (timestamp, pose_cw) in poses {
        let pose_wc = pose_cw.inverse();
        let q = pose_wc.rotation.quaternion();
        csv.serialize(PoseRow {
            timestamp: *timestamp,
            tx: pose_wc.translation.x,
            ty: pose_wc.translation.y,
            tz: pose_wc.translation.z,
            qx: q.i,
            qy: q.j,
            qz: q.k,
            qw: q.w,
        })?;
    }
    csv.flush()?;
    Ok(())
}

/// Wavefront OBJ. With `material`, texture coordinates are written and the
/// faces reference that material of `<material>.mtl`.
pub fn write_obj<W: Write>(mesh: &Mesh, material: Option<&str>, mut writer: W) -> Result<()> {
    writeln!(writer, "# {} vertices, {} triangles", mesh.num_vertices(), mesh.num_triangles())?;
    let texture = mesh.texture.as_ref().filter(|_| material.is_some());
    if let Some(name) = material.filter(|_| texture.is_some()) {
        writeln!(writer, "mtllib {}.mtl", name)?;
        writeln!(writer, "usemtl {}", name)?;
    }
    for v in &mesh.vertices {
        writeln!(writer, "v {:.6} {:.6} {:.6}", v.x, v.y, v.z)?;
    }
    let has_normals = mesh.normals.len() == mesh.vertices.len();
    if has_normals {
        for n in &mesh.normals {
            writeln!(writer, "vn {:.6} {:.6} {:.6}", n.x, n.y, n.z)?;
        }
    }
    if let Some(texture) = texture {
        // OBJ texture coordinates start at the bottom row.
        for uv in texture.uvs.iter().flatten() {
            writeln!(writer, "vt {:.6} {:.6}", uv.x, 1.0 - uv.y)?;
        }
    }
    for (t, tri) in mesh.triangles.iter().enumerate() {
        write!(writer, "f")?;
        for (c, &v) in tri.iter().enumerate() {
            let v = v + 1;
            match (texture.is_some(), has_normals) {
                (true, true) => write!(writer, " {}/{}/{}", v, 3 * t + c + 1, v)?,
                (true, false) => write!(writer, " {}/{}", v, 3 * t + c + 1)?,
                (false, true) => write!(writer, " {}//{}", v, v)?,
                (false, false) => write!(writer, " {}", v)?,
            }
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_mtl<W: Write>(material: &str, texture_file: &str, mut writer: W) -> Result<()> {
    writeln!(writer, "newmtl {}", material)?;
    writeln!(writer, "Ka 1.0 1.0 1.0")?;
    writeln!(writer, "Kd 1.0 1.0 1.0")?;
    writeln!(writer, "map_Kd {}", texture_file)?;
    writer.flush()?;
    Ok(())
}

/// Binary PPM (P6).
pub fn write_ppm<W: Write>(image: &RgbImage, mut writer: W) -> Result<()> {
    write!(writer, "P6\n{} {}\n255\n", image.width, image.height)?;
    let bytes: Vec<u8> = image.data.iter().flatten().copied().collect();
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

pub fn save_point_cloud<P: AsRef<Path>>(cloud: &PointCloud, path: P) -> Result<()> {
    let path = path.as_ref();
    write_point_cloud_csv(cloud, create(path)?).with_context(|| format!("Failed to write {}", path.display()))
}

pub fn save_trajectory<P: AsRef<Path>>(poses: &[(f64, SE3)], path: P) -> Result<()> {
    let path = path.as_ref();
    write_trajectory_csv(poses, create(path)?).with_context(|| format!("Failed to write {}", path.display()))
}

/// Writes `<stem>.obj` into `dir`, plus `<stem>.mtl` and `<stem>.ppm` when
/// the mesh is textured. Returns the written paths.
pub fn save_mesh<P: AsRef<Path>>(mesh: &Mesh, dir: P, stem: &str) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let obj_path = dir.join(format!("{stem}.obj"));
    let mut written = vec![obj_path.clone()];

    let material = mesh.texture.as_ref().map(|_| stem);
    write_obj(mesh, material, create(&obj_path)?).with_context(|| format!("Failed to write {}", obj_path.display()))?;

    if let Some(texture) = &mesh.texture {
        let ppm_name = format!("{stem}.ppm");
        let mtl_path = dir.join(format!("{stem}.mtl"));
        let ppm_path = dir.join(&ppm_name);
        write_mtl(stem, &ppm_name, create(&mtl_path)?).with_context(|| format!("Failed to write {}", mtl_path.display()))?;
        write_ppm(&texture.image, create(&ppm_path)?).with_context(|| format!("Failed to write {}", ppm_path.display()))?;
        written.push(mtl_path);
        written.push(ppm_path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use nalgebra::{UnitQuaternion, Vector2, Vector3};

    use super::*;
    use crate::fusion::MeshTexture;
    use crate::map::{CloudPoint, MapPointId};

    fn triangle() -> Mesh {
        let mut mesh = Mesh {
            vertices: vec![Vector3::zeros(), Vector3::x(), Vector3::y()],
            triangles: vec![[0, 1, 2]],
            ..Mesh::default()
        };
        mesh.compute_normals();
        mesh
    }

    #[test]
    fn test_obj_faces_are_one_based() {
        let mut out = Vec::new();
        write_obj(&triangle(), None, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with("v ")).count(), 3);
        assert!(text.contains("f 1//1 2//2 3//3"));
        assert!(!text.contains("mtllib"));
    }

    #[test]
    fn test_textured_obj_references_material() {
        let mut mesh = triangle();
        mesh.texture = Some(MeshTexture {
            image: RgbImage::filled(2, 2, [9, 9, 9]),
            uvs: vec![[Vector2::new(0.0, 0.0), Vector2::new(1.0, 0.0), Vector2::new(0.0, 1.0)]],
            untextured: 0,
        });
        let mut out = Vec::new();
        write_obj(&mesh, Some("scene"), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("mtllib scene.mtl"));
        assert!(text.contains("vt 0.000000 1.000000"));
        assert!(text.contains("f 1/1/1 2/2/2 3/3/3"));
    }

    #[test]
    fn test_ppm_header_and_size() {
        let mut out = Vec::new();
        write_ppm(&RgbImage::filled(3, 2, [1, 2, 3]), &mut out).unwrap();
        assert!(out.starts_with(b"P6\n3 2\n255\n"));
        assert_eq!(out.len(), b"P6\n3 2\n255\n".len() + 18);
    }

    #[test]
    fn test_csv_exports() {
        let cloud = PointCloud {
            points: vec![CloudPoint {
                id: MapPointId::new(4),
                position: Vector3::new(1.0, 2.0, 3.0),
                color: [10, 20, 30],
                normal: Vector3::z(),
                observations: 2,
            }],
            cameras: Vec::new(),
        };
        let mut out = Vec::new();
        write_point_cloud_csv(&cloud, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("id,x,y,z,r,g,b,nx,ny,nz,observations"));
        assert_eq!(lines.next(), Some("4,1.0,2.0,3.0,10,20,30,0.0,0.0,1.0,2"));

        let pose = SE3::from_parts(UnitQuaternion::identity(), Vector3::new(-0.5, 0.0, 0.0));
        let mut out = Vec::new();
        write_trajectory_csv(&[(0.25, pose)], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.lines().nth(1).unwrap().starts_with("0.25,0.5,"));
    }
}
