//! Dense fusion and mesh building.
//!
//! Runs off the real-time path on a map snapshot:
//! 1. [`TsdfVolume`]: depth images, or map points along their viewing rays,
//!    fused with a weighted running average
//! 2. [`extract_mesh`]: zero level set as a closed triangle mesh
//! 3. [`texture_mesh`]: per-triangle texture from the best keyframe

pub mod dense;
pub mod extraction;
pub mod mesh;
pub mod texture;
pub mod tsdf;

pub use dense::DenseFusion;
pub use extraction::extract_mesh;
pub use mesh::{Mesh, MeshTexture, RgbImage};
pub use texture::texture_mesh;
pub use tsdf::{FusionConfig, TsdfVolume};
