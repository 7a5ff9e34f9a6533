//! Geometry primitives: rigid and similarity transforms, the camera model,
//! triangulation and the two-view / PnP minimal solvers.

pub mod camera;
pub mod linalg;
pub mod pnp;
pub mod ransac;
pub mod se3;
pub mod sim3;
pub mod so3;
pub mod triangulation;
pub mod two_view;

pub use camera::{Camera, CameraModel};
pub use se3::SE3;
pub use sim3::Sim3;
