//! Input and output around the core: synthetic scenes for tests and demos,
//! file exports of point clouds, trajectories and meshes.

pub mod export;
pub mod synthetic;

pub use export::{
    save_mesh, save_point_cloud, save_trajectory, write_mtl, write_obj, write_point_cloud_csv, write_ppm,
    write_trajectory_csv,
};
pub use synthetic::{camera_pose, linear_trajectory, loop_trajectory, PlanarScene, SceneConfig, SyntheticSequence};
