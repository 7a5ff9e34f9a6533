//! Monocular visual SLAM and dense reconstruction.
//!
//! Frames go through [`tracking`] on the caller's thread; [`map`] upkeep,
//! [`optimizer`] refinement and [`loop_closing`] run in the background
//! threads started by [`system::ReconstructionSystem`]. On request,
//! [`fusion`] turns a map snapshot into a textured mesh.

pub mod config;
pub mod error;
pub mod features;
pub mod fusion;
pub mod geometry;
pub mod imu;
pub mod io;
pub mod loop_closing;
pub mod map;
pub mod optimizer;
pub mod system;
pub mod tracking;
pub mod vocabulary;

pub use config::SystemConfig;
pub use system::ReconstructionSystem;
