//! Sparse map: keyframes, map points and the relations between them.
//!
//! The map is an arena. KeyFrames refer to MapPoints and MapPoints refer
//! back to their observing KeyFrames through ids, never through references:
//! - KeyFrame → MapPoint via `map_point_ids` (one slot per feature)
//! - MapPoint → KeyFrame via `observations`
//!
//! KeyFrames additionally carry the covisibility graph (shared point
//! counts) and the spanning tree. [`MapManager`] implements the policies on
//! top of this structure: insertion with triangulation, fusion and culling.

pub mod keyframe;
pub mod keyframe_db;
pub mod manager;
pub mod map;
pub mod map_point;
pub mod point_cloud;
pub mod types;

pub use keyframe::{KeyFrame, KeyFrameSource};
pub use keyframe_db::{Candidate, KeyFrameDatabase};
pub use manager::{scene_median_depth, KeyFrameInsertion, MapCorrection, MapManager, MapManagerConfig};
pub use map::Map;
pub use map_point::MapPoint;
pub use point_cloud::{CloudCamera, CloudPoint, PointCloud};
pub use types::{KeyFrameId, MapPointId};
