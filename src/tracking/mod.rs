//! Tracking: turns raw frames into camera poses.
//!
//! - Frame preparation (feature extraction, bag of words)
//! - Two-view initialization
//! - Pose prediction (constant velocity or inertial prior)
//! - Local map tracking by projection and robust pose refinement
//! - Relocalization and the tracking state machine
//! - Keyframe decision

pub mod frame;
pub mod initializer;
pub mod keyframe_decision;
pub mod local_map;
pub mod motion_model;
pub mod pose_optimizer;
pub mod relocalizer;
pub mod result;
pub mod state;
pub mod tracker;

pub use frame::{Frame, FrameInput};
pub use initializer::{InitialMap, InitialPoint, Initializer, InitializerConfig};
pub use keyframe_decision::{KeyFrameConfig, KeyFrameContext, KeyFrameDecision, KeyFrameReason};
pub use local_map::{LocalMap, ProjectionSearchParams};
pub use motion_model::MotionModel;
pub use pose_optimizer::{MotionPrior, PoseEstimate, PoseObservation, PoseOptimizer, PoseOptimizerConfig};
pub use relocalizer::{Relocalization, Relocalizer, RelocalizerConfig};
pub use result::{KeyFrameRequest, MapUpdate, TrackingMetrics, TrackingOutput, TrackingResult};
pub use state::{TrackingEvent, TrackingState};
pub use tracker::{Tracker, TrackingConfig};
