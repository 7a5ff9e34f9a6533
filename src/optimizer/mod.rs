//! Nonlinear optimization for the background workers.
//!
//! - Bundle adjustment over keyframe poses and map points (local window or
//!   whole map), sparse Schur-complement Levenberg-Marquardt
//! - Essential-graph Sim(3) pose graph for loop correction
//!
//! Pose-only refinement for tracking lives in `tracking::pose_optimizer`
//! and shares the projection Jacobians here.

pub mod bundle_adjustment;
pub mod pose_graph;
pub mod projection;

pub use bundle_adjustment::{
    BundleAdjuster, BundleAdjustmentConfig, BundleObservation, BundleProblem, BundleSolution, OptimizationOutcome,
};
pub use pose_graph::{solve_pose_graph, EdgeType, PoseGraphConfig, PoseGraphEdge, PoseGraphProblem, PoseGraphResult};
