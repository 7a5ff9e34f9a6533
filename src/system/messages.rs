//! Messages exchanged between the tracking thread and the workers.
//!
//! Work flows one way through request channels and comes back as results
//! through the mapping worker's queue, which is the only place the map is
//! written after initialization.

use std::sync::Arc;

use crate::loop_closing::LoopCorrection;
use crate::map::{KeyFrameId, Map, MapCorrection};
use crate::optimizer::OptimizationOutcome;
use crate::tracking::KeyFrameRequest;

/// Which bundle adjustment to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleAdjustmentKind {
    /// Window around a newly inserted keyframe.
    Local(KeyFrameId),
    /// Every keyframe, after initialization and loop closure.
    Global,
}

impl BundleAdjustmentKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Global => "global",
        }
    }
}

/// Work item for the bundle adjustment worker.
#[derive(Debug, Clone)]
pub struct BundleAdjustmentRequest {
    pub request_id: u64,
    pub kind: BundleAdjustmentKind,
    pub snapshot: Arc<Map>,
}

/// Outcome of a bundle adjustment, tagged with what it was computed on.
#[derive(Debug, Clone)]
pub struct BundleAdjustmentResult {
    pub request_id: u64,
    pub kind: BundleAdjustmentKind,
    pub base_version: u64,
    pub base_epoch: u64,
    pub correction: MapCorrection,
    pub outcome: OptimizationOutcome,
}

/// Everything the mapping worker handles, in arrival order.
#[derive(Debug)]
pub enum MappingMessage {
    /// The map was bootstrapped by the tracker.
    Initialized { current_kf: KeyFrameId, epoch: u64 },
    InsertKeyFrame(Box<KeyFrameRequest>),
    BundleAdjusted(Box<BundleAdjustmentResult>),
    LoopCorrected(Box<LoopCorrection>),
}

impl MappingMessage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Initialized { .. } => "initialized",
            Self::InsertKeyFrame(_) => "insert-keyframe",
            Self::BundleAdjusted(_) => "bundle-adjusted",
            Self::LoopCorrected(_) => "loop-corrected",
        }
    }
}
