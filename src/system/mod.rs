//! System orchestration and thread management.
//!
//! [`ReconstructionSystem`] is the entry point: it runs tracking on the
//! caller's thread and owns the background workers. The workers share
//! [`SharedState`] and talk through the [`messages`] types.

pub mod messages;
pub mod reconstruction;
pub mod shared_state;
pub mod workers;

pub use messages::{BundleAdjustmentKind, BundleAdjustmentRequest, BundleAdjustmentResult, MappingMessage};
pub use reconstruction::ReconstructionSystem;
pub use shared_state::{SharedState, WorkerStats};
pub use workers::{
    check_staleness, spawn_bundle_adjustment_worker, spawn_mapping_worker, BundleAdjustmentWorker, MappingWorker,
    ResultDisposition, StaleReason, MAX_QUEUE_SIZE,
};
