//! Loop closing: recognise revisited places and remove the drift
//! accumulated since the first visit.
//!
//! - [`detector`]: keyframe database query with temporal consistency
//! - [`verification`]: Sim(3) RANSAC gate against false positives
//! - [`corrector`]: neighbourhood correction, essential-graph optimization,
//!   point fusion
//! - [`loop_closer`]: the worker thread tying them together

pub mod corrector;
pub mod detector;
pub mod loop_closer;
pub mod verification;

pub use corrector::{apply_loop_correction, compute_loop_correction, corrected_neighbourhood, LoopApplication, LoopCorrection};
pub use detector::{detect_loop_candidates, ConsistencyChecker, LoopCandidate, LoopDetector, LoopDetectorConfig};
pub use loop_closer::{spawn_loop_closer, LoopCloser, LoopCloserStats, LoopClosingConfig};
pub use verification::{verify_loop, LoopVerificationConfig, VerifiedLoop};
