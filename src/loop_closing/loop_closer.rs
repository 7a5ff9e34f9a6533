//! LoopCloser: the loop closing worker.
//!
//! For every keyframe forwarded by the mapping worker:
//! 1. Detect a consistent place candidate in the keyframe database
//! 2. Verify it geometrically with a Sim(3) RANSAC (hard gate)
//! 3. Compute the correction on a snapshot (neighbourhood + pose graph)
//! 4. Hand the correction to the mapping worker, which applies it and
//!    requests a global bundle adjustment
//!
//! Keyframe creation stays suspended from step 2 until the correction has
//! been applied or dropped.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::corrector::{compute_loop_correction, LoopCorrection};
use super::detector::{LoopDetector, LoopDetectorConfig};
use super::verification::{verify_loop, LoopVerificationConfig};
use crate::features::{FeatureMatcher, MatcherConfig};
use crate::geometry::CameraModel;
use crate::map::KeyFrameId;
use crate::optimizer::PoseGraphConfig;
use crate::system::{MappingMessage, SharedState};

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopClosingConfig {
    pub enabled: bool,
    pub detector: LoopDetectorConfig,
    pub verification: LoopVerificationConfig,
    pub pose_graph: PoseGraphConfig,
    /// Neighbours of the current keyframe corrected rigidly with it.
    pub current_group_size: usize,
}

impl Default for LoopClosingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detector: LoopDetectorConfig::default(),
            verification: LoopVerificationConfig::default(),
            pose_graph: PoseGraphConfig::default(),
            current_group_size: 10,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopCloserStats {
    pub keyframes_processed: usize,
    pub candidates_detected: usize,
    pub loops_verified: usize,
    pub loops_rejected: usize,
    pub corrections_sent: usize,
}

pub struct LoopCloser {
    shared: Arc<SharedState>,
    camera: CameraModel,
    config: LoopClosingConfig,
    detector: LoopDetector,
    matcher: FeatureMatcher,
    stats: LoopCloserStats,
    /// Epoch of the last snapshot seen; a jump means the map was rewritten.
    last_epoch: u64,
}

impl LoopCloser {
    pub fn new(shared: Arc<SharedState>, camera: CameraModel, config: LoopClosingConfig, matcher: MatcherConfig) -> Self {
        let matcher = FeatureMatcher::new(MatcherConfig {
            max_distance: config.verification.max_descriptor_distance.min(matcher.max_distance),
            ..matcher
        });
        Self {
            last_epoch: shared.snapshot().epoch(),
            shared,
            camera,
            detector: LoopDetector::new(config.detector),
            config,
            matcher,
            stats: LoopCloserStats::default(),
        }
    }

    pub fn stats(&self) -> &LoopCloserStats {
        &self.stats
    }

    /// Blocks until the channel closes or shutdown is requested.
    pub fn run(&mut self, receiver: Receiver<KeyFrameId>, results: Sender<MappingMessage>) {
        info!("[LoopCloser] started");
        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }
            let kf_id = match receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(kf_id) => kf_id,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let correction = self.process_keyframe(kf_id);
            self.shared.message_handled();

            if let Some(correction) = correction {
                self.shared.message_sent();
                if results.send(MappingMessage::LoopCorrected(Box::new(correction))).is_err() {
                    self.shared.message_handled();
                    self.shared.set_loop_in_flight(false);
                    break;
                }
                self.stats.corrections_sent += 1;
            }
        }
        info!(
            "[LoopCloser] exiting: processed={} detected={} verified={} rejected={} sent={}",
            self.stats.keyframes_processed,
            self.stats.candidates_detected,
            self.stats.loops_verified,
            self.stats.loops_rejected,
            self.stats.corrections_sent
        );
    }

    /// Runs detection, verification and correction for one keyframe.
    ///
    /// On success the loop-in-flight flag is left set; whoever applies or
    /// drops the returned correction clears it.
    pub fn process_keyframe(&mut self, kf_id: KeyFrameId) -> Option<LoopCorrection> {
        self.stats.keyframes_processed += 1;
        if !self.config.enabled || self.shared.is_loop_in_flight() {
            return None;
        }
        let snapshot = self.shared.snapshot();
        if snapshot.epoch() != self.last_epoch {
            self.detector.reset();
            self.last_epoch = snapshot.epoch();
        }

        let candidate = self.detector.detect(&snapshot, kf_id)?;
        self.stats.candidates_detected += 1;
        info!(
            "[LoopCloser] candidate {} -> {} (score {:.3})",
            candidate.current_kf_id, candidate.loop_kf_id, candidate.score
        );

        let verified = match verify_loop(&snapshot, &candidate, &self.camera, &self.matcher, &self.config.verification) {
            Ok(v) => v,
            Err(reason) => {
                self.stats.loops_rejected += 1;
                debug!("[LoopCloser] rejected {} -> {}: {}", candidate.current_kf_id, candidate.loop_kf_id, reason);
                return None;
            }
        };
        self.stats.loops_verified += 1;
        self.shared.set_loop_in_flight(true);

        let shared = Arc::clone(&self.shared);
        let should_stop = move || shared.is_shutdown_requested();
        let correction = compute_loop_correction(
            &snapshot,
            verified,
            &self.config.pose_graph,
            self.config.current_group_size,
            &should_stop,
        );
        if correction.is_none() {
            self.shared.set_loop_in_flight(false);
        }
        correction
    }
}

/// Spawns the loop closer thread.
pub fn spawn_loop_closer(
    shared: Arc<SharedState>,
    camera: CameraModel,
    config: LoopClosingConfig,
    matcher: MatcherConfig,
    receiver: Receiver<KeyFrameId>,
    results: Sender<MappingMessage>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name("loop-closer".into()).spawn(move || {
        let mut loop_closer = LoopCloser::new(shared, camera, config, matcher);
        loop_closer.run(receiver, results);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::ScaleLevels;

    #[test]
    fn test_disabled_closer_ignores_keyframes() {
        let shared = SharedState::new(ScaleLevels::new(4, 1.2));
        let config = LoopClosingConfig {
            enabled: false,
            ..LoopClosingConfig::default()
        };
        let camera = CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480);
        let mut closer = LoopCloser::new(Arc::clone(&shared), camera, config, MatcherConfig::default());
        assert!(closer.process_keyframe(KeyFrameId::new(3)).is_none());
        assert_eq!(closer.stats().keyframes_processed, 1);
        assert!(!shared.is_loop_in_flight());
    }
}
