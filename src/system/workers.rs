//! Background workers.
//!
//! - [`MappingWorker`]: the single map writer. Inserts keyframes, culls,
//!   applies optimizer and loop results in arrival order, and issues bundle
//!   adjustment requests.
//! - [`BundleAdjustmentWorker`]: solves requests on map snapshots without
//!   holding any lock.
//!
//! Results are tagged with the request id and the map epoch they were
//! computed on. A result is applied only while its request is still the
//! newest of its lane and the map has not been rewritten since; anything
//! else is discarded. Ordering therefore follows the map's history, not
//! completion time.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn};

use super::messages::{BundleAdjustmentKind, BundleAdjustmentRequest, BundleAdjustmentResult, MappingMessage};
use super::shared_state::SharedState;
use crate::loop_closing::{apply_loop_correction, LoopApplication, LoopCorrection};
use crate::map::{KeyFrameId, MapManager};
use crate::optimizer::BundleAdjuster;
use crate::tracking::KeyFrameRequest;

/// Queued messages above which tracking stops creating keyframes.
pub const MAX_QUEUE_SIZE: usize = 3;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Why a result was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// A newer request of the same lane was issued.
    Superseded { request_id: u64, latest: u64 },
    /// The map was reset or loop-corrected after the snapshot was taken.
    EpochChanged { base: u64, current: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultDisposition {
    /// Number of pose and position updates written.
    Applied(usize),
    Discarded(StaleReason),
}

/// Staleness rule for optimizer results.
pub fn check_staleness(result: &BundleAdjustmentResult, latest_request: u64, epoch: u64) -> Option<StaleReason> {
    if result.base_epoch != epoch {
        return Some(StaleReason::EpochChanged {
            base: result.base_epoch,
            current: epoch,
        });
    }
    if result.request_id != latest_request {
        return Some(StaleReason::Superseded {
            request_id: result.request_id,
            latest: latest_request,
        });
    }
    None
}

// ─────────────────────────────────────────────────────────────────────────────
// Mapping worker
// ─────────────────────────────────────────────────────────────────────────────

pub struct MappingWorker {
    shared: Arc<SharedState>,
    manager: MapManager,
    ba_requests: Option<Sender<BundleAdjustmentRequest>>,
    loop_keyframes: Option<Sender<KeyFrameId>>,
}

impl MappingWorker {
    pub fn new(
        shared: Arc<SharedState>,
        manager: MapManager,
        ba_requests: Option<Sender<BundleAdjustmentRequest>>,
        loop_keyframes: Option<Sender<KeyFrameId>>,
    ) -> Self {
        Self {
            shared,
            manager,
            ba_requests,
            loop_keyframes,
        }
    }

    /// Blocks until the channel closes or shutdown is requested.
    pub fn run(&mut self, receiver: Receiver<MappingMessage>) {
        info!("[Mapping] started");
        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }
            self.shared.set_stop_keyframe_creation(receiver.len() > MAX_QUEUE_SIZE);

            match receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(message) => {
                    self.handle(message);
                    self.shared.message_handled();
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let stats = self.shared.stats();
        info!(
            "[Mapping] exiting: keyframes={} applied={} discarded={} loops={}",
            stats.keyframes_inserted, stats.results_applied, stats.results_discarded, stats.loops_closed
        );
    }

    pub fn handle(&mut self, message: MappingMessage) {
        debug!("[Mapping] handling {}", message.label());
        match message {
            MappingMessage::Initialized { current_kf, epoch } => {
                if self.shared.map_version().1 == epoch {
                    self.request_bundle_adjustment(BundleAdjustmentKind::Global);
                } else {
                    self.shared.update_stats(|s| s.requests_dropped += 1);
                    debug!("[Mapping] dropping initialization at {} from epoch {}", current_kf, epoch);
                }
            }
            MappingMessage::InsertKeyFrame(request) => {
                self.insert_keyframe(*request);
            }
            MappingMessage::BundleAdjusted(result) => {
                self.apply_bundle_adjustment(&result);
            }
            MappingMessage::LoopCorrected(correction) => {
                self.apply_loop(&correction);
            }
        }
    }

    /// Inserts a keyframe, culls around it and schedules a local adjustment.
    ///
    /// Requests tracked against an older map epoch are dropped: their point
    /// associations refer to a map that was reset or loop-corrected since.
    /// Returns `None` for those, and for a keyframe that ended up sharing no
    /// point with the rest of the map.
    pub fn insert_keyframe(&mut self, request: KeyFrameRequest) -> Option<KeyFrameId> {
        let KeyFrameRequest {
            base_epoch,
            source,
            tracked,
            point_stats,
            reason,
        } = request;
        let frame_id = source.frame_id;
        let manager = &self.manager;
        let inserted = self.shared.write(|map| {
            if map.epoch() != base_epoch {
                return Err(map.epoch());
            }
            manager.apply_point_statistics(map, &point_stats);
            let insertion = manager.insert_keyframe(map, source, &tracked);
            let culled_points = manager.cull_map_points(map);
            let culled_kfs = manager.cull_keyframes(map, insertion.keyframe_id) + manager.cull_orphan_keyframes(map);
            let kept = map.keyframe(insertion.keyframe_id).is_some();
            Ok((insertion, culled_points, culled_kfs, kept))
        });
        let (insertion, culled_points, culled_kfs, kept) = match inserted {
            Ok(done) => done,
            Err(epoch) => {
                self.shared.update_stats(|s| s.requests_dropped += 1);
                debug!(
                    "[Mapping] dropping keyframe from frame {}: tracked on epoch {}, map at {}",
                    frame_id, base_epoch, epoch
                );
                return None;
            }
        };
        let kf_id = insertion.keyframe_id;
        debug!(
            "[Mapping] {} ({:?}): +{} points, {} fused, culled {} points / {} keyframes",
            kf_id, reason, insertion.new_points, insertion.fused_points, culled_points, culled_kfs
        );
        if !kept {
            debug!("[Mapping] {} shared no points and was removed", kf_id);
            return None;
        }
        self.shared.update_stats(|s| s.keyframes_inserted += 1);

        self.request_bundle_adjustment(BundleAdjustmentKind::Local(kf_id));
        if let Some(sender) = &self.loop_keyframes {
            self.shared.message_sent();
            match sender.try_send(kf_id) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    self.shared.message_handled();
                    debug!("[Mapping] loop closer busy, {} not queued", kf_id);
                }
            }
        }
        Some(kf_id)
    }

    /// Applies a bundle adjustment result unless it is stale.
    pub fn apply_bundle_adjustment(&mut self, result: &BundleAdjustmentResult) -> ResultDisposition {
        let latest = self.shared.latest_request_id(result.kind);
        let manager = &self.manager;
        let disposition = self.shared.write(|map| match check_staleness(result, latest, map.epoch()) {
            Some(reason) => ResultDisposition::Discarded(reason),
            None => ResultDisposition::Applied(manager.apply_correction(map, &result.correction)),
        });
        match disposition {
            ResultDisposition::Applied(updated) => {
                self.shared.update_stats(|s| s.results_applied += 1);
                info!(
                    "[BA] applied {} #{}: cost {:.4} -> {:.4}{} ({} updates)",
                    result.kind.label(),
                    result.request_id,
                    result.outcome.initial_cost,
                    result.outcome.best_cost,
                    if result.outcome.converged { "" } else { " (not converged)" },
                    updated
                );
            }
            ResultDisposition::Discarded(reason) => {
                self.shared.update_stats(|s| s.results_discarded += 1);
                debug!("[BA] discarding stale {} result #{}: {:?}", result.kind.label(), result.request_id, reason);
            }
        }
        disposition
    }

    /// Applies a loop correction, then re-optimizes the whole map.
    pub fn apply_loop(&mut self, correction: &LoopCorrection) -> Option<LoopApplication> {
        let manager = &self.manager;
        let applied = self.shared.write(|map| apply_loop_correction(map, manager, correction));
        self.shared.set_loop_in_flight(false);
        match applied {
            Some(_) => {
                self.shared.update_stats(|s| s.loops_closed += 1);
                self.request_bundle_adjustment(BundleAdjustmentKind::Global);
            }
            None => {
                self.shared.update_stats(|s| s.results_discarded += 1);
                warn!(
                    "[LoopClosing] discarding stale correction {} -> {}",
                    correction.current_kf_id(),
                    correction.loop_kf_id()
                );
            }
        }
        applied
    }

    fn request_bundle_adjustment(&self, kind: BundleAdjustmentKind) {
        let Some(sender) = &self.ba_requests else { return };
        let request = BundleAdjustmentRequest {
            request_id: self.shared.next_request_id(kind),
            kind,
            snapshot: self.shared.snapshot(),
        };
        self.shared.message_sent();
        if sender.send(request).is_err() {
            self.shared.message_handled();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bundle adjustment worker
// ─────────────────────────────────────────────────────────────────────────────

pub struct BundleAdjustmentWorker {
    shared: Arc<SharedState>,
    adjuster: BundleAdjuster,
}

impl BundleAdjustmentWorker {
    pub fn new(shared: Arc<SharedState>, adjuster: BundleAdjuster) -> Self {
        Self { shared, adjuster }
    }

    pub fn run(&mut self, receiver: Receiver<BundleAdjustmentRequest>, results: Sender<MappingMessage>) {
        info!("[BA] worker started");
        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }
            let first = match receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(request) => request,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            // Superseded requests queued behind the first are skipped unsolved.
            let mut batch = vec![first];
            batch.extend(receiver.try_iter());
            batch.sort_by_key(|r| matches!(r.kind, BundleAdjustmentKind::Local(_)));

            for request in batch {
                let result = self.solve(&request);
                self.shared.message_handled();
                let Some(result) = result else { continue };
                self.shared.message_sent();
                if results.send(MappingMessage::BundleAdjusted(Box::new(result))).is_err() {
                    self.shared.message_handled();
                    return;
                }
            }
        }
        info!("[BA] worker exiting");
    }

    /// Solves one request. Returns `None` when it was superseded before or
    /// during the solve, or when the snapshot holds nothing to optimize.
    pub fn solve(&self, request: &BundleAdjustmentRequest) -> Option<BundleAdjustmentResult> {
        let (kind, request_id) = (request.kind, request.request_id);
        if self.shared.is_superseded(kind, request_id) {
            debug!("[BA] skipping superseded {} request #{}", kind.label(), request_id);
            return None;
        }
        let shared = Arc::clone(&self.shared);
        let should_stop = move || shared.is_superseded(kind, request_id);
        let map = &request.snapshot;
        let (correction, outcome) = match kind {
            BundleAdjustmentKind::Local(kf_id) => self.adjuster.local(map, kf_id, &should_stop)?,
            BundleAdjustmentKind::Global => self.adjuster.global(map, &should_stop)?,
        };
        if self.shared.is_superseded(kind, request_id) {
            debug!("[BA] {} request #{} superseded while solving", kind.label(), request_id);
            return None;
        }
        Some(BundleAdjustmentResult {
            request_id,
            kind,
            base_version: map.version(),
            base_epoch: map.epoch(),
            correction,
            outcome,
        })
    }
}

/// Spawns the mapping worker thread.
pub fn spawn_mapping_worker(mut worker: MappingWorker, receiver: Receiver<MappingMessage>) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("mapping".into())
        .spawn(move || worker.run(receiver))
}

/// Spawns the bundle adjustment worker thread.
pub fn spawn_bundle_adjustment_worker(
    mut worker: BundleAdjustmentWorker,
    receiver: Receiver<BundleAdjustmentRequest>,
    results: Sender<MappingMessage>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("bundle-adjustment".into())
        .spawn(move || worker.run(receiver, results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::MapCorrection;
    use crate::optimizer::OptimizationOutcome;

    fn result(request_id: u64, base_epoch: u64) -> BundleAdjustmentResult {
        BundleAdjustmentResult {
            request_id,
            kind: BundleAdjustmentKind::Global,
            base_version: 0,
            base_epoch,
            correction: MapCorrection::default(),
            outcome: OptimizationOutcome::default(),
        }
    }

    #[test]
    fn test_current_result_is_fresh() {
        assert_eq!(check_staleness(&result(4, 2), 4, 2), None);
    }

    #[test]
    fn test_superseded_result_is_stale() {
        assert_eq!(
            check_staleness(&result(3, 2), 4, 2),
            Some(StaleReason::Superseded { request_id: 3, latest: 4 })
        );
    }

    #[test]
    fn test_epoch_change_wins_over_request_order() {
        assert_eq!(
            check_staleness(&result(4, 1), 4, 2),
            Some(StaleReason::EpochChanged { base: 1, current: 2 })
        );
    }
}
