//! State shared between the tracking thread and the background workers.
//!
//! The map is published as an immutable `Arc<Map>` snapshot. Readers clone
//! the `Arc` under a short read lock and work on it without holding any
//! lock. The single writer (the mapping worker, or the tracking thread while
//! bootstrapping) edits the map copy-on-write and swaps the result in, so a
//! reader never observes a half-applied correction.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::messages::BundleAdjustmentKind;
use crate::features::ScaleLevels;
use crate::map::Map;

/// Counters of what the background workers did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub keyframes_inserted: u64,
    pub results_applied: u64,
    pub results_discarded: u64,
    /// Keyframe and initialization messages built on an older map epoch.
    pub requests_dropped: u64,
    pub loops_closed: u64,
}

pub struct SharedState {
    map: RwLock<Arc<Map>>,

    /// Flow control: set by the mapping worker while its queue is too long.
    pub stop_keyframe_creation: AtomicBool,

    /// Set by the loop closer from verification until the correction is
    /// applied. Keyframe creation is suspended meanwhile.
    pub loop_in_flight: AtomicBool,

    pub shutdown_requested: AtomicBool,

    /// Id of the newest bundle adjustment request per lane. A running
    /// adjustment whose id is no longer the newest is superseded.
    local_request: AtomicU64,
    global_request: AtomicU64,

    /// Messages sent to workers and not yet handled.
    pending: AtomicU64,

    stats: RwLock<WorkerStats>,
}

impl SharedState {
    pub fn new(levels: ScaleLevels) -> Arc<Self> {
        Arc::new(Self::with_map(Map::new(levels)))
    }

    pub fn with_map(map: Map) -> Self {
        Self {
            map: RwLock::new(Arc::new(map)),
            stop_keyframe_creation: AtomicBool::new(false),
            loop_in_flight: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            local_request: AtomicU64::new(0),
            global_request: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            stats: RwLock::new(WorkerStats::default()),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map snapshots
    // ─────────────────────────────────────────────────────────────────────────

    /// Consistent read view of the map.
    pub fn snapshot(&self) -> Arc<Map> {
        Arc::clone(&self.map.read())
    }

    /// Runs `f` on the map and publishes the result.
    ///
    /// Outstanding snapshots keep the previous version; the edit is made on
    /// a private copy when any exist.
    pub fn write<R>(&self, f: impl FnOnce(&mut Map) -> R) -> R {
        let mut guard = self.map.write();
        f(Arc::make_mut(&mut guard))
    }

    pub fn map_version(&self) -> (u64, u64) {
        let map = self.map.read();
        (map.version(), map.epoch())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Flow control
    // ─────────────────────────────────────────────────────────────────────────

    pub fn should_stop_keyframe_creation(&self) -> bool {
        self.stop_keyframe_creation.load(Ordering::SeqCst) || self.loop_in_flight.load(Ordering::SeqCst)
    }

    pub fn set_stop_keyframe_creation(&self, value: bool) {
        self.stop_keyframe_creation.store(value, Ordering::SeqCst);
    }

    pub fn is_loop_in_flight(&self) -> bool {
        self.loop_in_flight.load(Ordering::SeqCst)
    }

    pub fn set_loop_in_flight(&self, value: bool) {
        self.loop_in_flight.store(value, Ordering::SeqCst);
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bundle adjustment requests
    // ─────────────────────────────────────────────────────────────────────────

    /// Allocates the next request id of a lane, superseding older requests.
    pub fn next_request_id(&self, kind: BundleAdjustmentKind) -> u64 {
        self.lane(kind).fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn latest_request_id(&self, kind: BundleAdjustmentKind) -> u64 {
        self.lane(kind).load(Ordering::SeqCst)
    }

    /// Whether a request should stop early.
    pub fn is_superseded(&self, kind: BundleAdjustmentKind, request_id: u64) -> bool {
        self.is_shutdown_requested() || self.latest_request_id(kind) != request_id
    }

    fn lane(&self, kind: BundleAdjustmentKind) -> &AtomicU64 {
        match kind {
            BundleAdjustmentKind::Local(_) => &self.local_request,
            BundleAdjustmentKind::Global => &self.global_request,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bookkeeping
    // ─────────────────────────────────────────────────────────────────────────

    pub fn message_sent(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub fn message_handled(&self) {
        // Saturating: a message dropped on shutdown is never handled.
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    pub fn pending_messages(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> WorkerStats {
        *self.stats.read()
    }

    pub fn update_stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut self.stats.write());
    }
}
