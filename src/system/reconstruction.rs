//! Reconstruction system: main entry point and thread orchestration.
//!
//! The caller's thread runs tracking. Three background threads do the rest:
//! - mapping: the single map writer (keyframes, culling, results)
//! - bundle adjustment: local and global refinement on snapshots
//! - loop closing: detection, verification and correction on snapshots
//!
//! Meshes are built on demand from a snapshot, either inline or on a thread
//! of their own.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Sender, TrySendError};
use tracing::{debug, info, warn};

use super::messages::MappingMessage;
use super::shared_state::{SharedState, WorkerStats};
use super::workers::{spawn_bundle_adjustment_worker, spawn_mapping_worker, BundleAdjustmentWorker, MappingWorker};
use crate::config::SystemConfig;
use crate::features::ScaleLevels;
use crate::fusion::{DenseFusion, Mesh};
use crate::geometry::SE3;
use crate::loop_closing::spawn_loop_closer;
use crate::map::{Map, MapManager, PointCloud};
use crate::optimizer::BundleAdjuster;
use crate::tracking::{FrameInput, MapUpdate, Tracker, TrackingOutput, TrackingResult, TrackingState};
use crate::vocabulary::Vocabulary;

const IDLE_POLL: Duration = Duration::from_millis(5);

pub struct ReconstructionSystem {
    config: SystemConfig,
    shared: Arc<SharedState>,
    tracker: Tracker,
    /// Used on the tracking thread for the initial map only.
    manager: MapManager,
    fusion: DenseFusion,
    mapping_sender: Option<Sender<MappingMessage>>,
    handles: Vec<JoinHandle<()>>,
    /// `(timestamp, pose)` of every tracked frame.
    trajectory: Vec<(f64, SE3)>,
}

impl ReconstructionSystem {
    /// Validates `config` and starts the background threads.
    pub fn new(config: SystemConfig) -> Result<Self> {
        config.validate()?;
        let camera = config.camera;
        let vocabulary = Arc::new(Vocabulary::new(&config.vocabulary));
        let shared = SharedState::new(ScaleLevels::new(config.features.n_levels, config.features.scale_factor));

        let (mapping_sender, mapping_receiver) = bounded(config.runtime.mapping_queue);
        let (ba_sender, ba_receiver) = if config.runtime.bundle_adjustment {
            let (tx, rx) = unbounded();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (loop_sender, loop_receiver) = if config.loop_closing.enabled {
            let (tx, rx) = bounded(config.runtime.loop_queue);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let mut handles = Vec::new();
        let mapping = MappingWorker::new(
            Arc::clone(&shared),
            MapManager::new(camera, config.mapping, config.matcher),
            ba_sender,
            loop_sender,
        );
        handles.push(spawn_mapping_worker(mapping, mapping_receiver).context("Failed to spawn mapping thread")?);

        if let Some(receiver) = ba_receiver {
            let worker = BundleAdjustmentWorker::new(
                Arc::clone(&shared),
                BundleAdjuster::new(camera, config.bundle_adjustment),
            );
            handles.push(
                spawn_bundle_adjustment_worker(worker, receiver, mapping_sender.clone())
                    .context("Failed to spawn bundle adjustment thread")?,
            );
        }
        if let Some(receiver) = loop_receiver {
            handles.push(
                spawn_loop_closer(
                    Arc::clone(&shared),
                    camera,
                    config.loop_closing,
                    config.matcher,
                    receiver,
                    mapping_sender.clone(),
                )
                .context("Failed to spawn loop closing thread")?,
            );
        }
        info!(
            "[System] started: {}x{} camera, {} background threads",
            camera.width,
            camera.height,
            handles.len()
        );

        Ok(Self {
            config,
            tracker: Tracker::new(camera, &config, vocabulary),
            manager: MapManager::new(camera, config.mapping, config.matcher),
            fusion: DenseFusion::new(camera, config.fusion),
            shared,
            mapping_sender: Some(mapping_sender),
            handles,
            trajectory: Vec::new(),
        })
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn state(&self) -> TrackingState {
        self.tracker.state()
    }

    /// Tracks one frame and forwards any map update to the mapping thread.
    ///
    /// Never waits on background work: the frame is tracked against the
    /// current snapshot, and keyframes are dropped rather than queued when
    /// the mapper is saturated.
    pub fn process_frame(&mut self, input: FrameInput) -> TrackingResult {
        let snapshot = self.shared.snapshot();
        self.tracker
            .set_keyframe_creation(!self.shared.should_stop_keyframe_creation());
        let TrackingOutput { result, update } = self.tracker.process_frame(input, &snapshot);
        // Released before writing, so the write does not copy the map.
        drop(snapshot);

        match update {
            Some(MapUpdate::Initialize {
                reference,
                current,
                points,
            }) => {
                let points: Vec<_> = points
                    .iter()
                    .map(|p| (p.reference_idx, p.current_idx, p.position))
                    .collect();
                let manager = &self.manager;
                let (current_kf, epoch) = self.shared.write(|map| {
                    let (_, current_kf) = manager.initialize_map(map, reference, current, &points);
                    (current_kf, map.epoch())
                });
                self.send(MappingMessage::Initialized { current_kf, epoch });
            }
            Some(MapUpdate::InsertKeyFrame(request)) => {
                self.send(MappingMessage::InsertKeyFrame(Box::new(request)));
            }
            None => {}
        }

        if let Some(pose) = result.pose_cw {
            self.trajectory.push((result.timestamp, pose));
        }
        result
    }

    fn send(&self, message: MappingMessage) {
        let Some(sender) = &self.mapping_sender else { return };
        self.shared.message_sent();
        match sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                self.shared.message_handled();
                warn!("[System] mapping queue full, dropping {}", message.label());
            }
            Err(TrySendError::Disconnected(message)) => {
                self.shared.message_handled();
                warn!("[System] mapping thread gone, dropping {}", message.label());
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outputs
    // ─────────────────────────────────────────────────────────────────────────

    /// Current map state.
    pub fn map_snapshot(&self) -> Arc<Map> {
        self.shared.snapshot()
    }

    pub fn point_cloud(&self) -> PointCloud {
        PointCloud::from_map(&self.shared.snapshot())
    }

    /// Poses of all tracked frames as estimated when they were tracked.
    pub fn trajectory(&self) -> &[(f64, SE3)] {
        &self.trajectory
    }

    /// Keyframe poses after all corrections applied so far.
    pub fn keyframe_trajectory(&self) -> Vec<(f64, SE3)> {
        self.shared
            .snapshot()
            .trajectory()
            .into_iter()
            .map(|(_, timestamp, pose)| (timestamp, pose))
            .collect()
    }

    pub fn worker_stats(&self) -> WorkerStats {
        self.shared.stats()
    }

    /// Fuses the current map into a mesh on the calling thread.
    pub fn build_mesh(&self) -> Mesh {
        self.fusion.build(&self.shared.snapshot())
    }

    /// Fuses the current map into a mesh on a background thread.
    pub fn spawn_mesh_build(&self) -> Result<JoinHandle<Mesh>> {
        let snapshot = self.shared.snapshot();
        let fusion = self.fusion.clone();
        debug!("[System] mesh build on map version {}", snapshot.version());
        thread::Builder::new()
            .name("mesh-build".into())
            .spawn(move || fusion.build(&snapshot))
            .context("Failed to spawn mesh build thread")
    }

    /// Waits until every queued message has been handled and no loop
    /// correction is in flight. Returns false on timeout.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.pending_messages() == 0 && !self.shared.is_loop_in_flight() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(IDLE_POLL);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Drops the map and restarts initialization. Results computed on the old
    /// map are discarded when they arrive.
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.shared.write(Map::clear);
        self.shared.set_loop_in_flight(false);
        self.trajectory.clear();
        info!("[System] reset");
    }

    /// Stops and joins the background threads.
    pub fn shutdown(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.shared.request_shutdown();
        self.mapping_sender = None;
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                warn!("[System] {} thread panicked", name);
            }
        }
        let stats = self.shared.stats();
        info!(
            "[System] shut down: {} keyframes, {} results applied, {} discarded, {} loops",
            stats.keyframes_inserted, stats.results_applied, stats.results_discarded, stats.loops_closed
        );
    }
}

impl Drop for ReconstructionSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
