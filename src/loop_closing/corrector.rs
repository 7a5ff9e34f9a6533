//! Loop correction.
//!
//! Follows the three-phase pattern of the optimizers:
//! 1. COLLECT + SOLVE: [`compute_loop_correction`] works on a map snapshot:
//!    it propagates the verified similarity to the current keyframe's
//!    neighbourhood and spreads the remaining error over the essential graph
//! 2. APPLY: [`apply_loop_correction`] runs in the single map writer: it
//!    writes the corrected poses, merges the duplicated points and records
//!    the loop edge

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::verification::VerifiedLoop;
use crate::geometry::Sim3;
use crate::map::{KeyFrameId, Map, MapCorrection, MapManager, MapPointId};
use crate::optimizer::{solve_pose_graph, OptimizationOutcome, PoseGraphConfig, PoseGraphProblem};

/// Everything needed to apply a loop closure to the map.
#[derive(Debug, Clone)]
pub struct LoopCorrection {
    pub verified: VerifiedLoop,
    /// Epoch of the snapshot the correction was computed on.
    pub base_epoch: u64,
    /// The current keyframe and its neighbours.
    pub current_group: Vec<KeyFrameId>,
    /// Poses and points after the pose graph.
    pub correction: MapCorrection,
    pub outcome: OptimizationOutcome,
}

impl LoopCorrection {
    pub fn current_kf_id(&self) -> KeyFrameId {
        self.verified.current_kf_id
    }

    pub fn loop_kf_id(&self) -> KeyFrameId {
        self.verified.loop_kf_id
    }
}

/// What applying a loop correction changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopApplication {
    pub updated: usize,
    /// Duplicated points merged into their loop counterparts.
    pub replaced: usize,
    /// Loop place points fused into the current neighbourhood.
    pub fused: usize,
}

/// Corrected similarity poses of the current keyframe's neighbourhood.
///
/// Each neighbour keeps its pose relative to the current keyframe, which
/// itself moves to the verified similarity.
pub fn corrected_neighbourhood(map: &Map, verified: &VerifiedLoop, group: &[KeyFrameId]) -> BTreeMap<KeyFrameId, Sim3> {
    let mut corrected = BTreeMap::new();
    let Some(current) = map.keyframe(verified.current_kf_id) else {
        return corrected;
    };
    let s_wc = Sim3::from_se3(&current.pose_cw).inverse();
    for &kf_id in group {
        let Some(kf) = map.keyframe(kf_id) else { continue };
        let s_ic = Sim3::from_se3(&kf.pose_cw).compose(&s_wc);
        corrected.insert(kf_id, s_ic.compose(&verified.s_cw));
    }
    corrected
}

/// COLLECT + SOLVE on a snapshot.
///
/// Returns `None` when the keyframes involved are gone or the graph is too
/// small to optimize.
pub fn compute_loop_correction(
    map: &Map,
    verified: VerifiedLoop,
    config: &PoseGraphConfig,
    group_size: usize,
    should_stop: &dyn Fn() -> bool,
) -> Option<LoopCorrection> {
    map.keyframe(verified.loop_kf_id)?;
    let mut current_group = vec![verified.current_kf_id];
    current_group.extend(map.best_covisibles(verified.current_kf_id, group_size));

    let corrected = corrected_neighbourhood(map, &verified, &current_group);
    if corrected.is_empty() {
        return None;
    }
    let problem = PoseGraphProblem::collect(map, verified.current_kf_id, verified.loop_kf_id, &corrected, config)?;
    let result = solve_pose_graph(&problem, config, should_stop);
    debug!(
        "[LoopCorrection] pose graph {} -> {}: cost {:.4} -> {:.4} in {} iterations",
        verified.current_kf_id,
        verified.loop_kf_id,
        result.outcome.initial_cost,
        result.outcome.best_cost,
        result.outcome.iterations
    );
    let correction = result.to_correction(map);

    Some(LoopCorrection {
        verified,
        base_epoch: map.epoch(),
        current_group,
        correction,
        outcome: result.outcome,
    })
}

/// APPLY: writes a loop correction into the map.
///
/// Returns `None` without touching the map when the map was rewritten
/// (reset or another loop closure) after the snapshot the correction was
/// computed on. On success the map epoch is bumped, so every optimization
/// still running on an older snapshot is discarded on arrival.
pub fn apply_loop_correction(map: &mut Map, manager: &MapManager, correction: &LoopCorrection) -> Option<LoopApplication> {
    if map.epoch() != correction.base_epoch {
        debug!(
            "[LoopCorrection] discarding stale correction (epoch {} != {})",
            correction.base_epoch,
            map.epoch()
        );
        return None;
    }
    let current_kf_id = correction.current_kf_id();
    let loop_kf_id = correction.loop_kf_id();
    if map.keyframe(current_kf_id).is_none() || map.keyframe(loop_kf_id).is_none() {
        return None;
    }

    let updated = manager.apply_correction(map, &correction.correction);

    // Duplicates seen by the current keyframe become the loop place's points.
    let mut replaced = 0;
    for &(feature_idx, loop_mp) in &correction.verified.matches {
        if map.map_point(loop_mp).is_none() {
            continue;
        }
        match map.keyframe(current_kf_id).and_then(|kf| kf.map_point(feature_idx)) {
            Some(existing) if existing != loop_mp => {
                if map.replace_map_point(existing, loop_mp) {
                    replaced += 1;
                }
            }
            Some(_) => {}
            None => {
                if map.associate(current_kf_id, feature_idx, loop_mp) {
                    map.update_map_point_geometry(loop_mp);
                    replaced += 1;
                }
            }
        }
    }

    let loop_points: Vec<MapPointId> = map.map_points_of(&correction.verified.loop_group).into_iter().collect();
    let targets: Vec<KeyFrameId> = correction
        .current_group
        .iter()
        .copied()
        .filter(|id| map.keyframe(*id).is_some())
        .collect();
    let fused = manager.fuse_points(map, &loop_points, &targets);

    map.add_loop_edge(current_kf_id, loop_kf_id);
    map.bump_epoch();

    info!(
        "[LoopCorrection] closed {} -> {}: {} updates, {} replaced, {} fused (scale {:.3})",
        current_kf_id, loop_kf_id, updated, replaced, fused, correction.verified.s_cw.scale
    );
    Some(LoopApplication { updated, replaced, fused })
}
