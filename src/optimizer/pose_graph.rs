//! Pose graph optimization for loop closing.
//!
//! Optimizes the essential graph (spanning tree + strong covisibility +
//! loop edges) over Sim(3) keyframe poses, so that the error found at a loop
//! closure is spread along the trajectory instead of staying at the loop.
//! Monocular maps drift in scale too, hence Sim(3) rather than SE(3).
//!
//! Three phases:
//! 1. COLLECT: [`PoseGraphProblem::collect`] under a read view
//! 2. SOLVE: [`solve_pose_graph`] without locks
//! 3. APPLY: [`PoseGraphResult::to_correction`] under the write lock

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{DMatrix, DVector, SMatrix, SVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::bundle_adjustment::OptimizationOutcome;
use crate::geometry::{SE3, Sim3};
use crate::map::{KeyFrameId, Map, MapCorrection};

type Vector7 = SVector<f64, 7>;
type Matrix7 = SMatrix<f64, 7, 7>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseGraphConfig {
    pub max_iterations: usize,
    /// Minimum covisibility weight for an essential-graph edge.
    pub min_covisibility_weight: usize,
    /// Information of loop edges relative to the other edges.
    pub loop_information: f64,
    /// Hold scale at 1 (metric maps).
    pub fix_scale: bool,
}

impl Default for PoseGraphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            min_covisibility_weight: 100,
            loop_information: 10.0,
            fix_scale: false,
        }
    }
}

/// Type of pose graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeType {
    SpanningTree,
    Covisibility,
    LoopClosure,
}

/// Relative Sim(3) constraint between nodes `i` and `j`.
#[derive(Debug, Clone)]
pub struct PoseGraphEdge {
    pub i: usize,
    pub j: usize,
    /// `S_ij = S_iw · S_jw⁻¹`.
    pub measurement: Sim3,
    pub information: f64,
    pub edge_type: EdgeType,
}

/// Snapshot of the essential graph.
#[derive(Debug, Clone)]
pub struct PoseGraphProblem {
    pub keyframe_ids: Vec<KeyFrameId>,
    /// Starting values, `S_iw`. Already corrected around the loop.
    pub initial: Vec<Sim3>,
    /// Poses as they were in the map when collected.
    pub original: Vec<SE3>,
    pub edges: Vec<PoseGraphEdge>,
    pub fixed: usize,
    pub fix_scale: bool,
}

impl PoseGraphProblem {
    /// Builds the essential graph of `map` with the new loop edge
    /// `(current, loop_kf)`.
    ///
    /// `corrected` holds the loop-corrected poses of the keyframes around
    /// `current`; every other keyframe starts from its map pose. Measurements
    /// of existing edges come from the uncorrected poses, so the optimizer
    /// sees the accumulated drift as a conflict with the loop edge.
    pub fn collect(
        map: &Map,
        current: KeyFrameId,
        loop_kf: KeyFrameId,
        corrected: &BTreeMap<KeyFrameId, Sim3>,
        config: &PoseGraphConfig,
    ) -> Option<Self> {
        let keyframe_ids = map.keyframe_ids();
        let index: BTreeMap<KeyFrameId, usize> = keyframe_ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        let mut original = Vec::with_capacity(keyframe_ids.len());
        let mut initial = Vec::with_capacity(keyframe_ids.len());
        for id in &keyframe_ids {
            let pose = map.keyframe(*id)?.pose_cw;
            original.push(pose);
            initial.push(corrected.get(id).copied().unwrap_or_else(|| Sim3::from_se3(&pose)));
        }
        let relative = |i: usize, j: usize| Sim3::from_se3(&original[i]).compose(&Sim3::from_se3(&original[j]).inverse());

        let mut edges = Vec::new();
        let mut seen: BTreeSet<(usize, usize)> = BTreeSet::new();
        let mut push = |edges: &mut Vec<PoseGraphEdge>, i: usize, j: usize, measurement: Sim3, information: f64, edge_type| {
            if i == j || !seen.insert((i.min(j), i.max(j))) {
                return;
            }
            edges.push(PoseGraphEdge {
                i,
                j,
                measurement,
                information,
                edge_type,
            });
        };

        // The new loop edge goes first so that it wins over a covisibility
        // edge between the same pair.
        let (&c, &l) = (index.get(&current)?, index.get(&loop_kf)?);
        let loop_measurement = initial[c].compose(&initial[l].inverse());
        push(&mut edges, c, l, loop_measurement, config.loop_information, EdgeType::LoopClosure);

        for kf in map.keyframes() {
            let i = index[&kf.id];
            if let Some(&p) = kf.parent.as_ref().and_then(|p| index.get(p)) {
                push(&mut edges, i, p, relative(i, p), 1.0, EdgeType::SpanningTree);
            }
            for other in &kf.loop_edges {
                if let Some(&j) = index.get(other) {
                    push(&mut edges, i, j, relative(i, j), config.loop_information, EdgeType::LoopClosure);
                }
            }
            for other in kf.covisibles_above(config.min_covisibility_weight) {
                if let Some(&j) = index.get(&other) {
                    push(&mut edges, i, j, relative(i, j), 1.0, EdgeType::Covisibility);
                }
            }
        }

        let fixed = map.origin().and_then(|o| index.get(&o).copied()).unwrap_or(0);
        if keyframe_ids.len() < 2 {
            return None;
        }
        debug!(
            "[PoseGraph] {} keyframes, {} edges ({} corrected)",
            keyframe_ids.len(),
            edges.len(),
            corrected.len()
        );
        Some(Self {
            keyframe_ids,
            initial,
            original,
            edges,
            fixed,
            fix_scale: config.fix_scale,
        })
    }

    /// Weighted squared error of the graph at `poses`.
    pub fn cost(&self, poses: &[Sim3]) -> f64 {
        self.edges
            .iter()
            .map(|e| edge_error(e, &poses[e.i], &poses[e.j]).norm_squared() * e.information)
            .sum()
    }
}

/// Optimized poses of a pose graph run.
#[derive(Debug, Clone)]
pub struct PoseGraphResult {
    pub keyframe_ids: Vec<KeyFrameId>,
    pub original: Vec<SE3>,
    pub optimized: Vec<Sim3>,
    pub outcome: OptimizationOutcome,
}

impl PoseGraphResult {
    /// Rigid poses and moved map points for `map`.
    ///
    /// Every point follows its reference keyframe: it keeps its coordinates
    /// in that camera under the uncorrected pose and is mapped back to the
    /// world through the optimized similarity. Points whose reference
    /// keyframe is gone follow their first observer.
    pub fn to_correction(&self, map: &Map) -> MapCorrection {
        let by_id: BTreeMap<KeyFrameId, usize> = self.keyframe_ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        let keyframe_poses = self
            .keyframe_ids
            .iter()
            .zip(&self.optimized)
            .map(|(id, s)| (*id, s.to_se3()))
            .collect();
        let map_points = map
            .map_points()
            .filter_map(|mp| {
                let k = by_id
                    .get(&mp.reference_kf)
                    .or_else(|| mp.observations.keys().find_map(|id| by_id.get(id)))?;
                let p_c = self.original[*k].transform_point(&mp.position);
                Some((mp.id, self.optimized[*k].inverse().transform_point(&p_c)))
            })
            .collect();
        MapCorrection {
            keyframe_poses,
            map_points,
            outlier_observations: Vec::new(),
        }
    }
}

/// `log(S_ij · S_jw · S_iw⁻¹)`, zero when the poses agree with the edge.
fn edge_error(edge: &PoseGraphEdge, s_iw: &Sim3, s_jw: &Sim3) -> Vector7 {
    Vector7::from(edge.measurement.compose(s_jw).compose(&s_iw.inverse()).log())
}

/// PHASE 2: Levenberg-Marquardt over the tangent coordinates of the free nodes.
pub fn solve_pose_graph(problem: &PoseGraphProblem, config: &PoseGraphConfig, should_stop: &dyn Fn() -> bool) -> PoseGraphResult {
    let n = problem.initial.len();
    let dof = if problem.fix_scale { 6 } else { 7 };
    let param_of: Vec<Option<usize>> = {
        let mut next = 0;
        (0..n)
            .map(|i| {
                if i == problem.fixed {
                    None
                } else {
                    next += 1;
                    Some(next - 1)
                }
            })
            .collect()
    };
    let n_params = (n.saturating_sub(1)) * dof;

    let mut tangents: Vec<[f64; 7]> = problem.initial.iter().map(Sim3::log).collect();
    let to_poses = |t: &[[f64; 7]]| -> Vec<Sim3> { t.iter().map(Sim3::exp).collect() };

    let initial_cost = problem.cost(&problem.initial);
    let mut cost = initial_cost;
    let mut history = vec![cost];
    let mut lambda = 1e-3;
    let mut iterations = 0;
    let mut converged = false;

    while iterations < config.max_iterations && n_params > 0 {
        if should_stop() {
            break;
        }
        iterations += 1;
        let poses = to_poses(&tangents);

        let mut h = DMatrix::<f64>::zeros(n_params, n_params);
        let mut b = DVector::<f64>::zeros(n_params);
        for edge in &problem.edges {
            let r = edge_error(edge, &poses[edge.i], &poses[edge.j]);
            let j_i = numeric_jacobian(edge, &tangents, edge.i, true);
            let j_j = numeric_jacobian(edge, &tangents, edge.j, false);
            let blocks = [(param_of[edge.i], j_i), (param_of[edge.j], j_j)];
            for (pa, ja) in &blocks {
                let Some(a) = pa else { continue };
                let ja = ja.columns(0, dof);
                let mut bv = b.rows_mut(a * dof, dof);
                bv -= ja.transpose() * r * edge.information;
                for (pb, jb) in &blocks {
                    let Some(bi) = pb else { continue };
                    let jb = jb.columns(0, dof);
                    let mut hv = h.view_mut((a * dof, bi * dof), (dof, dof));
                    hv += ja.transpose() * jb * edge.information;
                }
            }
        }
        for i in 0..n_params {
            h[(i, i)] += lambda * h[(i, i)].max(1e-6);
        }
        let Some(delta) = h.lu().solve(&b) else {
            lambda *= 10.0;
            continue;
        };

        let mut trial = tangents.clone();
        for (i, param) in param_of.iter().enumerate() {
            if let Some(k) = param {
                for d in 0..dof {
                    trial[i][d] += delta[k * dof + d];
                }
            }
        }
        let trial_cost = problem.cost(&to_poses(&trial));
        if trial_cost < cost {
            let decrease = (cost - trial_cost) / cost.max(f64::EPSILON);
            tangents = trial;
            cost = trial_cost;
            history.push(cost);
            lambda = (lambda * 0.1).max(1e-10);
            if decrease < 1e-8 {
                converged = true;
                break;
            }
        } else {
            lambda *= 10.0;
            if lambda > 1e10 {
                converged = true;
                break;
            }
        }
    }
    if n_params == 0 || cost <= f64::EPSILON {
        converged = true;
    }

    debug!(
        "[PoseGraph] cost {:.6} -> {:.6} in {} iterations",
        initial_cost, cost, iterations
    );
    PoseGraphResult {
        keyframe_ids: problem.keyframe_ids.clone(),
        original: problem.original.clone(),
        optimized: to_poses(&tangents),
        outcome: OptimizationOutcome {
            converged,
            initial_cost,
            best_cost: cost,
            iterations,
            cost_history: history,
        },
    }
}

/// Central-difference Jacobian of the edge error with respect to the
/// tangent coordinates of one of its nodes.
fn numeric_jacobian(edge: &PoseGraphEdge, tangents: &[[f64; 7]], node: usize, is_i: bool) -> Matrix7 {
    let eps = 1e-6;
    let other = Sim3::exp(&tangents[if is_i { edge.j } else { edge.i }]);
    let mut jac = Matrix7::zeros();
    for d in 0..7 {
        let mut plus = tangents[node];
        let mut minus = tangents[node];
        plus[d] += eps;
        minus[d] -= eps;
        let (p, m) = (Sim3::exp(&plus), Sim3::exp(&minus));
        let (e_plus, e_minus) = if is_i {
            (edge_error(edge, &p, &other), edge_error(edge, &m, &other))
        } else {
            (edge_error(edge, &other, &p), edge_error(edge, &other, &m))
        };
        jac.set_column(d, &((e_plus - e_minus) / (2.0 * eps)));
    }
    jac
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    /// A chain of poses along x, with a loop edge that says the last pose
    /// should sit where the chain says the first one is, shifted.
    fn chain(drift: f64) -> PoseGraphProblem {
        let n = 6;
        let truth: Vec<SE3> = (0..n)
            .map(|i| SE3::from_parts(UnitQuaternion::identity(), Vector3::new(-(i as f64), 0.0, 0.0)))
            .collect();
        // Odometry accumulates drift along x.
        let drifted: Vec<SE3> = (0..n)
            .map(|i| SE3::from_parts(UnitQuaternion::identity(), Vector3::new(-(i as f64) * (1.0 + drift), 0.0, 0.0)))
            .collect();
        let rel = |i: usize, j: usize| Sim3::from_se3(&drifted[i]).compose(&Sim3::from_se3(&drifted[j]).inverse());
        let mut edges: Vec<PoseGraphEdge> = (1..n)
            .map(|i| PoseGraphEdge {
                i,
                j: i - 1,
                measurement: rel(i, i - 1),
                information: 1.0,
                edge_type: EdgeType::SpanningTree,
            })
            .collect();
        let mut initial: Vec<Sim3> = drifted.iter().map(Sim3::from_se3).collect();
        initial[n - 1] = Sim3::from_se3(&truth[n - 1]);
        edges.push(PoseGraphEdge {
            i: n - 1,
            j: 0,
            measurement: initial[n - 1].compose(&initial[0].inverse()),
            information: 10.0,
            edge_type: EdgeType::LoopClosure,
        });
        PoseGraphProblem {
            keyframe_ids: (0..n as u64).map(KeyFrameId::new).collect(),
            initial,
            original: drifted,
            edges,
            fixed: 0,
            fix_scale: true,
        }
    }

    #[test]
    fn test_consistent_graph_has_zero_cost() {
        let mut problem = chain(0.0);
        problem.edges.pop();
        assert_relative_eq!(problem.cost(&problem.initial), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_drift_is_spread_along_chain() {
        let problem = chain(0.05);
        let result = solve_pose_graph(&problem, &PoseGraphConfig { fix_scale: true, ..Default::default() }, &|| false);
        assert!(result.outcome.best_cost < result.outcome.initial_cost);
        // The fixed node stays put; the middle nodes move towards the truth.
        assert_relative_eq!(result.optimized[0].translation, problem.initial[0].translation, epsilon = 1e-12);
        let mid = result.optimized[3].to_se3().camera_center().x;
        assert!(mid < 3.0 * 1.05 && mid > 2.9);
    }
}
