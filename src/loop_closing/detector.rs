//! Loop detection: place recognition over the keyframe database followed by
//! a temporal consistency check.
//!
//! A candidate is only reported once similar places have been retrieved for
//! several consecutive keyframes, which filters out single spurious matches
//! before the (more expensive) geometric verification.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::map::{KeyFrameId, Map};
use crate::vocabulary::Vocabulary;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectorConfig {
    /// Candidates must score at least this fraction of the weakest covisible
    /// neighbour's similarity to the query.
    pub min_score_ratio: f64,
    /// Consecutive keyframes that must retrieve the same place.
    pub consistency_threshold: usize,
    /// Keyframes closer than this in creation order are never loop candidates.
    pub min_temporal_gap: u64,
    /// Candidates kept per query.
    pub max_candidates: usize,
    /// Covisibles of a candidate that form its place group.
    pub group_size: usize,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            min_score_ratio: 0.75,
            consistency_threshold: 3,
            min_temporal_gap: 10,
            max_candidates: 3,
            group_size: 10,
        }
    }
}

/// A place retrieved for the current keyframe.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopCandidate {
    pub current_kf_id: KeyFrameId,
    /// The older keyframe the loop closes onto.
    pub loop_kf_id: KeyFrameId,
    pub score: f64,
    /// The loop keyframe and its best covisibles.
    pub loop_group: Vec<KeyFrameId>,
}

/// Remembers the place groups retrieved for recent keyframes.
#[derive(Debug, Clone)]
pub struct ConsistencyChecker {
    threshold: usize,
    history: VecDeque<BTreeSet<KeyFrameId>>,
}

impl ConsistencyChecker {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            history: VecDeque::new(),
        }
    }

    /// Records the candidates of one keyframe and returns the best scoring
    /// candidate whose group was seen in enough of the preceding keyframes.
    ///
    /// A keyframe without candidates still enters the history, so a
    /// detection needs consecutive retrievals. The history is cleared after
    /// a detection to avoid reporting the same loop twice.
    pub fn add_and_check(&mut self, candidates: &[LoopCandidate]) -> Option<LoopCandidate> {
        let mut consistent: Option<&LoopCandidate> = None;
        for candidate in candidates {
            let seen = self
                .history
                .iter()
                .filter(|group| candidate.loop_group.iter().any(|kf| group.contains(kf)))
                .count();
            if seen + 1 >= self.threshold && consistent.map_or(true, |c| candidate.score > c.score) {
                consistent = Some(candidate);
            }
        }
        let detected = consistent.cloned();

        if detected.is_some() {
            self.clear();
        } else {
            let group: BTreeSet<KeyFrameId> = candidates.iter().flat_map(|c| c.loop_group.iter().copied()).collect();
            self.history.push_back(group);
            while self.history.len() >= self.threshold {
                self.history.pop_front();
            }
        }
        detected
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

/// Queries the database for places similar to `kf_id`, best first.
///
/// The query keyframe's own neighbourhood and recent keyframes are excluded.
/// The acceptance score is relative to the weakest covisible neighbour, so
/// the threshold adapts to the scene's texture.
pub fn detect_loop_candidates(map: &Map, kf_id: KeyFrameId, config: &LoopDetectorConfig) -> Vec<LoopCandidate> {
    let Some(current) = map.keyframe(kf_id) else {
        return Vec::new();
    };
    if current.bow.is_empty() {
        return Vec::new();
    }

    let connected: BTreeSet<KeyFrameId> = current.covisibility().keys().copied().collect();
    let min_score = connected
        .iter()
        .filter_map(|id| map.keyframe(*id))
        .map(|kf| Vocabulary::score(&current.bow, &kf.bow))
        .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.min(s))))
        .map_or(0.0, |s| s * config.min_score_ratio);

    let gap = config.min_temporal_gap;
    let accept = |id: KeyFrameId| id != kf_id && !connected.contains(&id) && kf_id.0.saturating_sub(id.0) >= gap;
    let candidates: Vec<LoopCandidate> = map
        .database()
        .query(&current.bow, accept, min_score)
        .into_iter()
        .take(config.max_candidates)
        .map(|c| {
            let mut loop_group = vec![c.keyframe_id];
            loop_group.extend(map.best_covisibles(c.keyframe_id, config.group_size));
            LoopCandidate {
                current_kf_id: kf_id,
                loop_kf_id: c.keyframe_id,
                score: c.score,
                loop_group,
            }
        })
        .collect();

    if !candidates.is_empty() {
        debug!(
            "[LoopDetector] {}: {} candidates above {:.3} (best {} at {:.3})",
            kf_id,
            candidates.len(),
            min_score,
            candidates[0].loop_kf_id,
            candidates[0].score
        );
    }
    candidates
}

/// Database retrieval plus temporal consistency.
#[derive(Debug, Clone)]
pub struct LoopDetector {
    config: LoopDetectorConfig,
    consistency: ConsistencyChecker,
}

impl LoopDetector {
    pub fn new(config: LoopDetectorConfig) -> Self {
        Self {
            consistency: ConsistencyChecker::new(config.consistency_threshold),
            config,
        }
    }

    pub fn config(&self) -> &LoopDetectorConfig {
        &self.config
    }

    /// Returns a candidate once it has been retrieved consistently.
    pub fn detect(&mut self, map: &Map, kf_id: KeyFrameId) -> Option<LoopCandidate> {
        let candidates = detect_loop_candidates(map, kf_id, &self.config);
        self.consistency.add_and_check(&candidates)
    }

    /// Forgets the retrieval history.
    pub fn reset(&mut self) {
        self.consistency.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(current: u64, loop_kf: u64, group: &[u64], score: f64) -> LoopCandidate {
        LoopCandidate {
            current_kf_id: KeyFrameId::new(current),
            loop_kf_id: KeyFrameId::new(loop_kf),
            score,
            loop_group: group.iter().map(|&id| KeyFrameId::new(id)).collect(),
        }
    }

    #[test]
    fn test_consistency_requires_consecutive_retrievals() {
        let mut checker = ConsistencyChecker::new(3);
        assert!(checker.add_and_check(&[candidate(40, 2, &[2, 3], 0.4)]).is_none());
        assert!(checker.add_and_check(&[candidate(41, 3, &[3, 4], 0.4)]).is_none());
        let detected = checker.add_and_check(&[candidate(42, 4, &[4, 3], 0.5)]);
        assert_eq!(detected.map(|c| c.loop_kf_id), Some(KeyFrameId::new(4)));
        assert!(checker.is_empty());
    }

    #[test]
    fn test_gap_breaks_consistency() {
        let mut checker = ConsistencyChecker::new(3);
        assert!(checker.add_and_check(&[candidate(40, 2, &[2], 0.4)]).is_none());
        assert!(checker.add_and_check(&[]).is_none());
        assert!(checker.add_and_check(&[]).is_none());
        assert!(checker.add_and_check(&[candidate(43, 2, &[2], 0.4)]).is_none());
    }

    #[test]
    fn test_threshold_one_accepts_immediately() {
        let mut checker = ConsistencyChecker::new(1);
        let detected = checker.add_and_check(&[candidate(40, 2, &[2], 0.3), candidate(40, 7, &[7], 0.6)]);
        assert_eq!(detected.map(|c| c.loop_kf_id), Some(KeyFrameId::new(7)));
    }
}
