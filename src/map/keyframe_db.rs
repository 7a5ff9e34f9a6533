//! KeyFrameDatabase: inverted file over vocabulary words.
//!
//! Shared by relocalization and loop detection. A query only scores
//! keyframes that share at least 80% as many words with the query as the
//! best-sharing keyframe does.

use std::collections::{BTreeMap, BTreeSet};

use super::types::KeyFrameId;
use crate::vocabulary::{BowVector, Vocabulary};

/// Keyframes sharing fewer than this fraction of the best word count are skipped.
const MIN_COMMON_WORDS_RATIO: f64 = 0.8;

/// Candidate keyframe with its similarity score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub keyframe_id: KeyFrameId,
    pub score: f64,
    pub common_words: usize,
}

#[derive(Debug, Clone, Default)]
pub struct KeyFrameDatabase {
    inverted: BTreeMap<u32, BTreeSet<KeyFrameId>>,
    entries: BTreeMap<KeyFrameId, BowVector>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a keyframe entry.
    pub fn add(&mut self, kf_id: KeyFrameId, bow: BowVector) {
        self.erase(kf_id);
        for word in bow.keys() {
            self.inverted.entry(*word).or_default().insert(kf_id);
        }
        self.entries.insert(kf_id, bow);
    }

    pub fn erase(&mut self, kf_id: KeyFrameId) {
        let Some(bow) = self.entries.remove(&kf_id) else {
            return;
        };
        for word in bow.keys() {
            if let Some(set) = self.inverted.get_mut(word) {
                set.remove(&kf_id);
                if set.is_empty() {
                    self.inverted.remove(word);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, kf_id: KeyFrameId) -> bool {
        self.entries.contains_key(&kf_id)
    }

    /// Scores keyframes similar to `query`, best first.
    ///
    /// `accept` filters keyframes before scoring (for example the query's
    /// own neighbourhood during loop detection).
    pub fn query(&self, query: &BowVector, accept: impl Fn(KeyFrameId) -> bool, min_score: f64) -> Vec<Candidate> {
        let mut common: BTreeMap<KeyFrameId, usize> = BTreeMap::new();
        for word in query.keys() {
            if let Some(kfs) = self.inverted.get(word) {
                for &kf in kfs {
                    if accept(kf) {
                        *common.entry(kf).or_insert(0) += 1;
                    }
                }
            }
        }
        let Some(&max_common) = common.values().max() else {
            return Vec::new();
        };
        let min_common = (MIN_COMMON_WORDS_RATIO * max_common as f64).ceil() as usize;

        let mut candidates: Vec<Candidate> = common
            .into_iter()
            .filter(|&(_, n)| n >= min_common)
            .filter_map(|(kf, n)| {
                let score = Vocabulary::score(query, self.entries.get(&kf)?);
                (score >= min_score).then_some(Candidate {
                    keyframe_id: kf,
                    score,
                    common_words: n,
                })
            })
            .collect();
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.keyframe_id.cmp(&b.keyframe_id)));
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bow(words: &[u32]) -> BowVector {
        let w = 1.0 / words.len() as f64;
        words.iter().map(|&id| (id, w)).collect()
    }

    #[test]
    fn test_query_ranks_by_similarity() {
        let mut db = KeyFrameDatabase::new();
        db.add(KeyFrameId::new(0), bow(&[1, 2, 3, 4]));
        db.add(KeyFrameId::new(1), bow(&[1, 2, 3, 9]));
        db.add(KeyFrameId::new(2), bow(&[7, 8]));

        let found = db.query(&bow(&[1, 2, 3, 4]), |_| true, 0.0);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].keyframe_id, KeyFrameId::new(0));
        assert!((found[0].score - 1.0).abs() < 1e-12);
        assert_eq!(found[1].keyframe_id, KeyFrameId::new(1));
    }

    #[test]
    fn test_filter_and_erase() {
        let mut db = KeyFrameDatabase::new();
        db.add(KeyFrameId::new(0), bow(&[1, 2]));
        db.add(KeyFrameId::new(1), bow(&[1, 2]));
        let found = db.query(&bow(&[1, 2]), |kf| kf != KeyFrameId::new(0), 0.0);
        assert_eq!(found.len(), 1);
        db.erase(KeyFrameId::new(1));
        assert!(db.query(&bow(&[1, 2]), |kf| kf != KeyFrameId::new(0), 0.0).is_empty());
        assert_eq!(db.len(), 1);
    }
}
