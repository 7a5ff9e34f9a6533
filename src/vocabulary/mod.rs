//! Binary visual vocabulary for place recognition.
//!
//! Words come from locality-sensitive hashing of the 256-bit descriptors:
//! each of `tables` hash tables reads `bits_per_word` fixed bit positions
//! (drawn once from a seeded RNG) and concatenates them into a word id.
//! Descriptors that differ in a few bits usually share most of their words,
//! unrelated ones rarely do. No training data is needed, so the vocabulary
//! is identical across runs.
//!
//! # Key Types
//!
//! - [`BowVector`]: word id -> L1-normalized term frequency
//! - [`Vocabulary`]: the hash tables and the transform/score methods

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::features::Descriptor;

/// Bag-of-words vector: word id -> weight. Weights sum to one.
pub type BowVector = BTreeMap<u32, f64>;

const DESCRIPTOR_BITS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VocabularyConfig {
    pub tables: usize,
    pub bits_per_word: usize,
    pub seed: u64,
}

impl Default for VocabularyConfig {
    fn default() -> Self {
        Self {
            tables: 6,
            bits_per_word: 14,
            seed: 7,
        }
    }
}

/// Bit-sampling vocabulary.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    /// Sampled bit positions per table.
    tables: Vec<Vec<u16>>,
    bits_per_word: usize,
}

impl Vocabulary {
    pub fn new(config: &VocabularyConfig) -> Self {
        let bits = config.bits_per_word.clamp(1, 24);
        let mut rng = StdRng::seed_from_u64(config.seed);
        let tables = (0..config.tables.max(1))
            .map(|_| {
                let mut positions: Vec<u16> = index::sample(&mut rng, DESCRIPTOR_BITS, bits)
                    .into_iter()
                    .map(|b| b as u16)
                    .collect();
                positions.sort_unstable();
                positions
            })
            .collect();
        Self {
            tables,
            bits_per_word: bits,
        }
    }

    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }

    /// Number of distinct word ids.
    pub fn num_words(&self) -> usize {
        self.tables.len() << self.bits_per_word
    }

    /// Word of `descriptor` in hash table `table`.
    pub fn word(&self, descriptor: &Descriptor, table: usize) -> u32 {
        let mut code = 0u32;
        for (i, &bit) in self.tables[table].iter().enumerate() {
            let byte = descriptor[bit as usize / 8];
            if byte & (1 << (bit % 8)) != 0 {
                code |= 1 << i;
            }
        }
        ((table as u32) << self.bits_per_word) | code
    }

    /// Bag-of-words vector of a descriptor set.
    pub fn transform(&self, descriptors: &[Descriptor]) -> BowVector {
        let mut bow = BowVector::new();
        for d in descriptors {
            for table in 0..self.tables.len() {
                *bow.entry(self.word(d, table)).or_insert(0.0) += 1.0;
            }
        }

        // Normalize (L1 norm)
        let sum: f64 = bow.values().sum();
        if sum > 0.0 {
            for v in bow.values_mut() {
                *v /= sum;
            }
        }
        bow
    }

    /// L1 similarity, `1 - 0.5 * ||v1 - v2||_1`, in [0, 1].
    pub fn score(v1: &BowVector, v2: &BowVector) -> f64 {
        let mut diff_sum = 0.0;
        for (word_id, w1) in v1 {
            let w2 = v2.get(word_id).copied().unwrap_or(0.0);
            diff_sum += (w1 - w2).abs();
        }
        for (word_id, w2) in v2 {
            if !v1.contains_key(word_id) {
                diff_sum += w2.abs();
            }
        }
        (1.0 - 0.5 * diff_sum).clamp(0.0, 1.0)
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new(&VocabularyConfig::default())
    }
}
