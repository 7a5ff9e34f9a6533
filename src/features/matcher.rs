//! Descriptor matching with a symmetric ratio test and a geometric check.
//!
//! A pair survives when each descriptor is the other's nearest neighbour and
//! the nearest neighbour beats the second best by the ratio in both
//! directions. `match_features` then keeps only pairs consistent with a
//! RANSAC homography or fundamental matrix. The RANSAC input is put into an
//! order that does not depend on which image was passed first, so matching
//! A against B gives the same pairs as B against A.

use std::cmp::Ordering;

use nalgebra::Vector2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::extractor::Descriptor;
use crate::geometry::ransac::RansacParams;
use crate::geometry::two_view::{find_fundamental, find_homography};

/// Minimum number of candidate pairs for the geometric check.
pub const MIN_GEOMETRIC_MATCHES: usize = 8;

/// Number of differing bits between two descriptors.
#[inline]
pub fn hamming_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// A correspondence between feature `query_idx` of the first set and
/// `train_idx` of the second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureMatch {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: u32,
    /// 1 − (best / second best) distance, the worse of both directions.
    pub confidence: f64,
}

impl FeatureMatch {
    /// The same correspondence seen from the other image.
    pub fn swapped(&self) -> Self {
        Self {
            query_idx: self.train_idx,
            train_idx: self.query_idx,
            ..*self
        }
    }
}

/// Model that explained the surviving matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometricModel {
    Homography,
    Fundamental,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Lowe ratio; best/second-best must be strictly below it.
    pub ratio: f64,
    /// Pairs further apart than this many bits are never matched.
    pub max_distance: u32,
    /// Pixel noise used by the RANSAC scores.
    pub ransac_sigma: f64,
    pub ransac_iterations: usize,
    pub seed: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            ratio: 0.8,
            max_distance: 64,
            ransac_sigma: 1.0,
            ransac_iterations: 200,
            seed: 42,
        }
    }
}

/// Result of [`FeatureMatcher::match_features`].
#[derive(Debug, Clone, Default)]
pub struct MatchSet {
    pub matches: Vec<FeatureMatch>,
    pub model: Option<GeometricModel>,
}

impl MatchSet {
    /// Mean match confidence, zero when empty.
    pub fn mean_confidence(&self) -> f64 {
        if self.matches.is_empty() {
            return 0.0;
        }
        self.matches.iter().map(|m| m.confidence).sum::<f64>() / self.matches.len() as f64
    }
}

/// Nearest and second-nearest distances of one descriptor.
#[derive(Debug, Clone, Copy)]
struct Neighbours {
    best_idx: usize,
    best: u32,
    second: u32,
}

fn nearest(query: &Descriptor, train: &[Descriptor]) -> Option<Neighbours> {
    let mut result: Option<Neighbours> = None;
    for (idx, d) in train.iter().enumerate() {
        let dist = hamming_distance(query, d);
        result = Some(match result {
            None => Neighbours {
                best_idx: idx,
                best: dist,
                second: u32::MAX,
            },
            Some(n) if dist < n.best => Neighbours {
                best_idx: idx,
                best: dist,
                second: n.best,
            },
            Some(n) if dist < n.second => Neighbours { second: dist, ..n },
            Some(n) => n,
        });
    }
    result
}

/// Ratio best/second as used by the test; a missing second neighbour passes.
fn distance_ratio(n: &Neighbours) -> f64 {
    if n.second == u32::MAX {
        return 0.0;
    }
    if n.second == 0 {
        return 1.0;
    }
    n.best as f64 / n.second as f64
}

pub struct FeatureMatcher {
    config: MatcherConfig,
}

impl FeatureMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Mutual nearest neighbours passing the ratio test in both directions,
    /// sorted by `query_idx`.
    pub fn match_descriptors(&self, a: &[Descriptor], b: &[Descriptor]) -> Vec<FeatureMatch> {
        if a.is_empty() || b.is_empty() {
            return Vec::new();
        }
        let backward: Vec<Option<Neighbours>> = b.iter().map(|d| nearest(d, a)).collect();

        let mut matches = Vec::new();
        for (i, desc) in a.iter().enumerate() {
            let Some(fwd) = nearest(desc, b) else { continue };
            if fwd.best > self.config.max_distance {
                continue;
            }
            let Some(bwd) = backward[fwd.best_idx] else { continue };
            if bwd.best_idx != i {
                continue;
            }
            let ratio = distance_ratio(&fwd).max(distance_ratio(&bwd));
            if ratio >= self.config.ratio {
                continue;
            }
            matches.push(FeatureMatch {
                query_idx: i,
                train_idx: fwd.best_idx,
                distance: fwd.best,
                confidence: (1.0 - ratio).clamp(0.0, 1.0),
            });
        }
        matches
    }

    /// Descriptor matching followed by the geometric check.
    ///
    /// Fewer than [`MIN_GEOMETRIC_MATCHES`] candidates yield an empty set.
    pub fn match_features(
        &self,
        points_a: &[Vector2<f64>],
        desc_a: &[Descriptor],
        points_b: &[Vector2<f64>],
        desc_b: &[Descriptor],
    ) -> MatchSet {
        let candidates = self.match_descriptors(desc_a, desc_b);
        if candidates.len() < MIN_GEOMETRIC_MATCHES {
            debug!("[Matcher] {} candidates, geometric check skipped", candidates.len());
            return MatchSet::default();
        }

        // Orientation-independent order for RANSAC.
        let mut ordered = candidates.clone();
        ordered.sort_by(|x, y| {
            let kx = pair_key(x, points_a, points_b);
            let ky = pair_key(y, points_a, points_b);
            kx.partial_cmp(&ky).unwrap_or(Ordering::Equal)
        });
        let mut p1: Vec<Vector2<f64>> = ordered.iter().map(|m| points_a[m.query_idx]).collect();
        let mut p2: Vec<Vector2<f64>> = ordered.iter().map(|m| points_b[m.train_idx]).collect();
        if compare_point_lists(&p1, &p2) == Ordering::Greater {
            std::mem::swap(&mut p1, &mut p2);
        }

        let params = RansacParams {
            max_iterations: self.config.ransac_iterations,
            ..RansacParams::default()
        };
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let sigma = self.config.ransac_sigma;
        let homography = find_homography(&p1, &p2, sigma, &params, &mut rng);
        let fundamental = find_fundamental(&p1, &p2, sigma, &params, &mut rng);

        let h_inliers = homography.as_ref().map_or(0, |h| h.num_inliers);
        let f_inliers = fundamental.as_ref().map_or(0, |f| f.num_inliers);
        let (model, mask) = match (homography, fundamental) {
            (Some(h), _) if h_inliers >= f_inliers => (GeometricModel::Homography, h.inliers),
            (_, Some(f)) => (GeometricModel::Fundamental, f.inliers),
            (Some(h), None) => (GeometricModel::Homography, h.inliers),
            (None, None) => return MatchSet::default(),
        };

        let mut matches: Vec<FeatureMatch> = ordered
            .into_iter()
            .zip(mask)
            .filter_map(|(m, keep)| keep.then_some(m))
            .collect();
        matches.sort_by_key(|m| m.query_idx);
        debug!(
            "[Matcher] {} candidates -> {} inliers ({:?}, H={} F={})",
            candidates.len(),
            matches.len(),
            model,
            h_inliers,
            f_inliers
        );
        MatchSet {
            matches,
            model: Some(model),
        }
    }
}

/// Uniform bucket grid over keypoint positions for radius queries.
#[derive(Debug, Clone)]
pub struct FeatureGrid {
    cell_size: f64,
    cols: usize,
    rows: usize,
    cells: Vec<Vec<usize>>,
    points: Vec<Vector2<f64>>,
}

impl FeatureGrid {
    pub fn new(points: &[Vector2<f64>], width: u32, height: u32, cell_size: f64) -> Self {
        let cell_size = cell_size.max(1.0);
        let cols = ((width as f64 / cell_size).ceil() as usize).max(1);
        let rows = ((height as f64 / cell_size).ceil() as usize).max(1);
        let mut grid = Self {
            cell_size,
            cols,
            rows,
            cells: vec![Vec::new(); cols * rows],
            points: points.to_vec(),
        };
        for (i, p) in points.iter().enumerate() {
            let (c, r) = grid.cell_of(p);
            grid.cells[r * cols + c].push(i);
        }
        grid
    }

    fn cell_of(&self, p: &Vector2<f64>) -> (usize, usize) {
        let c = (p.x / self.cell_size).floor().clamp(0.0, (self.cols - 1) as f64) as usize;
        let r = (p.y / self.cell_size).floor().clamp(0.0, (self.rows - 1) as f64) as usize;
        (c, r)
    }

    /// Indices of the points within `radius` of `center`, ascending.
    pub fn radius_search(&self, center: &Vector2<f64>, radius: f64) -> Vec<usize> {
        let lo = Vector2::new(center.x - radius, center.y - radius);
        let hi = Vector2::new(center.x + radius, center.y + radius);
        let (c0, r0) = self.cell_of(&lo);
        let (c1, r1) = self.cell_of(&hi);
        let r2 = radius * radius;
        let mut found = Vec::new();
        for r in r0..=r1 {
            for c in c0..=c1 {
                found.extend(
                    self.cells[r * self.cols + c]
                        .iter()
                        .copied()
                        .filter(|&i| (self.points[i] - center).norm_squared() <= r2),
                );
            }
        }
        found.sort_unstable();
        found
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Sort key that is identical for a pair and its swapped counterpart.
fn pair_key(m: &FeatureMatch, points_a: &[Vector2<f64>], points_b: &[Vector2<f64>]) -> (u32, [f64; 4]) {
    let pa = points_a[m.query_idx];
    let pb = points_b[m.train_idx];
    let (lo, hi) = if (pa.x, pa.y) <= (pb.x, pb.y) { (pa, pb) } else { (pb, pa) };
    (m.distance, [lo.x, lo.y, hi.x, hi.y])
}

fn compare_point_lists(a: &[Vector2<f64>], b: &[Vector2<f64>]) -> Ordering {
    for (pa, pb) in a.iter().zip(b) {
        match (pa.x, pa.y).partial_cmp(&(pb.x, pb.y)) {
            Some(Ordering::Equal) | None => continue,
            Some(order) => return order,
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_descriptors(n: usize, seed: u64) -> Vec<Descriptor> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen()).collect()
    }

    /// Flips `bits` distinct low bits of a descriptor.
    fn perturb(d: &Descriptor, bits: usize) -> Descriptor {
        let mut out = *d;
        for i in 0..bits {
            out[i % 32] ^= 1 << (i / 32);
        }
        out
    }

    /// Two views of random 3D points with a sideways camera motion. The last
    /// ten pairs are moved off their epipolar lines; twenty extra features in
    /// the second view have no counterpart.
    fn scene() -> (Vec<Vector2<f64>>, Vec<Descriptor>, Vec<Vector2<f64>>, Vec<Descriptor>) {
        let mut rng = StdRng::seed_from_u64(11);
        let (f, cx, cy) = (500.0, 320.0, 240.0);
        let desc_a = random_descriptors(80, 1);
        let mut points_a = Vec::new();
        let mut points_b = Vec::new();
        for i in 0..80 {
            let x: f64 = rng.gen_range(-1.0..1.0);
            let y: f64 = rng.gen_range(-0.8..0.8);
            let z: f64 = rng.gen_range(2.0..5.0);
            points_a.push(Vector2::new(f * x / z + cx, f * y / z + cy));
            let mut pb = Vector2::new(f * (x - 0.2) / z + cx, f * y / z + cy);
            if i >= 70 {
                pb.y += 40.0;
            }
            points_b.push(pb);
        }
        let mut desc_b: Vec<Descriptor> = desc_a.iter().map(|d| perturb(d, 6)).collect();
        desc_b.extend(random_descriptors(20, 2));
        points_b.extend((0..20).map(|i| Vector2::new(30.0 * i as f64, 100.0)));
        // Reverse so indices differ between the two sets.
        points_b.reverse();
        desc_b.reverse();
        (points_a, desc_a, points_b, desc_b)
    }

    #[test]
    fn test_hamming_distance() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        b[0] = 0b1011;
        b[31] = 0xff;
        assert_eq!(hamming_distance(&a, &b), 11);
        assert_eq!(hamming_distance(&b, &b), 0);
    }

    #[test]
    fn test_matches_are_one_to_one_with_bounded_confidence() {
        let (_, desc_a, _, desc_b) = scene();
        let matcher = FeatureMatcher::new(MatcherConfig::default());
        let matches = matcher.match_descriptors(&desc_a, &desc_b);
        assert_eq!(matches.len(), 80);
        let mut trains: Vec<usize> = matches.iter().map(|m| m.train_idx).collect();
        trains.sort_unstable();
        trains.dedup();
        assert_eq!(trains.len(), matches.len());
        assert!(matches.iter().all(|m| (0.0..=1.0).contains(&m.confidence)));
    }

    #[test]
    fn test_ratio_test_rejects_ambiguous_pairs() {
        let base = random_descriptors(1, 5)[0];
        let a = vec![base];
        // Two near-identical candidates: ratio close to 1.
        let b = vec![perturb(&base, 4), perturb(&base, 5)];
        let matcher = FeatureMatcher::new(MatcherConfig::default());
        assert!(matcher.match_descriptors(&a, &b).is_empty());
    }

    #[test]
    fn test_geometric_check_removes_outliers() {
        let (pa, da, pb, db) = scene();
        let matcher = FeatureMatcher::new(MatcherConfig::default());
        let set = matcher.match_features(&pa, &da, &pb, &db);
        assert_eq!(set.model, Some(GeometricModel::Fundamental));
        assert_eq!(set.matches.len(), 70);
        assert!(set.matches.iter().all(|m| m.query_idx < 70));
    }

    #[test]
    fn test_matching_is_symmetric() {
        let (pa, da, pb, db) = scene();
        let matcher = FeatureMatcher::new(MatcherConfig::default());
        let ab = matcher.match_features(&pa, &da, &pb, &db);
        let ba = matcher.match_features(&pb, &db, &pa, &da);

        let mut ab_pairs: Vec<(usize, usize)> = ab.matches.iter().map(|m| (m.query_idx, m.train_idx)).collect();
        let mut ba_pairs: Vec<(usize, usize)> = ba.matches.iter().map(|m| (m.train_idx, m.query_idx)).collect();
        ab_pairs.sort_unstable();
        ba_pairs.sort_unstable();
        assert!(!ab_pairs.is_empty());
        assert_eq!(ab_pairs, ba_pairs);

        let mut swapped: Vec<FeatureMatch> = ba.matches.iter().map(|m| m.swapped()).collect();
        swapped.sort_by_key(|m| m.query_idx);
        for (m, n) in ab.matches.iter().zip(&swapped) {
            assert_eq!(m, n);
        }
    }

    #[test]
    fn test_grid_radius_search_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(21);
        let points: Vec<Vector2<f64>> = (0..300)
            .map(|_| Vector2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0)))
            .collect();
        let grid = FeatureGrid::new(&points, 640, 480, 32.0);
        let center = Vector2::new(300.0, 200.0);
        let expected: Vec<usize> = (0..points.len())
            .filter(|&i| (points[i] - center).norm() <= 45.0)
            .collect();
        assert_eq!(grid.radius_search(&center, 45.0), expected);
        assert!(grid.radius_search(&Vector2::new(-500.0, -500.0), 10.0).is_empty());
    }

    #[test]
    fn test_too_few_candidates_yield_empty_set() {
        let (pa, da, pb, db) = scene();
        let matcher = FeatureMatcher::new(MatcherConfig::default());
        let set = matcher.match_features(&pa[..5], &da[..5], &pb, &db);
        assert!(set.matches.is_empty());
        assert!(set.model.is_none());
    }
}
