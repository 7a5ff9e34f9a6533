//! ORB-style feature extraction.
//!
//! Per pyramid level:
//! - FAST-9 corners, ranked by the Harris response
//! - 3x3 non-maximum suppression, then a grid pass that keeps the strongest
//!   corners of every cell first so features spread over the image
//! - orientation from the intensity centroid of a circular patch
//! - 256-bit steered BRIEF on a blurred copy of the level
//!
//! Frames below the minimum size or contrast yield an empty set.

use nalgebra::Vector2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::image::GrayImage;
use crate::error::FrameError;

/// 256-bit binary descriptor.
pub type Descriptor = [u8; 32];

/// Radius of the orientation patch.
const HALF_PATCH_SIZE: i32 = 15;
/// Corners closer than this to the level border are dropped.
const EDGE_THRESHOLD: usize = 19;
/// Radius of the BRIEF sampling disk (stays inside the patch after rotation).
const PATTERN_RADIUS: i32 = 13;
/// Fixed seed of the BRIEF sampling pattern.
const PATTERN_SEED: u64 = 0x0b_21ef;
const HARRIS_K: f64 = 0.04;
const HARRIS_BLOCK: i32 = 3;

/// Bresenham circle of radius 3 used by the FAST test.
const FAST_CIRCLE: [(i32, i32); 16] = [
    (0, -3), (1, -3), (2, -2), (3, -1), (3, 0), (3, 1), (2, 2), (1, 3),
    (0, 3), (-1, 3), (-2, 2), (-3, 1), (-3, 0), (-3, -1), (-2, -2), (-1, -3),
];

/// Extraction settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Upper bound on features per frame over all levels.
    pub max_features: usize,
    pub n_levels: usize,
    pub scale_factor: f64,
    pub fast_threshold: u8,
    /// Fallback threshold for grid cells where nothing passes `fast_threshold`.
    pub min_fast_threshold: u8,
    /// Side of the square grid cells used to spread features, in pixels.
    pub grid_cell_size: usize,
    /// Frames smaller than this in either dimension are unusable.
    pub min_image_size: usize,
    /// Frames whose intensity standard deviation is below this are unusable.
    pub min_contrast: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            max_features: 1000,
            n_levels: 4,
            scale_factor: 1.2,
            fast_threshold: 20,
            min_fast_threshold: 7,
            grid_cell_size: 32,
            min_image_size: 64,
            min_contrast: 4.0,
        }
    }
}

/// A detected feature. `pt` is in level-0 pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub pt: Vector2<f64>,
    pub octave: usize,
    /// Scale factor of `octave` relative to the full-resolution image.
    pub scale: f64,
    /// Orientation in radians.
    pub angle: f64,
    pub response: f64,
}

/// Features of one image, descriptors aligned with keypoints.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Scale factor and measurement variance per pyramid level.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleLevels {
    pub factors: Vec<f64>,
    pub sigma2: Vec<f64>,
}

impl ScaleLevels {
    pub fn new(n_levels: usize, scale_factor: f64) -> Self {
        let factors: Vec<f64> = (0..n_levels.max(1)).map(|l| scale_factor.powi(l as i32)).collect();
        let sigma2 = factors.iter().map(|f| f * f).collect();
        Self { factors, sigma2 }
    }

    pub fn from_config(config: &FeatureConfig) -> Self {
        Self::new(config.n_levels, config.scale_factor)
    }

    /// Measurement variance at `octave`, clamped to the last level.
    pub fn sigma2(&self, octave: usize) -> f64 {
        self.sigma2[octave.min(self.sigma2.len() - 1)]
    }

    pub fn factor(&self, octave: usize) -> f64 {
        self.factors[octave.min(self.factors.len() - 1)]
    }

    pub fn num_levels(&self) -> usize {
        self.factors.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct Corner {
    x: usize,
    y: usize,
    response: f64,
}

/// Deterministic ORB-style extractor.
pub struct FeatureExtractor {
    config: FeatureConfig,
    levels: ScaleLevels,
    pattern: Vec<[i32; 4]>,
    umax: Vec<i32>,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let mut sample = || loop {
            let x = rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
            let y = rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
            if x * x + y * y <= PATTERN_RADIUS * PATTERN_RADIUS {
                return (x, y);
            }
        };
        let mut pattern = Vec::with_capacity(256);
        while pattern.len() < 256 {
            let (ax, ay) = sample();
            let (bx, by) = sample();
            if (ax, ay) != (bx, by) {
                pattern.push([ax, ay, bx, by]);
            }
        }

        let r2 = (HALF_PATCH_SIZE * HALF_PATCH_SIZE) as f64;
        let umax = (0..=HALF_PATCH_SIZE)
            .map(|v| (r2 - (v * v) as f64).sqrt().round() as i32)
            .collect();

        Self {
            levels: ScaleLevels::from_config(&config),
            config,
            pattern,
            umax,
        }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn scale_levels(&self) -> &ScaleLevels {
        &self.levels
    }

    /// Checks the minimum resolution and contrast.
    pub fn check_usable(&self, image: &GrayImage) -> Result<(), FrameError> {
        let min = self.config.min_image_size;
        if image.width() < min || image.height() < min {
            return Err(FrameError::TooSmall {
                width: image.width(),
                height: image.height(),
                min,
            });
        }
        let contrast = image.contrast();
        if contrast < self.config.min_contrast {
            return Err(FrameError::LowContrast {
                contrast,
                min: self.config.min_contrast,
            });
        }
        Ok(())
    }

    /// Extracts features. Empty when the image is unusable.
    pub fn extract(&self, image: &GrayImage) -> FeatureSet {
        if let Err(reason) = self.check_usable(image) {
            debug!("[Extractor] frame unusable: {}", reason);
            return FeatureSet::default();
        }

        let n_levels = self.levels.num_levels();
        let inv_scale = 1.0 / self.config.scale_factor;
        let mut per_level = Vec::with_capacity(n_levels);
        let mut desired = self.config.max_features as f64 * (1.0 - inv_scale)
            / (1.0 - inv_scale.powi(n_levels as i32));
        let mut assigned = 0;
        for level in 0..n_levels {
            let n = if level + 1 == n_levels {
                self.config.max_features.saturating_sub(assigned)
            } else {
                desired.round() as usize
            };
            per_level.push(n);
            assigned += n;
            desired *= inv_scale;
        }

        let mut features = FeatureSet::default();
        for (level, &target) in per_level.iter().enumerate() {
            let factor = self.levels.factor(level);
            let w = (image.width() as f64 / factor).round() as usize;
            let h = (image.height() as f64 / factor).round() as usize;
            if w <= 2 * EDGE_THRESHOLD || h <= 2 * EDGE_THRESHOLD {
                break;
            }
            let level_image = image.resize(w, h);
            let blurred = level_image.gaussian_blur(2.0);

            for corner in self.detect_distributed(&level_image, target) {
                let angle = self.intensity_centroid_angle(&level_image, corner.x, corner.y);
                let descriptor = self.describe(&blurred, corner.x, corner.y, angle);
                features.keypoints.push(KeyPoint {
                    pt: Vector2::new(corner.x as f64 * factor, corner.y as f64 * factor),
                    octave: level,
                    scale: factor,
                    angle,
                    response: corner.response,
                });
                features.descriptors.push(descriptor);
            }
        }
        debug!("[Extractor] {} features over {} levels", features.len(), n_levels);
        features
    }

    /// FAST corners spread over a grid, at most `target` of them.
    fn detect_distributed(&self, image: &GrayImage, target: usize) -> Vec<Corner> {
        if target == 0 {
            return Vec::new();
        }
        let cell = self.config.grid_cell_size.max(8);
        let (w, h) = (image.width(), image.height());
        let x_range = EDGE_THRESHOLD..w - EDGE_THRESHOLD;
        let y_range = EDGE_THRESHOLD..h - EDGE_THRESHOLD;
        let cols = (x_range.len() + cell - 1) / cell;
        let rows = (y_range.len() + cell - 1) / cell;

        let mut cells: Vec<Vec<Corner>> = vec![Vec::new(); cols * rows];
        for row in 0..rows {
            for col in 0..cols {
                let x0 = x_range.start + col * cell;
                let y0 = y_range.start + row * cell;
                let x1 = (x0 + cell).min(x_range.end);
                let y1 = (y0 + cell).min(y_range.end);
                let mut found = self.fast_in_region(image, x0, x1, y0, y1, self.config.fast_threshold);
                if found.is_empty() && self.config.min_fast_threshold < self.config.fast_threshold {
                    found = self.fast_in_region(image, x0, x1, y0, y1, self.config.min_fast_threshold);
                }
                found.sort_by(|a, b| b.response.total_cmp(&a.response).then((a.y, a.x).cmp(&(b.y, b.x))));
                cells[row * cols + col] = found;
            }
        }

        // Take the best remaining corner of every cell per round.
        let mut selected = Vec::with_capacity(target);
        let mut rank = 0;
        loop {
            let mut round: Vec<Corner> = cells.iter().filter_map(|c| c.get(rank).copied()).collect();
            if round.is_empty() {
                break;
            }
            round.sort_by(|a, b| b.response.total_cmp(&a.response).then((a.y, a.x).cmp(&(b.y, b.x))));
            for corner in round {
                if selected.len() == target {
                    return selected;
                }
                selected.push(corner);
            }
            rank += 1;
        }
        selected
    }

    /// FAST-9 with 3x3 non-maximum suppression on the Harris response.
    fn fast_in_region(&self, image: &GrayImage, x0: usize, x1: usize, y0: usize, y1: usize, threshold: u8) -> Vec<Corner> {
        let mut candidates = Vec::new();
        for y in y0..y1 {
            for x in x0..x1 {
                if is_fast_corner(image, x, y, threshold as i32) {
                    candidates.push(Corner {
                        x,
                        y,
                        response: harris_response(image, x, y),
                    });
                }
            }
        }
        candidates
            .iter()
            .filter(|c| {
                !candidates.iter().any(|o| {
                    let dx = o.x.abs_diff(c.x);
                    let dy = o.y.abs_diff(c.y);
                    dx <= 1 && dy <= 1 && (dx, dy) != (0, 0)
                        && (o.response > c.response || (o.response == c.response && (o.y, o.x) < (c.y, c.x)))
                })
            })
            .copied()
            .collect()
    }

    fn intensity_centroid_angle(&self, image: &GrayImage, x: usize, y: usize) -> f64 {
        let (cx, cy) = (x as isize, y as isize);
        let mut m01 = 0.0;
        let mut m10 = 0.0;
        for v in -HALF_PATCH_SIZE..=HALF_PATCH_SIZE {
            let d = self.umax[v.unsigned_abs() as usize];
            for u in -d..=d {
                let val = image.get_clamped(cx + u as isize, cy + v as isize) as f64;
                m10 += u as f64 * val;
                m01 += v as f64 * val;
            }
        }
        m01.atan2(m10)
    }

    fn describe(&self, blurred: &GrayImage, x: usize, y: usize, angle: f64) -> Descriptor {
        let (sin_a, cos_a) = angle.sin_cos();
        let rotate = |px: i32, py: i32| -> (isize, isize) {
            let rx = (cos_a * px as f64 - sin_a * py as f64).round() as isize;
            let ry = (sin_a * px as f64 + cos_a * py as f64).round() as isize;
            (x as isize + rx, y as isize + ry)
        };
        let mut desc = [0u8; 32];
        for (i, [ax, ay, bx, by]) in self.pattern.iter().enumerate() {
            let (pax, pay) = rotate(*ax, *ay);
            let (pbx, pby) = rotate(*bx, *by);
            if blurred.get_clamped(pax, pay) < blurred.get_clamped(pbx, pby) {
                desc[i / 8] |= 1 << (i % 8);
            }
        }
        desc
    }
}

/// Segment test: 9 contiguous circle pixels all brighter or all darker.
fn is_fast_corner(image: &GrayImage, x: usize, y: usize, threshold: i32) -> bool {
    let center = image.get(x, y) as i32;
    let mut brighter = 0;
    let mut darker = 0;
    for i in 0..(16 + 9) {
        let (dx, dy) = FAST_CIRCLE[i % 16];
        let v = image.get_clamped(x as isize + dx as isize, y as isize + dy as isize) as i32;
        if v > center + threshold {
            brighter += 1;
            darker = 0;
        } else if v < center - threshold {
            darker += 1;
            brighter = 0;
        } else {
            brighter = 0;
            darker = 0;
        }
        if brighter >= 9 || darker >= 9 {
            return true;
        }
    }
    false
}

/// Harris corner measure over a (2·HARRIS_BLOCK+1)² window of central differences.
fn harris_response(image: &GrayImage, x: usize, y: usize) -> f64 {
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for dy in -HARRIS_BLOCK..=HARRIS_BLOCK {
        for dx in -HARRIS_BLOCK..=HARRIS_BLOCK {
            let px = x as isize + dx as isize;
            let py = y as isize + dy as isize;
            let ix = (image.get_clamped(px + 1, py) as f64 - image.get_clamped(px - 1, py) as f64) * 0.5;
            let iy = (image.get_clamped(px, py + 1) as f64 - image.get_clamped(px, py - 1) as f64) * 0.5;
            sxx += ix * ix;
            syy += iy * iy;
            sxy += ix * iy;
        }
    }
    let det = sxx * syy - sxy * sxy;
    let trace = sxx + syy;
    det - HARRIS_K * trace * trace
}
