//! Seeded hypothesize-and-verify loop shared by the robust estimators.

use rand::rngs::StdRng;
use rand::seq::index;

/// Parameters of one RANSAC run.
#[derive(Debug, Clone, Copy)]
pub struct RansacParams {
    /// Hard cap on hypotheses.
    pub max_iterations: usize,
    /// Desired probability of drawing at least one all-inlier sample.
    pub confidence: f64,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            confidence: 0.99,
        }
    }
}

/// Best hypothesis found by [`run`].
#[derive(Debug, Clone)]
pub struct RansacOutcome<M> {
    pub model: M,
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
    pub score: f64,
    pub iterations: usize,
}

/// Number of iterations needed to hit `confidence` with the given inlier ratio.
pub fn adaptive_iterations(inlier_ratio: f64, sample_size: usize, confidence: f64, cap: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return cap;
    }
    let all_inliers = inlier_ratio.powi(sample_size as i32);
    if all_inliers >= 1.0 - f64::EPSILON {
        return 1;
    }
    let n = (1.0 - confidence).ln() / (1.0 - all_inliers).ln();
    if n.is_finite() {
        (n.ceil() as usize).clamp(1, cap)
    } else {
        cap
    }
}

/// Runs RANSAC over `n` data items.
///
/// `fit` builds a model from a minimal sample of indices; `evaluate` returns
/// the inlier mask and a score (higher is better) for a model over all data.
/// Ties on score keep the earlier hypothesis, so the result depends only on
/// the data order and the RNG state.
pub fn run<M, F, E>(
    n: usize,
    sample_size: usize,
    params: &RansacParams,
    rng: &mut StdRng,
    mut fit: F,
    mut evaluate: E,
) -> Option<RansacOutcome<M>>
where
    F: FnMut(&[usize]) -> Option<M>,
    E: FnMut(&M) -> (Vec<bool>, f64),
{
    if sample_size == 0 || n < sample_size {
        return None;
    }
    let mut best: Option<RansacOutcome<M>> = None;
    let mut needed = params.max_iterations;
    let mut iteration = 0;
    let mut sample = Vec::with_capacity(sample_size);

    while iteration < needed.min(params.max_iterations) {
        iteration += 1;
        sample.clear();
        sample.extend(index::sample(rng, n, sample_size).into_iter());
        let Some(model) = fit(&sample) else {
            continue;
        };
        let (inliers, score) = evaluate(&model);
        let better = best.as_ref().map_or(true, |b| score > b.score);
        if better {
            let num_inliers = inliers.iter().filter(|&&x| x).count();
            needed = adaptive_iterations(
                num_inliers as f64 / n as f64,
                sample_size,
                params.confidence,
                params.max_iterations,
            );
            best = Some(RansacOutcome {
                model,
                inliers,
                num_inliers,
                score,
                iterations: iteration,
            });
        }
    }
    if let Some(b) = best.as_mut() {
        b.iterations = iteration;
    }
    best
}
