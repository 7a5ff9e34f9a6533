//! Error taxonomy of the reconstruction core.
//!
//! Everything here is a recoverable status value: the tracker reports these
//! through [`crate::tracking::TrackingResult`] instead of unwinding. The only
//! terminal status is [`TrackingError::PermanentlyLost`], cleared by an
//! explicit reset.

use thiserror::Error;

/// A frame that cannot be used for tracking. Recovered by skipping the frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    #[error("image buffer holds {len} bytes, expected {width}x{height}")]
    InvalidBuffer { width: usize, height: usize, len: usize },

    #[error("image {width}x{height} is below the minimum usable size {min}")]
    TooSmall { width: usize, height: usize, min: usize },

    #[error("image contrast {contrast:.2} is below the minimum {min:.2}")]
    LowContrast { contrast: f64, min: f64 },

    #[error("only {found} features extracted, {required} required")]
    TooFewFeatures { found: usize, required: usize },
}

/// Bootstrapping the map from two views failed. Retried on the next frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InitializationError {
    #[error("waiting for a second frame")]
    AwaitingSecondFrame,

    #[error("too few matches for initialization: {found} < {required}")]
    TooFewMatches { found: usize, required: usize },

    #[error("no two-view model could be estimated")]
    NoModel,

    #[error("two-view reconstruction is ambiguous")]
    Ambiguous,

    #[error("insufficient parallax: {parallax_deg:.2} deg < {required_deg:.2} deg")]
    InsufficientParallax { parallax_deg: f64, required_deg: f64 },

    #[error("too few triangulated points: {found} < {required}")]
    TooFewTriangulated { found: usize, required: usize },

    #[error("map still holds {keyframes} keyframes; reset required")]
    MapNotEmpty { keyframes: usize },
}

/// Loss of tracking and the relocalization outcome.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackingError {
    #[error("tracking lost: {inliers} inliers out of {attempted} matches")]
    Lost { inliers: usize, attempted: usize },

    #[error("relocalization attempt {attempt}/{max_attempts} failed")]
    RelocalizationFailed { attempt: u32, max_attempts: u32 },

    #[error("tracking permanently lost after {attempts} relocalization attempts; reset required")]
    PermanentlyLost { attempts: u32 },

    #[error("illegal tracking transition: {event} while {state}")]
    InvalidTransition { state: &'static str, event: &'static str },
}

/// Why a loop candidate did not pass geometric verification.
///
/// Logged by the loop closer; never reaches per-frame results.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoopRejection {
    #[error("keyframe {0} is no longer in the map")]
    MissingKeyFrame(u64),

    #[error("too few descriptor matches: {found} < {required}")]
    TooFewMatches { found: usize, required: usize },

    #[error("no similarity transform explains the matches")]
    NoTransform,

    #[error("too few geometric inliers: {found} < {required}")]
    TooFewInliers { found: usize, required: usize },
}

/// Rejected configuration value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Any non-fatal condition reported for a processed frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Initialization(#[from] InitializationError),

    #[error(transparent)]
    Tracking(#[from] TrackingError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
