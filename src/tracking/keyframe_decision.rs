//! KeyFrame decision criteria.

use serde::{Deserialize, Serialize};

use crate::geometry::SE3;

/// Keyframe insertion thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyFrameConfig {
    /// Rotation since the last keyframe that triggers a new one, in degrees.
    pub max_rotation_deg: f64,
    /// Translation since the last keyframe, as a fraction of its median scene depth.
    pub max_translation_ratio: f64,
    /// Seconds since the last keyframe.
    pub max_interval: f64,
    /// Minimum ratio of tracked points to the reference keyframe's points.
    pub min_tracked_ratio: f64,
    /// Minimum frames between keyframes.
    pub min_frames: usize,
    /// Maximum frames between keyframes.
    pub max_frames: usize,
}

impl Default for KeyFrameConfig {
    fn default() -> Self {
        Self {
            max_rotation_deg: 10.0,
            max_translation_ratio: 0.08,
            max_interval: 1.0,
            min_tracked_ratio: 0.9,
            min_frames: 0,
            max_frames: 15,
        }
    }
}

/// Why a keyframe was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFrameReason {
    Rotation,
    Translation,
    Elapsed,
    TrackedDrop,
    FrameCount,
}

/// Measurements of the current frame against the last keyframe.
#[derive(Debug, Clone)]
pub struct KeyFrameContext {
    /// Current pose relative to the last keyframe, `T_curr ∘ T_kf⁻¹`.
    pub relative: SE3,
    /// Median scene depth of the last keyframe.
    pub median_depth: f64,
    /// Seconds since the last keyframe.
    pub elapsed: f64,
    /// Map points tracked in the current frame.
    pub tracked: usize,
    /// Map points of the reference keyframe.
    pub reference_points: usize,
}

/// Criteria for deciding whether to create a new KeyFrame:
/// - rotation or translation since the last keyframe
/// - time since the last keyframe
/// - drop of the tracked point count
pub struct KeyFrameDecision {
    config: KeyFrameConfig,
    /// Frame counter since last KeyFrame.
    frames_since_kf: usize,
}

impl KeyFrameDecision {
    pub fn new(config: KeyFrameConfig) -> Self {
        Self {
            config,
            frames_since_kf: 0,
        }
    }

    pub fn config(&self) -> &KeyFrameConfig {
        &self.config
    }

    /// Decide whether the current frame becomes a keyframe.
    ///
    /// Call once per tracked frame. The counter restarts whenever a keyframe
    /// is requested.
    pub fn evaluate(&mut self, ctx: &KeyFrameContext) -> Option<KeyFrameReason> {
        self.frames_since_kf += 1;

        // Don't create KF too soon
        if self.frames_since_kf < self.config.min_frames {
            return None;
        }

        let reason = self.check(ctx);
        if reason.is_some() {
            self.frames_since_kf = 0;
        }
        reason
    }

    fn check(&self, ctx: &KeyFrameContext) -> Option<KeyFrameReason> {
        if ctx.relative.rotation_angle().to_degrees() > self.config.max_rotation_deg {
            return Some(KeyFrameReason::Rotation);
        }
        let moved = ctx.relative.camera_center().norm();
        if ctx.median_depth > 0.0 && moved > self.config.max_translation_ratio * ctx.median_depth {
            return Some(KeyFrameReason::Translation);
        }
        if ctx.elapsed >= self.config.max_interval {
            return Some(KeyFrameReason::Elapsed);
        }
        if ctx.reference_points > 0 {
            let ratio = ctx.tracked as f64 / ctx.reference_points as f64;
            if ratio < self.config.min_tracked_ratio {
                return Some(KeyFrameReason::TrackedDrop);
            }
        }
        // Always create KF if max frames exceeded
        if self.frames_since_kf >= self.config.max_frames {
            return Some(KeyFrameReason::FrameCount);
        }
        None
    }

    /// Restart the frame counter, e.g. after initialization or relocalization.
    pub fn reset(&mut self) {
        self.frames_since_kf = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::se3::rotation_from_euler;
    use nalgebra::{UnitQuaternion, Vector3};

    fn ctx(relative: SE3, elapsed: f64, tracked: usize) -> KeyFrameContext {
        KeyFrameContext {
            relative,
            median_depth: 2.0,
            elapsed,
            tracked,
            reference_points: 100,
        }
    }

    #[test]
    fn test_thresholds() {
        let mut decision = KeyFrameDecision::new(KeyFrameConfig::default());
        let still = SE3::identity();
        assert_eq!(decision.evaluate(&ctx(still.clone(), 0.1, 95)), None);

        let turned = SE3::from_parts(rotation_from_euler(0.0, 0.3, 0.0), Vector3::zeros());
        assert_eq!(decision.evaluate(&ctx(turned, 0.1, 95)), Some(KeyFrameReason::Rotation));

        let moved = SE3::from_parts(UnitQuaternion::identity(), Vector3::new(0.2, 0.0, 0.0));
        assert_eq!(decision.evaluate(&ctx(moved, 0.1, 95)), Some(KeyFrameReason::Translation));

        assert_eq!(decision.evaluate(&ctx(still.clone(), 1.5, 95)), Some(KeyFrameReason::Elapsed));
        assert_eq!(decision.evaluate(&ctx(still, 0.1, 50)), Some(KeyFrameReason::TrackedDrop));
    }

    #[test]
    fn test_frame_count_and_min_frames() {
        let mut decision = KeyFrameDecision::new(KeyFrameConfig {
            min_frames: 2,
            max_frames: 4,
            ..Default::default()
        });
        let still = ctx(SE3::identity(), 0.0, 100);
        let dropped = ctx(SE3::identity(), 0.0, 10);
        // Too soon even though tracking dropped.
        assert_eq!(decision.evaluate(&dropped), None);
        assert_eq!(decision.evaluate(&still), None);
        assert_eq!(decision.evaluate(&still), None);
        assert_eq!(decision.evaluate(&still), Some(KeyFrameReason::FrameCount));
        assert_eq!(decision.evaluate(&dropped), None);
    }
}
