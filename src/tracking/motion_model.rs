//! Velocity-based motion model for pose prediction.

use crate::geometry::SE3;

/// Constant velocity motion model.
///
/// Predicts the next pose by re-applying the relative motion observed
/// between the previous two frames, `T_curr = V ∘ T_prev` with
/// `V = T_prev ∘ T_prev_prev⁻¹`.
#[derive(Debug, Clone, Default)]
pub struct MotionModel {
    /// Previous world-to-camera pose.
    prev_pose: Option<SE3>,
    /// Relative motion between the last two poses.
    velocity: Option<SE3>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the model with a new pose observation.
    pub fn update(&mut self, pose_cw: &SE3) {
        if let Some(prev) = &self.prev_pose {
            self.velocity = Some(pose_cw.compose(&prev.inverse()));
        }
        self.prev_pose = Some(pose_cw.clone());
    }

    /// Restart from `pose_cw` with no velocity, e.g. after relocalization.
    pub fn anchor(&mut self, pose_cw: &SE3) {
        self.prev_pose = Some(pose_cw.clone());
        self.velocity = None;
    }

    /// Predict the next pose. Without a velocity this is the last pose.
    pub fn predict(&self) -> Option<SE3> {
        let prev = self.prev_pose.as_ref()?;
        Some(match &self.velocity {
            Some(v) => v.compose(prev),
            None => prev.clone(),
        })
    }

    pub fn velocity(&self) -> Option<&SE3> {
        self.velocity.as_ref()
    }

    pub fn last_pose(&self) -> Option<&SE3> {
        self.prev_pose.as_ref()
    }

    /// Reset the motion model.
    pub fn reset(&mut self) {
        self.prev_pose = None;
        self.velocity = None;
    }
}
