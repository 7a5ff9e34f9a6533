use nalgebra::{UnitQuaternion, Vector3};

use super::sample::{ImuBias, ImuSample};
use crate::geometry::SE3;

/// Preintegrated motion between the first and last sample, expressed in the
/// body frame at the first sample. Gravity is not included.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreintegratedState {
    pub delta_rot: UnitQuaternion<f64>,
    pub delta_vel: Vector3<f64>,
    pub delta_pos: Vector3<f64>,
    pub dt: f64,
}

impl PreintegratedState {
    pub fn identity() -> Self {
        Self {
            delta_rot: UnitQuaternion::identity(),
            delta_vel: Vector3::zeros(),
            delta_pos: Vector3::zeros(),
            dt: 0.0,
        }
    }

    /// Predicts the world-to-camera pose at the end of the interval.
    ///
    /// `velocity_w` is the world-frame velocity at the start, `gravity_w` the
    /// gravity vector in the same world frame.
    pub fn predict_pose(&self, start_cw: &SE3, velocity_w: &Vector3<f64>, gravity_w: &Vector3<f64>) -> SE3 {
        let rot_wb = start_cw.rotation.inverse();
        let pos_w = start_cw.camera_center();
        let dt = self.dt;
        let rot_end = rot_wb * self.delta_rot;
        let pos_end = pos_w + velocity_w * dt + 0.5 * gravity_w * dt * dt + rot_wb * self.delta_pos;
        SE3::from_parts(rot_end, pos_end).inverse()
    }

    /// Relative motion prior between `start_cw` and the predicted end pose.
    pub fn to_prior(
        &self,
        start_cw: &SE3,
        velocity_w: &Vector3<f64>,
        gravity_w: &Vector3<f64>,
        weight: f64,
    ) -> InertialPrior {
        let end_cw = self.predict_pose(start_cw, velocity_w, gravity_w);
        InertialPrior {
            delta: end_cw.compose(&start_cw.inverse()),
            weight,
        }
    }
}

/// Relative motion prediction for a frame, `T_curr_prev`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InertialPrior {
    /// Maps points from the previous camera frame into the current one.
    pub delta: SE3,
    /// Trust in the prediction in [0, 1].
    pub weight: f64,
}

impl InertialPrior {
    pub fn new(delta: SE3, weight: f64) -> Self {
        Self {
            delta,
            weight: weight.clamp(0.0, 1.0),
        }
    }

    /// Pose prediction for the current frame.
    pub fn predict(&self, previous_cw: &SE3) -> SE3 {
        self.delta.compose(previous_cw)
    }
}

/// Inertial data accompanying a frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum InertialInput {
    #[default]
    None,
    Prior(InertialPrior),
    /// Raw samples since the previous frame, integrated by the tracker.
    Samples(Vec<ImuSample>),
}

/// Integrates gyro and accelerometer samples with the midpoint rule.
pub struct Preintegrator {
    bias: ImuBias,
    state: PreintegratedState,
}

impl Preintegrator {
    pub fn new(bias: ImuBias) -> Self {
        Self {
            bias,
            state: PreintegratedState::identity(),
        }
    }

    pub fn reset(&mut self) {
        self.state = PreintegratedState::identity();
    }

    pub fn state(&self) -> &PreintegratedState {
        &self.state
    }

    /// Integrates one step between consecutive samples.
    pub fn integrate(&mut self, prev: &ImuSample, curr: &ImuSample) {
        let dt = curr.timestamp - prev.timestamp;
        if dt <= 0.0 {
            return;
        }
        let omega = 0.5 * (prev.gyro + curr.gyro) - self.bias.gyro;
        let accel = 0.5 * (prev.accel + curr.accel) - self.bias.accel;

        let accel_start = self.state.delta_rot * accel;
        self.state.delta_pos += self.state.delta_vel * dt + 0.5 * accel_start * dt * dt;
        self.state.delta_vel += accel_start * dt;
        self.state.delta_rot *= UnitQuaternion::from_scaled_axis(omega * dt);
        self.state.dt += dt;
    }
}

/// Preintegrates a run of samples ordered by timestamp.
pub fn preintegrate(samples: &[ImuSample], bias: &ImuBias) -> PreintegratedState {
    let mut integrator = Preintegrator::new(*bias);
    for pair in samples.windows(2) {
        integrator.integrate(&pair[0], &pair[1]);
    }
    integrator.state
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn samples(n: usize, dt: f64, gyro: Vector3<f64>, accel: Vector3<f64>) -> Vec<ImuSample> {
        (0..=n).map(|i| ImuSample::new(i as f64 * dt, gyro, accel)).collect()
    }

    #[test]
    fn test_constant_rotation_rate() {
        let omega = Vector3::new(0.0, 0.5, 0.0);
        let state = preintegrate(&samples(100, 0.01, omega, Vector3::zeros()), &ImuBias::default());
        assert_relative_eq!(state.dt, 1.0, epsilon = 1e-9);
        assert_relative_eq!(state.delta_rot.scaled_axis(), omega, epsilon = 1e-9);
    }

    #[test]
    fn test_stationary_sensor_predicts_no_motion() {
        let gravity = Vector3::new(0.0, 9.81, 0.0);
        // At rest the accelerometer measures the reaction to gravity.
        let state = preintegrate(&samples(50, 0.01, Vector3::zeros(), -gravity), &ImuBias::default());
        let start = SE3::from_parts(UnitQuaternion::identity(), Vector3::new(0.2, 0.0, -1.0));
        let prior = state.to_prior(&start, &Vector3::zeros(), &gravity, 1.0);
        assert_relative_eq!(prior.delta.translation, Vector3::zeros(), epsilon = 1e-9);
        assert!(prior.delta.rotation_angle() < 1e-12);
    }

    #[test]
    fn test_constant_acceleration_displacement() {
        let accel = Vector3::new(2.0, 0.0, 0.0);
        let state = preintegrate(&samples(100, 0.01, Vector3::zeros(), accel), &ImuBias::default());
        assert_relative_eq!(state.delta_pos, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-9);
        assert_relative_eq!(state.delta_vel, Vector3::new(2.0, 0.0, 0.0), epsilon = 1e-9);
    }

    #[test]
    fn test_prior_predicts_from_previous_pose() {
        let delta = SE3::from_parts(UnitQuaternion::identity(), Vector3::new(-0.1, 0.0, 0.0));
        let prior = InertialPrior::new(delta, 3.0);
        assert_eq!(prior.weight, 1.0);
        let predicted = prior.predict(&SE3::identity());
        assert_relative_eq!(predicted.camera_center(), Vector3::new(0.1, 0.0, 0.0), epsilon = 1e-12);
    }
}
