use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Single IMU measurement in the camera frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub timestamp: f64,
    /// Angular velocity (rad/s).
    pub gyro: Vector3<f64>,
    /// Specific force (m/s^2), gravity included.
    pub accel: Vector3<f64>,
}

impl ImuSample {
    pub fn new(timestamp: f64, gyro: Vector3<f64>, accel: Vector3<f64>) -> Self {
        Self { timestamp, gyro, accel }
    }
}

/// Constant sensor biases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuBias {
    pub gyro: Vector3<f64>,
    pub accel: Vector3<f64>,
}

impl Default for ImuBias {
    fn default() -> Self {
        Self {
            gyro: Vector3::zeros(),
            accel: Vector3::zeros(),
        }
    }
}

/// Inertial settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    /// Gravity expressed in the map frame (the first keyframe's camera frame).
    pub gravity: Vector3<f64>,
    pub bias: ImuBias,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            // Camera y axis points down for a level camera.
            gravity: Vector3::new(0.0, 9.81, 0.0),
            bias: ImuBias::default(),
        }
    }
}
