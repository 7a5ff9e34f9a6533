//! Inertial measurements and their preintegration into motion priors.

pub mod preintegration;
pub mod sample;

pub use preintegration::{preintegrate, InertialInput, InertialPrior, PreintegratedState, Preintegrator};
pub use sample::{ImuBias, ImuConfig, ImuSample};
