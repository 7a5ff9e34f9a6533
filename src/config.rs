//! System configuration.
//!
//! Every component owns its settings struct; [`SystemConfig`] gathers them
//! into one YAML document. Missing sections and fields take their defaults,
//! so a config file only lists what it changes:
//!
//! ```yaml
//! features:
//!   max_features: 1500
//! loop_closing:
//!   enabled: false
//! fusion:
//!   voxel_size: 0.01
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::features::{FeatureConfig, MatcherConfig};
use crate::fusion::FusionConfig;
use crate::geometry::CameraModel;
use crate::imu::ImuConfig;
use crate::loop_closing::LoopClosingConfig;
use crate::map::MapManagerConfig;
use crate::optimizer::BundleAdjustmentConfig;
use crate::tracking::{InitializerConfig, KeyFrameConfig, PoseOptimizerConfig, RelocalizerConfig, TrackingConfig};
use crate::vocabulary::VocabularyConfig;

/// Channel capacities and background worker switches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Messages queued for the mapping worker.
    pub mapping_queue: usize,
    /// Keyframes queued for the loop closer; extra keyframes skip detection.
    pub loop_queue: usize,
    /// Run local and global bundle adjustment in the background.
    pub bundle_adjustment: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mapping_queue: 32,
            loop_queue: 8,
            bundle_adjustment: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub camera: CameraModel,
    pub features: FeatureConfig,
    pub matcher: MatcherConfig,
    pub vocabulary: VocabularyConfig,
    pub initializer: InitializerConfig,
    pub tracking: TrackingConfig,
    pub keyframes: KeyFrameConfig,
    pub pose_optimizer: PoseOptimizerConfig,
    pub relocalization: RelocalizerConfig,
    pub imu: ImuConfig,
    pub mapping: MapManagerConfig,
    pub bundle_adjustment: BundleAdjustmentConfig,
    pub loop_closing: LoopClosingConfig,
    pub fusion: FusionConfig,
    pub runtime: RuntimeConfig,
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be > 0, got {value}")))
    }
}

fn nonzero(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value > 0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, "must be > 0"))
    }
}

fn unit_interval(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must lie in [0, 1], got {value}")))
    }
}

impl SystemConfig {
    /// Parses and validates a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize configuration")
    }

    /// Rejects values no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.camera;
        positive("camera.fx", c.fx)?;
        positive("camera.fy", c.fy)?;
        if c.width == 0 || c.height == 0 {
            return Err(ConfigError::invalid("camera", "image size must be non-zero"));
        }

        nonzero("features.max_features", self.features.max_features)?;
        nonzero("features.n_levels", self.features.n_levels)?;
        if self.features.scale_factor <= 1.0 {
            return Err(ConfigError::invalid("features.scale_factor", "must be > 1"));
        }
        nonzero("features.grid_cell_size", self.features.grid_cell_size)?;

        if !(self.matcher.ratio > 0.0 && self.matcher.ratio <= 1.0) {
            return Err(ConfigError::invalid("matcher.ratio", "must lie in (0, 1]"));
        }
        positive("matcher.ransac_sigma", self.matcher.ransac_sigma)?;
        nonzero("matcher.ransac_iterations", self.matcher.ransac_iterations)?;

        if self.initializer.min_triangulated > self.initializer.min_matches {
            return Err(ConfigError::invalid(
                "initializer.min_triangulated",
                "cannot exceed initializer.min_matches",
            ));
        }
        unit_interval("tracking.min_inlier_ratio", self.tracking.min_inlier_ratio)?;
        unit_interval("tracking.inertial_prior_weight", self.tracking.inertial_prior_weight)?;
        positive("tracking.search.radius", self.tracking.search.radius)?;
        unit_interval("keyframes.min_tracked_ratio", self.keyframes.min_tracked_ratio)?;
        if self.keyframes.max_frames < self.keyframes.min_frames {
            return Err(ConfigError::invalid("keyframes.max_frames", "must be >= keyframes.min_frames"));
        }
        nonzero("pose_optimizer.rounds", self.pose_optimizer.rounds)?;

        unit_interval("mapping.keyframe_redundancy", self.mapping.keyframe_redundancy)?;
        nonzero("bundle_adjustment.local_window", self.bundle_adjustment.local_window)?;
        positive("bundle_adjustment.huber_threshold", self.bundle_adjustment.huber_threshold)?;

        let lc = &self.loop_closing;
        nonzero("loop_closing.detector.max_candidates", lc.detector.max_candidates)?;
        nonzero("loop_closing.detector.consistency_threshold", lc.detector.consistency_threshold)?;
        if lc.verification.min_matches < 3 || lc.verification.min_inliers < 3 {
            return Err(ConfigError::invalid(
                "loop_closing.verification",
                "a similarity needs at least 3 correspondences",
            ));
        }

        let f = &self.fusion;
        positive("fusion.voxel_size", f.voxel_size)?;
        if f.truncation < f.voxel_size {
            return Err(ConfigError::invalid("fusion.truncation", "must be at least one voxel"));
        }
        if f.max_weight <= 0.0 {
            return Err(ConfigError::invalid("fusion.max_weight", "must be > 0"));
        }
        if f.max_depth <= f.min_depth {
            return Err(ConfigError::invalid("fusion.max_depth", "must exceed fusion.min_depth"));
        }
        if !(0.0..0.5).contains(&f.bounds_quantile) {
            return Err(ConfigError::invalid("fusion.bounds_quantile", "must lie in [0, 0.5)"));
        }

        nonzero("runtime.mapping_queue", self.runtime.mapping_queue)?;
        nonzero("runtime.loop_queue", self.runtime.loop_queue)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(SystemConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "
features:
  max_features: 1500
matcher:
  ratio: 0.7
fusion:
  voxel_size: 0.01
  truncation: 0.04
loop_closing:
  enabled: false
";
        let config = SystemConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.features.max_features, 1500);
        assert_eq!(config.features.n_levels, FeatureConfig::default().n_levels);
        assert_eq!(config.matcher.ratio, 0.7);
        assert!(!config.loop_closing.enabled);
        assert_eq!(config.fusion.voxel_size, 0.01);
        assert_eq!(config.tracking, TrackingConfig::default());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = SystemConfig::from_yaml_str("fusion:\n  voxel_size: -1.0\n").unwrap_err();
        assert!(format!("{err:#}").contains("fusion.voxel_size"));

        let mut config = SystemConfig::default();
        config.matcher.ratio = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "matcher.ratio", .. })));
    }

    #[test]
    fn test_yaml_round_trip() {
        let mut config = SystemConfig::default();
        config.camera = CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480).with_distortion(-0.1, 0.01, 0.0);
        let yaml = config.to_yaml_string().unwrap();
        assert_eq!(SystemConfig::from_yaml_str(&yaml).unwrap(), config);
    }
}
