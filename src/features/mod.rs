//! Image buffers, ORB-style feature extraction and descriptor matching.

pub mod extractor;
pub mod image;
pub mod matcher;

pub use extractor::{Descriptor, FeatureConfig, FeatureExtractor, FeatureSet, KeyPoint, ScaleLevels};
pub use image::{DepthImage, GrayImage};
pub use matcher::{hamming_distance, FeatureGrid, FeatureMatch, FeatureMatcher, GeometricModel, MatchSet, MatcherConfig};
