//! Configuration for the merge pipeline.

use std::path::PathBuf;

use rebasin_core::Precision;
use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};
use crate::loader::CheckpointFormat;

/// Complete merge configuration, assembled from CLI flags or loaded from
/// YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// First input checkpoint. The merge stays anchored in this model's
    /// basin.
    pub model_a: PathBuf,

    /// Second input checkpoint, aligned towards model A before blending.
    pub model_b: PathBuf,

    /// Output stem or file name; the format extension is appended when
    /// missing.
    pub output: PathBuf,

    /// Final fraction of model B in the blend (0.0 keeps A, 1.0 reaches B).
    #[serde(default = "default_alpha")]
    pub alpha: f32,

    /// Number of blend-align rounds.
    #[serde(default = "default_iterations")]
    pub iterations: usize,

    /// Coordinate-descent pass budget for each alignment solve.
    #[serde(default = "default_match_iterations")]
    pub match_iterations: usize,

    /// Arithmetic and output precision.
    #[serde(default)]
    pub precision: Precision,

    /// Output container format.
    #[serde(default = "default_format")]
    pub format: CheckpointFormat,

    /// Drop tensors outside the UNet/VAE/text-encoder namespaces before
    /// merging.
    #[serde(default)]
    pub prune: bool,

    /// Replace a broken position-ids tensor with the canonical indices
    /// instead of only reporting it.
    #[serde(default)]
    pub fix_position_ids: bool,

    /// Seed for the solver's group visit order. Unseeded runs draw from
    /// entropy.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Replace the output file if it already exists.
    #[serde(default)]
    pub overwrite: bool,

    /// Draw a progress bar over the merge rounds.
    #[serde(default)]
    pub progress: bool,
}

fn default_alpha() -> f32 {
    0.5
}

fn default_iterations() -> usize {
    10
}

fn default_match_iterations() -> usize {
    3
}

fn default_format() -> CheckpointFormat {
    CheckpointFormat::Safetensors
}

impl MergeConfig {
    /// Build a configuration with default tuning for the given paths.
    pub fn new(
        model_a: impl Into<PathBuf>,
        model_b: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            model_a: model_a.into(),
            model_b: model_b.into(),
            output: output.into(),
            alpha: default_alpha(),
            iterations: default_iterations(),
            match_iterations: default_match_iterations(),
            precision: Precision::default(),
            format: default_format(),
            prune: false,
            fix_position_ids: false,
            seed: None,
            overwrite: false,
            progress: false,
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(MergeError::InvalidConfig(format!(
                "alpha must be within 0.0..=1.0, got {}",
                self.alpha
            )));
        }
        if self.iterations == 0 {
            return Err(MergeError::InvalidConfig(
                "iterations must be at least 1".to_string(),
            ));
        }
        if self.match_iterations == 0 {
            return Err(MergeError::InvalidConfig(
                "match_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_yaml() {
        let yaml = r#"
model_a: a.safetensors
model_b: b.safetensors
output: merged
"#;

        let config = MergeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.model_a, PathBuf::from("a.safetensors"));
        assert_eq!(config.alpha, 0.5);
        assert_eq!(config.iterations, 10);
        assert_eq!(config.match_iterations, 3);
        assert_eq!(config.precision, Precision::Full);
        assert_eq!(config.format, CheckpointFormat::Safetensors);
        assert!(!config.prune);
        assert!(!config.fix_position_ids);
        assert_eq!(config.seed, None);
        assert!(!config.overwrite);
        assert!(!config.progress);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
model_a: /models/animeA.safetensors
model_b: /models/photoB.safetensors
output: /models/merged.safetensors
alpha: 0.3
iterations: 4
match_iterations: 5
precision: half
format: safetensors
prune: true
fix_position_ids: true
seed: 42
overwrite: true
progress: true
"#;

        let config = MergeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.alpha, 0.3);
        assert_eq!(config.iterations, 4);
        assert_eq!(config.match_iterations, 5);
        assert_eq!(config.precision, Precision::Half);
        assert!(config.prune);
        assert!(config.fix_position_ids);
        assert_eq!(config.seed, Some(42));
        assert!(config.overwrite);
        assert!(config.progress);
        config.validate().unwrap();
    }

    #[test]
    fn test_alpha_range_validation() {
        let mut config = MergeConfig::new("a", "b", "out");
        config.alpha = 1.5;
        assert!(config.validate().is_err());

        config.alpha = 0.0;
        config.validate().unwrap();
        config.alpha = 1.0;
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let mut config = MergeConfig::new("a", "b", "out");
        config.iterations = 0;
        assert!(config.validate().is_err());

        let mut config = MergeConfig::new("a", "b", "out");
        config.match_iterations = 0;
        assert!(config.validate().is_err());
    }
}
