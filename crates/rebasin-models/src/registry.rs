//! Architecture detection and family-level constants.

use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayD, IxDyn};
use rebasin_core::{KeyPolicy, KeyRule, ParameterSet, PermutationSpec, Tensor};

use crate::architectures::{sd1, sd2, sdxl};

/// A tensor only SDXL checkpoints carry (second text encoder).
pub const SDXL_MARKER_KEY: &str =
    "conditioner.embedders.1.model.transformer.resblocks.0.attn.in_proj_bias";

/// A tensor only SD 2.x checkpoints carry (OpenCLIP text encoder).
pub const SD2_MARKER_KEY: &str =
    "cond_stage_model.model.transformer.resblocks.1.mlp.c_fc.bias";

/// The CLIP positional-index tensor validated after merging.
pub const POSITION_IDS_KEY: &str =
    "cond_stage_model.transformer.text_model.embeddings.position_ids";

/// CLIP text context length; the canonical position-ids row is this long.
pub const CLIP_CONTEXT_LEN: usize = 77;

/// Supported checkpoint families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// Stable Diffusion 1.x (CLIP ViT-L text encoder).
    Sd1,
    /// Stable Diffusion 2.x (OpenCLIP ViT-H text encoder).
    Sd2,
    /// Stable Diffusion XL (dual text encoders, three-stage UNet).
    Sdxl,
}

impl Architecture {
    /// Short name used in logs and config files.
    pub fn name(&self) -> &'static str {
        match self {
            Architecture::Sd1 => "sd1",
            Architecture::Sd2 => "sd2",
            Architecture::Sdxl => "sdxl",
        }
    }

    /// Permutation table for this family.
    pub fn permutation_spec(&self) -> PermutationSpec {
        match self {
            Architecture::Sd1 => sd1::permutation_spec(),
            Architecture::Sd2 => sd2::permutation_spec(),
            Architecture::Sdxl => sdxl::permutation_spec(),
        }
    }

    /// Key handling rules for this family.
    pub fn key_policy(&self) -> KeyPolicy {
        match self {
            Architecture::Sd1 => sd1::key_policy(),
            Architecture::Sd2 => sd2::key_policy(),
            Architecture::Sdxl => sdxl::key_policy(),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when an architecture name is not recognized.
#[derive(Debug, thiserror::Error)]
#[error("unknown architecture '{0}', expected sd1, sd2, or sdxl")]
pub struct ParseArchitectureError(String);

impl FromStr for Architecture {
    type Err = ParseArchitectureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sd1" => Ok(Architecture::Sd1),
            "sd2" => Ok(Architecture::Sd2),
            "sdxl" => Ok(Architecture::Sdxl),
            _ => Err(ParseArchitectureError(s.to_string())),
        }
    }
}

/// Identify a checkpoint's family from its tensor keys. SD1 is the
/// fallback when neither marker is present.
pub fn detect(params: &ParameterSet) -> Architecture {
    if params.contains(SDXL_MARKER_KEY) {
        Architecture::Sdxl
    } else if params.contains(SD2_MARKER_KEY) {
        Architecture::Sd2
    } else {
        Architecture::Sd1
    }
}

/// The int64 row `[[0, 1, ..., 76]]` a healthy CLIP text encoder stores
/// under [`POSITION_IDS_KEY`].
pub fn canonical_position_ids() -> Tensor {
    let values: Vec<i64> = (0..CLIP_CONTEXT_LEN as i64).collect();
    let array = ArrayD::from_shape_vec(IxDyn(&[1, CLIP_CONTEXT_LEN]), values)
        .expect("canonical position ids shape is static");
    Tensor::I64(array)
}

/// The key rules shared by every Stable Diffusion family.
///
/// Blending is scoped to the `model` namespaces; EMA bookkeeping
/// (`model_ema.*`, matched as contains `model_`) is both dropped from
/// permutation output and denied from blending; the SDXL second text
/// encoder and the CLIP position-ids buffer are denied from blending;
/// pruning keeps the UNet, VAE and text-encoder namespaces.
pub(crate) fn stable_diffusion_policy() -> KeyPolicy {
    KeyPolicy {
        revision: 1,
        permute_exclude: vec![KeyRule::Contains("model_".into())],
        blend_allow: vec![KeyRule::Contains("model".into())],
        blend_deny: vec![
            KeyRule::Contains("model_".into()),
            KeyRule::Contains("conditioner.embedders.1.model".into()),
            KeyRule::Exact(POSITION_IDS_KEY.into()),
        ],
        special_keys: vec![
            "first_stage_model.decoder.norm_out.weight".into(),
            "first_stage_model.decoder.norm_out.bias".into(),
            "first_stage_model.encoder.norm_out.weight".into(),
            "first_stage_model.encoder.norm_out.bias".into(),
            "model.diffusion_model.out.0.weight".into(),
            "model.diffusion_model.out.0.bias".into(),
        ],
        prune_keep: vec![
            KeyRule::Contains("diffusion_model.".into()),
            KeyRule::Contains("first_stage_model.".into()),
            KeyRule::Contains("cond_stage_model.".into()),
        ],
        position_ids_key: Some(POSITION_IDS_KEY.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    fn scalar(value: f32) -> Tensor {
        Tensor::F32(ArrayD::from_elem(IxDyn(&[1]), value))
    }

    #[test]
    fn test_detection_markers() {
        let mut params = ParameterSet::new();
        params.insert("model.diffusion_model.out.0.weight", scalar(1.0));
        assert_eq!(detect(&params), Architecture::Sd1);

        params.insert(SD2_MARKER_KEY, scalar(1.0));
        assert_eq!(detect(&params), Architecture::Sd2);

        // The SDXL marker wins even when the SD2 one is present.
        params.insert(SDXL_MARKER_KEY, scalar(1.0));
        assert_eq!(detect(&params), Architecture::Sdxl);
    }

    #[test]
    fn test_name_round_trip() {
        for arch in [Architecture::Sd1, Architecture::Sd2, Architecture::Sdxl] {
            let parsed: Architecture = arch.name().parse().unwrap();
            assert_eq!(parsed, arch);
        }
        assert!("SDXL".parse::<Architecture>().is_ok());
        assert!("sd3".parse::<Architecture>().is_err());
    }

    #[test]
    fn test_canonical_position_ids_shape() {
        let tensor = canonical_position_ids();
        assert_eq!(tensor.shape(), &[1, CLIP_CONTEXT_LEN]);
        let array = tensor.as_i64().unwrap();
        assert_eq!(array[[0, 0]], 0);
        assert_eq!(array[[0, 76]], 76);
    }

    #[test]
    fn test_shared_policy_rules() {
        let policy = stable_diffusion_policy();
        assert!(policy.blends("model.diffusion_model.out.0.weight"));
        assert!(!policy.blends("model_ema.decay"));
        assert!(!policy.blends(POSITION_IDS_KEY));
        assert!(!policy.blends("conditioner.embedders.1.model.text_projection"));
        assert!(policy.keeps_on_prune("cond_stage_model.transformer.text_model.final_layer_norm.weight"));
        assert!(!policy.keeps_on_prune("alphas_cumprod"));
    }
}
