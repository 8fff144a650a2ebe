//! Stable Diffusion 2.x.
//!
//! Same UNet and VAE topology as 1.x; the text encoder is a 24-block
//! OpenCLIP ViT-H under `cond_stage_model.model`.

use rebasin_core::{KeyPolicy, PermutationSpec};

use crate::builder::{open_clip_mlp, sd_unet, vae, TableBuilder};
use crate::registry::stable_diffusion_policy;

/// Permutation groups of an SD 2.x checkpoint.
pub fn permutation_spec() -> PermutationSpec {
    let mut table = TableBuilder::new();
    sd_unet(&mut table);
    vae(&mut table);
    open_clip_mlp(&mut table, "cond_stage_model.model", 24);
    table.build()
}

/// Key handling rules for SD 2.x merges.
pub fn key_policy() -> KeyPolicy {
    stable_diffusion_policy()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::test_support::synthetic_params;
    use crate::registry::SD2_MARKER_KEY;
    use rebasin_core::{weight_matching, MatchOptions};

    #[test]
    fn test_table_shape() {
        let spec = permutation_spec();
        assert!(spec.views_consistent());
        // As SD1 but with 24 OpenCLIP MLP groups instead of 12 CLIP ones.
        assert_eq!(spec.group_count(), 2 + 22 + 64 + 40 + 24);
        assert_eq!(spec.key_count(), 600);
    }

    #[test]
    fn test_marker_key_is_in_table() {
        // Detection keys off the same tensor the table permutes.
        let spec = permutation_spec();
        let axes = spec.axes_of(SD2_MARKER_KEY).unwrap();
        assert_eq!(
            axes[0].as_deref(),
            Some("mlp:cond_stage_model.model.transformer.resblocks.1.mlp")
        );
    }

    #[test]
    fn test_synthetic_self_match_is_identity() {
        let spec = permutation_spec();
        let params = synthetic_params(&spec);
        let options = MatchOptions::new().with_seed(11);
        let outcome = weight_matching(&spec, &params, &params, &options).unwrap();

        assert!(outcome.converged);
        assert_eq!(outcome.average_improvement, 0.0);
        for (group, perm) in &outcome.perm {
            assert!(perm.is_identity(), "group {group} moved on a self match");
        }
    }
}
