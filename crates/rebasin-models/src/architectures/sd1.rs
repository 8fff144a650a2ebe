//! Stable Diffusion 1.x.
//!
//! Four-stage UNet with single-depth spatial transformers, kl-f8 VAE,
//! and a 12-layer CLIP ViT-L text encoder under
//! `cond_stage_model.transformer.text_model`.

use rebasin_core::{KeyPolicy, PermutationSpec};

use crate::builder::{clip_mlp, sd_unet, vae, TableBuilder};
use crate::registry::stable_diffusion_policy;

/// Permutation groups of an SD 1.x checkpoint.
pub fn permutation_spec() -> PermutationSpec {
    let mut table = TableBuilder::new();
    sd_unet(&mut table);
    vae(&mut table);
    clip_mlp(&mut table, "cond_stage_model.transformer.text_model", 12);
    table.build()
}

/// Key handling rules for SD 1.x merges.
pub fn key_policy() -> KeyPolicy {
    stable_diffusion_policy()
}
