//! Stable Diffusion XL.
//!
//! Three-stage UNet with transformer depth 2 and 10, a class/size
//! embedding branch, the shared kl-f8 VAE, and dual text encoders. Only
//! the first encoder (CLIP ViT-L under `conditioner.embedders.0`) is
//! permuted; the second is left untouched and excluded from blending by
//! policy, since its interleaved attention projections do not decompose
//! into per-axis groups.

use rebasin_core::{KeyPolicy, PermutationSpec};

use crate::builder::{clip_mlp, sdxl_unet, vae, TableBuilder};
use crate::registry::stable_diffusion_policy;

/// Permutation groups of an SDXL checkpoint.
pub fn permutation_spec() -> PermutationSpec {
    let mut table = TableBuilder::new();
    sdxl_unet(&mut table);
    vae(&mut table);
    clip_mlp(&mut table, "conditioner.embedders.0.transformer.text_model", 12);
    table.build()
}

/// Key handling rules for SDXL merges.
pub fn key_policy() -> KeyPolicy {
    stable_diffusion_policy()
}
