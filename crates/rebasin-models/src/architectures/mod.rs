//! Per-family permutation tables and key policies.

pub mod sd1;
pub mod sd2;
pub mod sdxl;
