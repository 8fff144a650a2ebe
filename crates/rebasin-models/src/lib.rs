//! Stable Diffusion checkpoint families for permutation alignment.
//!
//! This crate provides, per supported family:
//! - the static permutation table (which tensor axes share which group),
//! - the key policy driving blending, pruning and EMA exclusion,
//! - detection from a checkpoint's tensor keys.
//!
//! Supported families: SD 1.x, SD 2.x, SDXL. Tables only list tensors
//! with at least one permuted axis; everything else passes through the
//! applier untouched.

#![warn(clippy::all)]

pub mod architectures;
pub mod builder;
pub mod registry;

pub use architectures::{sd1, sd2, sdxl};
pub use registry::{
    canonical_position_ids, detect, Architecture, ParseArchitectureError, CLIP_CONTEXT_LEN,
    POSITION_IDS_KEY, SD2_MARKER_KEY, SDXL_MARKER_KEY,
};
