//! Checkpoint merging for Stable Diffusion in the re-basin style.
//!
//! This crate turns two checkpoints of the same family into one: it
//! loads safetensors state dicts, detects the architecture, runs the
//! iterated blend-align loop from `rebasin-core` over the family's
//! permutation table, validates the CLIP position-ids tensor, and writes
//! the result back out.
//!
//! # Example
//!
//! ```ignore
//! use rebasin_merge::{run_merge, MergeConfig};
//!
//! let mut config = MergeConfig::new(
//!     "animeA.safetensors",
//!     "photoB.safetensors",
//!     "merged",
//! );
//! config.alpha = 0.5;
//! config.iterations = 10;
//!
//! let report = run_merge(&config)?;
//! println!("wrote {} ({} tensors)", report.output.display(), report.tensors);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod blend;
mod config;
mod error;
mod loader;
mod merge;

pub use blend::*;
pub use config::*;
pub use error::*;
pub use loader::*;
pub use merge::*;
