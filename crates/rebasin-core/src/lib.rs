//! Permutation alignment for neural network parameter sets.
//!
//! Two networks trained from different random initializations learn
//! equivalent functions with permuted internal orderings. This crate
//! finds, for a fixed reference and a target parameter set, a consistent
//! family of per-group unit permutations of the target that maximizes
//! its similarity to the reference, so the two can be linearly blended
//! without destructive interference ("git re-basin").
//!
//! # Overview
//!
//! - [`PermutationSpec`] declares which tensor axes share which
//!   permutation group; it is static configuration per model family.
//! - [`weight_matching`] runs coordinate descent over the groups, solving
//!   an exact linear assignment per group per pass.
//! - [`apply_permutation`] materializes a permuted parameter set.
//! - [`KeyPolicy`] carries the per-family allow/deny key rules consumed
//!   by the applier and the merge pipeline.
//!
//! # Example
//!
//! ```rust,ignore
//! use rebasin_core::{weight_matching, apply_permutation, MatchOptions};
//!
//! let outcome = weight_matching(&spec, &reference, &target, &MatchOptions::new())?;
//! let aligned = apply_permutation(&spec, &policy, &outcome.perm, &target)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod applier;
pub mod assignment;
pub mod error;
pub mod matching;
pub mod params;
pub mod perm;
pub mod policy;
pub mod spec;
pub mod tensor;

// Re-exports for convenience
pub use applier::{apply_permutation, get_permuted_param, PermMap};
pub use assignment::{assignment_score, solve, Assignment, Objective};
pub use error::{CoreError, Result};
pub use matching::{weight_matching, MatchOptions, MatchOutcome, Precision};
pub use params::ParameterSet;
pub use perm::Permutation;
pub use policy::{any_match, KeyPolicy, KeyRule};
pub use spec::{GroupId, PermutationSpec, SpecBuilder};
pub use tensor::{Dtype, Tensor};

/// Version of the alignment core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports.
pub mod prelude {
    //! Convenient re-exports for common usage.
    pub use crate::applier::{apply_permutation, get_permuted_param, PermMap};
    pub use crate::matching::{weight_matching, MatchOptions, MatchOutcome, Precision};
    pub use crate::params::ParameterSet;
    pub use crate::perm::Permutation;
    pub use crate::policy::{KeyPolicy, KeyRule};
    pub use crate::spec::{PermutationSpec, SpecBuilder};
    pub use crate::tensor::Tensor;
}
