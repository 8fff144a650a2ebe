//! Error types for the permutation alignment core.

use thiserror::Error;

/// Errors that can occur while building specs, permuting tensors, or matching.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A tensor referenced by a permutation group or applier call is absent.
    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    /// A permutation's length does not match the axis it is applied to.
    #[error("Shape mismatch for tensor '{key}' axis {axis}: axis length {axis_len}, permutation length {perm_len}")]
    ShapeMismatch {
        /// Tensor key.
        key: String,
        /// Axis index the permutation was applied to.
        axis: usize,
        /// Length of the tensor along that axis.
        axis_len: usize,
        /// Length of the permutation.
        perm_len: usize,
    },

    /// An axis index in a spec entry is out of range for the tensor's rank.
    #[error("Axis {axis} out of bounds for tensor '{key}' with rank {rank}")]
    AxisOutOfBounds {
        /// Tensor key.
        key: String,
        /// Offending axis index.
        axis: usize,
        /// Rank of the tensor.
        rank: usize,
    },

    /// A sequence is not a bijection of 0..n.
    #[error("Invalid permutation of length {len}: index {index} {reason}")]
    InvalidPermutation {
        /// Length of the rejected sequence.
        len: usize,
        /// Offending index value.
        index: usize,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// The same tensor key was registered twice in one spec.
    #[error("Duplicate registration of tensor '{0}' in spec")]
    DuplicateKey(String),

    /// A tensor's shape disagrees with its permutation group's size or
    /// its counterpart on the other side.
    #[error("Tensor '{key}' in group '{group}' has shape {actual:?}, expected {expected:?}")]
    GroupShapeMismatch {
        /// Group being accumulated.
        group: String,
        /// Tensor key.
        key: String,
        /// Shape implied by the group and the reference side.
        expected: Vec<usize>,
        /// Shape actually found.
        actual: Vec<usize>,
    },

    /// The assignment solver was given a non-square cost matrix.
    #[error("Assignment requires a square cost matrix, got {rows}x{cols}")]
    NonSquareCost {
        /// Row count.
        rows: usize,
        /// Column count.
        cols: usize,
    },

    /// A cost matrix contained NaN or infinite entries.
    #[error("Non-finite cost matrix entry at ({row}, {col})")]
    NonFiniteCost {
        /// Row of the offending entry.
        row: usize,
        /// Column of the offending entry.
        col: usize,
    },

    /// The assignment solver returned rows out of natural order.
    ///
    /// Cost matrices are always built with rows already in natural order, so
    /// this indicates a bug in cost-matrix construction, not bad input.
    #[error("Assignment solver returned a non-identity row ordering for group '{group}'")]
    SolverInvariant {
        /// Group being solved when the invariant broke.
        group: String,
    },
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
