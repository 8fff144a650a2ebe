//! In-memory tensor representation.
//!
//! Checkpoint tensors are normalized at load time to one of two element
//! types: f32 for everything floating point, i64 for integer bookkeeping
//! tensors (the CLIP position index table is the only one seen in
//! practice). Permutation and blending code works on these normalized
//! arrays; storage dtypes are a concern of the checkpoint I/O layer.

use ndarray::{ArrayD, Axis};

/// Element type of an in-memory tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    /// 32-bit float.
    F32,
    /// 64-bit signed integer.
    I64,
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::F32 => write!(f, "f32"),
            Dtype::I64 => write!(f, "i64"),
        }
    }
}

/// A dynamically-shaped tensor holding either float or integer data.
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    /// Floating point tensor.
    F32(ArrayD<f32>),
    /// Integer tensor.
    I64(ArrayD<i64>),
}

impl Tensor {
    /// Element type of this tensor.
    pub fn dtype(&self) -> Dtype {
        match self {
            Tensor::F32(_) => Dtype::F32,
            Tensor::I64(_) => Dtype::I64,
        }
    }

    /// Shape of this tensor.
    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::F32(a) => a.shape(),
            Tensor::I64(a) => a.shape(),
        }
    }

    /// Number of axes.
    pub fn ndim(&self) -> usize {
        match self {
            Tensor::F32(a) => a.ndim(),
            Tensor::I64(a) => a.ndim(),
        }
    }

    /// Total number of elements.
    pub fn element_count(&self) -> usize {
        match self {
            Tensor::F32(a) => a.len(),
            Tensor::I64(a) => a.len(),
        }
    }

    /// Borrow the float data, if this is a float tensor.
    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match self {
            Tensor::F32(a) => Some(a),
            Tensor::I64(_) => None,
        }
    }

    /// Borrow the integer data, if this is an integer tensor.
    pub fn as_i64(&self) -> Option<&ArrayD<i64>> {
        match self {
            Tensor::F32(_) => None,
            Tensor::I64(a) => Some(a),
        }
    }

    /// Index-select along `axis`: output position `i` holds the input
    /// subview at `indices[i]`. The output has the same shape as the
    /// input when `indices.len()` equals the axis length.
    pub fn select_axis(&self, axis: usize, indices: &[usize]) -> Tensor {
        match self {
            Tensor::F32(a) => Tensor::F32(a.select(Axis(axis), indices)),
            Tensor::I64(a) => Tensor::I64(a.select(Axis(axis), indices)),
        }
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(a: ArrayD<f32>) -> Self {
        Tensor::F32(a)
    }
}

impl From<ArrayD<i64>> for Tensor {
    fn from(a: ArrayD<i64>) -> Self {
        Tensor::I64(a)
    }
}
