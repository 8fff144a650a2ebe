//! Ordered tensor collections.

use std::collections::BTreeMap;

use crate::tensor::Tensor;

/// An ordered mapping from tensor key to tensor.
///
/// Iteration order is the lexicographic key order, so every pass over a
/// parameter set is deterministic regardless of how it was assembled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    tensors: BTreeMap<String, Tensor>,
}

impl ParameterSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tensor, replacing any previous value under the same key.
    pub fn insert(&mut self, key: impl Into<String>, tensor: impl Into<Tensor>) {
        self.tensors.insert(key.into(), tensor.into());
    }

    /// Look up a tensor by key.
    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    /// Remove a tensor, returning it if present.
    pub fn remove(&mut self, key: &str) -> Option<Tensor> {
        self.tensors.remove(key)
    }

    /// Whether a key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    /// Number of tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the set holds no tensors.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Iterate over (key, tensor) pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.tensors.iter()
    }

    /// Iterate over keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.tensors.keys()
    }

    /// Consume the set, yielding owned (key, tensor) pairs in key order.
    pub fn into_iter(self) -> impl Iterator<Item = (String, Tensor)> {
        self.tensors.into_iter()
    }

    /// Keep only the tensors whose key satisfies `pred`.
    pub fn retain(&mut self, mut pred: impl FnMut(&str) -> bool) {
        self.tensors.retain(|k, _| pred(k));
    }
}

impl FromIterator<(String, Tensor)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}
