//! Permutation group specifications.
//!
//! A spec records, for every participating tensor, which permutation
//! group each of its axes belongs to. Two views exist over the same
//! relation: `axes_to_perm` (key to per-axis group assignment) and
//! `perm_to_axes` (group to the (key, axis) pairs it covers). The first
//! is authoritative; the second is derived at construction time, so the
//! two can never disagree.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Identifier of a permutation group.
pub type GroupId = String;

/// Static description of which tensor axes share which permutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermutationSpec {
    axes_to_perm: BTreeMap<String, Vec<Option<GroupId>>>,
    perm_to_axes: BTreeMap<GroupId, Vec<(String, usize)>>,
}

impl PermutationSpec {
    /// Build a spec from the per-key axis assignments, deriving the
    /// group-to-axes view.
    pub fn from_axes_to_perm(axes_to_perm: BTreeMap<String, Vec<Option<GroupId>>>) -> Self {
        let mut perm_to_axes: BTreeMap<GroupId, Vec<(String, usize)>> = BTreeMap::new();
        for (key, axes) in &axes_to_perm {
            for (axis, group) in axes.iter().enumerate() {
                if let Some(g) = group {
                    perm_to_axes
                        .entry(g.clone())
                        .or_default()
                        .push((key.clone(), axis));
                }
            }
        }
        Self {
            axes_to_perm,
            perm_to_axes,
        }
    }

    /// Per-axis group assignment for `key`, if the key participates.
    pub fn axes_of(&self, key: &str) -> Option<&[Option<GroupId>]> {
        self.axes_to_perm.get(key).map(|v| v.as_slice())
    }

    /// The (key, axis) pairs registered under `group`, ordered by key
    /// then axis. The first pair defines the group's size.
    pub fn axes_in_group(&self, group: &str) -> Option<&[(String, usize)]> {
        self.perm_to_axes.get(group).map(|v| v.as_slice())
    }

    /// Iterate over groups and their (key, axis) pairs, in group order.
    pub fn groups(&self) -> impl Iterator<Item = (&GroupId, &[(String, usize)])> {
        self.perm_to_axes.iter().map(|(g, v)| (g, v.as_slice()))
    }

    /// Group identifiers in order.
    pub fn group_ids(&self) -> impl Iterator<Item = &GroupId> {
        self.perm_to_axes.keys()
    }

    /// Number of groups.
    pub fn group_count(&self) -> usize {
        self.perm_to_axes.len()
    }

    /// Number of registered tensor keys.
    pub fn key_count(&self) -> usize {
        self.axes_to_perm.len()
    }

    /// Check that the derived view matches the authoritative one. Holds
    /// by construction; exposed for tests over hand-assembled tables.
    pub fn views_consistent(&self) -> bool {
        let rebuilt = Self::from_axes_to_perm(self.axes_to_perm.clone());
        rebuilt.perm_to_axes == self.perm_to_axes
    }
}

/// Incremental builder over per-key axis assignments.
#[derive(Debug, Clone, Default)]
pub struct SpecBuilder {
    axes_to_perm: BTreeMap<String, Vec<Option<GroupId>>>,
}

impl SpecBuilder {
    /// Start an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tensor's per-axis group assignment. Registering the
    /// same key twice is an error.
    pub fn tensor(
        &mut self,
        key: impl Into<String>,
        axes: Vec<Option<GroupId>>,
    ) -> Result<&mut Self> {
        let key = key.into();
        if self.axes_to_perm.contains_key(&key) {
            return Err(CoreError::DuplicateKey(key));
        }
        self.axes_to_perm.insert(key, axes);
        Ok(self)
    }

    /// Finish, deriving the group view.
    pub fn build(self) -> PermutationSpec {
        PermutationSpec::from_axes_to_perm(self.axes_to_perm)
    }
}
