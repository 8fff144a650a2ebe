//! Per-architecture key policies.
//!
//! Which keys may be blended, which are dropped when a permutation is
//! materialized, which get the solver-quality blend, and which tensor
//! families survive pruning are all data, declared once per model family
//! next to its permutation spec. Nothing else in the pipeline inspects
//! key names directly.

use serde::{Deserialize, Serialize};

/// A single key-matching rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyRule {
    /// The key equals the string exactly.
    Exact(String),
    /// The key starts with the string.
    Prefix(String),
    /// The key contains the string anywhere.
    Contains(String),
}

impl KeyRule {
    /// Whether `key` satisfies this rule.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyRule::Exact(s) => key == s,
            KeyRule::Prefix(s) => key.starts_with(s.as_str()),
            KeyRule::Contains(s) => key.contains(s.as_str()),
        }
    }
}

/// Whether any rule in `rules` matches `key`.
pub fn any_match(rules: &[KeyRule], key: &str) -> bool {
    rules.iter().any(|r| r.matches(key))
}

/// Key handling rules for one model family.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyPolicy {
    /// Bumped whenever a family's rule lists change.
    pub revision: u32,

    /// Keys omitted from `apply_permutation` output (EMA-style
    /// bookkeeping that must never travel through a permutation).
    pub permute_exclude: Vec<KeyRule>,

    /// A key is eligible for the weighted blend iff it matches one of
    /// these rules.
    pub blend_allow: Vec<KeyRule>,

    /// Keys excluded from the weighted blend even when allowed.
    pub blend_deny: Vec<KeyRule>,

    /// The fixed alignment-sensitive keys blended with the
    /// solver-quality-derived weight after each matching round.
    pub special_keys: Vec<String>,

    /// Tensor families kept when pruning before a merge.
    pub prune_keep: Vec<KeyRule>,

    /// The positional-index tensor validated after merging, if the
    /// family has one.
    pub position_ids_key: Option<String>,
}

impl KeyPolicy {
    /// Whether `apply_permutation` output should carry this key.
    pub fn keeps_on_permute(&self, key: &str) -> bool {
        !any_match(&self.permute_exclude, key)
    }

    /// Whether this key participates in the weighted blend.
    pub fn blends(&self, key: &str) -> bool {
        any_match(&self.blend_allow, key) && !any_match(&self.blend_deny, key)
    }

    /// Whether this key is copied over from the second model on the first
    /// iteration when absent from the working set. Deny rules do not
    /// apply here; only the namespace does.
    pub fn copies_over(&self, key: &str) -> bool {
        any_match(&self.blend_allow, key)
    }

    /// Whether this key survives pruning.
    pub fn keeps_on_prune(&self, key: &str) -> bool {
        any_match(&self.prune_keep, key)
    }
}
