//! Weighted blending, copy-over, pruning, and the position-ids check.
//!
//! All key selection goes through the architecture's [`KeyPolicy`]; the
//! functions here never inspect key names themselves.

use rebasin_core::{KeyPolicy, ParameterSet, Tensor};
use rebasin_models::{canonical_position_ids, CLIP_CONTEXT_LEN};
use tracing::{debug, warn};

use crate::error::{MergeError, Result};

/// Blend `source` into `target` in place: `t = (1 - alpha) * t + alpha * s`.
///
/// Only keys the policy allows and that exist in both sets participate.
/// Integer tensors and keys whose dtypes disagree are carried unchanged.
/// Returns the number of tensors blended.
pub fn weighted_blend(
    target: &mut ParameterSet,
    source: &ParameterSet,
    alpha: f32,
    policy: &KeyPolicy,
) -> Result<usize> {
    let keys: Vec<String> = target
        .keys()
        .filter(|k| policy.blends(k) && source.contains(k))
        .cloned()
        .collect();

    let mut blended = 0;
    for key in keys {
        let t = match target.get(&key) {
            Some(Tensor::F32(arr)) => arr,
            _ => {
                debug!(key = %key, "not blendable as floats, carried unchanged");
                continue;
            }
        };
        let s = match source.get(&key) {
            Some(Tensor::F32(arr)) => arr,
            _ => {
                debug!(key = %key, "not blendable as floats, carried unchanged");
                continue;
            }
        };
        if t.shape() != s.shape() {
            return Err(MergeError::ShapeMismatch {
                key,
                expected: t.shape().to_vec(),
                actual: s.shape().to_vec(),
            });
        }

        let mixed = t * (1.0 - alpha) + s * alpha;
        target.insert(key, Tensor::F32(mixed));
        blended += 1;
    }
    Ok(blended)
}

/// Copy keys that exist only in `source` into `target`.
///
/// Restricted to the policy's blend namespace; deny rules do not apply,
/// so bookkeeping tensors inside the namespace travel too. Returns the
/// number of tensors copied.
pub fn copy_missing(
    target: &mut ParameterSet,
    source: &ParameterSet,
    policy: &KeyPolicy,
) -> usize {
    let mut copied = 0;
    for (key, tensor) in source.iter() {
        if policy.copies_over(key) && !target.contains(key) {
            target.insert(key.clone(), tensor.clone());
            copied += 1;
        }
    }
    copied
}

/// Blend the policy's fixed output-layer keys between the two aligned
/// states. Missing or non-float keys are skipped with a warning.
pub fn blend_special(
    target: &mut ParameterSet,
    aligned: &ParameterSet,
    alpha: f32,
    policy: &KeyPolicy,
) -> Result<usize> {
    let mut blended = 0;
    for key in &policy.special_keys {
        let t = match target.get(key) {
            Some(Tensor::F32(arr)) => arr,
            _ => {
                warn!(key = %key, "special key missing from working set, skipped");
                continue;
            }
        };
        let s = match aligned.get(key) {
            Some(Tensor::F32(arr)) => arr,
            _ => {
                warn!(key = %key, "special key missing from aligned set, skipped");
                continue;
            }
        };
        if t.shape() != s.shape() {
            return Err(MergeError::ShapeMismatch {
                key: key.clone(),
                expected: t.shape().to_vec(),
                actual: s.shape().to_vec(),
            });
        }

        let mixed = t * (1.0 - alpha) + s * alpha;
        target.insert(key.clone(), Tensor::F32(mixed));
        blended += 1;
    }
    Ok(blended)
}

/// Drop tensors outside the policy's keep namespaces. Returns the number
/// of tensors removed.
pub fn prune(params: &mut ParameterSet, policy: &KeyPolicy) -> usize {
    let before = params.len();
    params.retain(|key| policy.keeps_on_prune(key));
    before - params.len()
}

/// Outcome of the position-ids consistency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionIdsFinding {
    /// Key that was inspected.
    pub key: String,

    /// Context positions whose stored id differs from its index.
    pub broken: Vec<usize>,

    /// Whether the tensor was replaced with the canonical ids.
    pub repaired: bool,
}

/// Compare the text encoder's position-ids tensor against the canonical
/// arange.
///
/// Float-typed ids are truncated toward zero before comparing, the way a
/// cast back to int64 would. Returns a finding only when entries drifted;
/// `None` means the tensor is absent or intact.
pub fn check_position_ids(
    params: &ParameterSet,
    policy: &KeyPolicy,
) -> Option<PositionIdsFinding> {
    let key = policy.position_ids_key.as_deref()?;
    let tensor = params.get(key)?;

    let stored: Vec<i64> = match tensor {
        Tensor::I64(arr) => arr.iter().copied().collect(),
        Tensor::F32(arr) => arr.iter().map(|&v| v as i64).collect(),
    };

    let mut broken = Vec::new();
    if stored.len() != CLIP_CONTEXT_LEN {
        broken = (0..CLIP_CONTEXT_LEN).collect();
    } else {
        for (i, &id) in stored.iter().enumerate() {
            if id != i as i64 {
                broken.push(i);
            }
        }
    }

    if broken.is_empty() {
        None
    } else {
        Some(PositionIdsFinding {
            key: key.to_string(),
            broken,
            repaired: false,
        })
    }
}

/// Check the position-ids tensor and, when drifted, replace it with the
/// canonical arange.
pub fn repair_position_ids(
    params: &mut ParameterSet,
    policy: &KeyPolicy,
) -> Option<PositionIdsFinding> {
    let mut finding = check_position_ids(params, policy)?;
    params.insert(finding.key.clone(), canonical_position_ids());
    finding.repaired = true;
    Some(finding)
}
