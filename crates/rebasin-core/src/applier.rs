//! Applying permutations to parameter sets.

use std::collections::BTreeMap;

use crate::error::{CoreError, Result};
use crate::params::ParameterSet;
use crate::perm::Permutation;
use crate::policy::KeyPolicy;
use crate::spec::{GroupId, PermutationSpec};
use crate::tensor::Tensor;

/// Solved permutations, one per eligible group.
pub type PermMap = BTreeMap<GroupId, Permutation>;

/// Read `params[key]` with the current permutations applied to each of
/// its registered axes.
///
/// `except_axis` withholds the permutation of that one axis; the matcher
/// uses this while solving for the group that owns the axis, so the axis
/// under optimization stays in natural order. Axes assigned to no group,
/// axes of groups with no solved permutation, and keys with no spec entry
/// are returned untouched. The input set is never mutated.
pub fn get_permuted_param(
    spec: &PermutationSpec,
    perm: &PermMap,
    key: &str,
    params: &ParameterSet,
    except_axis: Option<usize>,
) -> Result<Tensor> {
    let tensor = params
        .get(key)
        .ok_or_else(|| CoreError::TensorNotFound(key.to_string()))?;

    let Some(axes) = spec.axes_of(key) else {
        return Ok(tensor.clone());
    };

    let mut out = tensor.clone();
    for (axis, group) in axes.iter().enumerate() {
        if except_axis == Some(axis) {
            continue;
        }
        let Some(g) = group else {
            continue;
        };
        let Some(p) = perm.get(g) else {
            continue;
        };

        if axis >= out.ndim() {
            return Err(CoreError::AxisOutOfBounds {
                key: key.to_string(),
                axis,
                rank: out.ndim(),
            });
        }
        let axis_len = out.shape()[axis];
        if p.len() != axis_len {
            return Err(CoreError::ShapeMismatch {
                key: key.to_string(),
                axis,
                axis_len,
                perm_len: p.len(),
            });
        }
        out = out.select_axis(axis, p.as_slice());
    }
    Ok(out)
}

/// Materialize a fully permuted copy of `params`.
///
/// Every key kept by the policy appears in the output with all of its
/// registered axes permuted; excluded keys are dropped. Output shapes
/// equal input shapes, and the output shares no storage with the input.
pub fn apply_permutation(
    spec: &PermutationSpec,
    policy: &KeyPolicy,
    perm: &PermMap,
    params: &ParameterSet,
) -> Result<ParameterSet> {
    let mut out = ParameterSet::new();
    for key in params.keys() {
        if !policy.keeps_on_permute(key) {
            continue;
        }
        out.insert(
            key.clone(),
            get_permuted_param(spec, perm, key, params, None)?,
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::KeyRule;
    use crate::spec::SpecBuilder;
    use ndarray::{ArrayD, IxDyn};

    fn spec_one_group() -> PermutationSpec {
        let mut b = SpecBuilder::new();
        b.tensor("w", vec![Some("p0".into()), None]).unwrap();
        b.tensor("b", vec![Some("p0".into())]).unwrap();
        b.build()
    }

    fn tensor_2x2(values: [f32; 4]) -> Tensor {
        Tensor::F32(ArrayD::from_shape_vec(IxDyn(&[2, 2]), values.to_vec()).unwrap())
    }

    fn swap_perm() -> PermMap {
        let mut m = PermMap::new();
        m.insert("p0".to_string(), Permutation::from_vec(vec![1, 0]).unwrap());
        m
    }

    #[test]
    fn test_permutes_registered_axis_only() {
        let spec = spec_one_group();
        let mut params = ParameterSet::new();
        params.insert("w", tensor_2x2([1.0, 2.0, 3.0, 4.0]));

        let out = get_permuted_param(&spec, &swap_perm(), "w", &params, None).unwrap();
        // Rows swap, columns stay.
        assert_eq!(out, tensor_2x2([3.0, 4.0, 1.0, 2.0]));
        assert_eq!(out.shape(), &[2, 2]);
    }

    #[test]
    fn test_except_axis_withholds() {
        let spec = spec_one_group();
        let mut params = ParameterSet::new();
        params.insert("w", tensor_2x2([1.0, 2.0, 3.0, 4.0]));

        let out = get_permuted_param(&spec, &swap_perm(), "w", &params, Some(0)).unwrap();
        assert_eq!(out, tensor_2x2([1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn test_unregistered_key_passes_through() {
        let spec = spec_one_group();
        let mut params = ParameterSet::new();
        params.insert("other", tensor_2x2([5.0, 6.0, 7.0, 8.0]));

        let out = get_permuted_param(&spec, &swap_perm(), "other", &params, None).unwrap();
        assert_eq!(out, tensor_2x2([5.0, 6.0, 7.0, 8.0]));
    }

    #[test]
    fn test_unsolved_group_leaves_axis() {
        let spec = spec_one_group();
        let mut params = ParameterSet::new();
        params.insert("w", tensor_2x2([1.0, 2.0, 3.0, 4.0]));

        let out = get_permuted_param(&spec, &PermMap::new(), "w", &params, None).unwrap();
        assert_eq!(out, tensor_2x2([1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn test_missing_tensor_is_an_error() {
        let spec = spec_one_group();
        let params = ParameterSet::new();
        let err = get_permuted_param(&spec, &swap_perm(), "w", &params, None).unwrap_err();
        assert!(matches!(err, CoreError::TensorNotFound(_)));
    }

    #[test]
    fn test_wrong_length_is_shape_mismatch() {
        let spec = spec_one_group();
        let mut params = ParameterSet::new();
        params.insert(
            "b",
            Tensor::F32(ArrayD::from_shape_vec(IxDyn(&[3]), vec![1.0, 2.0, 3.0]).unwrap()),
        );

        let err = get_permuted_param(&spec, &swap_perm(), "b", &params, None).unwrap_err();
        assert!(matches!(
            err,
            CoreError::ShapeMismatch {
                axis_len: 3,
                perm_len: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_apply_drops_excluded_keys() {
        let spec = spec_one_group();
        let policy = KeyPolicy {
            permute_exclude: vec![KeyRule::Contains("model_".into())],
            ..KeyPolicy::default()
        };
        let mut params = ParameterSet::new();
        params.insert("w", tensor_2x2([1.0, 2.0, 3.0, 4.0]));
        params.insert(
            "model_ema.decay",
            Tensor::F32(ArrayD::from_shape_vec(IxDyn(&[1]), vec![0.99]).unwrap()),
        );

        let out = apply_permutation(&spec, &policy, &swap_perm(), &params).unwrap();
        assert!(out.contains("w"));
        assert!(!out.contains("model_ema.decay"));
        assert_eq!(out.get("w").unwrap(), &tensor_2x2([3.0, 4.0, 1.0, 2.0]));
        // Input untouched.
        assert_eq!(params.get("w").unwrap(), &tensor_2x2([1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn test_round_trip_with_inverse() {
        let spec = spec_one_group();
        let policy = KeyPolicy::default();
        let mut params = ParameterSet::new();
        params.insert("w", tensor_2x2([1.0, 2.0, 3.0, 4.0]));
        params.insert(
            "b",
            Tensor::F32(ArrayD::from_shape_vec(IxDyn(&[2]), vec![9.0, 8.0]).unwrap()),
        );

        let forward = swap_perm();
        let mut backward = PermMap::new();
        backward.insert("p0".to_string(), forward["p0"].inverse());

        let once = apply_permutation(&spec, &policy, &forward, &params).unwrap();
        let back = apply_permutation(&spec, &policy, &backward, &once).unwrap();
        assert_eq!(back, params);
    }
}
