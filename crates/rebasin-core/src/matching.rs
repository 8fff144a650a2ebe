//! The weight matching solver.
//!
//! Coordinate descent over permutation groups: each pass visits the
//! groups in a shuffled order and, for one group at a time, builds a
//! similarity matrix between reference units and target units given
//! every *other* axis's current alignment, then solves an exact linear
//! assignment to re-order that group optimally. Passes repeat until no
//! group improves by more than a fixed threshold or the pass budget runs
//! out.
//!
//! The shuffled visit order avoids a fixed processing bias between
//! passes; it affects the convergence path, never the validity of the
//! result, and is seedable for reproducible runs.

use std::collections::BTreeMap;

use half::f16;
use ndarray::{Array2, ArrayD};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, trace};

use crate::applier::{get_permuted_param, PermMap};
use crate::assignment::{assignment_score, solve, Assignment, Objective};
use crate::error::{CoreError, Result};
use crate::params::ParameterSet;
use crate::perm::Permutation;
use crate::spec::{GroupId, PermutationSpec};

/// Improvements at or below this threshold do not count as progress.
const PROGRESS_THRESHOLD: f64 = 1e-12;

/// Floating point width used when accumulating cost matrices.
///
/// `Half` reproduces 16-bit accumulation by rounding the slices, each
/// partial product, the running sum, and the pass scores through f16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit accumulation.
    #[default]
    Full,
    /// 16-bit accumulation, emulated in software.
    Half,
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Precision::Full => write!(f, "full"),
            Precision::Half => write!(f, "half"),
        }
    }
}

/// Options for a weight matching invocation.
#[derive(Debug, Clone)]
pub struct MatchOptions {
    /// Maximum number of passes over the groups. Zero runs no passes and
    /// returns the initial permutation.
    pub max_iterations: usize,

    /// Accumulation precision.
    pub precision: Precision,

    /// Seed for the group visit order. Unseeded runs draw from entropy.
    pub seed: Option<u64>,

    /// Restrict solving to these groups; eligible groups outside the
    /// subset keep their current permutation. `None` solves every
    /// eligible group.
    pub groups: Option<Vec<GroupId>>,

    /// Starting permutations. Eligible groups not covered here start at
    /// identity.
    pub init: Option<PermMap>,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            precision: Precision::Full,
            seed: None,
            groups: None,
            init: None,
        }
    }
}

impl MatchOptions {
    /// The defaults used by the merge pipeline: three passes, full
    /// precision, entropy-seeded visit order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the visit-order seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the accumulation precision.
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }
}

/// Result of a weight matching invocation.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    /// Solved permutation per eligible group.
    pub perm: PermMap,

    /// Mean absolute score change over all group visits that changed the
    /// score; 0 when nothing changed.
    pub average_improvement: f32,

    /// Number of passes actually run.
    pub iterations: usize,

    /// Whether a pass completed with no progress before the budget ran
    /// out.
    pub converged: bool,
}

/// Find permutations of `target`'s units that align it to `reference`.
///
/// Groups whose defining tensor is absent from the target are skipped,
/// not errors. See the module docs for the algorithm.
pub fn weight_matching(
    spec: &PermutationSpec,
    reference: &ParameterSet,
    target: &ParameterSet,
    options: &MatchOptions,
) -> Result<MatchOutcome> {
    let sizes = eligible_group_sizes(spec, reference, target)?;

    let mut perm: PermMap = match &options.init {
        Some(init) => init.clone(),
        None => PermMap::new(),
    };
    for (g, &n) in &sizes {
        match perm.get(g) {
            Some(p) if p.len() != n => {
                let key = spec
                    .axes_in_group(g)
                    .and_then(|axes| axes.first())
                    .map(|(k, _)| k.clone())
                    .unwrap_or_default();
                return Err(CoreError::GroupShapeMismatch {
                    group: g.clone(),
                    key,
                    expected: vec![n],
                    actual: vec![p.len()],
                });
            }
            Some(_) => {}
            None => {
                perm.insert(g.clone(), Permutation::identity(n));
            }
        }
    }

    let mut solve_list: Vec<GroupId> = match &options.groups {
        Some(subset) => subset
            .iter()
            .filter(|g| {
                let eligible = sizes.contains_key(*g);
                if !eligible {
                    debug!(group = %g, "requested group not eligible, ignoring");
                }
                eligible
            })
            .cloned()
            .collect(),
        None => sizes.keys().cloned().collect(),
    };

    let mut rng = match options.seed {
        Some(s) => rand::rngs::StdRng::seed_from_u64(s),
        None => rand::rngs::StdRng::from_entropy(),
    };

    debug!(
        groups = solve_list.len(),
        max_iterations = options.max_iterations,
        precision = %options.precision,
        "starting weight matching"
    );

    let mut improvement_sum = 0.0f64;
    let mut improvement_count = 0u64;
    let mut iterations = 0usize;
    let mut converged = false;

    for pass in 0..options.max_iterations {
        iterations = pass + 1;
        let mut progress = false;
        solve_list.shuffle(&mut rng);

        for g in &solve_list {
            let n = sizes[g];
            let cost = build_cost_matrix(spec, reference, target, &perm, g, n, options.precision)?;

            if let Some(((row, col), _)) =
                cost.indexed_iter().find(|(_, x)| !x.is_finite())
            {
                tracing::error!(group = %g, row, col, "non-finite cost matrix entry");
                return Err(CoreError::NonFiniteCost { row, col });
            }

            let assignment = solve(cost.view(), Objective::Maximize)?;
            check_row_identity(&assignment, g)?;

            let mut old_score = assignment_score(cost.view(), perm[g].as_slice());
            let mut new_score = assignment_score(cost.view(), &assignment.cols);
            if options.precision == Precision::Half {
                old_score = f64::from(quantize_f16(old_score as f32));
                new_score = f64::from(quantize_f16(new_score as f32));
            }

            if new_score - old_score != 0.0 {
                improvement_sum += (new_score - old_score).abs();
                improvement_count += 1;
            }
            progress = progress || new_score > old_score + PROGRESS_THRESHOLD;
            trace!(group = %g, old_score, new_score, "group solved");

            perm.insert(g.clone(), Permutation::from_vec(assignment.cols)?);
        }

        debug!(pass = pass + 1, progress, "matching pass complete");
        if !progress {
            converged = true;
            break;
        }
    }

    let average_improvement = if improvement_count > 0 {
        (improvement_sum / improvement_count as f64) as f32
    } else {
        0.0
    };

    Ok(MatchOutcome {
        perm,
        average_improvement,
        iterations,
        converged,
    })
}

/// Group sizes for every group whose defining tensor exists in the
/// target, taken from the reference side.
fn eligible_group_sizes(
    spec: &PermutationSpec,
    reference: &ParameterSet,
    target: &ParameterSet,
) -> Result<BTreeMap<GroupId, usize>> {
    let mut sizes = BTreeMap::new();
    for (g, axes) in spec.groups() {
        let (key, axis) = &axes[0];
        if !target.contains(key) {
            trace!(group = %g, key = %key, "group not applicable to target");
            continue;
        }
        let Some(tensor) = reference.get(key) else {
            debug!(group = %g, key = %key, "defining tensor missing from reference, skipping");
            continue;
        };
        let Some(&n) = tensor.shape().get(*axis) else {
            return Err(CoreError::AxisOutOfBounds {
                key: key.clone(),
                axis: *axis,
                rank: tensor.ndim(),
            });
        };
        sizes.insert(g.clone(), n);
    }
    Ok(sizes)
}

/// Accumulate the n×n similarity matrix for one group.
fn build_cost_matrix(
    spec: &PermutationSpec,
    reference: &ParameterSet,
    target: &ParameterSet,
    perm: &PermMap,
    group: &str,
    n: usize,
    precision: Precision,
) -> Result<Array2<f32>> {
    let mut cost = Array2::<f32>::zeros((n, n));
    let Some(axes) = spec.axes_in_group(group) else {
        return Ok(cost);
    };

    for (key, axis) in axes {
        if !reference.contains(key) || !target.contains(key) {
            debug!(group = %group, key = %key, "tensor absent on one side, skipping pair");
            continue;
        }
        let Some(ref_arr) = reference.get(key).and_then(|t| t.as_f32()) else {
            debug!(group = %group, key = %key, "non-float tensor in group, skipping pair");
            continue;
        };
        if *axis >= ref_arr.ndim() {
            return Err(CoreError::AxisOutOfBounds {
                key: key.clone(),
                axis: *axis,
                rank: ref_arr.ndim(),
            });
        }
        if ref_arr.shape()[*axis] != n {
            return Err(CoreError::GroupShapeMismatch {
                group: group.to_string(),
                key: key.clone(),
                expected: vec![n],
                actual: vec![ref_arr.shape()[*axis]],
            });
        }

        let permuted = get_permuted_param(spec, perm, key, target, Some(*axis))?;
        let Some(tgt_arr) = permuted.as_f32() else {
            debug!(group = %group, key = %key, "non-float tensor in group, skipping pair");
            continue;
        };
        if tgt_arr.shape() != ref_arr.shape() {
            return Err(CoreError::GroupShapeMismatch {
                group: group.to_string(),
                key: key.clone(),
                expected: ref_arr.shape().to_vec(),
                actual: tgt_arr.shape().to_vec(),
            });
        }

        let mut ref_mat = axis_major_matrix(ref_arr, *axis);
        let mut tgt_mat = axis_major_matrix(tgt_arr, *axis);
        if precision == Precision::Half {
            ref_mat.mapv_inplace(quantize_f16);
            tgt_mat.mapv_inplace(quantize_f16);
        }

        let mut product = ref_mat.dot(&tgt_mat.t());
        if precision == Precision::Half {
            product.mapv_inplace(quantize_f16);
        }
        cost += &product;
        if precision == Precision::Half {
            cost.mapv_inplace(quantize_f16);
        }
    }

    Ok(cost)
}

/// Move `axis` to the front and flatten the rest, row-major.
fn axis_major_matrix(arr: &ArrayD<f32>, axis: usize) -> Array2<f32> {
    let n = arr.shape()[axis];
    let features = arr.len() / n.max(1);

    let mut order: Vec<usize> = (0..arr.ndim()).collect();
    order.remove(axis);
    order.insert(0, axis);

    let moved = arr.view().permuted_axes(order);
    let data: Vec<f32> = moved.iter().copied().collect();
    Array2::from_shape_vec((n, features), data)
        .expect("axis-major data length matches (n, features)")
}

/// Round a value through f16 storage.
pub(crate) fn quantize_f16(x: f32) -> f32 {
    f16::from_f32(x).to_f32()
}

fn check_row_identity(assignment: &Assignment, group: &str) -> Result<()> {
    let ordered = assignment
        .rows
        .iter()
        .enumerate()
        .all(|(i, &r)| i == r);
    if !ordered {
        return Err(CoreError::SolverInvariant {
            group: group.to_string(),
        });
    }
    Ok(())
}
