//! Exact linear assignment.
//!
//! Solves the square assignment problem: given an n×n cost matrix, find
//! the bijection of rows to columns optimizing the total cost. The
//! implementation is the shortest-augmenting-path form of the Hungarian
//! method with dual potentials, O(n³) overall: one Dijkstra-like sweep
//! per row, maintaining feasible row/column potentials so reduced costs
//! stay non-negative.
//!
//! The solution is exact, not heuristic; equal-cost optima may differ in
//! which of the tied bijections is returned, but never in total cost.
//!
//! # References
//!
//! - Kuhn (1955): "The Hungarian method for the assignment problem"
//! - Jonker & Volgenant (1987): "A shortest augmenting path algorithm
//!   for dense and sparse linear assignment problems"

use ndarray::ArrayView2;

use crate::error::{CoreError, Result};

/// Direction of optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    /// Minimize the total cost.
    Minimize,
    /// Maximize the total cost.
    Maximize,
}

/// An optimal row-to-column bijection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Row indices, always the natural order `0..n`.
    pub rows: Vec<usize>,
    /// `cols[i]` is the column assigned to row `i`.
    pub cols: Vec<usize>,
}

/// Solve the assignment problem over a square cost matrix.
///
/// Returns an error for non-square input or non-finite entries.
pub fn solve(cost: ArrayView2<'_, f32>, objective: Objective) -> Result<Assignment> {
    let (rows, cols) = cost.dim();
    if rows != cols {
        return Err(CoreError::NonSquareCost { rows, cols });
    }
    for ((r, c), &x) in cost.indexed_iter() {
        if !x.is_finite() {
            return Err(CoreError::NonFiniteCost { row: r, col: c });
        }
    }

    let n = rows;
    if n == 0 {
        return Ok(Assignment {
            rows: Vec::new(),
            cols: Vec::new(),
        });
    }

    let sign = match objective {
        Objective::Minimize => 1.0f64,
        Objective::Maximize => -1.0f64,
    };

    // 1-based arrays with a sentinel column 0.
    // p[j] is the row currently matched to column j, 0 when free.
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; n + 1];
    let mut p = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];

        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=n {
                if used[j] {
                    continue;
                }
                let cur = sign * f64::from(cost[[i0 - 1, j - 1]]) - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=n {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }

        // Augment along the alternating path back to the sentinel.
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut col_of_row = vec![0usize; n];
    for j in 1..=n {
        col_of_row[p[j] - 1] = j - 1;
    }

    Ok(Assignment {
        rows: (0..n).collect(),
        cols: col_of_row,
    })
}

/// Total cost of selecting `cols[i]` in row `i`, accumulated in f64.
pub fn assignment_score(cost: ArrayView2<'_, f32>, cols: &[usize]) -> f64 {
    cols.iter()
        .enumerate()
        .map(|(i, &j)| f64::from(cost[[i, j]]))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn is_bijection(cols: &[usize]) -> bool {
        let n = cols.len();
        let mut seen = vec![false; n];
        for &c in cols {
            if c >= n || seen[c] {
                return false;
            }
            seen[c] = true;
        }
        true
    }

    /// Exhaustive optimum by enumerating all bijections.
    fn brute_force(cost: &Array2<f32>, objective: Objective) -> f64 {
        fn go(
            cost: &Array2<f32>,
            row: usize,
            taken: &mut Vec<bool>,
            acc: f64,
            best: &mut f64,
            maximize: bool,
        ) {
            let n = cost.nrows();
            if row == n {
                if maximize {
                    *best = best.max(acc);
                } else {
                    *best = best.min(acc);
                }
                return;
            }
            for j in 0..n {
                if !taken[j] {
                    taken[j] = true;
                    go(
                        cost,
                        row + 1,
                        taken,
                        acc + f64::from(cost[[row, j]]),
                        best,
                        maximize,
                    );
                    taken[j] = false;
                }
            }
        }

        let maximize = objective == Objective::Maximize;
        let mut best = if maximize {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
        let mut taken = vec![false; cost.ncols()];
        go(cost, 0, &mut taken, 0.0, &mut best, maximize);
        best
    }

    #[test]
    fn test_single_entry() {
        let cost = array![[7.0f32]];
        let a = solve(cost.view(), Objective::Maximize).unwrap();
        assert_eq!(a.rows, vec![0]);
        assert_eq!(a.cols, vec![0]);
    }

    #[test]
    fn test_empty() {
        let cost = Array2::<f32>::zeros((0, 0));
        let a = solve(cost.view(), Objective::Minimize).unwrap();
        assert!(a.rows.is_empty());
        assert!(a.cols.is_empty());
    }

    #[test]
    fn test_known_minimum() {
        let cost = array![[4.0f32, 1.0, 3.0], [2.0, 0.0, 5.0], [3.0, 2.0, 2.0]];
        let a = solve(cost.view(), Objective::Minimize).unwrap();
        assert_eq!(a.rows, vec![0, 1, 2]);
        assert_eq!(a.cols, vec![1, 0, 2]);
        assert_eq!(assignment_score(cost.view(), &a.cols), 5.0);
    }

    #[test]
    fn test_known_maximum() {
        let cost = array![[4.0f32, 1.0, 3.0], [2.0, 0.0, 5.0], [3.0, 2.0, 2.0]];
        let a = solve(cost.view(), Objective::Maximize).unwrap();
        assert_eq!(a.cols, vec![0, 2, 1]);
        assert_eq!(assignment_score(cost.view(), &a.cols), 11.0);
    }

    #[test]
    fn test_recovers_permutation_matrix() {
        // cost[i][j] = 1 exactly when j = sigma(i); the maximum assignment
        // must trace sigma.
        let sigma = [2usize, 0, 3, 1];
        let mut cost = Array2::<f32>::zeros((4, 4));
        for (i, &j) in sigma.iter().enumerate() {
            cost[[i, j]] = 1.0;
        }

        let a = solve(cost.view(), Objective::Maximize).unwrap();
        assert_eq!(a.cols, sigma.to_vec());
        assert_eq!(assignment_score(cost.view(), &a.cols), 4.0);
    }

    #[test]
    fn test_negative_costs() {
        let cost = array![[-5.0f32, -1.0], [-2.0, -4.0]];
        let a = solve(cost.view(), Objective::Minimize).unwrap();
        // -5 + -4 = -9 beats -1 + -2 = -3.
        assert_eq!(a.cols, vec![0, 1]);
        assert_eq!(assignment_score(cost.view(), &a.cols), -9.0);
    }

    #[test]
    fn test_matches_brute_force() {
        // Deterministic pseudo-random 6x6 matrix.
        let mut state = 0x243f_6a88u32;
        let mut next = move || {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            ((state >> 8) as f32 / (1 << 24) as f32) * 10.0 - 5.0
        };
        let cost = Array2::from_shape_fn((6, 6), |_| next());

        for objective in [Objective::Minimize, Objective::Maximize] {
            let a = solve(cost.view(), objective).unwrap();
            assert!(is_bijection(&a.cols));
            let got = assignment_score(cost.view(), &a.cols);
            let want = brute_force(&cost, objective);
            assert!(
                (got - want).abs() < 1e-9,
                "{:?}: got {}, want {}",
                objective,
                got,
                want
            );
        }
    }

    #[test]
    fn test_ties_still_optimal() {
        let cost = Array2::<f32>::ones((4, 4));
        let a = solve(cost.view(), Objective::Maximize).unwrap();
        assert!(is_bijection(&a.cols));
        assert_eq!(assignment_score(cost.view(), &a.cols), 4.0);
    }

    #[test]
    fn test_non_square_rejected() {
        let cost = Array2::<f32>::zeros((2, 3));
        let err = solve(cost.view(), Objective::Minimize).unwrap_err();
        assert!(matches!(
            err,
            CoreError::NonSquareCost { rows: 2, cols: 3 }
        ));
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut cost = Array2::<f32>::zeros((2, 2));
        cost[[1, 0]] = f32::NAN;
        let err = solve(cost.view(), Objective::Minimize).unwrap_err();
        assert!(matches!(err, CoreError::NonFiniteCost { row: 1, col: 0 }));
    }
}
