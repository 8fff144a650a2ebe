//! Validated permutations of `0..n`.

use crate::error::{CoreError, Result};

/// A bijection of `0..n`, stored as an index-select table.
///
/// `perm[i]` names the source position whose value moves to position `i`,
/// so applying a permutation to an axis reads `out[i] = in[perm[i]]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Permutation {
    map: Vec<usize>,
}

impl Permutation {
    /// The identity ordering of length `n`.
    pub fn identity(n: usize) -> Self {
        Self {
            map: (0..n).collect(),
        }
    }

    /// Build from an explicit index table, rejecting anything that is not
    /// a bijection of `0..map.len()`.
    pub fn from_vec(map: Vec<usize>) -> Result<Self> {
        let n = map.len();
        let mut seen = vec![false; n];
        for &ix in &map {
            if ix >= n {
                return Err(CoreError::InvalidPermutation {
                    len: n,
                    index: ix,
                    reason: "out of range",
                });
            }
            if seen[ix] {
                return Err(CoreError::InvalidPermutation {
                    len: n,
                    index: ix,
                    reason: "appears more than once",
                });
            }
            seen[ix] = true;
        }
        Ok(Self { map })
    }

    /// Length of the permuted domain.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the domain is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The index table, suitable for index-select along an axis.
    pub fn as_slice(&self) -> &[usize] {
        &self.map
    }

    /// Whether this is the identity ordering.
    pub fn is_identity(&self) -> bool {
        self.map.iter().enumerate().all(|(i, &ix)| i == ix)
    }

    /// The inverse bijection: applying a permutation and then its inverse
    /// restores the original ordering.
    pub fn inverse(&self) -> Self {
        let mut inv = vec![0usize; self.map.len()];
        for (i, &ix) in self.map.iter().enumerate() {
            inv[ix] = i;
        }
        Self { map: inv }
    }
}

impl std::ops::Index<usize> for Permutation {
    type Output = usize;

    fn index(&self, i: usize) -> &usize {
        &self.map[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let p = Permutation::identity(4);
        assert_eq!(p.as_slice(), &[0, 1, 2, 3]);
        assert!(p.is_identity());
        assert_eq!(p.len(), 4);
    }

    #[test]
    fn test_from_vec_validates() {
        assert!(Permutation::from_vec(vec![2, 0, 1]).is_ok());
        assert!(Permutation::from_vec(vec![]).is_ok());

        // Out of range.
        let err = Permutation::from_vec(vec![0, 3, 1]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidPermutation { index: 3, .. }));

        // Duplicate.
        let err = Permutation::from_vec(vec![0, 1, 1]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidPermutation { index: 1, .. }));
    }

    #[test]
    fn test_inverse_round_trip() {
        let p = Permutation::from_vec(vec![2, 0, 3, 1]).unwrap();
        let inv = p.inverse();
        assert_eq!(inv.as_slice(), &[1, 3, 0, 2]);

        let composed: Vec<usize> = (0..4).map(|i| p[inv[i]]).collect();
        assert_eq!(composed, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_non_identity_detected() {
        let p = Permutation::from_vec(vec![1, 0]).unwrap();
        assert!(!p.is_identity());
    }
}
