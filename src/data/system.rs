//! Raw `A·x ≈ d` inputs.

use crate::error::{check_len, Result};
use sprs::{CsMat, TriMat};

/// A sparse linear system: an `n_rows × n_cols` matrix `A` and data vector `d`.
///
/// This is the hand-off type from whatever builds the constraints. The
/// annealer never reads it directly; it is compressed once into a
/// [`ColumnOrganizedData`](super::ColumnOrganizedData).
#[derive(Debug, Clone)]
pub struct SparseLinearSystem {
    a: CsMat<f64>,
    d: Vec<f64>,
}

impl SparseLinearSystem {
    /// Wraps a matrix and its data vector.
    ///
    /// # Errors
    /// Fails if `d.len() != a.rows()`.
    pub fn new(a: CsMat<f64>, d: Vec<f64>) -> Result<Self> {
        check_len("data vector d", a.rows(), d.len())?;
        Ok(Self { a, d })
    }

    /// Builds a system from `(row, col, value)` triplets.
    ///
    /// Duplicate coordinates are summed.
    pub fn from_triplets(
        n_rows: usize,
        n_cols: usize,
        triplets: &[(usize, usize, f64)],
        d: Vec<f64>,
    ) -> Result<Self> {
        let mut tri = TriMat::new((n_rows, n_cols));
        for &(row, col, val) in triplets {
            if row >= n_rows {
                return Err(crate::InversionError::DimensionMismatch {
                    what: "triplet row index",
                    expected: n_rows,
                    actual: row,
                });
            }
            if col >= n_cols {
                return Err(crate::InversionError::DimensionMismatch {
                    what: "triplet column index",
                    expected: n_cols,
                    actual: col,
                });
            }
            tri.add_triplet(row, col, val);
        }
        Self::new(tri.to_csc(), d)
    }

    pub fn a(&self) -> &CsMat<f64> {
        &self.a
    }

    pub fn d(&self) -> &[f64] {
        &self.d
    }

    pub fn n_rows(&self) -> usize {
        self.a.rows()
    }

    pub fn n_cols(&self) -> usize {
        self.a.cols()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_triplets_shape() {
        let sys = SparseLinearSystem::from_triplets(
            2,
            3,
            &[(0, 0, 1.0), (1, 2, 2.0), (1, 2, 0.5)],
            vec![1.0, 2.0],
        )
        .unwrap();
        assert_eq!(sys.n_rows(), 2);
        assert_eq!(sys.n_cols(), 3);
        assert_eq!(sys.a().get(1, 2), Some(&2.5));
    }

    #[test]
    fn test_data_length_mismatch() {
        let res = SparseLinearSystem::from_triplets(2, 2, &[(0, 0, 1.0)], vec![1.0]);
        assert!(res.is_err());
    }

    #[test]
    fn test_triplet_out_of_bounds() {
        let res = SparseLinearSystem::from_triplets(2, 2, &[(2, 0, 1.0)], vec![1.0, 1.0]);
        assert!(res.is_err());
    }
}
