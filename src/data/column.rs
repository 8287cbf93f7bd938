//! Column-major compressed view of a linear system.
//!
//! Annealing perturbs one variable at a time, so the only rows whose misfit
//! changes are the nonzero rows of that variable's column. Storing the matrix
//! column by column lets a residual update cost `O(nnz(column))` instead of
//! `O(n_rows)`.

use super::system::SparseLinearSystem;
use crate::error::{check_len, InversionError, Result};
use ndarray::ArrayView2;
use sprs::CsMat;

/// Dense inputs above this many cells trigger a warning.
const DENSE_WARN_CELLS: usize = 1_000_000;

/// Immutable column-organized copy of `A` and `d`.
///
/// For column `c`, `rows(c)[k]` and `values(c)[k]` are parallel: the row index
/// and value of the `k`-th nonzero. Reweighting never mutates an instance; it
/// derives a new one with [`scale_rows`](Self::scale_rows).
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnOrganizedData {
    n_rows: usize,
    n_cols: usize,
    col_rows: Vec<Vec<usize>>,
    col_values: Vec<Vec<f64>>,
    d: Vec<f64>,
    max_rows_per_col: usize,
}

impl ColumnOrganizedData {
    /// Compresses a [`SparseLinearSystem`] in `O(nnz)`.
    pub fn from_system(system: &SparseLinearSystem) -> Result<Self> {
        Self::from_csmat(system.a(), system.d().to_vec())
    }

    /// Compresses a sparse matrix in either storage order.
    ///
    /// CSC input is read directly; CSR input is converted first.
    pub fn from_csmat(a: &CsMat<f64>, d: Vec<f64>) -> Result<Self> {
        check_len("data vector d", a.rows(), d.len())?;
        let csc;
        let a = if a.is_csc() {
            a
        } else {
            csc = a.to_csc();
            &csc
        };

        let mut col_rows = Vec::with_capacity(a.cols());
        let mut col_values = Vec::with_capacity(a.cols());
        for col in a.outer_iterator() {
            let mut rows = Vec::with_capacity(col.nnz());
            let mut values = Vec::with_capacity(col.nnz());
            for (row, &val) in col.iter() {
                if val != 0.0 {
                    rows.push(row);
                    values.push(val);
                }
            }
            col_rows.push(rows);
            col_values.push(values);
        }
        Ok(Self::assemble(a.rows(), col_rows, col_values, d))
    }

    /// Scans a dense matrix cell by cell.
    ///
    /// This is `O(rows·cols)` and only sensible for small systems.
    pub fn from_dense(a: ArrayView2<'_, f64>, d: Vec<f64>) -> Result<Self> {
        let (n_rows, n_cols) = a.dim();
        check_len("data vector d", n_rows, d.len())?;
        if n_rows.saturating_mul(n_cols) > DENSE_WARN_CELLS {
            tracing::warn!(
                n_rows,
                n_cols,
                "building column-organized data from a large dense matrix; use a sparse matrix instead"
            );
        }
        let mut col_rows = vec![Vec::new(); n_cols];
        let mut col_values = vec![Vec::new(); n_cols];
        for ((row, col), &val) in a.indexed_iter() {
            if val != 0.0 {
                col_rows[col].push(row);
                col_values[col].push(val);
            }
        }
        Ok(Self::assemble(n_rows, col_rows, col_values, d))
    }

    /// Builds directly from per-column row indices and values. A row may
    /// appear at most once per column.
    pub fn from_columns(
        n_rows: usize,
        col_rows: Vec<Vec<usize>>,
        col_values: Vec<Vec<f64>>,
        d: Vec<f64>,
    ) -> Result<Self> {
        check_len("data vector d", n_rows, d.len())?;
        check_len("column value arrays", col_rows.len(), col_values.len())?;
        let mut seen = vec![false; n_rows];
        for (col, (rows, values)) in col_rows.iter().zip(&col_values).enumerate() {
            check_len("column values", rows.len(), values.len())?;
            if let Some(&bad) = rows.iter().find(|&&r| r >= n_rows) {
                return Err(InversionError::DimensionMismatch {
                    what: "column row index",
                    expected: n_rows,
                    actual: bad,
                });
            }
            for &row in rows {
                if std::mem::replace(&mut seen[row], true) {
                    return Err(InversionError::InvalidConfig(format!(
                        "column {col} repeats row {row}"
                    )));
                }
            }
            for &row in rows {
                seen[row] = false;
            }
        }
        Ok(Self::assemble(n_rows, col_rows, col_values, d))
    }

    fn assemble(
        n_rows: usize,
        col_rows: Vec<Vec<usize>>,
        col_values: Vec<Vec<f64>>,
        d: Vec<f64>,
    ) -> Self {
        let max_rows_per_col = col_rows.iter().map(Vec::len).max().unwrap_or(0);
        Self {
            n_rows,
            n_cols: col_rows.len(),
            col_rows,
            col_values,
            d,
            max_rows_per_col,
        }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    /// Observed data vector.
    pub fn d(&self) -> &[f64] {
        &self.d
    }

    /// Nonzero row indices of column `col`.
    #[inline]
    pub fn rows(&self, col: usize) -> &[usize] {
        &self.col_rows[col]
    }

    /// Nonzero values of column `col`, parallel to [`rows`](Self::rows).
    #[inline]
    pub fn values(&self, col: usize) -> &[f64] {
        &self.col_values[col]
    }

    /// Largest number of nonzeros in any single column.
    pub fn max_rows_per_col(&self) -> usize {
        self.max_rows_per_col
    }

    /// Total number of stored nonzeros.
    pub fn nnz(&self) -> usize {
        self.col_rows.iter().map(Vec::len).sum()
    }

    /// Value of `A[row, col]`, zero if not stored.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.rows(col)
            .iter()
            .position(|&r| r == row)
            .map_or(0.0, |k| self.col_values[col][k])
    }

    /// Writes `A·x − d` into `misfit` (synthetics minus data).
    ///
    /// Full product; not used inside the annealing loop.
    pub fn misfit_into(&self, solution: &[f64], misfit: &mut [f64]) {
        debug_assert_eq!(solution.len(), self.n_cols);
        for (m, &d) in misfit.iter_mut().zip(&self.d) {
            *m = -d;
        }
        for (col, &x) in solution.iter().enumerate() {
            if x == 0.0 {
                continue;
            }
            for (&row, &val) in self.col_rows[col].iter().zip(&self.col_values[col]) {
                misfit[row] = val.mul_add(x, misfit[row]);
            }
        }
    }

    /// Allocating form of [`misfit_into`](Self::misfit_into).
    pub fn misfit(&self, solution: &[f64]) -> Vec<f64> {
        let mut misfit = vec![0.0; self.n_rows];
        self.misfit_into(solution, &mut misfit);
        misfit
    }

    /// Returns a copy with every row `r` of `A` and `d` multiplied by `scalars[r]`.
    pub fn scale_rows(&self, scalars: &[f64]) -> Result<Self> {
        check_len("row scalars", self.n_rows, scalars.len())?;
        let col_values = self
            .col_values
            .iter()
            .zip(&self.col_rows)
            .map(|(values, rows)| {
                values
                    .iter()
                    .zip(rows)
                    .map(|(&v, &r)| v * scalars[r])
                    .collect()
            })
            .collect();
        let d = self.d.iter().zip(scalars).map(|(&d, &s)| d * s).collect();
        Ok(Self {
            n_rows: self.n_rows,
            n_cols: self.n_cols,
            col_rows: self.col_rows.clone(),
            col_values,
            d,
            max_rows_per_col: self.max_rows_per_col,
        })
    }
}
