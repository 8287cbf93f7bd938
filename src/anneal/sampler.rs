//! Column selection for each proposal.

use crate::error::{InversionError, Result};
use rand::{Rng, RngCore};
use std::fmt;

/// Picks the variable to perturb.
pub trait ColumnSampler: Send + Sync + fmt::Debug {
    /// Number of columns this sampler draws from.
    fn num_columns(&self) -> usize;

    /// Draws a column index in `0..num_columns()`.
    fn sample(&self, rng: &mut dyn RngCore) -> usize;
}

/// Every column equally likely.
#[derive(Debug, Clone, Copy)]
pub struct UniformSampler {
    n: usize,
}

impl UniformSampler {
    pub fn new(n: usize) -> Self {
        Self { n }
    }
}

impl ColumnSampler for UniformSampler {
    fn num_columns(&self) -> usize {
        self.n
    }

    #[inline]
    fn sample(&self, rng: &mut dyn RngCore) -> usize {
        rng.random_range(0..self.n)
    }
}

/// Columns drawn in proportion to nonnegative weights.
///
/// Uses a cumulative table and binary search, so each draw is `O(log n)`.
#[derive(Debug, Clone)]
pub struct DiscreteSampler {
    cumulative: Vec<f64>,
}

impl DiscreteSampler {
    /// # Errors
    /// Fails if any weight is negative or non-finite, or if all are zero.
    pub fn new(weights: &[f64]) -> Result<Self> {
        let mut cumulative = Vec::with_capacity(weights.len());
        let mut total = 0.0;
        for (i, &w) in weights.iter().enumerate() {
            if !(w.is_finite() && w >= 0.0) {
                return Err(InversionError::InvalidConfig(format!(
                    "sampler weight {i} must be finite and nonnegative, got {w}"
                )));
            }
            total += w;
            cumulative.push(total);
        }
        if total <= 0.0 {
            return Err(InversionError::InvalidConfig(
                "sampler weights must have a positive sum".into(),
            ));
        }
        Ok(Self { cumulative })
    }

    fn total(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }
}

impl ColumnSampler for DiscreteSampler {
    fn num_columns(&self) -> usize {
        self.cumulative.len()
    }

    fn sample(&self, rng: &mut dyn RngCore) -> usize {
        let target = rng.random::<f64>() * self.total();
        // first index whose cumulative weight exceeds the target; skips zero-weight columns
        let idx = self.cumulative.partition_point(|&c| c <= target);
        idx.min(self.cumulative.len() - 1)
    }
}
