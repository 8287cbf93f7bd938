//! Point-in-time views of a run.

use crate::data::ConstraintRange;
use std::time::Duration;

/// Borrowed view of a run's progress, built every iteration without
/// allocation and handed to completion criteria.
#[derive(Debug, Clone, Copy)]
pub struct InversionState<'a> {
    /// Wall-clock time since the current `iterate` call started.
    pub elapsed: Duration,
    /// Completed iterations, including any carried over from a start state.
    pub iterations: u64,
    /// Best energy vector.
    pub energy: &'a [f64],
    /// Accepted perturbations.
    pub perturbs_kept: u64,
    /// Accepted uphill perturbations that led to a recorded best.
    pub worse_values_kept: u64,
    /// Nonzero entries of the best solution.
    pub num_non_zero: usize,
    pub best_solution: &'a [f64],
    pub best_misfit: &'a [f64],
    pub best_misfit_ineq: Option<&'a [f64]>,
    pub constraint_ranges: &'a [ConstraintRange],
}

impl InversionState<'_> {
    /// Total energy.
    pub fn total_energy(&self) -> f64 {
        self.energy.first().copied().unwrap_or(f64::INFINITY)
    }

    /// Copies this view into an owned snapshot.
    pub fn to_snapshot(&self) -> InversionSnapshot {
        InversionSnapshot {
            elapsed: self.elapsed,
            iterations: self.iterations,
            energy: self.energy.to_vec(),
            perturbs_kept: self.perturbs_kept,
            worse_values_kept: self.worse_values_kept,
            num_non_zero: self.num_non_zero,
            best_solution: self.best_solution.to_vec(),
            best_misfit: self.best_misfit.to_vec(),
            best_misfit_ineq: self.best_misfit_ineq.map(<[f64]>::to_vec),
            constraint_ranges: self.constraint_ranges.to_vec(),
        }
    }
}

/// Owned counterpart of [`InversionState`], returned by `iterate`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InversionSnapshot {
    pub elapsed: Duration,
    pub iterations: u64,
    pub energy: Vec<f64>,
    pub perturbs_kept: u64,
    pub worse_values_kept: u64,
    pub num_non_zero: usize,
    pub best_solution: Vec<f64>,
    pub best_misfit: Vec<f64>,
    pub best_misfit_ineq: Option<Vec<f64>>,
    pub constraint_ranges: Vec<ConstraintRange>,
}

impl InversionSnapshot {
    /// Borrows this snapshot as an [`InversionState`].
    pub fn state(&self) -> InversionState<'_> {
        InversionState {
            elapsed: self.elapsed,
            iterations: self.iterations,
            energy: &self.energy,
            perturbs_kept: self.perturbs_kept,
            worse_values_kept: self.worse_values_kept,
            num_non_zero: self.num_non_zero,
            best_solution: &self.best_solution,
            best_misfit: &self.best_misfit,
            best_misfit_ineq: self.best_misfit_ineq.as_deref(),
            constraint_ranges: &self.constraint_ranges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_round_trips_view() {
        let energy = [3.0, 2.0, 0.0, 1.0];
        let x = [1.0, 0.0];
        let misfit = [0.5];
        let view = InversionState {
            elapsed: Duration::from_millis(5),
            iterations: 10,
            energy: &energy,
            perturbs_kept: 4,
            worse_values_kept: 1,
            num_non_zero: 1,
            best_solution: &x,
            best_misfit: &misfit,
            best_misfit_ineq: None,
            constraint_ranges: &[],
        };
        let snap = view.to_snapshot();
        let again = snap.state();
        assert_eq!(again.iterations, 10);
        assert_eq!(again.energy, &energy);
        assert_eq!(again.total_energy(), 3.0);
        assert!(again.best_misfit_ineq.is_none());
    }
}
