//! The interface shared by the serial core, the parallel coordinator and the
//! reweighting decorator.

use super::energy::calculate_energy;
use super::state::{InversionSnapshot, InversionState};
use crate::completion::{CompletionCriteria, IterationCompletionCriteria};
use crate::data::{ColumnOrganizedData, ConstraintRange};
use crate::error::{check_len, InversionError, Result};
use std::sync::Arc;

/// Best solution together with its misfits and energy.
///
/// This is what drivers exchange between rounds.
#[derive(Debug, Clone, PartialEq)]
pub struct BestResults {
    pub energy: Vec<f64>,
    pub solution: Vec<f64>,
    pub misfit: Vec<f64>,
    pub misfit_ineq: Option<Vec<f64>>,
    pub num_non_zero: usize,
}

impl BestResults {
    /// Evaluates `solution` from scratch against the given systems.
    pub fn evaluate(
        equality: &ColumnOrganizedData,
        inequality: Option<&ColumnOrganizedData>,
        solution: Vec<f64>,
        ranges: &[ConstraintRange],
        smoothness_weight: f64,
    ) -> Result<Self> {
        check_len("solution", equality.n_cols(), solution.len())?;
        let misfit = equality.misfit(&solution);
        let misfit_ineq = inequality.map(|data| data.misfit(&solution));
        let energy = calculate_energy(
            &solution,
            &misfit,
            misfit_ineq.as_deref(),
            ranges,
            smoothness_weight,
        )?;
        let num_non_zero = count_non_zero(&solution);
        Ok(Self {
            energy,
            solution,
            misfit,
            misfit_ineq,
            num_non_zero,
        })
    }

    /// Checks the shapes against an `n_rows × n_cols` equality system and an
    /// optional inequality system.
    pub(crate) fn check_shape(&self, n_rows: usize, n_cols: usize, ineq_rows: Option<usize>) -> Result<()> {
        check_len("solution", n_cols, self.solution.len())?;
        check_len("misfit", n_rows, self.misfit.len())?;
        match (ineq_rows, &self.misfit_ineq) {
            (Some(rows), Some(m)) => check_len("inequality misfit", rows, m.len())?,
            (Some(_), None) => return Err(InversionError::MissingInput("inequality misfit")),
            (None, _) => {}
        }
        if self.energy.len() < super::energy::E_FIXED_LEN {
            return Err(InversionError::DimensionMismatch {
                what: "energy vector",
                expected: super::energy::E_FIXED_LEN,
                actual: self.energy.len(),
            });
        }
        Ok(())
    }
}

/// Number of strictly positive entries.
pub fn count_non_zero(solution: &[f64]) -> usize {
    solution.iter().filter(|&&x| x > 0.0).count()
}

/// A simulated-annealing driver over a nonnegative least-squares system.
///
/// Implemented by [`AnnealingCore`](super::AnnealingCore),
/// [`ParallelCoordinator`](crate::parallel::ParallelCoordinator) and
/// [`AdaptiveReweighter`](crate::reweight::AdaptiveReweighter).
pub trait SimulatedAnnealing {
    /// Anneals until `criteria` is satisfied, continuing from `start`'s
    /// iteration and perturbation counters if given.
    fn iterate_from(
        &mut self,
        start: Option<&InversionState<'_>>,
        criteria: &dyn CompletionCriteria,
    ) -> Result<InversionSnapshot>;

    /// Anneals from zero counters until `criteria` is satisfied.
    fn iterate(&mut self, criteria: &dyn CompletionCriteria) -> Result<InversionSnapshot> {
        self.iterate_from(None, criteria)
    }

    /// Anneals for a fixed number of iterations.
    fn iterate_for(&mut self, iterations: u64) -> Result<InversionSnapshot> {
        self.iterate(&IterationCompletionCriteria::new(iterations))
    }

    fn best_solution(&self) -> &[f64];

    /// `[total, equality, entropy, inequality, per-range...]`.
    fn best_energy(&self) -> &[f64];

    fn best_misfit(&self) -> &[f64];

    fn best_inequality_misfit(&self) -> Option<&[f64]>;

    fn num_non_zero(&self) -> usize;

    fn initial_solution(&self) -> &[f64];

    fn equality_data(&self) -> &Arc<ColumnOrganizedData>;

    fn inequality_data(&self) -> Option<&Arc<ColumnOrganizedData>>;

    fn smoothness_weight(&self) -> f64;

    fn constraint_ranges(&self) -> &[ConstraintRange];

    /// Replaces the constraint ranges used for per-range energies.
    fn set_constraint_ranges(&mut self, ranges: Vec<ConstraintRange>) -> Result<()>;

    /// Injects a best state, typically reconciled across replicas.
    fn set_results(&mut self, results: &BestResults) -> Result<()>;

    /// Swaps in new (reweighted) systems together with a state evaluated
    /// against them.
    fn set_all(
        &mut self,
        equality: Arc<ColumnOrganizedData>,
        inequality: Option<Arc<ColumnOrganizedData>>,
        results: &BestResults,
    ) -> Result<()>;

    /// Full energy of `solution`, recomputing its misfits.
    fn calculate_energy(&self, solution: &[f64]) -> Result<Vec<f64>> {
        let equality = self.equality_data();
        check_len("solution", equality.n_cols(), solution.len())?;
        let misfit = equality.misfit(solution);
        let misfit_ineq = self.inequality_data().map(|d| d.misfit(solution));
        calculate_energy(
            solution,
            &misfit,
            misfit_ineq.as_deref(),
            self.constraint_ranges(),
            self.smoothness_weight(),
        )
    }

    /// Full energy of `solution` from precomputed misfits.
    fn calculate_energy_with(
        &self,
        solution: &[f64],
        misfit: &[f64],
        misfit_ineq: Option<&[f64]>,
        ranges: &[ConstraintRange],
    ) -> Result<Vec<f64>> {
        calculate_energy(solution, misfit, misfit_ineq, ranges, self.smoothness_weight())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SparseLinearSystem;

    #[test]
    fn test_evaluate_matches_parts() {
        let sys = SparseLinearSystem::from_triplets(2, 2, &[(0, 0, 1.0), (1, 1, 2.0)], vec![1.0, 1.0])
            .unwrap();
        let data = ColumnOrganizedData::from_system(&sys).unwrap();
        let res = BestResults::evaluate(&data, None, vec![0.0, 1.0], &[], 0.0).unwrap();
        assert_eq!(res.misfit, vec![-1.0, 1.0]);
        assert_eq!(res.energy[0], 2.0);
        assert_eq!(res.num_non_zero, 1);
        assert!(res.check_shape(2, 2, None).is_ok());
        assert!(res.check_shape(2, 2, Some(3)).is_err());
    }
}
