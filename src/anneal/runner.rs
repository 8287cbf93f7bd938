//! Serial annealing loop.

use super::config::{AnnealConfig, NonnegativityConstraint};
use super::energy::{
    calculate_energy, calculate_energy_into, update_misfits_delta, E_EQUALITY, E_FIXED_LEN,
    E_INEQUALITY, E_TOTAL,
};
use super::ring::{ColumnSystems, MisfitBuffers, MisfitRing};
use super::sampler::{ColumnSampler, UniformSampler};
use super::state::{InversionSnapshot, InversionState};
use super::types::{BestResults, SimulatedAnnealing};
use crate::completion::CompletionCriteria;
use crate::data::{check_ranges, ColumnOrganizedData, ConstraintRange, SparseLinearSystem};
use crate::error::{check_len, InversionError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Instant;

/// With the energy shortcut active, the current energy is recomputed in full
/// every this many iterations to stop floating-point drift.
const DRIFT_CORRECTION_INTERVAL: u64 = 100_000;

/// Single-threaded annealer over one column-organized system.
///
/// Each iteration perturbs one variable, updates only the misfit rows its
/// column touches, and applies the Metropolis rule. The best state seen is
/// kept separately from the current one.
///
/// # Examples
///
/// ```
/// use u_inversion::anneal::{AnnealConfig, AnnealingCore, PerturbationFunction, SimulatedAnnealing};
/// use u_inversion::data::SparseLinearSystem;
///
/// let system = SparseLinearSystem::from_triplets(1, 1, &[(0, 0, 1.0)], vec![10.0]).unwrap();
/// let config = AnnealConfig::default()
///     .with_perturbation(PerturbationFunction::FixedDebug)
///     .with_seed(7);
/// let mut core = AnnealingCore::from_system(&system, vec![0.0], config).unwrap();
/// let state = core.iterate_for(200).unwrap();
/// assert!(state.energy[0] < 100.0);
/// ```
#[derive(Debug)]
pub struct AnnealingCore {
    config: AnnealConfig,
    equality: Arc<ColumnOrganizedData>,
    inequality: Option<Arc<ColumnOrganizedData>>,
    smoothness_weight: f64,
    initial_solution: Vec<f64>,
    sampler: Arc<dyn ColumnSampler>,
    perturbation_basis: Option<Vec<f64>>,
    ranges: Vec<ConstraintRange>,
    rng: StdRng,
    best: BestResults,
}

impl AnnealingCore {
    /// Creates a core starting from `initial_solution`.
    ///
    /// # Errors
    /// Invalid configuration, an empty equality system, mismatched
    /// dimensions, a negative or non-finite initial value or smoothness
    /// weight, or a non-finite initial energy.
    pub fn new(
        equality: Arc<ColumnOrganizedData>,
        inequality: Option<Arc<ColumnOrganizedData>>,
        initial_solution: Vec<f64>,
        smoothness_weight: f64,
        config: AnnealConfig,
    ) -> Result<Self> {
        config.validate()?;
        if equality.n_rows() == 0 || equality.n_cols() == 0 {
            return Err(InversionError::InvalidConfig(
                "equality system must have at least one row and one column".into(),
            ));
        }
        let n_cols = equality.n_cols();
        check_len("initial solution", n_cols, initial_solution.len())?;
        if let Some(ineq) = &inequality {
            check_len("inequality system columns", n_cols, ineq.n_cols())?;
        }
        if !(smoothness_weight.is_finite() && smoothness_weight >= 0.0) {
            return Err(InversionError::InvalidConfig(format!(
                "smoothness weight must be finite and nonnegative, got {smoothness_weight}"
            )));
        }
        if let Some((index, &value)) = initial_solution
            .iter()
            .enumerate()
            .find(|(_, v)| !(v.is_finite() && **v >= 0.0))
        {
            return Err(InversionError::InvalidInitialValue { index, value });
        }

        let best = BestResults::evaluate(
            &equality,
            inequality.as_deref(),
            initial_solution.clone(),
            &[],
            smoothness_weight,
        )?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(rand::random()),
        };

        Ok(Self {
            config,
            sampler: Arc::new(UniformSampler::new(n_cols)),
            equality,
            inequality,
            smoothness_weight,
            initial_solution,
            perturbation_basis: None,
            ranges: Vec::new(),
            rng,
            best,
        })
    }

    /// Compresses `system` and creates a core with no inequality system or
    /// smoothness term.
    pub fn from_system(
        system: &SparseLinearSystem,
        initial_solution: Vec<f64>,
        config: AnnealConfig,
    ) -> Result<Self> {
        let data = ColumnOrganizedData::from_system(system)?;
        Self::new(Arc::new(data), None, initial_solution, 0.0, config)
    }

    pub fn config(&self) -> &AnnealConfig {
        &self.config
    }

    /// Replaces the configuration. The random generator is left untouched.
    pub fn set_config(&mut self, config: AnnealConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Replaces the column sampler.
    pub fn set_sampler(&mut self, sampler: Arc<dyn ColumnSampler>) -> Result<()> {
        check_len("sampler columns", self.equality.n_cols(), sampler.num_columns())?;
        self.sampler = sampler;
        Ok(())
    }

    /// Sets the per-variable basis read by
    /// [`PerturbationFunction::VariableNoTempDependence`](super::PerturbationFunction::VariableNoTempDependence).
    pub fn set_perturbation_basis(&mut self, basis: Option<Vec<f64>>) -> Result<()> {
        if let Some(b) = &basis {
            check_len("perturbation basis", self.equality.n_cols(), b.len())?;
        }
        self.perturbation_basis = basis;
        Ok(())
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn set_rng(&mut self, rng: StdRng) {
        self.rng = rng;
    }
}

impl SimulatedAnnealing for AnnealingCore {
    fn iterate_from(
        &mut self,
        start: Option<&InversionState<'_>>,
        criteria: &dyn CompletionCriteria,
    ) -> Result<InversionSnapshot> {
        let started = Instant::now();
        let Self {
            config,
            equality,
            inequality,
            smoothness_weight,
            sampler,
            perturbation_basis,
            ranges,
            rng,
            best,
            ..
        } = self;
        let smoothness = *smoothness_weight;
        let ranges: &[ConstraintRange] = ranges;
        if config.perturbation.needs_basis() && perturbation_basis.is_none() {
            return Err(InversionError::MissingInput("perturbation basis"));
        }

        let (start_iter, start_perturbs, start_worse) = start.map_or((0, 0, 0), |s| {
            (s.iterations, s.perturbs_kept, s.worse_values_kept)
        });

        let track_ranges = !ranges.is_empty();
        if best.energy.len() != E_FIXED_LEN + ranges.len() {
            // ranges changed since the best energy was computed
            best.energy = calculate_energy(
                &best.solution,
                &best.misfit,
                best.misfit_ineq.as_deref(),
                ranges,
                smoothness,
            )?;
        }
        let shortcut = config.energy_shortcut && smoothness == 0.0 && !track_ranges;
        let prevent_zero = config.nonnegativity == NonnegativityConstraint::PreventZeroRates;

        let eq_data = Arc::clone(equality);
        let ineq_data = inequality.clone();
        let columns = ColumnSystems {
            eq: &eq_data,
            ineq: ineq_data.as_deref(),
        };

        let mut x = best.solution.clone();
        let mut cur_nnz = best.num_non_zero;
        let mut energy = best.energy.clone();
        let mut candidate = Vec::with_capacity(energy.len());
        let mut ring = MisfitRing::new(
            config.buffer_ring_size,
            &MisfitBuffers::new(&best.misfit, best.misfit_ineq.as_deref()),
        );
        let mut pending = PendingBestUpdates::new(x.len());

        // 1-based
        let mut iter = start_iter + 1;
        let mut perturbs = start_perturbs;
        let mut worse_kept = start_worse;
        // uphill moves kept since the last new best
        let mut worse_pending = 0u64;

        tracing::debug!(
            cooling = ?config.cooling,
            perturbation = ?config.perturbation,
            nonnegativity = ?config.nonnegativity,
            shortcut,
            criteria = %criteria,
            "starting annealing"
        );

        loop {
            let best_misfit = ring.best();
            let state = InversionState {
                elapsed: started.elapsed(),
                iterations: iter - 1,
                energy: &best.energy,
                perturbs_kept: perturbs,
                worse_values_kept: worse_kept,
                num_non_zero: best.num_non_zero,
                best_solution: &best.solution,
                best_misfit: &best_misfit.eq,
                best_misfit_ineq: best_misfit.ineq(),
                constraint_ranges: ranges,
            };
            if criteria.is_satisfied(&state) {
                break;
            }

            let t = config.temperature(iter);
            let index = sampler.sample(&mut *rng);
            let basis = perturbation_basis.as_ref().map(|b| b[index]);
            let old = x[index];
            let was_zero = old == 0.0;
            let perturb = config.nonnegativity.constrained_perturbation(
                rng,
                &config.perturbation,
                t,
                old,
                basis,
            );

            if shortcut && iter % DRIFT_CORRECTION_INTERVAL == 0 {
                let cur = ring.current();
                calculate_energy_into(&mut energy, &x, &cur.eq, cur.ineq(), ranges, smoothness)?;
            }

            x[index] = old + perturb;

            let proposal = ring.proposal_mut();
            let delta_eq = update_misfits_delta(&eq_data, &mut proposal.eq, index, perturb, false);
            let delta_ineq = match (ineq_data.as_deref(), proposal.ineq.as_mut()) {
                (Some(data), Some(m)) => update_misfits_delta(data, m, index, perturb, true),
                _ => 0.0,
            };
            let delta = delta_eq + delta_ineq;

            let energy_change = if shortcut && delta.is_finite() {
                candidate.clear();
                candidate.extend_from_slice(&energy);
                candidate[E_TOTAL] += delta;
                candidate[E_EQUALITY] += delta_eq;
                if ineq_data.is_some() {
                    candidate[E_INEQUALITY] += delta_ineq;
                }
                delta
            } else {
                calculate_energy_into(
                    &mut candidate,
                    &x,
                    &proposal.eq,
                    proposal.ineq(),
                    ranges,
                    smoothness,
                )?;
                candidate[E_TOTAL] - energy[E_TOTAL]
            };

            #[cfg(any(test, feature = "consistency-checks"))]
            if iter % 1000 == 0 {
                consistency::check_proposal(
                    &columns,
                    &x,
                    ring.proposal_mut(),
                    &candidate,
                    ranges,
                    smoothness,
                    iter,
                );
            }

            let p = if energy_change < 0.0 || (prevent_zero && was_zero) {
                1.0
            } else if t != 0.0 {
                ((-energy_change * config.energy_scale) / t).exp()
            } else {
                0.0
            };

            let new_nnz = match (was_zero, x[index] != 0.0) {
                (true, true) => cur_nnz + 1,
                (false, false) => cur_nnz - 1,
                _ => cur_nnz,
            };

            if p == 1.0 || p > rng.random::<f64>() {
                if energy_change > 0.0 {
                    worse_pending += 1;
                }
                std::mem::swap(&mut energy, &mut candidate);
                perturbs += 1;
                cur_nnz = new_nnz;

                let new_best = energy[E_TOTAL] < best.energy[E_TOTAL] || config.keep_current_as_best;
                ring.accept(&columns, index, new_best);
                if new_best {
                    pending.commit(&x, &mut best.solution, index);
                    best.energy.clone_from(&energy);
                    best.num_non_zero = cur_nnz;
                    worse_kept += worse_pending;
                    worse_pending = 0;

                    #[cfg(any(test, feature = "consistency-checks"))]
                    assert_eq!(best.solution, x, "best solution out of sync at iteration {iter}");
                } else {
                    pending.mark(index);
                }
            } else {
                x[index] = old;
                ring.reject(&columns, index);
            }

            iter += 1;
        }

        let elapsed = started.elapsed();
        let best_misfit = ring.best();
        best.misfit.copy_from_slice(&best_misfit.eq);
        if let (Some(dst), Some(src)) = (best.misfit_ineq.as_mut(), best_misfit.ineq()) {
            dst.copy_from_slice(src);
        }
        if shortcut {
            // the shortcut accumulates deltas; settle on an exact value
            best.energy = calculate_energy(
                &best.solution,
                &best.misfit,
                best.misfit_ineq.as_deref(),
                ranges,
                smoothness,
            )?;
        }

        tracing::debug!(
            iterations = iter - 1,
            perturbs,
            forced_copies = ring.forced_copies(),
            energy = ?best.energy,
            "annealing finished"
        );

        Ok(InversionSnapshot {
            elapsed,
            iterations: iter - 1,
            energy: best.energy.clone(),
            perturbs_kept: perturbs,
            worse_values_kept: worse_kept,
            num_non_zero: best.num_non_zero,
            best_solution: best.solution.clone(),
            best_misfit: best.misfit.clone(),
            best_misfit_ineq: best.misfit_ineq.clone(),
            constraint_ranges: ranges.to_vec(),
        })
    }

    fn best_solution(&self) -> &[f64] {
        &self.best.solution
    }

    fn best_energy(&self) -> &[f64] {
        &self.best.energy
    }

    fn best_misfit(&self) -> &[f64] {
        &self.best.misfit
    }

    fn best_inequality_misfit(&self) -> Option<&[f64]> {
        self.best.misfit_ineq.as_deref()
    }

    fn num_non_zero(&self) -> usize {
        self.best.num_non_zero
    }

    fn initial_solution(&self) -> &[f64] {
        &self.initial_solution
    }

    fn equality_data(&self) -> &Arc<ColumnOrganizedData> {
        &self.equality
    }

    fn inequality_data(&self) -> Option<&Arc<ColumnOrganizedData>> {
        self.inequality.as_ref()
    }

    fn smoothness_weight(&self) -> f64 {
        self.smoothness_weight
    }

    fn constraint_ranges(&self) -> &[ConstraintRange] {
        &self.ranges
    }

    fn set_constraint_ranges(&mut self, ranges: Vec<ConstraintRange>) -> Result<()> {
        check_ranges(
            &ranges,
            self.equality.n_rows(),
            self.inequality.as_ref().map(|d| d.n_rows()),
        )?;
        self.ranges = ranges;
        Ok(())
    }

    fn set_results(&mut self, results: &BestResults) -> Result<()> {
        results.check_shape(
            self.equality.n_rows(),
            self.equality.n_cols(),
            self.inequality.as_ref().map(|d| d.n_rows()),
        )?;
        self.best.energy.clone_from(&results.energy);
        self.best.solution.clone_from(&results.solution);
        self.best.misfit.clone_from(&results.misfit);
        if self.inequality.is_some() {
            self.best.misfit_ineq.clone_from(&results.misfit_ineq);
        }
        self.best.num_non_zero = results.num_non_zero;
        Ok(())
    }

    fn set_all(
        &mut self,
        equality: Arc<ColumnOrganizedData>,
        inequality: Option<Arc<ColumnOrganizedData>>,
        results: &BestResults,
    ) -> Result<()> {
        check_len("equality system columns", self.equality.n_cols(), equality.n_cols())?;
        if let Some(ineq) = &inequality {
            check_len("inequality system columns", self.equality.n_cols(), ineq.n_cols())?;
        }
        let previous = (
            std::mem::replace(&mut self.equality, equality),
            std::mem::replace(&mut self.inequality, inequality),
        );
        if let Err(err) = self.set_results(results) {
            self.equality = previous.0;
            self.inequality = previous.1;
            return Err(err);
        }
        Ok(())
    }
}

/// Solution indices changed by accepted moves since the last new best.
///
/// Adopting a new best copies exactly these entries. Past `limit` entries
/// the list is dropped in favour of a full copy.
#[derive(Debug)]
struct PendingBestUpdates {
    indices: Vec<usize>,
    overflow: bool,
    limit: usize,
}

impl PendingBestUpdates {
    fn new(limit: usize) -> Self {
        Self {
            indices: Vec::new(),
            overflow: false,
            limit,
        }
    }

    fn mark(&mut self, index: usize) {
        if self.overflow {
            return;
        }
        if self.indices.len() >= self.limit {
            self.overflow = true;
            self.indices.clear();
        } else {
            self.indices.push(index);
        }
    }

    fn commit(&mut self, x: &[f64], best: &mut [f64], index: usize) {
        if self.overflow {
            best.copy_from_slice(x);
        } else {
            for &i in &self.indices {
                best[i] = x[i];
            }
            best[index] = x[index];
        }
        self.indices.clear();
        self.overflow = false;
    }
}

/// Slow-path cross checks of the incremental misfit and energy updates.
#[cfg(any(test, feature = "consistency-checks"))]
mod consistency {
    use super::*;

    fn close(a: f64, b: f64, rel: f64) -> bool {
        let diff = (a - b).abs();
        diff <= 1e-10 || diff <= rel * a.abs().max(b.abs())
    }

    pub(super) fn check_proposal(
        columns: &ColumnSystems<'_>,
        x: &[f64],
        proposal: &MisfitBuffers,
        candidate: &[f64],
        ranges: &[ConstraintRange],
        smoothness: f64,
        iter: u64,
    ) {
        let misfit = columns.eq.misfit(x);
        for (row, (&fast, &slow)) in proposal.eq.iter().zip(&misfit).enumerate() {
            assert!(
                close(fast, slow, 1e-6) || (fast - slow).abs() <= 1e-8 * slow.abs().max(1.0),
                "iteration {iter}: misfit row {row} is {fast}, full product gives {slow}"
            );
        }
        let misfit_ineq = columns.ineq.map(|d| d.misfit(x));
        if let Ok(full) = calculate_energy(x, &misfit, misfit_ineq.as_deref(), ranges, smoothness) {
            assert!(
                close(candidate[E_TOTAL], full[E_TOTAL], 1e-4),
                "iteration {iter}: energy {} differs from recomputed {}",
                candidate[E_TOTAL],
                full[E_TOTAL]
            );
        }
    }
}
