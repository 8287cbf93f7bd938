//! Adaptive constraint reweighting between coordinator rounds.

use super::config::ReweightConfig;
use super::stats::{median, weighted_median, MisfitStats};
use crate::anneal::{BestResults, InversionSnapshot, InversionState, SimulatedAnnealing};
use crate::completion::CompletionCriteria;
use crate::data::{ColumnOrganizedData, ConstraintRange, ConstraintWeightingType};
use crate::error::{InversionError, Result};
use crate::parallel::{ParallelCoordinator, RoundHook};
use std::sync::Arc;
use std::time::Duration;

/// Target value and per-constraint statistics recorded at one reweighting
/// pass.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReweightProgress {
    pub iterations: u64,
    pub elapsed: Duration,
    pub target: f64,
    pub stats: Vec<MisfitStats>,
}

/// Systems and ranges as they were before the first reweighting pass.
#[derive(Debug)]
struct OriginalSystems {
    equality: Arc<ColumnOrganizedData>,
    inequality: Option<Arc<ColumnOrganizedData>>,
    ranges: Vec<ConstraintRange>,
}

/// New weight of one constraint and how it was reached.
#[derive(Debug, Clone, Copy)]
struct WeightUpdate {
    range: usize,
    prev: f64,
    orig: f64,
    new: f64,
    bounded: bool,
    phased: bool,
}

#[derive(Debug)]
struct ReweightEngine {
    config: ReweightConfig,
    orig: Option<OriginalSystems>,
    progress: Vec<ReweightProgress>,
}

impl RoundHook for ReweightEngine {
    fn before_round(
        &mut self,
        coordinator: &mut ParallelCoordinator,
        state: &InversionSnapshot,
        round: usize,
    ) -> Result<()> {
        // the first round anneals under the weights as given
        if round == 0 {
            return Ok(());
        }
        let Self {
            config,
            orig,
            progress,
        } = self;
        let config = &*config;
        let orig = orig
            .as_ref()
            .ok_or(InversionError::MissingInput("original systems for reweighting"))?;

        let ranges = coordinator.constraint_ranges().to_vec();
        if ranges.len() != orig.ranges.len() {
            return Err(InversionError::Reweight(format!(
                "constraint ranges changed mid-run: {} originally, {} now",
                orig.ranges.len(),
                ranges.len()
            )));
        }
        let stats = uncertainty_stats(&ranges, &state.best_misfit, state.best_misfit_ineq.as_deref());
        let values: Vec<f64> = stats.iter().map(|(_, s)| s.get(config.quantity)).collect();
        let rows: Vec<usize> = stats.iter().map(|(_, s)| s.num_rows).collect();
        let mut statuses: Vec<f64> = stats
            .iter()
            .map(|&(i, _)| phase_out_status(ranges[i].weight(), orig.ranges[i].weight(), config))
            .collect();
        let target = compute_target(&values, &rows, &mut statuses, config)?;

        let scale_to_orig =
            config.drift_correction_rounds > 0 && round % config.drift_correction_rounds == 0;
        tracing::info!(
            round,
            iterations = state.iterations,
            quantity = %config.quantity,
            target,
            scale_to_orig,
            "reweighting constraints"
        );

        let mut updates: Vec<WeightUpdate> = stats
            .iter()
            .zip(&values)
            .map(|(&(i, _), &value)| {
                update_weight(i, value, target, ranges[i].weight(), orig.ranges[i].weight(), config)
            })
            .collect();
        if config.conserve_total_weight {
            conserve_total_weight(&mut updates, &ranges);
        }

        let n_eq = coordinator.equality_data().n_rows();
        let mut eq_scalars = vec![1.0; n_eq];
        let mut ineq_scalars = coordinator.inequality_data().map(|d| vec![1.0; d.n_rows()]);
        let mut new_ranges = ranges.clone();
        for u in &updates {
            let range = &ranges[u.range];
            let base = if scale_to_orig { u.orig } else { u.prev };
            let scalar = u.new / base;
            tracing::debug!(
                constraint = range.short_name(),
                prev = u.prev,
                new = u.new,
                bounded = u.bounded,
                phased = u.phased,
                "weight update"
            );
            let target_rows = if range.is_inequality() {
                ineq_scalars
                    .as_deref_mut()
                    .ok_or(InversionError::MissingInput("inequality system for inequality range"))?
            } else {
                eq_scalars.as_mut_slice()
            };
            for s in &mut target_rows[range.rows()] {
                *s *= scalar;
            }
            new_ranges[u.range] = range.with_weight(u.new);
        }

        let (eq_base, ineq_base) = if scale_to_orig {
            (Arc::clone(&orig.equality), orig.inequality.clone())
        } else {
            (
                Arc::clone(coordinator.equality_data()),
                coordinator.inequality_data().cloned(),
            )
        };
        let equality = Arc::new(eq_base.scale_rows(&eq_scalars)?);
        let inequality = match (ineq_base, ineq_scalars) {
            (Some(data), Some(scalars)) => Some(Arc::new(data.scale_rows(&scalars)?)),
            _ => None,
        };

        let results = BestResults::evaluate(
            &equality,
            inequality.as_deref(),
            state.best_solution.clone(),
            &new_ranges,
            coordinator.smoothness_weight(),
        )?;
        coordinator.set_all(equality, inequality, &results)?;
        coordinator.set_constraint_ranges(new_ranges)?;

        progress.push(ReweightProgress {
            iterations: state.iterations,
            elapsed: state.elapsed,
            target,
            stats: stats.into_iter().map(|(_, s)| s).collect(),
        });
        Ok(())
    }
}

/// Statistics of every uncertainty-weighted range, computed on misfits
/// divided by the range's current weight. Paired with the range index.
fn uncertainty_stats(
    ranges: &[ConstraintRange],
    misfit: &[f64],
    misfit_ineq: Option<&[f64]>,
) -> Vec<(usize, MisfitStats)> {
    ranges
        .iter()
        .enumerate()
        .filter(|(_, r)| r.weighting_type() == ConstraintWeightingType::NormalizedByUncertainty)
        .filter_map(|(i, r)| {
            let source = if r.is_inequality() { misfit_ineq? } else { misfit };
            let weight = r.weight();
            let normalized: Vec<f64> = source.get(r.rows())?.iter().map(|m| m / weight).collect();
            Some((i, MisfitStats::new(r.name(), &normalized, r.is_inequality())))
        })
        .collect()
}

/// 1 for a constraint taking full part in the target, 0 for one phased
/// out, linear in between.
fn phase_out_status(weight: f64, orig: f64, config: &ReweightConfig) -> f64 {
    if !config.phase_out {
        return 1.0;
    }
    let end = orig / config.phase_out_end_factor;
    let start = orig / config.phase_out_start_factor;
    if weight < end {
        0.0
    } else if weight < start {
        (weight - end) / (start - end)
    } else {
        1.0
    }
}

/// Value every constraint is pulled towards.
///
/// With phase-out, constraints below full status count proportionally less;
/// any of them whose value exceeds the target is restored to full status and
/// the target recomputed.
fn compute_target(
    values: &[f64],
    rows: &[usize],
    statuses: &mut [f64],
    config: &ReweightConfig,
) -> Result<f64> {
    if values.is_empty() {
        return Err(InversionError::Reweight(
            "no uncertainty-weighted constraint ranges".into(),
        ));
    }
    let row_weight = |i: usize| {
        if config.value_weighted_average {
            rows[i] as f64
        } else {
            1.0
        }
    };
    let plain = || {
        if config.target_median {
            median(values)
        } else {
            let weights: Vec<f64> = (0..values.len()).map(row_weight).collect();
            weighted_mean(values, &weights).unwrap_or(f64::NAN)
        }
    };

    let target = if config.phase_out {
        loop {
            let target = if config.target_median {
                weighted_median(values, statuses)
            } else {
                let weights: Vec<f64> = statuses
                    .iter()
                    .enumerate()
                    .map(|(i, s)| s * row_weight(i))
                    .collect();
                weighted_mean(values, &weights)
            }
            .unwrap_or_else(&plain);

            let mut changed = false;
            for (status, &value) in statuses.iter_mut().zip(values) {
                if *status < 1.0 && value > target {
                    *status = 1.0;
                    changed = true;
                }
            }
            if !changed {
                break target;
            }
        }
    } else {
        plain()
    };

    if !(target.is_finite() && target > 0.0) {
        return Err(InversionError::Reweight(format!(
            "target {} must be positive and finite",
            target
        )));
    }
    Ok(target)
}

fn weighted_mean(values: &[f64], weights: &[f64]) -> Option<f64> {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return None;
    }
    let sum: f64 = values.iter().zip(weights).map(|(v, w)| v * w).sum();
    Some(sum / total)
}

fn update_weight(
    range: usize,
    value: f64,
    target: f64,
    prev: f64,
    orig: f64,
    config: &ReweightConfig,
) -> WeightUpdate {
    let ratio = if config.sqrt_ratios {
        value.sqrt() / target.sqrt()
    } else {
        value / target
    };
    let max = config.max_individual_factor;
    let calc = ratio.clamp(1.0 / max, max) * prev;

    let min_total = orig / config.max_total_factor;
    let max_total = orig * config.max_total_factor;
    let mut bounded = false;
    let mut phased = false;
    let mut new = if config.phase_out && calc < orig {
        // single precision so that weights sitting on a boundary stay put
        let end = orig / config.phase_out_end_factor;
        let start = orig / config.phase_out_start_factor;
        if (calc as f32) <= (end as f32) {
            phased = true;
            end
        } else if (calc as f32) < (start as f32) {
            phased = true;
            calc
        } else if calc < min_total {
            bounded = true;
            min_total
        } else {
            calc
        }
    } else {
        let clamped = calc.clamp(min_total, max_total);
        bounded = clamped != calc;
        clamped
    };

    if target > config.transition_upper {
        new = orig;
        bounded = true;
        phased = false;
    } else if target > config.transition_lower {
        let fract = (target - config.transition_lower)
            / (config.transition_upper - config.transition_lower);
        new = orig * fract + new * (1.0 - fract);
    }

    WeightUpdate {
        range,
        prev,
        orig,
        new,
        bounded,
        phased,
    }
}

/// Rescales the freely adjusted weights so that `Σ rows · weight` over all
/// updated constraints matches its original value.
fn conserve_total_weight(updates: &mut [WeightUpdate], ranges: &[ConstraintRange]) {
    let mut orig_total = 0.0;
    let mut new_total = 0.0;
    let mut conservable_total = 0.0;
    for u in updates.iter() {
        let rows = ranges[u.range].num_rows() as f64;
        orig_total += rows * u.orig;
        new_total += rows * u.new;
        if !(u.bounded || u.phased) {
            conservable_total += rows * u.new;
        }
    }
    if conservable_total == 0.0 {
        tracing::info!("every weight is bounded or phased out, total weight not conserved");
        return;
    }
    let fixed = new_total - conservable_total;
    let scale = (orig_total - fixed) / conservable_total;
    if !(scale.is_finite() && scale > 0.0) {
        tracing::warn!(scale, "cannot conserve total weight, leaving weights unscaled");
        return;
    }
    tracing::debug!(scale, "conserving total weight");
    for u in updates.iter_mut().filter(|u| !(u.bounded || u.phased)) {
        u.new *= scale;
    }
}

/// Parallel annealing that periodically reweights uncertainty-normalized
/// constraints so that each is fit about equally well.
///
/// Before every round but the first, a misfit statistic
/// ([`ReweightConfig::quantity`]) is computed per constraint on misfits
/// divided by its weight. Weights of constraints fit worse than the target
/// go up, weights of those fit better go down. The scaled systems replace
/// the coordinator's, and the best solution carries forward evaluated
/// against them.
///
/// Every [`ReweightConfig::drift_correction_rounds`] rounds the systems are
/// rebuilt from the originals rather than scaled again.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use u_inversion::anneal::{AnnealConfig, SimulatedAnnealing};
/// use u_inversion::completion::IterationCompletionCriteria;
/// use u_inversion::data::{ColumnOrganizedData, ConstraintRange, ConstraintWeightingType, SparseLinearSystem};
/// use u_inversion::parallel::{ParallelConfig, ParallelCoordinator};
/// use u_inversion::reweight::{AdaptiveReweighter, ReweightConfig};
///
/// let triplets = [(0, 0, 1.0), (1, 1, 1.0), (2, 0, 1.0), (3, 1, 1.0)];
/// let system = SparseLinearSystem::from_triplets(4, 2, &triplets, vec![1.0, 2.0, 3.0, 1.0]).unwrap();
/// let data = Arc::new(ColumnOrganizedData::from_system(&system).unwrap());
/// let mut coordinator = ParallelCoordinator::from_data(
///     data, None, vec![0.0; 2], 0.0, 2,
///     AnnealConfig::default(),
///     Arc::new(IterationCompletionCriteria::new(500)),
///     ParallelConfig::default().with_seed(7),
/// ).unwrap();
/// let uncertainty = ConstraintWeightingType::NormalizedByUncertainty;
/// coordinator.set_constraint_ranges(vec![
///     ConstraintRange::new("first", "A", 0, 2, false).unwrap().with_weighting_type(uncertainty),
///     ConstraintRange::new("second", "B", 2, 4, false).unwrap().with_weighting_type(uncertainty),
/// ]).unwrap();
///
/// let mut reweighter = AdaptiveReweighter::new(coordinator, ReweightConfig::default()).unwrap();
/// reweighter.iterate_for(1500).unwrap();
/// assert!(!reweighter.progress().is_empty());
/// ```
#[derive(Debug)]
pub struct AdaptiveReweighter {
    coordinator: ParallelCoordinator,
    engine: ReweightEngine,
}

impl AdaptiveReweighter {
    /// # Errors
    /// Invalid configuration.
    pub fn new(coordinator: ParallelCoordinator, config: ReweightConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            coordinator,
            engine: ReweightEngine {
                config,
                orig: None,
                progress: Vec::new(),
            },
        })
    }

    pub fn config(&self) -> &ReweightConfig {
        &self.engine.config
    }

    /// Replaces the configuration.
    pub fn set_config(&mut self, config: ReweightConfig) -> Result<()> {
        config.validate()?;
        self.engine.config = config;
        Ok(())
    }

    pub fn coordinator(&self) -> &ParallelCoordinator {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut ParallelCoordinator {
        &mut self.coordinator
    }

    /// Records of the last `iterate` call, one per reweighting pass plus a
    /// final one for the returned state.
    pub fn progress(&self) -> &[ReweightProgress] {
        &self.engine.progress
    }

    /// Ranges as they were before the first reweighting pass.
    pub fn original_ranges(&self) -> Option<&[ConstraintRange]> {
        self.engine.orig.as_ref().map(|o| o.ranges.as_slice())
    }

    pub fn into_inner(self) -> ParallelCoordinator {
        self.coordinator
    }

    fn capture_originals(&mut self) {
        if self.engine.orig.is_some() {
            return;
        }
        self.engine.orig = Some(OriginalSystems {
            equality: Arc::clone(self.coordinator.equality_data()),
            inequality: self.coordinator.inequality_data().cloned(),
            ranges: self.coordinator.constraint_ranges().to_vec(),
        });
    }

    /// Records the final target and logs each constraint's overall change.
    fn finish(&mut self, state: &InversionSnapshot) {
        let config = &self.engine.config;
        let ranges = self.coordinator.constraint_ranges();
        let stats = uncertainty_stats(ranges, &state.best_misfit, state.best_misfit_ineq.as_deref());
        let values: Vec<f64> = stats.iter().map(|(_, s)| s.get(config.quantity)).collect();
        let rows: Vec<usize> = stats.iter().map(|(_, s)| s.num_rows).collect();
        let orig_ranges = self.engine.orig.as_ref().map(|o| o.ranges.as_slice());
        let mut statuses: Vec<f64> = stats
            .iter()
            .map(|&(i, _)| {
                let orig = orig_ranges.map_or(ranges[i].weight(), |o| o[i].weight());
                phase_out_status(ranges[i].weight(), orig, config)
            })
            .collect();
        match compute_target(&values, &rows, &mut statuses, config) {
            Ok(target) => {
                tracing::info!(quantity = %config.quantity, target, "final reweighting target");
                self.engine.progress.push(ReweightProgress {
                    iterations: state.iterations,
                    elapsed: state.elapsed,
                    target,
                    stats: stats.iter().map(|(_, s)| s.clone()).collect(),
                });
            }
            Err(err) => tracing::warn!(error = %err, "no final reweighting target"),
        }

        if let Some(orig_ranges) = orig_ranges {
            for ((i, s), status) in stats.iter().zip(&statuses) {
                let orig = orig_ranges[*i].weight();
                let new = ranges[*i].weight();
                tracing::info!(
                    status,
                    "{}: {} = {:.4} × {:.4} = {:.4}",
                    s.name,
                    config.quantity,
                    orig,
                    new / orig,
                    new
                );
            }
        }
    }
}

impl SimulatedAnnealing for AdaptiveReweighter {
    /// # Errors
    /// No uncertainty-weighted constraint range, a reweighting failure, or
    /// any coordinator error.
    fn iterate_from(
        &mut self,
        start: Option<&InversionState<'_>>,
        criteria: &dyn CompletionCriteria,
    ) -> Result<InversionSnapshot> {
        let weighted = self
            .coordinator
            .constraint_ranges()
            .iter()
            .any(|r| r.weighting_type() == ConstraintWeightingType::NormalizedByUncertainty);
        if !weighted {
            return Err(InversionError::Reweight(
                "no uncertainty-weighted constraint ranges".into(),
            ));
        }
        self.capture_originals();
        self.engine.progress.clear();
        let state = self
            .coordinator
            .iterate_with_hook(start, criteria, &mut self.engine)?;
        self.finish(&state);
        Ok(state)
    }

    fn best_solution(&self) -> &[f64] {
        self.coordinator.best_solution()
    }

    fn best_energy(&self) -> &[f64] {
        self.coordinator.best_energy()
    }

    fn best_misfit(&self) -> &[f64] {
        self.coordinator.best_misfit()
    }

    fn best_inequality_misfit(&self) -> Option<&[f64]> {
        self.coordinator.best_inequality_misfit()
    }

    fn num_non_zero(&self) -> usize {
        self.coordinator.num_non_zero()
    }

    fn initial_solution(&self) -> &[f64] {
        self.coordinator.initial_solution()
    }

    fn equality_data(&self) -> &Arc<ColumnOrganizedData> {
        self.coordinator.equality_data()
    }

    fn inequality_data(&self) -> Option<&Arc<ColumnOrganizedData>> {
        self.coordinator.inequality_data()
    }

    fn smoothness_weight(&self) -> f64 {
        self.coordinator.smoothness_weight()
    }

    fn constraint_ranges(&self) -> &[ConstraintRange] {
        self.coordinator.constraint_ranges()
    }

    /// New ranges become the originals of the next run.
    fn set_constraint_ranges(&mut self, ranges: Vec<ConstraintRange>) -> Result<()> {
        self.coordinator.set_constraint_ranges(ranges)?;
        self.engine.orig = None;
        Ok(())
    }

    fn set_results(&mut self, results: &BestResults) -> Result<()> {
        self.coordinator.set_results(results)
    }

    /// New systems become the originals of the next run.
    fn set_all(
        &mut self,
        equality: Arc<ColumnOrganizedData>,
        inequality: Option<Arc<ColumnOrganizedData>>,
        results: &BestResults,
    ) -> Result<()> {
        self.coordinator.set_all(equality, inequality, results)?;
        self.engine.orig = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anneal::{AnnealConfig, PerturbationFunction};
    use crate::completion::IterationCompletionCriteria;
    use crate::data::SparseLinearSystem;
    use crate::parallel::ParallelConfig;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn uncertainty(r: ConstraintRange) -> ConstraintRange {
        r.with_weighting_type(ConstraintWeightingType::NormalizedByUncertainty)
    }

    fn three_constraints() -> Vec<ConstraintRange> {
        vec![
            ConstraintRange::new("Plain", "A", 0, 4, false).unwrap(),
            uncertainty(ConstraintRange::new("Slip", "B", 4, 8, false).unwrap()),
            uncertainty(ConstraintRange::new("Rate", "C", 8, 12, false).unwrap()).with_weight(2.0),
        ]
    }

    fn coordinator(seed: u64, ranges: Vec<ConstraintRange>) -> ParallelCoordinator {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut triplets = Vec::new();
        for r in 0..12 {
            for c in 0..6 {
                if rng.random::<f64>() < 0.5 {
                    triplets.push((r, c, rng.random::<f64>()));
                }
            }
        }
        let d = (0..12).map(|_| 1.0 + rng.random::<f64>() * 4.0).collect();
        let system = SparseLinearSystem::from_triplets(12, 6, &triplets, d).unwrap();
        let data = Arc::new(ColumnOrganizedData::from_system(&system).unwrap());
        let mut coord = ParallelCoordinator::from_data(
            data,
            None,
            vec![0.0; 6],
            0.0,
            2,
            AnnealConfig::default().with_perturbation(PerturbationFunction::Uniform { width: 0.05 }),
            Arc::new(IterationCompletionCriteria::new(1000)),
            ParallelConfig::default().with_seed(seed),
        )
        .unwrap();
        coord.set_constraint_ranges(ranges).unwrap();
        coord
    }

    fn rel_close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol * a.abs().max(b.abs()).max(1e-300)
    }

    #[test]
    fn test_one_round_keeps_unweighted_and_bounds_weighted() {
        let mut rw = AdaptiveReweighter::new(coordinator(3, three_constraints()), ReweightConfig::default())
            .unwrap();
        let state = rw.iterate_for(2000).unwrap();
        assert_eq!(state.iterations, 2000);

        let ranges = rw.constraint_ranges();
        assert_eq!(ranges[0].weight(), 1.0);
        let b = ranges[1].weight();
        let c = ranges[2].weight();
        assert!((1.0 / 50.0..=50.0).contains(&b), "B weight {b}");
        assert!((2.0 / 50.0..=100.0).contains(&c), "C weight {c}");
        assert_eq!(rw.progress().len(), 2);
        assert_eq!(rw.progress()[0].stats.len(), 2);
        assert_eq!(rw.original_ranges().unwrap()[2].weight(), 2.0);
    }

    #[test]
    fn test_total_weight_conserved() {
        let mut rw = AdaptiveReweighter::new(coordinator(5, three_constraints()), ReweightConfig::default())
            .unwrap();
        rw.iterate_for(4000).unwrap();
        let total: f64 = rw
            .constraint_ranges()
            .iter()
            .filter(|r| r.weighting_type() == ConstraintWeightingType::NormalizedByUncertainty)
            .map(|r| r.num_rows() as f64 * r.weight())
            .sum();
        assert!(rel_close(total, 4.0 * 1.0 + 4.0 * 2.0, 1e-6), "total {total}");
    }

    #[test]
    fn test_scaled_system_matches_weights() {
        for drift_rounds in [1, 100] {
            let coord = coordinator(9, three_constraints());
            let orig = Arc::clone(coord.equality_data());
            let config = ReweightConfig::default().with_drift_correction_rounds(drift_rounds);
            let mut rw = AdaptiveReweighter::new(coord, config).unwrap();
            rw.iterate_for(4000).unwrap();

            let data = rw.equality_data();
            let ranges = rw.constraint_ranges();
            let orig_weights = [1.0, 1.0, 2.0];
            for (range, orig_weight) in ranges.iter().zip(orig_weights) {
                let factor = range.weight() / orig_weight;
                for row in range.rows() {
                    assert!(rel_close(data.d()[row], orig.d()[row] * factor, 1e-12));
                    for col in 0..data.n_cols() {
                        assert!(rel_close(data.get(row, col), orig.get(row, col) * factor, 1e-12));
                    }
                }
            }
            // misfits and energy were re-evaluated against the scaled system
            let misfit = data.misfit(rw.best_solution());
            for (a, b) in misfit.iter().zip(rw.best_misfit()) {
                assert!((a - b).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_requires_uncertainty_weighted_range() {
        let ranges = vec![ConstraintRange::new("Plain", "A", 0, 12, false).unwrap()];
        let mut rw = AdaptiveReweighter::new(coordinator(1, ranges), ReweightConfig::default()).unwrap();
        assert!(matches!(rw.iterate_for(1000), Err(InversionError::Reweight(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ReweightConfig::default()
            .with_target_median(true)
            .with_value_weighted_average(true);
        assert!(AdaptiveReweighter::new(coordinator(1, three_constraints()), config).is_err());
    }

    #[test]
    fn test_target_mean_and_median() {
        let plain = ReweightConfig::default().with_phase_out(false);
        let mut statuses = vec![1.0; 3];
        let t = compute_target(&[1.0, 2.0, 3.0], &[1, 1, 1], &mut statuses, &plain).unwrap();
        assert!((t - 2.0).abs() < 1e-15);

        let median = plain.clone().with_target_median(true);
        let t = compute_target(&[1.0, 5.0, 3.0], &[1, 1, 1], &mut statuses, &median).unwrap();
        assert_eq!(t, 3.0);

        let weighted = plain.with_value_weighted_average(true);
        let t = compute_target(&[1.0, 3.0], &[1, 3], &mut statuses[..2], &weighted).unwrap();
        assert!((t - 2.5).abs() < 1e-15);
    }

    #[test]
    fn test_target_unphases_poorly_fit_constraints() {
        let config = ReweightConfig::default();
        let mut statuses = vec![1.0, 1.0, 0.0];
        let t = compute_target(&[1.0, 2.0, 10.0], &[1, 1, 1], &mut statuses, &config).unwrap();
        assert!((t - 13.0 / 3.0).abs() < 1e-12);
        assert_eq!(statuses, vec![1.0, 1.0, 1.0]);

        let mut statuses = vec![1.0, 1.0, 0.0];
        let t = compute_target(&[4.0, 2.0, 1.0], &[1, 1, 1], &mut statuses, &config).unwrap();
        assert!((t - 3.0).abs() < 1e-15);
        assert_eq!(statuses[2], 0.0);
    }

    #[test]
    fn test_target_rejects_zero() {
        let config = ReweightConfig::default();
        let mut statuses = vec![1.0, 1.0];
        assert!(compute_target(&[0.0, 0.0], &[1, 1], &mut statuses, &config).is_err());
        assert!(compute_target(&[], &[], &mut [], &config).is_err());
    }

    #[test]
    fn test_phase_out_status() {
        let config = ReweightConfig::default();
        assert_eq!(phase_out_status(0.5, 100.0, &config), 0.0);
        assert_eq!(phase_out_status(1.0, 100.0, &config), 0.0);
        assert!((phase_out_status(1.5, 100.0, &config) - 0.5).abs() < 1e-12);
        assert_eq!(phase_out_status(3.0, 100.0, &config), 1.0);
        assert_eq!(phase_out_status(0.5, 100.0, &config.with_phase_out(false)), 1.0);
    }

    #[test]
    fn test_update_weight_clamps() {
        let config = ReweightConfig::default();
        // ratio 3 clipped to 2
        let u = update_weight(0, 9.0, 1.0, 1.0, 1.0, &config);
        assert_eq!(u.new, 2.0);
        assert!(!u.bounded);
        // total bound above
        let u = update_weight(0, 9.0, 1.0, 80.0, 1.0, &config);
        assert_eq!(u.new, 100.0);
        assert!(u.bounded);
        // deep below the original weight: fully phased out
        let u = update_weight(0, 0.0, 1.0, 0.011, 1.0, &config);
        assert_eq!(u.new, 0.01);
        assert!(u.phased);
        // reverts to the original above the upper transition
        let config = config.with_transition(1.0, 2.0);
        let u = update_weight(0, 9.0, 3.0, 4.0, 1.0, &config);
        assert_eq!(u.new, 1.0);
        // halfway through the transition
        let u = update_weight(0, 1.5, 1.5, 3.0, 1.0, &config);
        assert!((u.new - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_conserve_skips_bounded() {
        let ranges = vec![
            uncertainty(ConstraintRange::new("a", "a", 0, 2, false).unwrap()),
            uncertainty(ConstraintRange::new("b", "b", 2, 4, false).unwrap()),
        ];
        let mut updates = vec![
            WeightUpdate {
                range: 0,
                prev: 1.0,
                orig: 1.0,
                new: 2.0,
                bounded: false,
                phased: false,
            },
            WeightUpdate {
                range: 1,
                prev: 1.0,
                orig: 1.0,
                new: 0.5,
                bounded: true,
                phased: false,
            },
        ];
        conserve_total_weight(&mut updates, &ranges);
        // 2·w + 2·0.5 = 4
        assert!((updates[0].new - 1.5).abs() < 1e-15);
        assert_eq!(updates[1].new, 0.5);
    }
}
