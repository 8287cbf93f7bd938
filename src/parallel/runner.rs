//! Replica-and-barrier coordinator.

use super::checkpoint::CheckpointWriter;
use super::config::ParallelConfig;
use super::types::{NoRoundHook, RoundHook};
use crate::anneal::energy::{calculate_energy, E_FIXED_LEN, E_TOTAL};
use crate::anneal::{
    count_non_zero, AnnealConfig, AnnealingCore, BestResults, InversionSnapshot, InversionState,
    SimulatedAnnealing,
};
use crate::completion::{time_str, CompletionCriteria, TimeCompletionCriteria};
use crate::data::{check_ranges, ColumnOrganizedData, ConstraintRange};
use crate::error::{check_len, InversionError, Result};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rayon::prelude::*;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static POOL_COUNT: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
struct Checkpoint {
    interval: TimeCompletionCriteria,
    writer: Box<dyn CheckpointWriter>,
}

/// Runs N [`AnnealingCore`] replicas in rounds on a rayon pool.
///
/// Every round each replica anneals from the shared best state until the
/// sub-completion criteria is met. The round results are then reconciled,
/// either by adopting the lowest-energy replica or by averaging all of them,
/// and broadcast back so the next round starts from a common point.
///
/// Constraint ranges are tracked here only; replicas anneal without them so
/// they keep the energy shortcut.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use u_inversion::anneal::{AnnealConfig, SimulatedAnnealing};
/// use u_inversion::completion::IterationCompletionCriteria;
/// use u_inversion::data::{ColumnOrganizedData, SparseLinearSystem};
/// use u_inversion::parallel::{ParallelConfig, ParallelCoordinator};
///
/// let system = SparseLinearSystem::from_triplets(2, 2, &[(0, 0, 1.0), (1, 1, 1.0)], vec![1.0, 2.0]).unwrap();
/// let data = Arc::new(ColumnOrganizedData::from_system(&system).unwrap());
/// let mut coordinator = ParallelCoordinator::from_data(
///     data,
///     None,
///     vec![0.0, 0.0],
///     0.0,
///     2,
///     AnnealConfig::default(),
///     Arc::new(IterationCompletionCriteria::new(1000)),
///     ParallelConfig::default().with_seed(1),
/// )
/// .unwrap();
/// let state = coordinator.iterate_for(3000).unwrap();
/// assert_eq!(state.iterations, 3000);
/// coordinator.shutdown();
/// ```
#[derive(Debug)]
pub struct ParallelCoordinator {
    config: ParallelConfig,
    replicas: Vec<AnnealingCore>,
    sub_criteria: Arc<dyn CompletionCriteria>,
    ranges: Vec<ConstraintRange>,
    best: BestResults,
    pool: Option<Arc<rayon::ThreadPool>>,
    checkpoint: Option<Checkpoint>,
    last_round_energies: Vec<f64>,
}

impl ParallelCoordinator {
    /// Wraps existing replicas. The coordinator starts from replica 0's best
    /// state, which is broadcast to the others.
    ///
    /// # Errors
    /// No replicas, or replicas over systems of different shapes.
    pub fn new(
        mut replicas: Vec<AnnealingCore>,
        sub_criteria: Arc<dyn CompletionCriteria>,
        config: ParallelConfig,
    ) -> Result<Self> {
        let Some(first) = replicas.first() else {
            return Err(InversionError::InvalidConfig(
                "parallel coordinator needs at least one replica".into(),
            ));
        };
        let n_rows = first.equality_data().n_rows();
        let n_cols = first.equality_data().n_cols();
        let ineq_rows = first.inequality_data().map(|d| d.n_rows());
        for replica in &replicas[1..] {
            check_len("replica equality rows", n_rows, replica.equality_data().n_rows())?;
            check_len("replica columns", n_cols, replica.equality_data().n_cols())?;
            if replica.inequality_data().map(|d| d.n_rows()) != ineq_rows {
                return Err(InversionError::InvalidConfig(
                    "replicas must share the same inequality system shape".into(),
                ));
            }
        }
        let best = BestResults {
            energy: first.best_energy()[..E_FIXED_LEN].to_vec(),
            solution: first.best_solution().to_vec(),
            misfit: first.best_misfit().to_vec(),
            misfit_ineq: first.best_inequality_misfit().map(<[f64]>::to_vec),
            num_non_zero: first.num_non_zero(),
        };
        for replica in &mut replicas[1..] {
            replica.set_results(&best)?;
        }

        let mut coordinator = Self {
            config,
            replicas,
            sub_criteria,
            ranges: Vec::new(),
            best,
            pool: None,
            checkpoint: None,
            last_round_energies: Vec::new(),
        };
        if let Some(seed) = coordinator.config.seed {
            coordinator.set_seed(seed);
        }
        Ok(coordinator)
    }

    /// Builds `num_replicas` replicas sharing one set of systems.
    #[allow(clippy::too_many_arguments)]
    pub fn from_data(
        equality: Arc<ColumnOrganizedData>,
        inequality: Option<Arc<ColumnOrganizedData>>,
        initial_solution: Vec<f64>,
        smoothness_weight: f64,
        num_replicas: usize,
        anneal_config: AnnealConfig,
        sub_criteria: Arc<dyn CompletionCriteria>,
        config: ParallelConfig,
    ) -> Result<Self> {
        let replicas = (0..num_replicas)
            .map(|_| {
                AnnealingCore::new(
                    Arc::clone(&equality),
                    inequality.clone(),
                    initial_solution.clone(),
                    smoothness_weight,
                    anneal_config.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(replicas, sub_criteria, config)
    }

    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    pub fn replicas(&self) -> &[AnnealingCore] {
        &self.replicas
    }

    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }

    pub fn sub_criteria(&self) -> &Arc<dyn CompletionCriteria> {
        &self.sub_criteria
    }

    pub fn set_sub_criteria(&mut self, criteria: Arc<dyn CompletionCriteria>) {
        self.sub_criteria = criteria;
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.config.verbose = verbose;
    }

    pub fn set_average(&mut self, average: bool) {
        if self.config.average != average {
            // pool thread names depend on the mode
            self.pool = None;
        }
        self.config.average = average;
    }

    pub fn set_start_sub_iterations_at_zero(&mut self, at_zero: bool) {
        self.config.start_sub_iterations_at_zero = at_zero;
    }

    /// Reseeds every replica from one top-level seed. A single replica takes
    /// the seed unchanged.
    pub fn set_seed(&mut self, seed: u64) {
        self.config.seed = Some(seed);
        if let [only] = self.replicas.as_mut_slice() {
            only.set_seed(seed);
            return;
        }
        let mut top = StdRng::seed_from_u64(seed);
        for replica in &mut self.replicas {
            replica.set_seed(top.next_u64());
        }
    }

    /// Applies one annealing configuration to every replica.
    pub fn set_anneal_config(&mut self, config: &AnnealConfig) -> Result<()> {
        for replica in &mut self.replicas {
            replica.set_config(config.clone())?;
        }
        Ok(())
    }

    /// Sets the same perturbation basis on every replica.
    pub fn set_perturbation_basis(&mut self, basis: Option<Vec<f64>>) -> Result<()> {
        for replica in &mut self.replicas {
            replica.set_perturbation_basis(basis.clone())?;
        }
        Ok(())
    }

    /// Drops replicas down to `num_threads`.
    ///
    /// # Errors
    /// Zero, or more than the current replica count.
    pub fn set_num_threads(&mut self, num_threads: usize) -> Result<()> {
        if num_threads == 0 || num_threads > self.replicas.len() {
            return Err(InversionError::InvalidConfig(format!(
                "thread count can only shrink: have {}, asked for {num_threads}",
                self.replicas.len()
            )));
        }
        if num_threads < self.replicas.len() {
            self.replicas.truncate(num_threads);
            self.pool = None;
        }
        Ok(())
    }

    /// Writes the best solution every `interval` of run time.
    pub fn set_checkpoint(&mut self, interval: Duration, writer: Box<dyn CheckpointWriter>) {
        self.checkpoint = Some(Checkpoint {
            interval: TimeCompletionCriteria::new(interval),
            writer,
        });
    }

    pub fn clear_checkpoint(&mut self) {
        self.checkpoint = None;
    }

    /// Total energy each replica reported at the end of the last round.
    pub fn last_round_energies(&self) -> &[f64] {
        &self.last_round_energies
    }

    /// Per-range energies of the best state, keyed by short name.
    pub fn constraint_energies(&self) -> Vec<(&str, f64)> {
        self.ranges
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let e = self.best.energy.get(E_FIXED_LEN + i).copied().unwrap_or(f64::NAN);
                (r.short_name(), e)
            })
            .collect()
    }

    /// Settings of this run, for reports.
    pub fn metadata(&self) -> BTreeMap<&'static str, String> {
        let mut meta = BTreeMap::new();
        meta.insert("replicas", self.replicas.len().to_string());
        meta.insert("average", self.config.average.to_string());
        meta.insert(
            "start_sub_iterations_at_zero",
            self.config.start_sub_iterations_at_zero.to_string(),
        );
        meta.insert("sub_completion", self.sub_criteria.to_string());
        if let Some(first) = self.replicas.first() {
            let c = first.config();
            meta.insert("cooling", format!("{:?}", c.cooling));
            meta.insert("perturbation", format!("{:?}", c.perturbation));
            meta.insert("nonnegativity", format!("{:?}", c.nonnegativity));
            meta.insert("energy_scale", c.energy_scale.to_string());
        }
        if let Some(seed) = self.config.seed {
            meta.insert("seed", seed.to_string());
        }
        meta
    }

    /// Releases the thread pool. A later `iterate` builds a new one.
    pub fn shutdown(&mut self) {
        if self.pool.take().is_some() {
            tracing::debug!("annealing thread pool released");
        }
    }

    fn pool(&mut self) -> Result<Arc<rayon::ThreadPool>> {
        if let Some(pool) = &self.pool {
            return Ok(Arc::clone(pool));
        }
        let id = POOL_COUNT.fetch_add(1, Ordering::Relaxed);
        let kind = if self.config.average { "avg" } else { "worker" };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.replicas.len())
            .thread_name(move |i| format!("sa-pool-{id}-{kind}-{i}"))
            .build()?;
        let pool = Arc::new(pool);
        self.pool = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Best results with the energy trimmed to the fixed entries, as handed
    /// to replicas.
    fn replica_results(&self) -> BestResults {
        BestResults {
            energy: self.best.energy[..E_FIXED_LEN].to_vec(),
            solution: self.best.solution.clone(),
            misfit: self.best.misfit.clone(),
            misfit_ineq: self.best.misfit_ineq.clone(),
            num_non_zero: self.best.num_non_zero,
        }
    }

    fn broadcast(&mut self) -> Result<()> {
        let results = self.replica_results();
        self.broadcast_results(&results)
    }

    fn broadcast_results(&mut self, results: &BestResults) -> Result<()> {
        for replica in &mut self.replicas {
            replica.set_results(results)?;
        }
        Ok(())
    }

    /// Recomputes the per-range entries, keeping the fixed entries as they
    /// are.
    fn refresh_range_energies(&mut self) -> Result<()> {
        let fixed: Vec<f64> = self.best.energy.iter().take(E_FIXED_LEN).copied().collect();
        let mut energy = calculate_energy(
            &self.best.solution,
            &self.best.misfit,
            self.best.misfit_ineq.as_deref(),
            &self.ranges,
            self.smoothness_weight(),
        )?;
        if fixed.len() == E_FIXED_LEN {
            energy[..E_FIXED_LEN].copy_from_slice(&fixed);
        }
        self.best.energy = energy;
        Ok(())
    }

    fn snapshot(&self, elapsed: Duration, counters: &Counters) -> InversionSnapshot {
        InversionSnapshot {
            elapsed,
            iterations: counters.iterations,
            energy: self.best.energy.clone(),
            perturbs_kept: counters.perturbs,
            worse_values_kept: counters.worse_kept,
            num_non_zero: self.best.num_non_zero,
            best_solution: self.best.solution.clone(),
            best_misfit: self.best.misfit.clone(),
            best_misfit_ineq: self.best.misfit_ineq.clone(),
            constraint_ranges: self.ranges.clone(),
        }
    }

    fn maybe_checkpoint(&mut self, watch: &mut Instant, count: &mut u32, iterations: u64) {
        let Some(checkpoint) = self.checkpoint.as_mut() else {
            return;
        };
        if !checkpoint.interval.is_elapsed(watch.elapsed()) {
            return;
        }
        *count += 1;
        let label = time_str(checkpoint.interval.duration().saturating_mul(*count));
        tracing::info!(iterations, energy = ?self.best.energy, "writing checkpoint {label}");
        if let Err(err) = checkpoint.writer.write_checkpoint(&label, iterations, &self.best.solution) {
            tracing::warn!(error = %err, "checkpoint {label} failed, continuing");
        }
        *watch = Instant::now();
    }

    /// Runs rounds until `criteria` is satisfied, calling `hook` at the start
    /// of each round.
    ///
    /// # Errors
    /// A replica error or panic abandons the round; the first one is
    /// returned once every replica has finished. Errors from the hook are
    /// returned as-is.
    pub fn iterate_with_hook(
        &mut self,
        start: Option<&InversionState<'_>>,
        criteria: &dyn CompletionCriteria,
        hook: &mut dyn RoundHook,
    ) -> Result<InversionSnapshot> {
        let started = Instant::now();
        let mut checkpoint_watch = Instant::now();
        let mut checkpoints = 0u32;
        let mut counters = start.map_or_else(Counters::default, |s| Counters {
            iterations: s.iterations,
            perturbs: s.perturbs_kept,
            worse_kept: s.worse_values_kept,
        });
        let verbose = self.config.verbose;
        if self.best.energy.len() != E_FIXED_LEN + self.ranges.len() {
            self.refresh_range_energies()?;
        }
        let pool = self.pool()?;

        if verbose {
            tracing::info!(
                replicas = self.replicas.len(),
                average = self.config.average,
                criteria = %criteria,
                sub_criteria = %self.sub_criteria,
                "parallel annealing starting"
            );
        }

        let mut rounds = 0usize;
        let mut prev_energy: Option<Vec<f64>> = None;
        let state = loop {
            let state = self.snapshot(started.elapsed(), &counters);
            if criteria.is_satisfied(&state.state()) {
                break state;
            }
            hook.before_round(self, &state, rounds)?;
            self.maybe_checkpoint(&mut checkpoint_watch, &mut checkpoints, counters.iterations);

            let thread_start_iter = if self.config.start_sub_iterations_at_zero {
                0
            } else {
                counters.iterations
            };
            let sub = self
                .sub_criteria
                .for_start_iteration(thread_start_iter)
                .unwrap_or_else(|| Arc::clone(&self.sub_criteria));
            let round_start = InversionState {
                elapsed: state.elapsed,
                iterations: thread_start_iter,
                energy: &self.best.energy,
                perturbs_kept: counters.perturbs,
                worse_values_kept: counters.worse_kept,
                num_non_zero: self.best.num_non_zero,
                best_solution: &self.best.solution,
                best_misfit: &self.best.misfit,
                best_misfit_ineq: self.best.misfit_ineq.as_deref(),
                constraint_ranges: &[],
            };
            let replicas = &mut self.replicas;
            let outcomes: Vec<Result<InversionSnapshot>> = pool.install(|| {
                replicas
                    .par_iter_mut()
                    .enumerate()
                    .map(|(i, core)| run_replica(i, core, &round_start, sub.as_ref()))
                    .collect()
            });

            let mut results = Vec::with_capacity(outcomes.len());
            let mut failure = None;
            for outcome in outcomes {
                match outcome {
                    Ok(snapshot) => results.push(snapshot),
                    Err(err) => {
                        tracing::error!(error = %err, "replica failed, abandoning round {rounds}");
                        failure.get_or_insert(err);
                    }
                }
            }
            if let Some(err) = failure {
                return Err(err);
            }

            self.last_round_energies = results.iter().map(|r| r.energy[E_TOTAL]).collect();
            let max_advance = results
                .iter()
                .map(|r| r.iterations.saturating_sub(thread_start_iter))
                .max()
                .unwrap_or(0);
            // replicas need an energy that matches the state they restart from
            let mut replica_state = None;
            if self.config.average {
                let averaged = average_results(&results)?;
                for r in &results {
                    counters.perturbs += r.perturbs_kept.saturating_sub(state.perturbs_kept);
                    counters.worse_kept += r.worse_values_kept.saturating_sub(state.worse_values_kept);
                }
                let mut evaluated = averaged.clone();
                evaluated.energy = calculate_energy(
                    &averaged.solution,
                    &averaged.misfit,
                    averaged.misfit_ineq.as_deref(),
                    &[],
                    self.smoothness_weight(),
                )?;
                replica_state = Some(evaluated);
                self.best = averaged;
            } else if let Some(winner) = best_replica(&results) {
                let r = results.swap_remove(winner);
                counters.perturbs = r.perturbs_kept;
                counters.worse_kept = r.worse_values_kept;
                self.best = BestResults {
                    energy: r.energy,
                    solution: r.best_solution,
                    misfit: r.best_misfit,
                    misfit_ineq: r.best_misfit_ineq,
                    num_non_zero: r.num_non_zero,
                };
            }
            counters.iterations += max_advance;
            rounds += 1;

            if !self.ranges.is_empty() {
                self.refresh_range_energies()?;
            }

            let elapsed = started.elapsed();
            if verbose {
                let secs = elapsed.as_secs_f64();
                let per_sec = if secs > 0.0 {
                    (counters.iterations as f64 / secs).round()
                } else {
                    0.0
                };
                tracing::info!(
                    round = rounds,
                    elapsed = %time_str(elapsed),
                    iterations = counters.iterations,
                    iterations_per_sec = per_sec,
                    perturbs = counters.perturbs,
                    non_zero = self.best.num_non_zero,
                    n_cols = self.best.solution.len(),
                    "round done: {}",
                    format_energies(&self.best.energy, prev_energy.as_deref(), &self.ranges)
                );
                prev_energy = Some(self.best.energy.clone());
            }

            match replica_state {
                Some(evaluated) => self.broadcast_results(&evaluated)?,
                None => self.broadcast()?,
            }
        };

        if verbose {
            tracing::info!(
                rounds,
                elapsed = %time_str(state.elapsed),
                iterations = state.iterations,
                perturbs = state.perturbs_kept,
                "parallel annealing done: {}",
                format_energies(&state.energy, None, &self.ranges)
            );
        }
        Ok(state)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    iterations: u64,
    perturbs: u64,
    worse_kept: u64,
}

fn run_replica(
    index: usize,
    core: &mut AnnealingCore,
    start: &InversionState<'_>,
    criteria: &dyn CompletionCriteria,
) -> Result<InversionSnapshot> {
    match panic::catch_unwind(AssertUnwindSafe(|| core.iterate_from(Some(start), criteria))) {
        Ok(Ok(snapshot)) => Ok(snapshot),
        Ok(Err(source)) => Err(InversionError::Replica {
            replica: index,
            source: Box::new(source),
        }),
        Err(payload) => Err(InversionError::ReplicaPanic {
            replica: index,
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Index of the lowest total energy.
fn best_replica(results: &[InversionSnapshot]) -> Option<usize> {
    results
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.energy[E_TOTAL].total_cmp(&b.1.energy[E_TOTAL]))
        .map(|(i, _)| i)
}

/// Unweighted mean of the fixed energies, solutions and misfits.
fn average_results(results: &[InversionSnapshot]) -> Result<BestResults> {
    let Some(first) = results.first() else {
        return Err(InversionError::MissingInput("replica results to average"));
    };
    let scale = 1.0 / results.len() as f64;
    let mut energy = vec![0.0; E_FIXED_LEN];
    let mut solution = vec![0.0; first.best_solution.len()];
    let mut misfit = vec![0.0; first.best_misfit.len()];
    let mut misfit_ineq = first.best_misfit_ineq.as_ref().map(|m| vec![0.0; m.len()]);

    for r in results {
        add_scaled(&mut energy, &r.energy[..E_FIXED_LEN], scale);
        add_scaled(&mut solution, &r.best_solution, scale);
        add_scaled(&mut misfit, &r.best_misfit, scale);
        if let (Some(dst), Some(src)) = (misfit_ineq.as_mut(), r.best_misfit_ineq.as_ref()) {
            add_scaled(dst, src, scale);
        }
    }
    let num_non_zero = count_non_zero(&solution);
    Ok(BestResults {
        energy,
        solution,
        misfit,
        misfit_ineq,
        num_non_zero,
    })
}

fn add_scaled(dst: &mut [f64], src: &[f64], scale: f64) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = s.mul_add(scale, *d);
    }
}

/// `label=value (+x.xx%)` for each energy entry.
fn format_energies(energy: &[f64], prev: Option<&[f64]>, ranges: &[ConstraintRange]) -> String {
    const FIXED: [&str; E_FIXED_LEN] = ["total", "equality", "entropy", "inequality"];
    let mut out = String::new();
    for (i, &e) in energy.iter().enumerate() {
        let label = FIXED
            .get(i)
            .copied()
            .or_else(|| ranges.get(i - E_FIXED_LEN).map(ConstraintRange::short_name))
            .unwrap_or("?");
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&format!("{label}={e:.6e}"));
        if let Some(&p) = prev.and_then(|p| p.get(i)) {
            if p != 0.0 {
                out.push_str(&format!(" ({:+.2}%)", (e - p) / p * 100.0));
            }
        }
    }
    out
}

impl SimulatedAnnealing for ParallelCoordinator {
    fn iterate_from(
        &mut self,
        start: Option<&InversionState<'_>>,
        criteria: &dyn CompletionCriteria,
    ) -> Result<InversionSnapshot> {
        self.iterate_with_hook(start, criteria, &mut NoRoundHook)
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
        self.replicas[0].initial_solution()
    }

    fn equality_data(&self) -> &Arc<ColumnOrganizedData> {
        self.replicas[0].equality_data()
    }

    fn inequality_data(&self) -> Option<&Arc<ColumnOrganizedData>> {
        self.replicas[0].inequality_data()
    }

    fn smoothness_weight(&self) -> f64 {
        self.replicas[0].smoothness_weight()
    }

    fn constraint_ranges(&self) -> &[ConstraintRange] {
        &self.ranges
    }

    fn set_constraint_ranges(&mut self, ranges: Vec<ConstraintRange>) -> Result<()> {
        check_ranges(
            &ranges,
            self.equality_data().n_rows(),
            self.inequality_data().map(|d| d.n_rows()),
        )?;
        self.ranges = ranges;
        self.refresh_range_energies()
    }

    fn set_results(&mut self, results: &BestResults) -> Result<()> {
        results.check_shape(
            self.equality_data().n_rows(),
            self.equality_data().n_cols(),
            self.inequality_data().map(|d| d.n_rows()),
        )?;
        self.best = results.clone();
        if self.best.energy.len() != E_FIXED_LEN + self.ranges.len() {
            self.refresh_range_energies()?;
        }
        self.broadcast()
    }

    fn set_all(
        &mut self,
        equality: Arc<ColumnOrganizedData>,
        inequality: Option<Arc<ColumnOrganizedData>>,
        results: &BestResults,
    ) -> Result<()> {
        let mut trimmed = results.clone();
        trimmed.energy.truncate(E_FIXED_LEN);
        for replica in &mut self.replicas {
            replica.set_all(Arc::clone(&equality), inequality.clone(), &trimmed)?;
        }
        self.best = results.clone();
        if self.best.energy.len() != E_FIXED_LEN + self.ranges.len() {
            self.refresh_range_energies()?;
        }
        Ok(())
    }
}

impl fmt::Display for ParallelCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} replicas ({}), sub-completion: {}",
            self.replicas.len(),
            if self.config.average { "average" } else { "best-of" },
            self.sub_criteria
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anneal::{ColumnSampler, PerturbationFunction};
    use crate::completion::IterationCompletionCriteria;
    use crate::data::SparseLinearSystem;
    use rand::Rng;
    use std::sync::Mutex;

    fn random_data(n_rows: usize, n_cols: usize, seed: u64) -> Arc<ColumnOrganizedData> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut triplets = Vec::new();
        for r in 0..n_rows {
            for c in 0..n_cols {
                if rng.random::<f64>() < 0.4 {
                    triplets.push((r, c, rng.random::<f64>()));
                }
            }
        }
        let d = (0..n_rows).map(|_| rng.random::<f64>() * 5.0).collect();
        let system = SparseLinearSystem::from_triplets(n_rows, n_cols, &triplets, d).unwrap();
        Arc::new(ColumnOrganizedData::from_system(&system).unwrap())
    }

    fn coordinator(n: usize, sub: u64, config: ParallelConfig) -> ParallelCoordinator {
        let data = random_data(30, 12, 21);
        ParallelCoordinator::from_data(
            data,
            None,
            vec![0.0; 12],
            0.0,
            n,
            AnnealConfig::default().with_perturbation(PerturbationFunction::Uniform { width: 0.05 }),
            Arc::new(IterationCompletionCriteria::new(sub)),
            config,
        )
        .unwrap()
    }

    #[test]
    fn test_best_of_round_beats_every_replica() {
        let mut coord = coordinator(4, 10_000, ParallelConfig::default().with_seed(42));
        let state = coord.iterate_for(10_000).unwrap();
        assert_eq!(state.iterations, 10_000);
        let energies = coord.last_round_energies();
        assert_eq!(energies.len(), 4);
        let min = energies.iter().copied().fold(f64::INFINITY, f64::min);
        assert_eq!(state.energy[E_TOTAL], min);
        assert!(energies.iter().all(|&e| state.energy[E_TOTAL] <= e));
        for replica in coord.replicas() {
            assert_eq!(replica.best_solution(), coord.best_solution());
        }
        coord.shutdown();
    }

    #[test]
    fn test_every_flag_combination_runs() {
        for bits in 0..8u8 {
            let config = ParallelConfig::default()
                .with_average(bits & 1 != 0)
                .with_start_sub_iterations_at_zero(bits & 2 != 0)
                .with_verbose(bits & 4 != 0)
                .with_seed(u64::from(bits));
            let mut coord = coordinator(2, 200, config);
            let state = coord.iterate_for(400).unwrap();
            assert_eq!(state.iterations, 400);
            coord.shutdown();
        }
    }

    #[test]
    fn test_same_seed_same_result() {
        let run = || {
            let mut coord = coordinator(3, 2000, ParallelConfig::default().with_seed(9));
            coord.iterate_for(6000).unwrap().energy
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_energy_non_increasing_across_rounds() {
        let mut coord = coordinator(2, 500, ParallelConfig::default().with_seed(5));
        let mut prev = coord.best_energy()[E_TOTAL];
        for i in 1..=5 {
            let state = coord.iterate_for(500 * i).unwrap();
            assert!(state.energy[E_TOTAL] <= prev * (1.0 + 1e-12));
            prev = state.energy[E_TOTAL];
        }
    }

    #[test]
    fn test_average_mode_means() {
        let results: Vec<InversionSnapshot> = (0..3)
            .map(|i| {
                let v = i as f64;
                InversionSnapshot {
                    elapsed: Duration::ZERO,
                    iterations: 10,
                    energy: vec![v, v, 0.0, 0.0],
                    perturbs_kept: 5,
                    worse_values_kept: 1,
                    num_non_zero: 1,
                    best_solution: vec![v, 0.0],
                    best_misfit: vec![2.0 * v],
                    best_misfit_ineq: Some(vec![-v]),
                    constraint_ranges: Vec::new(),
                }
            })
            .collect();
        let avg = average_results(&results).unwrap();
        assert!((avg.energy[0] - 1.0).abs() < 1e-15);
        assert!((avg.solution[0] - 1.0).abs() < 1e-15);
        assert_eq!(avg.solution[1], 0.0);
        assert!((avg.misfit[0] - 2.0).abs() < 1e-15);
        assert!((avg.misfit_ineq.unwrap()[0] + 1.0).abs() < 1e-15);
        assert_eq!(avg.num_non_zero, 1);
    }

    #[test]
    fn test_average_mode_run() {
        let mut coord = coordinator(3, 1000, ParallelConfig::default().with_average(true).with_seed(4));
        let state = coord.iterate_for(3000).unwrap();
        assert_eq!(state.iterations, 3000);
        assert!(state.best_solution.iter().all(|&v| v >= 0.0));
        let misfit = coord.equality_data().misfit(&state.best_solution);
        for (a, b) in misfit.iter().zip(&state.best_misfit) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_sub_iterations_at_zero_still_counts() {
        let mut coord = coordinator(
            2,
            500,
            ParallelConfig::default()
                .with_start_sub_iterations_at_zero(true)
                .with_seed(3),
        );
        let state = coord.iterate_for(1000).unwrap();
        assert_eq!(state.iterations, 1000);
    }

    #[test]
    fn test_replica_error_is_propagated() {
        let data = random_data(10, 5, 1);
        let good = AnnealConfig::default().with_seed(1);
        let bad = good
            .clone()
            .with_perturbation(PerturbationFunction::VariableNoTempDependence);
        let replicas = vec![
            AnnealingCore::new(Arc::clone(&data), None, vec![0.0; 5], 0.0, good.clone()).unwrap(),
            AnnealingCore::new(Arc::clone(&data), None, vec![0.0; 5], 0.0, bad).unwrap(),
            AnnealingCore::new(data, None, vec![0.0; 5], 0.0, good).unwrap(),
        ];
        let mut coord = ParallelCoordinator::new(
            replicas,
            Arc::new(IterationCompletionCriteria::new(100)),
            ParallelConfig::default(),
        )
        .unwrap();
        let err = coord.iterate_for(100).unwrap_err();
        match err {
            InversionError::Replica { replica, source } => {
                assert_eq!(replica, 1);
                assert!(matches!(*source, InversionError::MissingInput(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[derive(Debug)]
    struct PanickingSampler(usize);

    impl ColumnSampler for PanickingSampler {
        fn num_columns(&self) -> usize {
            self.0
        }

        fn sample(&self, _rng: &mut dyn RngCore) -> usize {
            panic!("sampler exploded");
        }
    }

    #[test]
    fn test_replica_panic_is_propagated() {
        let mut coord = coordinator(2, 100, ParallelConfig::default().with_seed(1));
        coord.replicas[1]
            .set_sampler(Arc::new(PanickingSampler(12)))
            .unwrap();
        let err = coord.iterate_for(100).unwrap_err();
        match err {
            InversionError::ReplicaPanic { replica, message } => {
                assert_eq!(replica, 1);
                assert!(message.contains("sampler exploded"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[derive(Debug, Clone, Default)]
    struct FailingWriter {
        labels: Arc<Mutex<Vec<String>>>,
    }

    impl CheckpointWriter for FailingWriter {
        fn write_checkpoint(&mut self, label: &str, _iterations: u64, _solution: &[f64]) -> Result<()> {
            self.labels.lock().unwrap().push(label.to_owned());
            Err(InversionError::Io(std::io::Error::other("disk full")))
        }
    }

    #[test]
    fn test_checkpoint_failure_does_not_abort() {
        let mut coord = coordinator(2, 100, ParallelConfig::default().with_seed(2));
        let writer = FailingWriter::default();
        let labels = Arc::clone(&writer.labels);
        coord.set_checkpoint(Duration::ZERO, Box::new(writer));
        let state = coord.iterate_for(300).unwrap();
        assert_eq!(state.iterations, 300);
        assert_eq!(labels.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_set_num_threads_only_shrinks() {
        let mut coord = coordinator(3, 100, ParallelConfig::default());
        assert!(coord.set_num_threads(4).is_err());
        assert!(coord.set_num_threads(0).is_err());
        coord.set_num_threads(2).unwrap();
        assert_eq!(coord.num_replicas(), 2);
        assert!(coord.iterate_for(200).is_ok());
    }

    #[test]
    fn test_ranges_stay_at_coordinator() {
        let mut coord = coordinator(2, 500, ParallelConfig::default().with_seed(8));
        coord
            .set_constraint_ranges(vec![
                ConstraintRange::new("first", "A", 0, 10, false).unwrap(),
                ConstraintRange::new("rest", "B", 10, 30, false).unwrap(),
            ])
            .unwrap();
        let state = coord.iterate_for(1000).unwrap();
        assert_eq!(state.energy.len(), 6);
        assert!((state.energy[4] + state.energy[5] - state.energy[1]).abs() < 1e-9);
        for replica in coord.replicas() {
            assert!(replica.constraint_ranges().is_empty());
            assert_eq!(replica.best_energy().len(), E_FIXED_LEN);
        }
        let names: Vec<&str> = coord.constraint_energies().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn test_format_energies_labels() {
        let s = format_energies(&[2.0, 1.0, 0.0, 1.0], Some(&[4.0, 1.0, 0.0, 1.0]), &[]);
        assert!(s.starts_with("total=2.000000e0 (-50.00%)"));
        assert!(s.contains("inequality="));
    }

    #[test]
    fn test_metadata_lists_settings() {
        let coord = coordinator(2, 100, ParallelConfig::default().with_seed(11));
        let meta = coord.metadata();
        assert_eq!(meta["replicas"], "2");
        assert_eq!(meta["seed"], "11");
        assert_eq!(meta["sub_completion"], "100 iterations");
    }
}
