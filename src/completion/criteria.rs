//! Stop conditions.

use crate::anneal::InversionState;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Decides when an `iterate` call should stop.
///
/// Checked before every iteration of a serial core and before every round of
/// a coordinator.
pub trait CompletionCriteria: Send + Sync + fmt::Debug + fmt::Display {
    /// Returns `true` once annealing should stop.
    fn is_satisfied(&self, state: &InversionState<'_>) -> bool;

    /// An equivalent criteria that counts from `start_iteration` instead of
    /// zero, or `None` if this criteria does not depend on iteration counts.
    ///
    /// Coordinators use this so that a replica continuing from a shared
    /// iteration count still runs the intended number of iterations per round.
    fn for_start_iteration(&self, start_iteration: u64) -> Option<Arc<dyn CompletionCriteria>> {
        let _ = start_iteration;
        None
    }
}

/// Stops after a total number of iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IterationCompletionCriteria {
    min_iterations: u64,
}

impl IterationCompletionCriteria {
    pub fn new(min_iterations: u64) -> Self {
        Self { min_iterations }
    }

    pub fn min_iterations(&self) -> u64 {
        self.min_iterations
    }
}

impl CompletionCriteria for IterationCompletionCriteria {
    fn is_satisfied(&self, state: &InversionState<'_>) -> bool {
        state.iterations >= self.min_iterations
    }

    fn for_start_iteration(&self, start_iteration: u64) -> Option<Arc<dyn CompletionCriteria>> {
        Some(Arc::new(Self::new(start_iteration + self.min_iterations)))
    }
}

impl fmt::Display for IterationCompletionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} iterations", self.min_iterations)
    }
}

/// Stops after `iterations_per_variable × n_cols` iterations past a start
/// count.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IterationsPerVariableCompletionCriteria {
    iterations_per_variable: f64,
    start_iteration: u64,
}

impl IterationsPerVariableCompletionCriteria {
    pub fn new(iterations_per_variable: f64) -> Self {
        Self::with_start_iteration(iterations_per_variable, 0)
    }

    pub fn with_start_iteration(iterations_per_variable: f64, start_iteration: u64) -> Self {
        Self {
            iterations_per_variable,
            start_iteration,
        }
    }

    pub fn iterations_per_variable(&self) -> f64 {
        self.iterations_per_variable
    }

    pub fn start_iteration(&self) -> u64 {
        self.start_iteration
    }
}

impl CompletionCriteria for IterationsPerVariableCompletionCriteria {
    fn is_satisfied(&self, state: &InversionState<'_>) -> bool {
        let done = state.iterations.saturating_sub(self.start_iteration) as f64;
        done >= self.iterations_per_variable * state.best_solution.len() as f64
    }

    fn for_start_iteration(&self, start_iteration: u64) -> Option<Arc<dyn CompletionCriteria>> {
        Some(Arc::new(Self::with_start_iteration(
            self.iterations_per_variable,
            start_iteration,
        )))
    }
}

impl fmt::Display for IterationsPerVariableCompletionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} iterations per variable", self.iterations_per_variable)
    }
}

/// Stops once the elapsed time of the current `iterate` call reaches a
/// duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeCompletionCriteria {
    duration: Duration,
}

impl TimeCompletionCriteria {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn from_mins(mins: u64) -> Self {
        Self::new(Duration::from_secs(mins * 60))
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Same check against an arbitrary elapsed time, used for checkpoint
    /// scheduling.
    pub fn is_elapsed(&self, elapsed: Duration) -> bool {
        elapsed >= self.duration
    }
}

impl CompletionCriteria for TimeCompletionCriteria {
    fn is_satisfied(&self, state: &InversionState<'_>) -> bool {
        self.is_elapsed(state.elapsed)
    }
}

impl fmt::Display for TimeCompletionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&time_str(self.duration))
    }
}

/// Stops once the best total energy is at or below a target.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EnergyCompletionCriteria {
    max_energy: f64,
}

impl EnergyCompletionCriteria {
    pub fn new(max_energy: f64) -> Self {
        Self { max_energy }
    }

    pub fn max_energy(&self) -> f64 {
        self.max_energy
    }
}

impl CompletionCriteria for EnergyCompletionCriteria {
    fn is_satisfied(&self, state: &InversionState<'_>) -> bool {
        state.total_energy() <= self.max_energy
    }
}

impl fmt::Display for EnergyCompletionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "energy <= {}", self.max_energy)
    }
}

/// Satisfied as soon as any member is.
#[derive(Debug, Clone, Default)]
pub struct CompoundCompletionCriteria {
    criteria: Vec<Arc<dyn CompletionCriteria>>,
}

impl CompoundCompletionCriteria {
    pub fn new(criteria: Vec<Arc<dyn CompletionCriteria>>) -> Self {
        Self { criteria }
    }

    pub fn with<C: CompletionCriteria + 'static>(mut self, criteria: C) -> Self {
        self.criteria.push(Arc::new(criteria));
        self
    }

    pub fn criteria(&self) -> &[Arc<dyn CompletionCriteria>] {
        &self.criteria
    }
}

impl CompletionCriteria for CompoundCompletionCriteria {
    fn is_satisfied(&self, state: &InversionState<'_>) -> bool {
        self.criteria.iter().any(|c| c.is_satisfied(state))
    }

    /// Rebases every member that depends on iteration counts.
    fn for_start_iteration(&self, start_iteration: u64) -> Option<Arc<dyn CompletionCriteria>> {
        let mut changed = false;
        let criteria = self
            .criteria
            .iter()
            .map(|c| match c.for_start_iteration(start_iteration) {
                Some(rebased) => {
                    changed = true;
                    rebased
                }
                None => Arc::clone(c),
            })
            .collect();
        changed.then(|| Arc::new(Self { criteria }) as Arc<dyn CompletionCriteria>)
    }
}

impl fmt::Display for CompoundCompletionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.criteria.iter().enumerate() {
            if i > 0 {
                f.write_str(" or ")?;
            }
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// Formats a duration compactly, e.g. `1h`, `2h30m`, `45s`, `500ms`.
///
/// Also used for checkpoint file names.
pub fn time_str(duration: Duration) -> String {
    let total_ms = duration.as_millis();
    if total_ms == 0 {
        return "0s".to_owned();
    }
    let hours = total_ms / 3_600_000;
    let mins = (total_ms / 60_000) % 60;
    let secs = (total_ms / 1000) % 60;
    let ms = total_ms % 1000;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if mins > 0 {
        out.push_str(&format!("{mins}m"));
    }
    if secs > 0 {
        out.push_str(&format!("{secs}s"));
    }
    if ms > 0 {
        out.push_str(&format!("{ms}ms"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anneal::InversionSnapshot;

    fn snapshot(iterations: u64, energy: f64, n: usize, elapsed: Duration) -> InversionSnapshot {
        InversionSnapshot {
            elapsed,
            iterations,
            energy: vec![energy, energy, 0.0, 0.0],
            perturbs_kept: 0,
            worse_values_kept: 0,
            num_non_zero: 0,
            best_solution: vec![0.0; n],
            best_misfit: vec![0.0],
            best_misfit_ineq: None,
            constraint_ranges: Vec::new(),
        }
    }

    #[test]
    fn test_iteration_criteria_rebases() {
        let c = IterationCompletionCriteria::new(100);
        assert!(!c.is_satisfied(&snapshot(99, 1.0, 1, Duration::ZERO).state()));
        assert!(c.is_satisfied(&snapshot(100, 1.0, 1, Duration::ZERO).state()));

        let rebased = c.for_start_iteration(1000).unwrap();
        assert!(!rebased.is_satisfied(&snapshot(1099, 1.0, 1, Duration::ZERO).state()));
        assert!(rebased.is_satisfied(&snapshot(1100, 1.0, 1, Duration::ZERO).state()));
    }

    #[test]
    fn test_iterations_per_variable() {
        let c = IterationsPerVariableCompletionCriteria::new(2.5);
        assert!(!c.is_satisfied(&snapshot(24, 1.0, 10, Duration::ZERO).state()));
        assert!(c.is_satisfied(&snapshot(25, 1.0, 10, Duration::ZERO).state()));

        let rebased = c.for_start_iteration(50).unwrap();
        assert!(!rebased.is_satisfied(&snapshot(74, 1.0, 10, Duration::ZERO).state()));
        assert!(rebased.is_satisfied(&snapshot(75, 1.0, 10, Duration::ZERO).state()));
    }

    #[test]
    fn test_time_and_energy() {
        let t = TimeCompletionCriteria::from_secs(2);
        assert!(!t.is_satisfied(&snapshot(0, 1.0, 1, Duration::from_millis(1999)).state()));
        assert!(t.is_satisfied(&snapshot(0, 1.0, 1, Duration::from_secs(2)).state()));
        assert!(t.for_start_iteration(10).is_none());

        let e = EnergyCompletionCriteria::new(0.5);
        assert!(!e.is_satisfied(&snapshot(0, 0.6, 1, Duration::ZERO).state()));
        assert!(e.is_satisfied(&snapshot(0, 0.5, 1, Duration::ZERO).state()));
    }

    #[test]
    fn test_compound_any_and_rebase() {
        let c = CompoundCompletionCriteria::default()
            .with(IterationCompletionCriteria::new(10))
            .with(EnergyCompletionCriteria::new(0.1));
        assert!(c.is_satisfied(&snapshot(10, 5.0, 1, Duration::ZERO).state()));
        assert!(c.is_satisfied(&snapshot(0, 0.05, 1, Duration::ZERO).state()));
        assert!(!c.is_satisfied(&snapshot(5, 5.0, 1, Duration::ZERO).state()));

        let rebased = c.for_start_iteration(100).unwrap();
        assert!(!rebased.is_satisfied(&snapshot(105, 5.0, 1, Duration::ZERO).state()));
        assert!(rebased.is_satisfied(&snapshot(110, 5.0, 1, Duration::ZERO).state()));
        assert_eq!(c.to_string(), "10 iterations or energy <= 0.1");

        let timed = CompoundCompletionCriteria::default().with(TimeCompletionCriteria::from_secs(1));
        assert!(timed.for_start_iteration(5).is_none());
    }

    #[test]
    fn test_time_str() {
        assert_eq!(time_str(Duration::ZERO), "0s");
        assert_eq!(time_str(Duration::from_secs(3600)), "1h");
        assert_eq!(time_str(Duration::from_secs(5400)), "1h30m");
        assert_eq!(time_str(Duration::from_secs(45)), "45s");
        assert_eq!(time_str(Duration::from_millis(1500)), "1s500ms");
    }
}
