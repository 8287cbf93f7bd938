//! Progress history recorded while checking another criteria.

use super::criteria::CompletionCriteria;
use crate::anneal::InversionState;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// One recorded point of an annealing run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AnnealingProgress {
    pub elapsed: Duration,
    pub iterations: u64,
    pub energy: Vec<f64>,
    pub perturbs_kept: u64,
    pub worse_values_kept: u64,
    pub num_non_zero: usize,
}

impl AnnealingProgress {
    fn from_state(state: &InversionState<'_>) -> Self {
        Self {
            elapsed: state.elapsed,
            iterations: state.iterations,
            energy: state.energy.to_vec(),
            perturbs_kept: state.perturbs_kept,
            worse_values_kept: state.worse_values_kept,
            num_non_zero: state.num_non_zero,
        }
    }
}

/// Wraps another criteria and records the state each time it is checked.
///
/// With an interval set, a point is recorded only once that much run time has
/// passed since the previous one. The state that satisfies the inner criteria
/// is always recorded.
///
/// # Examples
///
/// ```
/// use u_inversion::completion::{IterationCompletionCriteria, ProgressTrackingCompletionCriteria};
///
/// let tracker = ProgressTrackingCompletionCriteria::new(IterationCompletionCriteria::new(1000));
/// assert!(tracker.progress().is_empty());
/// ```
#[derive(Debug)]
pub struct ProgressTrackingCompletionCriteria {
    inner: Arc<dyn CompletionCriteria>,
    interval: Option<Duration>,
    history: Mutex<Vec<AnnealingProgress>>,
}

impl ProgressTrackingCompletionCriteria {
    pub fn new<C: CompletionCriteria + 'static>(inner: C) -> Self {
        Self::from_arc(Arc::new(inner))
    }

    pub fn from_arc(inner: Arc<dyn CompletionCriteria>) -> Self {
        Self {
            inner,
            interval: None,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Records at most one point per `interval` of run time.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn inner(&self) -> &Arc<dyn CompletionCriteria> {
        &self.inner
    }

    /// Copy of the recorded history.
    pub fn progress(&self) -> Vec<AnnealingProgress> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl CompletionCriteria for ProgressTrackingCompletionCriteria {
    fn is_satisfied(&self, state: &InversionState<'_>) -> bool {
        let satisfied = self.inner.is_satisfied(state);
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let due = match (self.interval, history.last()) {
            (Some(interval), Some(last)) => state.elapsed.saturating_sub(last.elapsed) >= interval,
            _ => true,
        };
        if satisfied || due {
            history.push(AnnealingProgress::from_state(state));
        }
        satisfied
    }

    /// Rebases the wrapped criteria; the rebased copy records nothing.
    fn for_start_iteration(&self, start_iteration: u64) -> Option<Arc<dyn CompletionCriteria>> {
        self.inner.for_start_iteration(start_iteration)
    }
}

impl fmt::Display for ProgressTrackingCompletionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (tracking progress)", self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anneal::InversionSnapshot;
    use crate::completion::IterationCompletionCriteria;

    fn snapshot(iterations: u64, elapsed_ms: u64) -> InversionSnapshot {
        InversionSnapshot {
            elapsed: Duration::from_millis(elapsed_ms),
            iterations,
            energy: vec![1.0, 1.0, 0.0, 0.0],
            perturbs_kept: iterations / 2,
            worse_values_kept: 0,
            num_non_zero: 1,
            best_solution: vec![1.0],
            best_misfit: vec![1.0],
            best_misfit_ineq: None,
            constraint_ranges: Vec::new(),
        }
    }

    #[test]
    fn test_records_every_check() {
        let tracker = ProgressTrackingCompletionCriteria::new(IterationCompletionCriteria::new(3));
        for i in 0..=3 {
            let done = tracker.is_satisfied(&snapshot(i, i).state());
            assert_eq!(done, i == 3);
        }
        let progress = tracker.progress();
        assert_eq!(progress.len(), 4);
        assert_eq!(progress[3].iterations, 3);
        assert_eq!(progress[2].perturbs_kept, 1);
    }

    #[test]
    fn test_interval_thins_history() {
        let tracker = ProgressTrackingCompletionCriteria::new(IterationCompletionCriteria::new(10))
            .with_interval(Duration::from_millis(5));
        for i in 0..=10 {
            tracker.is_satisfied(&snapshot(i, i).state());
        }
        let iterations: Vec<u64> = tracker.progress().iter().map(|p| p.iterations).collect();
        assert_eq!(iterations, vec![0, 5, 10]);
    }

    #[test]
    fn test_satisfied_state_always_recorded() {
        let tracker = ProgressTrackingCompletionCriteria::new(IterationCompletionCriteria::new(2))
            .with_interval(Duration::from_secs(60));
        tracker.is_satisfied(&snapshot(0, 0).state());
        tracker.is_satisfied(&snapshot(1, 1).state());
        tracker.is_satisfied(&snapshot(2, 2).state());
        assert_eq!(tracker.progress().len(), 2);
        tracker.clear();
        assert!(tracker.progress().is_empty());
    }
}
