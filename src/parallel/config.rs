//! Parallel coordinator configuration.

/// Configuration of a [`ParallelCoordinator`](super::ParallelCoordinator).
///
/// # Examples
///
/// ```
/// use u_inversion::parallel::ParallelConfig;
///
/// let config = ParallelConfig::default().with_average(true).with_seed(7);
/// assert!(config.average);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParallelConfig {
    /// Reconcile rounds by averaging every replica instead of adopting the
    /// lowest-energy one.
    pub average: bool,

    /// Restart each replica's iteration counter at zero every round. The
    /// coordinator's own count keeps growing either way.
    pub start_sub_iterations_at_zero: bool,

    /// Log a line at `info` level after every round.
    pub verbose: bool,

    /// Top-level seed from which every replica's seed is derived.
    pub seed: Option<u64>,
}

impl ParallelConfig {
    pub fn with_average(mut self, average: bool) -> Self {
        self.average = average;
        self
    }

    pub fn with_start_sub_iterations_at_zero(mut self, at_zero: bool) -> Self {
        self.start_sub_iterations_at_zero = at_zero;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}
