//! Reweighting configuration.

use super::stats::Quantity;
use crate::error::{InversionError, Result};

/// Configuration of an [`AdaptiveReweighter`](super::AdaptiveReweighter).
///
/// # Examples
///
/// ```
/// use u_inversion::reweight::{Quantity, ReweightConfig};
///
/// let config = ReweightConfig::default()
///     .with_quantity(Quantity::Rmse)
///     .with_target_median(true);
/// assert!(config.validate().is_ok());
/// assert!(config.with_value_weighted_average(true).validate().is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReweightConfig {
    /// Statistic equalized across constraints.
    pub quantity: Quantity,

    /// One round never changes a weight by more than this factor.
    pub max_individual_factor: f64,

    /// A weight never leaves `[orig / f, orig · f]`, except downward through
    /// phase-out.
    pub max_total_factor: f64,

    /// Let constraints that are fit better than average even at tiny weights
    /// drop out of the target.
    pub phase_out: bool,

    /// Phase-out begins below `orig / phase_out_start_factor`.
    pub phase_out_start_factor: f64,

    /// Fully phased out at `orig / phase_out_end_factor`.
    pub phase_out_end_factor: f64,

    /// Above this target value every constraint reverts to its original
    /// weight.
    pub transition_upper: f64,

    /// Between this and `transition_upper`, calculated and original weights
    /// are blended linearly.
    pub transition_lower: f64,

    /// Keep `Σ rows · weight` over reweighted constraints at its original
    /// value.
    pub conserve_total_weight: bool,

    /// Target the median constraint value instead of the mean.
    pub target_median: bool,

    /// Use `sqrt(value) / sqrt(target)` as the adjustment ratio.
    pub sqrt_ratios: bool,

    /// Weight each constraint's value by its row count in the mean.
    pub value_weighted_average: bool,

    /// Every this many rounds the reweighted system is rebuilt from the
    /// original one instead of the previous round's. 0 disables.
    pub drift_correction_rounds: usize,
}

impl Default for ReweightConfig {
    fn default() -> Self {
        Self {
            quantity: Quantity::default(),
            max_individual_factor: 2.0,
            max_total_factor: 100.0,
            phase_out: true,
            phase_out_start_factor: 50.0,
            phase_out_end_factor: 100.0,
            transition_upper: f64::INFINITY,
            transition_lower: f64::INFINITY,
            conserve_total_weight: true,
            target_median: false,
            sqrt_ratios: true,
            value_weighted_average: false,
            drift_correction_rounds: 100,
        }
    }
}

impl ReweightConfig {
    pub fn with_quantity(mut self, quantity: Quantity) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn with_max_individual_factor(mut self, factor: f64) -> Self {
        self.max_individual_factor = factor;
        self
    }

    pub fn with_max_total_factor(mut self, factor: f64) -> Self {
        self.max_total_factor = factor;
        self
    }

    pub fn with_phase_out(mut self, enabled: bool) -> Self {
        self.phase_out = enabled;
        self
    }

    pub fn with_phase_out_factors(mut self, start: f64, end: f64) -> Self {
        self.phase_out_start_factor = start;
        self.phase_out_end_factor = end;
        self
    }

    pub fn with_transition(mut self, lower: f64, upper: f64) -> Self {
        self.transition_lower = lower;
        self.transition_upper = upper;
        self
    }

    pub fn with_conserve_total_weight(mut self, conserve: bool) -> Self {
        self.conserve_total_weight = conserve;
        self
    }

    pub fn with_target_median(mut self, median: bool) -> Self {
        self.target_median = median;
        self
    }

    pub fn with_sqrt_ratios(mut self, sqrt: bool) -> Self {
        self.sqrt_ratios = sqrt;
        self
    }

    pub fn with_value_weighted_average(mut self, weighted: bool) -> Self {
        self.value_weighted_average = weighted;
        self
    }

    pub fn with_drift_correction_rounds(mut self, rounds: usize) -> Self {
        self.drift_correction_rounds = rounds;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if !(self.max_individual_factor.is_finite() && self.max_individual_factor >= 1.0) {
            return Err(InversionError::InvalidConfig(format!(
                "max_individual_factor must be at least 1, got {}",
                self.max_individual_factor
            )));
        }
        if !(self.max_total_factor.is_finite() && self.max_total_factor >= 1.0) {
            return Err(InversionError::InvalidConfig(format!(
                "max_total_factor must be at least 1, got {}",
                self.max_total_factor
            )));
        }
        if self.phase_out
            && !(self.phase_out_start_factor > 1.0
                && self.phase_out_start_factor.is_finite()
                && self.phase_out_end_factor > self.phase_out_start_factor
                && self.phase_out_end_factor.is_finite())
        {
            return Err(InversionError::InvalidConfig(format!(
                "phase-out factors must satisfy 1 < start < end, got start={}, end={}",
                self.phase_out_start_factor, self.phase_out_end_factor
            )));
        }
        if self.transition_lower.is_nan()
            || self.transition_upper.is_nan()
            || self.transition_lower > self.transition_upper
        {
            return Err(InversionError::InvalidConfig(format!(
                "transition bounds must satisfy lower <= upper, got lower={}, upper={}",
                self.transition_lower, self.transition_upper
            )));
        }
        if self.target_median && self.value_weighted_average {
            return Err(InversionError::InvalidConfig(
                "median target cannot be combined with a value-weighted average".into(),
            ));
        }
        Ok(())
    }
}
