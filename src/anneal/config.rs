//! Annealing configuration: cooling schedules, perturbation generation and
//! nonnegativity policies.

use crate::error::{InversionError, Result};
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;

/// Temperature as a function of the (1-based, slowdown-adjusted) iteration.
///
/// # References
///
/// - Classical: Geman & Geman (1984)
/// - Fast: Szu & Hartley (1987)
/// - VeryFast: Ingber (1989)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CoolingSchedule {
    /// `T = 1 / ln(i + 1)`. Slow but convergent.
    Classical,
    /// `T = 1 / i`.
    #[default]
    Fast,
    /// `T = exp(-(i - 1))`. Zero to machine precision after a few hundred iterations.
    VeryFast,
    /// `T = 1 - i / horizon`. Negative past the horizon, where every move is
    /// accepted.
    Linear {
        /// Iteration at which the temperature reaches zero.
        horizon: f64,
    },
}

impl CoolingSchedule {
    /// Default horizon of [`CoolingSchedule::Linear`].
    pub const LINEAR_DEFAULT_HORIZON: f64 = 100_000.0;

    /// Linear schedule with the default horizon.
    pub fn linear() -> Self {
        CoolingSchedule::Linear {
            horizon: Self::LINEAR_DEFAULT_HORIZON,
        }
    }

    /// Temperature at cooling iteration `cool_iter`.
    #[inline]
    pub fn temperature(&self, cool_iter: f64) -> f64 {
        match *self {
            CoolingSchedule::Classical => 1.0 / (cool_iter + 1.0).ln(),
            CoolingSchedule::Fast => 1.0 / cool_iter,
            CoolingSchedule::VeryFast => (-(cool_iter - 1.0)).exp(),
            CoolingSchedule::Linear { horizon } => 1.0 - cool_iter / horizon,
        }
    }
}

/// How a perturbation is drawn for the selected variable.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PerturbationFunction {
    /// `(u - 0.5) · 0.001`.
    UniformNoTempDependence,
    /// `(u - 0.5) · width`, independent of temperature.
    Uniform { width: f64 },
    /// `(u - 0.5) · basis[i] · 1000`, with a zero basis replaced by `1e-8`.
    ///
    /// Requires a perturbation basis of one entry per variable.
    VariableNoTempDependence,
    /// `T^-½ · N(0, 1) · 1e-4 · exp(1 / 2T)`.
    Gaussian,
    /// `T · 1e-3 · tan(πu − π/2)`.
    Tangent,
    /// `sign(u − ½) · T · 1e-3 · ((1 + 1/T)^|2u − 1| − 1)`.
    PowerLaw,
    /// `10^u · T · 1e-3`. Always positive.
    Exponential,
    /// A unit step of random sign. For deterministic tests only.
    FixedDebug,
}

impl Default for PerturbationFunction {
    fn default() -> Self {
        PerturbationFunction::Uniform { width: 0.0001 }
    }
}

impl PerturbationFunction {
    /// Whether this function reads a per-variable perturbation basis.
    pub fn needs_basis(&self) -> bool {
        matches!(self, PerturbationFunction::VariableNoTempDependence)
    }

    /// Draws one perturbation at temperature `t`.
    ///
    /// `basis` is the selected variable's perturbation basis, if any.
    #[inline]
    pub fn perturbation<R: Rng + ?Sized>(&self, rng: &mut R, t: f64, basis: Option<f64>) -> f64 {
        match *self {
            PerturbationFunction::UniformNoTempDependence => (rng.random::<f64>() - 0.5) * 0.001,
            PerturbationFunction::Uniform { width } => (rng.random::<f64>() - 0.5) * width,
            PerturbationFunction::VariableNoTempDependence => {
                let basis = match basis {
                    Some(b) if b != 0.0 => b,
                    _ => 1e-8,
                };
                (rng.random::<f64>() - 0.5) * basis * 1000.0
            }
            PerturbationFunction::Gaussian => {
                let z: f64 = rng.sample(StandardNormal);
                (1.0 / t.sqrt()) * z * 0.0001 * (1.0 / (2.0 * t)).exp()
            }
            PerturbationFunction::Tangent => {
                t * 0.001 * (PI * rng.random::<f64>() - PI / 2.0).tan()
            }
            PerturbationFunction::PowerLaw => {
                let u = rng.random::<f64>();
                (u - 0.5).signum() * t * 0.001 * ((1.0 + 1.0 / t).powf((2.0 * u - 1.0).abs()) - 1.0)
            }
            PerturbationFunction::Exponential => 10f64.powf(rng.random::<f64>()) * t * 0.001,
            PerturbationFunction::FixedDebug => {
                if rng.random::<bool>() {
                    1.0
                } else {
                    -1.0
                }
            }
        }
    }
}

/// Policy keeping every solution entry nonnegative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NonnegativityConstraint {
    /// Zero entries are redrawn until positive; nonzero entries that would go
    /// negative are clamped to exactly zero. Produces many zeros.
    TryZeroRatesOften,
    /// Redraw until the result is nonnegative. Produces few zeros.
    #[default]
    LimitZeroRates,
    /// Nonzero entries move uniformly within `[0, 2x)`; zero entries get a
    /// tiny positive nudge that is always accepted.
    PreventZeroRates,
}

impl NonnegativityConstraint {
    /// Draws a perturbation for `value` that respects this policy.
    #[inline]
    pub fn constrained_perturbation<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        func: &PerturbationFunction,
        t: f64,
        value: f64,
        basis: Option<f64>,
    ) -> f64 {
        match self {
            NonnegativityConstraint::TryZeroRatesOften => {
                let mut perturb = func.perturbation(rng, t, basis);
                if value == 0.0 {
                    while value + perturb < 0.0 {
                        perturb = func.perturbation(rng, t, basis);
                    }
                } else if value + perturb < 0.0 {
                    perturb = -value;
                }
                perturb
            }
            NonnegativityConstraint::LimitZeroRates => {
                let mut perturb = func.perturbation(rng, t, basis);
                while value + perturb < 0.0 {
                    perturb = func.perturbation(rng, t, basis);
                }
                perturb
            }
            NonnegativityConstraint::PreventZeroRates => {
                if value == 0.0 {
                    rng.random::<f64>() * 1e-8
                } else {
                    (rng.random::<f64>() - 0.5) * 2.0 * value
                }
            }
        }
    }
}

/// Configuration of a single annealing replica.
///
/// # Examples
///
/// ```
/// use u_inversion::anneal::{AnnealConfig, CoolingSchedule, NonnegativityConstraint};
///
/// let config = AnnealConfig::default()
///     .with_cooling(CoolingSchedule::Classical)
///     .with_nonnegativity(NonnegativityConstraint::TryZeroRatesOften)
///     .with_seed(42);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AnnealConfig {
    /// Cooling schedule.
    pub cooling: CoolingSchedule,

    /// Divisor applied to the iteration count before cooling. 1 = no slowdown.
    pub cooling_slowdown: f64,

    /// Nonnegativity policy.
    pub nonnegativity: NonnegativityConstraint,

    /// Perturbation generation function.
    pub perturbation: PerturbationFunction,

    /// Use incremental energy deltas instead of full recomputation when valid.
    pub energy_shortcut: bool,

    /// Number of preallocated misfit buffers. At least 2.
    pub buffer_ring_size: usize,

    /// Multiplies energy changes in the Metropolis exponent. Smaller values
    /// take more uphill moves.
    pub energy_scale: f64,

    /// Expose every accepted state as the best one.
    pub keep_current_as_best: bool,

    /// Random seed for reproducibility.
    pub seed: Option<u64>,
}

impl Default for AnnealConfig {
    fn default() -> Self {
        Self {
            cooling: CoolingSchedule::default(),
            cooling_slowdown: 1.0,
            nonnegativity: NonnegativityConstraint::default(),
            perturbation: PerturbationFunction::default(),
            energy_shortcut: true,
            buffer_ring_size: 3,
            energy_scale: 1.0,
            keep_current_as_best: false,
            seed: None,
        }
    }
}

impl AnnealConfig {
    pub fn with_cooling(mut self, cooling: CoolingSchedule) -> Self {
        self.cooling = cooling;
        self
    }

    pub fn with_cooling_slowdown(mut self, slowdown: f64) -> Self {
        self.cooling_slowdown = slowdown;
        self
    }

    pub fn with_nonnegativity(mut self, policy: NonnegativityConstraint) -> Self {
        self.nonnegativity = policy;
        self
    }

    pub fn with_perturbation(mut self, func: PerturbationFunction) -> Self {
        self.perturbation = func;
        self
    }

    pub fn with_energy_shortcut(mut self, enabled: bool) -> Self {
        self.energy_shortcut = enabled;
        self
    }

    pub fn with_buffer_ring_size(mut self, size: usize) -> Self {
        self.buffer_ring_size = size;
        self
    }

    pub fn with_energy_scale(mut self, scale: f64) -> Self {
        self.energy_scale = scale;
        self
    }

    pub fn with_keep_current_as_best(mut self, keep: bool) -> Self {
        self.keep_current_as_best = keep;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Temperature for the 1-based iteration `iter`.
    #[inline]
    pub fn temperature(&self, iter: u64) -> f64 {
        let cool_iter = if self.cooling_slowdown != 1.0 {
            (iter as f64 - 1.0) / self.cooling_slowdown + 1.0
        } else {
            iter as f64
        };
        self.cooling.temperature(cool_iter)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if !(self.cooling_slowdown.is_finite() && self.cooling_slowdown > 0.0) {
            return Err(InversionError::InvalidConfig(format!(
                "cooling_slowdown must be positive, got {}",
                self.cooling_slowdown
            )));
        }
        if let CoolingSchedule::Linear { horizon } = self.cooling {
            if !(horizon.is_finite() && horizon > 0.0) {
                return Err(InversionError::InvalidConfig(format!(
                    "linear cooling horizon must be positive, got {horizon}"
                )));
            }
        }
        if let PerturbationFunction::Uniform { width } = self.perturbation {
            if !(width.is_finite() && width > 0.0) {
                return Err(InversionError::InvalidConfig(format!(
                    "uniform perturbation width must be positive, got {width}"
                )));
            }
        }
        if self.buffer_ring_size < 2 {
            return Err(InversionError::InvalidConfig(format!(
                "buffer_ring_size must be at least 2, got {}",
                self.buffer_ring_size
            )));
        }
        if !(self.energy_scale.is_finite() && self.energy_scale > 0.0) {
            return Err(InversionError::InvalidConfig(format!(
                "energy_scale must be positive, got {}",
                self.energy_scale
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_default_config() {
        let config = AnnealConfig::default();
        assert_eq!(config.cooling, CoolingSchedule::Fast);
        assert_eq!(config.nonnegativity, NonnegativityConstraint::LimitZeroRates);
        assert_eq!(config.buffer_ring_size, 3);
        assert!(config.energy_shortcut);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cooling_formulas() {
        assert!((CoolingSchedule::Fast.temperature(4.0) - 0.25).abs() < 1e-15);
        assert!((CoolingSchedule::Classical.temperature(1.0) - 1.0 / 2f64.ln()).abs() < 1e-15);
        assert!((CoolingSchedule::VeryFast.temperature(1.0) - 1.0).abs() < 1e-15);
        assert!((CoolingSchedule::linear().temperature(50_000.0) - 0.5).abs() < 1e-15);
        assert!(CoolingSchedule::linear().temperature(200_000.0) < 0.0);
    }

    #[test]
    fn test_slowdown_rescales_iteration() {
        let config = AnnealConfig::default().with_cooling_slowdown(10.0);
        // (11 - 1) / 10 + 1 = 2
        assert!((config.temperature(11) - 0.5).abs() < 1e-15);
        assert!((config.temperature(1) - 1.0).abs() < 1e-15);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(AnnealConfig::default().with_cooling_slowdown(0.0).validate().is_err());
        assert!(AnnealConfig::default().with_buffer_ring_size(1).validate().is_err());
        assert!(AnnealConfig::default().with_energy_scale(-1.0).validate().is_err());
        assert!(AnnealConfig::default()
            .with_cooling(CoolingSchedule::Linear { horizon: 0.0 })
            .validate()
            .is_err());
        assert!(AnnealConfig::default()
            .with_perturbation(PerturbationFunction::Uniform { width: 0.0 })
            .validate()
            .is_err());
    }

    #[test]
    fn test_uniform_width_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        let f = PerturbationFunction::Uniform { width: 0.01 };
        for _ in 0..1000 {
            let p = f.perturbation(&mut rng, 1.0, None);
            assert!(p.abs() <= 0.005);
        }
    }

    #[test]
    fn test_fixed_debug_is_unit() {
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..100 {
            let p = PerturbationFunction::FixedDebug.perturbation(&mut rng, 0.1, None);
            assert!(p == 1.0 || p == -1.0);
        }
    }

    #[test]
    fn test_exponential_positive() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            assert!(PerturbationFunction::Exponential.perturbation(&mut rng, 0.5, None) > 0.0);
        }
    }

    #[test]
    fn test_variable_basis_zero_fallback() {
        let mut rng = StdRng::seed_from_u64(4);
        let f = PerturbationFunction::VariableNoTempDependence;
        assert!(f.needs_basis());
        for _ in 0..100 {
            assert!(f.perturbation(&mut rng, 1.0, Some(0.0)).abs() <= 0.5e-5);
        }
    }

    #[test]
    fn test_nonnegativity_policies() {
        let mut rng = StdRng::seed_from_u64(5);
        let f = PerturbationFunction::FixedDebug;
        for _ in 0..200 {
            let p = NonnegativityConstraint::LimitZeroRates
                .constrained_perturbation(&mut rng, &f, 1.0, 0.0, None);
            assert_eq!(p, 1.0);

            let p = NonnegativityConstraint::TryZeroRatesOften
                .constrained_perturbation(&mut rng, &f, 1.0, 0.5, None);
            assert!(p == 1.0 || p == -0.5);

            let p = NonnegativityConstraint::PreventZeroRates
                .constrained_perturbation(&mut rng, &f, 1.0, 2.0, None);
            assert!(2.0 + p >= 0.0 && 2.0 + p < 4.0);

            let p = NonnegativityConstraint::PreventZeroRates
                .constrained_perturbation(&mut rng, &f, 1.0, 0.0, None);
            assert!((0.0..1e-8).contains(&p));
        }
    }
}
