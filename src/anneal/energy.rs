//! Misfit and energy kernels.
//!
//! The energy vector is laid out as
//! `[total, equality, entropy, inequality, per-range...]`; see the `E_*`
//! index constants.

use crate::data::{ColumnOrganizedData, ConstraintRange};
use crate::error::{InversionError, Result};

/// Index of the total energy.
pub const E_TOTAL: usize = 0;
/// Index of the equality-system energy.
pub const E_EQUALITY: usize = 1;
/// Index of the entropy (smoothness) energy.
pub const E_ENTROPY: usize = 2;
/// Index of the inequality-system energy.
pub const E_INEQUALITY: usize = 3;
/// Number of fixed entries before the per-range energies.
pub const E_FIXED_LEN: usize = 4;

/// Scale applied to each solution value inside the entropy sum.
pub const ENTROPY_CONSTANT: f64 = 500.0;

/// Writes `A·x − d` into `misfit`.
///
/// This is a full product and is never used inside the annealing loop.
pub fn calculate_misfit(data: &ColumnOrganizedData, solution: &[f64], misfit: &mut [f64]) {
    data.misfit_into(solution, misfit);
}

/// Applies a perturbation of column `col` to `misfit` in place and returns
/// the resulting change of that system's energy.
///
/// Only the nonzero rows of the column are read or written. For the
/// inequality system only positive misfits contribute energy.
#[inline]
pub fn update_misfits_delta(
    data: &ColumnOrganizedData,
    misfit: &mut [f64],
    col: usize,
    perturbation: f64,
    inequality: bool,
) -> f64 {
    let mut prev = 0.0;
    let mut next = 0.0;
    for (&row, &a) in data.rows(col).iter().zip(data.values(col)) {
        let old = misfit[row];
        let new = a.mul_add(perturbation, old);
        misfit[row] = new;
        if inequality {
            if old > 0.0 {
                prev = old.mul_add(old, prev);
            }
            if new > 0.0 {
                next = new.mul_add(new, next);
            }
        } else {
            prev = old.mul_add(old, prev);
            next = new.mul_add(new, next);
        }
    }
    next - prev
}

/// Entropy-maximization energy `w / S` with `S = −Σ k·x·ln(k·x)` over `x > 0`.
///
/// # Errors
/// Negative accumulated entropy, or a non-finite result.
pub fn entropy_energy(solution: &[f64], weight: f64) -> Result<f64> {
    let mut total = 0.0;
    for &x in solution {
        if x > 0.0 {
            let kx = ENTROPY_CONSTANT * x;
            total -= kx * kx.ln();
        }
    }
    if total == 0.0 {
        tracing::warn!("total entropy is zero, substituting 1e-4");
        total = 0.0001;
    }
    if total < 0.0 {
        return Err(InversionError::NegativeEntropy(total));
    }
    let energy = weight * (1.0 / total);
    if energy.is_nan() {
        return Err(InversionError::NonFiniteEnergy {
            component: "entropy",
            value: energy,
        });
    }
    Ok(energy)
}

/// Computes the full energy vector into `out`.
///
/// `out` is resized to `4 + ranges.len()`. Each range accumulates the squared
/// misfits of its rows in the system it belongs to.
///
/// # Errors
/// Any component evaluates to NaN, or entropy is negative.
pub fn calculate_energy_into(
    out: &mut Vec<f64>,
    solution: &[f64],
    misfit: &[f64],
    misfit_ineq: Option<&[f64]>,
    ranges: &[ConstraintRange],
    smoothness_weight: f64,
) -> Result<()> {
    out.clear();
    out.resize(E_FIXED_LEN + ranges.len(), 0.0);

    let mut eq = 0.0;
    if ranges.is_empty() {
        for &m in misfit {
            eq = m.mul_add(m, eq);
        }
    } else {
        for (row, &m) in misfit.iter().enumerate() {
            let val = m * m;
            eq += val;
            for (j, range) in ranges.iter().enumerate() {
                if range.contains(row, false) {
                    out[E_FIXED_LEN + j] += val;
                }
            }
        }
    }
    if eq.is_nan() {
        return Err(InversionError::NonFiniteEnergy {
            component: "equality constraints",
            value: eq,
        });
    }
    out[E_EQUALITY] = eq;

    let mut entropy = 0.0;
    if smoothness_weight > 0.0 {
        entropy = entropy_energy(solution, smoothness_weight)?;
        out[E_ENTROPY] = entropy;
    }

    let mut ineq = 0.0;
    if let Some(misfit_ineq) = misfit_ineq {
        for (row, &m) in misfit_ineq.iter().enumerate() {
            if m > 0.0 {
                let val = m * m;
                ineq += val;
                for (j, range) in ranges.iter().enumerate() {
                    if range.contains(row, true) {
                        out[E_FIXED_LEN + j] += val;
                    }
                }
            }
        }
        if ineq.is_nan() {
            return Err(InversionError::NonFiniteEnergy {
                component: "inequality constraints",
                value: ineq,
            });
        }
        out[E_INEQUALITY] = ineq;
    }

    let total = eq + entropy + ineq;
    if total.is_nan() {
        return Err(InversionError::NonFiniteEnergy {
            component: "total",
            value: total,
        });
    }
    out[E_TOTAL] = total;
    Ok(())
}

/// Allocating form of [`calculate_energy_into`].
pub fn calculate_energy(
    solution: &[f64],
    misfit: &[f64],
    misfit_ineq: Option<&[f64]>,
    ranges: &[ConstraintRange],
    smoothness_weight: f64,
) -> Result<Vec<f64>> {
    let mut out = Vec::with_capacity(E_FIXED_LEN + ranges.len());
    calculate_energy_into(
        &mut out,
        solution,
        misfit,
        misfit_ineq,
        ranges,
        smoothness_weight,
    )?;
    Ok(out)
}
