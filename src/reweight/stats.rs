//! Summary statistics of a constraint's misfits.

use std::fmt;

/// Misfit statistic that reweighting tries to equalize across constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Quantity {
    Mean,
    /// Mean absolute misfit. Robust to outliers.
    #[default]
    Mad,
    Median,
    Min,
    Max,
    /// Sample standard deviation. Ignores net bias.
    StdDev,
    /// Root mean square.
    Rmse,
    /// Euclidean norm.
    L2Norm,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Quantity::Mean => "mean",
            Quantity::Mad => "MAD",
            Quantity::Median => "median",
            Quantity::Min => "min",
            Quantity::Max => "max",
            Quantity::StdDev => "std. dev.",
            Quantity::Rmse => "RMSE",
            Quantity::L2Norm => "L2 norm",
        };
        f.write_str(s)
    }
}

/// Statistics over one constraint's misfits.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MisfitStats {
    pub name: String,
    pub num_rows: usize,
    pub inequality: bool,
    pub mean: f64,
    pub mad: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    pub rmse: f64,
    pub l2_norm: f64,
}

impl MisfitStats {
    /// Computes statistics over `misfits`. Inequality misfits are clipped at
    /// zero first, since satisfied rows carry no misfit.
    pub fn new(name: impl Into<String>, misfits: &[f64], inequality: bool) -> Self {
        let values: Vec<f64> = if inequality {
            misfits.iter().map(|&m| m.max(0.0)).collect()
        } else {
            misfits.to_vec()
        };
        let n = values.len();
        if n == 0 {
            return Self {
                name: name.into(),
                num_rows: 0,
                inequality,
                mean: 0.0,
                mad: 0.0,
                median: 0.0,
                min: 0.0,
                max: 0.0,
                std_dev: 0.0,
                rmse: 0.0,
                l2_norm: 0.0,
            };
        }

        let nf = n as f64;
        let sum: f64 = values.iter().sum();
        let abs_sum: f64 = values.iter().map(|v| v.abs()).sum();
        let sq_sum: f64 = values.iter().map(|v| v * v).sum();
        let mean = sum / nf;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let std_dev = if n > 1 {
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (nf - 1.0);
            var.sqrt()
        } else {
            0.0
        };

        Self {
            name: name.into(),
            num_rows: n,
            inequality,
            mean,
            mad: abs_sum / nf,
            median: median(&values),
            min,
            max,
            std_dev,
            rmse: (sq_sum / nf).sqrt(),
            l2_norm: sq_sum.sqrt(),
        }
    }

    pub fn get(&self, quantity: Quantity) -> f64 {
        match quantity {
            Quantity::Mean => self.mean,
            Quantity::Mad => self.mad,
            Quantity::Median => self.median,
            Quantity::Min => self.min,
            Quantity::Max => self.max,
            Quantity::StdDev => self.std_dev,
            Quantity::Rmse => self.rmse,
            Quantity::L2Norm => self.l2_norm,
        }
    }
}

/// Median, averaging the two middle values for an even count. `NaN` if
/// empty.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        0.5 * (sorted[mid - 1] + sorted[mid])
    } else {
        sorted[mid]
    }
}

/// Median of `values` where each carries a nonnegative weight.
///
/// Cumulative normalized weight is interpolated linearly between
/// neighbouring sorted values at one half. Zero-weight values are ignored.
/// `None` if every weight is zero.
pub fn weighted_median(values: &[f64], weights: &[f64]) -> Option<f64> {
    let mut pairs: Vec<(f64, f64)> = values
        .iter()
        .zip(weights)
        .filter(|&(_, &w)| w > 0.0)
        .map(|(&v, &w)| (v, w))
        .collect();
    let total: f64 = pairs.iter().map(|p| p.1).sum();
    if pairs.is_empty() || total <= 0.0 {
        return None;
    }
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut cumulative = 0.0;
    let mut prev: Option<(f64, f64)> = None;
    for &(value, weight) in &pairs {
        let next = cumulative + weight / total;
        if next >= 0.5 {
            return Some(match prev {
                Some((prev_cum, prev_value)) if next > prev_cum => {
                    let fract = (0.5 - prev_cum) / (next - prev_cum);
                    prev_value + fract * (value - prev_value)
                }
                _ => value,
            });
        }
        cumulative = next;
        prev = Some((cumulative, value));
    }
    pairs.last().map(|p| p.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_basic() {
        let s = MisfitStats::new("a", &[-1.0, 1.0, 2.0, -2.0], false);
        assert_eq!(s.num_rows, 4);
        assert_eq!(s.mean, 0.0);
        assert_eq!(s.mad, 1.5);
        assert_eq!(s.median, 0.0);
        assert_eq!(s.min, -2.0);
        assert_eq!(s.max, 2.0);
        assert!((s.rmse - 2.5f64.sqrt()).abs() < 1e-15);
        assert!((s.l2_norm - 10f64.sqrt()).abs() < 1e-15);
        // sample variance 10 / 3
        assert!((s.std_dev - (10.0f64 / 3.0).sqrt()).abs() < 1e-15);
        assert_eq!(s.get(Quantity::Mad), 1.5);
    }

    #[test]
    fn test_inequality_clipped() {
        let s = MisfitStats::new("b", &[-3.0, 1.0], true);
        assert_eq!(s.min, 0.0);
        assert_eq!(s.mad, 0.5);
    }

    #[test]
    fn test_single_value_std_dev_zero() {
        let s = MisfitStats::new("c", &[4.0], false);
        assert_eq!(s.std_dev, 0.0);
        assert_eq!(s.median, 4.0);
    }

    #[test]
    fn test_median_odd_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
        assert!(median(&[]).is_nan());
    }

    #[test]
    fn test_weighted_median() {
        // equal weights on two values: halfway is reached exactly at the first
        assert_eq!(weighted_median(&[1.0, 3.0], &[1.0, 1.0]), Some(1.0));
        // first value has 1/4 of the weight: interpolate a third of the way
        let m = weighted_median(&[1.0, 4.0], &[1.0, 3.0]).unwrap();
        assert!((m - 2.0).abs() < 1e-12);
        // zero weights ignored
        assert_eq!(weighted_median(&[100.0, 2.0], &[0.0, 1.0]), Some(2.0));
        assert_eq!(weighted_median(&[1.0], &[0.0]), None);
    }
}
