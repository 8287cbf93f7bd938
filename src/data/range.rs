//! Named row blocks of the linear system.

use crate::error::{InversionError, Result};
use std::fmt;

/// How a constraint's rows were weighted when the system was built.
///
/// Only [`NormalizedByUncertainty`](Self::NormalizedByUncertainty) ranges
/// take part in adaptive reweighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConstraintWeightingType {
    /// Rows carry the raw constraint values.
    #[default]
    Unnormalized,
    /// Rows were divided by the constraint's data magnitude.
    Normalized,
    /// Rows were divided by the per-row data uncertainty.
    NormalizedByUncertainty,
}

/// A contiguous block `[start_row, end_row)` of either the equality or the
/// inequality system.
///
/// Values are immutable; reweighting produces a new range through
/// [`with_weight`](Self::with_weight).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConstraintRange {
    name: String,
    short_name: String,
    start_row: usize,
    end_row: usize,
    inequality: bool,
    weight: f64,
    weighting_type: ConstraintWeightingType,
}

impl ConstraintRange {
    /// Creates an unweighted range (`weight = 1`, [`ConstraintWeightingType::Unnormalized`]).
    ///
    /// # Errors
    /// Fails unless `start_row < end_row`.
    pub fn new(
        name: impl Into<String>,
        short_name: impl Into<String>,
        start_row: usize,
        end_row: usize,
        inequality: bool,
    ) -> Result<Self> {
        let name = name.into();
        if start_row >= end_row {
            return Err(InversionError::InvalidRange {
                name,
                start: start_row,
                end: end_row,
            });
        }
        Ok(Self {
            name,
            short_name: short_name.into(),
            start_row,
            end_row,
            inequality,
            weight: 1.0,
            weighting_type: ConstraintWeightingType::Unnormalized,
        })
    }

    /// Returns a copy carrying `weight`.
    pub fn with_weight(&self, weight: f64) -> Self {
        Self {
            weight,
            ..self.clone()
        }
    }

    pub fn with_weighting_type(mut self, weighting_type: ConstraintWeightingType) -> Self {
        self.weighting_type = weighting_type;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn start_row(&self) -> usize {
        self.start_row
    }

    /// Exclusive end row.
    pub fn end_row(&self) -> usize {
        self.end_row
    }

    pub fn is_inequality(&self) -> bool {
        self.inequality
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn weighting_type(&self) -> ConstraintWeightingType {
        self.weighting_type
    }

    pub fn num_rows(&self) -> usize {
        self.end_row - self.start_row
    }

    /// True if `row` of the system selected by `inequality` lies in this range.
    #[inline]
    pub fn contains(&self, row: usize, inequality: bool) -> bool {
        self.inequality == inequality && row >= self.start_row && row < self.end_row
    }

    /// Row span as a `Range`.
    pub fn rows(&self) -> std::ops::Range<usize> {
        self.start_row..self.end_row
    }
}

/// Fails if any range lies outside its system, or names an inequality
/// system that does not exist.
pub(crate) fn check_ranges(
    ranges: &[ConstraintRange],
    eq_rows: usize,
    ineq_rows: Option<usize>,
) -> Result<()> {
    for range in ranges {
        let rows = if range.inequality {
            ineq_rows.ok_or(InversionError::MissingInput("inequality system for inequality range"))?
        } else {
            eq_rows
        };
        if range.end_row > rows {
            return Err(InversionError::InvalidRange {
                name: range.name.clone(),
                start: range.start_row,
                end: range.end_row,
            });
        }
    }
    Ok(())
}

impl fmt::Display for ConstraintRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): rows [{}, {}) {}, weight={}",
            self.name,
            self.short_name,
            self.start_row,
            self.end_row,
            if self.inequality { "inequality" } else { "equality" },
            self.weight
        )
    }
}
