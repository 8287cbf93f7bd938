//! Linear-system inputs.
//!
//! A [`SparseLinearSystem`] is compressed once into a
//! [`ColumnOrganizedData`], which every annealing replica shares read-only.
//! [`ConstraintRange`]s name row blocks for per-constraint energies and
//! reweighting.

mod column;
mod range;
mod system;

pub use column::ColumnOrganizedData;
pub(crate) use range::check_ranges;
pub use range::{ConstraintRange, ConstraintWeightingType};
pub use system::SparseLinearSystem;
