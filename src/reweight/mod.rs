//! Adaptive reweighting of uncertainty-normalized constraints.
//!
//! An [`AdaptiveReweighter`] wraps a
//! [`ParallelCoordinator`](crate::parallel::ParallelCoordinator) and, before
//! each round after the first, moves every
//! [`NormalizedByUncertainty`](crate::data::ConstraintWeightingType::NormalizedByUncertainty)
//! constraint's weight towards an even fit:
//!
//! 1. A [`Quantity`] of each constraint's weight-normalized misfits is compared
//!    with a target (mean or median across constraints)
//! 2. The weight moves by the square root of the ratio, bounded per round
//!    and overall
//! 3. Total weight is optionally conserved
//! 4. The systems are row-scaled and the best solution re-evaluated
//!
//! Constraints that fit well even at very small weights are phased out of
//! the target rather than pushed further down.

mod config;
mod runner;
mod stats;

pub use config::ReweightConfig;
pub use runner::{AdaptiveReweighter, ReweightProgress};
pub use stats::{median, weighted_median, MisfitStats, Quantity};
