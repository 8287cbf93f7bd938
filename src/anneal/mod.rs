//! Simulated annealing over a nonnegative sparse least-squares system.
//!
//! The energy of a solution `x` is `‖Ax − d‖² + w/S(x) + Σ max(0, A'x − d')²`,
//! where the entropy term `w/S(x)` is optional and the last term penalizes
//! violated inequality rows.
//!
//! # Algorithm
//!
//! Each iteration:
//! 1. Picks one variable through a [`ColumnSampler`]
//! 2. Draws a perturbation under the configured [`NonnegativityConstraint`]
//! 3. Updates only the misfit rows touched by that column
//! 4. Accepts or rejects with the Metropolis rule at the current temperature
//!
//! Misfit vectors live in a small ring of reusable buffers so that neither
//! proposals nor rollbacks copy full vectors.
//!
//! # References
//!
//! Kirkpatrick, S., Gelatt, C.D. & Vecchi, M.P. (1983). "Optimization by
//! Simulated Annealing", *Science* 220(4598), 671-680.

mod config;
pub mod energy;
mod ring;
mod runner;
mod sampler;
mod state;
mod types;

pub use config::{AnnealConfig, CoolingSchedule, NonnegativityConstraint, PerturbationFunction};
pub use runner::AnnealingCore;
pub use sampler::{ColumnSampler, DiscreteSampler, UniformSampler};
pub use state::{InversionSnapshot, InversionState};
pub use types::{count_non_zero, BestResults, SimulatedAnnealing};
