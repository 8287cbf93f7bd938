//! Nonnegative sparse least-squares inversion by simulated annealing.
//!
//! Fits `A·x ≈ d` with `x ≥ 0`, optionally subject to inequality rows
//! `A'·x ≤ d'` and an entropy smoothness penalty:
//!
//! - **Data**: [`data::SparseLinearSystem`] inputs compressed into a
//!   column-organized form for incremental misfit updates.
//! - **Annealing**: [`anneal::AnnealingCore`], a single-threaded Metropolis
//!   loop with pluggable cooling, perturbation and nonnegativity policies.
//! - **Completion**: [`completion`] criteria on iterations, time or energy.
//! - **Parallel**: [`parallel::ParallelCoordinator`] runs replicas on a rayon
//!   pool and reconciles them in rounds (best-of or average).
//! - **Reweighting**: [`reweight::AdaptiveReweighter`] adjusts
//!   uncertainty-weighted constraint weights between rounds.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use u_inversion::anneal::{AnnealConfig, AnnealingCore, SimulatedAnnealing};
//! use u_inversion::data::{ColumnOrganizedData, SparseLinearSystem};
//!
//! let system = SparseLinearSystem::from_triplets(1, 1, &[(0, 0, 1.0)], vec![100.0]).unwrap();
//! let data = Arc::new(ColumnOrganizedData::from_system(&system).unwrap());
//! let mut core = AnnealingCore::new(data, None, vec![0.0], 0.0, AnnealConfig::default().with_seed(1)).unwrap();
//! let state = core.iterate_for(10_000).unwrap();
//! assert!(state.energy[0] < 100.0 * 100.0);
//! assert!(core.best_solution()[0] >= 0.0);
//! ```

pub mod anneal;
pub mod completion;
pub mod data;
pub mod error;
pub mod parallel;
pub mod reweight;

pub use error::{InversionError, Result};
