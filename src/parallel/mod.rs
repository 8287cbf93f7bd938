//! Parallel annealing: independent replicas synchronized in rounds.
//!
//! A [`ParallelCoordinator`] owns N [`AnnealingCore`](crate::anneal::AnnealingCore)
//! replicas over one shared, read-only system. Each round runs every replica
//! on a rayon pool until a sub-completion criteria is met, then reconciles:
//!
//! - **best-of** (default): adopt the replica with the lowest total energy
//! - **average**: take the arithmetic mean of every replica's best state
//!
//! The reconciled state is broadcast back before the next round. A
//! [`RoundHook`] can rewrite systems and state between rounds; adaptive
//! reweighting is built on it.

mod checkpoint;
mod config;
mod runner;
mod types;

pub use checkpoint::{write_solution, CheckpointWriter, FileCheckpointWriter};
pub use config::ParallelConfig;
pub use runner::ParallelCoordinator;
pub use types::{NoRoundHook, RoundHook};
