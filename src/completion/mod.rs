//! Completion criteria: predicates over an [`InversionState`](crate::anneal::InversionState)
//! that decide when annealing stops.
//!
//! Criteria are checked before every serial iteration, so implementations
//! should be cheap. Combine them with [`CompoundCompletionCriteria`] and
//! record a run's trajectory with [`ProgressTrackingCompletionCriteria`].

mod criteria;
mod progress;

pub use criteria::{
    time_str, CompletionCriteria, CompoundCompletionCriteria, EnergyCompletionCriteria,
    IterationCompletionCriteria, IterationsPerVariableCompletionCriteria, TimeCompletionCriteria,
};
pub use progress::{AnnealingProgress, ProgressTrackingCompletionCriteria};
