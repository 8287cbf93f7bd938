//! Round hooks.

use super::runner::ParallelCoordinator;
use crate::anneal::InversionSnapshot;
use crate::error::Result;

/// Callback run by a [`ParallelCoordinator`] at the start of every round,
/// after the top-level criteria has been checked.
///
/// The hook may replace the coordinator's systems and state through
/// [`SimulatedAnnealing::set_all`](crate::anneal::SimulatedAnnealing::set_all);
/// the round then starts from whatever state the coordinator holds.
pub trait RoundHook {
    /// `round` counts completed rounds of the current `iterate` call, so the
    /// first call sees `0`.
    fn before_round(
        &mut self,
        coordinator: &mut ParallelCoordinator,
        state: &InversionSnapshot,
        round: usize,
    ) -> Result<()>;
}

/// Hook that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRoundHook;

impl RoundHook for NoRoundHook {
    fn before_round(
        &mut self,
        _coordinator: &mut ParallelCoordinator,
        _state: &InversionSnapshot,
        _round: usize,
    ) -> Result<()> {
        Ok(())
    }
}
