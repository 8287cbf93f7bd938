//! Fixed ring of reusable misfit buffers.
//!
//! Three roles are tracked by slot index: `cur` (misfit of the accepted
//! state), `next` (write target of the next proposal) and `best` (misfit of
//! the best state). `next` is always identical to `cur` at the start of an
//! iteration, so a proposal and its rollback only touch the rows of the
//! perturbed column. A full copy is needed only when the slot about to
//! become `next` still holds the best misfit.

use crate::data::ColumnOrganizedData;

/// Equality and optional inequality misfit vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct MisfitBuffers {
    pub eq: Vec<f64>,
    pub ineq: Option<Vec<f64>>,
}

impl MisfitBuffers {
    pub fn new(eq: &[f64], ineq: Option<&[f64]>) -> Self {
        Self {
            eq: eq.to_vec(),
            ineq: ineq.map(<[f64]>::to_vec),
        }
    }

    pub fn ineq(&self) -> Option<&[f64]> {
        self.ineq.as_deref()
    }

    fn copy_from(&mut self, other: &MisfitBuffers) {
        self.eq.copy_from_slice(&other.eq);
        if let (Some(dst), Some(src)) = (self.ineq.as_mut(), other.ineq.as_ref()) {
            dst.copy_from_slice(src);
        }
    }

    fn sync_column(&mut self, other: &MisfitBuffers, columns: &ColumnSystems<'_>, col: usize) {
        for &row in columns.eq.rows(col) {
            self.eq[row] = other.eq[row];
        }
        if let (Some(data), Some(dst), Some(src)) =
            (columns.ineq, self.ineq.as_mut(), other.ineq.as_ref())
        {
            for &row in data.rows(col) {
                dst[row] = src[row];
            }
        }
    }
}

/// The systems whose column structure decides which rows a move touches.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSystems<'a> {
    pub eq: &'a ColumnOrganizedData,
    pub ineq: Option<&'a ColumnOrganizedData>,
}

#[derive(Debug)]
enum BestMisfit {
    Slot(usize),
    Detached(MisfitBuffers),
}

/// Index-addressed ring of misfit buffers.
#[derive(Debug)]
pub struct MisfitRing {
    slots: Vec<MisfitBuffers>,
    cur: usize,
    next: usize,
    best: BestMisfit,
    recycled: Option<MisfitBuffers>,
    forced_copies: u64,
}

impl MisfitRing {
    /// Builds a ring of `size` (at least 2) copies of the starting misfit,
    /// which is both current and best.
    pub fn new(size: usize, start: &MisfitBuffers) -> Self {
        let size = size.max(2);
        Self {
            slots: vec![start.clone(); size],
            cur: 0,
            next: 1,
            best: BestMisfit::Slot(0),
            recycled: None,
            forced_copies: 0,
        }
    }

    /// Misfit of the accepted state.
    pub fn current(&self) -> &MisfitBuffers {
        &self.slots[self.cur]
    }

    /// Write target for the pending proposal.
    pub fn proposal_mut(&mut self) -> &mut MisfitBuffers {
        &mut self.slots[self.next]
    }

    /// Misfit of the best state.
    pub fn best(&self) -> &MisfitBuffers {
        match &self.best {
            BestMisfit::Slot(s) => &self.slots[*s],
            BestMisfit::Detached(buf) => buf,
        }
    }

    /// Number of full-buffer copies performed so far.
    pub fn forced_copies(&self) -> u64 {
        self.forced_copies
    }

    /// Undoes the pending proposal on column `col`.
    pub fn reject(&mut self, columns: &ColumnSystems<'_>, col: usize) {
        let (next, cur) = pair_mut(&mut self.slots, self.next, self.cur);
        next.sync_column(cur, columns, col);
    }

    /// Adopts the pending proposal on column `col` as current, optionally as
    /// the new best, and prepares a fresh write target.
    pub fn accept(&mut self, columns: &ColumnSystems<'_>, col: usize, new_best: bool) {
        let old_cur = self.cur;
        self.cur = self.next;

        if new_best {
            if let BestMisfit::Detached(buf) =
                std::mem::replace(&mut self.best, BestMisfit::Slot(self.cur))
            {
                self.recycled = Some(buf);
            }
        }

        let old_cur_is_best = matches!(self.best, BestMisfit::Slot(s) if s == old_cur);
        if !old_cur_is_best {
            // differs from the new current only on this column's rows
            let (stale, cur) = pair_mut(&mut self.slots, old_cur, self.cur);
            stale.sync_column(cur, columns, col);
            self.next = old_cur;
            return;
        }

        let cur = self.cur;
        let spare = (0..self.slots.len()).find(|&s| s != cur && s != old_cur);
        match spare {
            Some(spare) => {
                let (dst, src) = pair_mut(&mut self.slots, spare, cur);
                dst.copy_from(src);
                self.next = spare;
            }
            None => {
                // two slots only: move the best misfit out of the ring
                let detached = match self.recycled.take() {
                    Some(mut buf) => {
                        buf.copy_from(&self.slots[old_cur]);
                        buf
                    }
                    None => self.slots[old_cur].clone(),
                };
                self.best = BestMisfit::Detached(detached);
                let (stale, cur) = pair_mut(&mut self.slots, old_cur, cur);
                stale.sync_column(cur, columns, col);
                self.next = old_cur;
            }
        }
        self.forced_copies += 1;
    }
}

fn pair_mut<T>(slice: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    debug_assert_ne!(a, b);
    if a < b {
        let (lo, hi) = slice.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = slice.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anneal::energy::update_misfits_delta;
    use crate::data::SparseLinearSystem;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn system() -> ColumnOrganizedData {
        let sys = SparseLinearSystem::from_triplets(
            4,
            3,
            &[
                (0, 0, 1.0),
                (1, 0, 2.0),
                (1, 1, -1.0),
                (2, 1, 0.5),
                (3, 2, 3.0),
                (0, 2, 1.5),
            ],
            vec![1.0, 2.0, 3.0, 4.0],
        )
        .unwrap();
        ColumnOrganizedData::from_system(&sys).unwrap()
    }

    /// Drives the ring with random moves and checks every role against a
    /// plainly recomputed model.
    fn exercise(size: usize, seed: u64) -> u64 {
        let data = system();
        let columns = ColumnSystems { eq: &data, ineq: None };
        let mut x = vec![0.0; 3];
        let start = MisfitBuffers::new(&data.misfit(&x), None);
        let mut ring = MisfitRing::new(size, &start);
        let mut best_x = x.clone();
        let mut rng = StdRng::seed_from_u64(seed);

        for _ in 0..500 {
            let col = rng.random_range(0..3);
            let p = rng.random::<f64>() - 0.5;
            update_misfits_delta(&data, &mut ring.proposal_mut().eq, col, p, false);
            if rng.random::<f64>() < 0.6 {
                x[col] += p;
                let new_best = rng.random::<f64>() < 0.3;
                ring.accept(&columns, col, new_best);
                if new_best {
                    best_x.clone_from(&x);
                }
            } else {
                ring.reject(&columns, col);
            }
            let expect_cur = data.misfit(&x);
            let expect_best = data.misfit(&best_x);
            for r in 0..4 {
                assert!((ring.current().eq[r] - expect_cur[r]).abs() < 1e-9);
                assert!((ring.proposal_mut().eq[r] - expect_cur[r]).abs() < 1e-9);
                assert!((ring.best().eq[r] - expect_best[r]).abs() < 1e-9);
            }
        }
        ring.forced_copies()
    }

    #[test]
    fn test_ring_of_three_stays_consistent() {
        exercise(3, 11);
    }

    #[test]
    fn test_ring_of_two_detaches_best() {
        assert!(exercise(2, 12) > 0);
    }

    #[test]
    fn test_ring_larger_than_needed() {
        exercise(5, 13);
    }

    #[test]
    fn test_accepting_best_never_copies() {
        let data = system();
        let columns = ColumnSystems { eq: &data, ineq: None };
        let start = MisfitBuffers::new(&data.misfit(&[0.0; 3]), None);
        let mut ring = MisfitRing::new(3, &start);
        for col in [0, 1, 2, 0, 1] {
            update_misfits_delta(&data, &mut ring.proposal_mut().eq, col, 0.1, false);
            ring.accept(&columns, col, true);
        }
        assert_eq!(ring.forced_copies(), 0);
    }
}
