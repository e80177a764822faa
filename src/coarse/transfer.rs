//! Moving right-hand sides between the fine and the coarse distribution.
//!
//! On the fine side every member of a gather communicator holds its `count` coarse
//! values for each of the `mu` right-hand sides, one after the other. A gather therefore
//! lands on the root *rank-major, RHS-minor*, while the coarse solver expects each
//! right-hand side as one contiguous column (*RHS-major, rank-minor*). [`permute`]
//! converts between the two.

use crate::coarse::distribution::Layout;
use crate::core::traits::Scalar;
use crate::parallel::{Comm, Pending};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Rank-major to RHS-major.
    ToCoarse,
    /// RHS-major to rank-major.
    ToFine,
}

/// Reorders `buf` (`layout.total() * mu` values) between the two layouts.
pub fn permute<T: Copy>(layout: &Layout, mu: usize, buf: &mut [T], direction: Direction) {
    if mu == 1 || layout.counts.len() == 1 {
        return;
    }
    let total = layout.total();
    debug_assert_eq!(buf.len(), total * mu);
    let aux = buf.to_vec();
    for (&count, &displ) in layout.counts.iter().zip(&layout.displs) {
        for nu in 0..mu {
            let by_rank = displ * mu + nu * count;
            let by_rhs = nu * total + displ;
            match direction {
                Direction::ToCoarse => buf[by_rhs..by_rhs + count].copy_from_slice(&aux[by_rank..by_rank + count]),
                Direction::ToFine => buf[by_rank..by_rank + count].copy_from_slice(&aux[by_rhs..by_rhs + count]),
            }
        }
    }
}

/// Gathers the fine values of every member onto rank 0 of `comm` and permutes them
/// into columns. Returns an empty buffer on the other ranks.
pub fn transfer_to_coarse<T: Scalar, C: Comm>(comm: &C, layout: &Layout, mu: usize, fine: &[T]) -> Vec<T> {
    let (counts, displs) = layout.scaled(mu);
    let mut coarse = root_buffer(comm, layout, mu);
    comm.gatherv(fine, &mut coarse, &counts, &displs, 0);
    if comm.rank() == 0 {
        permute(layout, mu, &mut coarse, Direction::ToCoarse);
    }
    coarse
}

/// Non-blocking half of [`transfer_to_coarse`]: issues the gather only.
pub fn itransfer_to_coarse<T: Scalar, C: Comm>(comm: &C, layout: &Layout, mu: usize, fine: &[T]) -> Pending<T> {
    let (counts, displs) = layout.scaled(mu);
    comm.igatherv(fine, root_buffer(comm, layout, mu), counts, displs, 0)
}

/// Completes a gather issued by [`itransfer_to_coarse`].
pub fn complete_to_coarse<T: Scalar, C: Comm>(comm: &C, layout: &Layout, mu: usize, pending: Pending<T>) -> Vec<T> {
    let mut coarse = pending.wait(comm);
    if comm.rank() == 0 {
        permute(layout, mu, &mut coarse, Direction::ToCoarse);
    }
    coarse
}

/// Inverse of [`transfer_to_coarse`]: permutes the columns held by rank 0 back and
/// scatters each member's values into `fine`.
pub fn transfer_to_fine<T: Scalar, C: Comm>(comm: &C, layout: &Layout, mu: usize, coarse: &mut [T], fine: &mut [T]) {
    if comm.rank() == 0 {
        permute(layout, mu, coarse, Direction::ToFine);
    }
    let (counts, displs) = layout.scaled(mu);
    comm.scatterv(coarse, &counts, &displs, fine, 0);
}

fn root_buffer<T: Scalar, C: Comm>(comm: &C, layout: &Layout, mu: usize) -> Vec<T> {
    if comm.rank() == 0 { vec![T::zero(); layout.total() * mu] } else { Vec::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::ThreadComm;

    fn layout(counts: &[usize]) -> Layout {
        Layout {
            counts: counts.to_vec(),
            displs: crate::parallel::displacements(counts),
        }
    }

    #[test]
    fn permute_interleaves_by_column() {
        let l = layout(&[1, 2]);
        // rank 0: [a0 | a1], rank 1: [b0 c0 | b1 c1]
        let mut buf = vec![10, 11, 20, 30, 21, 31];
        permute(&l, 2, &mut buf, Direction::ToCoarse);
        assert_eq!(buf, vec![10, 20, 30, 11, 21, 31]);
        permute(&l, 2, &mut buf, Direction::ToFine);
        assert_eq!(buf, vec![10, 11, 20, 30, 21, 31]);
    }

    #[test]
    fn gathered_columns_follow_rank_order() {
        let out = ThreadComm::run(3, |comm| {
            let l = layout(&[2, 1, 2]);
            let r = comm.rank();
            let count = l.counts[r];
            let fine: Vec<f64> = (0..2 * count).map(|i| (10 * r + i) as f64).collect();
            transfer_to_coarse(&comm, &l, 2, &fine)
        });
        assert_eq!(out[0], vec![0.0, 1.0, 10.0, 20.0, 21.0, 2.0, 3.0, 11.0, 22.0, 23.0]);
        assert!(out[1].is_empty());
    }
}
