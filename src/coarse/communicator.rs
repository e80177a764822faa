//! Communicators restricted to the ranks that contribute coarse degrees of freedom.
//!
//! Rank 0 of the input communicator is always kept: it is the root of every coarse
//! gather and scatter, even when it owns no coarse dof itself.

use crate::parallel::Comm;

/// Ranks of `counts` kept by [`restructure`]: `{0}` and every rank with a nonzero count,
/// in increasing order.
pub fn members(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .enumerate()
        .filter(|&(i, &c)| i == 0 || c != 0)
        .map(|(i, _)| i)
        .collect()
}

/// Restructures `comm` around the ranks with a nonzero entry in `counts`, releasing
/// the input communicator.
///
/// When no count is zero the result is a duplicate with the same membership. Otherwise
/// it is the subgroup returned by [`members`], and ranks outside of it get `None`.
/// Collective over `comm`.
pub fn restructure<C: Comm>(comm: C, counts: &[usize]) -> Option<C> {
    let out = restructure_into(&comm, counts);
    drop(comm);
    out
}

/// Same as [`restructure`], keeping `comm` alive.
pub fn restructure_into<C: Comm>(comm: &C, counts: &[usize]) -> Option<C> {
    assert_eq!(counts.len(), comm.size(), "one count per rank is required");
    if counts.iter().all(|&c| c != 0) {
        return Some(comm.duplicate());
    }
    let kept = members(counts);
    log::debug!(
        "restructuring a communicator of {} ranks into {} ({} without coarse dof)",
        comm.size(),
        kept.len(),
        comm.size() - kept.len()
    );
    comm.create_subgroup(&kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::{SelfComm, ThreadComm};

    #[test]
    fn members_always_keep_the_root() {
        assert_eq!(members(&[0, 2, 0, 1]), vec![0, 1, 3]);
        assert_eq!(members(&[3, 0, 0]), vec![0]);
    }

    #[test]
    fn no_zero_count_duplicates() {
        let dup = restructure(SelfComm, &[4]);
        assert!(dup.is_some());
    }

    #[test]
    fn zero_count_ranks_are_left_out() {
        let out = ThreadComm::run(4, |comm| {
            let counts = [1, 0, 2, 3];
            restructure(comm, &counts).map(|c| (c.rank(), c.size()))
        });
        assert_eq!(out, vec![Some((0, 3)), None, Some((1, 3)), Some((2, 3))]);
    }
}
