//! Placement of the coarse degrees of freedom on the process group.
//!
//! The coarse unknowns are numbered by world rank: rank `i` owns the `counts[i]`
//! consecutive rows starting at `sum(counts[..i])`. Ranks are split into contiguous
//! groups, each led by its first rank (its *master*), which owns the coarse rows of the
//! whole group and is the root of the group's gathers and scatters.

use crate::coarse::communicator::members;
use crate::parallel::{Comm, displacements};
use std::ops::Range;

/// Where the coarse matrix lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
    /// A single master, world rank 0.
    Centralized,
    /// `masters` contiguous groups of ranks.
    Distributed { masters: usize },
}

/// Coarse dof counts of the ranks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Distribution {
    /// Every contributing rank owns `nu` coarse dofs; counts are known without
    /// communication.
    Uniform { nu: usize },
    /// Counts differ and are all-gathered.
    NonUniform,
}

/// Per-member `(count, displacement)` pairs of a gather or scatter, in dof units.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Layout {
    pub counts: Vec<usize>,
    pub displs: Vec<usize>,
}

impl Layout {
    fn new(counts: Vec<usize>) -> Self {
        let displs = displacements(&counts);
        Self { counts, displs }
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Counts and displacements for `mu` values per dof.
    pub fn scaled(&self, mu: usize) -> (Vec<usize>, Vec<usize>) {
        (
            self.counts.iter().map(|c| c * mu).collect(),
            self.displs.iter().map(|d| d * mu).collect(),
        )
    }
}

#[derive(Clone, Debug)]
pub struct DistributionMap {
    /// World rank of every master.
    pub masters: Vec<usize>,
    /// First coarse row of every master, followed by the global size.
    pub offsets: Vec<usize>,
    /// Coarse dof count of every world rank.
    pub counts: Vec<usize>,
    /// Layout of the gathers to this rank's master.
    pub gather: Layout,
    /// Layout of the scatters from this rank's master.
    pub scatter: Layout,
}

impl DistributionMap {
    /// Builds the map on every rank of `comm`. Collective when the distribution is not
    /// uniform.
    ///
    /// With `excluded` set, masters only take part in the coarse solve: their count is
    /// forced to 0, but they still issue every collective.
    pub fn construct<C: Comm>(
        topology: Topology,
        distribution: Distribution,
        excluded: bool,
        local: usize,
        comm: &C,
    ) -> Self {
        let size = comm.size();
        let masters = match topology {
            Topology::Centralized => vec![0],
            Topology::Distributed { masters } => {
                let p = masters.clamp(1, size);
                (0..p).map(|g| g * size / p).collect()
            }
        };
        let counts = match distribution {
            Distribution::Uniform { nu } => (0..size)
                .map(|r| if excluded && masters.contains(&r) { 0 } else { nu })
                .collect(),
            Distribution::NonUniform => {
                let mine = if excluded && masters.contains(&comm.rank()) { 0 } else { local };
                let mut counts = vec![0usize; size];
                comm.all_gather(&[mine], &mut counts);
                counts
            }
        };
        let mut offsets = Vec::with_capacity(masters.len() + 1);
        let mut acc = 0;
        for (g, &m) in masters.iter().enumerate() {
            offsets.push(acc);
            let end = masters.get(g + 1).copied().unwrap_or(size);
            acc += counts[m..end].iter().sum::<usize>();
        }
        offsets.push(acc);

        let mut map = Self {
            masters,
            offsets,
            counts,
            gather: Layout::default(),
            scatter: Layout::default(),
        };
        let group = map.group_ranks(map.group_of(comm.rank()));
        let kept: Vec<usize> = members(&map.counts[group.clone()])
            .into_iter()
            .map(|i| map.counts[group.start + i])
            .collect();
        map.gather = Layout::new(kept);
        map.scatter = map.gather.clone();
        map
    }

    pub fn global_size(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    pub fn num_groups(&self) -> usize {
        self.masters.len()
    }

    /// Group led by the last master not after `rank`.
    pub fn group_of(&self, rank: usize) -> usize {
        self.masters.partition_point(|&m| m <= rank).saturating_sub(1)
    }

    /// World ranks of group `g`.
    pub fn group_ranks(&self, g: usize) -> Range<usize> {
        let end = self.masters.get(g + 1).copied().unwrap_or(self.counts.len());
        self.masters[g]..end
    }

    pub fn is_master(&self, rank: usize) -> bool {
        self.masters.binary_search(&rank).is_ok()
    }

    /// First global coarse row owned by `rank`.
    pub fn first_row(&self, rank: usize) -> usize {
        self.counts[..rank].iter().sum()
    }
}
