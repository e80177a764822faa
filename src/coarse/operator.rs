//! Galerkin coarse operator: assembly of `E = Z^T A Z` on the masters and coarse
//! corrections for the fine ranks.
//!
//! # Protocol
//! 1. [`CoarseOperator::construction`] builds the communicators and the
//!    [`DistributionMap`], gathers the neighbour lists of every group to its master and
//!    issues a non-blocking gather of the block values.
//! 2. The caller may overlap fine-grid work, then hands the [`PendingAssembly`] to
//!    [`CoarseOperator::finish_assembly`], which assembles each master's block row and
//!    factorizes it through the backend.
//! 3. [`CoarseOperator::call_solver`] (or [`CoarseOperator::icall_solver`] followed by
//!    [`PendingCoarseSolve::wait`]) maps local coarse values to the coarse solution.
//!
//! Every step is collective over the process group passed to `construction`.

use crate::coarse::backend::CoarseSolver;
use crate::coarse::communicator::restructure;
use crate::coarse::distribution::{Distribution, DistributionMap, Topology};
use crate::coarse::transfer::{complete_to_coarse, itransfer_to_coarse, transfer_to_coarse, transfer_to_fine};
use crate::core::traits::Scalar;
use crate::error::KError;
use crate::matrix::dense::ColMat;
use crate::parallel::{Comm, Pending, displacements};
use std::marker::PhantomData;

/// The local view of the Galerkin product an operator provides.
pub trait GalerkinContribution<T: Scalar> {
    /// Number of coarse basis vectors on this rank.
    fn local_coarse_dofs(&self) -> usize;

    /// Nonzero blocks `Z_i^T A Z_j` of this rank's block row, keyed by the world rank
    /// `j`. Each block is `nu_i x nu_j`, column-major.
    fn block_row(&self) -> Vec<(usize, Vec<T>)>;

    fn distribution(&self) -> Distribution;
}

/// Communicators used for the coarse transfers: one shared context, or separate ones
/// for gathers and scatters. A shared communicator is released once.
pub enum CoarseComms<C> {
    Shared(C),
    Split { gather: C, scatter: C },
}

impl<C> CoarseComms<C> {
    pub fn gather(&self) -> &C {
        match self {
            CoarseComms::Shared(c) => c,
            CoarseComms::Split { gather, .. } => gather,
        }
    }

    pub fn scatter(&self) -> &C {
        match self {
            CoarseComms::Shared(c) => c,
            CoarseComms::Split { scatter, .. } => scatter,
        }
    }
}

/// In-flight coarse matrix assembly returned by [`CoarseOperator::construction`].
#[must_use = "the assembly must be finished on every rank"]
pub struct PendingAssembly<T> {
    values: Option<Pending<T>>,
    // neighbour lists of the gather members, on the master only
    neighbours: Vec<Vec<usize>>,
}

impl<T: Scalar> PendingAssembly<T> {
    pub fn is_complete(&self) -> bool {
        self.values.as_ref().is_none_or(Pending::is_complete)
    }
}

pub struct CoarseOperator<T, C: Comm, B> {
    comms: Option<CoarseComms<C>>,
    // held from construction until the backend takes it over
    masters: Option<C>,
    // masters only: a duplicate of the backend's communicator for solve verdicts
    verdicts: Option<C>,
    map: DistributionMap,
    backend: B,
    rank_world: usize,
    size_world: usize,
    size_split: usize,
    local: usize,
    size_rhs: usize,
    offset: bool,
    assembled: bool,
    _marker: PhantomData<T>,
}

impl<T, C, B> CoarseOperator<T, C, B>
where
    T: Scalar,
    C: Comm,
    B: CoarseSolver<T, C>,
{
    /// Starts the construction of the coarse operator of `op` over `comm`.
    ///
    /// With `excluded` set, masters hold no fine unknowns: their contribution is
    /// ignored, and gathers and scatters go through separate communicators. An
    /// inconsistent block row on any rank is reported on every rank.
    pub fn construction<O: GalerkinContribution<T>>(
        op: &O,
        comm: &C,
        topology: Topology,
        excluded: bool,
        backend: B,
    ) -> Result<(Self, PendingAssembly<T>), KError> {
        let (rank, size) = (comm.rank(), comm.size());
        let distribution = op.distribution();
        let map = DistributionMap::construct(topology, distribution, excluded, op.local_coarse_dofs(), comm);
        let local = map.counts[rank];

        let row = if local > 0 { op.block_row() } else { Vec::new() };
        let mismatch = matches!(distribution, Distribution::Uniform { nu } if local != 0 && op.local_coarse_dofs() != nu);
        let malformed = row
            .iter()
            .any(|(j, block)| *j >= size || map.counts[*j] == 0 || block.len() != local * map.counts[*j]);
        let mut flag = [usize::from(mismatch || malformed)];
        comm.all_reduce_sum(&mut flag);
        if flag[0] != 0 {
            return Err(KError::Config(format!(
                "{} rank(s) provided an inconsistent coarse block row",
                flag[0]
            )));
        }

        let mut group = None;
        for g in 0..map.num_groups() {
            let ranks: Vec<usize> = map.group_ranks(g).collect();
            if let Some(c) = comm.create_subgroup(&ranks) {
                group = Some(c);
            }
        }
        let group = group.ok_or_else(|| KError::Communication(format!("rank {rank} belongs to no coarse group")))?;
        let gcounts = map.counts[map.group_ranks(map.group_of(rank))].to_vec();
        let comms = restructure(group, &gcounts).map(|gather| {
            if excluded {
                let scatter = gather.duplicate();
                CoarseComms::Split { gather, scatter }
            } else {
                CoarseComms::Shared(gather)
            }
        });
        let masters = comm.create_subgroup(&map.masters);
        log::debug!(
            "rank {rank}: {local} coarse dofs, group {} of {}, {} global",
            map.group_of(rank),
            map.num_groups(),
            map.global_size()
        );

        let coarse = Self {
            size_split: comms.as_ref().map_or(0, |c| c.gather().size()),
            comms,
            masters,
            verdicts: None,
            map,
            backend,
            rank_world: rank,
            size_world: size,
            local,
            size_rhs: 0,
            offset: local > 0,
            assembled: false,
            _marker: PhantomData,
        };
        let pending = coarse.issue_assembly(row, distribution);
        Ok((coarse, pending))
    }

    /// Neighbour lists are gathered right away; the values go out non-blocking.
    fn issue_assembly(&self, row: Vec<(usize, Vec<T>)>, distribution: Distribution) -> PendingAssembly<T> {
        let Some(comms) = &self.comms else {
            return PendingAssembly { values: None, neighbours: Vec::new() };
        };
        let gather = comms.gather();
        let root = gather.rank() == 0;
        let members = gather.size();

        let ones = vec![1usize; members];
        let mut nblocks = vec![0usize; if root { members } else { 0 }];
        gather.gatherv(&[row.len()], &mut nblocks, &ones, &displacements(&ones), 0);
        let ids: Vec<usize> = row.iter().map(|(j, _)| *j).collect();
        let id_displs = displacements(&nblocks);
        let mut all_ids = vec![0usize; nblocks.iter().sum()];
        gather.gatherv(&ids, &mut all_ids, &nblocks, &id_displs, 0);
        let neighbours: Vec<Vec<usize>> = nblocks
            .iter()
            .zip(&id_displs)
            .map(|(&k, &d)| all_ids[d..d + k].to_vec())
            .collect();

        let sizes: Vec<usize> = match distribution {
            Distribution::Uniform { nu } => nblocks.iter().map(|k| k * nu * nu).collect(),
            Distribution::NonUniform => neighbours
                .iter()
                .zip(&self.map.gather.counts)
                .map(|(list, nu_m)| nu_m * list.iter().map(|&j| self.map.counts[j]).sum::<usize>())
                .collect(),
        };
        let values: Vec<T> = row.into_iter().flat_map(|(_, block)| block).collect();
        let recv = vec![T::zero(); sizes.iter().sum()];
        let displs = displacements(&sizes);
        PendingAssembly {
            values: Some(gather.igatherv(&values, recv, sizes, displs, 0)),
            neighbours,
        }
    }

    /// Waits for the block values, assembles the block row of every master and
    /// factorizes the coarse matrix.
    pub fn finish_assembly(&mut self, pending: PendingAssembly<T>) -> Result<(), KError> {
        let PendingAssembly { values, neighbours } = pending;
        let masters = self.masters.take();
        if let (Some(comms), Some(values)) = (&self.comms, values) {
            let values = values.wait(comms.gather());
            if comms.gather().rank() == 0 {
                let rows = self.map.gather.total();
                let global = self.map.global_size();
                let mut e = ColMat::zeros(rows, global);
                let mut pos = 0;
                for (m, list) in neighbours.iter().enumerate() {
                    let (nu_m, r0) = (self.map.gather.counts[m], self.map.gather.displs[m]);
                    for &j in list {
                        let (nu_j, c0) = (self.map.counts[j], self.map.first_row(j));
                        for b in 0..nu_j {
                            for a in 0..nu_m {
                                e[(r0 + a, c0 + b)] = e[(r0 + a, c0 + b)] + values[pos + a + b * nu_m];
                            }
                        }
                        pos += nu_m * nu_j;
                    }
                }
                let masters = masters.ok_or_else(|| {
                    KError::Communication(format!("group root {} is not a master", self.rank_world))
                })?;
                let first = self.map.offsets[self.map.group_of(self.rank_world)];
                self.size_rhs = rows;
                self.verdicts = Some(masters.duplicate());
                self.backend.factorize(e, first, global, masters)?;
            }
        }
        self.assembled = true;
        Ok(())
    }

    /// Solves the coarse problem in place: on input `rhs` holds the `local` coarse
    /// values of each of the `mu` right-hand sides, on output the matching entries of
    /// the coarse solution.
    pub fn call_solver(&self, rhs: &mut [T], mu: usize) -> Result<(), KError> {
        self.ready(rhs.len(), mu)?;
        let Some(comms) = &self.comms else {
            return Ok(());
        };
        let mut coarse = transfer_to_coarse(comms.gather(), &self.map.gather, mu, rhs);
        let status = self.solve_on_master(comms, &mut coarse, mu);
        transfer_to_fine(comms.scatter(), &self.map.scatter, mu, &mut coarse, rhs);
        agree(comms, status)
    }

    /// Non-blocking [`CoarseOperator::call_solver`]: issues the gather of `rhs` and
    /// returns a handle completing the solve.
    pub fn icall_solver(&self, rhs: &[T], mu: usize) -> Result<PendingCoarseSolve<'_, T, C, B>, KError> {
        self.ready(rhs.len(), mu)?;
        let pending = self
            .comms
            .as_ref()
            .map(|c| itransfer_to_coarse(c.gather(), &self.map.gather, mu, rhs));
        Ok(PendingCoarseSolve { coarse: self, pending, mu })
    }

    /// Validates a solve request. Before any transfer is issued the verdict is summed
    /// over the gather group, across the masters and back down every group, so a
    /// request rejected on one rank fails on all of them instead of leaving the others
    /// blocked in the gather or in the backend.
    fn ready(&self, len: usize, mu: usize) -> Result<(), KError> {
        let Some(comms) = &self.comms else {
            return self.check(len, mu, usize::MAX);
        };
        let gather = comms.gather();
        let local = self.check(len, mu, gather.max_count().min(comms.scatter().max_count()));
        let mut rejected = [usize::from(local.is_err())];
        gather.all_reduce_sum(&mut rejected);
        if let Some(masters) = &self.verdicts {
            masters.all_reduce_sum(&mut rejected);
        }
        gather.broadcast(&mut rejected, 0);
        match local {
            Ok(()) if rejected[0] != 0 => Err(KError::SolveError(format!(
                "coarse solve request rejected on {} rank(s)",
                rejected[0]
            ))),
            other => other,
        }
    }

    fn check(&self, len: usize, mu: usize, max_count: usize) -> Result<(), KError> {
        if !self.assembled {
            return Err(KError::SolveError("coarse operator used before finish_assembly".to_string()));
        }
        if len != self.local * mu {
            return Err(KError::SolveError(format!(
                "coarse right-hand side of length {len}, expected {} x {mu}",
                self.local
            )));
        }
        let global = self.map.offsets.last().copied().unwrap_or(0);
        if global.checked_mul(mu).is_none_or(|total| total > max_count) {
            return Err(KError::Communication(format!(
                "{mu} coarse right-hand side(s) of size {global} exceed the communicator's count range"
            )));
        }
        Ok(())
    }

    fn solve_on_master(&self, comms: &CoarseComms<C>, coarse: &mut [T], mu: usize) -> Result<(), KError> {
        if comms.gather().rank() == 0 {
            self.backend.solve(coarse, mu)
        } else {
            Ok(())
        }
    }
}

impl<T, C: Comm, B> CoarseOperator<T, C, B> {
    /// Coarse dofs owned by this rank.
    pub fn local(&self) -> usize {
        self.local
    }

    /// Coarse rows assembled on this rank (nonzero on masters only).
    pub fn size_rhs(&self) -> usize {
        self.size_rhs
    }

    pub fn owns_coarse_dofs(&self) -> bool {
        self.offset
    }

    pub fn is_assembled(&self) -> bool {
        self.assembled
    }

    pub fn map(&self) -> &DistributionMap {
        &self.map
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn rank(&self) -> usize {
        self.rank_world
    }

    pub fn world_size(&self) -> usize {
        self.size_world
    }

    /// Size of this rank's gather communicator, 0 outside of it.
    pub fn split_size(&self) -> usize {
        self.size_split
    }
}

/// The master's solve status, shared with its whole group.
fn agree<C: Comm>(comms: &CoarseComms<C>, status: Result<(), KError>) -> Result<(), KError> {
    let mut flag = [usize::from(status.is_err())];
    comms.scatter().broadcast(&mut flag, 0);
    match status {
        Ok(()) if flag[0] != 0 => Err(KError::SolveError("coarse solve failed on the master".to_string())),
        other => other,
    }
}

impl<T, C: Comm, B> Drop for CoarseOperator<T, C, B> {
    fn drop(&mut self) {
        let finalized = self.comms.as_ref().is_some_and(|c| c.gather().is_finalized())
            || self.masters.as_ref().is_some_and(Comm::is_finalized)
            || self.verdicts.as_ref().is_some_and(Comm::is_finalized);
        if finalized {
            log::warn!(
                "CoarseOperator on rank {} dropped after the process group was finalized, leaking its communicators",
                self.rank_world
            );
            if let Some(comms) = self.comms.take() {
                std::mem::forget(comms);
            }
            if let Some(masters) = self.masters.take() {
                std::mem::forget(masters);
            }
            if let Some(verdicts) = self.verdicts.take() {
                std::mem::forget(verdicts);
            }
        }
    }
}

/// Coarse solve in flight, see [`CoarseOperator::icall_solver`].
#[must_use = "a pending coarse solve must be waited on by every rank"]
pub struct PendingCoarseSolve<'a, T, C: Comm, B> {
    coarse: &'a CoarseOperator<T, C, B>,
    pending: Option<Pending<T>>,
    mu: usize,
}

impl<'a, T, C, B> PendingCoarseSolve<'a, T, C, B>
where
    T: Scalar,
    C: Comm,
    B: CoarseSolver<T, C>,
{
    pub fn is_complete(&self) -> bool {
        self.pending.as_ref().is_none_or(Pending::is_complete)
    }

    /// Completes the gather, solves and scatters; returns the local coarse solution.
    pub fn wait(self) -> Result<Vec<T>, KError> {
        let Self { coarse, pending, mu } = self;
        let mut fine = vec![T::zero(); coarse.local * mu];
        let (Some(comms), Some(pending)) = (coarse.comms.as_ref(), pending) else {
            return Ok(fine);
        };
        let mut buffer = complete_to_coarse(comms.gather(), &coarse.map.gather, mu, pending);
        let status = coarse.solve_on_master(comms, &mut buffer, mu);
        transfer_to_fine(comms.scatter(), &coarse.map.scatter, mu, &mut buffer, &mut fine);
        agree(comms, status)?;
        Ok(fine)
    }
}
