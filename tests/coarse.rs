//! Coarse operator on thread-backed process groups: communicator restructuring, fine to
//! coarse transfers, Galerkin assembly across masters and deflated PCG.

use approx::assert_abs_diff_eq;
use ddkrylov::coarse::{
    CoarseOperator, DenseLu, Distribution, DistributionMap, GalerkinContribution, Topology, restructure_into,
    transfer_to_coarse, transfer_to_fine,
};
use ddkrylov::config::KrylovOptions;
use ddkrylov::core::traits::Operator;
use ddkrylov::core::wrappers::{BlockRowOperator, DeflatedOperator, DenseOperator};
use ddkrylov::matrix::dense::ColMat;
use ddkrylov::matrix::sparse::{CsrMatrix, SparseMatrix};
use ddkrylov::parallel::{Comm, SelfComm, ThreadComm};
use ddkrylov::preconditioner::Jacobi;
use ddkrylov::solver::{CgSolver, KrylovSolver, PcgSolver};

#[test]
fn restructure_keeps_the_root_and_the_contributors() {
    let shapes = ThreadComm::run(5, |comm| {
        let counts = [0, 4, 1, 0, 3];
        restructure_into(&comm, &counts).map(|c| (c.rank(), c.size()))
    });
    assert_eq!(shapes, vec![Some((0, 4)), Some((1, 4)), Some((2, 4)), None, Some((3, 4))]);

    let shapes = ThreadComm::run(5, |comm| {
        let counts = [2, 0, 1, 0, 3];
        restructure_into(&comm, &counts).map(|c| (c.rank(), c.size()))
    });
    assert_eq!(shapes, vec![Some((0, 3)), None, Some((1, 3)), None, Some((2, 3))]);
}

#[test]
fn transfers_round_trip_exactly() {
    let (nu, mu) = (3, 2);
    ThreadComm::run(4, move |comm| {
        let map = DistributionMap::construct(Topology::Centralized, Distribution::Uniform { nu }, false, nu, &comm);
        assert_eq!(map.gather.counts, vec![3; 4]);
        let rank = comm.rank();
        let fine: Vec<f64> = (0..nu * mu).map(|i| (100 * rank + i) as f64).collect();
        let mut coarse = transfer_to_coarse(&comm, &map.gather, mu, &fine);
        if rank == 0 {
            assert_eq!(coarse.len(), 4 * nu * mu);
            // one contiguous global vector per right-hand side
            for r in 0..4 {
                for c in 0..mu {
                    for a in 0..nu {
                        assert_eq!(coarse[c * 4 * nu + r * nu + a], (100 * r + c * nu + a) as f64);
                    }
                }
            }
        }
        let mut back = vec![0.0; nu * mu];
        transfer_to_fine(&comm, &map.gather, mu, &mut coarse, &mut back);
        assert_eq!(back, fine);
    });
}

/// Coarse matrix with `counts[r]` unknowns on rank `r`, numbered by rank.
struct Banded {
    rank: usize,
    counts: Vec<usize>,
}

impl Banded {
    fn entry(i: usize, j: usize) -> f64 {
        match i.abs_diff(j) {
            0 => 5.0 + i as f64,
            1 => -1.0,
            3 => 0.5,
            _ => 0.0,
        }
    }

    fn first(&self, r: usize) -> usize {
        self.counts[..r].iter().sum()
    }

    fn global(&self) -> usize {
        self.counts.iter().sum()
    }

    /// `E x` restricted to the rows of this rank, `x` being the full coarse vector.
    fn apply_rows(&self, x: &[f64]) -> Vec<f64> {
        let first = self.first(self.rank);
        (0..self.counts[self.rank])
            .map(|a| (0..self.global()).map(|j| Self::entry(first + a, j) * x[j]).sum())
            .collect()
    }
}

impl GalerkinContribution<f64> for Banded {
    fn local_coarse_dofs(&self) -> usize {
        self.counts[self.rank]
    }

    fn block_row(&self) -> Vec<(usize, Vec<f64>)> {
        let (local, first) = (self.counts[self.rank], self.first(self.rank));
        (0..self.counts.len())
            .filter(|&j| self.counts[j] > 0)
            .map(|j| {
                let c0 = self.first(j);
                let block: Vec<f64> = (0..local * self.counts[j])
                    .map(|k| Self::entry(first + k % local, c0 + k / local))
                    .collect();
                (j, block)
            })
            .collect()
    }

    fn distribution(&self) -> Distribution {
        Distribution::NonUniform
    }
}

/// Solves with every rank's `(rank + 1)`-th right-hand side and returns, per rank, the
/// local right-hand side and solution.
fn solve_banded(size: usize, topology: Topology, excluded: bool, counts: Vec<usize>) -> Vec<(Vec<f64>, Vec<f64>)> {
    ThreadComm::run(size, |comm| {
        let op = Banded { rank: comm.rank(), counts: counts.clone() };
        let (mut coarse, pending) =
            CoarseOperator::construction(&op, &comm, topology, excluded, DenseLu::new()).unwrap();
        coarse.finish_assembly(pending).unwrap();
        assert_eq!(coarse.local(), counts[comm.rank()]);
        let rhs: Vec<f64> = (0..coarse.local()).map(|a| (comm.rank() + a + 1) as f64).collect();
        let mut x = rhs.clone();
        coarse.call_solver(&mut x, 1).unwrap();
        (rhs, x)
    })
}

fn check_banded(counts: &[usize], solved: &[(Vec<f64>, Vec<f64>)]) {
    let full: Vec<f64> = solved.iter().flat_map(|(_, x)| x.iter().copied()).collect();
    for (rank, (rhs, _)) in solved.iter().enumerate() {
        let op = Banded { rank, counts: counts.to_vec() };
        for (ex, b) in op.apply_rows(&full).iter().zip(rhs) {
            assert_abs_diff_eq!(*ex, *b, epsilon = 1e-10);
        }
    }
}

#[test]
fn galerkin_solve_matches_the_assembled_matrix() {
    let counts = vec![1, 2, 3];
    check_banded(&counts, &solve_banded(3, Topology::Centralized, false, counts.clone()));
    check_banded(&counts, &solve_banded(3, Topology::Distributed { masters: 2 }, false, counts.clone()));
    check_banded(&counts, &solve_banded(3, Topology::Distributed { masters: 3 }, false, counts.clone()));
}

#[test]
fn excluded_masters_only_solve() {
    // masters 0 and 2 carry no unknowns
    let counts = vec![0, 2, 0, 3];
    let solved = solve_banded(4, Topology::Distributed { masters: 2 }, true, counts.clone());
    assert!(solved[0].1.is_empty() && solved[2].1.is_empty());
    check_banded(&counts, &solved);
}

#[test]
fn pending_solve_matches_the_blocking_one() {
    let counts = vec![2, 1, 2, 1];
    ThreadComm::run(4, |comm| {
        let op = Banded { rank: comm.rank(), counts: counts.clone() };
        let (mut coarse, pending) =
            CoarseOperator::construction(&op, &comm, Topology::Distributed { masters: 2 }, false, DenseLu::new())
                .unwrap();
        coarse.finish_assembly(pending).unwrap();
        let mu = 2;
        let rhs: Vec<f64> = (0..coarse.local() * mu).map(|i| (i + 3 * comm.rank()) as f64 - 1.5).collect();
        let mut blocking = rhs.clone();
        coarse.call_solver(&mut blocking, mu).unwrap();
        let solve = coarse.icall_solver(&rhs, mu).unwrap();
        let deferred = solve.wait().unwrap();
        assert_eq!(blocking, deferred);
    });
}

/// Rows `first..first + n` of `tridiag(-1, d, -1)` of size `global`, with global columns.
fn tridiagonal_rows(first: usize, n: usize, global: usize, d: f64) -> CsrMatrix<f64> {
    let mut triplets = Vec::new();
    for a in 0..n {
        let i = first + a;
        triplets.push((a, i, d + 0.05 * i as f64));
        if i > 0 {
            triplets.push((a, i - 1, -1.0));
        }
        if i + 1 < global {
            triplets.push((a, i + 1, -1.0));
        }
    }
    CsrMatrix::from_triplets(n, global, triplets)
}

#[test]
fn distributed_pcg_matches_serial_cg() {
    let (n, size) = (6, 2);
    let global = n * size;
    let rhs = |i: usize| 1.0 + (i as f64).sin();
    let parts = ThreadComm::run(size, |comm| {
        let first = comm.rank() * n;
        let rows = tridiagonal_rows(first, n, global, 2.5);
        let op = BlockRowOperator::new(rows.clone(), &comm).with_preconditioner(Jacobi::from_rows(&rows, first));
        let b: Vec<f64> = (first..first + n).map(rhs).collect();
        let mut x = vec![0.0; n];
        let opts = KrylovOptions::default().with_tol(1e-12).with_max_it(100);
        let stats = PcgSolver::new(opts).solve(&op, &b, &mut x, 1, &comm).unwrap();
        assert!(stats.converged);
        x
    });

    let dense = {
        let rows = tridiagonal_rows(0, global, global, 2.5);
        ColMat::from_fn(global, global, |i, j| rows.row(i).find(|&(c, _)| c == j).map_or(0.0, |(_, v)| v))
    };
    let op = DenseOperator::new(dense.clone()).with_preconditioner(Jacobi::from_dense(&dense));
    let b: Vec<f64> = (0..global).map(rhs).collect();
    let mut x = vec![0.0; global];
    let opts = KrylovOptions::default().with_tol(1e-12).with_max_it(100);
    assert!(CgSolver::new(opts).solve(&op, &b, &mut x, 1, &SelfComm).unwrap().converged);

    let distributed: Vec<f64> = parts.concat();
    for i in 0..global {
        assert_abs_diff_eq!(distributed[i], x[i], epsilon = 1e-9);
    }
}

/// One constant coarse basis vector per rank: `E_ij` sums the entries of the local
/// rows that fall in the columns of rank `j`.
struct Aggregates<'a> {
    rows: &'a CsrMatrix<f64>,
    n: usize,
    size: usize,
}

impl GalerkinContribution<f64> for Aggregates<'_> {
    fn local_coarse_dofs(&self) -> usize {
        1
    }

    fn block_row(&self) -> Vec<(usize, Vec<f64>)> {
        let mut sums = vec![0.0; self.size];
        for a in 0..self.rows.nrows() {
            for (j, v) in self.rows.row(a) {
                sums[j / self.n] += v;
            }
        }
        sums.into_iter()
            .enumerate()
            .filter(|&(_, s)| s != 0.0)
            .map(|(j, s)| (j, vec![s]))
            .collect()
    }

    fn distribution(&self) -> Distribution {
        Distribution::Uniform { nu: 1 }
    }
}

#[test]
fn deflated_pcg_projects_out_the_coarse_space() {
    let (n, size) = (8, 3);
    let global = n * size;
    ThreadComm::run(size, |comm| {
        let first = comm.rank() * n;
        let rows = tridiagonal_rows(first, n, global, 2.0);
        let b: Vec<f64> = (first..first + n).map(|i| 1.0 + 0.5 * (i as f64).cos()).collect();
        let galerkin = Aggregates { rows: &rows, n, size };
        let (mut coarse, pending) =
            CoarseOperator::construction(&galerkin, &comm, Topology::Centralized, false, DenseLu::new()).unwrap();
        coarse.finish_assembly(pending).unwrap();

        let plain = || BlockRowOperator::new(rows.clone(), &comm).with_preconditioner(Jacobi::from_rows(&rows, first));
        let z = ColMat::from_fn(n, 1, |_, _| 1.0);
        let deflated = DeflatedOperator::new(plain(), z, &coarse);

        // the corrected initial guess already has a residual orthogonal to Z
        let mut x0 = vec![0.0; n];
        let opts = KrylovOptions::default().with_max_it(0);
        PcgSolver::new(opts).solve(&deflated, &b, &mut x0, 1, &comm).unwrap();
        let mut ax = vec![0.0; n];
        deflated.gmv(&x0, &mut ax, 1);
        let local: f64 = b.iter().zip(&ax).map(|(bi, ai)| bi - ai).sum();
        assert_abs_diff_eq!(local, 0.0, epsilon = 1e-10);

        let opts = KrylovOptions::default().with_tol(1e-12).with_max_it(200);
        let mut x = vec![0.0; n];
        let with_coarse = PcgSolver::new(opts.clone()).solve(&deflated, &b, &mut x, 1, &comm).unwrap();
        let mut y = vec![0.0; n];
        let without = PcgSolver::new(opts).solve(&plain(), &b, &mut y, 1, &comm).unwrap();
        assert!(with_coarse.converged && without.converged);
        for i in 0..n {
            assert_abs_diff_eq!(x[i], y[i], epsilon = 1e-8);
        }
    });
}

#[test]
fn dropping_after_finalize_leaks_quietly() {
    ThreadComm::run(2, |comm| {
        let counts = vec![1, 1];
        let op = Banded { rank: comm.rank(), counts };
        let (mut coarse, pending) =
            CoarseOperator::construction(&op, &comm, Topology::Centralized, false, DenseLu::new()).unwrap();
        coarse.finish_assembly(pending).unwrap();
        assert!(coarse.is_assembled());
        comm.barrier();
        comm.finalize();
        comm.barrier();
        drop(coarse);
    });
}
