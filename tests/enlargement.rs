//! Enlarged Krylov subspaces on a two-rank group.

use approx::assert_abs_diff_eq;
use ddkrylov::KspContext;
use ddkrylov::config::{KrylovMethod, KrylovOptions};
use ddkrylov::core::traits::Operator;
use ddkrylov::core::wrappers::BlockRowOperator;
use ddkrylov::matrix::sparse::CsrMatrix;
use ddkrylov::parallel::{Comm, ThreadComm};

const N: usize = 10;

/// This rank's rows of a nonsymmetric, diagonally dominant tridiagonal matrix (or its
/// symmetric part).
fn rows(rank: usize, size: usize, symmetric: bool) -> CsrMatrix<f64> {
    let global = N * size;
    let mut triplets = Vec::new();
    for a in 0..N {
        let i = rank * N + a;
        triplets.push((a, i, 3.0 + 0.1 * i as f64));
        if i > 0 {
            triplets.push((a, i - 1, -1.0));
        }
        if i + 1 < global {
            triplets.push((a, i + 1, if symmetric { -1.0 } else { -0.6 }));
        }
    }
    CsrMatrix::from_triplets(N, global, triplets)
}

fn solve(method: KrylovMethod, k: usize, mu: usize) -> Vec<Vec<f64>> {
    let symmetric = method == KrylovMethod::Bcg;
    ThreadComm::run(2, |comm| {
        let op = BlockRowOperator::new(rows(comm.rank(), comm.size(), symmetric), &comm);
        let b: Vec<f64> = (0..N * mu)
            .map(|i| 1.0 + ((i + N * comm.rank()) as f64 * 0.7).sin())
            .collect();
        let mut x = vec![0.0; N * mu];
        let opts = KrylovOptions::default()
            .with_method(method)
            .with_tol(1e-11)
            .with_max_it(200)
            .with_restart(30)
            .with_enlargement(k);
        let stats = KspContext::new(opts).solve(&op, &b, &mut x, mu, &comm).unwrap();
        assert!(stats.converged, "{} with k = {k}", method.name());

        let mut ax = vec![0.0; N * mu];
        op.gmv(&x, &mut ax, mu);
        for i in 0..N * mu {
            assert_abs_diff_eq!(ax[i], b[i], epsilon = 1e-8);
        }
        x
    })
}

fn assert_same(a: &[Vec<f64>], b: &[Vec<f64>]) {
    for (xa, xb) in a.iter().zip(b) {
        for (u, v) in xa.iter().zip(xb) {
            assert_abs_diff_eq!(u, v, epsilon = 1e-8);
        }
    }
}

#[test]
fn enlarged_block_gmres_matches_the_plain_solve() {
    for mu in [1, 2] {
        assert_same(&solve(KrylovMethod::Bgmres, 2, mu), &solve(KrylovMethod::Bgmres, 1, mu));
    }
}

#[test]
fn enlarged_block_cg_matches_the_plain_solve() {
    assert_same(&solve(KrylovMethod::Bcg, 2, 1), &solve(KrylovMethod::Bcg, 1, 1));
}

#[test]
fn enlargement_beyond_the_group_size_is_capped() {
    assert_same(&solve(KrylovMethod::Bgmres, 8, 1), &solve(KrylovMethod::Bgmres, 1, 1));
}

#[test]
fn scalar_methods_are_switched_to_a_block_method() {
    assert_same(&solve(KrylovMethod::Gmres, 2, 1), &solve(KrylovMethod::Gmres, 1, 1));
}
