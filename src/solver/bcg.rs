//! Block Conjugate Gradient (O'Leary).
//!
//! All active columns share one block of search directions `P`, A-orthogonal to the
//! previous blocks. `P` is orthonormalized before every product, which keeps the
//! `P^T A P` factorization well conditioned and drops directions that became
//! linearly dependent. When a column (or a group of the enlarged subspace) converges,
//! the iteration restarts on the remaining columns.

use crate::config::{KrylovOptions, Variant};
use crate::core::traits::{Operator, Scalar};
use crate::error::KError;
use crate::matrix::dense::{self, ColMat};
use crate::parallel::Comm;
use crate::solver::kernels::qr;
use crate::solver::{
    KrylovSolver, Problem, gather_columns, group_size, reference_norms, scatter_columns, settle_zero_rhs,
};
use crate::utils::convergence::{ConvergenceMarks, Monitor, SolveStats, check_group_convergence};
use std::marker::PhantomData;

#[derive(Clone, Debug)]
pub struct BcgSolver<T> {
    pub opts: KrylovOptions,
    pub excluded: bool,
    _marker: PhantomData<T>,
}

impl<T: Scalar> BcgSolver<T> {
    pub fn new(opts: KrylovOptions) -> Self {
        Self { opts: opts.validated(), excluded: false, _marker: PhantomData }
    }

    pub fn with_excluded(mut self, excluded: bool) -> Self {
        self.excluded = excluded;
        self
    }
}

impl<T: Scalar> KrylovSolver<T> for BcgSolver<T> {
    fn solve<O: Operator<T>, C: Comm>(
        &mut self,
        op: &O,
        b: &[T],
        x: &mut [T],
        mu: usize,
        comm: &C,
    ) -> Result<SolveStats<T>, KError> {
        let pb = Problem::new(op, comm, self.excluded, Variant::Right);
        let token = op.start(b, x, mu, self.excluded);
        let stats = run(&pb, &self.opts, b, x, mu);
        op.end(token);
        stats
    }
}

/// Orthonormal basis of the span of the `d` columns of `p`, replacing `p`. Falls back
/// to the eigenvectors of `P^T P` when the QR breaks down; returns the new width.
fn orthonormalize<T: Scalar, O: Operator<T>, C: Comm>(
    pb: &Problem<'_, T, O, C>,
    opts: &KrylovOptions,
    p: &mut Vec<T>,
    d: usize,
) -> Result<usize, KError> {
    let n = pb.n;
    let mut q = p.clone();
    let mut r = vec![T::zero(); d * d];
    match qr(opts.qr, n, d, &mut q, &mut r, d, &pb.ip, true) {
        Ok(()) => {
            *p = q;
            return Ok(d);
        }
        Err(KError::Breakdown(_)) => {}
        Err(e) => return Err(e),
    }
    let gram = pb.ip.gram(n, d, p, d, p);
    let (values, vectors) = dense::sym_eigen(&gram)?;
    let lmax = values.last().copied().unwrap_or_else(T::zero);
    let keep: Vec<usize> = (0..d).rev().filter(|&i| values[i] > T::epsilon().sqrt() * lmax).collect();
    let mut out = vec![T::zero(); n * keep.len()];
    for (c, &i) in keep.iter().enumerate() {
        let s = values[i].sqrt();
        for j in 0..d {
            dense::axpy(vectors[(j, i)] / s, &p[j * n..(j + 1) * n], &mut out[c * n..(c + 1) * n]);
        }
    }
    log::debug!("BCG: search block reduced from {d} to {} directions", keep.len());
    *p = out;
    Ok(keep.len())
}

/// `x <- G^-1 x` column by column for the upper Cholesky factor `R` of `G`.
fn cholesky_solve<T: Scalar>(w: usize, r: &[T], x: &mut ColMat<T>) {
    for c in 0..x.ncols() {
        let col = x.col_mut(c);
        dense::solve_upper_transpose(w, r, w, col);
        dense::solve_upper(w, r, w, col);
    }
}

fn run<T: Scalar, O: Operator<T>, C: Comm>(
    pb: &Problem<'_, T, O, C>,
    opts: &KrylovOptions,
    b: &[T],
    x: &mut [T],
    mu: usize,
) -> Result<SolveStats<T>, KError> {
    let n = pb.n;
    let max_it = opts.max_it;
    let t = group_size("BCG", mu, opts.enlarge_krylov_subspace);
    let mut monitor = Monitor::new("BCG", opts.verbosity, opts.effective_tol::<T>(), max_it);
    let mut marks = ConvergenceMarks::new(mu);
    let norms = reference_norms(pb, b, mu, t)?;
    settle_zero_rhs(n, &norms, x, &mut marks);
    let mut active: Vec<usize> = (0..mu).filter(|&c| marks.is_active(c)).collect();
    let mut it = 0;

    'restart: while !active.is_empty() && it < max_it {
        let d = active.len();
        let mut xa = gather_columns(n, x, &active);
        let ba = gather_columns(n, b, &active);
        let mut r = vec![T::zero(); n * d];
        pb.residual(&ba, &xa, &mut r, d);
        let mut z = vec![T::zero(); n * d];
        pb.precondition(&r, &mut z, d)?;
        let mut p = z.clone();
        loop {
            let w = orthonormalize(pb, opts, &mut p, d)?;
            if w == 0 {
                // M R vanished: nothing left to minimize over
                for &c in &active {
                    marks.mark(c, it);
                }
                scatter_columns(n, &xa, &active, x);
                break 'restart;
            }
            let mut q = vec![T::zero(); n * w];
            pb.gmv(&p, &mut q, w);

            // [P^T A P | P^T R] in one reduction
            let mut fused = ColMat::zeros(w, w + d);
            for j in 0..w + d {
                let rhs = if j < w { &q[j * n..(j + 1) * n] } else { &r[(j - w) * n..(j - w + 1) * n] };
                for i in 0..w {
                    fused[(i, j)] = pb.ip.local(&p[i * n..(i + 1) * n], rhs);
                }
            }
            pb.ip.reduce(fused.as_mut_slice());
            let mut g = fused.block(w, w).into_vec();
            dense::cholesky(w, &mut g, w).map_err(|_| {
                KError::SolveError("BCG: P^T A P is not positive definite".to_string())
            })?;
            let mut alpha = ColMat::from_fn(w, d, |i, j| fused[(i, w + j)]);
            cholesky_solve(w, &g, &mut alpha);
            dense::gemm(n, d, w, T::one(), &p, alpha.as_slice(), T::one(), &mut xa);
            dense::gemm(n, d, w, -T::one(), &q, alpha.as_slice(), T::one(), &mut r);
            it += 1;

            let groups = d / t;
            let mut summed = vec![T::zero(); n * groups];
            for j in 0..d {
                dense::axpy(T::one(), &r[j * n..(j + 1) * n], &mut summed[(j / t) * n..(j / t + 1) * n]);
            }
            let mut residuals = vec![T::zero(); groups];
            pb.ip.norms(n, &summed, &mut residuals);
            let fresh = check_group_convergence(&mut monitor, it, t, &norms, &residuals, &active, &mut marks);
            if fresh > 0 || it >= max_it {
                scatter_columns(n, &xa, &active, x);
                active.retain(|&c| marks.is_active(c));
                continue 'restart;
            }

            pb.precondition(&r, &mut z, d)?;
            let mut beta = pb.ip.gram(n, w, &q, d, &z);
            cholesky_solve(w, &g, &mut beta);
            // P <- Z - P G^-1 Q^T Z
            let mut next = z.clone();
            dense::gemm(n, d, w, -T::one(), &p, beta.as_slice(), T::one(), &mut next);
            p = next;
        }
    }
    Ok(monitor.finish(&marks, it))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::wrappers::DenseOperator;
    use crate::parallel::SelfComm;
    use approx::assert_abs_diff_eq;

    fn spd(n: usize) -> ColMat<f64> {
        ColMat::from_fn(n, n, |i, j| {
            if i == j {
                3.0 + i as f64 * 0.2
            } else if i.abs_diff(j) == 1 {
                -1.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn block_cg_solves_every_column() {
        let n = 16;
        let a = spd(n);
        let op = DenseOperator::new(a.clone());
        let b: Vec<f64> = (0..3 * n).map(|i| ((i % 7) as f64) - 3.0).collect();
        let mut x = vec![0.0; 3 * n];
        let opts = KrylovOptions::default().with_tol(1e-10).with_max_it(100);
        let stats = BcgSolver::new(opts).solve(&op, &b, &mut x, 3, &SelfComm).unwrap();
        assert!(stats.converged);
        let mut ax = vec![0.0; 3 * n];
        dense::gemm(n, 3, n, 1.0, a.as_slice(), &x, 0.0, &mut ax);
        for i in 0..3 * n {
            assert_abs_diff_eq!(ax[i], b[i], epsilon = 1e-8);
        }
    }

    #[test]
    fn dependent_columns_do_not_break_down() {
        let n = 10;
        let op = DenseOperator::new(spd(n));
        let col: Vec<f64> = (0..n).map(|i| i as f64 + 1.0).collect();
        let b = [col.clone(), col.iter().map(|v| 2.0 * v).collect()].concat();
        let mut x = vec![0.0; 2 * n];
        let opts = KrylovOptions::default().with_tol(1e-10).with_max_it(60);
        let stats = BcgSolver::new(opts).solve(&op, &b, &mut x, 2, &SelfComm).unwrap();
        assert!(stats.converged);
        for i in 0..n {
            assert_abs_diff_eq!(2.0 * x[i], x[n + i], epsilon = 1e-8);
        }
    }
}
