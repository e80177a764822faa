//! Preconditioned Conjugate Gradient per Saad §9.2, over several right-hand sides in
//! lockstep.
//!
//! The columns are independent CG recurrences sharing their reductions: one for
//! `p^T A p`, one fused reduction for `r^T z` and `r^T r` (plus `z^T r_old` in the
//! flexible variant, which uses the Polak-Ribière formula for `beta`). Convergence is
//! tested on the unpreconditioned residual `||r|| / ||b||`.

use crate::config::{KrylovOptions, Variant};
use crate::core::traits::{Operator, Scalar};
use crate::error::KError;
use crate::matrix::dense;
use crate::parallel::Comm;
use crate::solver::{KrylovSolver, Problem, settle_zero_rhs};
use crate::utils::convergence::{ConvergenceMarks, Monitor, SolveStats, check_convergence};
use std::marker::PhantomData;

#[derive(Clone, Debug)]
pub struct CgSolver<T> {
    pub opts: KrylovOptions,
    pub excluded: bool,
    _marker: PhantomData<T>,
}

impl<T: Scalar> CgSolver<T> {
    pub fn new(opts: KrylovOptions) -> Self {
        Self { opts: opts.validated(), excluded: false, _marker: PhantomData }
    }

    pub fn with_excluded(mut self, excluded: bool) -> Self {
        self.excluded = excluded;
        self
    }
}

impl<T: Scalar> KrylovSolver<T> for CgSolver<T> {
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
        let stats = run(&pb, &self.opts, b, x, mu, "CG", false);
        op.end(token);
        stats
    }
}

/// Applies the coarse-space projection `z <- y - Q A y` when `deflated` is set.
fn project<T: Scalar, O: Operator<T>, C: Comm>(
    pb: &Problem<'_, T, O, C>,
    y: &[T],
    z: &mut [T],
    work: &mut [T],
    corr: &mut [T],
    mu: usize,
    deflated: bool,
) -> Result<(), KError> {
    z.copy_from_slice(y);
    if deflated {
        pb.gmv(y, work, mu);
        if pb.op.coarse_correction(work, corr, mu)? {
            dense::axpy(-T::one(), corr, z);
        }
    }
    Ok(())
}

/// CG iteration shared with PCG. With `deflated` set, the initial guess is corrected
/// by the coarse solve and every preconditioned residual is projected.
pub(crate) fn run<T: Scalar, O: Operator<T>, C: Comm>(
    pb: &Problem<'_, T, O, C>,
    opts: &KrylovOptions,
    b: &[T],
    x: &mut [T],
    mu: usize,
    name: &'static str,
    deflated: bool,
) -> Result<SolveStats<T>, KError> {
    let n = pb.n;
    let blk = n * mu;
    let max_it = opts.max_it;
    let flexible = opts.variant == Variant::Flexible;
    let mut monitor = Monitor::new(name, opts.verbosity, opts.effective_tol::<T>(), max_it);
    let mut marks = ConvergenceMarks::new(mu);
    let mut norms = vec![T::zero(); mu];
    pb.ip.norms(n, b, &mut norms);
    settle_zero_rhs(n, &norms, x, &mut marks);
    if marks.all_converged() {
        return Ok(monitor.finish(&marks, 0));
    }

    let mut r = vec![T::zero(); blk];
    let mut y = vec![T::zero(); blk];
    let mut z = vec![T::zero(); blk];
    let mut q = vec![T::zero(); blk];
    let mut corr = vec![T::zero(); blk];
    pb.residual(b, x, &mut r, mu);
    if deflated && pb.op.coarse_correction(&r, &mut corr, mu)? {
        dense::axpy(T::one(), &corr, x);
        pb.residual(b, x, &mut r, mu);
    }
    pb.precondition(&r, &mut y, mu)?;
    project(pb, &y, &mut z, &mut q, &mut corr, mu, deflated)?;
    let mut p = z.clone();
    let mut r_old = if flexible { r.clone() } else { Vec::new() };
    let mut rz = vec![T::zero(); mu];
    pb.ip.dots(n, &r, &z, &mut rz);

    let width = if flexible { 3 } else { 2 };
    let mut fused = vec![T::zero(); width * mu];
    let mut pq = vec![T::zero(); mu];
    let mut it = 0;
    while it < max_it {
        pb.gmv(&p, &mut q, mu);
        pb.ip.dots(n, &p, &q, &mut pq);
        if flexible {
            r_old.copy_from_slice(&r);
        }
        // curvature is reduced, so every rank takes the same exit
        let stalled = |nu: usize| !(pq[nu] > T::zero());
        if let Some(nu) = (0..mu).find(|&nu| marks.is_active(nu) && stalled(nu) && rz[nu] != T::zero()) {
            log::error!("{name}: p^T A p = {:e} for column {nu}, operator is not positive definite", pq[nu]);
            return Err(KError::Breakdown(nu + 1));
        }
        // a column whose preconditioned residual vanished has no direction left
        for nu in (0..mu).filter(|&nu| marks.is_active(nu) && !stalled(nu)) {
            let alpha = rz[nu] / pq[nu];
            let cols = nu * n..(nu + 1) * n;
            dense::axpy(alpha, &p[cols.clone()], &mut x[cols.clone()]);
            dense::axpy(-alpha, &q[cols.clone()], &mut r[cols]);
        }
        it += 1;

        pb.precondition(&r, &mut y, mu)?;
        project(pb, &y, &mut z, &mut q, &mut corr, mu, deflated)?;
        for nu in 0..mu {
            let cols = nu * n..(nu + 1) * n;
            fused[nu] = pb.ip.local(&r[cols.clone()], &z[cols.clone()]);
            fused[mu + nu] = pb.ip.local(&r[cols.clone()], &r[cols.clone()]);
            if flexible {
                fused[2 * mu + nu] = pb.ip.local(&r_old[cols.clone()], &z[cols]);
            }
        }
        pb.ip.reduce(&mut fused);
        let residuals: Vec<T> = fused[mu..2 * mu].iter().map(|v| v.max(T::zero()).sqrt()).collect();
        check_convergence(&mut monitor, it, &norms, &residuals, &mut marks);
        if marks.all_converged() {
            break;
        }

        for nu in (0..mu).filter(|&nu| marks.is_active(nu)) {
            let rz_new = fused[nu];
            let numerator = if flexible { rz_new - fused[2 * mu + nu] } else { rz_new };
            let beta = if rz[nu] != T::zero() { numerator / rz[nu] } else { T::zero() };
            rz[nu] = rz_new;
            for i in nu * n..(nu + 1) * n {
                p[i] = z[i] + beta * p[i];
            }
        }
    }
    Ok(monitor.finish(&marks, it))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::wrappers::DenseOperator;
    use crate::matrix::dense::ColMat;
    use crate::parallel::SelfComm;
    use crate::preconditioner::Jacobi;
    use approx::assert_abs_diff_eq;

    fn laplacian(n: usize) -> ColMat<f64> {
        ColMat::from_fn(n, n, |i, j| {
            if i == j {
                2.0 + 0.1 * i as f64
            } else if i.abs_diff(j) == 1 {
                -1.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn jacobi_preconditioned_cg() {
        let n = 10;
        let a = laplacian(n);
        let op = DenseOperator::new(a.clone()).with_preconditioner(Jacobi::from_dense(&a));
        let b = vec![1.0; n];
        let mut x = vec![0.0; n];
        let opts = KrylovOptions::default().with_tol(1e-10).with_max_it(50);
        let stats = CgSolver::new(opts).solve(&op, &b, &mut x, 1, &SelfComm).unwrap();
        assert!(stats.converged);
        assert!(stats.iterations <= n);
        let mut ax = vec![0.0; n];
        dense::gemv(n, n, 1.0, a.as_slice(), &x, 0.0, &mut ax);
        for i in 0..n {
            assert_abs_diff_eq!(ax[i], 1.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn flexible_matches_standard_with_fixed_preconditioner() {
        let n = 8;
        let a = laplacian(n);
        let b: Vec<f64> = (0..n).map(|i| (i as f64).sin()).collect();
        let opts = KrylovOptions::default().with_tol(1e-12).with_max_it(n);
        let (mut x1, mut x2) = (vec![0.0; n], vec![0.0; n]);
        let op = DenseOperator::new(a.clone()).with_preconditioner(Jacobi::from_dense(&a));
        CgSolver::new(opts.clone()).solve(&op, &b, &mut x1, 1, &SelfComm).unwrap();
        CgSolver::new(opts.with_variant(Variant::Flexible))
            .solve(&op, &b, &mut x2, 1, &SelfComm)
            .unwrap();
        for i in 0..n {
            assert_abs_diff_eq!(x1[i], x2[i], epsilon = 1e-8);
        }
    }
    #[test]
    fn indefinite_operator_is_a_breakdown() {
        let a = ColMat::from_fn(3, 3, |i, j| if i == j { [1.0, -3.0, 1.0][i] } else { 0.0 });
        let op = DenseOperator::new(a);
        let b = vec![1.0; 6];
        let mut x = vec![0.0; 6];
        let opts = KrylovOptions::default().with_max_it(20);
        let err = CgSolver::new(opts).solve(&op, &b, &mut x, 2, &SelfComm).unwrap_err();
        assert_eq!(err, KError::Breakdown(1));
        assert!(x.iter().all(|&v| v == 0.0));
    }
}
