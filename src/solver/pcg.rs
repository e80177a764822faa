//! Deflated (projected) Conjugate Gradient.
//!
//! Uses the coarse correction `Q = Z (Z^T A Z)^-1 Z^T` attached to the operator (see
//! [`crate::core::Operator::coarse_correction`]). The initial guess is corrected to
//! `x_0 + Q r_0`, which makes `Z^T r_k = 0` for every iterate, and each preconditioned
//! residual `y = M r` is replaced by `y - Q A y`. Without a coarse space this is
//! plain preconditioned CG.
//!
//! # References
//! - Tang, J. M. et al. (2009). Comparison of two-level preconditioners derived from
//!   deflation, domain decomposition and multigrid methods (A-DEF2).

use crate::config::{KrylovOptions, Variant};
use crate::core::traits::{Operator, Scalar};
use crate::error::KError;
use crate::parallel::Comm;
use crate::solver::cg::run;
use crate::solver::{KrylovSolver, Problem};
use crate::utils::convergence::SolveStats;
use std::marker::PhantomData;

#[derive(Clone, Debug)]
pub struct PcgSolver<T> {
    pub opts: KrylovOptions,
    pub excluded: bool,
    _marker: PhantomData<T>,
}

impl<T: Scalar> PcgSolver<T> {
    pub fn new(opts: KrylovOptions) -> Self {
        Self { opts: opts.validated(), excluded: false, _marker: PhantomData }
    }

    pub fn with_excluded(mut self, excluded: bool) -> Self {
        self.excluded = excluded;
        self
    }
}

impl<T: Scalar> KrylovSolver<T> for PcgSolver<T> {
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
        let stats = run(&pb, &self.opts, b, x, mu, "PCG", true);
        op.end(token);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::wrappers::DenseOperator;
    use crate::matrix::dense::{self, ColMat};
    use crate::parallel::SelfComm;
    use approx::assert_abs_diff_eq;

    /// Exact coarse solve on the span of the first two unit vectors.
    struct TwoModes {
        a: DenseOperator<f64>,
    }

    impl Operator<f64> for TwoModes {
        fn dof(&self) -> usize {
            self.a.dof()
        }

        fn gmv(&self, input: &[f64], output: &mut [f64], mu: usize) {
            self.a.gmv(input, output, mu)
        }

        fn coarse_correction(&self, input: &[f64], output: &mut [f64], _mu: usize) -> Result<bool, KError> {
            let m = self.a.matrix();
            let e = ColMat::from_fn(2, 2, |i, j| m[(i, j)]);
            let det = e[(0, 0)] * e[(1, 1)] - e[(0, 1)] * e[(1, 0)];
            output.iter_mut().for_each(|v| *v = 0.0);
            output[0] = (e[(1, 1)] * input[0] - e[(0, 1)] * input[1]) / det;
            output[1] = (e[(0, 0)] * input[1] - e[(1, 0)] * input[0]) / det;
            Ok(true)
        }
    }

    #[test]
    fn deflated_residuals_stay_orthogonal_to_the_coarse_space() {
        let n = 12;
        let a = ColMat::from_fn(n, n, |i, j| {
            if i == j {
                if i < 2 { 0.01 } else { 2.0 + i as f64 * 0.1 }
            } else if i.abs_diff(j) == 1 && i >= 2 && j >= 2 {
                -0.5
            } else {
                0.0
            }
        });
        let op = TwoModes { a: DenseOperator::new(a.clone()) };
        let b = vec![1.0; n];
        let mut x = vec![0.0; n];
        let opts = KrylovOptions::default().with_tol(1e-10).with_max_it(50);
        let stats = PcgSolver::new(opts).solve(&op, &b, &mut x, 1, &SelfComm).unwrap();
        assert!(stats.converged);
        let mut r = vec![0.0; n];
        dense::gemv(n, n, 1.0, a.as_slice(), &x, 0.0, &mut r);
        for i in 0..n {
            assert_abs_diff_eq!(r[i], b[i], epsilon = 1e-8);
        }
    }
}
