//! GCRODR: restarted GMRES augmented by a recycled subspace that survives across
//! cycles and across solves.
//!
//! The first cycle of a fresh solver is plain GMRES; afterwards every cycle runs
//! `restart - recycle` Arnoldi steps orthogonal to `C` and minimizes over `[U V]`.
//! The space is kept per right-hand side in the solver, so solving a sequence of
//! related systems with the same solver reuses it. With `recycle_same_system` the
//! operator is assumed unchanged between solves and `C = op(U)` is not recomputed.

use crate::config::{KrylovOptions, Variant};
use crate::core::traits::{Operator, Scalar};
use crate::error::KError;
use crate::parallel::Comm;
use crate::solver::gmres::cycles;
use crate::solver::recycling::RecycledSpace;
use crate::solver::{KrylovSolver, Problem};
use crate::utils::convergence::SolveStats;

#[derive(Clone, Debug)]
pub struct GcrodrSolver<T> {
    pub opts: KrylovOptions,
    pub excluded: bool,
    space: Option<RecycledSpace<T>>,
}

impl<T: Scalar> GcrodrSolver<T> {
    pub fn new(opts: KrylovOptions) -> Self {
        Self { opts: opts.validated(), excluded: false, space: None }
    }

    pub fn with_excluded(mut self, excluded: bool) -> Self {
        self.excluded = excluded;
        self
    }

    /// Replaces the options, keeping the recycled space.
    pub fn set_options(&mut self, opts: KrylovOptions) {
        self.opts = opts.validated();
    }

    pub fn recycled(&self) -> Option<&RecycledSpace<T>> {
        self.space.as_ref()
    }

    /// Forgets the recycled space.
    pub fn clear(&mut self) {
        self.space = None;
    }
}

impl<T: Scalar> KrylovSolver<T> for GcrodrSolver<T> {
    fn solve<O: Operator<T>, C: Comm>(
        &mut self,
        op: &O,
        b: &[T],
        x: &mut [T],
        mu: usize,
        comm: &C,
    ) -> Result<SolveStats<T>, KError> {
        let mut variant = self.opts.variant;
        if variant == Variant::Flexible {
            log::warn!("GCRODR: flexible variant not available, using right preconditioning");
            variant = Variant::Right;
        }
        let pb = Problem::new(op, comm, self.excluded, variant);
        let token = op.start(b, x, mu, self.excluded);
        let stats = if self.opts.recycle == 0 {
            cycles(&pb, &self.opts, b, x, mu, None, "GCRODR")
        } else {
            cycles(&pb, &self.opts, b, x, mu, Some(&mut self.space), "GCRODR")
        };
        op.end(token);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::wrappers::DenseOperator;
    use crate::matrix::dense::ColMat;
    use crate::parallel::SelfComm;

    #[test]
    fn first_solve_builds_a_space() {
        let n = 30;
        let op = DenseOperator::new(ColMat::from_fn(n, n, |i, j| if i == j { 1.0 + i as f64 } else { 0.0 }));
        let b = vec![1.0; n];
        let mut x = vec![0.0; n];
        let opts = KrylovOptions::default().with_tol(1e-10).with_restart(8).with_recycle(3).with_max_it(300);
        let mut solver = GcrodrSolver::new(opts);
        let stats = solver.solve(&op, &b, &mut x, 1, &SelfComm).unwrap();
        assert!(stats.converged);
        let space = solver.recycled().unwrap();
        assert!(space.is_valid(0));
        assert_eq!(space.dim(), 3);
    }
}
