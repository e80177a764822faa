//! Single entry point for the Krylov methods.
//!
//! [`KspContext`] holds the options of a solve and the state that outlives one solve:
//! the recycled subspaces of GCRODR and BGCRODR. Every call to [`KspContext::solve`]
//! optionally enlarges the Krylov subspace, dispatches to the selected method, and folds
//! the enlarged solution back.
//!
//! # Enlarged Krylov subspaces
//! With `enlarge_krylov_subspace = k > 1` on a group of several ranks, every right-hand
//! side is split into `k` zero-padded copies: rank `r` keeps its part in copy
//! `min(k - 1, r / (size / k))`. A block method then solves for `k * mu` columns,
//! testing convergence on groups of `k` columns, and the copies are summed back. This
//! is a heuristic to enrich the search space; it is not guaranteed to reduce the
//! iteration count.
//!
//! # Usage
//! ```rust,ignore
//! let opts = KrylovOptions::default().with_method(KrylovMethod::Gcrodr).with_recycle(5);
//! let mut ksp = KspContext::new(opts);
//! let stats = ksp.solve(&op, &b, &mut x, 1, &comm)?;
//! ```
//!
//! # References
//! - Parks, de Sturler, Mackey, Johnson, Maiti (2006). Recycling Krylov subspaces for
//!   sequences of linear systems. SIAM J. Sci. Comput.
//! - Grigori, Moufawad, Nataf (2016). Enlarged Krylov subspace conjugate gradient
//!   methods for reducing communication. SIAM J. Matrix Anal. Appl.

use crate::config::{KrylovMethod, KrylovOptions};
use crate::core::traits::{Operator, Scalar};
use crate::error::KError;
use crate::matrix::dense;
use crate::parallel::Comm;
use crate::solver::{
    BcgSolver, BgcrodrSolver, BgmresSolver, CgSolver, GcrodrSolver, GmresSolver, KrylovSolver, PcgSolver,
    RecycledSpace,
};
use crate::utils::convergence::SolveStats;

/// Context and configuration of the Krylov solves of one operator.
#[derive(Clone, Debug)]
pub struct KspContext<T> {
    opts: KrylovOptions,
    excluded: bool,
    gcrodr: GcrodrSolver<T>,
    bgcrodr: BgcrodrSolver<T>,
}

impl<T: Scalar> KspContext<T> {
    pub fn new(opts: KrylovOptions) -> Self {
        let opts = opts.validated();
        Self {
            gcrodr: GcrodrSolver::new(opts.clone()),
            bgcrodr: BgcrodrSolver::new(opts.clone()),
            opts,
            excluded: false,
        }
    }

    /// Reads the options under `prefix` from a key-value store.
    pub fn from_pairs<I, K, V>(prefix: &str, pairs: I) -> Result<Self, KError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Ok(Self::new(KrylovOptions::from_pairs(prefix, pairs)?))
    }

    /// Reads the options of `op` from a key-value store, under the operator's own
    /// [`Operator::prefix`].
    pub fn for_operator<O, I, K, V>(op: &O, pairs: I) -> Result<Self, KError>
    where
        O: Operator<T>,
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        log::debug!("reading Krylov options under prefix '{}'", op.prefix());
        Self::from_pairs(op.prefix(), pairs)
    }

    /// Marks this rank as a solver-only master holding no fine unknowns.
    pub fn with_excluded(mut self, excluded: bool) -> Self {
        self.excluded = excluded;
        self.gcrodr = self.gcrodr.with_excluded(excluded);
        self.bgcrodr = self.bgcrodr.with_excluded(excluded);
        self
    }

    pub fn options(&self) -> &KrylovOptions {
        &self.opts
    }

    /// Replaces the options. Recycled subspaces are kept.
    pub fn set_options(&mut self, opts: KrylovOptions) {
        self.opts = opts.validated();
    }

    /// Recycled subspace of the configured method, if any.
    pub fn recycled(&self) -> Option<&RecycledSpace<T>> {
        match self.opts.krylov_method {
            KrylovMethod::Gcrodr => self.gcrodr.recycled(),
            KrylovMethod::Bgcrodr => self.bgcrodr.recycled(),
            _ => None,
        }
    }

    /// Forgets every recycled subspace.
    pub fn clear_recycling(&mut self) {
        self.gcrodr.clear();
        self.bgcrodr.clear();
    }

    /// Solves `A X = B` for `mu` right-hand sides with the configured method.
    ///
    /// Returns the statistics of the method; `iterations` is `max_it + 1` when it did not
    /// converge. Collective over `comm`.
    pub fn solve<O: Operator<T>, C: Comm>(
        &mut self,
        op: &O,
        b: &[T],
        x: &mut [T],
        mu: usize,
        comm: &C,
    ) -> Result<SolveStats<T>, KError> {
        let n = if self.excluded { 0 } else { op.dof() };
        if b.len() < n * mu || x.len() < n * mu {
            return Err(KError::Config(format!(
                "{} right-hand sides of {n} unknowns need buffers of {}",
                mu,
                n * mu
            )));
        }
        match enlarge(&self.opts, n, b, x, mu, comm) {
            Some(mut enlarged) => {
                let k = enlarged.k;
                let stats = self.dispatch(&enlarged.opts, op, &enlarged.b, &mut enlarged.x, k * mu, comm)?;
                enlarged.fold(n, mu, x);
                Ok(stats)
            }
            None => {
                let opts = KrylovOptions { enlarge_krylov_subspace: 1, ..self.opts.clone() };
                self.dispatch(&opts, op, b, x, mu, comm)
            }
        }
    }

    fn dispatch<O: Operator<T>, C: Comm>(
        &mut self,
        opts: &KrylovOptions,
        op: &O,
        b: &[T],
        x: &mut [T],
        mu: usize,
        comm: &C,
    ) -> Result<SolveStats<T>, KError> {
        let excluded = self.excluded;
        match opts.krylov_method {
            KrylovMethod::Gmres => GmresSolver::new(opts.clone()).with_excluded(excluded).solve(op, b, x, mu, comm),
            KrylovMethod::Bgmres => BgmresSolver::new(opts.clone()).with_excluded(excluded).solve(op, b, x, mu, comm),
            KrylovMethod::Cg => CgSolver::new(opts.clone()).with_excluded(excluded).solve(op, b, x, mu, comm),
            KrylovMethod::Bcg => BcgSolver::new(opts.clone()).with_excluded(excluded).solve(op, b, x, mu, comm),
            KrylovMethod::Pcg => PcgSolver::new(opts.clone()).with_excluded(excluded).solve(op, b, x, mu, comm),
            KrylovMethod::Gcrodr => {
                self.gcrodr.set_options(opts.clone());
                self.gcrodr.solve(op, b, x, mu, comm)
            }
            KrylovMethod::Bgcrodr => {
                self.bgcrodr.set_options(opts.clone());
                self.bgcrodr.solve(op, b, x, mu, comm)
            }
        }
    }
}

/// Zero-padded copies of the right-hand sides and initial guesses.
struct Enlarged<T> {
    k: usize,
    opts: KrylovOptions,
    b: Vec<T>,
    x: Vec<T>,
}

impl<T: Scalar> Enlarged<T> {
    /// `x_nu = sum_j x_{j + k nu}`.
    fn fold(&self, n: usize, mu: usize, x: &mut [T]) {
        let k = self.k;
        x[..n * mu].iter_mut().for_each(|v| *v = T::zero());
        for nu in 0..mu {
            for j in 0..k {
                let slot = j + k * nu;
                dense::axpy(T::one(), &self.x[slot * n..(slot + 1) * n], &mut x[nu * n..(nu + 1) * n]);
            }
        }
    }
}

fn enlarge<T: Scalar, C: Comm>(
    opts: &KrylovOptions,
    n: usize,
    b: &[T],
    x: &[T],
    mu: usize,
    comm: &C,
) -> Option<Enlarged<T>> {
    let size = comm.size();
    if opts.enlarge_krylov_subspace < 2 || size == 1 {
        return None;
    }
    let k = opts.enlarge_krylov_subspace.min(size);
    let j = (k - 1).min(comm.rank() / (size / k));
    let mut eb = vec![T::zero(); k * mu * n];
    let mut ex = vec![T::zero(); k * mu * n];
    for nu in 0..mu {
        let slot = j + k * nu;
        eb[slot * n..(slot + 1) * n].copy_from_slice(&b[nu * n..(nu + 1) * n]);
        ex[slot * n..(slot + 1) * n].copy_from_slice(&x[nu * n..(nu + 1) * n]);
    }
    let mut opts = KrylovOptions { enlarge_krylov_subspace: k, ..opts.clone() };
    if mu > 1 {
        opts.initial_deflation_tol = -1.0;
    }
    if !opts.krylov_method.is_block() {
        log::warn!(
            "{}: block methods should be used with enlarged Krylov subspaces, switching to BGMRES",
            opts.krylov_method.name()
        );
        opts.krylov_method = KrylovMethod::Bgmres;
    }
    Some(Enlarged { k, opts, b: eb, x: ex })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Variant;
    use crate::core::wrappers::DenseOperator;
    use crate::matrix::dense::ColMat;
    use crate::parallel::SelfComm;
    use crate::preconditioner::Jacobi;
    use approx::assert_abs_diff_eq;

    fn spd(n: usize) -> ColMat<f64> {
        ColMat::from_fn(n, n, |i, j| {
            if i == j {
                4.0 + (i % 3) as f64
            } else if i.abs_diff(j) == 1 {
                -1.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn options_are_read_under_the_operator_prefix() {
        let op = DenseOperator::new(spd(4)).with_prefix("inner_");
        let pairs = [("outer_max_it", "7"), ("inner_max_it", "33"), ("inner_krylov_method", "cg")];
        let ksp = KspContext::<f64>::for_operator(&op, pairs).unwrap();
        assert_eq!(ksp.options().max_it, 33);
        assert_eq!(ksp.options().krylov_method, KrylovMethod::Cg);

        let plain = DenseOperator::new(spd(4));
        let ksp = KspContext::<f64>::for_operator(&plain, [("max_it", "12")]).unwrap();
        assert_eq!(ksp.options().max_it, 12);
    }

    #[test]
    fn every_method_solves_an_spd_system() {
        let n = 12;
        let a = spd(n);
        let b: Vec<f64> = (0..2 * n).map(|i| ((i * 7) % 5) as f64 - 2.0).collect();
        for id in 0..7 {
            let method = KrylovMethod::from_id(id).unwrap();
            let opts = KrylovOptions::default()
                .with_method(method)
                .with_tol(1e-10)
                .with_max_it(200)
                .with_restart(20)
                .with_recycle(if matches!(method, KrylovMethod::Gcrodr | KrylovMethod::Bgcrodr) { 3 } else { 0 });
            let op = DenseOperator::new(a.clone()).with_preconditioner(Jacobi::from_dense(&a));
            let mut x = vec![0.0; 2 * n];
            let stats = KspContext::new(opts).solve(&op, &b, &mut x, 2, &SelfComm).unwrap();
            assert!(stats.converged, "{} did not converge", method.name());
            let mut ax = vec![0.0; 2 * n];
            dense::gemm(n, 2, n, 1.0, a.as_slice(), &x, 0.0, &mut ax);
            for i in 0..2 * n {
                assert_abs_diff_eq!(ax[i], b[i], epsilon = 1e-7);
            }
        }
    }

    #[test]
    fn enlargement_is_a_no_op_on_one_rank() {
        let n = 6;
        let op = DenseOperator::new(spd(n));
        let b = vec![1.0; n];
        let opts = KrylovOptions::default().with_method(KrylovMethod::Cg).with_enlargement(4).with_tol(1e-12);
        let mut x = vec![0.0; n];
        let stats = KspContext::new(opts).solve(&op, &b, &mut x, 1, &SelfComm).unwrap();
        assert!(stats.converged);
        assert_eq!(stats.per_rhs.len(), 1);
    }

    #[test]
    fn recycled_space_persists_across_solves() {
        let n = 20;
        let a = ColMat::from_fn(n, n, |i, j| {
            if i == j {
                1.0 + i as f64
            } else if j == i + 1 {
                0.5
            } else {
                0.0
            }
        });
        let op = DenseOperator::new(a);
        let opts = KrylovOptions::default()
            .with_method(KrylovMethod::Gcrodr)
            .with_restart(8)
            .with_recycle(3)
            .with_variant(Variant::Right)
            .with_tol(1e-9);
        let mut ksp = KspContext::new(opts);
        let b = vec![1.0; n];
        let mut x = vec![0.0; n];
        ksp.solve(&op, &b, &mut x, 1, &SelfComm).unwrap();
        assert!(ksp.recycled().is_some());
        ksp.clear_recycling();
        assert!(ksp.recycled().is_none());
    }

    #[test]
    fn short_buffers_are_rejected() {
        let op = DenseOperator::new(spd(4));
        let mut x = vec![0.0; 3];
        let err = KspContext::new(KrylovOptions::default()).solve(&op, &[1.0; 4], &mut x, 1, &SelfComm);
        assert!(matches!(err, Err(KError::Config(_))));
    }
}
