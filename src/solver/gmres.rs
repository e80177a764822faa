//! Restarted GMRES over several right-hand sides in lockstep (Saad §6.4).
//!
//! The `mu` columns share every reduction but build independent Krylov spaces, each
//! with its own Hessenberg matrix and Givens rotations. A column is frozen once its
//! residual estimate passes the test; it stops contributing new directions and its
//! least-squares dimension stays at the step where it converged.
//!
//! # Features
//! - Left, right or flexible preconditioning
//! - Classical (one reduction per step) or modified Gram-Schmidt
//! - Optional augmentation by a recycled space, which turns the cycle into GCRODR
//!
//! # References
//! - Saad, Y. (2003). Iterative Methods for Sparse Linear Systems, 2nd Edition. SIAM. §6.4
//! - Parks, M. L. et al. (2006). Recycling Krylov subspaces for sequences of linear systems.

use crate::config::{KrylovOptions, Variant};
use crate::core::traits::{Operator, Scalar};
use crate::error::KError;
use crate::matrix::dense::{self, ColMat};
use crate::parallel::Comm;
use crate::solver::kernels::{arnoldi, orthogonalization};
use crate::solver::recycling::{RecycledSpace, combine, update_coefficients};
use crate::solver::workspace::{Buffers, KrylovState};
use crate::solver::{KrylovSolver, Problem, settle_zero_rhs, zero_inactive};
use crate::utils::convergence::{ConvergenceMarks, Monitor, SolveStats, check_convergence};
use std::marker::PhantomData;

/// GMRES solver with fixed restart.
#[derive(Clone, Debug)]
pub struct GmresSolver<T> {
    pub opts: KrylovOptions,
    pub excluded: bool,
    _marker: PhantomData<T>,
}

impl<T: Scalar> GmresSolver<T> {
    pub fn new(opts: KrylovOptions) -> Self {
        Self { opts: opts.validated(), excluded: false, _marker: PhantomData }
    }

    /// Marks this rank as excluded: it owns no unknowns but joins every reduction.
    pub fn with_excluded(mut self, excluded: bool) -> Self {
        self.excluded = excluded;
        self
    }
}

impl<T: Scalar> KrylovSolver<T> for GmresSolver<T> {
    fn solve<O: Operator<T>, C: Comm>(
        &mut self,
        op: &O,
        b: &[T],
        x: &mut [T],
        mu: usize,
        comm: &C,
    ) -> Result<SolveStats<T>, KError> {
        let pb = Problem::new(op, comm, self.excluded, self.opts.variant);
        let token = op.start(b, x, mu, self.excluded);
        let stats = cycles(&pb, &self.opts, b, x, mu, None, "GMRES");
        op.end(token);
        stats
    }
}

/// Accumulates `acc(:, nu) += sum_j coeffs[nu][j] * dirs_j(:, nu)`.
pub(crate) fn accumulate<T: Scalar>(n: usize, mu: usize, dirs: Buffers<'_, T>, coeffs: &[Vec<T>], acc: &mut [T]) {
    for (nu, y) in coeffs.iter().enumerate() {
        let dst = &mut acc[nu * n..(nu + 1) * n];
        for (j, &w) in y.iter().enumerate() {
            dense::axpy(w, &dirs.item(j, n * mu)[nu * n..(nu + 1) * n], dst);
        }
    }
}

/// The restart loop shared by GMRES and GCRODR. With `recycle` set, every cycle is
/// augmented by the recycled space of `opts.recycle` directions per column, which is
/// created on first use and rebuilt after every cycle.
pub(crate) fn cycles<T: Scalar, O: Operator<T>, C: Comm>(
    pb: &Problem<'_, T, O, C>,
    opts: &KrylovOptions,
    b: &[T],
    x: &mut [T],
    mu: usize,
    mut recycle: Option<&mut Option<RecycledSpace<T>>>,
    name: &'static str,
) -> Result<SolveStats<T>, KError> {
    let n = pb.n;
    let blk = n * mu;
    let (m, max_it) = (opts.gmres_restart, opts.max_it);
    let k = opts.recycle;
    let flexible = pb.variant == Variant::Flexible;
    let mut monitor = Monitor::new(name, opts.verbosity, opts.effective_tol::<T>(), max_it);
    let mut marks = ConvergenceMarks::new(mu);
    let norms = pb.rhs_norms(b, mu)?;
    settle_zero_rhs(n, &norms, x, &mut marks);
    if marks.all_converged() {
        return Ok(monitor.finish(&marks, 0));
    }

    if let Some(slot) = recycle.as_deref_mut() {
        if slot.as_ref().is_some_and(|s| !s.fits(n, mu, pb.variant) || s.dim() != k) {
            log::debug!("{name}: recycled space does not match this solve, discarded");
            *slot = None;
        }
        if let Some(space) = slot.as_mut() {
            if space.any_valid() && !opts.recycle_same_system {
                space.refresh(pb, opts.qr)?;
            }
        } else {
            *slot = Some(RecycledSpace::new(n, k, mu, pb.variant));
        }
    }

    let save = recycle.is_some();
    let mut state = KrylovState::new(n, mu, m, flexible, save);
    let mut r = vec![T::zero(); blk];
    let mut tmp = vec![T::zero(); blk];
    let mut acc = vec![T::zero(); blk];
    let mut beta = vec![T::zero(); mu];
    let mut coeffs = vec![T::zero(); k * mu];
    let mut bmat: Vec<ColMat<T>> = (0..mu).map(|_| ColMat::zeros(k, m)).collect();
    let mut it = 0;
    let mut first = true;
    loop {
        pb.krylov_residual(b, x, &mut r, &mut tmp, mu)?;
        zero_inactive(n, &mut r, &marks);
        let space = recycle.as_deref().and_then(Option::as_ref).filter(|s| s.any_valid());
        if let Some(space) = space {
            if first || !opts.recycle_same_system {
                acc.iter_mut().for_each(|v| *v = T::zero());
                space.project_columns(&pb.ip, &mut r, &mut acc);
                pb.correct(&acc, x, &mut tmp, mu)?;
            }
        }
        first = false;

        pb.ip.norms(n, &r, &mut beta);
        {
            let v0 = state.block_mut(0);
            for nu in 0..mu {
                let col = &mut v0[nu * n..(nu + 1) * n];
                if beta[nu] > T::zero() {
                    for (v, &ri) in col.iter_mut().zip(&r[nu * n..(nu + 1) * n]) {
                        *v = ri / beta[nu];
                    }
                } else {
                    col.iter_mut().for_each(|v| *v = T::zero());
                }
            }
        }
        state.hessenberg.reset(&beta);

        let steps = if space.is_some() { m - k } else { m };
        let mut dims = vec![0usize; mu];
        let mut j = 0;
        while j < steps && it < max_it {
            {
                let (head, tail) = state.basis.split_at_mut((j + 1) * blk);
                let w = &mut tail[..blk];
                let z = if flexible { Some(state.precond[j].as_mut_slice()) } else { None };
                pb.krylov_op(&head[j * blk..], w, &mut tmp, mu, z)?;
                zero_inactive(n, w, &marks);
                if let Some(space) = space {
                    orthogonalization(opts.orthogonalization, n, k, mu, space.c(), w, &mut coeffs, &pb.ip);
                    for (nu, bm) in bmat.iter_mut().enumerate() {
                        for i in 0..k {
                            bm[(i, j)] = coeffs[i * mu + nu];
                        }
                    }
                }
            }
            arnoldi(
                opts.orthogonalization,
                n,
                j,
                &mut state.basis,
                &mut state.hessenberg,
                state.saved.as_deref_mut(),
                &pb.ip,
            );
            it += 1;
            j += 1;
            let residuals: Vec<T> = (0..mu).map(|nu| state.hessenberg.residual(j - 1, nu)).collect();
            let before: Vec<bool> = (0..mu).map(|nu| marks.is_active(nu)).collect();
            check_convergence(&mut monitor, it, &norms, &residuals, &mut marks);
            for nu in (0..mu).filter(|&nu| before[nu]) {
                dims[nu] = j;
            }
            if marks.all_converged() {
                break;
            }
        }

        let ys: Vec<Vec<T>> = (0..mu).map(|nu| state.hessenberg.solve(dims[nu], nu)).collect();
        acc.iter_mut().for_each(|v| *v = T::zero());
        let dirs = if flexible { Buffers::PerItem(&state.precond) } else { Buffers::Contiguous(&state.basis) };
        accumulate(n, mu, dirs, &ys, &mut acc);
        if let Some(space) = space {
            let yu: Vec<Vec<T>> = (0..mu)
                .map(|nu| {
                    (0..k)
                        .map(|i| -(0..dims[nu]).map(|c| bmat[nu][(i, c)] * ys[nu][c]).sum::<T>())
                        .collect()
                })
                .collect();
            accumulate(n, mu, Buffers::Contiguous(space.u()), &yu, &mut acc);
        }
        pb.correct(&acc, x, &mut tmp, mu)?;

        if let Some(slot) = recycle.as_deref_mut() {
            if let Some(space) = slot.as_mut() {
                rebuild(pb, opts, space, &state, &bmat, &dims)?;
            }
        }
        if marks.all_converged() || it >= max_it {
            break;
        }
    }
    Ok(monitor.finish(&marks, it))
}

/// Rebuilds the recycled space of every column from the cycle that just ended.
fn rebuild<T: Scalar, O: Operator<T>, C: Comm>(
    pb: &Problem<'_, T, O, C>,
    opts: &KrylovOptions,
    space: &mut RecycledSpace<T>,
    state: &KrylovState<T>,
    bmat: &[ColMat<T>],
    dims: &[usize],
) -> Result<(), KError> {
    let (n, mu, k) = (pb.n, space.width(), space.dim());
    let Some(saved) = state.saved.as_ref() else { return Ok(()) };
    let scales = if space.any_valid() { space.inverse_norms(&pb.ip) } else { vec![T::zero(); k * mu] };
    let dirs = if pb.variant == Variant::Flexible {
        Buffers::PerItem(&state.precond)
    } else {
        Buffers::Contiguous(&state.basis)
    };
    let column = |j: usize, nu: usize| &state.basis[j * n * mu + nu * n..j * n * mu + (nu + 1) * n];
    for nu in 0..mu {
        let d = dims[nu];
        let valid = space.is_valid(nu);
        let kk = if valid { k } else { 0 };
        if d == 0 || kk + d < k {
            continue;
        }
        let mut g = ColMat::zeros(kk + d + 1, kk + d);
        for i in 0..kk {
            g[(i, i)] = scales[i * mu + nu];
            for c in 0..d {
                g[(i, kk + c)] = bmat[nu][(i, c)];
            }
        }
        for c in 0..d {
            for r in 0..=c + 1 {
                g[(kk + r, kk + c)] = saved[nu][(r, c)];
            }
        }
        let Some((w, q)) = update_coefficients(&g, k, opts.recycle_target, opts.recycle_strategy)? else {
            log::debug!("recycled space of column {nu} kept: rank-deficient update");
            continue;
        };
        let scaled: Vec<Vec<T>> = (0..kk)
            .map(|i| space.u_col(i, nu).iter().map(|&v| v * scales[i * mu + nu]).collect())
            .collect();
        let mut u_new = vec![T::zero(); n * k];
        combine(
            n,
            |j| if j < kk { scaled[j].as_slice() } else { &dirs.item(j - kk, n * mu)[nu * n..(nu + 1) * n] },
            &w,
            &mut u_new,
        );
        let c_old = space.packed_c(nu);
        let mut c_new = vec![T::zero(); n * k];
        combine(
            n,
            |j| if j < kk { &c_old[j * n..(j + 1) * n] } else { column(j - kk, nu) },
            &q,
            &mut c_new,
        );
        space.store(nu, &u_new, &c_new);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::wrappers::DenseOperator;
    use crate::parallel::SelfComm;
    use approx::assert_abs_diff_eq;

    fn diag(values: &[f64]) -> DenseOperator<f64> {
        let n = values.len();
        DenseOperator::new(ColMat::from_fn(n, n, |i, j| if i == j { values[i] } else { 0.0 }))
    }

    #[test]
    fn solves_a_small_nonsymmetric_system() {
        let a = ColMat::from_fn(3, 3, |i, j| [[4.0, 1.0, 0.0], [2.0, 5.0, 1.0], [0.0, 1.0, 3.0]][i][j]);
        let op = DenseOperator::new(a.clone());
        let b = vec![1.0, 2.0, 3.0];
        let mut x = vec![0.0; 3];
        let opts = KrylovOptions::default().with_tol(1e-12).with_restart(3);
        let stats = GmresSolver::new(opts).solve(&op, &b, &mut x, 1, &SelfComm).unwrap();
        assert!(stats.converged);
        let mut ax = vec![0.0; 3];
        dense::gemv(3, 3, 1.0, a.as_slice(), &x, 0.0, &mut ax);
        for i in 0..3 {
            assert_abs_diff_eq!(ax[i], b[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn zero_rhs_converges_at_iteration_zero() {
        let op = diag(&[1.0, 2.0]);
        let b = vec![1.0, 1.0, 0.0, 0.0];
        let mut x = vec![0.0, 0.0, 5.0, 5.0];
        let opts = KrylovOptions::default().with_tol(1e-10);
        let stats = GmresSolver::new(opts).solve(&op, &b, &mut x, 2, &SelfComm).unwrap();
        assert_eq!(stats.per_rhs[1], Some(0));
        assert_eq!(&x[2..], &[0.0, 0.0]);
        assert_abs_diff_eq!(x[1], 0.5, epsilon = 1e-10);
    }

    #[test]
    fn restarts_keep_progress() {
        let values: Vec<f64> = (1..=20).map(|v| v as f64).collect();
        let op = diag(&values);
        let b = vec![1.0; 20];
        let mut x = vec![0.0; 20];
        let opts = KrylovOptions::default().with_tol(1e-8).with_restart(5).with_max_it(200);
        let stats = GmresSolver::new(opts).solve(&op, &b, &mut x, 1, &SelfComm).unwrap();
        assert!(stats.converged);
        for (i, v) in x.iter().enumerate() {
            assert_abs_diff_eq!(*v, 1.0 / values[i], epsilon = 1e-6);
        }
    }
}
