//! Block GMRES: one Krylov space of width `d` shared by all right-hand sides.
//!
//! Each cycle starts from the block of active residuals `R = V_0 S_0`. Block Arnoldi
//! extends the basis `d` vectors at a time, and the block Hessenberg matrix is reduced
//! by Householder reflectors so that the projected residual of every column is
//! available after each step.
//!
//! # Features
//! - Deflation of converged columns: the cycle ends as soon as a column (or group)
//!   converges and the next one is built for the remaining columns only
//! - Initial deflation of nearly dependent residuals through the eigenvalues of `R^T R`
//! - Group convergence for enlarged Krylov subspaces
//! - Optional augmentation by a shared recycled space (BGCRODR)
//!
//! # References
//! - Gutknecht, M. H. (2007). Block Krylov space methods for linear systems with
//!   multiple right-hand sides: an introduction.
//! - Parks, M. L. et al. (2006). Recycling Krylov subspaces for sequences of linear systems.

use crate::config::{KrylovOptions, Variant};
use crate::core::traits::{Operator, Scalar, cast};
use crate::error::KError;
use crate::matrix::dense::{self, ColMat};
use crate::parallel::Comm;
use crate::solver::kernels::{block_arnoldi, block_orthogonalization, qr};
use crate::solver::recycling::{RecycledSpace, combine, update_coefficients};
use crate::solver::workspace::BlockKrylovState;
use crate::solver::{
    KrylovSolver, Problem, gather_columns, group_size, reference_norms, scatter_columns, settle_zero_rhs,
};
use crate::utils::convergence::{ConvergenceMarks, Monitor, SolveStats, check_block_convergence};
use std::marker::PhantomData;

#[derive(Clone, Debug)]
pub struct BgmresSolver<T> {
    pub opts: KrylovOptions,
    pub excluded: bool,
    _marker: PhantomData<T>,
}

impl<T: Scalar> BgmresSolver<T> {
    pub fn new(opts: KrylovOptions) -> Self {
        Self { opts: opts.validated(), excluded: false, _marker: PhantomData }
    }

    pub fn with_excluded(mut self, excluded: bool) -> Self {
        self.excluded = excluded;
        self
    }
}

impl<T: Scalar> KrylovSolver<T> for BgmresSolver<T> {
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
        let stats = block_cycles(&pb, &self.opts, b, x, mu, None, "BGMRES");
        op.end(token);
        stats
    }
}

/// Orthonormal starting block `V_0` and coefficients `S_0` with `R ~ V_0 S_0`.
///
/// Returns the width `w <= ncols` of `V_0`. Without initial deflation the block is
/// factored by `opts.qr`; when that breaks down, or when deflation is requested, the
/// directions come from the eigen-decomposition of `R^T R` and those with
/// `lambda <= tol^2 lambda_max` are dropped.
pub(crate) fn initial_block<T: Scalar, O: Operator<T>, C: Comm>(
    pb: &Problem<'_, T, O, C>,
    opts: &KrylovOptions,
    r: &[T],
    ncols: usize,
    t: usize,
) -> Result<(Vec<T>, ColMat<T>, usize), KError> {
    let n = pb.n;
    let deflate = opts.initial_deflation_tol > 0.0 && ncols > 1 && t <= 1;
    if !deflate {
        let mut q = r.to_vec();
        let mut s = vec![T::zero(); ncols * ncols];
        match qr(opts.qr, n, ncols, &mut q, &mut s, ncols, &pb.ip, true) {
            Ok(()) => return Ok((q, ColMat::from_col_major(ncols, ncols, s), ncols)),
            Err(KError::Breakdown(col)) => {
                log::debug!("rank-deficient residual block at column {col}, deflating")
            }
            Err(e) => return Err(e),
        }
    }
    let tol: T = if deflate { cast(opts.initial_deflation_tol) } else { cast::<T>(1.0e-6).max(T::epsilon().sqrt()) };
    let gram = pb.ip.gram(n, ncols, r, ncols, r);
    let (values, vectors) = dense::sym_eigen(&gram)?;
    let lmax = values.last().copied().unwrap_or_else(T::zero);
    if lmax <= T::zero() {
        return Ok((Vec::new(), ColMat::zeros(0, ncols), 0));
    }
    let keep: Vec<usize> = (0..ncols).rev().filter(|&i| values[i] > tol * tol * lmax).collect();
    let w = keep.len();
    let mut v0 = vec![T::zero(); n * w];
    for (q, &i) in keep.iter().enumerate() {
        let s = values[i].sqrt();
        for c in 0..ncols {
            dense::axpy(vectors[(c, i)] / s, &r[c * n..(c + 1) * n], &mut v0[q * n..(q + 1) * n]);
        }
    }
    let s0 = ColMat::from_fn(w, ncols, |q, c| values[keep[q]].sqrt() * vectors[(c, keep[q])]);
    if w < ncols && opts.verbosity > 1 {
        log::info!("initial deflation: block of {ncols} residuals reduced to width {w}");
    }
    Ok((v0, s0, w))
}

/// The restart loop shared by BGMRES and BGCRODR. With `recycle` set the cycles are
/// augmented by a shared recycled space of `opts.recycle` directions per basis column.
pub(crate) fn block_cycles<T: Scalar, O: Operator<T>, C: Comm>(
    pb: &Problem<'_, T, O, C>,
    opts: &KrylovOptions,
    b: &[T],
    x: &mut [T],
    mu: usize,
    mut recycle: Option<&mut Option<RecycledSpace<T>>>,
    name: &'static str,
) -> Result<SolveStats<T>, KError> {
    let n = pb.n;
    let (m, max_it, k) = (opts.gmres_restart, opts.max_it, opts.recycle);
    let t = group_size(name, mu, opts.enlarge_krylov_subspace);
    let flexible = pb.variant == Variant::Flexible;
    let mut monitor = Monitor::new(name, opts.verbosity, opts.effective_tol::<T>(), max_it);
    let mut marks = ConvergenceMarks::new(mu);
    let norms = reference_norms(pb, b, mu, t)?;
    settle_zero_rhs(n, &norms, x, &mut marks);
    if marks.all_converged() {
        return Ok(monitor.finish(&marks, 0));
    }

    if let Some(slot) = recycle.as_deref_mut() {
        if slot.as_ref().is_some_and(|s| !s.fits(n, 1, pb.variant)) {
            log::debug!("{name}: recycled space does not match this solve, discarded");
            *slot = None;
        }
        if let Some(space) = slot.as_mut() {
            if space.any_valid() && !opts.recycle_same_system {
                space.refresh(pb, opts.qr)?;
            }
        }
    }

    let mut active: Vec<usize> = (0..mu).filter(|&c| marks.is_active(c)).collect();
    let mut it = 0;
    let mut first = true;
    loop {
        let da = active.len();
        let mut xa = gather_columns(n, x, &active);
        let ba = gather_columns(n, b, &active);
        let mut r = vec![T::zero(); n * da];
        let mut tmp = vec![T::zero(); n * da];
        pb.krylov_residual(&ba, &xa, &mut r, &mut tmp, da)?;
        let space = recycle.as_deref().and_then(Option::as_ref).filter(|s| s.any_valid());
        if let Some(space) = space {
            if first || !opts.recycle_same_system {
                let mut acc = vec![T::zero(); n * da];
                space.project_block(&pb.ip, &mut r, da, &mut acc);
                pb.correct(&acc, &mut xa, &mut tmp, da)?;
            }
        }
        first = false;

        let (v0, s0, w) = initial_block(pb, opts, &r, da, t)?;
        if w == 0 {
            // every active residual is exactly zero
            for &c in &active {
                marks.mark(c, it);
            }
            scatter_columns(n, &xa, &active, x);
            break;
        }
        let ku = space.map_or(0, |s| s.dim());
        let steps_max = if space.is_some() { m.saturating_sub(k).max(1) } else { m };
        let blk = n * w;
        let mut state = BlockKrylovState::new(n, w, da, steps_max, flexible, recycle.is_some());
        state.block_mut(0).copy_from_slice(&v0);
        state.hessenberg.reset(&s0);
        let mut bstore = ColMat::zeros(ku, steps_max * w);
        let mut wtmp = vec![T::zero(); blk];
        let mut steps = 0;
        for i in 0..steps_max {
            if it >= max_it {
                break;
            }
            {
                let (head, tail) = state.basis.split_at_mut((i + 1) * blk);
                let wblk = &mut tail[..blk];
                let z = if flexible { Some(state.precond[i].as_mut_slice()) } else { None };
                pb.krylov_op(&head[i * blk..], wblk, &mut wtmp, w, z)?;
                if let Some(space) = space {
                    let coeffs = &mut bstore.as_mut_slice()[i * w * ku..];
                    block_orthogonalization(opts.orthogonalization, n, 1, ku, w, space.c(), wblk, coeffs, ku, &pb.ip);
                }
            }
            let breakdown = block_arnoldi(
                opts.orthogonalization,
                opts.qr,
                n,
                i,
                &mut state.basis,
                &mut state.hessenberg,
                state.saved.as_mut(),
                &pb.ip,
            )?;
            it += 1;
            steps = i + 1;
            let (columns, rows, ld) = state.hessenberg.residual_block(i);
            let fresh = check_block_convergence(&mut monitor, it, t, &norms, columns, rows, ld, &active, &mut marks);
            if breakdown || fresh > 0 {
                break;
            }
        }

        if steps > 0 {
            let y = state.hessenberg.solve(steps);
            let mut acc = vec![T::zero(); n * da];
            if flexible {
                for (j, z) in state.precond.iter().take(steps).enumerate() {
                    let yj = ColMat::from_fn(w, da, |r, c| y[(j * w + r, c)]);
                    dense::gemm(n, da, w, T::one(), z, yj.as_slice(), T::one(), &mut acc);
                }
            } else {
                dense::gemm(n, da, steps * w, T::one(), &state.basis, y.as_slice(), T::zero(), &mut acc);
            }
            if let Some(space) = space {
                let mut yu = vec![T::zero(); ku * da];
                dense::gemm(ku, da, steps * w, -T::one(), bstore.as_slice(), y.as_slice(), T::zero(), &mut yu);
                dense::gemm(n, da, ku, T::one(), space.u(), &yu, T::one(), &mut acc);
            }
            pb.correct(&acc, &mut xa, &mut tmp, da)?;
        }
        scatter_columns(n, &xa, &active, x);

        if let Some(slot) = recycle.as_deref_mut() {
            if steps > 0 {
                rebuild_shared(pb, opts, slot, &state, &bstore, steps)?;
            }
        }
        active.retain(|&c| marks.is_active(c));
        if active.is_empty() || it >= max_it {
            break;
        }
    }
    Ok(monitor.finish(&marks, it))
}

/// Rebuilds (or creates) the shared recycled space from the cycle that just ended.
fn rebuild_shared<T: Scalar, O: Operator<T>, C: Comm>(
    pb: &Problem<'_, T, O, C>,
    opts: &KrylovOptions,
    slot: &mut Option<RecycledSpace<T>>,
    state: &BlockKrylovState<T>,
    bstore: &ColMat<T>,
    steps: usize,
) -> Result<(), KError> {
    let Some(saved) = state.saved.as_ref() else { return Ok(()) };
    let (n, w) = (pb.n, state.d);
    let current = slot.as_ref().filter(|s| s.any_valid());
    let ku = current.map_or(opts.recycle * w, |s| s.dim());
    let kk = if current.is_some() { ku } else { 0 };
    let cols = kk + steps * w;
    if ku == 0 || cols < ku {
        return Ok(());
    }
    let mut g = ColMat::zeros(cols + w, cols);
    if let Some(space) = current {
        let scales = space.inverse_norms(&pb.ip);
        for i in 0..kk {
            g[(i, i)] = scales[i];
            for c in 0..steps * w {
                g[(i, kk + c)] = bstore[(i, c)];
            }
        }
    }
    for c in 0..steps * w {
        for r in 0..(steps + 1) * w {
            g[(kk + r, kk + c)] = saved[(r, c)];
        }
    }
    let Some((coef_u, coef_c)) = update_coefficients(&g, ku, opts.recycle_target, opts.recycle_strategy)? else {
        log::debug!("shared recycled space kept: rank-deficient update");
        return Ok(());
    };
    let flexible = pb.variant == Variant::Flexible;
    let basis_col = |j: usize| &state.basis[j * n..(j + 1) * n];
    let dir_col = |j: usize| {
        if flexible {
            &state.precond[j / w][(j % w) * n..(j % w + 1) * n]
        } else {
            basis_col(j)
        }
    };
    let mut u_new = vec![T::zero(); n * ku];
    let mut c_new = vec![T::zero(); n * ku];
    match current {
        Some(space) => {
            let scales = g.block(kk, kk);
            let scaled: Vec<Vec<T>> = (0..kk)
                .map(|i| space.u_col(i, 0).iter().map(|&v| v * scales[(i, i)]).collect())
                .collect();
            combine(n, |j| if j < kk { scaled[j].as_slice() } else { dir_col(j - kk) }, &coef_u, &mut u_new);
            combine(n, |j| if j < kk { space.c_col(j, 0) } else { basis_col(j - kk) }, &coef_c, &mut c_new);
        }
        None => {
            combine(n, dir_col, &coef_u, &mut u_new);
            combine(n, basis_col, &coef_c, &mut c_new);
        }
    }
    let space = slot.get_or_insert_with(|| RecycledSpace::new(n, ku, 1, pb.variant));
    if space.dim() != ku {
        *space = RecycledSpace::new(n, ku, 1, pb.variant);
    }
    space.store(0, &u_new, &c_new);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::wrappers::DenseOperator;
    use crate::parallel::SelfComm;
    use approx::assert_abs_diff_eq;

    fn tridiag(n: usize) -> ColMat<f64> {
        ColMat::from_fn(n, n, |i, j| {
            if i == j {
                4.0
            } else if i + 1 == j {
                -1.0
            } else if j + 1 == i {
                -1.5
            } else {
                0.0
            }
        })
    }

    #[test]
    fn block_solve_matches_each_column() {
        let n = 12;
        let a = tridiag(n);
        let op = DenseOperator::new(a.clone());
        let b: Vec<f64> = (0..2 * n).map(|i| ((i * 7) % 5) as f64 - 2.0).collect();
        let mut x = vec![0.0; 2 * n];
        let opts = KrylovOptions::default().with_tol(1e-10).with_restart(10).with_max_it(200);
        let stats = BgmresSolver::new(opts).solve(&op, &b, &mut x, 2, &SelfComm).unwrap();
        assert!(stats.converged);
        let mut ax = vec![0.0; 2 * n];
        dense::gemm(n, 2, n, 1.0, a.as_slice(), &x, 0.0, &mut ax);
        for i in 0..2 * n {
            assert_abs_diff_eq!(ax[i], b[i], epsilon = 1e-8);
        }
    }

    #[test]
    fn duplicate_columns_are_deflated() {
        let n = 8;
        let op = DenseOperator::new(tridiag(n));
        let col: Vec<f64> = (0..n).map(|i| 1.0 + i as f64).collect();
        let b = [col.clone(), col.clone()].concat();
        let mut x = vec![0.0; 2 * n];
        let opts = KrylovOptions::default().with_tol(1e-10).with_initial_deflation_tol(1e-8);
        let stats = BgmresSolver::new(opts).solve(&op, &b, &mut x, 2, &SelfComm).unwrap();
        assert!(stats.converged);
        for i in 0..n {
            assert_abs_diff_eq!(x[i], x[n + i], epsilon = 1e-10);
        }
    }
}
