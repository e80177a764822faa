//! Recycled subspace of GCRODR and BGCRODR.
//!
//! A [`RecycledSpace`] holds `k` directions `U` together with `C = op(U)`, where `op`
//! is the operator the Krylov space is built on and `C` has orthonormal columns. The
//! scalar methods keep one such pair per right-hand side (`mu` columns per block, like
//! a Krylov basis); the block methods keep a single shared pair (`mu = 1`, so `U` is
//! one packed `n x k` block).
//!
//! After every cycle the pair is rebuilt from the augmented Hessenberg matrix
//!
//! ```text
//!     G = [ S  B ]      A [U~ V_m] = [C V_{m+1}] G,   U~ = U S (unit columns)
//!         [ 0  H ]
//! ```
//!
//! by keeping the `k` singular directions `P` of `G` selected by the target, then
//! `G P = Q R`, `U <- [U~ V_m] P R^-1` and `C <- [C V_{m+1}] Q`. Only `S` needs a
//! reduction; the rest is local dense algebra.

use crate::config::{Orthogonalization, QrMethod, RecycleStrategy, RecycleTarget, Variant};
use crate::core::traits::{Operator, Scalar};
use crate::core::wrappers::DistributedInnerProduct;
use crate::error::KError;
use crate::matrix::dense::{self, ColMat};
use crate::parallel::Comm;
use crate::solver::Problem;
use crate::solver::kernels::{block_orthogonalization, orthogonalization, qr};

#[derive(Clone, Debug)]
pub struct RecycledSpace<T> {
    n: usize,
    k: usize,
    mu: usize,
    variant: Variant,
    u: Vec<T>,
    c: Vec<T>,
    valid: Vec<bool>,
}

impl<T: Scalar> RecycledSpace<T> {
    /// An empty space of `k` directions per column for `mu` columns of length `n`.
    pub fn new(n: usize, k: usize, mu: usize, variant: Variant) -> Self {
        Self {
            n,
            k,
            mu,
            variant,
            u: vec![T::zero(); k * n * mu],
            c: vec![T::zero(); k * n * mu],
            valid: vec![false; mu],
        }
    }

    pub fn dim(&self) -> usize {
        self.k
    }

    pub fn width(&self) -> usize {
        self.mu
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn is_valid(&self, nu: usize) -> bool {
        self.valid[nu]
    }

    pub fn any_valid(&self) -> bool {
        self.valid.iter().any(|&v| v)
    }

    pub fn u(&self) -> &[T] {
        &self.u
    }

    pub fn c(&self) -> &[T] {
        &self.c
    }

    /// Whether the space can serve a solve of this shape.
    pub fn fits(&self, n: usize, mu: usize, variant: Variant) -> bool {
        self.n == n && self.mu == mu && self.variant == variant
    }

    fn range(&self, i: usize, nu: usize) -> std::ops::Range<usize> {
        let start = i * self.n * self.mu + nu * self.n;
        start..start + self.n
    }

    /// Direction `i` of column `nu`.
    pub fn u_col(&self, i: usize, nu: usize) -> &[T] {
        &self.u[self.range(i, nu)]
    }

    pub fn c_col(&self, i: usize, nu: usize) -> &[T] {
        &self.c[self.range(i, nu)]
    }

    pub fn invalidate(&mut self, nu: usize) {
        let (n, mu) = (self.n, self.mu);
        for i in 0..self.k {
            let start = i * n * mu + nu * n;
            self.u[start..start + n].iter_mut().for_each(|v| *v = T::zero());
            self.c[start..start + n].iter_mut().for_each(|v| *v = T::zero());
        }
        self.valid[nu] = false;
    }

    /// Replaces column `nu` with the packed `n x k` bases `u` and `c`.
    pub fn store(&mut self, nu: usize, u: &[T], c: &[T]) {
        let n = self.n;
        for i in 0..self.k {
            let range = self.range(i, nu);
            self.u[range.clone()].copy_from_slice(&u[i * n..(i + 1) * n]);
            self.c[range].copy_from_slice(&c[i * n..(i + 1) * n]);
        }
        self.valid[nu] = true;
    }

    fn pack(buf: &[T], n: usize, k: usize, mu: usize, nu: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(n * k);
        for i in 0..k {
            let start = i * n * mu + nu * n;
            out.extend_from_slice(&buf[start..start + n]);
        }
        out
    }

    /// Packed `n x k` copy of the directions of column `nu`.
    pub fn packed_u(&self, nu: usize) -> Vec<T> {
        Self::pack(&self.u, self.n, self.k, self.mu, nu)
    }

    pub fn packed_c(&self, nu: usize) -> Vec<T> {
        Self::pack(&self.c, self.n, self.k, self.mu, nu)
    }

    /// Recomputes `C = op(U)` for a new operator and restores orthonormality:
    /// `C = Q`, `U <- U R^-1`. A column whose directions became dependent is dropped.
    pub(crate) fn refresh<O: Operator<T>, C: Comm>(&mut self, pb: &Problem<'_, T, O, C>, qr_mode: QrMethod) -> Result<(), KError> {
        let (n, k, mu) = (self.n, self.k, self.mu);
        let blk = n * mu;
        let mut tmp = vec![T::zero(); blk];
        for i in 0..k {
            let u = &self.u[i * blk..(i + 1) * blk];
            let c = &mut self.c[i * blk..(i + 1) * blk];
            match self.variant {
                Variant::Flexible => pb.gmv(u, c, mu),
                Variant::Left | Variant::Right => pb.krylov_op(u, c, &mut tmp, mu, None)?,
            }
        }
        for nu in 0..mu {
            if !self.valid[nu] {
                continue;
            }
            let mut q = self.packed_c(nu);
            let mut r = vec![T::zero(); k * k];
            match qr(qr_mode, n, k, &mut q, &mut r, k, &pb.ip, true) {
                Ok(()) => {
                    let mut u = self.packed_u(nu);
                    dense::trsm_right_upper(n, k, &r, k, &mut u);
                    self.store(nu, &u, &q);
                }
                Err(KError::Breakdown(col)) => {
                    log::warn!("recycled space of column {nu} lost rank at direction {col}, discarded");
                    self.invalidate(nu);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Removes the `C` components of the `mu` columns of `r` (one reduction) and adds
    /// the matching `U` combination to `acc`.
    pub fn project_columns<C: Comm>(&self, ip: &DistributedInnerProduct<'_, T, C>, r: &mut [T], acc: &mut [T]) {
        let (n, k, mu) = (self.n, self.k, self.mu);
        let mut z = vec![T::zero(); k * mu];
        orthogonalization(Orthogonalization::Cgs, n, k, mu, &self.c, r, &mut z, ip);
        for i in 0..k {
            for nu in 0..mu {
                dense::axpy(z[i * mu + nu], self.u_col(i, nu), &mut acc[nu * n..(nu + 1) * n]);
            }
        }
    }

    /// Shared-space version of [`RecycledSpace::project_columns`] for a block of
    /// `ncols` columns.
    pub fn project_block<C: Comm>(
        &self,
        ip: &DistributedInnerProduct<'_, T, C>,
        r: &mut [T],
        ncols: usize,
        acc: &mut [T],
    ) {
        let (n, k) = (self.n, self.k);
        let mut z = vec![T::zero(); k * ncols];
        block_orthogonalization(Orthogonalization::Cgs, n, 1, k, ncols, &self.c, r, &mut z, k, ip);
        dense::gemm(n, ncols, k, T::one(), &self.u, &z, T::one(), acc);
    }

    /// `1 / ||u||` for every direction, entry `i * mu + nu` (one reduction). Zero
    /// directions get a zero scale.
    pub fn inverse_norms<C: Comm>(&self, ip: &DistributedInnerProduct<'_, T, C>) -> Vec<T> {
        let (k, mu) = (self.k, self.mu);
        let mut s: Vec<T> = (0..k * mu)
            .map(|e| {
                let col = self.u_col(e / mu, e % mu);
                ip.local(col, col)
            })
            .collect();
        ip.reduce(&mut s);
        s.iter_mut().for_each(|v| {
            *v = if *v > T::zero() { T::one() / v.sqrt() } else { T::zero() };
        });
        s
    }
}

/// The `k` coordinate directions of `g` selected by `target`: right singular vectors
/// of `g` through the eigenvectors of `g^T g` (strategy A) or through an SVD of `g`
/// (strategy B).
pub fn select_directions<T: Scalar>(
    g: &ColMat<T>,
    k: usize,
    target: RecycleTarget,
    strategy: RecycleStrategy,
) -> Result<ColMat<T>, KError> {
    let cols = g.ncols();
    let k = k.min(cols);
    let (vectors, ascending) = match strategy {
        RecycleStrategy::A => {
            let normal = g.transpose().matmul(g);
            (dense::sym_eigen(&normal)?.1, true)
        }
        RecycleStrategy::B => (dense::svd_right(g)?.1, false),
    };
    let smallest_first = ascending == (target == RecycleTarget::Smallest);
    let index = |j: usize| if smallest_first { j } else { cols - 1 - j };
    Ok(ColMat::from_fn(cols, k, |i, j| vectors[(i, index(j))]))
}

/// Dense part of a recycled space update. Returns `(P R^-1, Q)` where `P` holds the
/// selected directions of `g` and `G P = Q R`, or `None` when `G P` is numerically
/// rank deficient.
pub fn update_coefficients<T: Scalar>(
    g: &ColMat<T>,
    k: usize,
    target: RecycleTarget,
    strategy: RecycleStrategy,
) -> Result<Option<(ColMat<T>, ColMat<T>)>, KError> {
    let (rows, cols) = (g.nrows(), g.ncols());
    if k == 0 || cols < k || rows < k {
        return Ok(None);
    }
    let mut p = select_directions(g, k, target, strategy)?;
    let (q, r) = dense::thin_qr(&g.matmul(&p));
    let rmax = (0..k).map(|i| r[(i, i)].abs()).fold(T::zero(), T::max);
    let floor = rmax * T::epsilon() * T::from_usize(rows).unwrap_or_else(T::one);
    if rmax == T::zero() || (0..k).any(|i| r[(i, i)].abs() <= floor) {
        return Ok(None);
    }
    dense::trsm_right_upper(cols, k, r.as_slice(), k, p.as_mut_slice());
    Ok(Some((p, q)))
}

/// `out(:, q) = sum_j coef(j, q) * column(j)` over `coef.nrows()` local columns of
/// length `n`; `out` is a packed `n x coef.ncols()` block.
pub fn combine<'a, T: Scalar + 'a>(n: usize, column: impl Fn(usize) -> &'a [T], coef: &ColMat<T>, out: &mut [T]) {
    out.iter_mut().for_each(|v| *v = T::zero());
    for q in 0..coef.ncols() {
        let dst = &mut out[q * n..(q + 1) * n];
        for j in 0..coef.nrows() {
            let w = coef[(j, q)];
            if w != T::zero() {
                dense::axpy(w, column(j), dst);
            }
        }
    }
}
