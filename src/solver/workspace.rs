//! Solve-scoped scratch memory.
//!
//! Every buffer a driver needs is allocated once at solve entry from `(n, mu, m)` and
//! dropped when the solve returns.

use crate::core::traits::Scalar;
use crate::matrix::dense::ColMat;

/// Search directions handed to a solution update: either one contiguous buffer of
/// consecutive blocks, or one allocation per block.
#[derive(Clone, Copy)]
pub enum Buffers<'a, T> {
    Contiguous(&'a [T]),
    PerItem(&'a [Vec<T>]),
}

impl<'a, T> Buffers<'a, T> {
    /// Block `i`, each block being `len` entries long.
    pub fn item(&self, i: usize, len: usize) -> &'a [T] {
        match *self {
            Buffers::Contiguous(buf) => &buf[i * len..(i + 1) * len],
            Buffers::PerItem(items) => &items[i][..len],
        }
    }
}

/// Givens-reduced Hessenberg systems of `mu` independent scalar Krylov spaces.
#[derive(Clone, Debug)]
pub struct Hessenberg<T> {
    pub m: usize,
    pub mu: usize,
    /// One `(m + 1) x m` matrix per right-hand side, upper triangular once rotated.
    pub h: Vec<ColMat<T>>,
    /// Rotation `j` of right-hand side `nu` at `j * mu + nu`.
    pub cs: Vec<T>,
    pub sn: Vec<T>,
    /// Rotated right-hand side `beta e_1`, entry `j` of `nu` at `j * mu + nu`.
    pub s: Vec<T>,
}

impl<T: Scalar> Hessenberg<T> {
    pub fn new(m: usize, mu: usize) -> Self {
        Self {
            m,
            mu,
            h: (0..mu).map(|_| ColMat::zeros(m + 1, m)).collect(),
            cs: vec![T::zero(); m * mu],
            sn: vec![T::zero(); m * mu],
            s: vec![T::zero(); (m + 1) * mu],
        }
    }

    /// Clears the systems and seeds `s = beta e_1`.
    pub fn reset(&mut self, beta: &[T]) {
        for h in &mut self.h {
            h.as_mut_slice().iter_mut().for_each(|v| *v = T::zero());
        }
        self.cs.iter_mut().for_each(|v| *v = T::zero());
        self.sn.iter_mut().for_each(|v| *v = T::zero());
        self.s.iter_mut().for_each(|v| *v = T::zero());
        self.s[..self.mu].copy_from_slice(&beta[..self.mu]);
    }

    /// Residual estimate of right-hand side `nu` after `j + 1` steps.
    pub fn residual(&self, j: usize, nu: usize) -> T {
        self.s[(j + 1) * self.mu + nu].abs()
    }

    /// Least-squares coefficients of the first `k` steps of right-hand side `nu`.
    pub fn solve(&self, k: usize, nu: usize) -> Vec<T> {
        let mut y: Vec<T> = (0..k).map(|j| self.s[j * self.mu + nu]).collect();
        crate::matrix::dense::solve_upper(k, self.h[nu].as_slice(), self.m + 1, &mut y);
        y
    }
}

/// Householder-reduced block Hessenberg system of one block Krylov space of width `d`
/// serving `rhs` right-hand sides.
#[derive(Clone, Debug)]
pub struct BlockHessenberg<T> {
    pub m: usize,
    pub d: usize,
    pub rhs: usize,
    /// `(m + 1) d x m d`
    pub h: ColMat<T>,
    /// `d` reflector factors per step.
    pub tau: Vec<T>,
    /// Rotated projected residual, `(m + 1) d x rhs`.
    pub s: ColMat<T>,
}

impl<T: Scalar> BlockHessenberg<T> {
    pub fn new(m: usize, d: usize, rhs: usize) -> Self {
        Self {
            m,
            d,
            rhs,
            h: ColMat::zeros((m + 1) * d, m * d),
            tau: vec![T::zero(); m * d],
            s: ColMat::zeros((m + 1) * d, rhs),
        }
    }

    pub fn ldh(&self) -> usize {
        (self.m + 1) * self.d
    }

    /// Seeds `s = [S0; 0]` with the `d x rhs` coefficients of the initial residual.
    pub fn reset(&mut self, s0: &ColMat<T>) {
        self.h.as_mut_slice().iter_mut().for_each(|v| *v = T::zero());
        self.tau.iter_mut().for_each(|v| *v = T::zero());
        self.s.as_mut_slice().iter_mut().for_each(|v| *v = T::zero());
        for c in 0..self.rhs {
            for r in 0..self.d {
                self.s[(r, c)] = s0[(r, c)];
            }
        }
    }

    /// Rows of the projected residual after `i + 1` block steps, as a `d x rhs` block
    /// starting at `(i + 1) d`.
    pub fn residual_block(&self, i: usize) -> (&[T], usize, usize) {
        let ld = self.ldh();
        (&self.s.as_slice()[(i + 1) * self.d..], self.d, ld)
    }

    /// Block least-squares coefficients (`k d x rhs`) of the first `k` steps.
    pub fn solve(&self, k: usize) -> ColMat<T> {
        let rows = k * self.d;
        let ld = self.ldh();
        let mut y = ColMat::from_fn(rows, self.rhs, |r, c| self.s[(r, c)]);
        for c in 0..self.rhs {
            crate::matrix::dense::solve_upper(rows, self.h.as_slice(), ld, y.col_mut(c));
        }
        y
    }
}

/// Per-solve state of a scalar Krylov method.
pub struct KrylovState<T> {
    pub n: usize,
    pub mu: usize,
    pub m: usize,
    /// `m + 1` consecutive blocks of `n * mu`.
    pub basis: Vec<T>,
    /// Preconditioned directions of the flexible variant, one allocation per step.
    pub precond: Vec<Vec<T>>,
    pub hessenberg: Hessenberg<T>,
    /// Unrotated copy of the Hessenberg columns, kept when a recycled space is built.
    pub saved: Option<Vec<ColMat<T>>>,
}

impl<T: Scalar> KrylovState<T> {
    pub fn new(n: usize, mu: usize, m: usize, flexible: bool, save: bool) -> Self {
        Self {
            n,
            mu,
            m,
            basis: vec![T::zero(); (m + 1) * n * mu],
            precond: if flexible { vec![vec![T::zero(); n * mu]; m] } else { Vec::new() },
            hessenberg: Hessenberg::new(m, mu),
            saved: save.then(|| (0..mu).map(|_| ColMat::zeros(m + 1, m)).collect()),
        }
    }

    pub fn block(&self, i: usize) -> &[T] {
        let len = self.n * self.mu;
        &self.basis[i * len..(i + 1) * len]
    }

    pub fn block_mut(&mut self, i: usize) -> &mut [T] {
        let len = self.n * self.mu;
        &mut self.basis[i * len..(i + 1) * len]
    }
}

/// Per-solve state of a block Krylov method of width `d`.
pub struct BlockKrylovState<T> {
    pub n: usize,
    pub d: usize,
    pub m: usize,
    /// `m + 1` consecutive blocks of `n * d`.
    pub basis: Vec<T>,
    pub precond: Vec<Vec<T>>,
    pub hessenberg: BlockHessenberg<T>,
    pub saved: Option<ColMat<T>>,
}

impl<T: Scalar> BlockKrylovState<T> {
    pub fn new(n: usize, d: usize, rhs: usize, m: usize, flexible: bool, save: bool) -> Self {
        Self {
            n,
            d,
            m,
            basis: vec![T::zero(); (m + 1) * n * d],
            precond: if flexible { vec![vec![T::zero(); n * d]; m] } else { Vec::new() },
            hessenberg: BlockHessenberg::new(m, d, rhs),
            saved: save.then(|| ColMat::zeros((m + 1) * d, m * d)),
        }
    }

    pub fn block(&self, i: usize) -> &[T] {
        let len = self.n * self.d;
        &self.basis[i * len..(i + 1) * len]
    }

    pub fn block_mut(&mut self, i: usize) -> &mut [T] {
        let len = self.n * self.d;
        &mut self.basis[i * len..(i + 1) * len]
    }
}
