//! Krylov drivers and the kernels they share.
//!
//! Every driver solves `A X = B` for a block of `mu` right-hand sides stored column
//! after column in one slice. Global inner products go through the communicator given
//! to [`KrylovSolver::solve`]; all ranks must enter the same solve with the same
//! options.

use crate::config::Variant;
use crate::core::traits::{Operator, Scalar};
use crate::core::wrappers::DistributedInnerProduct;
use crate::error::KError;
use crate::matrix::dense;
use crate::parallel::Comm;
use crate::utils::convergence::{ConvergenceMarks, SolveStats};

pub mod kernels;
pub mod recycling;
pub mod workspace;

pub mod bcg;
pub mod bgcrodr;
pub mod bgmres;
pub mod cg;
pub mod gcrodr;
pub mod gmres;
pub mod pcg;

pub use bcg::BcgSolver;
pub use bgcrodr::BgcrodrSolver;
pub use bgmres::BgmresSolver;
pub use cg::CgSolver;
pub use gcrodr::GcrodrSolver;
pub use gmres::GmresSolver;
pub use pcg::PcgSolver;
pub use recycling::RecycledSpace;

/// Common interface of the Krylov drivers.
pub trait KrylovSolver<T: Scalar> {
    /// Solves `A X = B` for `mu` columns, starting from and overwriting `x`.
    fn solve<O: Operator<T>, C: Comm>(
        &mut self,
        op: &O,
        b: &[T],
        x: &mut [T],
        mu: usize,
        comm: &C,
    ) -> Result<SolveStats<T>, KError>;
}

/// Per-solve view of an operator: local length, variant and inner product. On an
/// excluded rank the local length is 0, products are skipped and only the
/// preconditioner and the reductions are issued.
pub(crate) struct Problem<'a, T, O, C> {
    pub op: &'a O,
    pub ip: DistributedInnerProduct<'a, T, C>,
    pub n: usize,
    pub excluded: bool,
    pub variant: Variant,
}

impl<'a, T: Scalar, O: Operator<T>, C: Comm> Problem<'a, T, O, C> {
    pub fn new(op: &'a O, comm: &'a C, excluded: bool, variant: Variant) -> Self {
        let n = if excluded { 0 } else { op.dof() };
        let scaling = if excluded { None } else { op.scaling() };
        Self {
            op,
            ip: DistributedInnerProduct::new(comm, scaling),
            n,
            excluded,
            variant,
        }
    }

    pub fn gmv(&self, input: &[T], output: &mut [T], mu: usize) {
        if !self.excluded {
            self.op.gmv(input, output, mu);
        }
    }

    pub fn precondition(&self, input: &[T], output: &mut [T], mu: usize) -> Result<(), KError> {
        self.op.apply(input, output, mu, self.excluded)
    }

    /// `r = b - A x`.
    pub fn residual(&self, b: &[T], x: &[T], r: &mut [T], mu: usize) {
        self.gmv(x, r, mu);
        for (ri, &bi) in r.iter_mut().zip(b) {
            *ri = bi - *ri;
        }
    }

    /// Residual of the system the Krylov space is built for: `M (b - A x)` for the
    /// left variant, `b - A x` otherwise.
    pub fn krylov_residual(&self, b: &[T], x: &[T], r: &mut [T], tmp: &mut [T], mu: usize) -> Result<(), KError> {
        match self.variant {
            Variant::Left => {
                self.residual(b, x, tmp, mu);
                self.precondition(tmp, r, mu)
            }
            Variant::Right | Variant::Flexible => {
                self.residual(b, x, r, mu);
                Ok(())
            }
        }
    }

    /// `w = M A v` (left) or `w = A M v` (right, flexible). With `z` given the
    /// preconditioned input `M v` is kept there.
    pub fn krylov_op(
        &self,
        v: &[T],
        w: &mut [T],
        tmp: &mut [T],
        mu: usize,
        z: Option<&mut [T]>,
    ) -> Result<(), KError> {
        match self.variant {
            Variant::Left => {
                self.gmv(v, tmp, mu);
                self.precondition(tmp, w, mu)
            }
            Variant::Right | Variant::Flexible => {
                let z = z.unwrap_or(tmp);
                self.precondition(v, z, mu)?;
                self.gmv(z, w, mu);
                Ok(())
            }
        }
    }

    /// `x += M acc` (right) or `x += acc` (left, flexible).
    pub fn correct(&self, acc: &[T], x: &mut [T], tmp: &mut [T], mu: usize) -> Result<(), KError> {
        match self.variant {
            Variant::Right => {
                self.precondition(acc, tmp, mu)?;
                dense::axpy(T::one(), tmp, x);
            }
            Variant::Left | Variant::Flexible => dense::axpy(T::one(), acc, x),
        }
        Ok(())
    }

    /// Reference norms of the right-hand sides: `||M b||` for the left variant,
    /// `||b||` otherwise.
    pub fn rhs_norms(&self, b: &[T], mu: usize) -> Result<Vec<T>, KError> {
        let mut norms = vec![T::zero(); mu];
        if self.variant == Variant::Left {
            let mut mb = vec![T::zero(); self.n * mu];
            self.precondition(b, &mut mb, mu)?;
            self.ip.norms(self.n, &mb, &mut norms);
        } else {
            self.ip.norms(self.n, b, &mut norms);
        }
        Ok(norms)
    }
}

/// Columns with a zero reference norm have the zero solution: `x` is cleared and the
/// column is marked converged at iteration 0.
pub(crate) fn settle_zero_rhs<T: Scalar>(n: usize, norms: &[T], x: &mut [T], marks: &mut ConvergenceMarks) {
    for (nu, &norm) in norms.iter().enumerate() {
        if norm == T::zero() {
            x[nu * n..(nu + 1) * n].iter_mut().for_each(|v| *v = T::zero());
            marks.mark(nu, 0);
        }
    }
}

/// Clears the columns of a block whose right-hand side is no longer active.
pub(crate) fn zero_inactive<T: Scalar>(n: usize, block: &mut [T], marks: &ConvergenceMarks) {
    for nu in 0..marks.len() {
        if !marks.is_active(nu) {
            block[nu * n..(nu + 1) * n].iter_mut().for_each(|v| *v = T::zero());
        }
    }
}

/// Reference norms indexed by column. With groups of `t > 1` consecutive columns, every
/// column of a group gets the norm of the group sum.
pub(crate) fn reference_norms<T: Scalar, O: Operator<T>, C: Comm>(
    pb: &Problem<'_, T, O, C>,
    b: &[T],
    mu: usize,
    t: usize,
) -> Result<Vec<T>, KError> {
    if t <= 1 {
        return pb.rhs_norms(b, mu);
    }
    let n = pb.n;
    let groups = mu / t;
    let mut summed = vec![T::zero(); n * groups];
    for g in 0..groups {
        for j in g * t..(g + 1) * t {
            dense::axpy(T::one(), &b[j * n..(j + 1) * n], &mut summed[g * n..(g + 1) * n]);
        }
    }
    let group_norms = pb.rhs_norms(&summed, groups)?;
    Ok((0..mu).map(|nu| group_norms[nu / t]).collect())
}

/// Copies the listed columns of `src` into a packed block.
pub(crate) fn gather_columns<T: Scalar>(n: usize, src: &[T], columns: &[usize]) -> Vec<T> {
    let mut out = Vec::with_capacity(n * columns.len());
    for &c in columns {
        out.extend_from_slice(&src[c * n..(c + 1) * n]);
    }
    out
}

/// Inverse of [`gather_columns`].
pub(crate) fn scatter_columns<T: Scalar>(n: usize, packed: &[T], columns: &[usize], dst: &mut [T]) {
    for (q, &c) in columns.iter().enumerate() {
        dst[c * n..(c + 1) * n].copy_from_slice(&packed[q * n..(q + 1) * n]);
    }
}

/// Group size actually usable for `mu` columns.
pub(crate) fn group_size(name: &str, mu: usize, t: usize) -> usize {
    if t > 1 && mu % t != 0 {
        log::warn!("{name}: {mu} columns cannot be split in groups of {t}, testing columns alone");
        1
    } else {
        t.max(1)
    }
}
