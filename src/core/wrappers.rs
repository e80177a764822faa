//! Inner products and operator adaptors.
//!
//! [`DistributedInnerProduct`] forms the global inner products of the Krylov methods:
//! local (optionally weighted) dot products, with Rayon when the `rayon` feature is on,
//! followed by one in-place sum reduction over the communicator.
//!
//! The adaptors turn concrete matrices into [`Operator`]s:
//! - [`DenseOperator`]: a process-local dense matrix.
//! - [`CsrOperator`]: a process-local sparse matrix.
//! - [`BlockRowOperator`]: a row-distributed sparse matrix; the product all-gathers `x`.
//! - [`DeflatedOperator`]: attaches a coarse space `Z` and a [`CoarseOperator`] to any
//!   operator, providing the coarse correction used by PCG.

use crate::coarse::{CoarseOperator, CoarseSolver};
use crate::core::traits::{Operator, Scalar};
use crate::error::KError;
use crate::matrix::dense::{self, ColMat};
use crate::matrix::sparse::{CsrMatrix, SparseMatrix};
use crate::parallel::{Comm, displacements};
use crate::preconditioner::Preconditioner;

/// Local dot product `sum_i d_i x_i y_i` (unweighted when `d` is `None`).
pub fn local_dot<T: Scalar>(x: &[T], y: &[T], d: Option<&[T]>) -> T {
    assert_eq!(x.len(), y.len(), "Vectors must have the same length");
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        match d {
            None => x.par_iter().zip(y.par_iter()).map(|(&a, &b)| a * b).reduce(T::zero, |a, v| a + v),
            Some(d) => x
                .par_iter()
                .zip(y.par_iter())
                .zip(d.par_iter())
                .map(|((&a, &b), &w)| w * a * b)
                .reduce(T::zero, |a, v| a + v),
        }
    }
    #[cfg(not(feature = "rayon"))]
    {
        match d {
            None => x.iter().zip(y).map(|(&a, &b)| a * b).fold(T::zero(), |a, v| a + v),
            Some(d) => x
                .iter()
                .zip(y)
                .zip(d)
                .map(|((&a, &b), &w)| w * a * b)
                .fold(T::zero(), |a, v| a + v),
        }
    }
}

/// Global inner products over a communicator.
///
/// Every method performs exactly one reduction, so all ranks must call them in the
/// same order. On an excluded rank `n` is 0 and the local contributions are zero.
pub struct DistributedInnerProduct<'a, T, C> {
    pub comm: &'a C,
    pub scaling: Option<&'a [T]>,
}

impl<'a, T: Scalar, C: Comm> DistributedInnerProduct<'a, T, C> {
    pub fn new(comm: &'a C, scaling: Option<&'a [T]>) -> Self {
        Self { comm, scaling }
    }

    /// Weighted local contribution over the first `x.len()` entries.
    pub fn local(&self, x: &[T], y: &[T]) -> T {
        local_dot(x, y, self.scaling.map(|d| &d[..x.len()]))
    }

    pub fn reduce(&self, buf: &mut [T]) {
        self.comm.all_reduce_sum(buf);
    }

    /// Column-wise global dots of two blocks of `out.len()` columns of length `n`.
    pub fn dots(&self, n: usize, x: &[T], y: &[T], out: &mut [T]) {
        for (nu, o) in out.iter_mut().enumerate() {
            *o = self.local(&x[nu * n..(nu + 1) * n], &y[nu * n..(nu + 1) * n]);
        }
        self.reduce(out);
    }

    /// Column-wise global 2-norms.
    pub fn norms(&self, n: usize, x: &[T], out: &mut [T]) {
        self.dots(n, x, x, out);
        out.iter_mut().for_each(|v| *v = v.max(T::zero()).sqrt());
    }

    /// `X^T D Y` for blocks of `p` and `q` columns, a `p x q` matrix.
    pub fn gram(&self, n: usize, p: usize, x: &[T], q: usize, y: &[T]) -> ColMat<T> {
        let mut g = ColMat::zeros(p, q);
        for j in 0..q {
            for i in 0..p {
                g[(i, j)] = self.local(&x[i * n..(i + 1) * n], &y[j * n..(j + 1) * n]);
            }
        }
        self.reduce(g.as_mut_slice());
        g
    }
}

fn precondition<T: Scalar>(
    pc: Option<&dyn Preconditioner<T>>,
    n: usize,
    input: &[T],
    output: &mut [T],
    mu: usize,
) -> Result<(), KError> {
    match pc {
        None => output[..n * mu].copy_from_slice(&input[..n * mu]),
        Some(pc) => {
            for nu in 0..mu {
                pc.apply(&input[nu * n..(nu + 1) * n], &mut output[nu * n..(nu + 1) * n])?;
            }
        }
    }
    Ok(())
}

/// Process-local dense operator.
pub struct DenseOperator<T> {
    a: ColMat<T>,
    pc: Option<Box<dyn Preconditioner<T>>>,
    prefix: String,
}

impl<T: Scalar> DenseOperator<T> {
    pub fn new(a: ColMat<T>) -> Self {
        assert_eq!(a.nrows(), a.ncols(), "operator must be square");
        Self { a, pc: None, prefix: String::new() }
    }

    pub fn with_preconditioner(mut self, pc: impl Preconditioner<T> + 'static) -> Self {
        self.pc = Some(Box::new(pc));
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn matrix(&self) -> &ColMat<T> {
        &self.a
    }
}

impl<T: Scalar> Operator<T> for DenseOperator<T> {
    fn dof(&self) -> usize {
        self.a.nrows()
    }

    fn gmv(&self, input: &[T], output: &mut [T], mu: usize) {
        let n = self.a.nrows();
        dense::gemm(n, mu, n, T::one(), self.a.as_slice(), input, T::zero(), output);
    }

    fn apply(&self, input: &[T], output: &mut [T], mu: usize, _excluded: bool) -> Result<(), KError> {
        precondition(self.pc.as_deref(), self.dof(), input, output, mu)
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Process-local sparse operator.
pub struct CsrOperator<T> {
    a: CsrMatrix<T>,
    pc: Option<Box<dyn Preconditioner<T>>>,
}

impl<T: Scalar> CsrOperator<T> {
    pub fn new(a: CsrMatrix<T>) -> Self {
        assert_eq!(a.nrows(), a.ncols(), "operator must be square");
        Self { a, pc: None }
    }

    pub fn with_preconditioner(mut self, pc: impl Preconditioner<T> + 'static) -> Self {
        self.pc = Some(Box::new(pc));
        self
    }
}

impl<T: Scalar> Operator<T> for CsrOperator<T> {
    fn dof(&self) -> usize {
        self.a.nrows()
    }

    fn gmv(&self, input: &[T], output: &mut [T], mu: usize) {
        let n = self.a.nrows();
        for nu in 0..mu {
            self.a.spmv(&input[nu * n..(nu + 1) * n], &mut output[nu * n..(nu + 1) * n]);
        }
    }

    fn apply(&self, input: &[T], output: &mut [T], mu: usize, _excluded: bool) -> Result<(), KError> {
        precondition(self.pc.as_deref(), self.dof(), input, output, mu)
    }
}

/// Row-distributed sparse operator: this rank owns a contiguous slice of the global
/// rows, stored with global column indices. Non-overlapping, so no inner-product
/// weights are needed.
pub struct BlockRowOperator<'c, T, C> {
    rows: CsrMatrix<T>,
    comm: &'c C,
    counts: Vec<usize>,
    displs: Vec<usize>,
    pc: Option<Box<dyn Preconditioner<T>>>,
}

impl<'c, T: Scalar, C: Comm> BlockRowOperator<'c, T, C> {
    /// Collective: exchanges the local row counts.
    pub fn new(rows: CsrMatrix<T>, comm: &'c C) -> Self {
        let mut counts = vec![0usize; comm.size()];
        comm.all_gather(&[rows.nrows()], &mut counts);
        let displs = displacements(&counts);
        assert_eq!(
            counts.iter().sum::<usize>(),
            rows.ncols(),
            "local rows must partition the global columns"
        );
        Self { rows, comm, counts, displs, pc: None }
    }

    pub fn with_preconditioner(mut self, pc: impl Preconditioner<T> + 'static) -> Self {
        self.pc = Some(Box::new(pc));
        self
    }

    /// First global row owned by this rank.
    pub fn first_row(&self) -> usize {
        self.displs[self.comm.rank()]
    }

    pub fn global_size(&self) -> usize {
        self.rows.ncols()
    }
}

impl<'c, T: Scalar, C: Comm> Operator<T> for BlockRowOperator<'c, T, C> {
    fn dof(&self) -> usize {
        self.rows.nrows()
    }

    fn gmv(&self, input: &[T], output: &mut [T], mu: usize) {
        let n = self.dof();
        let mut global = vec![T::zero(); self.global_size()];
        for nu in 0..mu {
            self.comm
                .all_gatherv(&input[nu * n..(nu + 1) * n], &mut global, &self.counts, &self.displs);
            self.rows.spmv(&global, &mut output[nu * n..(nu + 1) * n]);
        }
    }

    fn apply(&self, input: &[T], output: &mut [T], mu: usize, _excluded: bool) -> Result<(), KError> {
        precondition(self.pc.as_deref(), self.dof(), input, output, mu)
    }
}

/// An operator augmented with a coarse space.
///
/// `z` holds this rank's part of the coarse basis: `local_coarse_dofs` columns of
/// length `dof()`. The coarse correction is `Z (Z^T A Z)^-1 Z^T r`, where the coarse
/// solve goes through the [`CoarseOperator`] built from the same basis.
pub struct DeflatedOperator<'a, T, O, C: Comm, B> {
    inner: O,
    z: ColMat<T>,
    coarse: &'a CoarseOperator<T, C, B>,
}

impl<'a, T, O, C, B> DeflatedOperator<'a, T, O, C, B>
where
    T: Scalar,
    O: Operator<T>,
    C: Comm,
    B: CoarseSolver<T, C>,
{
    pub fn new(inner: O, z: ColMat<T>, coarse: &'a CoarseOperator<T, C, B>) -> Self {
        assert_eq!(z.nrows(), inner.dof(), "coarse basis rows must match the local dof count");
        assert_eq!(z.ncols(), coarse.local(), "coarse basis width must match the local coarse dofs");
        Self { inner, z, coarse }
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }
}

impl<'a, T, O, C, B> Operator<T> for DeflatedOperator<'a, T, O, C, B>
where
    T: Scalar,
    O: Operator<T>,
    C: Comm,
    B: CoarseSolver<T, C>,
{
    fn dof(&self) -> usize {
        self.inner.dof()
    }

    fn gmv(&self, input: &[T], output: &mut [T], mu: usize) {
        self.inner.gmv(input, output, mu)
    }

    fn apply(&self, input: &[T], output: &mut [T], mu: usize, excluded: bool) -> Result<(), KError> {
        self.inner.apply(input, output, mu, excluded)
    }

    fn start(&self, b: &[T], x: &mut [T], mu: usize, excluded: bool) -> bool {
        self.inner.start(b, x, mu, excluded)
    }

    fn end(&self, token: bool) {
        self.inner.end(token)
    }

    fn prefix(&self) -> &str {
        self.inner.prefix()
    }

    fn scaling(&self) -> Option<&[T]> {
        self.inner.scaling()
    }

    fn coarse_correction(&self, input: &[T], output: &mut [T], mu: usize) -> Result<bool, KError> {
        let (n, nc) = (self.dof(), self.z.ncols());
        // rank-major, RHS-minor: the layout the coarse transfer expects
        let mut rhs = vec![T::zero(); nc * mu];
        dense::gemm_tn(n, mu, nc, T::one(), self.z.as_slice(), input, T::zero(), &mut rhs);
        self.coarse.call_solver(&mut rhs, mu)?;
        dense::gemm(n, mu, nc, T::one(), self.z.as_slice(), &rhs, T::zero(), output);
        Ok(true)
    }
}
