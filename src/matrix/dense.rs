//! Small column-major dense matrices on top of Faer.
//!
//! `ColMat` keeps packed column-major storage so the drivers can hand column slices
//! to the collectives, and borrows it as a faer view for products and factorizations.
//! The slice kernels take an explicit leading dimension where the drivers operate in
//! place on sub-blocks of their Hessenberg and Gram buffers.

use crate::core::traits::Scalar;
use crate::error::KError;
use faer::linalg::cholesky::llt::factor::LltError;
use faer::linalg::matmul::matmul;
use faer::linalg::solvers::{Llt, Qr, SelfAdjointEigen, Svd};
use faer::linalg::triangular_solve::solve_lower_triangular_in_place;
use faer::{Accum, Mat, MatMut, MatRef, Par, Side};
use std::cmp::Ordering;
use std::ops::{Index, IndexMut};

/// Owned column-major matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct ColMat<T> {
    nrows: usize,
    ncols: usize,
    data: Vec<T>,
}

impl<T: Scalar> ColMat<T> {
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Self { nrows, ncols, data: vec![T::zero(); nrows * ncols] }
    }

    pub fn identity(n: usize) -> Self {
        Self::from_fn(n, n, |i, j| if i == j { T::one() } else { T::zero() })
    }

    pub fn from_fn(nrows: usize, ncols: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(nrows * ncols);
        for j in 0..ncols {
            for i in 0..nrows {
                data.push(f(i, j));
            }
        }
        Self { nrows, ncols, data }
    }

    /// Wraps raw column-major storage.
    pub fn from_col_major(nrows: usize, ncols: usize, data: Vec<T>) -> Self {
        assert_eq!(data.len(), nrows * ncols, "storage does not match shape");
        Self { nrows, ncols, data }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    pub fn col(&self, j: usize) -> &[T] {
        &self.data[j * self.nrows..(j + 1) * self.nrows]
    }

    pub fn col_mut(&mut self, j: usize) -> &mut [T] {
        &mut self.data[j * self.nrows..(j + 1) * self.nrows]
    }

    /// Borrows the storage as a faer view.
    pub fn as_faer(&self) -> MatRef<'_, T> {
        MatRef::from_column_major_slice(&self.data, self.nrows, self.ncols)
    }

    pub fn as_faer_mut(&mut self) -> MatMut<'_, T> {
        MatMut::from_column_major_slice_mut(&mut self.data, self.nrows, self.ncols)
    }

    /// Packs any faer view (faer may pad its own columns).
    pub fn from_faer(m: MatRef<'_, T>) -> Self {
        Self::from_fn(m.nrows(), m.ncols(), |i, j| m[(i, j)])
    }

    pub fn transpose(&self) -> Self {
        Self::from_faer(self.as_faer().transpose())
    }

    /// `self * other`.
    pub fn matmul(&self, other: &ColMat<T>) -> Self {
        assert_eq!(self.ncols, other.nrows, "inner dimensions differ");
        let mut out = Self::zeros(self.nrows, other.ncols);
        matmul(out.as_faer_mut(), Accum::Replace, self.as_faer(), other.as_faer(), T::one(), Par::Seq);
        out
    }

    /// Leading `r x c` sub-block as a new matrix.
    pub fn block(&self, r: usize, c: usize) -> Self {
        Self::from_fn(r, c, |i, j| self[(i, j)])
    }
}

impl<T> Index<(usize, usize)> for ColMat<T> {
    type Output = T;
    fn index(&self, (i, j): (usize, usize)) -> &T {
        &self.data[i + j * self.nrows]
    }
}

impl<T> IndexMut<(usize, usize)> for ColMat<T> {
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut T {
        &mut self.data[i + j * self.nrows]
    }
}

pub fn dot<T: Scalar>(x: &[T], y: &[T]) -> T {
    debug_assert_eq!(x.len(), y.len());
    x.iter().zip(y).map(|(&a, &b)| a * b).sum()
}

/// `y += alpha * x`
pub fn axpy<T: Scalar>(alpha: T, x: &[T], y: &mut [T]) {
    for (yi, &xi) in y.iter_mut().zip(x) {
        *yi = *yi + alpha * xi;
    }
}

pub fn scal<T: Scalar>(alpha: T, x: &mut [T]) {
    x.iter_mut().for_each(|xi| *xi = *xi * alpha);
}

pub fn nrm2<T: Scalar>(x: &[T]) -> T {
    dot(x, x).sqrt()
}

// `C = beta * C` folded into the accumulation mode of a faer product.
fn accumulate<T: Scalar>(beta: T, c: &mut [T]) -> Accum {
    if beta == T::zero() {
        Accum::Replace
    } else {
        if beta != T::one() {
            scal(beta, c);
        }
        Accum::Add
    }
}

/// `y = beta * y + alpha * A * x`, `A` is `m x n` with leading dimension `m`.
pub fn gemv<T: Scalar>(m: usize, n: usize, alpha: T, a: &[T], x: &[T], beta: T, y: &mut [T]) {
    gemm(m, 1, n, alpha, a, x, beta, y);
}

/// `y = beta * y + alpha * A^T * x`, `A` is `m x n` with leading dimension `m`.
pub fn gemv_t<T: Scalar>(m: usize, n: usize, alpha: T, a: &[T], x: &[T], beta: T, y: &mut [T]) {
    gemm_tn(m, 1, n, alpha, a, x, beta, y);
}

/// `C = beta * C + alpha * A * B` with `A: m x k`, `B: k x n`, `C: m x n`, all packed.
#[allow(clippy::too_many_arguments)]
pub fn gemm<T: Scalar>(m: usize, n: usize, k: usize, alpha: T, a: &[T], b: &[T], beta: T, c: &mut [T]) {
    let c = &mut c[..m * n];
    let accum = accumulate(beta, c);
    matmul(
        MatMut::from_column_major_slice_mut(c, m, n),
        accum,
        MatRef::from_column_major_slice(&a[..m * k], m, k),
        MatRef::from_column_major_slice(&b[..k * n], k, n),
        alpha,
        Par::Seq,
    );
}

/// `C = beta * C + alpha * A^T * B` with `A: m x k`, `B: m x n`, `C: k x n`, all packed.
#[allow(clippy::too_many_arguments)]
pub fn gemm_tn<T: Scalar>(m: usize, n: usize, k: usize, alpha: T, a: &[T], b: &[T], beta: T, c: &mut [T]) {
    let c = &mut c[..k * n];
    let accum = accumulate(beta, c);
    matmul(
        MatMut::from_column_major_slice_mut(c, k, n),
        accum,
        MatRef::from_column_major_slice(&a[..m * k], m, k).transpose(),
        MatRef::from_column_major_slice(&b[..m * n], m, n),
        alpha,
        Par::Seq,
    );
}

/// In-place upper Cholesky `A = R^T R` of the leading `n x n` block (leading dimension
/// `lda`). Only the upper triangle is referenced; the strict lower triangle is zeroed.
/// A non-positive pivot at column `j` yields `KError::Breakdown(j + 1)`.
pub fn cholesky<T: Scalar>(n: usize, a: &mut [T], lda: usize) -> Result<(), KError> {
    let sym = Mat::from_fn(n, n, |i, j| if i <= j { a[i + j * lda] } else { a[j + i * lda] });
    let llt = Llt::new(sym.as_ref(), Side::Lower).map_err(|e| match e {
        LltError::NonPositivePivot { index } => KError::Breakdown((index + 1).min(n)),
    })?;
    let l = llt.L();
    for j in 0..n {
        for i in 0..n {
            a[i + j * lda] = if i <= j { l[(j, i)] } else { T::zero() };
        }
    }
    Ok(())
}

/// `B <- B * R^-1`, `B` is `m x k` packed, `R` upper triangular `k x k` with leading
/// dimension `ldr`.
pub fn trsm_right_upper<T: Scalar>(m: usize, k: usize, r: &[T], ldr: usize, b: &mut [T]) {
    // X R = B  <=>  R^T X^T = B^T
    let rt = Mat::from_fn(k, k, |i, j| if j <= i { r[j + i * ldr] } else { T::zero() });
    let b = MatMut::from_column_major_slice_mut(&mut b[..m * k], m, k);
    solve_lower_triangular_in_place(rt.as_ref(), b.transpose_mut(), Par::Seq);
}

/// Back substitution `x <- R^-1 x` with `R` upper triangular `k x k`, leading dimension
/// `ldr`. A zero diagonal entry leaves the matching unknown at zero.
pub fn solve_upper<T: Scalar>(k: usize, r: &[T], ldr: usize, x: &mut [T]) {
    for i in (0..k).rev() {
        let mut s = x[i];
        for j in i + 1..k {
            s = s - r[i + j * ldr] * x[j];
        }
        let d = r[i + i * ldr];
        x[i] = if d != T::zero() { s / d } else { T::zero() };
    }
}

/// Forward substitution `x <- R^-T x`.
pub fn solve_upper_transpose<T: Scalar>(k: usize, r: &[T], ldr: usize, x: &mut [T]) {
    for i in 0..k {
        let mut s = x[i];
        for j in 0..i {
            s = s - r[j + i * ldr] * x[j];
        }
        let d = r[i + i * ldr];
        x[i] = if d != T::zero() { s / d } else { T::zero() };
    }
}

/// Thin QR `A = Q R` of an `m x n` matrix, `m >= n`: `Q` is `m x n` with orthonormal
/// columns and `R` is `n x n` upper triangular (diagonal signs as faer leaves them).
pub fn thin_qr<T: Scalar>(a: &ColMat<T>) -> (ColMat<T>, ColMat<T>) {
    let qr = Qr::new(a.as_faer());
    let q = qr.compute_thin_Q();
    let r = qr.thin_R();
    let n = a.ncols();
    (
        ColMat::from_faer(q.as_ref()),
        ColMat::from_fn(n, n, |i, j| if i <= j { r[(i, j)] } else { T::zero() }),
    )
}

fn sorted<T: Scalar>(values: &[T], descending: bool) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&i, &j| {
        let ord = values[i].partial_cmp(&values[j]).unwrap_or(Ordering::Equal);
        if descending { ord.reverse() } else { ord }
    });
    order
}

/// Eigen-decomposition of a symmetric matrix (lower triangle referenced). Returns the
/// eigenvalues in ascending order and the matching orthonormal eigenvectors as columns.
pub fn sym_eigen<T: Scalar>(a: &ColMat<T>) -> Result<(Vec<T>, ColMat<T>), KError> {
    let evd = SelfAdjointEigen::new(a.as_faer(), Side::Lower)
        .map_err(|e| KError::FactorError(format!("symmetric eigensolver: {e:?}")))?;
    let s = evd.S().column_vector();
    let u = evd.U();
    let values: Vec<T> = (0..a.nrows()).map(|i| s[i]).collect();
    let order = sorted(&values, false);
    let vectors = ColMat::from_fn(u.nrows(), order.len(), |i, j| u[(i, order[j])]);
    Ok((order.iter().map(|&i| values[i]).collect(), vectors))
}

/// Singular values and right singular vectors of an `m x n` matrix. Singular values
/// come back in descending order.
pub fn svd_right<T: Scalar>(a: &ColMat<T>) -> Result<(Vec<T>, ColMat<T>), KError> {
    let svd = Svd::new(a.as_faer()).map_err(|e| KError::FactorError(format!("singular value decomposition: {e:?}")))?;
    let s = svd.S().column_vector();
    let v = svd.V();
    let count = a.nrows().min(a.ncols());
    let values: Vec<T> = (0..count).map(|i| s[i]).collect();
    let mut order = sorted(&values, true);
    // directions beyond the rank of a wide matrix have a zero singular value
    order.extend(count..a.ncols());
    let vectors = ColMat::from_fn(a.ncols(), a.ncols(), |i, j| v[(i, order[j])]);
    let values = order.iter().map(|&i| if i < count { values[i] } else { T::zero() }).collect();
    Ok((values, vectors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn cholesky_matches_known_factor() {
        // [[4, 2], [2, 3]] = R^T R with R = [[2, 1], [0, sqrt(2)]]
        let mut a = vec![4.0, 2.0, 2.0, 3.0];
        cholesky(2, &mut a, 2).unwrap();
        assert_abs_diff_eq!(a[0], 2.0, epsilon = 1e-14);
        assert_abs_diff_eq!(a[2], 1.0, epsilon = 1e-14);
        assert_abs_diff_eq!(a[3], 2.0f64.sqrt(), epsilon = 1e-14);
        assert_eq!(a[1], 0.0);
    }

    #[test]
    fn cholesky_reads_the_upper_triangle_of_a_strided_block() {
        // lower triangle holds garbage, leading dimension 3
        let mut a = vec![4.0, -7.0, 9.0, 2.0, 3.0, 9.0, 9.0, 9.0, 9.0];
        cholesky(2, &mut a, 3).unwrap();
        assert_abs_diff_eq!(a[0], 2.0, epsilon = 1e-14);
        assert_abs_diff_eq!(a[3], 1.0, epsilon = 1e-14);
        assert_abs_diff_eq!(a[4], 2.0f64.sqrt(), epsilon = 1e-14);
        assert_eq!(a[1], 0.0);
        assert_eq!(a[2], 9.0);
    }

    #[test]
    fn cholesky_reports_breakdown_position() {
        let mut a = vec![1.0, 2.0, 2.0, 1.0];
        assert_eq!(cholesky(2, &mut a, 2), Err(KError::Breakdown(2)));
    }

    #[test]
    fn products_honour_beta() {
        let a = ColMat::from_fn(3, 2, |i, j| (i + 2 * j) as f64);
        let b = [1.0, -1.0];
        let mut y = vec![1.0; 3];
        gemv(3, 2, 2.0, a.as_slice(), &b, 0.5, &mut y);
        for i in 0..3 {
            assert_abs_diff_eq!(y[i], 0.5 + 2.0 * (a[(i, 0)] - a[(i, 1)]), epsilon = 1e-15);
        }
        let mut z = vec![3.0; 2];
        gemv_t(3, 2, 1.0, a.as_slice(), &[1.0, 1.0, 1.0], 0.0, &mut z);
        assert_abs_diff_eq!(z[0], 3.0, epsilon = 1e-15);
        assert_abs_diff_eq!(z[1], 9.0, epsilon = 1e-15);
    }

    #[test]
    fn trsm_inverts_the_triangular_factor() {
        let r = vec![2.0, 0.0, 1.0, 3.0];
        let b = ColMat::from_fn(3, 2, |i, j| (i * 2 + j + 1) as f64);
        let mut x = b.clone();
        trsm_right_upper(3, 2, &r, 2, x.as_mut_slice());
        let back = x.matmul(&ColMat::from_col_major(2, 2, r));
        for j in 0..2 {
            for i in 0..3 {
                assert_abs_diff_eq!(back[(i, j)], b[(i, j)], epsilon = 1e-14);
            }
        }
    }

    #[test]
    fn thin_qr_reconstructs_input() {
        let a = ColMat::from_fn(4, 3, |i, j| 1.0 / (i + j + 1) as f64 + if i == j { 1.0 } else { 0.0 });
        let (q, r) = thin_qr(&a);
        assert_eq!((q.nrows(), q.ncols(), r.nrows()), (4, 3, 3));
        let qr = q.matmul(&r);
        for j in 0..3 {
            for i in 0..4 {
                assert_abs_diff_eq!(qr[(i, j)], a[(i, j)], epsilon = 1e-13);
            }
        }
        assert_eq!(r[(2, 0)], 0.0);
    }

    #[test]
    fn eigen_and_singular_values_agree() {
        let a = ColMat::from_fn(5, 3, |i, j| ((i * 3 + j * 7) % 5) as f64 - 1.5 + if i == j { 3.0 } else { 0.0 });
        let gram = a.transpose().matmul(&a);
        let (lambda, _) = sym_eigen(&gram).unwrap();
        assert!(lambda.windows(2).all(|w| w[0] <= w[1]));
        let (sigma, v) = svd_right(&a).unwrap();
        for j in 0..3 {
            assert_abs_diff_eq!(sigma[j] * sigma[j], lambda[2 - j], epsilon = 1e-10);
        }
        let vtv = v.transpose().matmul(&v);
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(vtv[(i, j)], if i == j { 1.0 } else { 0.0 }, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn triangular_solves_invert_each_other() {
        let r = vec![2.0, 0.0, 1.0, 3.0];
        let mut x = vec![4.0, 6.0];
        solve_upper(2, &r, 2, &mut x);
        assert_abs_diff_eq!(x[1], 2.0, epsilon = 1e-15);
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-15);
        let mut y = vec![2.0, 7.0];
        solve_upper_transpose(2, &r, 2, &mut y);
        assert_abs_diff_eq!(y[0], 1.0, epsilon = 1e-15);
        assert_abs_diff_eq!(y[1], 2.0, epsilon = 1e-15);
    }
}
