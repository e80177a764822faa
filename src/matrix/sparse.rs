// SparseMatrix trait and the CSR implementation on top of faer

/// A read-only sparse matrix supporting y = A * x.
pub trait SparseMatrix<T> {
    /// Number of rows.
    fn nrows(&self) -> usize;
    /// Number of columns.
    fn ncols(&self) -> usize;
    /// Compute y = A * x.  `x.len() == ncols()`, `y.len() == nrows()`.
    fn spmv(&self, x: &[T], y: &mut [T]);
}

use crate::core::traits::Scalar;
use faer::sparse::{
    SparseRowMat,         // owning numeric CSR
    SymbolicSparseRowMat, // owning symbolic CSR
};

#[derive(Clone)]
pub struct CsrMatrix<T> {
    inner: SparseRowMat<usize, T>,
}

impl<T: Scalar> CsrMatrix<T> {
    /// Build a CSR from raw row-ptr, col-idx, and values. Column indices must be
    /// sorted and unique within each row.
    pub fn from_csr(
        nrows: usize,
        ncols: usize,
        row_ptr: Vec<usize>,
        col_idx: Vec<usize>,
        values: Vec<T>,
    ) -> Self {
        assert_eq!(col_idx.len(), values.len(), "one value per stored entry");
        // `None`: the row pointers are compact, no separate row_nnz
        let symbolic = SymbolicSparseRowMat::new_checked(nrows, ncols, row_ptr, None, col_idx);
        Self { inner: SparseRowMat::new(symbolic, values) }
    }

    /// Build from (row, col, value) triplets; duplicates are summed.
    pub fn from_triplets(nrows: usize, ncols: usize, mut triplets: Vec<(usize, usize, T)>) -> Self {
        triplets.sort_by_key(|&(i, j, _)| (i, j));
        let mut row_ptr = vec![0; nrows + 1];
        let mut col_idx: Vec<usize> = Vec::with_capacity(triplets.len());
        let mut values: Vec<T> = Vec::with_capacity(triplets.len());
        let mut last: Option<(usize, usize)> = None;
        for (i, j, v) in triplets {
            if last == Some((i, j)) {
                if let Some(tail) = values.last_mut() {
                    *tail = *tail + v;
                }
                continue;
            }
            col_idx.push(j);
            values.push(v);
            row_ptr[i + 1] += 1;
            last = Some((i, j));
        }
        for i in 0..nrows {
            row_ptr[i + 1] += row_ptr[i];
        }
        Self::from_csr(nrows, ncols, row_ptr, col_idx, values)
    }

    /// The faer matrix behind this CSR.
    pub fn as_faer(&self) -> &SparseRowMat<usize, T> {
        &self.inner
    }

    // (row_ptr, col_idx, values) as stored by faer
    fn arrays(&self) -> (&[usize], &[usize], &[T]) {
        let a = self.inner.as_ref();
        (a.symbolic().row_ptr(), a.symbolic().col_idx(), a.val())
    }

    /// Entries of row `i` as (column, value) pairs.
    pub fn row(&self, i: usize) -> impl Iterator<Item = (usize, T)> + '_ {
        let (row_ptr, col_idx, values) = self.arrays();
        let range = row_ptr[i]..row_ptr[i + 1];
        col_idx[range.clone()].iter().copied().zip(values[range].iter().copied())
    }

    pub fn diagonal(&self) -> Vec<T> {
        (0..self.inner.nrows())
            .map(|i| self.row(i).find(|&(j, _)| j == i).map_or(T::zero(), |(_, v)| v))
            .collect()
    }

    pub fn nnz(&self) -> usize {
        self.arrays().2.len()
    }
}

impl<T: Scalar> SparseMatrix<T> for CsrMatrix<T> {
    fn nrows(&self) -> usize {
        self.inner.nrows()
    }
    fn ncols(&self) -> usize {
        self.inner.ncols()
    }
    fn spmv(&self, x: &[T], y: &mut [T]) {
        assert_eq!(x.len(), self.ncols());
        assert_eq!(y.len(), self.nrows());
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            y.par_iter_mut().enumerate().for_each(|(i, yi)| {
                *yi = self.row(i).map(|(j, v)| v * x[j]).sum();
            });
        }
        #[cfg(not(feature = "rayon"))]
        {
            for (i, yi) in y.iter_mut().enumerate() {
                *yi = self.row(i).map(|(j, v)| v * x[j]).sum();
            }
        }
    }
}
