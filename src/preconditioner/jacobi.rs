// Jacobi preconditioner implementation

use crate::core::traits::Scalar;
use crate::error::KError;
use crate::matrix::dense::ColMat;
use crate::matrix::sparse::{CsrMatrix, SparseMatrix};
use crate::preconditioner::Preconditioner;

/// Jacobi preconditioner: M⁻¹ = D⁻¹
#[derive(Clone, Debug)]
pub struct Jacobi<T> {
    pub(crate) inv_diag: Vec<T>,
}

impl<T: Scalar> Jacobi<T> {
    /// From a diagonal; a zero entry leaves the matching component unchanged.
    pub fn from_diagonal(diag: &[T]) -> Self {
        let inv_diag = diag
            .iter()
            .map(|&d| if d != T::zero() { T::one() / d } else { T::one() })
            .collect();
        Self { inv_diag }
    }

    pub fn from_dense(a: &ColMat<T>) -> Self {
        let diag: Vec<T> = (0..a.nrows()).map(|i| a[(i, i)]).collect();
        Self::from_diagonal(&diag)
    }

    /// For a block of rows starting at global row `first_row`.
    pub fn from_rows(rows: &CsrMatrix<T>, first_row: usize) -> Self {
        let diag: Vec<T> = (0..rows.nrows())
            .map(|i| {
                rows.row(i)
                    .find(|&(j, _)| j == first_row + i)
                    .map_or(T::zero(), |(_, v)| v)
            })
            .collect();
        Self::from_diagonal(&diag)
    }
}

impl<T: Scalar> Preconditioner<T> for Jacobi<T> {
    fn apply(&self, r: &[T], z: &mut [T]) -> Result<(), KError> {
        if r.len() != self.inv_diag.len() || z.len() != r.len() {
            return Err(KError::SolveError(format!(
                "Jacobi of size {} applied to a vector of size {}",
                self.inv_diag.len(),
                r.len()
            )));
        }
        for ((zi, &ri), &di) in z.iter_mut().zip(r).zip(&self.inv_diag) {
            *zi = di * ri;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_by_inverse_diagonal() {
        let a = ColMat::from_fn(3, 3, |i, j| if i == j { (i + 1) as f64 } else { 0.5 });
        let pc = Jacobi::from_dense(&a);
        let mut z = vec![0.0; 3];
        pc.apply(&[1.0, 1.0, 3.0], &mut z).unwrap();
        assert_eq!(z, vec![1.0, 0.5, 1.0]);
        assert!(pc.apply(&[1.0], &mut [0.0]).is_err());
    }

    #[test]
    fn row_block_diagonal_uses_global_columns() {
        let rows = CsrMatrix::from_triplets(2, 4, vec![(0, 2, 4.0), (0, 3, 1.0), (1, 3, 8.0)]);
        let pc = Jacobi::from_rows(&rows, 2);
        assert_eq!(pc.inv_diag, vec![0.25, 0.125]);
    }
}
