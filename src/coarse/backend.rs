//! Direct solvers for the assembled coarse matrix.
//!
//! A backend receives, on every master, the block of consecutive rows of the coarse
//! matrix that master owns, and later solves in place for those same rows.

use crate::coarse::transfer::{Direction, permute};
use crate::coarse::distribution::Layout;
use crate::core::traits::Scalar;
use crate::error::KError;
use crate::matrix::dense::ColMat;
use crate::parallel::Comm;
use faer::linalg::solvers::{FullPivLu, SolveCore};
use faer::{Conj, Mat, MatMut};

pub trait CoarseSolver<T: Scalar, C: Comm> {
    /// Factorizes the matrix whose rows `first_row..first_row + rows.nrows()` are held
    /// in `rows` (all `global_size` columns). Collective over `masters`, which the
    /// backend keeps for its solves.
    fn factorize(&mut self, rows: ColMat<T>, first_row: usize, global_size: usize, masters: C) -> Result<(), KError>;

    /// Solves in place for `mu` columns of this master's rows. Collective over the
    /// communicator given to [`CoarseSolver::factorize`].
    fn solve(&self, rhs: &mut [T], mu: usize) -> Result<(), KError>;
}

/// Redundant dense LU: the row blocks are all-gathered and every master factorizes and
/// solves the full coarse system.
pub struct DenseLu<T, C: Comm> {
    factor: Option<FullPivLu<T>>,
    comm: Option<C>,
    rows: Layout,
    global: usize,
}

impl<T, C: Comm> DenseLu<T, C> {
    pub fn new() -> Self {
        Self {
            factor: None,
            comm: None,
            rows: Layout::default(),
            global: 0,
        }
    }

    pub fn is_factorized(&self) -> bool {
        self.comm.is_some()
    }
}

impl<T, C: Comm> Default for DenseLu<T, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, C> CoarseSolver<T, C> for DenseLu<T, C>
where
    T: Scalar,
    C: Comm,
{
    fn factorize(&mut self, rows: ColMat<T>, first_row: usize, global_size: usize, masters: C) -> Result<(), KError> {
        let p = masters.size();
        let mut extents = vec![0usize; 2 * p];
        masters.all_gather(&[first_row, rows.nrows()], &mut extents);
        let layout = Layout {
            counts: extents.iter().skip(1).step_by(2).copied().collect(),
            displs: extents.iter().step_by(2).copied().collect(),
        };
        if layout.total() != global_size {
            return Err(KError::FactorError(format!(
                "coarse row blocks cover {} of {global_size} rows",
                layout.total()
            )));
        }
        // row blocks stored transposed are contiguous pieces of A^T
        let mut at = vec![T::zero(); global_size * global_size];
        let (counts, displs) = layout.scaled(global_size);
        masters.all_gatherv(rows.transpose().as_slice(), &mut at, &counts, &displs);
        self.factor = if global_size > 0 {
            let a = Mat::from_fn(global_size, global_size, |i, j| at[i * global_size + j]);
            Some(FullPivLu::new(a.as_ref()))
        } else {
            None
        };
        self.rows = layout;
        self.global = global_size;
        self.comm = Some(masters);
        Ok(())
    }

    fn solve(&self, rhs: &mut [T], mu: usize) -> Result<(), KError> {
        let comm = self
            .comm
            .as_ref()
            .ok_or_else(|| KError::SolveError("coarse solve before factorization".to_string()))?;
        let n = self.global;
        let (counts, displs) = self.rows.scaled(mu);
        let mut full = vec![T::zero(); n * mu];
        comm.all_gatherv(rhs, &mut full, &counts, &displs);
        permute(&self.rows, mu, &mut full, Direction::ToCoarse);
        if let Some(factor) = &self.factor {
            factor.solve_in_place_with_conj(Conj::No, MatMut::from_column_major_slice_mut(&mut full, n, mu));
        }
        if full.iter().any(|&v| !v.is_finite()) {
            return Err(KError::SolveError("coarse matrix is singular".to_string()));
        }
        let me = comm.rank();
        let (first, count) = (self.rows.displs[me], self.rows.counts[me]);
        for nu in 0..mu {
            rhs[nu * count..(nu + 1) * count].copy_from_slice(&full[nu * n + first..nu * n + first + count]);
        }
        Ok(())
    }
}

impl<T, C: Comm> Drop for DenseLu<T, C> {
    fn drop(&mut self) {
        if let Some(comm) = self.comm.take() {
            if comm.is_finalized() {
                log::warn!("DenseLu dropped after the process group was finalized, leaking its communicator");
                std::mem::forget(comm);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::{SelfComm, ThreadComm};
    use approx::assert_abs_diff_eq;

    fn matrix(n: usize) -> ColMat<f64> {
        ColMat::from_fn(n, n, |i, j| if i == j { 4.0 + i as f64 } else { 1.0 / (1.0 + i as f64 + 2.0 * j as f64) })
    }

    #[test]
    fn single_master_solves() {
        let a = matrix(4);
        let x = [1.0, -2.0, 0.5, 3.0];
        let mut b = vec![0.0; 4];
        crate::matrix::dense::gemv(4, 4, 1.0, a.as_slice(), &x, 0.0, &mut b);
        let mut lu = DenseLu::new();
        lu.factorize(a, 0, 4, SelfComm).unwrap();
        lu.solve(&mut b, 1).unwrap();
        for i in 0..4 {
            assert_abs_diff_eq!(b[i], x[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn row_blocks_on_two_masters() {
        let n = 5;
        let a = matrix(n);
        let x: Vec<f64> = (0..2 * n).map(|i| i as f64 - 4.0).collect();
        let mut b = vec![0.0; 2 * n];
        crate::matrix::dense::gemm(n, 2, n, 1.0, a.as_slice(), &x, 0.0, &mut b);
        let out = ThreadComm::run(2, |comm| {
            let (first, rows) = if comm.rank() == 0 { (0, 2) } else { (2, 3) };
            let block = ColMat::from_fn(rows, n, |i, j| a[(first + i, j)]);
            let mut lu = DenseLu::new();
            lu.factorize(block, first, n, comm).unwrap();
            let mut rhs: Vec<f64> = (0..2).flat_map(|nu| b[nu * n + first..nu * n + first + rows].to_vec()).collect();
            lu.solve(&mut rhs, 2).unwrap();
            rhs
        });
        assert_abs_diff_eq!(out[0][0], x[0], epsilon = 1e-11);
        assert_abs_diff_eq!(out[0][3], x[n + 1], epsilon = 1e-11);
        assert_abs_diff_eq!(out[1][2], x[4], epsilon = 1e-11);
        assert_abs_diff_eq!(out[1][5], x[n + 4], epsilon = 1e-11);
    }
}
