//! Core traits for ddkrylov.

use crate::error::KError;
use crate::parallel::CommData;
use faer::traits::RealField;
use num_traits::{Float, FromPrimitive};
use std::fmt::{Debug, Display, LowerExp};
use std::iter::Sum;

/// Real floating-point scalar usable by every kernel, driver and collective. Dense
/// products and factorizations go through faer, hence the `RealField` bound.
pub trait Scalar:
    Float + RealField + FromPrimitive + Debug + Display + LowerExp + Sum + Default + Send + Sync + CommData
{
}

impl<T> Scalar for T where
    T: Float + RealField + FromPrimitive + Debug + Display + LowerExp + Sum + Default + Send + Sync + CommData
{
}

/// Converts an `f64` constant into `T`.
#[inline]
pub fn cast<T: Scalar>(x: f64) -> T {
    T::from_f64(x).unwrap_or_else(T::nan)
}

/// The distributed linear operator seen by the Krylov drivers.
///
/// Vectors are local slices of the distributed unknowns; a block of `mu` vectors is one
/// slice of length `mu * dof()`, column `nu` at `[nu * dof(), (nu + 1) * dof())`.
/// Global inner products are formed by the drivers through a [`crate::parallel::Comm`],
/// weighted by [`Operator::scaling`] when present.
///
/// On an `excluded` rank the local dimension is treated as zero, but every method that
/// communicates (including `apply`) is still called so that collectives stay matched.
pub trait Operator<T: Scalar> {
    /// Local number of degrees of freedom.
    fn dof(&self) -> usize;

    /// Block matrix-vector product `output = A * input` over `mu` columns.
    fn gmv(&self, input: &[T], output: &mut [T], mu: usize);

    /// Preconditioner application `output = M^-1 * input`. Identity by default.
    fn apply(&self, input: &[T], output: &mut [T], mu: usize, excluded: bool) -> Result<(), KError> {
        let _ = (mu, excluded);
        output.copy_from_slice(input);
        Ok(())
    }

    /// Called once before a solve. The returned token is handed back to [`Operator::end`].
    fn start(&self, b: &[T], x: &mut [T], mu: usize, excluded: bool) -> bool {
        let _ = (b, x, mu, excluded);
        false
    }

    fn end(&self, token: bool) {
        let _ = token;
    }

    /// Configuration-key prefix of this operator.
    fn prefix(&self) -> &str {
        ""
    }

    /// Diagonal weights `d` of the inner product `(x, y) = sum_i d_i x_i y_i`.
    fn scaling(&self) -> Option<&[T]> {
        None
    }

    /// Coarse projection `output = Z (Z^T A Z)^-1 Z^T input` over `mu` columns.
    /// Returns `Ok(false)` when no coarse space is attached, leaving `output` untouched.
    fn coarse_correction(&self, input: &[T], output: &mut [T], mu: usize) -> Result<bool, KError> {
        let _ = (input, output, mu);
        Ok(false)
    }
}

impl<T: Scalar, O: Operator<T> + ?Sized> Operator<T> for &O {
    fn dof(&self) -> usize {
        (**self).dof()
    }
    fn gmv(&self, input: &[T], output: &mut [T], mu: usize) {
        (**self).gmv(input, output, mu)
    }
    fn apply(&self, input: &[T], output: &mut [T], mu: usize, excluded: bool) -> Result<(), KError> {
        (**self).apply(input, output, mu, excluded)
    }
    fn start(&self, b: &[T], x: &mut [T], mu: usize, excluded: bool) -> bool {
        (**self).start(b, x, mu, excluded)
    }
    fn end(&self, token: bool) {
        (**self).end(token)
    }
    fn prefix(&self) -> &str {
        (**self).prefix()
    }
    fn scaling(&self) -> Option<&[T]> {
        (**self).scaling()
    }
    fn coarse_correction(&self, input: &[T], output: &mut [T], mu: usize) -> Result<bool, KError> {
        (**self).coarse_correction(input, output, mu)
    }
}
