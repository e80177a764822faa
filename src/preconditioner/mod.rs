//! Local preconditioners.
//!
//! A [`Preconditioner`] acts on one local vector; operator adaptors apply it column by
//! column to implement [`crate::core::traits::Operator::apply`].

use crate::error::KError;

/// A preconditioner M ≈ A⁻¹.
pub trait Preconditioner<T> {
    /// Apply M⁻¹ to r, writing z = M⁻¹ r
    fn apply(&self, r: &[T], z: &mut [T]) -> Result<(), KError>;
}

pub mod jacobi;
pub use jacobi::Jacobi;
