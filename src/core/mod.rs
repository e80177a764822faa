//! Core traits and operator adaptors.

pub mod traits;
pub mod wrappers;

pub use traits::{Operator, Scalar, cast};
pub use wrappers::{BlockRowOperator, CsrOperator, DeflatedOperator, DenseOperator};
