//! Matrix module: small dense kernels and a CSR container.

pub mod dense;
pub use dense::ColMat;
pub mod sparse;
pub use sparse::{CsrMatrix, SparseMatrix};
