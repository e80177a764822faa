use thiserror::Error;

// Unified error type for ddkrylov

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KError {
    #[error("factorization error: {0}")]
    FactorError(String),
    #[error("solve error: {0}")]
    SolveError(String),
    /// Cholesky/QR hit a non-positive or vanishing pivot, or CG met a direction with
    /// `p^T A p <= 0`; the payload is the 1-based position of the offending column.
    #[error("numerical breakdown at column {0}")]
    Breakdown(usize),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("communication error: {0}")]
    Communication(String),
}

impl KError {
    /// Positive LAPACK-style info code, when the error carries one.
    pub fn info(&self) -> Option<usize> {
        match self {
            KError::Breakdown(i) => Some(*i),
            _ => None,
        }
    }
}
