//! Utilities: convergence tracking and solve statistics.

pub mod convergence;
pub use convergence::{ConvergenceMarks, IterationRecord, Monitor, SolveStats};
