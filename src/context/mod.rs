//! Solver contexts.
//!
//! - [`ksp_context`]: the [`KspContext`] dispatching a solve to one of the Krylov
//!   methods and keeping their recycled subspaces between solves.

pub mod ksp_context;
pub use ksp_context::KspContext;
