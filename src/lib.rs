//! ddkrylov: the convergence engine of a distributed domain-decomposition solver.
//!
//! The crate has two halves:
//! - [`coarse`]: restructured communicators, distribution of the coarse unknowns,
//!   Galerkin assembly `Z^T A Z` on master ranks and transfers of right-hand sides
//!   between the fine and the coarse distribution.
//! - [`solver`]: block-capable Krylov methods (CG, BCG, PCG, GMRES, BGMRES, GCRODR,
//!   BGCRODR) over several right-hand sides, built on shared orthogonalization, QR and
//!   Arnoldi kernels, with subspace recycling across solves.
//!
//! [`KspContext`] is the single entry point selecting a method from
//! [`KrylovOptions`]. Process groups are abstracted by [`parallel::Comm`]; besides the
//! MPI backend (feature `mpi`), [`parallel::ThreadComm`] runs a whole group inside one
//! process.

pub mod parallel;

pub mod coarse;
pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod matrix;
pub mod preconditioner;
pub mod solver;
pub mod utils;

pub use crate::config::*;
pub use crate::context::*;
pub use crate::core::*;
pub use crate::error::*;
pub use crate::matrix::*;
pub use crate::preconditioner::*;
pub use crate::solver::*;

pub use crate::coarse::{CoarseOperator, DenseLu, Topology};
pub use crate::utils::convergence::SolveStats;
