//! Distributed coarse space: communicators restricted to the contributing ranks, the
//! placement of the coarse unknowns, Galerkin assembly on the masters, and the transfer
//! of right-hand sides between the fine and the coarse distribution.

pub mod backend;
pub mod communicator;
pub mod distribution;
pub mod operator;
pub mod transfer;

pub use backend::{CoarseSolver, DenseLu};
pub use communicator::{restructure, restructure_into};
pub use distribution::{Distribution, DistributionMap, Layout, Topology};
pub use operator::{CoarseComms, CoarseOperator, GalerkinContribution, PendingAssembly, PendingCoarseSolve};
pub use transfer::{Direction, permute, transfer_to_coarse, transfer_to_fine};
