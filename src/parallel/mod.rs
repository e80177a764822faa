//! Distributed process groups.
//!
//! The [`Comm`] trait is the only view the coarse-operator and Krylov code has of the
//! process group: rank/size queries, blocking collectives with per-rank counts and
//! displacements, subgroup creation, and non-blocking variants returning a [`Pending`]
//! handle.
//!
//! Every process of a communicator must issue the same sequence of collective calls.
//! A divergence is a protocol violation: backends either deadlock or abort, they never
//! report it as an error.
//!
//! Backends:
//! - [`SelfComm`]: a single process, every collective is a local copy.
//! - [`ThreadComm`]: an in-process group, one thread per rank, rendezvous on a barrier.
//! - `MpiComm`: rsmpi communicators (feature `mpi`).

use num_traits::Zero;

#[cfg(feature = "mpi")]
pub trait CommData: Copy + Send + Sync + 'static + mpi::datatype::Equivalence {}
#[cfg(feature = "mpi")]
impl<T: Copy + Send + Sync + 'static + mpi::datatype::Equivalence> CommData for T {}

#[cfg(not(feature = "mpi"))]
pub trait CommData: Copy + Send + Sync + 'static {}
#[cfg(not(feature = "mpi"))]
impl<T: Copy + Send + Sync + 'static> CommData for T {}

pub trait Comm: Sized {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn barrier(&self);

    /// In-place element-wise sum over all ranks.
    fn all_reduce_sum<T: CommData + Zero>(&self, buf: &mut [T]);

    fn broadcast<T: CommData>(&self, buf: &mut [T], root: usize);

    /// Gathers `send` from every rank into `recv` on `root`. `counts`/`displs` are
    /// only read on `root`; `recv` may be empty elsewhere.
    fn gatherv<T: CommData>(
        &self,
        send: &[T],
        recv: &mut [T],
        counts: &[usize],
        displs: &[usize],
        root: usize,
    );

    /// Scatters segments of `send` (read on `root` only) into `recv[..counts[rank]]`.
    fn scatterv<T: CommData>(
        &self,
        send: &[T],
        counts: &[usize],
        displs: &[usize],
        recv: &mut [T],
        root: usize,
    );

    /// Fixed-size all-gather: `recv.len() == size * send.len()`.
    fn all_gather<T: CommData>(&self, send: &[T], recv: &mut [T]);

    /// Collective over `self`: builds a communicator whose rank `i` is `members[i]`.
    /// Returns `None` on processes outside `members`.
    fn create_subgroup(&self, members: &[usize]) -> Option<Self>;

    /// Collective: same membership, fresh communication context.
    fn duplicate(&self) -> Self;

    /// True once the distributed runtime has shut down.
    fn is_finalized(&self) -> bool {
        false
    }

    /// Largest element count or displacement a single collective can address.
    fn max_count(&self) -> usize {
        usize::MAX
    }

    /// Variable-count all-gather, built from a gather to rank 0 and a broadcast.
    fn all_gatherv<T: CommData>(&self, send: &[T], recv: &mut [T], counts: &[usize], displs: &[usize]) {
        self.gatherv(send, recv, counts, displs, 0);
        self.broadcast(recv, 0);
    }

    /// Non-blocking gather. The receive buffer is moved into the handle and is only
    /// handed back by [`Pending::wait`].
    ///
    /// The default records the operation and runs the blocking [`Comm::gatherv`] inside
    /// `wait`, so [`Pending::is_complete`] stays false until then. Backends with real
    /// non-blocking collectives override this and hand back [`Pending::started`].
    fn igatherv<T: CommData>(
        &self,
        send: &[T],
        recv: Vec<T>,
        counts: Vec<usize>,
        displs: Vec<usize>,
        root: usize,
    ) -> Pending<T> {
        Pending {
            buffer: recv,
            op: Deferred::Gatherv { send: send.to_vec(), counts, displs, root },
        }
    }

    /// Non-blocking scatter, see [`Comm::igatherv`].
    fn iscatterv<T: CommData>(
        &self,
        send: Vec<T>,
        counts: Vec<usize>,
        displs: Vec<usize>,
        recv: Vec<T>,
        root: usize,
    ) -> Pending<T> {
        Pending {
            buffer: recv,
            op: Deferred::Scatterv { send, counts, displs, root },
        }
    }
}

/// A collective a backend has already started. It owns every buffer the operation
/// reads or writes until it completes.
pub trait InFlight<T> {
    /// Tests for completion without blocking.
    fn test(&self) -> bool;

    /// Blocks until completion and returns the receive buffer.
    fn wait(self: Box<Self>) -> Vec<T>;
}

enum Deferred<T> {
    Complete,
    Gatherv { send: Vec<T>, counts: Vec<usize>, displs: Vec<usize>, root: usize },
    Scatterv { send: Vec<T>, counts: Vec<usize>, displs: Vec<usize>, root: usize },
    Started(Box<dyn InFlight<T>>),
}

/// Handle on an in-flight collective.
///
/// The buffer it owns is unreachable until [`Pending::wait`] has completed the
/// operation, so "overlap, then synchronize before reading" is enforced by the types.
/// Backends either start the operation at issue time ([`Pending::started`]) or record
/// it and run it inside `wait`; every rank of the communicator must call `wait` in the
/// same order relative to its other collectives.
#[must_use = "a pending collective must be waited on by every rank"]
pub struct Pending<T> {
    buffer: Vec<T>,
    op: Deferred<T>,
}

impl<T: CommData> Pending<T> {
    /// A handle whose operation has already completed.
    pub fn complete(buffer: Vec<T>) -> Self {
        Self { buffer, op: Deferred::Complete }
    }

    /// A handle on an operation the backend has started; it owns the receive buffer.
    pub fn started(op: Box<dyn InFlight<T>>) -> Self {
        Self { buffer: Vec::new(), op: Deferred::Started(op) }
    }

    /// Polls the handle without blocking. A recorded operation only runs inside
    /// [`Pending::wait`] and reports false until then.
    pub fn is_complete(&self) -> bool {
        match &self.op {
            Deferred::Complete => true,
            Deferred::Started(op) => op.test(),
            Deferred::Gatherv { .. } | Deferred::Scatterv { .. } => false,
        }
    }

    /// Completes the operation on `comm` and returns the receive buffer.
    pub fn wait<C: Comm>(mut self, comm: &C) -> Vec<T> {
        match std::mem::replace(&mut self.op, Deferred::Complete) {
            Deferred::Complete => {}
            Deferred::Started(op) => return op.wait(),
            Deferred::Gatherv { send, counts, displs, root } => {
                comm.gatherv(&send, &mut self.buffer, &counts, &displs, root);
            }
            Deferred::Scatterv { send, counts, displs, root } => {
                comm.scatterv(&send, &counts, &displs, &mut self.buffer, root);
            }
        }
        self.buffer
    }
}

/// Exclusive prefix sum of `counts`.
pub fn displacements(counts: &[usize]) -> Vec<usize> {
    let mut displs = Vec::with_capacity(counts.len());
    let mut acc = 0;
    for &c in counts {
        displs.push(acc);
        acc += c;
    }
    displs
}

pub mod serial;
pub use serial::SelfComm;

pub mod thread_comm;
pub use thread_comm::ThreadComm;

#[cfg(feature = "mpi")]
pub mod mpi_comm;
#[cfg(feature = "mpi")]
pub use mpi_comm::MpiComm;
