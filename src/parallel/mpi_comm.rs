/// MPI-backed process group.
///
/// Wraps an rsmpi communicator and maps every [`Comm`](super::Comm) collective onto
/// the corresponding MPI call. Counts and displacements are converted to `i32` at the
/// boundary; a count MPI cannot address aborts the job, as any other broken collective
/// would. `igatherv`/`iscatterv` start `MPI_Igatherv`/`MPI_Iscatterv` at issue time and
/// the returned [`Pending`](super::Pending) polls the request with `MPI_Test`.
///
/// # Example
/// ```no_run
/// use ddkrylov::parallel::{Comm, MpiComm};
/// let universe = mpi::initialize().expect("MPI already initialized");
/// let comm = MpiComm::world(&universe);
/// println!("Rank: {} / {}", comm.rank(), comm.size());
/// comm.barrier();
/// ```
use super::{Comm, CommData, InFlight, Pending};
use crate::error::KError;
use mpi::collective::SystemOperation;
use mpi::datatype::{Partition, PartitionMut};
use mpi::environment::Universe;
use mpi::ffi;
use mpi::raw::AsRaw;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use num_traits::Zero;
use std::cell::Cell;
use std::mem::MaybeUninit;
use std::os::raw::c_void;

pub struct MpiComm {
    comm: SimpleCommunicator,
    rank: usize,
    size: usize,
}

impl MpiComm {
    /// The world communicator of an initialized MPI environment. The universe must
    /// outlive every communicator derived from it.
    pub fn world(universe: &Universe) -> Self {
        Self::from_raw(universe.world())
    }

    pub fn from_raw(comm: SimpleCommunicator) -> Self {
        let rank = comm.rank() as usize;
        let size = comm.size() as usize;
        MpiComm { comm, rank, size }
    }

    pub fn raw(&self) -> &SimpleCommunicator {
        &self.comm
    }
}

fn as_count(c: usize) -> Result<i32, KError> {
    i32::try_from(c).map_err(|_| KError::Communication(format!("count {c} exceeds the MPI count range")))
}

fn as_counts(v: &[usize]) -> Result<Vec<i32>, KError> {
    v.iter().map(|&c| as_count(c)).collect()
}

impl MpiComm {
    /// Collectives cannot report errors, so an unaddressable count ends the job.
    fn or_abort<X>(&self, converted: Result<X, KError>) -> X {
        match converted {
            Ok(x) => x,
            Err(e) => {
                log::error!("rank {}: {e}", self.rank);
                self.comm.abort(1)
            }
        }
    }

    fn partition(&self, counts: &[usize], displs: &[usize]) -> (Vec<i32>, Vec<i32>) {
        (self.or_abort(as_counts(counts)), self.or_abort(as_counts(displs)))
    }
}

/// A started `MPI_Igatherv`/`MPI_Iscatterv`. The buffers are heap storage owned here,
/// so their addresses stay put while MPI reads and writes them.
struct Immediate<T> {
    request: Cell<ffi::MPI_Request>,
    done: Cell<bool>,
    recv: Vec<T>,
    _send: Vec<T>,
    _counts: Vec<i32>,
    _displs: Vec<i32>,
}

impl<T> Immediate<T> {
    fn finish(&mut self) {
        if !self.done.get() {
            let mut status = MaybeUninit::<ffi::MPI_Status>::uninit();
            // SAFETY: the request was returned by a started collective and not yet completed.
            unsafe { ffi::MPI_Wait(self.request.as_ptr(), status.as_mut_ptr()) };
            self.done.set(true);
        }
    }
}

impl<T> InFlight<T> for Immediate<T> {
    fn test(&self) -> bool {
        if !self.done.get() {
            let mut flag = 0;
            let mut status = MaybeUninit::<ffi::MPI_Status>::uninit();
            // SAFETY: as in `finish`; MPI resets the handle once the operation completes.
            unsafe { ffi::MPI_Test(self.request.as_ptr(), &mut flag, status.as_mut_ptr()) };
            self.done.set(flag != 0);
        }
        self.done.get()
    }

    fn wait(mut self: Box<Self>) -> Vec<T> {
        self.finish();
        std::mem::take(&mut self.recv)
    }
}

impl<T> Drop for Immediate<T> {
    fn drop(&mut self) {
        // the buffers must outlive the operation
        if !mpi::environment::is_finalized() {
            self.finish();
        }
    }
}

impl Comm for MpiComm {
    fn rank(&self) -> usize { self.rank }
    fn size(&self) -> usize { self.size }
    fn barrier(&self) { self.comm.barrier(); }

    fn all_reduce_sum<T: CommData + Zero>(&self, buf: &mut [T]) {
        let send = buf.to_vec();
        self.comm.all_reduce_into(&send[..], buf, &SystemOperation::sum());
    }

    fn broadcast<T: CommData>(&self, buf: &mut [T], root: usize) {
        self.comm.process_at_rank(root as i32).broadcast_into(buf);
    }

    fn gatherv<T: CommData>(&self, send: &[T], recv: &mut [T], counts: &[usize], displs: &[usize], root: usize) {
        let root_process = self.comm.process_at_rank(root as i32);
        if self.rank == root {
            let (c, d) = self.partition(counts, displs);
            let mut partition = PartitionMut::new(recv, &c[..], &d[..]);
            root_process.gather_varcount_into_root(send, &mut partition);
        } else {
            root_process.gather_varcount_into(send);
        }
    }

    fn scatterv<T: CommData>(&self, send: &[T], counts: &[usize], displs: &[usize], recv: &mut [T], root: usize) {
        let root_process = self.comm.process_at_rank(root as i32);
        let local = if self.rank == root { counts[self.rank] } else { recv.len() };
        if self.rank == root {
            let (c, d) = self.partition(counts, displs);
            let partition = Partition::new(send, &c[..], &d[..]);
            root_process.scatter_varcount_into_root(&partition, &mut recv[..local]);
        } else {
            root_process.scatter_varcount_into(&mut recv[..local]);
        }
    }

    fn all_gather<T: CommData>(&self, send: &[T], recv: &mut [T]) {
        self.comm.all_gather_into(send, recv);
    }

    fn create_subgroup(&self, members: &[usize]) -> Option<Self> {
        let ranks: Vec<i32> = members.iter().map(|&m| m as i32).collect();
        let group = self.comm.group().include(&ranks);
        self.comm
            .split_by_subgroup_collective(&group)
            .map(MpiComm::from_raw)
    }

    fn duplicate(&self) -> Self {
        MpiComm::from_raw(self.comm.duplicate())
    }

    fn is_finalized(&self) -> bool {
        mpi::environment::is_finalized()
    }

    fn max_count(&self) -> usize {
        i32::MAX as usize
    }

    fn igatherv<T: CommData>(
        &self,
        send: &[T],
        mut recv: Vec<T>,
        counts: Vec<usize>,
        displs: Vec<usize>,
        root: usize,
    ) -> Pending<T> {
        let (c, d) = if self.rank == root { self.partition(&counts, &displs) } else { (Vec::new(), Vec::new()) };
        let send = send.to_vec();
        let sendcount = self.or_abort(as_count(send.len()));
        let datatype = T::equivalent_datatype();
        let mut request = MaybeUninit::<ffi::MPI_Request>::uninit();
        // SAFETY: every buffer is moved into the returned handle, which waits on the
        // request before releasing them.
        unsafe {
            ffi::MPI_Igatherv(
                send.as_ptr() as *const c_void,
                sendcount,
                datatype.as_raw(),
                recv.as_mut_ptr() as *mut c_void,
                c.as_ptr(),
                d.as_ptr(),
                datatype.as_raw(),
                root as i32,
                self.comm.as_raw(),
                request.as_mut_ptr(),
            );
        }
        Pending::started(Box::new(Immediate {
            // SAFETY: initialized by the call above
            request: Cell::new(unsafe { request.assume_init() }),
            done: Cell::new(false),
            recv,
            _send: send,
            _counts: c,
            _displs: d,
        }))
    }

    fn iscatterv<T: CommData>(
        &self,
        send: Vec<T>,
        counts: Vec<usize>,
        displs: Vec<usize>,
        mut recv: Vec<T>,
        root: usize,
    ) -> Pending<T> {
        let (c, d) = if self.rank == root { self.partition(&counts, &displs) } else { (Vec::new(), Vec::new()) };
        let local = if self.rank == root { counts[self.rank] } else { recv.len() };
        let recvcount = self.or_abort(as_count(local));
        let datatype = T::equivalent_datatype();
        let mut request = MaybeUninit::<ffi::MPI_Request>::uninit();
        // SAFETY: as in `igatherv`.
        unsafe {
            ffi::MPI_Iscatterv(
                send.as_ptr() as *const c_void,
                c.as_ptr(),
                d.as_ptr(),
                datatype.as_raw(),
                recv.as_mut_ptr() as *mut c_void,
                recvcount,
                datatype.as_raw(),
                root as i32,
                self.comm.as_raw(),
                request.as_mut_ptr(),
            );
        }
        Pending::started(Box::new(Immediate {
            // SAFETY: initialized by the call above
            request: Cell::new(unsafe { request.assume_init() }),
            done: Cell::new(false),
            recv,
            _send: send,
            _counts: c,
            _displs: d,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_beyond_i32_are_rejected() {
        assert_eq!(as_counts(&[0, 7, i32::MAX as usize]).unwrap(), vec![0, 7, i32::MAX]);
        let too_large = i32::MAX as usize + 1;
        assert!(matches!(as_counts(&[1, too_large]), Err(KError::Communication(_))));
    }

    #[test]
    fn started_gather_is_polled_before_wait() {
        // the only test in this binary that initializes MPI
        let Some(universe) = mpi::initialize() else { return };
        let comm = MpiComm::world(&universe);
        assert_eq!(comm.max_count(), i32::MAX as usize);
        let (size, rank) = (comm.size(), comm.rank());
        let counts = vec![2; size];
        let displs = super::super::displacements(&counts);
        let recv = vec![0.0f64; if rank == 0 { 2 * size } else { 0 }];
        let pending = comm.igatherv(&[rank as f64, -(rank as f64)], recv, counts, displs, 0);
        let mut polls = 0usize;
        while !pending.is_complete() {
            polls += 1;
        }
        assert!(pending.is_complete(), "still in flight after {polls} polls");
        let gathered = pending.wait(&comm);
        if rank == 0 {
            for r in 0..size {
                assert_eq!(&gathered[2 * r..2 * r + 2], &[r as f64, -(r as f64)]);
            }
        }
    }
}
