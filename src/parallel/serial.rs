// Single-process communicator: every collective degenerates to a local copy.

use super::{Comm, CommData};
use num_traits::Zero;

#[derive(Debug, Default, Clone, Copy)]
pub struct SelfComm;

impl SelfComm {
    pub fn new() -> Self {
        SelfComm
    }
}

impl Comm for SelfComm {
    fn rank(&self) -> usize { 0 }
    fn size(&self) -> usize { 1 }
    fn barrier(&self) {}

    fn all_reduce_sum<T: CommData + Zero>(&self, _buf: &mut [T]) {}

    fn broadcast<T: CommData>(&self, _buf: &mut [T], _root: usize) {}

    fn gatherv<T: CommData>(&self, send: &[T], recv: &mut [T], counts: &[usize], displs: &[usize], _root: usize) {
        let (c, d) = (counts[0], displs[0]);
        recv[d..d + c].copy_from_slice(&send[..c]);
    }

    fn scatterv<T: CommData>(&self, send: &[T], counts: &[usize], displs: &[usize], recv: &mut [T], _root: usize) {
        let (c, d) = (counts[0], displs[0]);
        recv[..c].copy_from_slice(&send[d..d + c]);
    }

    fn all_gather<T: CommData>(&self, send: &[T], recv: &mut [T]) {
        recv[..send.len()].copy_from_slice(send);
    }

    fn create_subgroup(&self, members: &[usize]) -> Option<Self> {
        members.contains(&0).then_some(SelfComm)
    }

    fn duplicate(&self) -> Self {
        SelfComm
    }
}
