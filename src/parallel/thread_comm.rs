//! In-process multi-rank communicator.
//!
//! Each rank runs on its own thread (see [`ThreadComm::run`]). A collective is a
//! rendezvous: every rank publishes its contribution into its own slot, meets the
//! others at a barrier, reads what it needs, and meets them again before any slot can
//! be overwritten by the next collective. Reductions fold contributions in rank order,
//! so every rank sees bit-identical results, as it would with a deterministic MPI
//! reduction.

use super::{Comm, CommData};
use num_traits::Zero;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex, PoisonError};

type Payload = Arc<dyn Any + Send + Sync>;

struct Shared {
    size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Option<Payload>>>,
}

impl Shared {
    fn new(size: usize) -> Self {
        Self {
            size,
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![None; size]),
        }
    }
}

#[derive(Default)]
struct Universe {
    finalized: AtomicBool,
}

/// One rank's handle on a thread-backed process group.
///
/// Non-blocking collectives keep the trait's recorded form: a rendezvous needs every
/// rank at the barrier, so the operation runs inside [`Pending::wait`](super::Pending::wait)
/// and `is_complete` reports false until then.
pub struct ThreadComm {
    rank: usize,
    shared: Arc<Shared>,
    universe: Arc<Universe>,
}

impl ThreadComm {
    /// Runs `f` on `size` ranks, one scoped thread each, and returns the per-rank
    /// results in rank order. A panic on any rank is propagated.
    pub fn run<R, F>(size: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(ThreadComm) -> R + Sync,
    {
        assert!(size > 0, "a process group needs at least one rank");
        let universe = Arc::new(Universe::default());
        let shared = Arc::new(Shared::new(size));
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..size)
                .map(|rank| {
                    let comm = ThreadComm {
                        rank,
                        shared: Arc::clone(&shared),
                        universe: Arc::clone(&universe),
                    };
                    let f = &f;
                    scope.spawn(move || f(comm))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(r) => r,
                    Err(e) => std::panic::resume_unwind(e),
                })
                .collect()
        })
    }

    /// Marks the whole group as shut down; later teardown is only logged.
    pub fn finalize(&self) {
        self.universe.finalized.store(true, Ordering::SeqCst);
    }

    fn exchange(&self, payload: Payload) -> Vec<Payload> {
        {
            let mut slots = self.shared.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots[self.rank] = Some(payload);
        }
        self.shared.barrier.wait();
        let all = {
            let slots = self.shared.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots
                .iter()
                .map(|s| s.clone().expect("collective protocol violation: missing contribution"))
                .collect()
        };
        self.shared.barrier.wait();
        all
    }
}

fn view<X: 'static>(p: &Payload) -> &X {
    p.downcast_ref::<X>()
        .expect("collective protocol violation: ranks issued different collectives")
}

impl Comm for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn all_reduce_sum<T: CommData + Zero>(&self, buf: &mut [T]) {
        let all = self.exchange(Arc::new(buf.to_vec()));
        for b in buf.iter_mut() {
            *b = T::zero();
        }
        for p in &all {
            let contrib = view::<Vec<T>>(p);
            assert_eq!(contrib.len(), buf.len(), "all-reduce length mismatch");
            for (b, &c) in buf.iter_mut().zip(contrib) {
                *b = *b + c;
            }
        }
    }

    fn broadcast<T: CommData>(&self, buf: &mut [T], root: usize) {
        let payload: Vec<T> = if self.rank == root { buf.to_vec() } else { Vec::new() };
        let all = self.exchange(Arc::new(payload));
        if self.rank != root {
            let src = view::<Vec<T>>(&all[root]);
            buf.copy_from_slice(&src[..buf.len()]);
        }
    }

    fn gatherv<T: CommData>(&self, send: &[T], recv: &mut [T], counts: &[usize], displs: &[usize], root: usize) {
        let all = self.exchange(Arc::new(send.to_vec()));
        if self.rank == root {
            for (r, p) in all.iter().enumerate() {
                let src = view::<Vec<T>>(p);
                let (c, d) = (counts[r], displs[r]);
                assert!(src.len() >= c, "gather: rank {r} sent {} < {c} values", src.len());
                recv[d..d + c].copy_from_slice(&src[..c]);
            }
        }
    }

    fn scatterv<T: CommData>(&self, send: &[T], counts: &[usize], displs: &[usize], recv: &mut [T], root: usize) {
        let payload: (Vec<T>, Vec<usize>, Vec<usize>) = if self.rank == root {
            (send.to_vec(), counts.to_vec(), displs.to_vec())
        } else {
            (Vec::new(), Vec::new(), Vec::new())
        };
        let all = self.exchange(Arc::new(payload));
        let (src, c, d) = view::<(Vec<T>, Vec<usize>, Vec<usize>)>(&all[root]);
        let (c, d) = (c[self.rank], d[self.rank]);
        recv[..c].copy_from_slice(&src[d..d + c]);
    }

    fn all_gather<T: CommData>(&self, send: &[T], recv: &mut [T]) {
        let all = self.exchange(Arc::new(send.to_vec()));
        let len = send.len();
        for (r, p) in all.iter().enumerate() {
            recv[r * len..(r + 1) * len].copy_from_slice(&view::<Vec<T>>(p)[..len]);
        }
    }

    fn create_subgroup(&self, members: &[usize]) -> Option<Self> {
        let leader = members.first().copied();
        let payload: Payload = if leader == Some(self.rank) {
            Arc::new(Arc::new(Shared::new(members.len())))
        } else {
            Arc::new(())
        };
        let all = self.exchange(payload);
        let leader = leader?;
        let position = members.iter().position(|&m| m == self.rank)?;
        let shared = Arc::clone(view::<Arc<Shared>>(&all[leader]));
        Some(ThreadComm {
            rank: position,
            shared,
            universe: Arc::clone(&self.universe),
        })
    }

    fn duplicate(&self) -> Self {
        let everyone: Vec<usize> = (0..self.size()).collect();
        match self.create_subgroup(&everyone) {
            Some(comm) => comm,
            None => unreachable!("every rank is a member of its own duplicate"),
        }
    }

    fn is_finalized(&self) -> bool {
        self.universe.finalized.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_reduce_and_broadcast() {
        let out = ThreadComm::run(4, |comm| {
            let mut v = vec![comm.rank() as f64, 1.0];
            comm.all_reduce_sum(&mut v);
            let mut b = vec![0usize; 2];
            if comm.rank() == 2 {
                b = vec![7, 9];
            }
            comm.broadcast(&mut b, 2);
            (v, b)
        });
        for (v, b) in out {
            assert_eq!(v, vec![6.0, 4.0]);
            assert_eq!(b, vec![7, 9]);
        }
    }

    #[test]
    fn gatherv_scatterv_variable_counts() {
        let out = ThreadComm::run(3, |comm| {
            let r = comm.rank();
            let send: Vec<i64> = (0..=r as i64).map(|i| 10 * r as i64 + i).collect();
            let counts = vec![1, 2, 3];
            let displs = super::super::displacements(&counts);
            let mut recv = vec![0i64; if r == 0 { 6 } else { 0 }];
            comm.gatherv(&send, &mut recv, &counts, &displs, 0);
            let mut back = vec![0i64; r + 1];
            comm.scatterv(&recv, &counts, &displs, &mut back, 0);
            (recv, back, send)
        });
        assert_eq!(out[0].0, vec![0, 10, 11, 20, 21, 22]);
        for (_, back, send) in &out {
            assert_eq!(back, send);
        }
    }

    #[test]
    fn subgroup_membership() {
        let out = ThreadComm::run(5, |comm| {
            let sub = comm.create_subgroup(&[0, 2, 4]);
            sub.map(|s| {
                let mut x = vec![1u32];
                s.all_reduce_sum(&mut x);
                (s.rank(), s.size(), x[0])
            })
        });
        assert_eq!(out[0], Some((0, 3, 3)));
        assert_eq!(out[1], None);
        assert_eq!(out[2], Some((1, 3, 3)));
        assert_eq!(out[3], None);
        assert_eq!(out[4], Some((2, 3, 3)));
    }

    #[test]
    fn pending_gather_runs_at_wait() {
        let out = ThreadComm::run(3, |comm| {
            let r = comm.rank();
            let counts = vec![1, 1, 1];
            let displs = super::super::displacements(&counts);
            let recv = vec![0u32; if r == 1 { 3 } else { 0 }];
            let pending = comm.igatherv(&[r as u32 + 5], recv, counts, displs, 1);
            let before = pending.is_complete();
            (before, pending.wait(&comm))
        });
        for (before, _) in &out {
            assert!(!before);
        }
        assert_eq!(out[1].1, vec![5, 6, 7]);
    }
}
