//! Block GCRODR: block GMRES augmented by one recycled space shared by all
//! right-hand sides.
//!
//! The space is created after the first cycle with `recycle * d` directions, `d`
//! being the block width of that cycle, and keeps that dimension afterwards.

use crate::config::{KrylovOptions, Variant};
use crate::core::traits::{Operator, Scalar};
use crate::error::KError;
use crate::parallel::Comm;
use crate::solver::bgmres::block_cycles;
use crate::solver::recycling::RecycledSpace;
use crate::solver::{KrylovSolver, Problem};
use crate::utils::convergence::SolveStats;

#[derive(Clone, Debug)]
pub struct BgcrodrSolver<T> {
    pub opts: KrylovOptions,
    pub excluded: bool,
    space: Option<RecycledSpace<T>>,
}

impl<T: Scalar> BgcrodrSolver<T> {
    pub fn new(opts: KrylovOptions) -> Self {
        Self { opts: opts.validated(), excluded: false, space: None }
    }

    pub fn with_excluded(mut self, excluded: bool) -> Self {
        self.excluded = excluded;
        self
    }

    pub fn set_options(&mut self, opts: KrylovOptions) {
        self.opts = opts.validated();
    }

    pub fn recycled(&self) -> Option<&RecycledSpace<T>> {
        self.space.as_ref()
    }

    pub fn clear(&mut self) {
        self.space = None;
    }
}

impl<T: Scalar> KrylovSolver<T> for BgcrodrSolver<T> {
    fn solve<O: Operator<T>, C: Comm>(
        &mut self,
        op: &O,
        b: &[T],
        x: &mut [T],
        mu: usize,
        comm: &C,
    ) -> Result<SolveStats<T>, KError> {
        let mut variant = self.opts.variant;
        if variant == Variant::Flexible {
            log::warn!("BGCRODR: flexible variant not available, using right preconditioning");
            variant = Variant::Right;
        }
        let pb = Problem::new(op, comm, self.excluded, variant);
        let token = op.start(b, x, mu, self.excluded);
        let stats = if self.opts.recycle == 0 {
            block_cycles(&pb, &self.opts, b, x, mu, None, "BGCRODR")
        } else {
            block_cycles(&pb, &self.opts, b, x, mu, Some(&mut self.space), "BGCRODR")
        };
        op.end(token);
        stats
    }
}
